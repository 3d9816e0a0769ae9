//! Command-line front end: resolves the project directory, stages firmware,
//! builds the machine, and reports the boot state. The interactive run loop
//! and debugger protocol live in their own tools; `--gdb-port` only blocks
//! until a client connects.

use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};

use dyno_flash::{classify_firmware, FlashController};
use dyno_machine::{Machine, MachineConfig};

const DEFAULT_GDB_PORT: u16 = 47001;
const CONFIG_FILE: &str = "config.json";
const BACKUP_FILE: &str = "backup.flash";

#[derive(Parser, Debug)]
#[command(name = "dyno-machine", about = "MPC5674F-class system emulator")]
struct Args {
    /// Project directory holding the firmware image, configuration, and
    /// flash backup (created on first use).
    #[arg(long, value_name = "PATH")]
    config_dir: Option<PathBuf>,

    /// Copy FILE into the project directory as the firmware image and
    /// persist it in the configuration.
    #[arg(long, short = 'I', value_name = "FILE", conflicts_with_all = ["no_backup", "reset_backup"])]
    init_flash: Option<PathBuf>,

    /// Run once against FILE without creating or updating a flash backup.
    #[arg(long, short = 'N', value_name = "FILE", conflicts_with = "reset_backup")]
    no_backup: Option<PathBuf>,

    /// Delete any flash backup in the project directory before starting,
    /// undoing cached flash changes.
    #[arg(long, short = 'R')]
    reset_backup: bool,

    /// Wait for a debugger to attach on this port before running.
    #[arg(long, short = 'g', value_name = "PORT", num_args = 0..=1, default_missing_value = "47001")]
    gdb_port: Option<u16>,

    /// Override the initial program counter (hex).
    #[arg(short = 'E', value_name = "ADDR", value_parser = parse_hex)]
    entry: Option<u32>,
}

fn parse_hex(s: &str) -> Result<u32, String> {
    let trimmed = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(trimmed, 16).map_err(|e| e.to_string())
}

fn default_project_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".dyno")
}

fn load_or_default_config(dir: &Path) -> MachineConfig {
    let path = dir.join(CONFIG_FILE);
    match MachineConfig::load(&path) {
        Ok(cfg) => cfg,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => MachineConfig::default(),
        Err(err) => {
            warn!(%err, path = %path.display(), "unreadable project config, using defaults");
            MachineConfig::default()
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let project_dir = args.config_dir.clone().unwrap_or_else(default_project_dir);
    if !project_dir.is_dir() {
        info!(dir = %project_dir.display(), "creating project directory");
        fs::create_dir_all(&project_dir)
            .with_context(|| format!("creating {}", project_dir.display()))?;
    }

    let mut cfg = load_or_default_config(&project_dir);
    cfg.backup = Some(PathBuf::from(BACKUP_FILE));
    cfg.entry_override = args.entry.or(cfg.entry_override);

    if let Some(image) = &args.init_flash {
        // The image must have a recognized layout before it is adopted.
        classify_firmware(image)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .context("--init-flash requires a valid firmware image")?;
        let file_name = image
            .file_name()
            .context("--init-flash path has no file name")?;
        let dest = project_dir.join(file_name);
        if image != &dest {
            info!(from = %image.display(), to = %dest.display(), "staging firmware image");
            fs::copy(image, &dest)?;
        }
        cfg.firmware = Some(dest);
        cfg.save(&project_dir.join(CONFIG_FILE))
            .context("saving project configuration")?;
    } else if let Some(image) = &args.no_backup {
        // Temporary run: use the image in place and keep flash volatile.
        cfg.firmware = Some(image.clone());
        cfg.backup = None;
    }

    if args.reset_backup {
        FlashController::delete_backup(&project_dir.join(BACKUP_FILE))
            .context("deleting flash backup")?;
    }

    if cfg.firmware.is_none() {
        warn!("no flash image configured; the machine boots from erased flash");
    }

    let machine = Machine::with_backup_dir(cfg, Some(&project_dir))
        .context("constructing machine")?;

    if let Some(port) = args.gdb_port {
        let port = if port == 0 { DEFAULT_GDB_PORT } else { port };
        let listener = TcpListener::bind(("127.0.0.1", port))
            .with_context(|| format!("binding gdb port {port}"))?;
        println!("Waiting for GDB client to connect on port {port}");
        let (_stream, peer) = listener.accept().context("accepting debugger")?;
        info!(%peer, "debugger attached");
    }

    if machine.external_boot() {
        bail!("no valid RCHW found in flash: the part would enter external boot");
    }

    println!(
        "booted: PC={:#010x} SP={:#010x} flash={}",
        machine.core.pc,
        machine.core.r1,
        machine.flash.borrow().content_hash()
    );
    Ok(())
}
