use std::io::Write;
use std::path::PathBuf;
use std::process::Command;

fn cli_exe() -> PathBuf {
    // Avoid relying on `CARGO_BIN_EXE_*` (Cargo does not guarantee it is set
    // for all test invocation modes). Use the workspace `target/` dir path
    // instead.
    let repo_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..");
    let target_dir = std::env::var_os("CARGO_TARGET_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| repo_root.join("target"));
    let exe_name = format!("dyno-machine{}", std::env::consts::EXE_SUFFIX);
    let debug_exe = target_dir.join("debug").join(&exe_name);
    let release_exe = target_dir.join("release").join(&exe_name);
    if debug_exe.exists() {
        debug_exe
    } else if release_exe.exists() {
        release_exe
    } else {
        panic!(
            "expected dyno-machine binary at {} or {}",
            debug_exe.display(),
            release_exe.display()
        );
    }
}

/// A main-only firmware image with an RCHW at the first candidate offset.
fn write_fixture_firmware(path: &std::path::Path) {
    let mut fw = vec![0u8; 0x0040_0000];
    fw[0..4].copy_from_slice(&[0x00, 0x5A, 0x00, 0x00]);
    fw[4..8].copy_from_slice(&[0x00, 0x00, 0x20, 0x00]);
    std::fs::File::create(path).unwrap().write_all(&fw).unwrap();
}

#[test]
fn boots_a_staged_firmware_image_and_reports_the_entry() {
    let dir = tempfile::TempDir::new().unwrap();
    let fw = dir.path().join("fw.bin");
    write_fixture_firmware(&fw);

    let config_dir = dir.path().join("project");
    let output = Command::new(cli_exe())
        .args([
            "--config-dir",
            config_dir.to_str().unwrap(),
            "--init-flash",
            fw.to_str().unwrap(),
        ])
        .output()
        .expect("failed to run dyno-machine CLI");

    assert!(
        output.status.success(),
        "dyno-machine exited with {}\nstderr:\n{}",
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("PC=0x00002000"),
        "unexpected boot report:\n{stdout}"
    );

    // The image was staged into the project directory along with the
    // persisted configuration and a hash-keyed backup.
    assert!(config_dir.join("fw.bin").exists());
    assert!(config_dir.join("config.json").exists());
    let backups: Vec<_> = std::fs::read_dir(&config_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("backup.flash."))
        .collect();
    assert_eq!(backups.len(), 1);
}

#[test]
fn no_backup_runs_leave_no_files_behind() {
    let dir = tempfile::TempDir::new().unwrap();
    let fw = dir.path().join("fw.bin");
    write_fixture_firmware(&fw);

    let config_dir = dir.path().join("project");
    let output = Command::new(cli_exe())
        .args([
            "--config-dir",
            config_dir.to_str().unwrap(),
            "--no-backup",
            fw.to_str().unwrap(),
        ])
        .output()
        .expect("failed to run dyno-machine CLI");
    assert!(output.status.success());

    let backups = std::fs::read_dir(&config_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("backup.flash"))
        .count();
    assert_eq!(backups, 0);
}

#[test]
fn entry_override_wins_over_the_rchw() {
    let dir = tempfile::TempDir::new().unwrap();
    let fw = dir.path().join("fw.bin");
    write_fixture_firmware(&fw);

    let config_dir = dir.path().join("project");
    let output = Command::new(cli_exe())
        .args([
            "--config-dir",
            config_dir.to_str().unwrap(),
            "--no-backup",
            fw.to_str().unwrap(),
            "-E",
            "0x40001000",
        ])
        .output()
        .expect("failed to run dyno-machine CLI");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("PC=0x40001000"),
        "unexpected boot report:\n{stdout}"
    );
}

#[test]
fn invalid_firmware_sizes_are_rejected_for_init_flash() {
    let dir = tempfile::TempDir::new().unwrap();
    let fw = dir.path().join("short.bin");
    std::fs::write(&fw, vec![0u8; 1024]).unwrap();

    let config_dir = dir.path().join("project");
    let output = Command::new(cli_exe())
        .args([
            "--config-dir",
            config_dir.to_str().unwrap(),
            "--init-flash",
            fw.to_str().unwrap(),
        ])
        .output()
        .expect("failed to run dyno-machine CLI");

    assert!(!output.status.success());
}
