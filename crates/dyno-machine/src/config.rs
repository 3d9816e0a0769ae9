use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// SRAM geometry. `standby_size` is the span preserved across warm resets
/// (battery-backed on the real part).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SramConfig {
    pub addr: u32,
    pub size: u32,
    pub standby_size: u32,
}

impl Default for SramConfig {
    fn default() -> SramConfig {
        SramConfig {
            addr: 0x4000_0000,
            size: 0x0004_0000,
            standby_size: 0x8000,
        }
    }
}

/// Project configuration threaded through the machine by the top-level
/// binary. Persisted as JSON in the project directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Firmware image to load into main flash (and shadows, if the file
    /// carries them).
    pub firmware: Option<PathBuf>,
    /// Backup file name prefix inside the project directory; `None` runs
    /// without persistence.
    pub backup: Option<PathBuf>,
    #[serde(default)]
    pub sram: SramConfig,
    /// Replaces the RCHW-derived entry point when exactly one entry point
    /// is known to the loader.
    pub entry_override: Option<u32>,
}

impl MachineConfig {
    pub fn load(path: &Path) -> io::Result<MachineConfig> {
        let data = fs::read(path)?;
        serde_json::from_slice(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let data = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;
        fs::write(path, data)
    }
}
