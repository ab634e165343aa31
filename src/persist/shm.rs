//! Shared-memory mirror of the latest combined bar.
//!
//! A single named 4096-byte region backed by a file under `/dev/shm`
//! (override the directory with `STOCKFLOW_SHM_DIR`). Readers take the
//! first NUL-terminated span; there is no framing or header. The region is
//! removed on start (stale copies) and on stop.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use memmap2::MmapMut;
use tracing::info;

/// Region name expected by downstream readers.
pub const REGION_NAME: &str = "RealTimeData";
/// Fixed region size in bytes.
pub const REGION_SIZE: usize = 4096;

fn default_region_dir() -> PathBuf {
    std::env::var("STOCKFLOW_SHM_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/dev/shm"))
}

/// Path of a named region in the default directory.
pub fn region_path(name: &str) -> PathBuf {
    default_region_dir().join(name)
}

/// Remove a named region if present.
pub fn remove_region(name: &str) {
    let _ = std::fs::remove_file(region_path(name));
}

pub struct SharedMemory {
    map: MmapMut,
    path: PathBuf,
}

impl SharedMemory {
    /// Create (replacing any stale copy) and map the named region in the
    /// default directory.
    pub fn create(name: &str) -> Result<Self> {
        Self::create_in(&default_region_dir(), name)
    }

    /// Create the region in an explicit directory.
    pub fn create_in(dir: &Path, name: &str) -> Result<Self> {
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("failed to create shared memory region {}", path.display()))?;
        file.set_len(REGION_SIZE as u64)
            .context("failed to size shared memory region")?;
        let map = unsafe { MmapMut::map_mut(&file) }
            .context("failed to map shared memory region")?;

        info!(region = %path.display(), size = REGION_SIZE, "shared memory region created");
        Ok(Self { map, path })
    }

    /// Zero-fill the region, then copy the payload. Payloads beyond the
    /// region size are truncated to leave the terminating NUL intact.
    pub fn write_payload(&mut self, payload: &[u8]) {
        self.map.fill(0);
        let len = payload.len().min(REGION_SIZE - 1);
        self.map[..len].copy_from_slice(&payload[..len]);
        let _ = self.map.flush();
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Read the first NUL-terminated span of a region, the way downstream
/// readers do.
pub fn read_payload(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read shared memory region {}", path.display()))?;
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
}
