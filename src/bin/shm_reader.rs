//! Print the latest combined bar from the shared-memory region.
//!
//! Companion utility for downstream readers: takes an optional region
//! name (default `RealTimeData`) and dumps the current JSON payload.

use anyhow::{Context, Result};

use stockflow_backend::persist::shm;

fn main() -> Result<()> {
    let name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| shm::REGION_NAME.to_string());
    let path = shm::region_path(&name);
    let payload = shm::read_payload(&path)
        .with_context(|| format!("no shared memory region at {}", path.display()))?;
    if payload.is_empty() {
        println!("(region {} is empty)", path.display());
    } else {
        println!("{payload}");
    }
    Ok(())
}
