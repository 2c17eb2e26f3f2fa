use crate::data_context::SnapshotCandleStore;
use anyhow::{anyhow, Result};
use std::path::Path;
use tokio::fs;

/// Opens the snapshot behind `--data`, failing early with a readable message when it is missing.
pub async fn open_snapshot_store(path: &Path) -> Result<SnapshotCandleStore> {
    if fs::metadata(path).await.is_err() {
        return Err(anyhow!(
            "Market data snapshot not found at {}. Expected a .bin (bincode) or .json snapshot file.",
            path.display()
        ));
    }
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || SnapshotCandleStore::open(&owned)).await?
}
