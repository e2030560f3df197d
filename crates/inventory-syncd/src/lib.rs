//! inventory-syncd library: Exposes the daemon's backends for testing.
//!
//! This is a thin layer that wires `inventory-sync` to a file-backed local
//! store, a file-backed blob store and a shared-directory remote.

pub mod dir_remote;
pub mod file_store;
pub mod native_blob;

use anyhow::Result;
use inventory_sync::{SyncConfig, SyncEngine};
use std::path::Path;
use std::sync::Arc;

pub use dir_remote::DirectoryRemote;
pub use file_store::FileStore;
pub use native_blob::NativeBlobStore;

/// Engine type the daemon runs.
pub type DaemonEngine = SyncEngine<FileStore, DirectoryRemote>;

/// Directory under the data dir holding engine bookkeeping blobs.
pub const STATE_DIR: &str = "state";

/// Open an engine over `data_dir` (local store and bookkeeping) syncing
/// through `remote_dir`.
pub async fn open_engine(
    data_dir: &Path,
    remote_dir: &Path,
    config: SyncConfig,
) -> Result<DaemonEngine> {
    let store = FileStore::open(data_dir)?;
    let remote = Arc::new(DirectoryRemote::new(remote_dir.to_path_buf()));
    let blobs = Arc::new(NativeBlobStore::new(data_dir.join(STATE_DIR)));
    let engine = SyncEngine::open(store, remote, blobs, config).await?;
    Ok(engine)
}
