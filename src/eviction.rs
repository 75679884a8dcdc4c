use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::fs;

use crate::index::{unix_now, IndexError, MetaIndex};
use crate::storage::{Storage, StorageError};

/// Addresses fetched from the index per eviction round.
const VICTIM_BATCH: i64 = 20;

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Quota-driven garbage collector over the blob store.
///
/// `sweep` measures disk usage under the storage root and, while over the
/// configured limit, deletes the least-downloaded blobs named by the index.
/// A compare-and-swap on `sweeping` keeps concurrent ticks from overlapping
/// without holding any lock across I/O.
pub struct EvictionController {
    storage: Arc<Storage>,
    index: Arc<dyn MetaIndex>,
    limit: u64,
    sweeping: AtomicBool,
}

impl EvictionController {
    pub fn new(storage: Arc<Storage>, index: Arc<dyn MetaIndex>, limit: u64) -> Self {
        EvictionController {
            storage,
            index,
            limit,
            sweeping: AtomicBool::new(false),
        }
    }

    /// Runs one eviction pass. A no-op when eviction is disabled or another
    /// sweep is still in flight. The in-flight flag is cleared on every exit
    /// path, error or not.
    pub async fn sweep(&self) -> Result<(), SweepError> {
        if self.limit == 0 {
            return Ok(());
        }

        if self
            .sweeping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let result = self.run().await;
        self.sweeping.store(false, Ordering::SeqCst);
        result
    }

    async fn run(&self) -> Result<(), SweepError> {
        fs::metadata(self.storage.root()).await?;

        let mut total = self.disk_usage().await?;
        if total <= self.limit {
            return Ok(());
        }

        'sweep: loop {
            let victims = self.index.unused(VICTIM_BATCH).await?;
            if victims.is_empty() {
                break;
            }

            for address in victims {
                let file_size = self.storage.size(&address).await?;
                let removed = self.storage.remove(&address).await?;

                self.index.mark_deleted(&address, unix_now()).await?;

                if removed {
                    total = total.saturating_sub(file_size);
                }

                if total <= self.limit {
                    break 'sweep;
                }
            }
        }

        Ok(())
    }

    /// Sums regular-file sizes one level below each fanout directory. The
    /// layout guarantees no deeper nesting.
    async fn disk_usage(&self) -> Result<u64, SweepError> {
        let mut total = 0;

        let mut entries = fs::read_dir(self.storage.root()).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                total += dir_size(&entry.path()).await?;
            }
        }

        Ok(total)
    }
}

async fn dir_size(path: &Path) -> Result<u64, io::Error> {
    let mut size = 0;

    let mut entries = fs::read_dir(path).await?;
    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if meta.is_file() {
            size += meta.len();
        }
    }

    Ok(size)
}
