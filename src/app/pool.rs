use std::future::Future;
use std::sync::Arc;

use anyhow::Context as _;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;

/// Concurrency bounds of one run: source workers, and outbound requests across all of them.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    sources: Arc<Semaphore>,
    fetches: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(max_concurrency: usize) -> Self {
        let permits = max_concurrency.max(1);
        Self {
            sources: Arc::new(Semaphore::new(permits)),
            fetches: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Spawns `fut` onto `set`; it starts once a source slot is free.
    pub fn spawn<F, T>(&self, set: &mut JoinSet<anyhow::Result<T>>, fut: F)
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let semaphore = Arc::clone(&self.sources);
        set.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .context("source worker semaphore is closed")?;
            fut.await
        });
    }

    /// Held for the duration of one HTTP request.
    pub async fn fetch_permit(&self) -> anyhow::Result<OwnedSemaphorePermit> {
        Arc::clone(&self.fetches)
            .acquire_owned()
            .await
            .context("fetch semaphore is closed")
    }
}
