//! Periodic auto-sync task.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::engine::SyncEngine;
use crate::remote::RemoteStore;
use crate::store::ObjectStore;

/// Runs [`SyncEngine::auto_sync`] on a fixed interval until shut down.
///
/// The first cycle starts immediately. Ticks missed while a cycle runs are
/// skipped rather than bunched up.
pub struct PeriodicSync {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl PeriodicSync {
    pub fn spawn<S, R>(engine: Arc<SyncEngine<S, R>>, interval: Duration) -> Self
    where
        S: ObjectStore + 'static,
        R: RemoteStore + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("Auto sync every {:?}", interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        debug!("Auto sync tick");
                        engine.auto_sync().await;
                    }
                    _ = &mut shutdown_rx => {
                        debug!("Auto sync stopping");
                        break;
                    }
                }
            }
        });

        Self {
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }

    /// Stop scheduling. A cycle already running is allowed to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PeriodicSync {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::InMemoryBlobStore;
    use crate::config::SyncConfig;
    use crate::entity::{Entity, EntityKind, Item};
    use crate::remote::InMemoryRemoteStore;
    use crate::retry::RetryPolicy;
    use crate::store::InMemoryObjectStore;

    async fn engine(
        remote: Arc<InMemoryRemoteStore>,
    ) -> Arc<SyncEngine<InMemoryObjectStore, InMemoryRemoteStore>> {
        let config = SyncConfig {
            retry: RetryPolicy::none(),
            ..SyncConfig::default()
        };
        let engine = SyncEngine::open(
            InMemoryObjectStore::new(),
            remote,
            Arc::new(InMemoryBlobStore::new()),
            config,
        )
        .await
        .unwrap();
        Arc::new(engine)
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_cycles_on_interval() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let engine = engine(remote.clone()).await;
        engine
            .with_store(|store| {
                store.insert(Entity::Item(Item::new("Saw", 1, 0, 1_000)));
                store.save()
            })
            .await
            .unwrap();

        let scheduler = PeriodicSync::spawn(engine.clone(), Duration::from_secs(60));

        // First tick fires immediately
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(remote.record_count(&EntityKind::Item.zone()), 1);
        assert_eq!(remote.upsert_batches().len(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(remote.upsert_batches().len(), 2);

        scheduler.shutdown().await;
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(remote.upsert_batches().len(), 2);
        assert!(engine.last_sync_at().is_some());
    }
}
