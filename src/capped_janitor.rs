/*!
 * @file capped_janitor.rs
 * @brief Background enforcement of capped collection limits
 */

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::config::CappedCleanupConfig;

/// Periodically scans every capped collection and deletes the oldest slice
/// of documents once the collection exceeds its size or count cap. Evictions
/// are logged, never surfaced to clients.
pub async fn run(
    backend: Arc<dyn Backend>,
    config: CappedCleanupConfig,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(config.interval_secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = sweep(backend.as_ref(), config.percent).await {
                    warn!(error = %e, "capped collection sweep failed");
                }
            }
            _ = shutdown.recv() => {
                debug!("capped janitor stopping");
                return;
            }
        }
    }
}

async fn sweep(backend: &dyn Backend, percent: u8) -> Result<(), crate::error::CommandError> {
    for db in backend.list_databases().await? {
        for info in backend.list_collections(&db).await? {
            let Some(capped) = info.capped else { continue };
            let stats = backend.collection_stats(&db, &info.name).await?;

            let over_size = stats.size_bytes > capped.size;
            let over_count = capped.max.map(|max| stats.count > max).unwrap_or(false);
            if !over_size && !over_count {
                continue;
            }

            let mut to_delete = (stats.count * percent as i64).div_euclid(100).max(1);
            if let Some(max) = capped.max {
                let excess = stats.count - max;
                if excess > to_delete {
                    to_delete = excess;
                }
            }
            let deleted = backend.delete_oldest(&db, &info.name, to_delete).await?;
            info!(
                namespace = %format!("{}.{}", db, info.name),
                deleted,
                size = stats.size_bytes,
                cap = capped.size,
                "evicted oldest documents from capped collection"
            );
        }
    }
    Ok(())
}

/// Cursor expiry heartbeat: drives the registry's maintenance tick on its
/// own task, at least once per second.
pub async fn cursor_expiry(
    cursors: Arc<crate::cursor_registry::CursorRegistry>,
    tick_secs: u64,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(tick_secs.clamp(1, 60)));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let destroyed = cursors.tick();
                if destroyed > 0 {
                    debug!(destroyed, "expired idle cursors");
                }
            }
            _ = shutdown.recv() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CappedSpec;
    use crate::sqlite_backend::SqliteBackend;
    use bson::doc;

    #[tokio::test]
    async fn sweep_trims_over_capped_collections() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend
            .create_collection("db", "log", Some(CappedSpec { size: 1, max: None }))
            .await
            .unwrap();
        for i in 0..100 {
            backend
                .insert_one("db", "log", &doc! {"_id": i})
                .await
                .unwrap();
        }

        sweep(&backend, 10).await.unwrap();
        let stats = backend.collection_stats("db", "log").await.unwrap();
        assert_eq!(stats.count, 90);

        // The oldest tenth went first.
        let stream = backend
            .query("db", "log", &crate::backend::QueryPlan::full_scan())
            .await
            .unwrap();
        let docs = crate::aggregation::collect(stream).await.unwrap();
        assert_eq!(docs[0], doc! {"_id": 10});
    }

    #[tokio::test]
    async fn sweep_ignores_uncapped_collections() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.create_collection("db", "c", None).await.unwrap();
        for i in 0..10 {
            backend.insert_one("db", "c", &doc! {"_id": i}).await.unwrap();
        }
        sweep(&backend, 10).await.unwrap();
        let stats = backend.collection_stats("db", "c").await.unwrap();
        assert_eq!(stats.count, 10);
    }
}
