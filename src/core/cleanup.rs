use chrono::Duration as ChronoDuration;
use std::collections::HashSet;
use std::sync::Arc;

use crate::core::context::EngineContext;
use crate::core::error::DownloadResult;
use crate::core::task::request::{Destination, DownloadId};
use crate::storage::discard_artifact;

/// 取消后的清理：删除断点记录和残留文件
pub async fn cleanup_transfer(ctx: Arc<EngineContext>, id: DownloadId, destination: Destination) {
    if let Err(e) = ctx.store.remove(id) {
        log::warn!("删除断点记录失败: {} - {}", id, e);
    }
    if discard_artifact(ctx.storage.as_ref(), &destination).await {
        log::debug!("已清理 {} 的残留文件", id);
    }
}

/// 清理超过 `max_age_days` 天没有更新的断点记录及其残留文件
///
/// `active` 中的任务不会被清理。残留文件删除失败时记录仍会被移除。
pub async fn evict_stale(
    ctx: Arc<EngineContext>,
    max_age_days: u32,
    active: HashSet<DownloadId>,
) -> DownloadResult<usize> {
    let stale = ctx
        .store
        .list_older_than(ChronoDuration::days(i64::from(max_age_days)))?;

    let mut evicted = 0;
    for record in stale {
        if active.contains(&record.id) {
            log::debug!("跳过正在进行的任务: {}", record.id);
            continue;
        }
        if !discard_artifact(ctx.storage.as_ref(), &record.destination).await {
            log::warn!("{} 的残留文件未能删除，仍然移除记录", record.id);
        }
        match ctx.store.remove(record.id) {
            Ok(()) => evicted += 1,
            Err(e) => log::warn!("移除过期记录失败: {} - {}", record.id, e),
        }
    }
    if evicted > 0 {
        log::info!("已清理 {} 个超过 {} 天的未完成下载", evicted, max_age_days);
    }
    Ok(evicted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core::context::EngineBuilder;
    use crate::persistence::{MemoryStore, PersistedRecord, PersistenceStore};
    use crate::storage::{AutoGrant, FsStorageGateway};
    use chrono::Utc;

    fn engine(dir: &std::path::Path, store: Arc<MemoryStore>) -> Arc<EngineContext> {
        let mut config = Config::default();
        config.download_dir = dir.to_string_lossy().to_string();
        Arc::new(
            EngineBuilder::new(config, Arc::new(AutoGrant))
                .store(store)
                .build()
                .unwrap(),
        )
    }

    fn record(dir: &std::path::Path, name: &str, age_days: i64) -> PersistedRecord {
        let url = format!("http://h/{}", name);
        let destination = Destination::new(dir, name);
        PersistedRecord {
            id: DownloadId::derive(&url, destination.parent(), name),
            url,
            destination,
            downloaded_bytes: 10,
            total_bytes: 100,
            etag: None,
            last_modified_at: Utc::now() - ChronoDuration::days(age_days),
        }
    }

    #[tokio::test]
    async fn test_evict_removes_stale_records_and_partials() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let ctx = engine(dir.path(), store.clone());

        let old = record(dir.path(), "old.bin", 10);
        let fresh = record(dir.path(), "fresh.bin", 1);
        let partial = FsStorageGateway::partial_path(&old.destination);
        std::fs::write(&partial, b"0123456789").unwrap();
        store.upsert(old.clone()).unwrap();
        store.upsert(fresh.clone()).unwrap();

        let evicted = evict_stale(ctx, 7, HashSet::new()).await.unwrap();
        assert_eq!(evicted, 1);
        assert!(!partial.exists());
        assert_eq!(store.get(old.id).unwrap(), None);
        assert!(store.get(fresh.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_evict_skips_active() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let ctx = engine(dir.path(), store.clone());

        let old = record(dir.path(), "busy.bin", 30);
        store.upsert(old.clone()).unwrap();

        let active: HashSet<_> = [old.id].into_iter().collect();
        assert_eq!(evict_stale(ctx, 7, active).await.unwrap(), 0);
        assert!(store.get(old.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_missing_partial_still_evicts_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let ctx = engine(dir.path(), store.clone());

        let old = record(dir.path(), "gone.bin", 8);
        store.upsert(old.clone()).unwrap();
        assert_eq!(evict_stale(ctx, 7, HashSet::new()).await.unwrap(), 1);
        assert_eq!(store.get(old.id).unwrap(), None);
    }

    #[tokio::test]
    async fn test_cleanup_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let ctx = engine(dir.path(), store.clone());

        let rec = record(dir.path(), "c.bin", 0);
        let partial = FsStorageGateway::partial_path(&rec.destination);
        std::fs::write(&partial, b"abc").unwrap();
        store.upsert(rec.clone()).unwrap();

        cleanup_transfer(ctx, rec.id, rec.destination.clone()).await;
        assert!(!partial.exists());
        assert_eq!(store.get(rec.id).unwrap(), None);
    }
}
