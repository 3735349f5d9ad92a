//! Persistence: 断点记录的持久化
//!
//! 记录只保存未完成的下载：首次写入进度时创建，下载过程中定期更新，
//! 完成、取消或过期清理时删除。

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::core::error::{DownloadError, DownloadResult};
use crate::core::task::request::{Destination, DownloadId};

/// 一条断点记录
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PersistedRecord {
    pub id: DownloadId,
    pub url: String,
    pub destination: Destination,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    #[serde(default)]
    pub etag: Option<String>,
    pub last_modified_at: DateTime<Utc>,
}

impl PersistedRecord {
    pub fn matches(&self, url: &str, destination: &Destination) -> bool {
        self.url == url && self.destination.same_location(destination)
    }
}

/// 断点记录存储，所有操作按标识原子执行
pub trait PersistenceStore: Send + Sync {
    fn upsert(&self, record: PersistedRecord) -> DownloadResult<()>;

    fn get(&self, id: DownloadId) -> DownloadResult<Option<PersistedRecord>>;

    fn remove(&self, id: DownloadId) -> DownloadResult<()>;

    /// 最后更新时间早于 `now - age` 的记录
    fn list_older_than(&self, age: ChronoDuration) -> DownloadResult<Vec<PersistedRecord>>;
}

fn older_than<'a>(records: impl Iterator<Item = &'a PersistedRecord>, age: ChronoDuration) -> Vec<PersistedRecord> {
    let threshold = Utc::now() - age;
    records
        .filter(|r| r.last_modified_at < threshold)
        .cloned()
        .collect()
}

/// 内存存储，进程退出后丢失
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<DownloadId, PersistedRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> DownloadResult<std::sync::MutexGuard<'_, HashMap<DownloadId, PersistedRecord>>> {
        self.records
            .lock()
            .map_err(|_| DownloadError::Persistence("记录表锁已损坏".to_string()))
    }
}

impl PersistenceStore for MemoryStore {
    fn upsert(&self, record: PersistedRecord) -> DownloadResult<()> {
        self.lock()?.insert(record.id, record);
        Ok(())
    }

    fn get(&self, id: DownloadId) -> DownloadResult<Option<PersistedRecord>> {
        Ok(self.lock()?.get(&id).cloned())
    }

    fn remove(&self, id: DownloadId) -> DownloadResult<()> {
        self.lock()?.remove(&id);
        Ok(())
    }

    fn list_older_than(&self, age: ChronoDuration) -> DownloadResult<Vec<PersistedRecord>> {
        Ok(older_than(self.lock()?.values(), age))
    }
}

/// 关闭持久化时使用：什么都不保存
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStore;

impl PersistenceStore for NoopStore {
    fn upsert(&self, _record: PersistedRecord) -> DownloadResult<()> {
        Ok(())
    }

    fn get(&self, _id: DownloadId) -> DownloadResult<Option<PersistedRecord>> {
        Ok(None)
    }

    fn remove(&self, _id: DownloadId) -> DownloadResult<()> {
        Ok(())
    }

    fn list_older_than(&self, _age: ChronoDuration) -> DownloadResult<Vec<PersistedRecord>> {
        Ok(Vec::new())
    }
}

/// JSON 文件存储：每次修改都重写整个文件
pub struct JsonFileStore {
    path: PathBuf,
    records: Mutex<HashMap<DownloadId, PersistedRecord>>,
}

impl JsonFileStore {
    /// 打开记录文件，不存在时从空表开始
    pub fn open(path: impl AsRef<Path>) -> DownloadResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut records = HashMap::new();
        match fs::read_to_string(&path) {
            Ok(data) if !data.trim().is_empty() => {
                let list: Vec<PersistedRecord> = serde_json::from_str(&data)?;
                for record in list {
                    records.insert(record.id, record);
                }
                log::info!("从 {} 加载了 {} 条断点记录", path.display(), records.len());
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(DownloadError::Persistence(format!(
                    "无法读取记录文件 {}: {}",
                    path.display(),
                    e
                )))
            }
        }
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    fn save(&self, records: &HashMap<DownloadId, PersistedRecord>) -> DownloadResult<()> {
        let mut list: Vec<&PersistedRecord> = records.values().collect();
        list.sort_by_key(|r| r.id);
        let json = serde_json::to_string_pretty(&list)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| DownloadError::Persistence(format!("无法创建目录 {}: {}", parent.display(), e)))?;
            }
        }
        // 先写临时文件再改名，避免写到一半的文件覆盖旧记录
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .and_then(|_| fs::rename(&tmp, &self.path))
            .map_err(|e| DownloadError::Persistence(format!("无法写入记录文件 {}: {}", self.path.display(), e)))
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut HashMap<DownloadId, PersistedRecord>) -> R) -> DownloadResult<R> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| DownloadError::Persistence("记录表锁已损坏".to_string()))?;
        // 写盘成功后才替换内存中的表，失败时两边保持一致
        let mut updated = records.clone();
        let result = f(&mut updated);
        self.save(&updated)?;
        *records = updated;
        Ok(result)
    }
}

impl PersistenceStore for JsonFileStore {
    fn upsert(&self, record: PersistedRecord) -> DownloadResult<()> {
        self.mutate(|records| {
            records.insert(record.id, record);
        })
    }

    fn get(&self, id: DownloadId) -> DownloadResult<Option<PersistedRecord>> {
        let records = self
            .records
            .lock()
            .map_err(|_| DownloadError::Persistence("记录表锁已损坏".to_string()))?;
        Ok(records.get(&id).cloned())
    }

    fn remove(&self, id: DownloadId) -> DownloadResult<()> {
        let records = self
            .records
            .lock()
            .map_err(|_| DownloadError::Persistence("记录表锁已损坏".to_string()))?;
        if !records.contains_key(&id) {
            return Ok(());
        }
        drop(records);
        self.mutate(|records| {
            records.remove(&id);
        })
    }

    fn list_older_than(&self, age: ChronoDuration) -> DownloadResult<Vec<PersistedRecord>> {
        let records = self
            .records
            .lock()
            .map_err(|_| DownloadError::Persistence("记录表锁已损坏".to_string()))?;
        Ok(older_than(records.values(), age))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, age_days: i64) -> PersistedRecord {
        let url = format!("http://host/{}", name);
        let destination = Destination::new("/downloads", name);
        PersistedRecord {
            id: DownloadId::derive(&url, destination.parent(), name),
            url,
            destination,
            downloaded_bytes: 100,
            total_bytes: 1000,
            etag: Some("\"v1\"".to_string()),
            last_modified_at: Utc::now() - ChronoDuration::days(age_days),
        }
    }

    #[test]
    fn test_memory_store_crud() {
        let store = MemoryStore::new();
        let r = record("a.bin", 0);
        store.upsert(r.clone()).unwrap();
        assert_eq!(store.get(r.id).unwrap(), Some(r.clone()));

        let mut updated = r.clone();
        updated.downloaded_bytes = 500;
        store.upsert(updated.clone()).unwrap();
        assert_eq!(store.get(r.id).unwrap().unwrap().downloaded_bytes, 500);

        store.remove(r.id).unwrap();
        assert_eq!(store.get(r.id).unwrap(), None);
    }

    #[test]
    fn test_list_older_than() {
        let store = MemoryStore::new();
        let fresh = record("fresh.bin", 1);
        let stale = record("stale.bin", 10);
        store.upsert(fresh).unwrap();
        store.upsert(stale.clone()).unwrap();

        let old = store.list_older_than(ChronoDuration::days(7)).unwrap();
        assert_eq!(old, vec![stale]);
    }

    #[test]
    fn test_json_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("transfers.json");

        let a = record("a.bin", 0);
        let b = record("b.bin", 3);
        {
            let store = JsonFileStore::open(&path).unwrap();
            store.upsert(a.clone()).unwrap();
            store.upsert(b.clone()).unwrap();
            store.remove(b.id).unwrap();
        }

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.get(a.id).unwrap(), Some(a));
        assert_eq!(reopened.get(b.id).unwrap(), None);
    }

    #[test]
    fn test_json_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfers.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(JsonFileStore::open(&path), Err(DownloadError::Persistence(_))));
    }

    #[test]
    fn test_json_store_unchanged_when_save_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfers.json");
        let store = JsonFileStore::open(&path).unwrap();
        let kept = record("kept.bin", 0);
        store.upsert(kept.clone()).unwrap();

        // 记录文件的位置被一个非空目录占住，改名会失败
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();
        fs::write(path.join("blocker"), b"x").unwrap();

        let lost = record("lost.bin", 0);
        assert!(store.upsert(lost.clone()).is_err());
        assert_eq!(store.get(lost.id).unwrap(), None);
        assert!(store.remove(kept.id).is_err());
        assert_eq!(store.get(kept.id).unwrap(), Some(kept));
    }

    #[test]
    fn test_noop_store() {
        let store = NoopStore;
        let r = record("a.bin", 30);
        store.upsert(r.clone()).unwrap();
        assert_eq!(store.get(r.id).unwrap(), None);
        assert!(store.list_older_than(ChronoDuration::days(1)).unwrap().is_empty());
    }

    #[test]
    fn test_record_matches() {
        let r = record("a.bin", 0);
        assert!(r.matches("http://host/a.bin", &Destination::new("/downloads/", "a.bin")));
        assert!(!r.matches("http://host/other.bin", &Destination::new("/downloads", "a.bin")));
    }
}
