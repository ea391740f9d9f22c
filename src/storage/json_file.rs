use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::{check_unique, next_timestamp, paginate, sorted, Result, StorageError, TaskStore};
use crate::rsync::{RsyncTask, TaskState};

pub const RESTART_ERROR: &str = "agent restarted while task running";

/// Task map persisted as one JSON object (`id -> task`).
///
/// Reads are served from the in-memory mirror. Each mutation rewrites the
/// whole file (temp file + rename) while holding the write lock.
pub struct JsonFileStore {
    path: PathBuf,
    cache: RwLock<HashMap<String, RsyncTask>>,
}

impl JsonFileStore {
    /// Open or initialize the store at `path`.
    ///
    /// A missing file starts empty; an unparsable one is logged, reset and
    /// overwritten with `{}`. Tasks left `running` by a previous process are
    /// marked failed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| StorageError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let store = Self {
            path: path.clone(),
            cache: RwLock::new(HashMap::new()),
        };

        if !path.exists() {
            write_atomic(&path, b"{}")?;
            info!("Created task store at {}", path.display());
            return Ok(store);
        }

        let data = fs::read(&path).map_err(|source| StorageError::Io {
            path: path.clone(),
            source,
        })?;
        if data.is_empty() {
            return Ok(store);
        }

        match serde_json::from_slice::<HashMap<String, RsyncTask>>(&data) {
            Ok(mut tasks) => {
                let mut repaired = 0;
                for task in tasks.values_mut().filter(|t| t.state == TaskState::Running) {
                    task.state = TaskState::Failed;
                    task.last_error = RESTART_ERROR.to_string();
                    task.updated_at = next_timestamp(Some(task.updated_at));
                    repaired += 1;
                }
                info!("Loaded {} rsync tasks from {}", tasks.len(), path.display());

                let mut cache = store.cache.write();
                *cache = tasks;
                if repaired > 0 {
                    warn!("Marked {} interrupted tasks as failed", repaired);
                    if let Err(e) = store.persist(&cache) {
                        warn!("Failed to save repaired task states: {}", e);
                    }
                }
            }
            Err(e) => {
                warn!("Task store {} is corrupted, resetting: {}", path.display(), e);
                write_atomic(&path, b"{}")?;
            }
        }

        Ok(store)
    }

    fn persist(&self, tasks: &HashMap<String, RsyncTask>) -> Result<()> {
        let data = serde_json::to_vec_pretty(tasks)?;
        write_atomic(&self.path, &data)
    }
}

/// Write `data` to a sibling temp file, flush it to disk, then rename it over
/// `path`. Readers see either the old map or the new one.
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    let io_err = |source| StorageError::Io {
        path: tmp_path.clone(),
        source,
    };

    let mut file = File::create(&tmp_path).map_err(io_err)?;
    file.write_all(data).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    drop(file);

    fs::rename(&tmp_path, path).map_err(|source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    })
}

impl TaskStore for JsonFileStore {
    fn create_task(&self, task: &mut RsyncTask) -> Result<()> {
        let mut cache = self.cache.write();
        check_unique(&cache, task)?;
        task.updated_at = next_timestamp(None);
        cache.insert(task.id.clone(), task.clone());
        if let Err(e) = self.persist(&cache) {
            cache.remove(&task.id);
            return Err(e);
        }
        Ok(())
    }

    fn save_task(&self, task: &mut RsyncTask) -> Result<()> {
        let mut cache = self.cache.write();
        let previous = cache.get(&task.id).cloned();
        task.updated_at = next_timestamp(previous.as_ref().map(|t| t.updated_at));
        cache.insert(task.id.clone(), task.clone());
        if let Err(e) = self.persist(&cache) {
            // keep the mirror in step with the file
            match previous {
                Some(prev) => cache.insert(task.id.clone(), prev),
                None => cache.remove(&task.id),
            };
            return Err(e);
        }
        Ok(())
    }

    fn get_task(&self, id: &str) -> Result<RsyncTask> {
        self.cache
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    fn get_task_by_name(&self, name: &str) -> Result<RsyncTask> {
        self.cache
            .read()
            .values()
            .find(|t| t.name == name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    fn list_tasks(&self, page: usize, page_size: usize) -> Result<Vec<RsyncTask>> {
        Ok(paginate(&self.cache.read(), page, page_size))
    }

    fn all_tasks(&self) -> Result<Vec<RsyncTask>> {
        Ok(sorted(&self.cache.read()))
    }

    fn delete_task(&self, id: &str) -> Result<()> {
        let mut cache = self.cache.write();
        let Some(removed) = cache.remove(id) else {
            return Ok(());
        };
        if let Err(e) = self.persist(&cache) {
            cache.insert(id.to_string(), removed);
            return Err(e);
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rsync::{AuthMode, RemoteType, SyncDirection};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn task(id: &str, name: &str) -> RsyncTask {
        let mut t = RsyncTask::new(name, SyncDirection::LocalToRemote, RemoteType::Ssh, AuthMode::PrivateKey);
        t.id = id.to_string();
        t.local_path = "/data".to_string();
        t
    }

    #[test]
    fn test_missing_file_initializes_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/rsync/rsync_tasks.json");

        let store = JsonFileStore::open(&path).unwrap();
        assert!(store.all_tasks().unwrap().is_empty());
        assert_eq!(fs::read_to_string(&path).unwrap(), "{}");
    }

    #[test]
    fn test_corrupted_file_is_reset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rsync_tasks.json");
        fs::write(&path, "{\"broken\": [").unwrap();

        let store = JsonFileStore::open(&path).unwrap();
        assert!(store.all_tasks().unwrap().is_empty());
        assert_eq!(fs::read_to_string(&path).unwrap(), "{}");
    }

    #[test]
    fn test_save_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rsync_tasks.json");

        let mut t = task("a", "nightly");
        {
            let store = JsonFileStore::open(&path).unwrap();
            store.create_task(&mut t).unwrap();
            t.last_error = "boom".to_string();
            t.state = TaskState::Failed;
            store.save_task(&mut t).unwrap();
            store.close().unwrap();
        }

        let store = JsonFileStore::open(&path).unwrap();
        assert_eq!(store.get_task("a").unwrap(), t);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_failed_write_keeps_previous_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rsync_tasks.json");
        let store = JsonFileStore::open(&path).unwrap();
        let mut t = task("a", "nightly");
        store.create_task(&mut t).unwrap();

        // a directory in the temp file's place makes the next write fail
        fs::create_dir(path.with_extension("json.tmp")).unwrap();
        let mut changed = t.clone();
        changed.state = TaskState::Failed;
        assert!(matches!(store.save_task(&mut changed), Err(StorageError::Io { .. })));

        assert_eq!(store.get_task("a").unwrap(), t);
        let raw: HashMap<String, RsyncTask> = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["a"], t);
    }

    #[test]
    fn test_running_tasks_marked_failed_on_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rsync_tasks.json");
        {
            let store = JsonFileStore::open(&path).unwrap();
            let mut t = task("a", "nightly");
            t.state = TaskState::Running;
            store.save_task(&mut t).unwrap();
        }

        let store = JsonFileStore::open(&path).unwrap();
        let t = store.get_task("a").unwrap();
        assert_eq!(t.state, TaskState::Failed);
        assert_eq!(t.last_error, RESTART_ERROR);

        // the repair itself is durable
        let raw: HashMap<String, RsyncTask> = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["a"].state, TaskState::Failed);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path().join("rsync_tasks.json")).unwrap();
        store.create_task(&mut task("a", "nightly")).unwrap();

        store.delete_task("a").unwrap();
        store.delete_task("a").unwrap();
        assert!(matches!(store.get_task("a"), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_concurrent_saves_all_land() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rsync_tasks.json");
        let store = Arc::new(JsonFileStore::open(&path).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let mut t = task(&format!("id-{i}"), &format!("task-{i}"));
                    store.save_task(&mut t).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.all_tasks().unwrap().len(), 8);
    }
}
