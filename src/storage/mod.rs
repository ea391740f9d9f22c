mod json_file;

pub use json_file::JsonFileStore;

use chrono::{DateTime, Duration, Utc};
#[cfg(test)]
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

use crate::rsync::RsyncTask;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("task {0} not found")]
    NotFound(String),

    #[error("task id already exists: {0}")]
    IdExists(String),

    #[error("task name already exists: {0}")]
    NameExists(String),

    #[error("storage io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize tasks: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Persistence contract for rsync tasks.
///
/// Every mutating call refreshes `updated_at` on the passed task and is
/// durable once it returns.
pub trait TaskStore: Send + Sync {
    /// Insert a new task; fails on a duplicate id or name.
    fn create_task(&self, task: &mut RsyncTask) -> Result<()>;

    /// Upsert by id.
    fn save_task(&self, task: &mut RsyncTask) -> Result<()>;

    fn get_task(&self, id: &str) -> Result<RsyncTask>;

    fn get_task_by_name(&self, name: &str) -> Result<RsyncTask>;

    /// One 1-based page, ordered by creation time.
    fn list_tasks(&self, page: usize, page_size: usize) -> Result<Vec<RsyncTask>>;

    fn all_tasks(&self) -> Result<Vec<RsyncTask>>;

    /// Removing a missing id is not an error.
    fn delete_task(&self, id: &str) -> Result<()>;

    fn close(&self) -> Result<()>;
}

/// Next `updated_at` for a task, strictly after the stored one.
pub(crate) fn next_timestamp(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(prev) if now <= prev => prev + Duration::microseconds(1),
        _ => now,
    }
}

pub(crate) fn check_unique(tasks: &HashMap<String, RsyncTask>, task: &RsyncTask) -> Result<()> {
    if tasks.contains_key(&task.id) {
        return Err(StorageError::IdExists(task.id.clone()));
    }
    if tasks.values().any(|existing| existing.name == task.name) {
        return Err(StorageError::NameExists(task.name.clone()));
    }
    Ok(())
}

/// Sorted snapshot of a task map, sliced to the requested page.
pub(crate) fn paginate(tasks: &HashMap<String, RsyncTask>, page: usize, page_size: usize) -> Vec<RsyncTask> {
    let mut all = sorted(tasks);
    let start = page.saturating_sub(1).saturating_mul(page_size);
    if start >= all.len() {
        return Vec::new();
    }
    let end = start.saturating_add(page_size).min(all.len());
    all.drain(start..end).collect()
}

pub(crate) fn sorted(tasks: &HashMap<String, RsyncTask>) -> Vec<RsyncTask> {
    let mut all: Vec<RsyncTask> = tasks.values().cloned().collect();
    all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    all
}

/// Non-durable store with the same semantics as [`JsonFileStore`].
#[cfg(test)]
#[derive(Default)]
pub struct MemoryStore {
    tasks: RwLock<HashMap<String, RsyncTask>>,
}

#[cfg(test)]
impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl TaskStore for MemoryStore {
    fn create_task(&self, task: &mut RsyncTask) -> Result<()> {
        let mut tasks = self.tasks.write();
        check_unique(&tasks, task)?;
        task.updated_at = next_timestamp(None);
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    fn save_task(&self, task: &mut RsyncTask) -> Result<()> {
        let mut tasks = self.tasks.write();
        task.updated_at = next_timestamp(tasks.get(&task.id).map(|t| t.updated_at));
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    fn get_task(&self, id: &str) -> Result<RsyncTask> {
        self.tasks
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    fn get_task_by_name(&self, name: &str) -> Result<RsyncTask> {
        self.tasks
            .read()
            .values()
            .find(|t| t.name == name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    fn list_tasks(&self, page: usize, page_size: usize) -> Result<Vec<RsyncTask>> {
        Ok(paginate(&self.tasks.read(), page, page_size))
    }

    fn all_tasks(&self) -> Result<Vec<RsyncTask>> {
        Ok(sorted(&self.tasks.read()))
    }

    fn delete_task(&self, id: &str) -> Result<()> {
        self.tasks.write().remove(id);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
