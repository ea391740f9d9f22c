use chrono::Local;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::error;

const TEST_PREFIX: &str = "test-";

/// Per-task log files under `<root>/<task_id>/`.
///
/// Execution logs are named `YYYYMMDD-HHMMSS.log`, dry-run logs
/// `test-YYYYMMDD-HHMMSS.log`; a name already taken within the same second
/// gets a `_N` suffix. Each file is created lazily on first write and reused
/// for the lifetime of the handle, so a handle never reopens an older log.
pub struct TaskLog {
    task_id: String,
    dir: PathBuf,
    exec: Mutex<Option<(PathBuf, File)>>,
    test: Mutex<Option<(PathBuf, File)>>,
}

impl TaskLog {
    pub fn new(root: &Path, task_id: &str) -> io::Result<Self> {
        let dir = root.join(task_id);
        fs::create_dir_all(&dir).map_err(|e| {
            error!("Failed to create log directory {}: {}", dir.display(), e);
            e
        })?;
        Ok(Self {
            task_id: task_id.to_string(),
            dir,
            exec: Mutex::new(None),
            test: Mutex::new(None),
        })
    }

    /// Handle for redirecting process output into the execution log.
    pub fn exec_writer(&self) -> io::Result<File> {
        let mut slot = self.exec.lock();
        let file = open_slot(&mut slot, &self.dir, "")?;
        file.try_clone()
    }

    /// Handle for redirecting dry-run output into the test log.
    pub fn test_writer(&self) -> io::Result<File> {
        let mut slot = self.test.lock();
        let file = open_slot(&mut slot, &self.dir, TEST_PREFIX)?;
        file.try_clone()
    }

    pub fn append_exec(&self, message: &str) -> io::Result<()> {
        let mut slot = self.exec.lock();
        let file = open_slot(&mut slot, &self.dir, "")?;
        write_line(file, message).map_err(|e| {
            error!("Failed to write execution log for task {}: {}", self.task_id, e);
            e
        })
    }

    pub fn append_test(&self, message: &str) -> io::Result<()> {
        let mut slot = self.test.lock();
        let file = open_slot(&mut slot, &self.dir, TEST_PREFIX)?;
        write_line(file, message).map_err(|e| {
            error!("Failed to write test log for task {}: {}", self.task_id, e);
            e
        })
    }

    pub fn test_path(&self) -> Option<PathBuf> {
        self.test.lock().as_ref().map(|(p, _)| p.clone())
    }
}

/// Execution logs of a task, oldest first: `(total, page)`.
///
/// Dry-run logs are excluded. A task that never logged has an empty listing.
pub fn list_exec_logs(root: &Path, task_id: &str, page: usize, page_size: usize) -> io::Result<(usize, Vec<PathBuf>)> {
    let dir = root.join(task_id);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((0, Vec::new())),
        Err(e) => {
            error!("Failed to read log directory {}: {}", dir.display(), e);
            return Err(e);
        }
    };

    let mut logs = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(".log") && !name.starts_with(TEST_PREFIX) {
            logs.push(entry.path());
        }
    }
    logs.sort();

    let total = logs.len();
    let start = page.saturating_sub(1).saturating_mul(page_size);
    if start >= total {
        return Ok((total, Vec::new()));
    }
    let end = start.saturating_add(page_size).min(total);
    Ok((total, logs[start..end].to_vec()))
}

fn stamp() -> String {
    Local::now().format("%Y%m%d-%H%M%S").to_string()
}

fn open_slot<'a>(slot: &'a mut Option<(PathBuf, File)>, dir: &Path, prefix: &str) -> io::Result<&'a mut File> {
    if slot.is_none() {
        *slot = Some(create_log_file(dir, prefix)?);
    }
    match slot {
        Some((_, file)) => Ok(file),
        None => Err(io::Error::other("log file not open")),
    }
}

fn create_log_file(dir: &Path, prefix: &str) -> io::Result<(PathBuf, File)> {
    let stamp = stamp();
    for n in 0..1000u32 {
        let name = if n == 0 {
            format!("{prefix}{stamp}.log")
        } else {
            format!("{prefix}{stamp}_{n}.log")
        };
        let path = dir.join(name);
        match OpenOptions::new().append(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => {
                error!("Failed to open log file {}: {}", path.display(), e);
                return Err(e);
            }
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free log file name for {prefix}{stamp} in {}", dir.display()),
    ))
}

fn write_line(file: &mut File, message: &str) -> io::Result<()> {
    let line = format!("[{}] {}\n", Local::now().format("%Y-%m-%d %H:%M:%S"), message);
    file.write_all(line.as_bytes())
}
