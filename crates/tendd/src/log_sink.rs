//! Bounded terminal log shared by every command the daemon runs.
//!
//! A file-backed sink treats the file as the record shared with other
//! `tendd` invocations. Every mutation holds an exclusive advisory lock on a
//! sibling `.lock` file, and the in-memory ring is reloaded from the file's
//! tail whenever another process has changed the file since this sink last
//! touched it. The file is compacted to the retained suffix once it grows
//! past twice the cap.

use std::collections::VecDeque;
use std::fs::{self, File, Metadata, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Local;
use fs2::FileExt;
use tend_runner::LineSink;

#[derive(Debug, thiserror::Error)]
pub enum LogSinkError {
    #[error("failed to create log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read log file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write log file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Identity, size and modification time of the log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileMark {
    dev: u64,
    ino: u64,
    len: u64,
    mtime: (i64, i64),
}

impl FileMark {
    fn of(meta: &Metadata) -> Self {
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
            len: meta.len(),
            mtime: (meta.mtime(), meta.mtime_nsec()),
        }
    }
}

#[derive(Debug)]
struct LogFile {
    path: PathBuf,
    file: File,
    /// Lines in the file.
    lines: usize,
    /// The file as this sink last left it.
    mark: Option<FileMark>,
}

impl LogFile {
    fn remark(&mut self) -> Result<(), LogSinkError> {
        let meta = self.file.metadata().map_err(|source| LogSinkError::Read {
            path: self.path.clone(),
            source,
        })?;
        self.mark = Some(FileMark::of(&meta));
        Ok(())
    }
}

#[derive(Debug)]
struct LockFile {
    path: PathBuf,
    file: File,
}

/// Held advisory lock; released on drop.
struct Exclusive<'a>(&'a LockFile);

impl Drop for Exclusive<'_> {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.0.file) {
            tracing::warn!(path = %self.0.path.display(), error = %err, "failed to unlock terminal log");
        }
    }
}

#[derive(Debug)]
struct Inner {
    lines: VecDeque<String>,
    file: Option<LogFile>,
    /// Lines appended through this sink since it was opened.
    appended: u64,
}

#[derive(Debug)]
pub struct LogSink {
    max_lines: usize,
    lock_file: Option<LockFile>,
    inner: Mutex<Inner>,
}

impl LogSink {
    /// A sink that is never persisted.
    pub fn in_memory(max_lines: usize) -> Self {
        Self {
            max_lines,
            lock_file: None,
            inner: Mutex::new(Inner {
                lines: VecDeque::with_capacity(max_lines.min(4096)),
                file: None,
                appended: 0,
            }),
        }
    }

    /// Open (or create) the log at `path`, keeping its last `max_lines` lines.
    pub fn open(path: impl AsRef<Path>, max_lines: usize) -> Result<Self, LogSinkError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| LogSinkError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let lock_path = path.with_extension("log.lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|source| LogSinkError::Write {
                path: lock_path.clone(),
                source,
            })?;
        let file = open_append(&path)?;
        let sink = Self {
            max_lines,
            lock_file: Some(LockFile {
                path: lock_path,
                file: lock_file,
            }),
            inner: Mutex::new(Inner {
                lines: VecDeque::new(),
                file: Some(LogFile {
                    path,
                    file,
                    lines: 0,
                    mark: None,
                }),
                appended: 0,
            }),
        };
        {
            let mut inner = sink.lock();
            let _held = sink.hold_file_lock()?;
            sink.sync_with_disk(&mut inner)?;
            sink.compact_if_needed(&mut inner);
        }
        Ok(sink)
    }

    pub fn max_lines(&self) -> usize {
        self.max_lines
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.lock().file.as_ref().map(|f| f.path.clone())
    }

    pub fn len(&self) -> usize {
        self.lock_synced().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Running count of lines appended through this sink; unaffected by the
    /// cap and `clear`.
    pub fn appended(&self) -> u64 {
        self.lock().appended
    }

    /// Lines appended after the counter read `mark`, as far as they are
    /// still retained.
    pub fn since(&self, mark: u64) -> Vec<String> {
        let inner = self.lock_synced();
        let fresh = inner.appended.saturating_sub(mark);
        let take = usize::try_from(fresh).unwrap_or(usize::MAX).min(inner.lines.len());
        inner
            .lines
            .iter()
            .skip(inner.lines.len() - take)
            .cloned()
            .collect()
    }

    /// The most recent `limit` lines (all retained lines for `None`), oldest
    /// first.
    pub fn snapshot(&self, limit: Option<usize>) -> Vec<String> {
        let inner = self.lock_synced();
        let take = limit.unwrap_or(inner.lines.len()).min(inner.lines.len());
        inner
            .lines
            .iter()
            .skip(inner.lines.len() - take)
            .cloned()
            .collect()
    }

    /// Drop every line, in memory and on disk.
    pub fn clear(&self) -> Result<(), LogSinkError> {
        let mut inner = self.lock();
        let _held = self.hold_file_lock()?;
        inner.lines.clear();
        if let Some(log) = inner.file.as_mut() {
            let file = open_append(&log.path)?;
            file.set_len(0).map_err(|source| LogSinkError::Write {
                path: log.path.clone(),
                source,
            })?;
            log.file = file;
            log.lines = 0;
            log.remark()?;
        }
        Ok(())
    }

    /// Append a timestamped audit line.
    pub fn audit(&self, message: impl AsRef<str>) {
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        self.push_lines(&[format!("[{stamp}] {}", message.as_ref())]);
    }

    fn push_lines(&self, lines: &[String]) {
        let mut inner = self.lock();
        let _held = self.hold_file_lock_or_warn();
        if let Err(err) = self.sync_with_disk(&mut inner) {
            tracing::warn!(error = %err, "failed to reload terminal log");
        }

        for line in lines {
            inner.lines.push_back(line.clone());
        }
        inner.appended += lines.len() as u64;
        while inner.lines.len() > self.max_lines {
            inner.lines.pop_front();
        }

        if let Some(log) = inner.file.as_mut() {
            let mut buf = String::new();
            for line in lines {
                buf.push_str(line);
                buf.push('\n');
            }
            if let Err(err) = log.file.write_all(buf.as_bytes()) {
                tracing::warn!(path = %log.path.display(), error = %err, "failed to append to terminal log");
            } else {
                log.lines += lines.len();
            }
            if let Err(err) = log.remark() {
                tracing::warn!(error = %err, "failed to stat terminal log");
            }
        }
        self.compact_if_needed(&mut inner);
    }

    /// Reload the ring from the file if someone else changed it. Expects the
    /// file lock to be held.
    fn sync_with_disk(&self, inner: &mut Inner) -> Result<(), LogSinkError> {
        let Some(log) = inner.file.as_mut() else {
            return Ok(());
        };
        let on_disk = fs::metadata(&log.path).ok().map(|meta| FileMark::of(&meta));
        if on_disk.is_some() && on_disk == log.mark {
            return Ok(());
        }

        let (tail, total) = read_tail(&log.path, self.max_lines)?;
        log.file = open_append(&log.path)?;
        log.lines = total;
        log.remark()?;
        inner.lines = tail;
        Ok(())
    }

    /// Rewrite the file to the retained suffix. Expects the file lock to be
    /// held and the ring to be in sync with the file.
    fn compact_if_needed(&self, inner: &mut Inner) {
        let Some(log) = inner.file.as_mut() else {
            return;
        };
        if log.lines <= self.max_lines.saturating_mul(2).max(1) {
            return;
        }
        let compacted = rewrite(&log.path, &inner.lines)
            .and_then(|()| open_append(&log.path))
            .and_then(|file| {
                log.file = file;
                log.lines = inner.lines.len();
                log.remark()
            });
        if let Err(err) = compacted {
            tracing::warn!(error = %err, "failed to compact terminal log");
        }
    }

    fn hold_file_lock(&self) -> Result<Option<Exclusive<'_>>, LogSinkError> {
        let Some(lock) = &self.lock_file else {
            return Ok(None);
        };
        FileExt::lock_exclusive(&lock.file).map_err(|source| LogSinkError::Lock {
            path: lock.path.clone(),
            source,
        })?;
        Ok(Some(Exclusive(lock)))
    }

    fn hold_file_lock_or_warn(&self) -> Option<Exclusive<'_>> {
        self.hold_file_lock()
            .unwrap_or_else(|err| {
                tracing::warn!(error = %err, "writing terminal log without a lock");
                None
            })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_synced(&self) -> MutexGuard<'_, Inner> {
        let mut inner = self.lock();
        if inner.file.is_some() {
            let _held = self.hold_file_lock_or_warn();
            if let Err(err) = self.sync_with_disk(&mut inner) {
                tracing::warn!(error = %err, "failed to reload terminal log");
            }
        }
        inner
    }
}

impl LineSink for LogSink {
    fn append(&self, line: &str) {
        self.push_lines(&[line.to_string()]);
    }

    fn append_batch(&self, lines: &[String]) {
        if !lines.is_empty() {
            self.push_lines(lines);
        }
    }
}

fn open_append(path: &Path) -> Result<File, LogSinkError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| LogSinkError::Write {
            path: path.to_path_buf(),
            source,
        })
}

/// The last `max_lines` lines of the file at `path` and its total line count.
fn read_tail(path: &Path, max_lines: usize) -> Result<(VecDeque<String>, usize), LogSinkError> {
    let mut tail = VecDeque::new();
    let mut total = 0;
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok((tail, total)),
        Err(source) => {
            return Err(LogSinkError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    for line in BufReader::new(file).split(b'\n') {
        let line = line.map_err(|source| LogSinkError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        tail.push_back(String::from_utf8_lossy(&line).into_owned());
        total += 1;
        if tail.len() > max_lines {
            tail.pop_front();
        }
    }
    Ok((tail, total))
}

/// Replace the file at `path` with `lines` via a sibling temp file.
fn rewrite(path: &Path, lines: &VecDeque<String>) -> Result<(), LogSinkError> {
    let tmp = path.with_extension("log.tmp");
    let write_err = |source: std::io::Error| LogSinkError::Write {
        path: tmp.clone(),
        source,
    };
    let mut file = File::create(&tmp).map_err(write_err)?;
    let mut buf = String::new();
    for line in lines {
        buf.push_str(line);
        buf.push('\n');
    }
    file.write_all(buf.as_bytes()).map_err(write_err)?;
    file.sync_all().map_err(write_err)?;
    fs::rename(&tmp, path).map_err(|source| LogSinkError::Write {
        path: path.to_path_buf(),
        source,
    })
}
