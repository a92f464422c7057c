//! In-memory transaction journal
//!
//! Each host mutation appends the inverse it needs, together with whatever
//! prior value it captured, before or right after the mutation is made.
//! Rollback replays the inverses newest-first. Nothing here ever aborts a
//! replay: failures are collected and reported.

use crate::command::{run_with_retry, CommandRunner, CommandSpec};
use crate::error::{Result, RwtError};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// How to undo a single mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Undo {
    /// Run an inverse command
    Command(CommandSpec),
    /// Run an inverse command, retrying up to the given number of attempts
    Retried(CommandSpec, u32),
    /// Write back prior content, or delete the file if it did not exist
    RestoreFile {
        path: PathBuf,
        prior: Option<Vec<u8>>,
    },
    /// Delete a file the session created
    RemoveFile(PathBuf),
    /// Delete a directory the session created, if it is still empty
    RemoveDir(PathBuf),
    /// Restore or remove a process environment variable
    RestoreEnv { key: String, prior: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub label: String,
    pub undo: Undo,
}

/// Ordered log of applied mutations
#[derive(Debug, Default)]
pub struct Journal {
    entries: Vec<JournalEntry>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, label: impl Into<String>, undo: Undo) {
        let label = label.into();
        log::debug!("journal: {label}");
        self.entries.push(JournalEntry { label, undo });
    }

    /// Record an inverse at `index`, so it replays after every entry
    /// recorded from there on
    pub fn insert(&mut self, index: usize, label: impl Into<String>, undo: Undo) {
        let label = label.into();
        log::debug!("journal: {label}");
        let index = index.min(self.entries.len());
        self.entries.insert(index, JournalEntry { label, undo });
    }

    /// Snapshot a file, then write new content. The snapshot goes into the
    /// journal before the write so an interrupted write is still undone.
    /// Parent directories created on the way are removed again on rollback,
    /// after the file.
    pub fn write_file(&mut self, label: impl Into<String>, path: &Path, content: &[u8]) -> Result<()> {
        let label = label.into();
        let prior = read_optional(path)?;

        if let Some(parent) = path.parent() {
            for dir in missing_dirs(parent) {
                self.record(format!("{label}: create {}", dir.display()), Undo::RemoveDir(dir));
            }
        }
        self.record(
            label,
            Undo::RestoreFile {
                path: path.to_path_buf(),
                prior,
            },
        );
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    /// Set a process environment variable, remembering its prior value
    pub fn set_env(&mut self, key: &str, value: &str) {
        let prior = std::env::var(key).ok();
        self.record(
            format!("set {key}"),
            Undo::RestoreEnv {
                key: key.to_string(),
                prior,
            },
        );
        std::env::set_var(key, value);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Replay every inverse newest-first and empty the journal. Returns the
    /// steps that failed.
    pub fn rollback(&mut self, runner: &dyn CommandRunner) -> Vec<RwtError> {
        let mut failures = Vec::new();

        while let Some(entry) = self.entries.pop() {
            log::debug!("undo: {}", entry.label);
            if let Err(e) = undo(runner, &entry.undo) {
                log::warn!("Rollback step '{}' failed: {e}", entry.label);
                failures.push(RwtError::RollbackStep(format!("{}: {e}", entry.label)));
            }
        }

        failures
    }
}

fn undo(runner: &dyn CommandRunner, undo: &Undo) -> Result<()> {
    match undo {
        Undo::Command(spec) => runner.run_checked(spec).map(|_| ()),
        Undo::Retried(spec, attempts) => run_with_retry(runner, spec, *attempts).map(|_| ()),
        Undo::RestoreFile { path, prior: Some(content) } => {
            fs::write(path, content)?;
            Ok(())
        }
        Undo::RestoreFile { path, prior: None } | Undo::RemoveFile(path) => remove_if_exists(path),
        Undo::RemoveDir(path) => remove_dir_if_empty(path),
        Undo::RestoreEnv { key, prior } => {
            match prior {
                Some(value) => std::env::set_var(key, value),
                None => std::env::remove_var(key),
            }
            Ok(())
        }
    }
}

/// Read a file, mapping "not found" to `None`
pub fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Ancestors of `dir` (itself included) that do not exist yet, outermost
/// first
fn missing_dirs(dir: &Path) -> Vec<PathBuf> {
    let mut missing: Vec<PathBuf> = dir
        .ancestors()
        .take_while(|d| !d.as_os_str().is_empty() && !d.exists())
        .map(Path::to_path_buf)
        .collect();
    missing.reverse();
    missing
}

/// Remove a directory unless something else has been put in it since
fn remove_dir_if_empty(path: &Path) -> Result<()> {
    let mut entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if entries.next().is_some() {
        log::debug!("Keeping {}: not empty", path.display());
        return Ok(());
    }
    fs::remove_dir(path)?;
    Ok(())
}

pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Single-shot flag: only the first caller gets to run rollback
#[derive(Debug, Default)]
pub struct RollbackGuard {
    started: AtomicBool,
}

impl RollbackGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` exactly once
    pub fn try_begin(&self) -> bool {
        self.started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}
