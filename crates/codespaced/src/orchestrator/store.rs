//! Environment records and per-environment locks
//!
//! On disk every environment is `<state_dir>/<name>.json`, replaced atomically
//! on save, so the daemon and every `codespacectl` invocation read one shared
//! lifecycle. Mutating operations hold an exclusive `flock` on
//! `<state_dir>/<name>.lock` on top of an in-process mutex; the file lock is
//! what serialises separate processes.
//!
//! The in-memory store keeps the same contract inside one process and backs
//! the unit tests.

use anyhow::{Context, Result};
use codespace_common::Environment;
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

/// Exclusive hold on one environment; dropping it releases both locks
pub struct EnvironmentGuard {
    _local: OwnedMutexGuard<()>,
    _file: Option<File>,
}

pub struct EnvironmentStore {
    dir: Option<PathBuf>,
    memory: Mutex<HashMap<String, Environment>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl EnvironmentStore {
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            memory: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn on_disk(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            ..Self::in_memory()
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn local_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub async fn load(&self, name: &str) -> Result<Option<Environment>> {
        let Some(dir) = &self.dir else {
            let memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
            return Ok(memory.get(name).cloned());
        };
        let path = record_path(dir, name);
        tokio::task::spawn_blocking(move || read_record(&path))
            .await
            .context("Environment load task failed")?
    }

    pub async fn save(&self, env: &Environment) -> Result<()> {
        let Some(dir) = &self.dir else {
            let mut memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
            memory.insert(env.name.clone(), env.clone());
            return Ok(());
        };
        let dir = dir.clone();
        let env = env.clone();
        tokio::task::spawn_blocking(move || write_record(&dir, &env))
            .await
            .context("Environment save task failed")?
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        let Some(dir) = &self.dir else {
            self.memory
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(name);
            return Ok(());
        };
        let path = record_path(dir, name);
        tokio::task::spawn_blocking(move || match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        })
        .await
        .context("Environment remove task failed")?
    }

    /// Wait for exclusive ownership of `name`
    pub async fn lock(&self, name: &str) -> Result<EnvironmentGuard> {
        let local = self.local_lock(name).lock_owned().await;
        let file = match &self.dir {
            Some(dir) => {
                let dir = dir.clone();
                let name = name.to_string();
                let file = tokio::task::spawn_blocking(move || {
                    let file = open_lock_file(&dir, &name)?;
                    file.lock_exclusive()
                        .with_context(|| format!("Failed to lock environment {}", name))?;
                    Ok::<_, anyhow::Error>(file)
                })
                .await
                .context("Environment lock task failed")??;
                Some(file)
            }
            None => None,
        };
        Ok(EnvironmentGuard {
            _local: local,
            _file: file,
        })
    }

    /// Ownership of `name` if nobody holds it right now
    pub fn try_lock(&self, name: &str) -> Result<Option<EnvironmentGuard>> {
        let Ok(local) = self.local_lock(name).try_lock_owned() else {
            return Ok(None);
        };
        let file = match &self.dir {
            Some(dir) => {
                let file = open_lock_file(dir, name)?;
                match file.try_lock_exclusive() {
                    Ok(()) => Some(file),
                    Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                        debug!(environment = %name, "Locked by another process");
                        return Ok(None);
                    }
                    Err(e) => {
                        return Err(e).with_context(|| format!("Failed to lock environment {}", name))
                    }
                }
            }
            None => None,
        };
        Ok(Some(EnvironmentGuard {
            _local: local,
            _file: file,
        }))
    }
}

fn record_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.json", name))
}

fn open_lock_file(dir: &Path, name: &str) -> Result<File> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let path = dir.join(format!("{}.lock", name));
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("Failed to open {}", path.display()))
}

fn read_record(path: &Path) -> Result<Option<Environment>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    let env = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(env))
}

fn write_record(dir: &Path, env: &Environment) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let json = serde_json::to_vec_pretty(env)?;
    let mut temp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    temp.write_all(&json)?;
    temp.as_file().sync_all()?;
    let path = record_path(dir, &env.name);
    temp.persist(&path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
