//! Domain implementations
//!
//! `database` and `dependencies` run the configured shell commands.
//! `files` and `configuration` restore a directory tree from a known-good
//! snapshot, copying the live tree aside first and checking the result by
//! SHA-256.

use super::exclusions::ExclusionSet;
use super::procedure::DomainRollback;
use crate::process;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use codespace_common::config::{ProcedureConfig, ProceduresConfig, SnapshotPaths};
use codespace_common::RollbackDomain;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Handlers for every enabled procedure
pub fn build_domains(procedures: &ProceduresConfig) -> Result<Vec<Arc<dyn DomainRollback>>> {
    let mut handlers: Vec<Arc<dyn DomainRollback>> = Vec::new();
    for (domain, config) in procedures.in_order() {
        if !config.enabled {
            continue;
        }
        let handler: Arc<dyn DomainRollback> = match domain {
            RollbackDomain::Database | RollbackDomain::Dependencies => {
                Arc::new(CommandDomain::new(domain, config))
            }
            RollbackDomain::Files | RollbackDomain::Configuration => {
                let paths = config
                    .paths
                    .as_ref()
                    .ok_or_else(|| anyhow!("{} procedure needs paths", domain))?;
                Arc::new(SnapshotDomain::new(domain, paths, &config.exclude_patterns)?)
            }
        };
        handlers.push(handler);
    }
    Ok(handlers)
}

// ============================================================================
// Command driven
// ============================================================================

pub struct CommandDomain {
    domain: RollbackDomain,
    backup: Option<String>,
    rollback: Option<String>,
    verify: Option<String>,
    timeout: Duration,
}

impl CommandDomain {
    pub fn new(domain: RollbackDomain, config: &ProcedureConfig) -> Self {
        Self {
            domain,
            backup: config.commands.backup.clone(),
            rollback: config.commands.rollback.clone(),
            verify: config.commands.verify.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

#[async_trait]
impl DomainRollback for CommandDomain {
    fn domain(&self) -> RollbackDomain {
        self.domain
    }

    /// The backup command's last stdout line names the backup location
    async fn backup(&self) -> Result<String> {
        let script = self
            .backup
            .as_deref()
            .ok_or_else(|| anyhow!("no backup command configured"))?;
        let output = process::run_shell(script, self.timeout).await?;
        Ok(output
            .lines()
            .last()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .unwrap_or(script)
            .to_string())
    }

    async fn rollback(&self) -> Result<()> {
        let script = self
            .rollback
            .as_deref()
            .ok_or_else(|| anyhow!("no rollback command configured"))?;
        info!(domain = %self.domain, "Running: {}", script);
        process::run_shell(script, self.timeout).await?;
        Ok(())
    }

    /// Without a verify command the rollback exit status is the verification
    async fn verify(&self) -> Result<()> {
        match self.verify.as_deref() {
            Some(script) => {
                process::run_shell(script, self.timeout).await?;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

// ============================================================================
// Snapshot driven
// ============================================================================

/// Tree walking and copying run on the blocking pool
pub struct SnapshotDomain {
    domain: RollbackDomain,
    tree: Arc<SnapshotTree>,
}

struct SnapshotTree {
    domain: RollbackDomain,
    root: PathBuf,
    snapshot_dir: PathBuf,
    backup_dir: PathBuf,
    exclusions: ExclusionSet,
}

impl SnapshotDomain {
    pub fn new(domain: RollbackDomain, paths: &SnapshotPaths, exclude_patterns: &[String]) -> Result<Self> {
        paths
            .check_disjoint()
            .with_context(|| format!("{} procedure paths", domain))?;
        Ok(Self {
            domain,
            tree: Arc::new(SnapshotTree {
                domain,
                root: paths.root.clone(),
                snapshot_dir: paths.snapshot_dir.clone(),
                backup_dir: paths.backup_dir.clone(),
                exclusions: ExclusionSet::new(exclude_patterns)?,
            }),
        })
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SnapshotTree) -> Result<T> + Send + 'static,
    {
        let tree = self.tree.clone();
        tokio::task::spawn_blocking(move || op(&tree))
            .await
            .with_context(|| format!("{} snapshot task failed", self.domain))?
    }
}

impl SnapshotTree {
    /// Relative path -> SHA-256 of every non-excluded file under `dir`
    fn checksums(&self, dir: &Path) -> Result<BTreeMap<PathBuf, String>> {
        let mut sums = BTreeMap::new();
        for (relative, path) in self.files(dir)? {
            sums.insert(relative, sha256_file(&path)?);
        }
        Ok(sums)
    }

    fn files(&self, dir: &Path) -> Result<Vec<(PathBuf, PathBuf)>> {
        let mut files = Vec::new();
        if !dir.exists() {
            return Ok(files);
        }
        let walker = WalkDir::new(dir).into_iter().filter_entry(|entry| {
            entry
                .path()
                .strip_prefix(dir)
                .map(|rel| !self.exclusions.is_excluded(rel))
                .unwrap_or(true)
        });
        for entry in walker {
            let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(dir)?.to_path_buf();
            files.push((relative, entry.path().to_path_buf()));
        }
        Ok(files)
    }

    fn backup(&self) -> Result<String> {
        let destination = self.backup_dir.join(format!(
            "{}-{}",
            self.domain,
            Utc::now().format("%Y%m%d-%H%M%S%.3f")
        ));
        fs::create_dir_all(&destination)
            .with_context(|| format!("Failed to create {}", destination.display()))?;

        if self.root.exists() {
            for entry in WalkDir::new(&self.root) {
                let entry = entry.with_context(|| format!("Failed to walk {}", self.root.display()))?;
                let relative = entry.path().strip_prefix(&self.root)?;
                let target = destination.join(relative);
                if entry.file_type().is_dir() {
                    fs::create_dir_all(&target)?;
                } else if entry.file_type().is_file() {
                    fs::copy(entry.path(), &target)
                        .with_context(|| format!("Failed to back up {}", entry.path().display()))?;
                }
            }
        }

        Ok(destination.display().to_string())
    }

    fn restore(&self) -> Result<usize> {
        if !self.snapshot_dir.is_dir() {
            bail!("snapshot {} does not exist", self.snapshot_dir.display());
        }

        let wanted = self.files(&self.snapshot_dir)?;
        for (relative, source) in &wanted {
            let target = self.root.join(relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            fs::copy(source, &target)
                .with_context(|| format!("Failed to restore {}", target.display()))?;
        }

        // Drop files that did not exist in the known-good state
        let mut removed = 0;
        for (relative, path) in self.files(&self.root)? {
            if !self.snapshot_dir.join(&relative).exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
                removed += 1;
            }
        }
        debug!(domain = %self.domain, "Restored {} files, removed {}", wanted.len(), removed);
        Ok(wanted.len())
    }

    fn verify(&self) -> Result<()> {
        let expected = self.checksums(&self.snapshot_dir)?;
        let actual = self.checksums(&self.root)?;

        for (relative, sum) in &expected {
            match actual.get(relative) {
                Some(found) if found == sum => {}
                Some(_) => bail!("checksum mismatch: {}", relative.display()),
                None => bail!("missing after rollback: {}", relative.display()),
            }
        }
        if let Some(extra) = actual.keys().find(|k| !expected.contains_key(*k)) {
            bail!("unexpected file after rollback: {}", extra.display());
        }
        Ok(())
    }
}

#[async_trait]
impl DomainRollback for SnapshotDomain {
    fn domain(&self) -> RollbackDomain {
        self.domain
    }

    async fn backup(&self) -> Result<String> {
        self.blocking(|tree| tree.backup()).await
    }

    async fn rollback(&self) -> Result<()> {
        let restored = self.blocking(|tree| tree.restore()).await?;
        info!(domain = %self.domain, "Restored {} files from {}", restored, self.tree.snapshot_dir.display());
        Ok(())
    }

    async fn verify(&self) -> Result<()> {
        self.blocking(|tree| tree.verify()).await
    }
}

fn sha256_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}
