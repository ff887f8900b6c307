//! Applier that writes rendered files to disk and reloads Traffic Server.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{ApplyError, ApplyReport, ConfigApplier, ProxyControl};
use crate::compiler::CompiledSnapshot;
use crate::compiler::render::{CERTS_DIR, SNIPPETS_DIR};

/// Where and as whom the applier writes.
#[derive(Debug, Clone)]
pub struct FileApplierSettings {
    /// Name of this target in logs, metrics and status.
    pub target: String,
    /// Traffic Server configuration directory.
    pub config_dir: PathBuf,
}

impl Default for FileApplierSettings {
    fn default() -> Self {
        Self {
            target: "local".to_string(),
            config_dir: PathBuf::from("/opt/ats/etc/trafficserver"),
        }
    }
}

/// What this applier last put on disk and into the proxy.
#[derive(Debug, Default)]
struct AppliedState {
    /// Digest of the last snapshot that was fully applied and reloaded.
    digest: Option<String>,
    /// Contents of every managed file currently on disk.
    files: BTreeMap<String, String>,
    records: BTreeMap<String, String>,
    /// Whether files left by an earlier process have been picked up.
    seeded: bool,
}

/// Writes snapshots into a config directory.
///
/// Every file is written to `<file>.tmp`, synced and renamed over the
/// target so the proxy never reads a partial file. Files a previous
/// snapshot created and the current one no longer has are removed.
pub struct FileApplier<C> {
    settings: FileApplierSettings,
    control: C,
    state: Mutex<AppliedState>,
}

impl<C: ProxyControl> FileApplier<C> {
    pub fn new(settings: FileApplierSettings, control: C) -> Self {
        Self {
            settings,
            control,
            state: Mutex::new(AppliedState::default()),
        }
    }

    pub fn control(&self) -> &C {
        &self.control
    }

    fn path_of(&self, relative: &str) -> PathBuf {
        self.settings.config_dir.join(relative)
    }

    /// Current on-disk contents of a managed file, if any.
    async fn current(&self, state: &AppliedState, relative: &str) -> Option<String> {
        if let Some(known) = state.files.get(relative) {
            return Some(known.clone());
        }
        tokio::fs::read_to_string(self.path_of(relative)).await.ok()
    }

    /// Adopt certificate and snippet files already in the managed
    /// directories, so ones the current snapshot lacks are removed.
    async fn seed(&self, state: &mut AppliedState) {
        for dir in [CERTS_DIR, SNIPPETS_DIR] {
            let mut entries = match tokio::fs::read_dir(self.path_of(dir)).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => {
                    warn!(dir, error = %err, "Failed to scan managed directory");
                    continue;
                }
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let is_file = entry.file_type().await.is_ok_and(|t| t.is_file());
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                if !is_file || name.ends_with(".tmp") {
                    continue;
                }
                let relative = format!("{dir}/{name}");
                if let Ok(contents) = tokio::fs::read_to_string(entry.path()).await {
                    debug!(path = %relative, "Adopting existing managed file");
                    state.files.entry(relative).or_insert(contents);
                }
            }
        }
        state.seeded = true;
    }

    /// Put `previous` back for every path, removing files that did not exist.
    async fn restore(&self, previous: &BTreeMap<String, Option<String>>) {
        for (relative, contents) in previous {
            let path = self.path_of(relative);
            let result = match contents {
                Some(contents) => write_atomic(&path, contents).await,
                None => remove_file(&path).await,
            };
            if let Err(err) = result {
                warn!(path = %path.display(), error = %err, "Failed to restore file");
            }
        }
    }
}

#[async_trait]
impl<C: ProxyControl> ConfigApplier for FileApplier<C> {
    fn target(&self) -> &str {
        &self.settings.target
    }

    async fn apply(&self, snapshot: &CompiledSnapshot) -> Result<ApplyReport, ApplyError> {
        let mut state = self.state.lock().await;
        if state.digest.as_deref() == Some(snapshot.digest.as_str()) {
            debug!(
                proxy = %self.settings.target,
                generation = snapshot.generation,
                "Snapshot already applied"
            );
            return Ok(ApplyReport {
                generation: snapshot.generation,
                changed: false,
                proxy_reload_latency: None,
            });
        }

        if !state.seeded {
            self.seed(&mut state).await;
        }

        // Previous contents of every path this apply touches, for rollback.
        let mut previous: BTreeMap<String, Option<String>> = BTreeMap::new();
        let mut changed = Vec::new();
        for (relative, contents) in &snapshot.files {
            let current = self.current(&state, relative).await;
            if current.as_deref() != Some(contents.as_str()) {
                previous.insert(relative.clone(), current);
                changed.push((relative, contents));
            }
        }
        let stale: Vec<String> = state
            .files
            .keys()
            .filter(|relative| !snapshot.files.contains_key(*relative))
            .cloned()
            .collect();
        for relative in &stale {
            previous.insert(relative.clone(), state.files.get(relative).cloned());
        }

        for (relative, contents) in &changed {
            let path = self.path_of(relative);
            if let Err(source) = write_atomic(&path, contents).await {
                self.restore(&previous).await;
                return Err(ApplyError::WriteFailed { path, source });
            }
        }
        for relative in &stale {
            let path = self.path_of(relative);
            if let Err(source) = remove_file(&path).await {
                self.restore(&previous).await;
                return Err(ApplyError::WriteFailed { path, source });
            }
        }

        if let Err(err) = self.control.verify().await {
            warn!(
                proxy = %self.settings.target,
                generation = snapshot.generation,
                error = %err,
                "Proxy rejected configuration, restoring previous files"
            );
            self.restore(&previous).await;
            return Err(ApplyError::RejectedConfig(err.to_string()));
        }

        // The new files are live on disk from here on.
        state.files = snapshot.files.clone();

        for (name, value) in &snapshot.config.records {
            if state.records.get(name) == Some(value) {
                continue;
            }
            self.control
                .set_record(name, value)
                .await
                .map_err(|e| ApplyError::ReloadFailed(e.to_string()))?;
            state.records.insert(name.clone(), value.clone());
        }
        let dropped: Vec<String> = state
            .records
            .keys()
            .filter(|name| !snapshot.config.records.contains_key(*name))
            .cloned()
            .collect();
        for name in dropped {
            // traffic_ctl cannot unset a record; the override stays until restart
            info!(record = %name, "Record override removed, value persists until restart");
            state.records.remove(&name);
        }

        let started = Instant::now();
        self.control
            .reload()
            .await
            .map_err(|e| ApplyError::ReloadFailed(e.to_string()))?;
        let latency = started.elapsed();

        state.digest = Some(snapshot.digest.clone());
        info!(
            proxy = %self.settings.target,
            generation = snapshot.generation,
            files_written = changed.len(),
            files_removed = stale.len(),
            reload_ms = latency.as_millis(),
            "Applied configuration"
        );
        Ok(ApplyReport {
            generation: snapshot.generation,
            changed: true,
            proxy_reload_latency: Some(latency),
        })
    }
}

/// Write `contents` to `<path>.tmp`, sync it, and rename it over `path`.
pub(crate) async fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(contents.as_bytes()).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await
}

async fn remove_file(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}
