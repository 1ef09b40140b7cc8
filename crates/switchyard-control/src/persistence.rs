//! Operational state that survives a control plane restart.
//!
//! Routes, scaling policies, deployment records and the snapshot generation
//! are written as one JSON document after every administrative change and
//! after every published snapshot, so the stored generation is the highest
//! one handed out. Module instances are not persisted; they re-register on
//! their own.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use switchyard_common::{unix_millis, DeploymentState, Result, Route, ScalingPolicy};

use crate::deployment::DeploymentOrchestrator;
use crate::scaling::ScalingController;
use crate::snapshot::SnapshotCell;

pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    /// Highest snapshot generation published; a restart continues above it.
    pub generation: u64,
    pub routes: Vec<Route>,
    #[serde(default)]
    pub scaling_policies: Vec<ScalingPolicy>,
    #[serde(default)]
    pub deployments: Vec<DeploymentState>,
    pub saved_at_ms: u64,
}

impl PersistedState {
    pub fn new(
        generation: u64,
        routes: Vec<Route>,
        scaling_policies: Vec<ScalingPolicy>,
        deployments: Vec<DeploymentState>,
    ) -> Self {
        Self {
            version: STATE_VERSION,
            generation,
            routes,
            scaling_policies,
            deployments,
            saved_at_ms: unix_millis(),
        }
    }
}

/// JSON state file written via temp file + rename.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    // serialises concurrent saves onto the same temp file
    write_lock: Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when no state has been saved yet.
    pub async fn load(&self) -> Result<Option<PersistedState>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, state: &PersistedState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), generation = state.generation, "state saved");
        Ok(())
    }
}

/// Writes the current control plane state to a [`StateStore`].
pub struct StatePersister {
    store: StateStore,
    // held from reading state to writing it, so the last write is the newest state
    saving: Mutex<()>,
    snapshots: SnapshotCell,
    scaling: Arc<ScalingController>,
    deployments: Arc<DeploymentOrchestrator>,
}

impl StatePersister {
    pub fn new(
        store: StateStore,
        snapshots: SnapshotCell,
        scaling: Arc<ScalingController>,
        deployments: Arc<DeploymentOrchestrator>,
    ) -> Self {
        Self {
            store,
            saving: Mutex::new(()),
            snapshots,
            scaling,
            deployments,
        }
    }

    /// A failed write is logged; the in-memory state stays authoritative.
    pub async fn save(&self) {
        let _saving = self.saving.lock().await;
        let snapshot = self.snapshots.load();
        let state = PersistedState::new(
            snapshot.generation,
            snapshot.routes.clone(),
            self.scaling.policies().await,
            self.deployments.all(),
        );
        if let Err(e) = self.store.save(&state).await {
            warn!(path = %self.store.path().display(), "failed to save state: {}", e);
        }
    }

    /// Saves after every published snapshot, including health-driven ones.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let persister = Arc::clone(self);
        let mut published = self.snapshots.subscribe();
        tokio::spawn(async move {
            while published.changed().await.is_ok() {
                persister.save().await;
            }
        })
    }
}
