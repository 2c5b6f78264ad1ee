//! Run state and the in-process run store.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use genpipe::{Report, Scenario};

use crate::state::{RunStage, StageMachine, TransitionRecord};

/// One workflow run. Mutated only by its pipeline task; everyone else
/// reads immutable [`RunSnapshot`]s.
pub struct Run {
    pub id: Uuid,
    pub requirements: String,
    pub max_attempts: u32,
    pub machine: StageMachine,
    pub language: Option<String>,
    pub product_name: Option<String>,
    pub scenarios: Vec<Scenario>,
    pub progress_percent: u8,
    pub report: Option<Report>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(id: Uuid, requirements: String, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id,
            requirements,
            max_attempts,
            machine: StageMachine::new(),
            language: None,
            product_name: None,
            scenarios: Vec::new(),
            progress_percent: 0,
            report: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn stage(&self) -> RunStage {
        self.machine.current()
    }

    /// Point-in-time copy of everything a status consumer may see.
    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            id: self.id,
            stage: self.stage(),
            progress_percent: self.progress_percent,
            language: self.language.clone(),
            product_name: self.product_name.clone(),
            scenarios: self.scenarios.clone(),
            transitions: self.machine.log().to_vec(),
            report: self.report.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Immutable view of a run, detached from the live state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub id: Uuid,
    pub stage: RunStage,
    pub progress_percent: u8,
    pub language: Option<String>,
    pub product_name: Option<String>,
    pub scenarios: Vec<Scenario>,
    pub transitions: Vec<TransitionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<Report>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}

pub type SharedRun = Arc<RwLock<Run>>;

/// In-process registry of runs, keyed by id.
#[derive(Clone, Default)]
pub struct RunStore {
    runs: Arc<RwLock<HashMap<Uuid, SharedRun>>>,
}

impl RunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, run: Run) -> SharedRun {
        let id = run.id;
        let shared = Arc::new(RwLock::new(run));
        self.runs.write().await.insert(id, shared.clone());
        shared
    }

    pub async fn get(&self, id: Uuid) -> Option<SharedRun> {
        self.runs.read().await.get(&id).cloned()
    }

    pub async fn snapshot(&self, id: Uuid) -> Option<RunSnapshot> {
        let run = self.get(id).await?;
        let snapshot = run.read().await.snapshot();
        Some(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_round_trip() {
        let store = RunStore::new();
        let id = Uuid::new_v4();
        store.insert(Run::new(id, "reqs".into(), 3)).await;

        let snapshot = store.snapshot(id).await.unwrap();
        assert_eq!(snapshot.id, id);
        assert_eq!(snapshot.stage, RunStage::Pending);
        assert!(!snapshot.is_terminal());
        assert!(store.snapshot(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn snapshot_is_detached_from_live_state() {
        let store = RunStore::new();
        let id = Uuid::new_v4();
        let shared = store.insert(Run::new(id, "reqs".into(), 3)).await;

        let before = store.snapshot(id).await.unwrap();
        {
            let mut run = shared.write().await;
            run.machine.advance(RunStage::Analyzing, None).unwrap();
            run.progress_percent = 5;
        }
        assert_eq!(before.stage, RunStage::Pending);
        assert_eq!(before.progress_percent, 0);

        let after = store.snapshot(id).await.unwrap();
        assert_eq!(after.stage, RunStage::Analyzing);
    }
}
