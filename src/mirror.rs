//! Graph-database mirror.
//!
//! The mirror is a read-optimized copy of canonical rows. Writes are
//! best-effort: callers log failures and continue.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use pathweaver_core::models::{Activity, Concept, ConceptEdge, PathNodeActivity};

#[derive(Debug, Clone, Serialize)]
pub struct UserConceptState {
    pub user_id: Uuid,
    pub concept_id: Uuid,
    pub mastery: f64,
    pub confidence: f64,
}

#[async_trait]
pub trait GraphMirror: Send + Sync {
    async fn upsert_path_concept_graph(&self, path_id: Uuid, concepts: &[Concept], edges: &[ConceptEdge]) -> Result<()>;

    async fn upsert_user_concept_states(&self, user_id: Uuid, states: &[UserConceptState]) -> Result<()>;

    async fn upsert_path_activities_graph(
        &self,
        path_id: Uuid,
        activities: &[Activity],
        links: &[PathNodeActivity],
    ) -> Result<()>;
}

pub struct NoopMirror;

#[async_trait]
impl GraphMirror for NoopMirror {
    async fn upsert_path_concept_graph(&self, _: Uuid, _: &[Concept], _: &[ConceptEdge]) -> Result<()> {
        Ok(())
    }

    async fn upsert_user_concept_states(&self, _: Uuid, _: &[UserConceptState]) -> Result<()> {
        Ok(())
    }

    async fn upsert_path_activities_graph(&self, _: Uuid, _: &[Activity], _: &[PathNodeActivity]) -> Result<()> {
        Ok(())
    }
}

/// What a [`RecordingMirror`] saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorCall {
    ConceptGraph { path_id: Uuid, concepts: usize, edges: usize },
    UserStates { user_id: Uuid, states: usize },
    Activities { path_id: Uuid, activities: usize },
}

/// Mirror that records calls; optionally fails them.
#[derive(Default)]
pub struct RecordingMirror {
    calls: Mutex<Vec<MirrorCall>>,
    failing: AtomicBool,
}

impl RecordingMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<MirrorCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: MirrorCall) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("graph mirror unavailable");
        }
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
        Ok(())
    }
}

#[async_trait]
impl GraphMirror for RecordingMirror {
    async fn upsert_path_concept_graph(&self, path_id: Uuid, concepts: &[Concept], edges: &[ConceptEdge]) -> Result<()> {
        self.record(MirrorCall::ConceptGraph {
            path_id,
            concepts: concepts.len(),
            edges: edges.len(),
        })
    }

    async fn upsert_user_concept_states(&self, user_id: Uuid, states: &[UserConceptState]) -> Result<()> {
        self.record(MirrorCall::UserStates {
            user_id,
            states: states.len(),
        })
    }

    async fn upsert_path_activities_graph(
        &self,
        path_id: Uuid,
        activities: &[Activity],
        _links: &[PathNodeActivity],
    ) -> Result<()> {
        self.record(MirrorCall::Activities {
            path_id,
            activities: activities.len(),
        })
    }
}
