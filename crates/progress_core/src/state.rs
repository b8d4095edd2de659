use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ArtifactKind, StageName, StepStatus};

/// Identifies one workspace; the key of a progress session.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceId(String);

impl WorkspaceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one run of the generation pipeline within a workspace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactSummary {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_count: Option<u32>,
}

/// One entry of the append-only error log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageName>,
    pub message: String,
}

impl StageError {
    pub fn new(stage: Option<StageName>, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

/// Reconciled view of one job.
///
/// `steps` always carries every stage. A `sequence_number` of zero means the
/// producer did not number its updates; `observed_at` then decides recency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressState {
    pub job_id: JobId,
    pub filename: String,
    pub steps: BTreeMap<StageName, StepStatus>,
    pub errors: Vec<StageError>,
    pub completed_artifacts: BTreeMap<ArtifactKind, ArtifactSummary>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub sequence_number: u64,
    pub observed_at: DateTime<Utc>,
}

impl ProgressState {
    /// A fresh job with every stage pending.
    pub fn new(job_id: JobId, filename: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            filename: filename.into(),
            steps: StageName::ALL
                .into_iter()
                .map(|stage| (stage, StepStatus::Pending))
                .collect(),
            errors: Vec::new(),
            completed_artifacts: BTreeMap::new(),
            started_at,
            completed_at: None,
            sequence_number: 0,
            observed_at: started_at,
        }
    }

    pub fn status(&self, stage: StageName) -> StepStatus {
        self.steps.get(&stage).copied().unwrap_or_default()
    }

    pub fn is_terminal(&self) -> bool {
        self.completed_at.is_some()
    }

    /// True once every non-skipped generator has completed or errored.
    pub fn cleanup_reachable(&self) -> bool {
        StageName::FAN_OUT
            .into_iter()
            .map(|stage| self.status(stage))
            .all(StepStatus::is_terminal)
    }

    /// True when a stage before the fan-out has failed.
    pub fn gate_failed(&self) -> bool {
        StageName::ALL
            .into_iter()
            .filter(|stage| stage.is_gate())
            .any(|stage| self.status(stage) == StepStatus::Error)
    }

    /// Whether the pipeline has nothing left to run.
    ///
    /// Siblings never short-circuit each other; only a gate failure ends the
    /// job early.
    pub fn pipeline_settled(&self) -> bool {
        if self.gate_failed() {
            return true;
        }
        self.status(StageName::Cleanup).is_terminal()
            && StageName::ALL
                .into_iter()
                .all(|stage| self.status(stage).is_terminal())
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
            || StageName::ALL
                .into_iter()
                .any(|stage| self.status(stage) == StepStatus::Error)
    }

    /// Fills in any stage missing from `steps`.
    pub(crate) fn normalize_steps(&mut self) {
        for stage in StageName::ALL {
            self.steps.entry(stage).or_insert(StepStatus::Pending);
        }
    }
}
