//! Decoding of push payloads and snapshot records.
//!
//! Both shapes share the step and error encodings: a step is either a bare
//! status string or an object with a `status` (and optional `error`), an error
//! is either a bare message or an object with `stage` and `message`.
use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::{
    ArtifactKind, ArtifactSummary, JobId, ProgressState, RawEvent, StageError, StageName,
    StepStatus,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("payload does not decode: {0}")]
    Invalid(String),
    #[error("unknown stage {0:?}")]
    UnknownStage(String),
    #[error("unknown status {status:?} for stage {stage}")]
    UnknownStatus { stage: StageName, status: String },
    #[error("unknown artifact kind {0:?}")]
    UnknownArtifact(String),
    #[error("payload carries no job id")]
    MissingJobId,
    #[error("payload carries no progress fields")]
    Empty,
}

/// Decoded incremental update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressDelta {
    pub job_id: Option<JobId>,
    /// `None` when the producer did not number the update.
    pub sequence_number: Option<u64>,
    pub filename: Option<String>,
    pub steps: BTreeMap<StageName, StepStatus>,
    pub errors: Vec<StageError>,
    pub artifacts: BTreeMap<ArtifactKind, ArtifactSummary>,
    pub started_at: Option<DateTime<Utc>>,
    /// Producer timestamp, or local receipt time when absent.
    pub timestamp: DateTime<Utc>,
}

impl ProgressDelta {
    pub fn from_event(event: &RawEvent) -> Result<Self, PayloadError> {
        if !event.payload.is_object() {
            return Err(PayloadError::NotAnObject);
        }
        let wire: DeltaWire = serde_json::from_value(event.payload.clone())
            .map_err(|err| PayloadError::Invalid(err.to_string()))?;

        let (steps, mut errors) = decode_steps(wire.steps)?;
        for entry in wire.error.into_iter().chain(wire.errors) {
            errors.push(entry.decode()?);
        }
        let artifacts = decode_artifacts(wire.artifacts)?;

        if steps.is_empty() && errors.is_empty() && artifacts.is_empty() && wire.filename.is_none()
        {
            return Err(PayloadError::Empty);
        }

        Ok(Self {
            job_id: wire.job_id.map(JobId::new),
            sequence_number: wire.sequence_number.filter(|seq| *seq > 0),
            filename: wire.filename,
            steps,
            errors,
            artifacts,
            started_at: wire.started_at,
            timestamp: wire.timestamp.unwrap_or(event.received_at),
        })
    }

    /// Materialises this delta over an all-pending job.
    pub fn into_baseline(self) -> Result<ProgressState, PayloadError> {
        let job_id = self.job_id.clone().ok_or(PayloadError::MissingJobId)?;
        let started_at = self.started_at.unwrap_or(self.timestamp);
        let mut state = ProgressState::new(job_id, "", started_at);
        state.observed_at = self.timestamp;
        crate::reconcile::merge_delta(&mut state, &self);
        state.sequence_number = self.sequence_number.unwrap_or(0);
        Ok(state)
    }
}

/// Decodes a snapshot record fetched from the system of record.
///
/// Missing timestamps fall back to `received_at`. A `completedAt` is kept only
/// when the steps agree that the pipeline has settled, and is filled in when
/// they do but the record omits it.
pub fn decode_snapshot(
    value: serde_json::Value,
    received_at: DateTime<Utc>,
) -> Result<ProgressState, PayloadError> {
    if !value.is_object() {
        return Err(PayloadError::NotAnObject);
    }
    let wire: SnapshotWire =
        serde_json::from_value(value).map_err(|err| PayloadError::Invalid(err.to_string()))?;
    let job_id = wire.job_id.ok_or(PayloadError::MissingJobId)?;

    let (steps, mut errors) = decode_steps(wire.steps)?;
    let mut decoded_errors = wire
        .errors
        .into_iter()
        .map(ErrorWire::decode)
        .collect::<Result<Vec<_>, _>>()?;
    // Step-level messages are already part of a persisted log when one exists.
    if decoded_errors.is_empty() {
        decoded_errors.append(&mut errors);
    }

    let observed_at = wire.observed_at.unwrap_or(received_at);
    let mut state = ProgressState::new(
        JobId::new(job_id),
        wire.filename.unwrap_or_default(),
        wire.started_at.unwrap_or(observed_at),
    );
    state.steps.extend(steps);
    state.errors = decoded_errors;
    state.completed_artifacts = decode_artifacts(wire.completed_artifacts)?;
    state.sequence_number = wire.sequence_number.unwrap_or(0);
    state.observed_at = observed_at;
    state.completed_at = if state.pipeline_settled() {
        Some(wire.completed_at.unwrap_or(observed_at))
    } else {
        None
    };
    Ok(state)
}

/// Byte-slice convenience over [`decode_snapshot`].
pub fn decode_snapshot_slice(
    bytes: &[u8],
    received_at: DateTime<Utc>,
) -> Result<ProgressState, PayloadError> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|err| PayloadError::Invalid(err.to_string()))?;
    decode_snapshot(value, received_at)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeltaWire {
    job_id: Option<String>,
    sequence_number: Option<u64>,
    filename: Option<String>,
    #[serde(default)]
    steps: BTreeMap<String, StepWire>,
    error: Option<ErrorWire>,
    #[serde(default)]
    errors: Vec<ErrorWire>,
    #[serde(default)]
    artifacts: BTreeMap<String, ArtifactSummary>,
    started_at: Option<DateTime<Utc>>,
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotWire {
    job_id: Option<String>,
    filename: Option<String>,
    #[serde(default)]
    steps: BTreeMap<String, StepWire>,
    #[serde(default)]
    errors: Vec<ErrorWire>,
    #[serde(default)]
    completed_artifacts: BTreeMap<String, ArtifactSummary>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    sequence_number: Option<u64>,
    observed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StepWire {
    Status(String),
    Detailed {
        status: String,
        #[serde(default)]
        error: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorWire {
    Message(String),
    Detailed {
        #[serde(default)]
        stage: Option<String>,
        message: String,
    },
}

impl ErrorWire {
    fn decode(self) -> Result<StageError, PayloadError> {
        match self {
            ErrorWire::Message(message) => Ok(StageError::new(None, message)),
            ErrorWire::Detailed { stage, message } => {
                let stage = stage.as_deref().map(parse_stage).transpose()?;
                Ok(StageError::new(stage, message))
            }
        }
    }
}

fn parse_stage(name: &str) -> Result<StageName, PayloadError> {
    StageName::from_str(name).map_err(PayloadError::UnknownStage)
}

fn decode_steps(
    raw: BTreeMap<String, StepWire>,
) -> Result<(BTreeMap<StageName, StepStatus>, Vec<StageError>), PayloadError> {
    let mut steps = BTreeMap::new();
    let mut errors = Vec::new();
    for (name, step) in raw {
        let stage = parse_stage(&name)?;
        let (status, error) = match step {
            StepWire::Status(status) => (status, None),
            StepWire::Detailed { status, error } => (status, error),
        };
        let status = StepStatus::from_str(&status)
            .map_err(|status| PayloadError::UnknownStatus { stage, status })?;
        steps.insert(stage, status);
        if let Some(message) = error {
            errors.push(StageError::new(Some(stage), message));
        }
    }
    Ok((steps, errors))
}

fn decode_artifacts(
    raw: BTreeMap<String, ArtifactSummary>,
) -> Result<BTreeMap<ArtifactKind, ArtifactSummary>, PayloadError> {
    raw.into_iter()
        .map(|(name, summary)| {
            ArtifactKind::from_str(&name)
                .map(|kind| (kind, summary))
                .map_err(PayloadError::UnknownArtifact)
        })
        .collect()
}
