//! Progress core: pipeline topology, reconciliation and summaries.
//!
//! Everything here is pure. IO, timers and transports live in
//! `progress_engine`.
mod msg;
mod outcome;
mod reconcile;
mod stage;
mod state;
mod summary;
mod wire;

pub use msg::{Incoming, RawEvent, ANALYSIS_PROGRESS_EVENT};
pub use outcome::Outcome;
pub use reconcile::apply;
pub use stage::{ArtifactKind, StageName, StepStatus};
pub use state::{ArtifactSummary, JobId, ProgressState, StageError, WorkspaceId};
pub use summary::{
    summarize, ProgressSummary, LABEL_COMPLETE, LABEL_COMPLETE_WITH_ERRORS, LABEL_FAILED,
};
pub use wire::{decode_snapshot, decode_snapshot_slice, PayloadError, ProgressDelta};
