use crate::{JobId, PayloadError};

/// What the reconciler did with one incoming update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The state changed and should be published.
    Accepted,
    /// The update was valid but added nothing new.
    Unchanged,
    /// The update is older than what is already known.
    Stale,
    /// Not a progress update (other event names).
    Ignored,
    /// The update belongs to a different job than the current lineage.
    ForeignJob(JobId),
    /// The payload was malformed; the state is untouched.
    Dropped(PayloadError),
}

impl Outcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Outcome::Accepted)
    }
}
