use std::fmt;

use progress_core::{ProgressState, ProgressSummary};

/// Health of the push connection for one workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    DisconnectedRetrying,
    Failed,
}

/// Where a progress session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Idle,
    /// First snapshot fetch in flight.
    Seeding,
    /// Push channel connected; no polling.
    Live,
    /// Push channel unavailable; snapshots are polled.
    Polling,
    /// The job has finished.
    Terminal,
}

/// One emission to consumers: always a complete replacement of earlier ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub state: ProgressState,
    pub summary: ProgressSummary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    Progress(ProgressUpdate),
    PhaseChanged(SessionPhase),
    /// Snapshot fetches keep failing; the last known state is still valid.
    Degraded {
        consecutive_failures: u32,
        last_error: FetchError,
    },
    /// A fetch succeeded again after a degraded period.
    Recovered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchError {
    pub kind: FailureKind,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for FetchError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    InvalidUrl,
    HttpStatus(u16),
    Timeout,
    TooLarge { max_bytes: u64, actual: Option<u64> },
    Malformed,
    Network,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::InvalidUrl => write!(f, "invalid url"),
            FailureKind::HttpStatus(code) => write!(f, "http status {code}"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::TooLarge { max_bytes, actual } => {
                write!(f, "response too large (max {max_bytes}, actual {actual:?})")
            }
            FailureKind::Malformed => write!(f, "malformed snapshot"),
            FailureKind::Network => write!(f, "network error"),
        }
    }
}
