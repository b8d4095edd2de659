use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One named unit of pipeline work.
///
/// Declaration order is topological order: `upload` and `fileAnalysis` run in
/// sequence, the three generators fan out concurrently after analysis, and
/// `cleanup` runs once they have all settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StageName {
    Upload,
    FileAnalysis,
    StudyGuide,
    Flashcards,
    Worksheet,
    Cleanup,
}

impl StageName {
    /// Every stage in topological order.
    pub const ALL: [StageName; 6] = [
        StageName::Upload,
        StageName::FileAnalysis,
        StageName::StudyGuide,
        StageName::Flashcards,
        StageName::Worksheet,
        StageName::Cleanup,
    ];

    /// The concurrently running generator stages.
    pub const FAN_OUT: [StageName; 3] = [
        StageName::StudyGuide,
        StageName::Flashcards,
        StageName::Worksheet,
    ];

    pub fn wire_name(self) -> &'static str {
        match self {
            StageName::Upload => "upload",
            StageName::FileAnalysis => "fileAnalysis",
            StageName::StudyGuide => "studyGuide",
            StageName::Flashcards => "flashcards",
            StageName::Worksheet => "worksheet",
            StageName::Cleanup => "cleanup",
        }
    }

    /// Human-readable label used while the stage is the current one.
    pub fn label(self) -> &'static str {
        match self {
            StageName::Upload => "Uploading file",
            StageName::FileAnalysis => "Analyzing file",
            StageName::StudyGuide => "Generating study guide",
            StageName::Flashcards => "Generating flashcards",
            StageName::Worksheet => "Generating worksheet",
            StageName::Cleanup => "Finalizing",
        }
    }

    pub fn is_fan_out(self) -> bool {
        Self::FAN_OUT.contains(&self)
    }

    /// Stages before the fan-out; an error here stops the whole pipeline.
    pub fn is_gate(self) -> bool {
        matches!(self, StageName::Upload | StageName::FileAnalysis)
    }

    /// Sequential predecessors that must have finished for this stage to start.
    ///
    /// `cleanup` deliberately has none: its siblings settle independently and
    /// are never inferred from it.
    pub fn implied_predecessors(self) -> &'static [StageName] {
        match self {
            StageName::Upload | StageName::Cleanup => &[],
            StageName::FileAnalysis => &[StageName::Upload],
            StageName::StudyGuide | StageName::Flashcards | StageName::Worksheet => {
                &[StageName::Upload, StageName::FileAnalysis]
            }
        }
    }

    /// Artifact produced by this stage, if any.
    pub fn artifact(self) -> Option<ArtifactKind> {
        match self {
            StageName::StudyGuide => Some(ArtifactKind::StudyGuide),
            StageName::Flashcards => Some(ArtifactKind::Flashcards),
            StageName::Worksheet => Some(ArtifactKind::Worksheet),
            _ => None,
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageName::ALL
            .into_iter()
            .find(|stage| stage.wire_name() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// Per-stage status.
///
/// Statuses form a lattice: `pending < in_progress < {completed, error}`.
/// `completed` and `error` are incomparable, and `skipped` is terminal and
/// incomparable with everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Error,
    Skipped,
}

impl StepStatus {
    pub fn wire_name(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Completed => "completed",
            StepStatus::Error => "error",
            StepStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Error | StepStatus::Skipped
        )
    }

    /// Terminal and counted towards progress.
    pub fn is_settled(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Error)
    }

    fn rank(self) -> u8 {
        match self {
            StepStatus::Pending => 0,
            StepStatus::InProgress => 1,
            StepStatus::Completed | StepStatus::Error | StepStatus::Skipped => 2,
        }
    }

    /// Lattice comparison; `None` for incomparable pairs.
    pub fn lattice_cmp(self, other: StepStatus) -> Option<Ordering> {
        if self == other {
            return Some(Ordering::Equal);
        }
        match (self, other) {
            (StepStatus::Skipped, _) | (_, StepStatus::Skipped) => {
                // A stage can be skipped only before it starts.
                match (self, other) {
                    (StepStatus::Pending, StepStatus::Skipped) => Some(Ordering::Less),
                    (StepStatus::Skipped, StepStatus::Pending) => Some(Ordering::Greater),
                    _ => None,
                }
            }
            _ if self.rank() == other.rank() => None,
            _ => Some(self.rank().cmp(&other.rank())),
        }
    }

    /// Resolves an incoming status against the current one.
    ///
    /// Returns the status to keep: the incoming one only if it is strictly
    /// above the current one in the lattice.
    pub fn advance(self, incoming: StepStatus) -> StepStatus {
        match self.lattice_cmp(incoming) {
            Some(Ordering::Less) => incoming,
            _ => self,
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "in_progress" => Ok(StepStatus::InProgress),
            "completed" => Ok(StepStatus::Completed),
            "error" => Ok(StepStatus::Error),
            "skipped" => Ok(StepStatus::Skipped),
            other => Err(other.to_string()),
        }
    }
}

/// Kind of derived learning artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ArtifactKind {
    StudyGuide,
    Flashcards,
    Worksheet,
}

impl ArtifactKind {
    pub fn stage(self) -> StageName {
        match self {
            ArtifactKind::StudyGuide => StageName::StudyGuide,
            ArtifactKind::Flashcards => StageName::Flashcards,
            ArtifactKind::Worksheet => StageName::Worksheet,
        }
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageName::from_str(s)?
            .artifact()
            .ok_or_else(|| s.to_string())
    }
}
