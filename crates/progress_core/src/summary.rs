use serde::Serialize;

use crate::{ProgressState, StageName, StepStatus};

pub const LABEL_COMPLETE: &str = "Complete";
pub const LABEL_COMPLETE_WITH_ERRORS: &str = "Completed with errors";
pub const LABEL_FAILED: &str = "Failed";

/// Display-ready projection of a [`ProgressState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSummary {
    /// 0..=100, over the non-skipped stages.
    pub percent: u8,
    pub current_step_label: String,
    /// Stage the label refers to; `None` once the job is terminal.
    pub current_stage: Option<StageName>,
    pub is_terminal: bool,
    pub is_success: bool,
    pub completed_artifacts: usize,
}

pub fn summarize(state: &ProgressState) -> ProgressSummary {
    let counted: Vec<StepStatus> = StageName::ALL
        .into_iter()
        .map(|stage| state.status(stage))
        .filter(|status| *status != StepStatus::Skipped)
        .collect();
    let settled = counted.iter().filter(|status| status.is_settled()).count();
    let percent = if counted.is_empty() {
        100
    } else {
        (settled * 100 / counted.len()) as u8
    };

    let is_terminal = state.is_terminal();
    let current_stage = if is_terminal {
        None
    } else {
        first_with_status(state, StepStatus::InProgress)
            .or_else(|| first_with_status(state, StepStatus::Pending))
    };
    let current_step_label = match current_stage {
        Some(stage) => stage.label(),
        None if !is_terminal => StageName::Cleanup.label(),
        None if state.gate_failed() => LABEL_FAILED,
        None if state.has_errors() => LABEL_COMPLETE_WITH_ERRORS,
        None => LABEL_COMPLETE,
    };

    ProgressSummary {
        percent,
        current_step_label: current_step_label.to_string(),
        current_stage,
        is_terminal,
        is_success: is_terminal && !state.has_errors(),
        completed_artifacts: state.completed_artifacts.len(),
    }
}

fn first_with_status(state: &ProgressState, status: StepStatus) -> Option<StageName> {
    StageName::ALL
        .into_iter()
        .find(|stage| state.status(*stage) == status)
}
