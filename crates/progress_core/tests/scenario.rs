use chrono::{DateTime, Duration, TimeZone, Utc};
use pretty_assertions::assert_eq;
use progress_core::{
    apply, summarize, ArtifactKind, Incoming, JobId, Outcome, ProgressState, RawEvent, StageName,
    StepStatus, LABEL_COMPLETE_WITH_ERRORS,
};
use serde_json::json;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 2, 14, 0, 0).unwrap()
}

fn progress(payload: serde_json::Value, secs: i64) -> Incoming {
    Incoming::Event(RawEvent::new(
        "analysis_progress",
        "workspace-biology",
        payload,
        t0() + Duration::seconds(secs),
    ))
}

#[test]
fn partial_success_run_ends_terminal_with_errors() {
    let mut state = Some(ProgressState::new(JobId::new("job-42"), "cells.pdf", t0()));
    let events = [
        json!({ "steps": { "fileAnalysis": "in_progress" } }),
        json!({ "steps": {
            "fileAnalysis": "completed",
            "studyGuide": "in_progress",
            "flashcards": "in_progress",
            "worksheet": "skipped"
        } }),
        json!({
            "steps": { "studyGuide": "completed" },
            "artifacts": { "studyGuide": { "id": "sg-42", "title": "Cell biology" } }
        }),
        json!({ "steps": { "flashcards": "error" }, "error": "flashcard model returned no cards" }),
        json!({ "steps": { "cleanup": "completed" } }),
    ];

    let mut percents = Vec::new();
    for (secs, payload) in (1..).zip(events) {
        let (next, outcome) = apply(state, progress(payload, secs * 10));
        assert_eq!(outcome, Outcome::Accepted);
        percents.push(summarize(next.as_ref().expect("state")).percent);
        state = next;
    }
    let state = state.expect("final state");
    let summary = summarize(&state);

    assert!(summary.is_terminal);
    assert!(!summary.is_success);
    assert_eq!(summary.percent, 100);
    assert_eq!(summary.current_step_label, LABEL_COMPLETE_WITH_ERRORS);
    assert_eq!(
        state.completed_artifacts.keys().copied().collect::<Vec<_>>(),
        vec![ArtifactKind::StudyGuide]
    );
    assert_eq!(state.status(StageName::Worksheet), StepStatus::Skipped);
    assert_eq!(state.errors.len(), 1);
    assert_eq!(state.completed_at, Some(t0() + Duration::seconds(50)));

    // Percent never goes backwards along the way.
    assert!(percents.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(percents, vec![16, 40, 60, 80, 100]);
}

#[test]
fn fan_out_waits_for_every_sibling() {
    let state = ProgressState::new(JobId::new("job-43"), "cells.pdf", t0());
    let (state, _) = apply(
        Some(state),
        progress(
            json!({ "steps": { "studyGuide": "error", "flashcards": "completed", "worksheet": "pending" } }),
            1,
        ),
    );
    let (state, _) = apply(state, progress(json!({ "steps": { "cleanup": "completed" } }), 2));
    let state = state.expect("state");
    assert!(!state.is_terminal());
    assert!(!summarize(&state).is_terminal);
    assert!(!state.cleanup_reachable());

    let (state, _) = apply(
        Some(state),
        progress(json!({ "steps": { "worksheet": "error" } }), 3),
    );
    let state = state.expect("state");
    assert!(state.cleanup_reachable());
    assert!(state.is_terminal());

    let summary = summarize(&state);
    assert!(summary.is_terminal);
    assert!(!summary.is_success);
    assert_eq!(summary.percent, 100);
}
