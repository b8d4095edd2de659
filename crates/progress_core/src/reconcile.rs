use chrono::{DateTime, Utc};

use crate::{
    Incoming, Outcome, ProgressDelta, ProgressState, RawEvent, StageName, StepStatus,
};

/// Pure merge: applies one incoming update to the current state.
///
/// The returned state is always the one to keep. It differs from `current`
/// only when the outcome is [`Outcome::Accepted`]; every other outcome hands
/// `current` back untouched.
pub fn apply(current: Option<ProgressState>, incoming: Incoming) -> (Option<ProgressState>, Outcome) {
    match incoming {
        Incoming::Snapshot(snapshot) => apply_snapshot(current, snapshot),
        Incoming::Event(event) => apply_event(current, &event),
    }
}

fn apply_snapshot(
    current: Option<ProgressState>,
    mut snapshot: ProgressState,
) -> (Option<ProgressState>, Outcome) {
    snapshot.normalize_steps();
    let Some(current) = current else {
        return (Some(into_baseline(snapshot)), Outcome::Accepted);
    };

    if snapshot.job_id != current.job_id {
        // A newer job replaces the lineage; a snapshot of an older one is noise.
        if snapshot.started_at > current.started_at {
            return (Some(into_baseline(snapshot)), Outcome::Accepted);
        }
        return (Some(current), Outcome::Stale);
    }

    if is_older(&snapshot, &current) {
        return (Some(current), Outcome::Stale);
    }

    let merged = merge_snapshot(&current, snapshot);
    if merged == current {
        (Some(current), Outcome::Unchanged)
    } else {
        (Some(merged), Outcome::Accepted)
    }
}

fn apply_event(current: Option<ProgressState>, event: &RawEvent) -> (Option<ProgressState>, Outcome) {
    if !event.is_progress() {
        return (current, Outcome::Ignored);
    }
    let delta = match ProgressDelta::from_event(event) {
        Ok(delta) => delta,
        Err(err) => return (current, Outcome::Dropped(err)),
    };

    let Some(current) = current else {
        return match delta.into_baseline() {
            Ok(state) => (Some(state), Outcome::Accepted),
            Err(err) => (None, Outcome::Dropped(err)),
        };
    };

    if let Some(job_id) = &delta.job_id {
        if *job_id != current.job_id {
            return (Some(current), Outcome::ForeignJob(job_id.clone()));
        }
    }
    if let Some(seq) = delta.sequence_number {
        if seq <= current.sequence_number {
            return (Some(current), Outcome::Stale);
        }
    }

    let mut next = current.clone();
    merge_delta(&mut next, &delta);
    if let Some(seq) = delta.sequence_number {
        next.sequence_number = seq;
    }
    if next == current {
        return (Some(current), Outcome::Unchanged);
    }
    next.observed_at = next.observed_at.max(delta.timestamp);
    (Some(next), Outcome::Accepted)
}

/// Applies the stages, errors and artifacts of `delta` without regressing any
/// stage, then settles the job if the pipeline has finished.
pub(crate) fn merge_delta(state: &mut ProgressState, delta: &ProgressDelta) {
    if state.filename.is_empty() {
        if let Some(filename) = delta.filename.as_deref().filter(|name| !name.is_empty()) {
            state.filename = filename.to_string();
        }
    }

    // A bare message belongs to the stage this delta fails, if exactly one.
    let failed_stages: Vec<StageName> = delta
        .steps
        .iter()
        .filter(|(_, status)| **status == StepStatus::Error)
        .map(|(stage, _)| *stage)
        .collect();
    for entry in &delta.errors {
        let mut entry = entry.clone();
        if entry.stage.is_none() && failed_stages.len() == 1 {
            entry.stage = Some(failed_stages[0]);
        }
        // Without a sequence number an identical entry cannot be told apart
        // from a redelivery.
        let replayed = delta.sequence_number.is_none() && state.errors.contains(&entry);
        if !replayed {
            state.errors.push(entry);
        }
    }

    for (stage, status) in &delta.steps {
        advance_stage(state, *stage, *status);
    }

    for (kind, summary) in &delta.artifacts {
        // A skipped stage stays empty, whatever arrives late.
        if state.status(kind.stage()) == StepStatus::Skipped {
            continue;
        }
        if state.completed_artifacts.get(kind) != Some(summary) {
            state.completed_artifacts.insert(*kind, summary.clone());
        }
        advance_stage(state, kind.stage(), StepStatus::Completed);
    }

    settle(state, delta.timestamp);
}

fn advance_stage(state: &mut ProgressState, stage: StageName, incoming: StepStatus) {
    let current = state.status(stage);
    let next = current.advance(incoming);
    if next == current {
        return;
    }
    state.steps.insert(stage, next);

    if matches!(next, StepStatus::Pending | StepStatus::Skipped) {
        return;
    }
    for predecessor in stage.implied_predecessors() {
        let status = state.status(*predecessor);
        if matches!(status, StepStatus::Pending | StepStatus::InProgress) {
            state.steps.insert(*predecessor, StepStatus::Completed);
        }
    }
}

fn settle(state: &mut ProgressState, at: DateTime<Utc>) {
    if state.completed_at.is_none() && state.pipeline_settled() {
        state.completed_at = Some(at);
    }
}

fn into_baseline(mut snapshot: ProgressState) -> ProgressState {
    if snapshot.pipeline_settled() {
        let observed_at = snapshot.observed_at;
        snapshot.completed_at.get_or_insert(observed_at);
    } else {
        snapshot.completed_at = None;
    }
    snapshot
}

fn is_older(snapshot: &ProgressState, current: &ProgressState) -> bool {
    if snapshot.sequence_number > 0 && current.sequence_number > 0 {
        snapshot.sequence_number < current.sequence_number
    } else {
        snapshot.observed_at < current.observed_at
    }
}

/// Takes the snapshot as the new base but keeps anything it would roll back.
fn merge_snapshot(current: &ProgressState, snapshot: ProgressState) -> ProgressState {
    let mut merged = snapshot;

    for stage in StageName::ALL {
        let resolved = current.status(stage).advance(merged.status(stage));
        merged.steps.insert(stage, resolved);
    }

    // The log already published stays a prefix; only entries it lacks are
    // appended, in the snapshot's order.
    let mut unmatched = current.errors.clone();
    let mut errors = current.errors.clone();
    for entry in std::mem::take(&mut merged.errors) {
        match unmatched.iter().position(|known| *known == entry) {
            Some(pos) => {
                unmatched.remove(pos);
            }
            None => errors.push(entry),
        }
    }
    merged.errors = errors;

    for (kind, summary) in &current.completed_artifacts {
        merged
            .completed_artifacts
            .entry(*kind)
            .or_insert_with(|| summary.clone());
    }

    if merged.filename.is_empty() {
        merged.filename = current.filename.clone();
    }
    merged.started_at = current.started_at;
    merged.sequence_number = merged.sequence_number.max(current.sequence_number);
    merged.observed_at = merged.observed_at.max(current.observed_at);

    let snapshot_completed_at = merged.completed_at.take();
    merged.completed_at = current.completed_at;
    if merged.completed_at.is_none() && merged.pipeline_settled() {
        merged.completed_at = Some(snapshot_completed_at.unwrap_or(merged.observed_at));
    }
    merged
}
