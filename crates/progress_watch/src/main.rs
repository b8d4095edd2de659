//! Watches the analysis progress of one or more workspaces and logs it.
//!
//! Usage: `progress_watch [config.ron]`, defaulting to `./progress_watch.ron`.
mod config;

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::Result;
use progress_core::WorkspaceId;
use progress_engine::{ProgressEngine, SessionNotice};
use progress_logging::{progress_error, progress_info, progress_warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;

use crate::config::{WatchConfig, DEFAULT_CONFIG};

#[tokio::main]
async fn main() -> Result<()> {
    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let config = WatchConfig::load(&path)?;
    progress_logging::initialize(config.log_destination(), config.level_filter());

    let mut engine = ProgressEngine::from_settings(&config.settings)?;
    let workspaces = config.workspace_ids();
    let (notice_tx, mut notices) = mpsc::unbounded_channel();
    for workspace_id in &workspaces {
        let session = engine.watch(workspace_id.clone());
        let mut receiver = session.subscribe();
        let notice_tx = notice_tx.clone();
        let workspace_id = workspace_id.clone();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(notice) => {
                        if notice_tx.send((workspace_id.clone(), notice)).is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        progress_warn!("{}: skipped {} notices", workspace_id, missed);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }
    drop(notice_tx);
    progress_info!("watching {} workspace(s)", workspaces.len());

    let mut finished = BTreeSet::new();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    progress_error!("cannot listen for ctrl-c: {}", err);
                }
                progress_info!("interrupted");
                break;
            }
            received = notices.recv() => {
                let Some((workspace_id, notice)) = received else {
                    break;
                };
                if report(&workspace_id, notice) {
                    finished.insert(workspace_id);
                }
                if config.exit_when_finished && finished.len() == workspaces.len() {
                    progress_info!("every watched job has finished");
                    break;
                }
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}

/// Logs one notice. Returns true when it shows a finished job.
fn report(workspace_id: &WorkspaceId, notice: SessionNotice) -> bool {
    match notice {
        SessionNotice::Progress(update) => {
            let summary = update.summary;
            progress_info!(
                "{} [{}] {:>3}% {} ({} artifacts)",
                workspace_id,
                update.state.job_id,
                summary.percent,
                summary.current_step_label,
                summary.completed_artifacts
            );
            if !summary.is_terminal {
                return false;
            }
            for error in &update.state.errors {
                match error.stage {
                    Some(stage) => progress_warn!("{}: {}: {}", workspace_id, stage, error.message),
                    None => progress_warn!("{}: {}", workspace_id, error.message),
                }
            }
            true
        }
        SessionNotice::PhaseChanged(phase) => {
            progress_info!("{}: session {:?}", workspace_id, phase);
            false
        }
        SessionNotice::Degraded {
            consecutive_failures,
            last_error,
        } => {
            progress_warn!(
                "{}: {} snapshot fetches failed in a row, last: {}",
                workspace_id,
                consecutive_failures,
                last_error
            );
            false
        }
        SessionNotice::Recovered => {
            progress_info!("{}: snapshot fetches recovered", workspace_id);
            false
        }
    }
}
