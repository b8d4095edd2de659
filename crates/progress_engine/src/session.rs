//! Per-workspace progress session.
//!
//! One actor task owns the [`ProgressState`] and is the only caller of
//! [`apply`]. Push events, connection changes, poll ticks and fetch results
//! all arrive on that task, so merges are strictly ordered. Fetches run on
//! their own tasks and report back tagged with the session epoch; a reset or
//! stop bumps the epoch so late results are discarded.
use std::sync::Arc;

use progress_core::{apply, summarize, Incoming, Outcome, ProgressState, WorkspaceId};
use progress_logging::{progress_debug, progress_info, progress_trace, progress_warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    ChannelClient, ChannelEvent, ChannelSubscription, ConnectionState, FailureKind, FetchError,
    ProgressUpdate, SessionNotice, SessionPhase, SessionSettings, SnapshotFetcher,
};

#[derive(Debug)]
enum Command {
    Reset,
    Refresh,
}

struct FetchReport {
    epoch: u64,
    result: Result<Option<ProgressState>, FetchError>,
}

/// Consumer-facing handle of a running session.
///
/// Dropping the handle stops the session; [`SessionHandle::stop`] does the
/// same and waits for the channel to be released.
pub struct SessionHandle {
    workspace_id: WorkspaceId,
    commands: mpsc::UnboundedSender<Command>,
    notices: broadcast::Sender<SessionNotice>,
    updates: watch::Receiver<Option<ProgressUpdate>>,
    phase: watch::Receiver<SessionPhase>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn workspace_id(&self) -> &WorkspaceId {
        &self.workspace_id
    }

    /// Live stream of notices from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    /// Latest published update, for consumers that only need the newest one.
    pub fn watch_updates(&self) -> watch::Receiver<Option<ProgressUpdate>> {
        self.updates.clone()
    }

    pub fn latest(&self) -> Option<ProgressUpdate> {
        self.updates.borrow().clone()
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase.clone()
    }

    /// Forgets the current job and seeds again, e.g. after a new upload.
    pub fn reset(&self) {
        let _ = self.commands.send(Command::Reset);
    }

    /// Fetches a snapshot now regardless of the connection state.
    pub fn refresh(&self) {
        let _ = self.commands.send(Command::Refresh);
    }

    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct SessionController {
    workspace_id: WorkspaceId,
    channel: Arc<dyn ChannelClient>,
    fetcher: Arc<dyn SnapshotFetcher>,
    settings: SessionSettings,
    state: Option<ProgressState>,
    phase: SessionPhase,
    connection: ConnectionState,
    epoch: u64,
    poll_armed: bool,
    fetch_in_flight: bool,
    refetch_requested: bool,
    consecutive_failures: u32,
    degraded: bool,
    fetch_tx: mpsc::UnboundedSender<FetchReport>,
    notices: broadcast::Sender<SessionNotice>,
    updates: watch::Sender<Option<ProgressUpdate>>,
    phase_tx: watch::Sender<SessionPhase>,
}

impl SessionController {
    /// Spawns the session actor on the current tokio runtime.
    pub fn start(
        workspace_id: WorkspaceId,
        channel: Arc<dyn ChannelClient>,
        fetcher: Arc<dyn SnapshotFetcher>,
        settings: SessionSettings,
    ) -> SessionHandle {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(settings.notice_buffer.max(1));
        let (updates_tx, updates) = watch::channel(None);
        let (phase_tx, phase) = watch::channel(SessionPhase::Idle);
        let cancel = CancellationToken::new();

        let controller = SessionController {
            workspace_id: workspace_id.clone(),
            channel,
            fetcher,
            settings,
            state: None,
            phase: SessionPhase::Idle,
            connection: ConnectionState::Connecting,
            epoch: 0,
            poll_armed: false,
            fetch_in_flight: false,
            refetch_requested: false,
            consecutive_failures: 0,
            degraded: false,
            fetch_tx,
            notices: notices.clone(),
            updates: updates_tx,
            phase_tx,
        };
        let task = tokio::spawn(controller.run(command_rx, fetch_rx, cancel.clone()));

        SessionHandle {
            workspace_id,
            commands,
            notices,
            updates,
            phase,
            cancel,
            task: Some(task),
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut fetches: mpsc::UnboundedReceiver<FetchReport>,
        cancel: CancellationToken,
    ) {
        progress_info!("session {}: starting", self.workspace_id);
        self.begin_seeding();

        let subscription = tokio::select! {
            _ = cancel.cancelled() => None,
            subscription = self.channel.subscribe(&self.workspace_id) => Some(subscription),
        };
        if let Some(ChannelSubscription {
            mut events,
            mut connection,
        }) = subscription
        {
            let initial = *connection.borrow_and_update();
            self.on_connection(initial);

            let mut poll: Option<Interval> = None;
            let mut events_open = true;
            let mut connection_open = true;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    Some(command) = commands.recv() => self.on_command(command),
                    Some(report) = fetches.recv() => self.on_fetch(report),
                    event = events.recv(), if events_open => match event {
                        Ok(event) => self.on_channel_event(event),
                        Err(RecvError::Lagged(missed)) => {
                            progress_warn!(
                                "session {}: missed {} channel events, resyncing",
                                self.workspace_id,
                                missed
                            );
                            self.request_fetch("event gap");
                        }
                        Err(RecvError::Closed) => {
                            events_open = false;
                            self.on_connection(ConnectionState::Failed);
                        }
                    },
                    changed = connection.changed(), if connection_open => match changed {
                        Ok(()) => {
                            let state = *connection.borrow_and_update();
                            self.on_connection(state);
                        }
                        Err(_) => {
                            connection_open = false;
                            self.on_connection(ConnectionState::Failed);
                        }
                    },
                    _ = next_tick(&mut poll) => self.request_fetch("poll"),
                }
                sync_timer(&mut poll, self.poll_armed, &self.settings);
            }
        }

        self.shutdown().await;
    }

    fn begin_seeding(&mut self) {
        self.set_phase(SessionPhase::Seeding);
        self.request_fetch("seed");
    }

    fn finish_seeding(&mut self) {
        if self.connection == ConnectionState::Connected {
            self.enter_live();
        } else {
            self.enter_polling(false);
        }
    }

    fn enter_live(&mut self) {
        self.poll_armed = false;
        self.set_phase(SessionPhase::Live);
    }

    fn enter_polling(&mut self, fetch_now: bool) {
        self.poll_armed = true;
        self.set_phase(SessionPhase::Polling);
        if fetch_now {
            self.request_fetch("entering polling");
        }
    }

    fn on_command(&mut self, command: Command) {
        progress_debug!("session {}: {:?}", self.workspace_id, command);
        match command {
            Command::Reset => {
                self.epoch += 1;
                self.state = None;
                self.poll_armed = false;
                self.fetch_in_flight = false;
                self.refetch_requested = false;
                self.consecutive_failures = 0;
                self.degraded = false;
                self.updates.send_replace(None);
                self.set_phase(SessionPhase::Idle);
                self.begin_seeding();
            }
            Command::Refresh => self.request_fetch("refresh"),
        }
    }

    fn on_connection(&mut self, state: ConnectionState) {
        let previous = std::mem::replace(&mut self.connection, state);
        if previous == state {
            return;
        }
        progress_info!(
            "session {}: connection {:?} -> {:?}",
            self.workspace_id,
            previous,
            state
        );
        match self.phase {
            SessionPhase::Live if state != ConnectionState::Connected => self.enter_polling(true),
            SessionPhase::Polling if state == ConnectionState::Connected => self.enter_live(),
            _ => {}
        }
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            // Anything pushed while the subscription was down is gone.
            ChannelEvent::SubscriptionSucceeded => self.request_fetch("subscribed"),
            ChannelEvent::SubscriptionError(detail) => {
                progress_warn!(
                    "session {}: subscription error: {}",
                    self.workspace_id,
                    detail
                );
            }
            ChannelEvent::Raw(event) => self.reconcile(Incoming::Event(event)),
        }
    }

    fn on_fetch(&mut self, report: FetchReport) {
        if report.epoch != self.epoch {
            progress_debug!(
                "session {}: discarding fetch from epoch {}",
                self.workspace_id,
                report.epoch
            );
            return;
        }
        self.fetch_in_flight = false;

        let snapshot = match report.result {
            Ok(snapshot) => {
                self.record_fetch_success();
                snapshot
            }
            Err(err) => {
                self.record_fetch_failure(err);
                None
            }
        };
        if self.phase == SessionPhase::Seeding {
            self.finish_seeding();
        }
        if let Some(snapshot) = snapshot {
            self.reconcile(Incoming::Snapshot(snapshot));
        }
        // A push may have finished the job while this fetch was in flight.
        self.settle_phase();

        if std::mem::take(&mut self.refetch_requested) {
            self.request_fetch("queued");
        }
    }

    fn record_fetch_success(&mut self) {
        self.consecutive_failures = 0;
        if std::mem::take(&mut self.degraded) {
            progress_info!("session {}: snapshot fetches recovered", self.workspace_id);
            let _ = self.notices.send(SessionNotice::Recovered);
        }
    }

    fn record_fetch_failure(&mut self, err: FetchError) {
        self.consecutive_failures += 1;
        progress_warn!(
            "session {}: snapshot fetch failed ({} in a row): {}",
            self.workspace_id,
            self.consecutive_failures,
            err
        );
        if !self.degraded && self.consecutive_failures >= self.settings.max_consecutive_failures {
            self.degraded = true;
            let _ = self.notices.send(SessionNotice::Degraded {
                consecutive_failures: self.consecutive_failures,
                last_error: err,
            });
        }
    }

    fn request_fetch(&mut self, reason: &str) {
        if self.fetch_in_flight {
            self.refetch_requested = true;
            return;
        }
        self.fetch_in_flight = true;
        progress_debug!(
            "session {}: fetching snapshot ({})",
            self.workspace_id,
            reason
        );

        let fetcher = self.fetcher.clone();
        let workspace_id = self.workspace_id.clone();
        let reports = self.fetch_tx.clone();
        let epoch = self.epoch;
        let timeout = self.settings.fetch_timeout;
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, fetcher.fetch(&workspace_id)).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::new(
                    FailureKind::Timeout,
                    format!("no snapshot within {timeout:?}"),
                )),
            };
            let _ = reports.send(FetchReport { epoch, result });
        });
    }

    fn reconcile(&mut self, incoming: Incoming) {
        let (next, outcome) = apply(self.state.take(), incoming);
        self.state = next;
        match outcome {
            Outcome::Accepted => self.publish(),
            Outcome::ForeignJob(job_id) => {
                progress_info!(
                    "session {}: update for job {} outside current lineage",
                    self.workspace_id,
                    job_id
                );
                self.request_fetch("new job");
            }
            Outcome::Dropped(err) => {
                progress_warn!(
                    "session {}: dropping malformed progress payload: {}",
                    self.workspace_id,
                    err
                );
            }
            Outcome::Unchanged | Outcome::Stale | Outcome::Ignored => {
                progress_trace!("session {}: {:?}", self.workspace_id, outcome);
            }
        }
    }

    fn publish(&mut self) {
        let Some(state) = &self.state else {
            return;
        };
        let update = ProgressUpdate {
            state: state.clone(),
            summary: summarize(state),
        };
        progress_debug!(
            "session {}: {}% {}",
            self.workspace_id,
            update.summary.percent,
            update.summary.current_step_label
        );
        self.updates.send_replace(Some(update.clone()));
        let _ = self.notices.send(SessionNotice::Progress(update));
        self.settle_phase();
    }

    /// Moves into or out of `Terminal` to match the current state.
    fn settle_phase(&mut self) {
        let terminal = self.state.as_ref().is_some_and(ProgressState::is_terminal);
        match self.phase {
            SessionPhase::Live | SessionPhase::Polling if terminal => {
                progress_info!("session {}: job finished", self.workspace_id);
                self.poll_armed = false;
                self.set_phase(SessionPhase::Terminal);
            }
            // A newer job replaced the finished one.
            SessionPhase::Terminal if !terminal => self.finish_seeding(),
            _ => {}
        }
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        if self.phase == phase {
            return;
        }
        progress_debug!(
            "session {}: {:?} -> {:?}",
            self.workspace_id,
            self.phase,
            phase
        );
        self.phase = phase;
        self.phase_tx.send_replace(phase);
        let _ = self.notices.send(SessionNotice::PhaseChanged(phase));
    }

    async fn shutdown(mut self) {
        self.epoch += 1;
        self.poll_armed = false;
        self.channel.unsubscribe(&self.workspace_id).await;
        self.set_phase(SessionPhase::Idle);
        progress_info!("session {}: stopped", self.workspace_id);
    }
}

async fn next_tick(poll: &mut Option<Interval>) {
    match poll {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn sync_timer(poll: &mut Option<Interval>, armed: bool, settings: &SessionSettings) {
    match (armed, poll.is_some()) {
        (true, false) => {
            // The fetch that armed the timer already ran; first tick waits a period.
            let period = settings.poll_interval;
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            *poll = Some(interval);
        }
        (false, true) => *poll = None,
        _ => {}
    }
}
