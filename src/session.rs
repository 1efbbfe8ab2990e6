use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    backend::BackendClient,
    config::ConsoleConfig,
    dashboard::{Dashboard, DashboardState, HumanReviewToggle, RunId},
    error::ConsoleError,
    stream::{ConnectionGuard, EventStreamClient, PipelineEvent},
    types::{FinalDecision, PolicyValue, ReviewerDecision},
};

/// Out-of-band check of the backend's approval queue.
#[async_trait]
pub trait ApprovalCheck: Send + Sync {
    async fn has_pending_approval(&self, pnr: &str) -> Result<bool, ConsoleError>;
}

#[async_trait]
impl ApprovalCheck for BackendClient {
    async fn has_pending_approval(&self, pnr: &str) -> Result<bool, ConsoleError> {
        BackendClient::has_pending_approval(self, pnr).await
    }
}

type EventCallback = Arc<dyn Fn(&PipelineEvent, &DashboardState) + Send + Sync>;

/// Drives evaluation runs against the backend and owns the dashboard they
/// reduce into. Share it behind an `Arc`; no lock is held across an await.
pub struct EvaluationSession {
    backend: BackendClient,
    events: EventStreamClient,
    approvals: Arc<dyn ApprovalCheck>,
    dashboard: Mutex<Dashboard>,
    review: HumanReviewToggle,
    approval_poll_interval: Duration,
    run_finished: watch::Sender<bool>,
    event_callback: Option<EventCallback>,
}

impl EvaluationSession {
    pub fn from_config(config: &ConsoleConfig) -> Result<Self, ConsoleError> {
        let backend = BackendClient::from_config(config)?;
        let events = EventStreamClient::from_config(config)?;
        let review = HumanReviewToggle::new(config.human_review);
        let (run_finished, _) = watch::channel(false);

        Ok(Self {
            approvals: Arc::new(backend.clone()),
            backend,
            events,
            dashboard: Mutex::new(Dashboard::new(review.clone())),
            review,
            approval_poll_interval: config.approval_poll_interval,
            run_finished,
            event_callback: None,
        })
    }

    pub fn with_approval_check(mut self, check: Arc<dyn ApprovalCheck>) -> Self {
        self.approvals = check;
        self
    }

    pub fn with_event_callback(
        mut self,
        callback: impl Fn(&PipelineEvent, &DashboardState) + Send + Sync + 'static,
    ) -> Self {
        self.event_callback = Some(Arc::new(callback));
        self
    }

    pub fn backend(&self) -> &BackendClient {
        &self.backend
    }

    pub fn review(&self) -> &HumanReviewToggle {
        &self.review
    }

    /// Flips to `true` whenever a run reaches its final state.
    pub fn subscribe_finished(&self) -> watch::Receiver<bool> {
        self.run_finished.subscribe()
    }

    pub fn snapshot(&self) -> DashboardState {
        self.dashboard().state().clone()
    }

    fn dashboard(&self) -> MutexGuard<'_, Dashboard> {
        self.dashboard
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit_event(&self, event: &PipelineEvent, state: &DashboardState) {
        if let Some(callback) = &self.event_callback {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                (callback)(event, state)
            }));
        }
    }

    /// Selects a record, abandoning any live run and closing its stream.
    pub fn select_pnr(&self, pnr: &str) {
        let mut dashboard = self.dashboard();
        self.events.close();
        dashboard.select_pnr(pnr);
        self.run_finished.send_replace(false);
    }

    /// Runs one evaluation to completion. Stream failures end up in the
    /// dashboard's error banner rather than in the return value.
    pub async fn run(&self, pnr: &str) -> DashboardState {
        // The dashboard run and the stream generation advance together, so
        // the current run always owns the live stream.
        let (run, guard) = {
            let mut dashboard = self.dashboard();
            let run = dashboard.start_run(pnr);
            self.run_finished.send_replace(false);
            (run, self.events.reserve())
        };

        let consumed = self.consume(run, pnr, guard).await;
        {
            let mut dashboard = self.dashboard();
            match consumed {
                Err(error) => dashboard.fail_run(run, &error),
                Ok(()) if dashboard.is_live(run) => dashboard.fail_run(
                    run,
                    &ConsoleError::Transport(
                        "evaluation stream ended before the run finished".to_string(),
                    ),
                ),
                Ok(()) => {}
            }
        }

        if self.pending_for(run) {
            tokio::time::sleep(self.approval_poll_interval).await;
            let still_pending = self.approvals.has_pending_approval(pnr).await;
            self.dashboard().reconcile_approval(run, still_pending);
        }

        let dashboard = self.dashboard();
        if dashboard.current_run() == Some(run) {
            self.run_finished.send_replace(true);
        }
        dashboard.state().clone()
    }

    /// Starts [`run`](Self::run) on its own task. The finished signal is
    /// lowered before this returns, so a waiter subscribed afterwards never
    /// sees the previous run's completion.
    pub fn spawn_run(self: &Arc<Self>, pnr: &str) -> JoinHandle<DashboardState> {
        self.run_finished.send_replace(false);
        let session = Arc::clone(self);
        let pnr = pnr.to_string();
        tokio::spawn(async move { session.run(&pnr).await })
    }

    fn pending_for(&self, run: RunId) -> bool {
        let dashboard = self.dashboard();
        dashboard.current_run() == Some(run) && dashboard.awaiting_approval()
    }

    async fn consume(
        &self,
        run: RunId,
        pnr: &str,
        guard: ConnectionGuard,
    ) -> Result<(), ConsoleError> {
        let mut stream = self.events.open(pnr, guard).await?;

        while let Some(item) = stream.next().await {
            let event = item?;
            let snapshot = {
                let mut dashboard = self.dashboard();
                if !dashboard.apply(run, &event) {
                    if dashboard.current_run() != Some(run) {
                        tracing::debug!(pnr, "run superseded, leaving stream");
                        return Ok(());
                    }
                    continue;
                }
                self.event_callback
                    .as_ref()
                    .map(|_| dashboard.state().clone())
            };

            if let Some(state) = snapshot {
                self.emit_event(&event, &state);
            }
        }

        Ok(())
    }

    fn pending_request_id(&self) -> Result<Option<String>, ConsoleError> {
        self.dashboard()
            .state()
            .pending_approval
            .as_ref()
            .map(|pending| pending.request_id.clone())
            .ok_or(ConsoleError::NoPendingApproval)
    }

    /// Records approval with the backend (when the request is known there)
    /// and adopts the held decision.
    pub async fn approve(&self, reviewer: &str, notes: Option<String>) -> Result<FinalDecision, ConsoleError> {
        if let Some(request_id) = self.pending_request_id()? {
            let decision = ReviewerDecision {
                reviewer: reviewer.to_string(),
                notes,
            };
            self.backend.approve(&request_id, &decision).await?;
        }
        self.dashboard().approve()
    }

    /// Records the denial with the backend and installs a rejection record.
    pub async fn reject(&self, reviewer: &str, notes: Option<String>) -> Result<FinalDecision, ConsoleError> {
        if let Some(request_id) = self.pending_request_id()? {
            let decision = ReviewerDecision {
                reviewer: reviewer.to_string(),
                notes,
            };
            self.backend.deny(&request_id, &decision).await?;
        }
        self.dashboard().reject()
    }

    pub fn dismiss_error(&self) {
        self.dashboard().dismiss_error();
    }
}

/// Anything that can list the current policy values.
#[async_trait]
pub trait PolicySource: Send + Sync + 'static {
    async fn list_policies(&self) -> Result<Vec<PolicyValue>, ConsoleError>;
}

#[async_trait]
impl PolicySource for BackendClient {
    async fn list_policies(&self) -> Result<Vec<PolicyValue>, ConsoleError> {
        BackendClient::list_policies(self).await
    }
}

/// Polls policy values so edits made elsewhere show up.
pub struct PolicyWatcher;

impl PolicyWatcher {
    /// The task ends once every receiver is dropped.
    pub fn spawn<S: PolicySource>(
        source: S,
        interval: Duration,
    ) -> (watch::Receiver<Vec<PolicyValue>>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(Vec::new());

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }

                match source.list_policies().await {
                    Ok(policies) => {
                        tx.send_if_modified(|current| {
                            if *current == policies {
                                false
                            } else {
                                tracing::debug!(count = policies.len(), "policy values changed");
                                *current = policies;
                                true
                            }
                        });
                    }
                    Err(error) => tracing::warn!(%error, "policy poll failed"),
                }
            }
        });

        (rx, handle)
    }
}
