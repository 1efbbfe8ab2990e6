use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use serde::Serialize;

use crate::{
    error::ConsoleError,
    reasoning::{map_decision, parse_offer_reasoning, ParsedOfferReasoning},
    stream::{
        dispatch, AgentComplete, AgentSkip, AgentStart, EvaluationHandler, PipelineComplete,
        PipelineEvent, PipelineStart, PlannerComplete, SolverComplete, StreamFailure, WorkerStep,
    },
    types::{
        AgentState, AgentStatus, EvaluationStep, FinalDecision, PendingApproval, Phase, StepStatus,
    },
};

/// Agent whose free-form reasoning carries the planner / worker / solver narration.
pub const OFFER_AGENT_ID: &str = "offer_orchestration";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunId(u64);

/// Shared "human review required" switch. Readers always see the latest value,
/// so a run consults the setting as it is when its pipeline completes.
#[derive(Debug, Clone, Default)]
pub struct HumanReviewToggle(Arc<AtomicBool>);

impl HumanReviewToggle {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct DashboardState {
    pub selected_pnr: Option<String>,
    pub phase: Phase,
    pub agents: Vec<AgentStatus>,
    pub steps: Vec<EvaluationStep>,
    pub planner_text: String,
    pub solver_text: String,
    pub offer_reasoning: Option<ParsedOfferReasoning>,
    pub final_decision: Option<FinalDecision>,
    pub pending_approval: Option<PendingApproval>,
    pub error: Option<String>,
    pub last_event: Option<String>,
}

impl DashboardState {
    fn for_pnr(pnr: Option<String>) -> Self {
        Self {
            selected_pnr: pnr,
            ..Self::default()
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&EvaluationStep> {
        self.steps.iter().find(|step| step.step_id == step_id)
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentStatus> {
        self.agents.iter().find(|agent| agent.agent_id == agent_id)
    }

    fn agent_mut(&mut self, agent_id: &str, agent_name: Option<&String>) -> &mut AgentStatus {
        if let Some(index) = self.agents.iter().position(|a| a.agent_id == agent_id) {
            return &mut self.agents[index];
        }

        self.agents.push(AgentStatus {
            agent_id: agent_id.to_string(),
            agent_name: agent_name
                .cloned()
                .unwrap_or_else(|| agent_id.to_string()),
            state: AgentState::Running,
            summary: None,
            reasoning: None,
        });
        let last = self.agents.len() - 1;
        &mut self.agents[last]
    }
}

/// Reduces one evaluation run at a time into [`DashboardState`].
#[derive(Debug)]
pub struct Dashboard {
    state: DashboardState,
    review: HumanReviewToggle,
    current_run: Option<RunId>,
    next_run: u64,
    finished: bool,
}

impl Dashboard {
    pub fn new(review: HumanReviewToggle) -> Self {
        Self {
            state: DashboardState::default(),
            review,
            current_run: None,
            next_run: 0,
            finished: false,
        }
    }

    pub fn state(&self) -> &DashboardState {
        &self.state
    }

    pub fn review(&self) -> &HumanReviewToggle {
        &self.review
    }

    pub fn current_run(&self) -> Option<RunId> {
        self.current_run
    }

    /// True once the run reached a terminal state (it may still await approval).
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn awaiting_approval(&self) -> bool {
        self.state.pending_approval.is_some()
    }

    /// Switches the selected record. Any live run is abandoned.
    pub fn select_pnr(&mut self, pnr: impl Into<String>) {
        self.current_run = None;
        self.finished = false;
        self.state = DashboardState::for_pnr(Some(pnr.into()));
    }

    pub fn start_run(&mut self, pnr: impl Into<String>) -> RunId {
        self.next_run += 1;
        let run = RunId(self.next_run);

        self.current_run = Some(run);
        self.finished = false;
        self.state = DashboardState::for_pnr(Some(pnr.into()));
        self.state.phase = Phase::Loading;

        tracing::info!(run = run.0, pnr = ?self.state.selected_pnr, "evaluation run started");
        run
    }

    fn accepts(&self, run: RunId) -> bool {
        self.current_run == Some(run)
    }

    /// True while `run` is current and still accepting events.
    pub fn is_live(&self, run: RunId) -> bool {
        self.accepts(run) && !self.finished
    }

    /// Applies an event of `run`. Returns false when the event was dropped
    /// because the run was superseded or already finished.
    pub fn apply(&mut self, run: RunId, event: &PipelineEvent) -> bool {
        if !self.accepts(run) {
            tracing::debug!(event = event.name(), "ignoring event from superseded run");
            return false;
        }
        if self.finished {
            tracing::debug!(event = event.name(), "ignoring event after run finished");
            return false;
        }

        tracing::debug!(event = event.name(), "applying event");
        self.state.last_event = Some(event.name().to_string());

        let mut reducer = RunReducer {
            state: &mut self.state,
            review: &self.review,
            finished: &mut self.finished,
        };
        dispatch(event, &mut reducer);
        true
    }

    /// Ends `run` on a transport or decode failure.
    pub fn fail_run(&mut self, run: RunId, error: &ConsoleError) {
        if !self.accepts(run) || self.finished {
            return;
        }

        tracing::warn!(%error, "evaluation run failed");
        self.state.error = Some(error.to_string());
        self.state.phase = Phase::Complete;
        self.finished = true;
    }

    /// Folds the result of the out-of-band approval-queue check into the
    /// pending decision. A failed check releases the decision (fail-open).
    pub fn reconcile_approval(&mut self, run: RunId, still_pending: Result<bool, ConsoleError>) {
        if !self.accepts(run) || self.state.pending_approval.is_none() {
            return;
        }

        match still_pending {
            Ok(true) => {
                tracing::info!("decision held for human approval");
            }
            Ok(false) => {
                tracing::info!("approval not required, releasing decision");
                self.release_pending();
            }
            Err(error) => {
                tracing::warn!(%error, "approval check failed, releasing decision");
                self.release_pending();
            }
        }
    }

    fn release_pending(&mut self) -> Option<FinalDecision> {
        let pending = self.state.pending_approval.take()?;
        self.state.final_decision = Some(pending.proposed.clone());
        Some(pending.proposed)
    }

    /// Adopts the held decision.
    pub fn approve(&mut self) -> Result<FinalDecision, ConsoleError> {
        self.release_pending().ok_or(ConsoleError::NoPendingApproval)
    }

    /// Discards the held decision in favour of a rejection record.
    pub fn reject(&mut self) -> Result<FinalDecision, ConsoleError> {
        self.state
            .pending_approval
            .take()
            .ok_or(ConsoleError::NoPendingApproval)?;

        let rejected = FinalDecision::rejected();
        self.state.final_decision = Some(rejected.clone());
        Ok(rejected)
    }

    pub fn dismiss_error(&mut self) {
        self.state.error = None;
    }
}

struct RunReducer<'a> {
    state: &'a mut DashboardState,
    review: &'a HumanReviewToggle,
    finished: &'a mut bool,
}

impl RunReducer<'_> {
    /// Phases only move forward within a run; `start_run` is the only reset.
    fn advance(&mut self, next: Phase) {
        if next < self.state.phase {
            tracing::debug!(from = ?self.state.phase, to = ?next, "ignoring backward phase change");
            return;
        }
        self.state.phase = next;
    }

    fn finish(&mut self) {
        self.advance(Phase::Complete);
        *self.finished = true;
    }
}

impl EvaluationHandler for RunReducer<'_> {
    fn on_pipeline_start(&mut self, _event: &PipelineStart) {
        self.advance(Phase::Loading);
    }

    fn on_agent_start(&mut self, event: &AgentStart) {
        let agent = self.state.agent_mut(&event.agent_id, event.agent_name.as_ref());
        agent.state = AgentState::Running;
    }

    fn on_agent_complete(&mut self, event: &AgentComplete) {
        let agent = self.state.agent_mut(&event.agent_id, event.agent_name.as_ref());
        agent.state = AgentState::Complete;
        agent.summary = event.summary.clone();
        agent.reasoning = event.reasoning.clone();

        if event.agent_id == OFFER_AGENT_ID {
            if let Some(reasoning) = &event.reasoning {
                self.state.offer_reasoning = Some(parse_offer_reasoning(reasoning));
            }
        }

        if let Some(reason) = event.ineligibility() {
            tracing::info!(agent = %event.agent_id, %reason, "customer ineligible, ending run");
            self.state.final_decision = Some(FinalDecision::suppressed(reason));
            self.finish();
        }
    }

    fn on_agent_skip(&mut self, event: &AgentSkip) {
        let agent = self.state.agent_mut(&event.agent_id, event.agent_name.as_ref());
        agent.state = AgentState::Skipped;
        agent.summary = event.reason.clone();
    }

    fn on_planner_complete(&mut self, event: &PlannerComplete) {
        if !self.state.steps.is_empty() {
            tracing::warn!("plan already received, ignoring repeated planner_complete");
            return;
        }

        self.advance(Phase::Planner);
        self.state.steps = event.plan.iter().map(EvaluationStep::from).collect();
        self.state.planner_text = event.reasoning.clone().unwrap_or_else(|| {
            event
                .plan
                .iter()
                .map(|step| format!("{}: {}", step.step_id, step.description))
                .collect::<Vec<_>>()
                .join("\n")
        });
    }

    fn on_worker_step(&mut self, event: &WorkerStep) {
        self.advance(Phase::Worker);

        let Some(index) = self
            .state
            .steps
            .iter()
            .position(|step| step.step_id == event.step_id)
        else {
            tracing::warn!(step = %event.step_id, "worker result for a step not in the plan");
            return;
        };

        let step = &mut self.state.steps[index];
        step.status = StepStatus::Complete;
        step.recommendation = event.recommendation.clone();

        if let Some(next) = self
            .state
            .steps
            .iter_mut()
            .find(|step| step.status == StepStatus::Pending)
        {
            next.status = StepStatus::Running;
        }
    }

    fn on_solver_complete(&mut self, event: &SolverComplete) {
        self.advance(Phase::Solver);
        self.state.solver_text = event.text();
    }

    fn on_pipeline_complete(&mut self, event: &PipelineComplete) {
        let decision = event
            .final_decision
            .as_ref()
            .map(map_decision)
            .unwrap_or_else(|| FinalDecision::suppressed("No decision returned"));

        // Read the toggle now, not when the run started.
        if self.review.is_enabled() && decision.is_offer() {
            self.state.pending_approval = Some(PendingApproval {
                request_id: event.approval_request_id.clone(),
                proposed: decision,
            });
        } else {
            self.state.final_decision = Some(decision);
        }

        self.finish();
    }

    fn on_error(&mut self, event: &StreamFailure) {
        self.state.error = Some(event.text().to_string());
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::{BackendDecision, PlanStep, SUPPRESSED_OFFER_TYPE};

    fn plan(ids: &[&str]) -> PipelineEvent {
        PipelineEvent::PlannerComplete(PlannerComplete {
            plan: ids
                .iter()
                .map(|id| PlanStep {
                    step_id: id.to_string(),
                    evaluation_type: "check".into(),
                    description: format!("evaluate {id}"),
                })
                .collect(),
            reasoning: Some("three checks".into()),
        })
    }

    fn worker(id: &str, recommendation: &str) -> PipelineEvent {
        PipelineEvent::WorkerStep(WorkerStep {
            step_id: id.into(),
            evaluation_type: None,
            recommendation: Some(recommendation.into()),
            result: None,
        })
    }

    fn offer_complete() -> PipelineEvent {
        PipelineEvent::PipelineComplete(PipelineComplete {
            final_decision: Some(BackendDecision {
                should_send_offer: true,
                offer_type: Some("IU_BUSINESS".into()),
                price: Some(499.0),
                discount_percent: Some(0.0),
                channel: Some("push".into()),
                reasoning: Some("strong fit".into()),
                ..BackendDecision::default()
            }),
            approval_request_id: Some("apr-7".into()),
            duration_ms: None,
        })
    }

    #[test]
    fn plan_worker_solver_sequence() {
        let mut dashboard = Dashboard::new(HumanReviewToggle::default());
        let run = dashboard.start_run("ABC123");
        assert_eq!(dashboard.state().phase, Phase::Loading);

        dashboard.apply(run, &plan(&["E1", "E2", "E3"]));
        let state = dashboard.state();
        assert_eq!(state.phase, Phase::Planner);
        assert_eq!(state.steps.len(), 3);
        assert!(state.steps.iter().all(|s| s.status == StepStatus::Pending));
        assert_eq!(
            state.steps.iter().map(|s| s.step_id.as_str()).collect::<Vec<_>>(),
            ["E1", "E2", "E3"]
        );

        dashboard.apply(run, &worker("E1", "eligible"));
        assert_eq!(dashboard.state().phase, Phase::Worker);
        assert_eq!(dashboard.state().step("E1").unwrap().status, StepStatus::Complete);
        assert_eq!(dashboard.state().step("E2").unwrap().status, StepStatus::Running);

        dashboard.apply(run, &worker("E2", "seats available"));
        dashboard.apply(run, &worker("E3", "low sensitivity"));
        let state = dashboard.state();
        assert!(state.steps.iter().all(|s| s.status == StepStatus::Complete));
        assert_eq!(
            state.step("E3").unwrap().recommendation.as_deref(),
            Some("low sensitivity")
        );

        dashboard.apply(
            run,
            &PipelineEvent::SolverComplete(SolverComplete {
                decision: Some("Send business upgrade".into()),
                reasoning: None,
            }),
        );
        assert_eq!(dashboard.state().phase, Phase::Solver);
        assert_eq!(dashboard.state().solver_text, "Send business upgrade");

        dashboard.apply(run, &offer_complete());
        let state = dashboard.state();
        assert_eq!(state.phase, Phase::Complete);
        assert_eq!(
            state.final_decision.as_ref().map(|d| d.offer_name.as_str()),
            Some("Business Class Upgrade")
        );
    }

    #[test]
    fn ineligible_customer_ends_run_early() {
        let mut dashboard = Dashboard::new(HumanReviewToggle::default());
        let run = dashboard.start_run("XYZ999");

        dashboard.apply(run, &PipelineEvent::PipelineStart(PipelineStart::default()));
        dashboard.apply(
            run,
            &PipelineEvent::AgentStart(AgentStart {
                agent_id: "customer_intelligence".into(),
                agent_name: None,
            }),
        );
        let outputs = json!({ "customer_eligible": false, "suppression_reason": "recent complaint" });
        dashboard.apply(
            run,
            &PipelineEvent::AgentComplete(AgentComplete {
                agent_id: "customer_intelligence".into(),
                agent_name: None,
                summary: None,
                reasoning: None,
                outputs: outputs.as_object().cloned().unwrap(),
                duration_ms: None,
            }),
        );

        let state = dashboard.state();
        assert_eq!(state.phase, Phase::Complete);
        let decision = state.final_decision.as_ref().unwrap();
        assert_eq!(decision.offer_type, SUPPRESSED_OFFER_TYPE);
        assert_eq!(decision.reasoning, "recent complaint");
        assert!(dashboard.is_finished());

        assert!(!dashboard.apply(
            run,
            &PipelineEvent::AgentStart(AgentStart {
                agent_id: "flight_optimization".into(),
                agent_name: None,
            })
        ));
        assert!(dashboard.state().agent("flight_optimization").is_none());
    }

    #[test]
    fn only_one_terminal_event_is_applied() {
        let mut dashboard = Dashboard::new(HumanReviewToggle::default());
        let run = dashboard.start_run("ABC123");

        assert!(dashboard.apply(run, &PipelineEvent::Error(StreamFailure::new("boom"))));
        assert!(!dashboard.apply(run, &offer_complete()));
        assert_eq!(dashboard.state().error.as_deref(), Some("boom"));
        assert!(dashboard.state().final_decision.is_none());
    }

    #[test]
    fn restart_resets_every_run_cell() {
        let mut dashboard = Dashboard::new(HumanReviewToggle::default());
        let first = dashboard.start_run("ABC123");
        dashboard.apply(first, &plan(&["E1", "E2"]));
        dashboard.apply(first, &worker("E1", "ok"));

        let second = dashboard.start_run("ABC123");
        let state = dashboard.state();
        assert!(state.steps.is_empty());
        assert!(state.planner_text.is_empty());
        assert!(state.final_decision.is_none());
        assert!(state.pending_approval.is_none());
        assert_eq!(state.phase, Phase::Loading);

        assert!(!dashboard.apply(first, &plan(&["STALE"])));
        assert!(dashboard.state().steps.is_empty());
        assert!(dashboard.apply(second, &plan(&["E9"])));
    }

    #[test]
    fn selecting_new_pnr_abandons_run() {
        let mut dashboard = Dashboard::new(HumanReviewToggle::default());
        let run = dashboard.start_run("ABC123");
        dashboard.apply(run, &plan(&["E1"]));

        dashboard.select_pnr("DEF456");
        assert_eq!(dashboard.state().selected_pnr.as_deref(), Some("DEF456"));
        assert_eq!(dashboard.state().phase, Phase::Idle);
        assert!(dashboard.state().steps.is_empty());
        assert!(!dashboard.apply(run, &worker("E1", "late")));
    }

    #[test]
    fn review_flag_is_read_at_completion_time() {
        let review = HumanReviewToggle::new(false);
        let mut dashboard = Dashboard::new(review.clone());
        let run = dashboard.start_run("ABC123");

        review.set(true);
        dashboard.apply(run, &offer_complete());

        let state = dashboard.state();
        assert!(state.final_decision.is_none());
        let pending = state.pending_approval.as_ref().expect("pending approval");
        assert_eq!(pending.request_id.as_deref(), Some("apr-7"));
    }

    #[test]
    fn review_turned_off_mid_run_finalizes_directly() {
        let review = HumanReviewToggle::new(true);
        let mut dashboard = Dashboard::new(review.clone());
        let run = dashboard.start_run("ABC123");

        review.set(false);
        dashboard.apply(run, &offer_complete());
        assert!(dashboard.state().pending_approval.is_none());
        assert!(dashboard.state().final_decision.is_some());
    }

    #[test]
    fn approval_check_outcomes() {
        let review = HumanReviewToggle::new(true);

        let mut held = Dashboard::new(review.clone());
        let run = held.start_run("ABC123");
        held.apply(run, &offer_complete());
        held.reconcile_approval(run, Ok(true));
        assert!(held.awaiting_approval());

        let mut released = Dashboard::new(review.clone());
        let run = released.start_run("ABC123");
        released.apply(run, &offer_complete());
        released.reconcile_approval(run, Err(ConsoleError::Transport("down".into())));
        assert!(!released.awaiting_approval());
        assert!(released.state().final_decision.is_some());
    }

    #[test]
    fn approve_and_reject_finalize_locally() {
        let review = HumanReviewToggle::new(true);

        let mut approving = Dashboard::new(review.clone());
        let run = approving.start_run("ABC123");
        approving.apply(run, &offer_complete());
        let adopted = approving.approve().unwrap();
        assert_eq!(adopted.offer_type, "IU_BUSINESS");
        assert!(matches!(approving.approve(), Err(ConsoleError::NoPendingApproval)));

        let mut rejecting = Dashboard::new(review);
        let run = rejecting.start_run("ABC123");
        rejecting.apply(run, &offer_complete());
        let rejected = rejecting.reject().unwrap();
        assert_eq!(rejected, FinalDecision::rejected());
        assert_eq!(rejecting.state().final_decision, Some(FinalDecision::rejected()));
    }

    #[test]
    fn run_is_live_until_finished_or_superseded() {
        let mut dashboard = Dashboard::new(HumanReviewToggle::default());
        let first = dashboard.start_run("ABC123");
        assert!(dashboard.is_live(first));

        let second = dashboard.start_run("XYZ789");
        assert!(!dashboard.is_live(first));
        assert!(dashboard.is_live(second));

        dashboard.fail_run(second, &ConsoleError::Transport("closed".into()));
        assert!(!dashboard.is_live(second));
    }

    #[test]
    fn late_events_never_move_the_phase_backward() {
        let mut dashboard = Dashboard::new(HumanReviewToggle::default());
        let run = dashboard.start_run("ABC123");

        dashboard.apply(run, &plan(&["E1", "E2"]));
        dashboard.apply(run, &worker("E1", "eligible"));
        dashboard.apply(
            run,
            &PipelineEvent::SolverComplete(SolverComplete {
                decision: Some("send IU_BUSINESS".into()),
                reasoning: None,
            }),
        );
        assert_eq!(dashboard.state().phase, Phase::Solver);

        dashboard.apply(run, &worker("E2", "inventory healthy"));
        assert_eq!(dashboard.state().phase, Phase::Solver);
        assert_eq!(
            dashboard.state().step("E2").map(|step| step.status),
            Some(StepStatus::Complete)
        );

        dashboard.apply(
            run,
            &PipelineEvent::PipelineStart(PipelineStart {
                pnr: "ABC123".into(),
                pattern: None,
            }),
        );
        assert_eq!(dashboard.state().phase, Phase::Solver);

        dashboard.apply(run, &plan(&["E9"]));
        let state = dashboard.state();
        assert_eq!(state.phase, Phase::Solver);
        assert_eq!(
            state.steps.iter().map(|s| s.step_id.as_str()).collect::<Vec<_>>(),
            ["E1", "E2"]
        );
        assert!(state.steps.iter().all(|s| s.status == StepStatus::Complete));
    }

    #[test]
    fn offer_agent_reasoning_is_parsed() {
        let mut dashboard = Dashboard::new(HumanReviewToggle::default());
        let run = dashboard.start_run("ABC123");
        dashboard.apply(
            run,
            &PipelineEvent::AgentComplete(AgentComplete {
                agent_id: OFFER_AGENT_ID.into(),
                agent_name: Some("Offer Orchestration".into()),
                summary: Some("chose business".into()),
                reasoning: Some("PLANNER\ncheck\nWORKER\n#E1 [inventory]: fine\nSOLVER\nsend".into()),
                outputs: Default::default(),
                duration_ms: Some(1200),
            }),
        );

        let parsed = dashboard.state().offer_reasoning.as_ref().unwrap();
        assert_eq!(parsed.planner, "check");
        assert_eq!(parsed.workers.len(), 1);
        assert_eq!(parsed.solver, "send");
        assert_eq!(
            dashboard.state().agent(OFFER_AGENT_ID).map(|a| a.state),
            Some(AgentState::Complete)
        );
    }

    #[test]
    fn transport_failure_sets_banner() {
        let mut dashboard = Dashboard::new(HumanReviewToggle::default());
        let run = dashboard.start_run("ABC123");
        dashboard.fail_run(run, &ConsoleError::Transport("connection reset".into()));

        assert_eq!(dashboard.state().phase, Phase::Complete);
        assert!(dashboard.state().error.as_deref().unwrap().contains("connection reset"));
        dashboard.dismiss_error();
        assert!(dashboard.state().error.is_none());
    }
}
