//! A canned offers backend served over axum.
//!
//! Every route the console talks to is implemented against in-memory data, and
//! evaluations replay fixed event sequences over SSE. Useful for offline demos
//! and for exercising the client end to end.
//!
//! | PNR | outcome |
//! |---|---|
//! | `ABC123` | business upgrade, no discount |
//! | `XYZ789` | customer ineligible (recent complaint) |
//! | `LMN456` | discounted premium economy upgrade |
//! | `ERR500` | backend error mid-stream |
//! | `DROP01` | connection dropped before completion |

use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post, put},
    Router,
};
use chrono::Utc;
use futures_core::Stream;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::{
    stream::{
        AgentComplete, AgentSkip, AgentStart, PipelineComplete, PipelineEvent, PipelineStart,
        PlannerComplete, SolverComplete, StreamFailure, WorkerStep,
    },
    types::{
        AgentPrompt, ApprovalRequest, BackendDecision, InstructionResponse, PlanStep, PnrDetail,
        PnrSummary, PolicyValue, PromptUpdate,
    },
};

/// Policy key that makes the backend queue offers for human approval.
pub const APPROVAL_POLICY: &str = "require_human_approval";

const OFFER_REASONING: &str = "\
══════════════════════════
📋 PLANNER (ReWOO pattern)
══════════════════════════
Plan:
Confirm eligibility, check upgrade inventory, then size the price.

🔧 WORKER RESULTS
#E1 [customer_eligibility]: Gold member, no open complaints, opted in to push.
→ Recommendation: eligible
#E2 [inventory]: 6 business seats unsold at T-72h.
✓ upgrade inventory healthy
#E3 [price_sensitivity]: Propensity 0.71, low price sensitivity.
→ full price

✅ SOLVER
──────────
Offer IU_BUSINESS at $499 via push, no discount needed.
";

const DISCOUNT_REASONING: &str = "\
PLANNER
Plan:
Confirm eligibility, check cabin inventory, then size the price.

WORKER
#E1 [customer_eligibility]: Silver member, eligible.
✓ eligible
#E2 [inventory]: Business full, 9 premium economy seats open.
⚠ business unavailable, fall back to premium economy
#E3 [price_sensitivity]: Propensity 0.38, price sensitive.
→ Recommendation: discount 15%

SOLVER
Offer IU_PREMIUM_ECONOMY at $149 with 15% off via email.
";

#[derive(Debug)]
struct Store {
    approvals: Vec<ApprovalRequest>,
    policies: Vec<PolicyValue>,
    prompts: HashMap<String, AgentPrompt>,
    next_approval: u64,
}

/// Shared state behind [`router`].
#[derive(Debug)]
pub struct ScriptedBackend {
    store: Mutex<Store>,
    event_delay: Duration,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            store: Mutex::new(Store {
                approvals: Vec::new(),
                policies: default_policies(),
                prompts: default_prompts(),
                next_approval: 0,
            }),
            event_delay: Duration::ZERO,
        }
    }

    /// Pause between replayed events.
    pub fn with_event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = delay;
        self
    }

    pub fn with_approval_required(self, required: bool) -> Self {
        if let Some(policy) = self
            .store()
            .policies
            .iter_mut()
            .find(|policy| policy.key == APPROVAL_POLICY)
        {
            policy.value = Value::Bool(required);
        }
        self
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn approval_required(&self) -> bool {
        self.store()
            .policies
            .iter()
            .find(|policy| policy.key == APPROVAL_POLICY)
            .and_then(|policy| policy.value.as_bool())
            .unwrap_or(false)
    }

    /// Events for one evaluation of `pnr`, queueing an approval request when
    /// the approval policy is on and the run ends in an offer.
    fn start_evaluation(&self, pnr: &str) -> Option<Vec<PipelineEvent>> {
        let mut events = canned_events(pnr)?;
        let require_approval = self.approval_required();

        if let Some(PipelineEvent::PipelineComplete(complete)) = events.last_mut() {
            let proposed = complete
                .final_decision
                .clone()
                .filter(|decision| decision.should_send_offer);

            if let (true, Some(decision)) = (require_approval, proposed) {
                let mut store = self.store();
                store.next_approval += 1;
                let id = format!("apr-{}", store.next_approval);
                let now = Utc::now();
                store.approvals.push(ApprovalRequest {
                    id: id.clone(),
                    pnr: pnr.to_string(),
                    status: "pending".to_string(),
                    reason: Some("Offer requires human approval".to_string()),
                    proposed_decision: Some(decision),
                    created_at: Some(now),
                    expires_at: Some(now + chrono::Duration::minutes(10)),
                });
                tracing::info!(pnr, approval = %id, "queued offer for approval");
                complete.approval_request_id = Some(id);
            }
        }

        Some(events)
    }

    fn resolve_approval(&self, id: &str, status: &str) -> Result<Value, ApiError> {
        let mut store = self.store();
        let index = store
            .approvals
            .iter()
            .position(|request| request.id == id)
            .ok_or_else(|| ApiError::not_found(format!("approval request {id} not found")))?;

        let request = store.approvals.remove(index);
        tracing::info!(approval = %id, pnr = %request.pnr, status, "approval resolved");
        Ok(json!({ "id": request.id, "pnr": request.pnr, "status": status }))
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn not_found(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            detail: detail.into(),
        }
    }

    fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

type Shared = State<Arc<ScriptedBackend>>;

pub fn router(backend: ScriptedBackend) -> Router {
    Router::new()
        .route("/api/pnrs", get(list_pnrs))
        .route("/api/pnrs/{pnr}", get(get_pnr))
        .route("/api/pnrs/{pnr}/evaluate", get(evaluate))
        .route("/api/approvals/pending", get(pending_approvals))
        .route("/api/approvals/{id}/approve", post(approve))
        .route("/api/approvals/{id}/deny", post(deny))
        .route("/api/approvals/{id}/resume", post(resume))
        .route("/api/policies", get(list_policies))
        .route("/api/policies/{key}", put(update_policy))
        .route("/api/policies/{key}/reset", post(reset_policy))
        .route("/api/prompts/{agent}", get(get_prompt).put(update_prompt))
        .route("/api/prompts/{agent}/reset", post(reset_prompt))
        .route("/api/instructions", post(send_instruction))
        .route("/api/tts", post(tts))
        .with_state(Arc::new(backend))
}

async fn list_pnrs() -> Json<Vec<PnrSummary>> {
    Json(pnr_summaries())
}

async fn get_pnr(Path(pnr): Path<String>) -> Result<Json<PnrDetail>, ApiError> {
    pnr_detail(&pnr)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("PNR {pnr} not found")))
}

async fn evaluate(
    State(backend): Shared,
    Path(pnr): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let events = backend
        .start_evaluation(&pnr)
        .ok_or_else(|| ApiError::not_found(format!("PNR {pnr} not found")))?;
    let delay = backend.event_delay;

    let stream = async_stream::stream! {
        for event in events {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match event.to_frame() {
                Ok(frame) => yield Ok(Event::default().event(frame.event).data(frame.data)),
                Err(error) => {
                    tracing::warn!(%error, "failed to encode scripted event");
                    break;
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn pending_approvals(State(backend): Shared) -> Json<Vec<ApprovalRequest>> {
    Json(backend.store().approvals.clone())
}

async fn approve(State(backend): Shared, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    backend.resolve_approval(&id, "approved").map(Json)
}

async fn deny(State(backend): Shared, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    backend.resolve_approval(&id, "denied").map(Json)
}

async fn resume(State(backend): Shared, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    let known = backend.store().approvals.iter().any(|request| request.id == id);
    if !known {
        return Err(ApiError::not_found(format!("approval request {id} not found")));
    }
    Ok(Json(json!({ "id": id, "status": "resumed" })))
}

async fn list_policies(State(backend): Shared) -> Json<Vec<PolicyValue>> {
    Json(backend.store().policies.clone())
}

#[derive(Debug, Deserialize)]
struct PolicyBody {
    value: Value,
}

async fn update_policy(
    State(backend): Shared,
    Path(key): Path<String>,
    Json(body): Json<PolicyBody>,
) -> Result<Json<PolicyValue>, ApiError> {
    let mut store = backend.store();
    let policy = store
        .policies
        .iter_mut()
        .find(|policy| policy.key == key)
        .ok_or_else(|| ApiError::not_found(format!("unknown policy {key}")))?;

    policy.value = body.value;
    Ok(Json(policy.clone()))
}

async fn reset_policy(
    State(backend): Shared,
    Path(key): Path<String>,
) -> Result<Json<PolicyValue>, ApiError> {
    let mut store = backend.store();
    let policy = store
        .policies
        .iter_mut()
        .find(|policy| policy.key == key)
        .ok_or_else(|| ApiError::not_found(format!("unknown policy {key}")))?;

    if let Some(default) = &policy.default {
        policy.value = default.clone();
    }
    Ok(Json(policy.clone()))
}

async fn get_prompt(
    State(backend): Shared,
    Path(agent): Path<String>,
) -> Result<Json<AgentPrompt>, ApiError> {
    backend
        .store()
        .prompts
        .get(&agent)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("unknown agent {agent}")))
}

#[derive(Debug, Deserialize)]
struct PromptBody {
    prompt: String,
}

async fn update_prompt(
    State(backend): Shared,
    Path(agent): Path<String>,
    Json(body): Json<PromptBody>,
) -> Result<Json<AgentPrompt>, ApiError> {
    if body.prompt.trim().is_empty() {
        return Err(ApiError::bad_request("prompt must not be empty"));
    }

    let mut store = backend.store();
    let prompt = store
        .prompts
        .get_mut(&agent)
        .ok_or_else(|| ApiError::not_found(format!("unknown agent {agent}")))?;

    prompt.prompt = body.prompt;
    prompt.is_custom = true;
    Ok(Json(prompt.clone()))
}

async fn reset_prompt(
    State(backend): Shared,
    Path(agent): Path<String>,
) -> Result<Json<AgentPrompt>, ApiError> {
    let default = default_prompts()
        .remove(&agent)
        .ok_or_else(|| ApiError::not_found(format!("unknown agent {agent}")))?;

    backend.store().prompts.insert(agent, default.clone());
    Ok(Json(default))
}

#[derive(Debug, Deserialize)]
struct InstructionBody {
    instruction: String,
}

/// Appends the instruction to the prompt of every agent it names, or to the
/// offer agent when it names none.
async fn send_instruction(
    State(backend): Shared,
    Json(body): Json<InstructionBody>,
) -> Result<Json<InstructionResponse>, ApiError> {
    let instruction = body.instruction.trim();
    if instruction.is_empty() {
        return Err(ApiError::bad_request("instruction must not be empty"));
    }

    let lowered = instruction.to_lowercase();
    let mut store = backend.store();
    let mut targets: Vec<String> = store
        .prompts
        .keys()
        .filter(|agent| lowered.contains(&agent.replace('_', " ")) || lowered.contains(agent.as_str()))
        .cloned()
        .collect();
    if targets.is_empty() {
        targets.push("offer_orchestration".to_string());
    }
    targets.sort();

    let mut updates = Vec::new();
    for agent in targets {
        if let Some(prompt) = store.prompts.get_mut(&agent) {
            prompt.prompt = format!("{}\n\nAdditional instruction: {}", prompt.prompt, instruction);
            prompt.is_custom = true;
            updates.push(PromptUpdate {
                agent,
                prompt: prompt.prompt.clone(),
            });
        }
    }

    Ok(Json(InstructionResponse {
        status: "applied".to_string(),
        message: Some(format!("updated {} prompt(s)", updates.len())),
        prompt_updates: updates,
    }))
}

async fn tts() -> ApiError {
    ApiError::not_found("text-to-speech is not configured")
}

fn default_policies() -> Vec<PolicyValue> {
    let policy = |key: &str, value: Value, description: &str| PolicyValue {
        key: key.to_string(),
        value: value.clone(),
        default: Some(value),
        description: Some(description.to_string()),
    };

    vec![
        policy("max_discount", json!(0.2), "Largest discount the offer agent may apply"),
        policy("min_expected_value", json!(25.0), "Offers below this expected value are suppressed"),
        policy("offer_cooldown_days", json!(7), "Days between offers to the same customer"),
        policy(APPROVAL_POLICY, json!(false), "Queue every offer for a human reviewer"),
    ]
}

fn default_prompts() -> HashMap<String, AgentPrompt> {
    [
        (
            "customer_intelligence",
            "Assess whether the customer is eligible for a commercial offer.",
        ),
        (
            "flight_optimization",
            "Report upgrade inventory and load factor for the booked flight.",
        ),
        (
            "offer_orchestration",
            "Plan the checks, run them, and choose the offer with the best expected value.",
        ),
    ]
    .into_iter()
    .map(|(agent, prompt)| {
        (
            agent.to_string(),
            AgentPrompt {
                agent: agent.to_string(),
                prompt: prompt.to_string(),
                is_custom: false,
            },
        )
    })
    .collect()
}

fn pnr_summaries() -> Vec<PnrSummary> {
    let with_hours = |summary: PnrSummary, hours: f64| PnrSummary {
        hours_to_departure: Some(hours),
        ..summary
    };

    vec![
        with_hours(
            PnrSummary::new("ABC123")
                .with_customer("Sarah Chen", "Gold")
                .with_route("JFK-ORD")
                .with_scenario("Business upgrade at full price"),
            72.0,
        ),
        with_hours(
            PnrSummary::new("XYZ789")
                .with_customer("Marcus Webb", "Platinum")
                .with_route("LAX-SFO")
                .with_scenario("Recent complaint, offer suppressed"),
            30.0,
        ),
        with_hours(
            PnrSummary::new("LMN456")
                .with_customer("Priya Natarajan", "Silver")
                .with_route("DFW-MIA")
                .with_scenario("Price sensitive, discounted premium economy"),
            96.0,
        ),
        with_hours(
            PnrSummary::new("ERR500")
                .with_customer("Test Passenger", "General")
                .with_route("ORD-DEN")
                .with_scenario("Backend failure mid-run"),
            48.0,
        ),
        with_hours(
            PnrSummary::new("DROP01")
                .with_customer("Test Passenger", "General")
                .with_route("SEA-BOS")
                .with_scenario("Connection dropped mid-run"),
            48.0,
        ),
    ]
}

fn pnr_detail(pnr: &str) -> Option<PnrDetail> {
    let summary = pnr_summaries().into_iter().find(|summary| summary.pnr == pnr)?;
    let (origin, destination) = summary
        .route
        .as_deref()
        .and_then(|route| route.split_once('-'))
        .unwrap_or(("", ""));

    Some(PnrDetail {
        pnr: summary.pnr.clone(),
        customer: json!({
            "name": summary.customer_name,
            "loyalty_tier": summary.loyalty_tier,
            "recent_complaint": pnr == "XYZ789",
        }),
        flight: json!({
            "origin": origin,
            "destination": destination,
            "hours_to_departure": summary.hours_to_departure,
        }),
        reservation: json!({
            "cabin": "Y",
            "fare_class": "M",
        }),
        ml_scores: Some(json!({
            "upgrade_propensity": if pnr == "LMN456" { 0.38 } else { 0.71 },
        })),
    })
}

fn agent_start(id: &str, name: &str) -> PipelineEvent {
    PipelineEvent::AgentStart(AgentStart {
        agent_id: id.to_string(),
        agent_name: Some(name.to_string()),
    })
}

fn agent_complete(id: &str, name: &str, summary: &str, outputs: Value) -> PipelineEvent {
    let outputs = match outputs {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    PipelineEvent::AgentComplete(AgentComplete {
        agent_id: id.to_string(),
        agent_name: Some(name.to_string()),
        summary: Some(summary.to_string()),
        reasoning: None,
        outputs,
        duration_ms: Some(420),
    })
}

fn plan() -> PipelineEvent {
    let step = |id: &str, kind: &str, description: &str| PlanStep {
        step_id: id.to_string(),
        evaluation_type: kind.to_string(),
        description: description.to_string(),
    };

    PipelineEvent::PlannerComplete(PlannerComplete {
        plan: vec![
            step("E1", "customer_eligibility", "Check loyalty status and suppression rules"),
            step("E2", "inventory", "Check upgrade inventory on the booked flight"),
            step("E3", "price_sensitivity", "Size the price from the propensity model"),
        ],
        reasoning: None,
    })
}

fn worker(id: &str, kind: &str, recommendation: &str) -> PipelineEvent {
    PipelineEvent::WorkerStep(WorkerStep {
        step_id: id.to_string(),
        evaluation_type: Some(kind.to_string()),
        recommendation: Some(recommendation.to_string()),
        result: None,
    })
}

fn offer_run(pnr: &str, reasoning: &str, recommendations: [&str; 3], decision: BackendDecision) -> Vec<PipelineEvent> {
    let solver_text = decision.reasoning.clone();

    vec![
        PipelineEvent::PipelineStart(PipelineStart {
            pnr: pnr.to_string(),
            pattern: Some("ReWOO".to_string()),
        }),
        agent_start("customer_intelligence", "Customer Intelligence"),
        agent_complete(
            "customer_intelligence",
            "Customer Intelligence",
            "Customer eligible for offers",
            json!({ "customer_eligible": true }),
        ),
        agent_start("flight_optimization", "Flight Optimization"),
        agent_complete(
            "flight_optimization",
            "Flight Optimization",
            "Upgrade inventory available",
            json!({ "inventory_available": true }),
        ),
        agent_start("offer_orchestration", "Offer Orchestration"),
        plan(),
        worker("E1", "customer_eligibility", recommendations[0]),
        worker("E2", "inventory", recommendations[1]),
        worker("E3", "price_sensitivity", recommendations[2]),
        PipelineEvent::SolverComplete(SolverComplete {
            decision: solver_text,
            reasoning: None,
        }),
        PipelineEvent::AgentComplete(AgentComplete {
            agent_id: "offer_orchestration".to_string(),
            agent_name: Some("Offer Orchestration".to_string()),
            summary: decision.offer_type.clone(),
            reasoning: Some(reasoning.to_string()),
            outputs: Map::new(),
            duration_ms: Some(1830),
        }),
        PipelineEvent::PipelineComplete(PipelineComplete {
            final_decision: Some(decision),
            approval_request_id: None,
            duration_ms: Some(2900),
        }),
    ]
}

fn canned_events(pnr: &str) -> Option<Vec<PipelineEvent>> {
    let start = PipelineEvent::PipelineStart(PipelineStart {
        pnr: pnr.to_string(),
        pattern: Some("ReWOO".to_string()),
    });

    let events = match pnr {
        "ABC123" => offer_run(
            pnr,
            OFFER_REASONING,
            ["eligible", "upgrade inventory healthy", "full price"],
            BackendDecision {
                should_send_offer: true,
                offer_type: Some("IU_BUSINESS".to_string()),
                price: Some(499.0),
                discount_percent: Some(0.0),
                expected_value: Some(187.5),
                channel: Some("push".to_string()),
                reasoning: Some("Offer IU_BUSINESS at $499 via push, no discount needed.".to_string()),
                suppression_reason: None,
            },
        ),
        "LMN456" => offer_run(
            pnr,
            DISCOUNT_REASONING,
            ["eligible", "business unavailable", "discount 15%"],
            BackendDecision {
                should_send_offer: true,
                offer_type: Some("IU_PREMIUM_ECONOMY".to_string()),
                price: Some(149.0),
                discount_percent: Some(0.15),
                expected_value: None,
                channel: Some("email".to_string()),
                reasoning: Some("Offer IU_PREMIUM_ECONOMY at $149 with 15% off via email.".to_string()),
                suppression_reason: None,
            },
        ),
        "XYZ789" => {
            let skip = |id: &str, name: &str| {
                PipelineEvent::AgentSkip(AgentSkip {
                    agent_id: id.to_string(),
                    agent_name: Some(name.to_string()),
                    reason: Some("Customer not eligible".to_string()),
                })
            };
            vec![
                start,
                agent_start("customer_intelligence", "Customer Intelligence"),
                agent_complete(
                    "customer_intelligence",
                    "Customer Intelligence",
                    "Customer not eligible",
                    json!({
                        "customer_eligible": false,
                        "suppression_reason": "Recent service complaint",
                    }),
                ),
                skip("flight_optimization", "Flight Optimization"),
                skip("offer_orchestration", "Offer Orchestration"),
                PipelineEvent::PipelineComplete(PipelineComplete {
                    final_decision: Some(BackendDecision {
                        should_send_offer: false,
                        suppression_reason: Some("Recent service complaint".to_string()),
                        ..BackendDecision::default()
                    }),
                    approval_request_id: None,
                    duration_ms: Some(610),
                }),
            ]
        }
        "ERR500" => vec![
            start,
            agent_start("customer_intelligence", "Customer Intelligence"),
            PipelineEvent::Error(StreamFailure::new("Inventory service unavailable")),
        ],
        "DROP01" => vec![
            start,
            agent_start("customer_intelligence", "Customer Intelligence"),
        ],
        _ => return None,
    };

    Some(events)
}

#[cfg(test)]
mod tests {
    use crate::reasoning::parse_offer_reasoning;

    use super::*;

    #[test]
    fn every_listed_pnr_has_a_run_and_detail() {
        for summary in pnr_summaries() {
            assert!(canned_events(&summary.pnr).is_some(), "{}", summary.pnr);
            assert!(pnr_detail(&summary.pnr).is_some(), "{}", summary.pnr);
        }
        assert!(canned_events("NOPE00").is_none());
    }

    #[test]
    fn approval_is_queued_only_for_offers_when_required() {
        let backend = ScriptedBackend::new().with_approval_required(true);

        let offer = backend.start_evaluation("ABC123").unwrap();
        match offer.last() {
            Some(PipelineEvent::PipelineComplete(complete)) => {
                assert_eq!(complete.approval_request_id.as_deref(), Some("apr-1"));
            }
            other => panic!("unexpected tail: {other:?}"),
        }

        backend.start_evaluation("XYZ789").unwrap();
        assert_eq!(backend.store().approvals.len(), 1);

        backend.resolve_approval("apr-1", "approved").unwrap();
        assert!(backend.store().approvals.is_empty());
        assert_eq!(
            backend.resolve_approval("apr-1", "approved").unwrap_err().status,
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn canned_reasoning_parses_into_three_workers() {
        for text in [OFFER_REASONING, DISCOUNT_REASONING] {
            let parsed = parse_offer_reasoning(text);
            assert_eq!(parsed.workers.len(), 3);
            assert!(!parsed.planner.is_empty());
            assert!(!parsed.solver.is_empty());
        }
    }
}
