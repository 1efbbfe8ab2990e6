use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Offer type used for every "do not send" outcome.
pub const SUPPRESSED_OFFER_TYPE: &str = "NONE";
/// Offer type recorded when a reviewer rejects a proposed offer.
pub const REJECTED_OFFER_TYPE: &str = "REJECTED";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PnrSummary {
    pub pnr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loyalty_tier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hours_to_departure: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
}

impl PnrSummary {
    pub fn new(pnr: impl Into<String>) -> Self {
        Self {
            pnr: pnr.into(),
            customer_name: None,
            loyalty_tier: None,
            route: None,
            hours_to_departure: None,
            scenario: None,
        }
    }

    pub fn with_customer(mut self, name: impl Into<String>, tier: impl Into<String>) -> Self {
        self.customer_name = Some(name.into());
        self.loyalty_tier = Some(tier.into());
        self
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn with_scenario(mut self, scenario: impl Into<String>) -> Self {
        self.scenario = Some(scenario.into());
        self
    }
}

/// Enriched record as returned by `GET /api/pnrs/{id}`. Nested sections are
/// kept as raw JSON; the console only displays them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PnrDetail {
    pub pnr: String,
    #[serde(default)]
    pub customer: Value,
    #[serde(default)]
    pub flight: Value,
    #[serde(default)]
    pub reservation: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ml_scores: Option<Value>,
}

/// Pipeline phases in the order a run moves through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Idle,
    Loading,
    Planner,
    Worker,
    Solver,
    Complete,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Loading => "loading",
            Phase::Planner => "planner",
            Phase::Worker => "worker",
            Phase::Solver => "solver",
            Phase::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Complete,
}

/// One entry of the planner's plan as sent on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub step_id: String,
    pub evaluation_type: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationStep {
    pub step_id: String,
    pub evaluation_type: String,
    pub description: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
}

impl From<&PlanStep> for EvaluationStep {
    fn from(step: &PlanStep) -> Self {
        Self {
            step_id: step.step_id.clone(),
            evaluation_type: step.evaluation_type.clone(),
            description: step.description.clone(),
            status: StepStatus::Pending,
            recommendation: None,
        }
    }
}

/// Decision object as produced by the backend's solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BackendDecision {
    #[serde(default)]
    pub should_send_offer: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    /// Fraction in `[0, 1]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppression_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Confidence {
    High,
    Medium,
    NotApplicable,
}

impl Confidence {
    pub fn label(self) -> &'static str {
        match self {
            Confidence::High => "HIGH",
            Confidence::Medium => "MEDIUM",
            Confidence::NotApplicable => "N/A",
        }
    }
}

/// Flat display record for the decision panel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalDecision {
    pub offer_type: String,
    pub offer_name: String,
    pub price: f64,
    pub discount: f64,
    pub expected_value: f64,
    pub confidence: Confidence,
    pub channel: String,
    pub reasoning: String,
}

impl FinalDecision {
    pub fn suppressed(reason: impl Into<String>) -> Self {
        Self {
            offer_type: SUPPRESSED_OFFER_TYPE.to_string(),
            offer_name: "No Offer".to_string(),
            price: 0.0,
            discount: 0.0,
            expected_value: 0.0,
            confidence: Confidence::NotApplicable,
            channel: String::new(),
            reasoning: reason.into(),
        }
    }

    pub fn rejected() -> Self {
        Self {
            offer_type: REJECTED_OFFER_TYPE.to_string(),
            offer_name: "Offer Rejected".to_string(),
            price: 0.0,
            discount: 0.0,
            expected_value: 0.0,
            confidence: Confidence::NotApplicable,
            channel: String::new(),
            reasoning: "Rejected by human reviewer".to_string(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.offer_type != SUPPRESSED_OFFER_TYPE && self.offer_type != REJECTED_OFFER_TYPE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Running,
    Complete,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent_id: String,
    pub agent_name: String,
    pub state: AgentState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub proposed: FinalDecision,
}

/// An item of the backend's human-approval queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub pnr: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_decision: Option<BackendDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    /// Advisory countdown; nothing enforces the expiry on this side.
    pub fn time_remaining(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.expires_at
            .map(|expires| (expires - now).max(chrono::Duration::zero()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewerDecision {
    pub reviewer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyValue {
    pub key: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PolicyValue {
    pub fn is_overridden(&self) -> bool {
        self.default.as_ref().map_or(false, |default| default != &self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPrompt {
    pub agent: String,
    pub prompt: String,
    #[serde(default)]
    pub is_custom: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptUpdate {
    pub agent: String,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub prompt_updates: Vec<PromptUpdate>,
}
