pub mod error;
pub mod types;
pub mod config;
pub mod backend;
pub mod stream;
pub mod reasoning;
pub mod dashboard;
pub mod session;
pub mod demo;
pub mod scripted;

pub use error::ConsoleError;
pub use types::{
    AgentPrompt, AgentState, AgentStatus, ApprovalRequest, BackendDecision, Confidence,
    EvaluationStep, FinalDecision, InstructionResponse, PendingApproval, Phase, PlanStep,
    PnrDetail, PnrSummary, PolicyValue, PromptUpdate, ReviewerDecision, StepStatus,
};
pub use config::{AudioConfig, ConsoleConfig};
pub use backend::BackendClient;
pub use stream::{
    dispatch,
    EvaluationHandler,
    EvaluationStream,
    EventStreamClient,
    PipelineEvent,
    SseDecoder,
    SseFrame,
};
pub use reasoning::{
    map_decision,
    parse_offer_reasoning,
    ParsedOfferReasoning,
    ParsedWorkerStep,
};
pub use dashboard::{
    Dashboard,
    DashboardState,
    HumanReviewToggle,
    RunId,
};
pub use session::{
    ApprovalCheck,
    EvaluationSession,
    PolicySource,
    PolicyWatcher,
};
pub use demo::{
    AudioLibrary,
    AudioSource,
    DemoAction,
    DemoController,
    DemoHost,
    DemoPlayer,
    DemoScript,
    DemoStep,
    DemoStepKind,
    HttpAudioSource,
    PlaybackOutcome,
    PlaybackState,
};
