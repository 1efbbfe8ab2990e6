use std::{
    fmt::Display,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_stream::try_stream;
use futures_core::Stream;
use futures_util::StreamExt;
use reqwest::{Client, Url};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    backend::{backend_error, endpoint_url},
    config::ConsoleConfig,
    error::ConsoleError,
    types::{BackendDecision, PlanStep},
};

pub type EvaluationStream =
    Pin<Box<dyn Stream<Item = Result<PipelineEvent, ConsoleError>> + Send>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PipelineStart {
    #[serde(default)]
    pub pnr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStart {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentComplete {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub outputs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl AgentComplete {
    /// `Some(reason)` when the agent reported the customer as ineligible.
    pub fn ineligibility(&self) -> Option<String> {
        match self.outputs.get("customer_eligible") {
            Some(Value::Bool(false)) => Some(
                self.outputs
                    .get("suppression_reason")
                    .and_then(Value::as_str)
                    .unwrap_or("Customer not eligible for offers")
                    .to_string(),
            ),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSkip {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerComplete {
    pub plan: Vec<PlanStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStep {
    pub step_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SolverComplete {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl SolverComplete {
    pub fn text(&self) -> String {
        self.decision
            .clone()
            .or_else(|| self.reasoning.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PipelineComplete {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_decision: Option<BackendDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StreamFailure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            error: None,
        }
    }

    pub fn text(&self) -> &str {
        self.message
            .as_deref()
            .or(self.error.as_deref())
            .unwrap_or("evaluation failed")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    PipelineStart(PipelineStart),
    AgentStart(AgentStart),
    AgentComplete(AgentComplete),
    AgentSkip(AgentSkip),
    PlannerComplete(PlannerComplete),
    WorkerStep(WorkerStep),
    SolverComplete(SolverComplete),
    PipelineComplete(PipelineComplete),
    Error(StreamFailure),
}

impl PipelineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::PipelineStart(_) => "pipeline_start",
            PipelineEvent::AgentStart(_) => "agent_start",
            PipelineEvent::AgentComplete(_) => "agent_complete",
            PipelineEvent::AgentSkip(_) => "agent_skip",
            PipelineEvent::PlannerComplete(_) => "planner_complete",
            PipelineEvent::WorkerStep(_) => "worker_step",
            PipelineEvent::SolverComplete(_) => "solver_complete",
            PipelineEvent::PipelineComplete(_) => "pipeline_complete",
            PipelineEvent::Error(_) => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineEvent::PipelineComplete(_) | PipelineEvent::Error(_))
    }

    /// Decodes a named SSE frame. Unknown event names yield `Ok(None)`.
    pub fn from_frame(frame: &SseFrame) -> Result<Option<Self>, ConsoleError> {
        let event = match frame.event.as_str() {
            "pipeline_start" => PipelineEvent::PipelineStart(payload(frame)?),
            "agent_start" => PipelineEvent::AgentStart(payload(frame)?),
            "agent_complete" => PipelineEvent::AgentComplete(payload(frame)?),
            "agent_skip" => PipelineEvent::AgentSkip(payload(frame)?),
            "planner_complete" => PipelineEvent::PlannerComplete(payload(frame)?),
            "worker_step" => PipelineEvent::WorkerStep(payload(frame)?),
            "solver_complete" => PipelineEvent::SolverComplete(payload(frame)?),
            "pipeline_complete" => PipelineEvent::PipelineComplete(payload(frame)?),
            "error" => PipelineEvent::Error(payload(frame)?),
            _ => return Ok(None),
        };

        Ok(Some(event))
    }

    /// Encodes the event as one SSE frame (used by the scripted backend).
    pub fn to_frame(&self) -> Result<SseFrame, ConsoleError> {
        let data = match self {
            PipelineEvent::PipelineStart(p) => serde_json::to_string(p)?,
            PipelineEvent::AgentStart(p) => serde_json::to_string(p)?,
            PipelineEvent::AgentComplete(p) => serde_json::to_string(p)?,
            PipelineEvent::AgentSkip(p) => serde_json::to_string(p)?,
            PipelineEvent::PlannerComplete(p) => serde_json::to_string(p)?,
            PipelineEvent::WorkerStep(p) => serde_json::to_string(p)?,
            PipelineEvent::SolverComplete(p) => serde_json::to_string(p)?,
            PipelineEvent::PipelineComplete(p) => serde_json::to_string(p)?,
            PipelineEvent::Error(p) => serde_json::to_string(p)?,
        };

        Ok(SseFrame {
            event: self.name().to_string(),
            data,
        })
    }
}

fn payload<T: DeserializeOwned>(frame: &SseFrame) -> Result<T, ConsoleError> {
    let data = if frame.data.trim().is_empty() {
        "{}"
    } else {
        frame.data.as_str()
    };

    serde_json::from_str(data).map_err(|err| ConsoleError::MalformedEvent {
        event: frame.event.clone(),
        reason: err.to_string(),
    })
}

/// Typed callbacks for a single evaluation run. Every method defaults to a no-op.
pub trait EvaluationHandler {
    fn on_pipeline_start(&mut self, _event: &PipelineStart) {}
    fn on_agent_start(&mut self, _event: &AgentStart) {}
    fn on_agent_complete(&mut self, _event: &AgentComplete) {}
    fn on_agent_skip(&mut self, _event: &AgentSkip) {}
    fn on_planner_complete(&mut self, _event: &PlannerComplete) {}
    fn on_worker_step(&mut self, _event: &WorkerStep) {}
    fn on_solver_complete(&mut self, _event: &SolverComplete) {}
    fn on_pipeline_complete(&mut self, _event: &PipelineComplete) {}
    fn on_error(&mut self, _event: &StreamFailure) {}
}

pub fn dispatch<H: EvaluationHandler + ?Sized>(event: &PipelineEvent, handler: &mut H) {
    match event {
        PipelineEvent::PipelineStart(e) => handler.on_pipeline_start(e),
        PipelineEvent::AgentStart(e) => handler.on_agent_start(e),
        PipelineEvent::AgentComplete(e) => handler.on_agent_complete(e),
        PipelineEvent::AgentSkip(e) => handler.on_agent_skip(e),
        PipelineEvent::PlannerComplete(e) => handler.on_planner_complete(e),
        PipelineEvent::WorkerStep(e) => handler.on_worker_step(e),
        PipelineEvent::SolverComplete(e) => handler.on_solver_complete(e),
        PipelineEvent::PipelineComplete(e) => handler.on_pipeline_complete(e),
        PipelineEvent::Error(e) => handler.on_error(e),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

impl SseFrame {
    pub fn encode(&self) -> String {
        let mut out = format!("event: {}\n", self.event);
        for line in self.data.lines() {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

/// Largest partial event the decoder will hold before giving up on the stream.
pub const MAX_EVENT_BYTES: usize = 1024 * 1024;

/// Incremental `text/event-stream` framer.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Bytes before this offset are known not to start a block separator.
    scanned: usize,
    limit: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_EVENT_BYTES)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            limit,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete frame, skipping comment-only and empty blocks. Fails once
    /// an unterminated event grows past the decoder's limit.
    pub fn next_frame(&mut self) -> Result<Option<SseFrame>, ConsoleError> {
        while let Some(block) = self.extract_block() {
            if let Some(frame) = parse_block(&block)? {
                return Ok(Some(frame));
            }
        }

        if self.buffer.len() > self.limit {
            return Err(ConsoleError::Transport(format!(
                "stream event exceeded {} bytes without a terminator",
                self.limit
            )));
        }
        Ok(None)
    }

    pub fn has_partial(&self) -> bool {
        self.buffer.iter().any(|b| !b.is_ascii_whitespace())
    }

    fn extract_block(&mut self) -> Option<Vec<u8>> {
        // A separator may straddle the previous scan end.
        let from = self.scanned.saturating_sub(3);
        let Some((pos, width)) = find_separator(&self.buffer[from..]) else {
            self.scanned = self.buffer.len();
            return None;
        };

        let pos = from + pos;
        let block = self.buffer[..pos].to_vec();
        self.buffer.drain(..pos + width);
        self.scanned = 0;
        Some(block)
    }
}

/// Earliest `\n\n` or `\r\n\r\n` as `(offset, width)`.
fn find_separator(bytes: &[u8]) -> Option<(usize, usize)> {
    bytes.iter().enumerate().find_map(|(pos, byte)| {
        if *byte != b'\n' && *byte != b'\r' {
            return None;
        }
        let rest = &bytes[pos..];
        if rest.starts_with(b"\n\n") {
            Some((pos, 2))
        } else if rest.starts_with(b"\r\n\r\n") {
            Some((pos, 4))
        } else {
            None
        }
    })
}

fn parse_block(block: &[u8]) -> Result<Option<SseFrame>, ConsoleError> {
    let text = String::from_utf8(block.to_vec())
        .map_err(|_| ConsoleError::Transport("stream event contained invalid utf-8".into()))?;

    let mut event = None;
    let mut data: Option<String> = None;
    for line in text.lines() {
        if line.starts_with(':') {
            continue;
        }
        if let Some(value) = line.strip_prefix("event:") {
            event = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            match data.as_mut() {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(value);
                }
                None => data = Some(value.to_string()),
            }
        }
    }

    if event.is_none() && data.is_none() {
        return Ok(None);
    }

    Ok(Some(SseFrame {
        event: event.unwrap_or_else(|| "message".to_string()),
        data: data.unwrap_or_default(),
    }))
}

/// Reports whether a stream still belongs to the newest evaluation started
/// on its client.
#[derive(Debug, Clone)]
pub struct ConnectionGuard {
    generation: u64,
    current: Arc<AtomicU64>,
}

impl ConnectionGuard {
    pub fn detached() -> Self {
        Self {
            generation: 0,
            current: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_live(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }
}

/// Turns a raw body into typed events. Ends after the first terminal event,
/// after a malformed payload, or silently once `guard` goes stale.
pub fn decode_events<S, B, E>(body: S, guard: ConnectionGuard) -> EvaluationStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let stream = try_stream! {
        let mut decoder = SseDecoder::new();
        let mut body = Box::pin(body);
        let mut terminated = false;

        'read: while let Some(chunk) = body.next().await {
            if !guard.is_live() {
                tracing::debug!("dropping superseded evaluation stream");
                terminated = true;
                break;
            }

            let chunk = chunk.map_err(|err| ConsoleError::Transport(err.to_string()))?;
            decoder.push(chunk.as_ref());

            while let Some(frame) = decoder.next_frame()? {
                if !guard.is_live() {
                    terminated = true;
                    break 'read;
                }

                let Some(event) = PipelineEvent::from_frame(&frame)? else {
                    tracing::debug!(event = %frame.event, "skipping unknown event");
                    continue;
                };

                let terminal = event.is_terminal();
                yield event;

                if terminal {
                    terminated = true;
                    break 'read;
                }
            }
        }

        if !terminated && guard.is_live() {
            Err::<(), _>(ConsoleError::Transport(
                "connection closed before pipeline_complete".to_string(),
            ))?;
        }
    };

    Box::pin(stream)
}

/// Opens one evaluation stream at a time. Starting a new evaluation (or
/// calling [`EventStreamClient::close`]) retires the previous connection.
#[derive(Debug, Clone)]
pub struct EventStreamClient {
    client: Client,
    base_url: String,
    generation: Arc<AtomicU64>,
}

impl EventStreamClient {
    pub fn from_config(config: &ConsoleConfig) -> Result<Self, ConsoleError> {
        // No overall timeout: a run may legitimately stream for minutes.
        let client = Client::builder().build()?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            generation: Arc::new(AtomicU64::new(0)),
        })
    }

    fn endpoint(&self, pnr: &str) -> Result<Url, ConsoleError> {
        endpoint_url(&self.base_url, &["api", "pnrs", pnr, "evaluate"])
    }

    /// Retires whatever stream is open.
    pub fn close(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Retires the open stream and claims the next generation without any
    /// I/O, so callers can order it with their own bookkeeping.
    pub fn reserve(&self) -> ConnectionGuard {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        ConnectionGuard {
            generation,
            current: Arc::clone(&self.generation),
        }
    }

    pub async fn evaluate(&self, pnr: &str) -> Result<EvaluationStream, ConsoleError> {
        let guard = self.reserve();
        self.open(pnr, guard).await
    }

    /// Connects a stream claimed earlier with [`EventStreamClient::reserve`].
    pub async fn open(
        &self,
        pnr: &str,
        guard: ConnectionGuard,
    ) -> Result<EvaluationStream, ConsoleError> {
        let generation = guard.generation;
        tracing::info!(pnr, generation, "opening evaluation stream");
        let response = self
            .client
            .get(self.endpoint(pnr)?)
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache")
            .send()
            .await
            .map_err(|err| ConsoleError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(backend_error(status.as_u16(), &text));
        }

        Ok(decode_events(response.bytes_stream(), guard))
    }
}

#[cfg(test)]
mod tests {
    use futures_util::{stream, StreamExt};

    use super::*;

    fn body(chunks: &[&str]) -> impl Stream<Item = Result<Vec<u8>, std::io::Error>> + Send + 'static {
        let owned: Vec<Result<Vec<u8>, std::io::Error>> =
            chunks.iter().map(|c| Ok(c.as_bytes().to_vec())).collect();
        stream::iter(owned)
    }

    async fn collect(stream: EvaluationStream) -> Vec<Result<PipelineEvent, ConsoleError>> {
        stream.collect().await
    }

    #[test]
    fn decoder_handles_split_chunks_and_comments() {
        let mut decoder = SseDecoder::new();
        decoder.push(b": keep-alive\n\nevent: agent_st");
        assert!(decoder.next_frame().unwrap().is_none());

        decoder.push(b"art\ndata: {\"agent_id\":\"a\"}\r\n\r\n");
        let frame = decoder.next_frame().unwrap().expect("frame");
        assert_eq!(frame.event, "agent_start");
        assert_eq!(frame.data, "{\"agent_id\":\"a\"}");
        assert!(!decoder.has_partial());
    }

    #[test]
    fn unterminated_event_past_the_limit_is_a_transport_error() {
        let mut decoder = SseDecoder::with_limit(64);
        decoder.push(b"event: worker_step\ndata: ");
        assert!(decoder.next_frame().unwrap().is_none());

        decoder.push(&[b'x'; 80]);
        assert!(matches!(
            decoder.next_frame(),
            Err(ConsoleError::Transport(_))
        ));
    }

    #[test]
    fn separator_split_across_pushes_is_found() {
        let mut decoder = SseDecoder::new();
        decoder.push(b"data: one\r\n\r");
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.push(b"\ndata: two\n");
        assert_eq!(decoder.next_frame().unwrap().unwrap().data, "one");
        decoder.push(b"\n");
        assert_eq!(decoder.next_frame().unwrap().unwrap().data, "two");
    }

    #[test]
    fn evaluate_endpoint_encodes_the_record_locator() {
        let client = EventStreamClient::from_config(&ConsoleConfig::new("http://localhost:8000/")).unwrap();
        assert_eq!(
            client.endpoint("AB/12 3").unwrap().as_str(),
            "http://localhost:8000/api/pnrs/AB%2F12%203/evaluate"
        );
    }

    #[test]
    fn reserving_a_stream_retires_the_previous_one() {
        let client = EventStreamClient::from_config(&ConsoleConfig::default()).unwrap();
        let first = client.reserve();
        assert!(first.is_live());

        let second = client.reserve();
        assert!(!first.is_live());
        assert!(second.is_live());

        client.close();
        assert!(!second.is_live());
    }

    #[test]
    fn multi_line_data_is_joined() {
        let mut decoder = SseDecoder::new();
        decoder.push(b"data: line one\ndata: line two\n\n");
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.event, "message");
        assert_eq!(frame.data, "line one\nline two");
    }

    #[test]
    fn frames_round_trip_through_encode() {
        let event = PipelineEvent::WorkerStep(WorkerStep {
            step_id: "E2".into(),
            evaluation_type: Some("inventory".into()),
            recommendation: Some("seats available".into()),
            result: None,
        });
        let encoded = event.to_frame().unwrap().encode();

        let mut decoder = SseDecoder::new();
        decoder.push(encoded.as_bytes());
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(PipelineEvent::from_frame(&frame).unwrap(), Some(event));
    }

    #[tokio::test]
    async fn stops_after_terminal_event() {
        let events = collect(decode_events(
            body(&[
                "event: pipeline_start\ndata: {\"pnr\":\"ABC123\"}\n\n",
                "event: pipeline_complete\ndata: {}\n\n",
                "event: agent_start\ndata: {\"agent_id\":\"late\"}\n\n",
            ]),
            ConnectionGuard::detached(),
        ))
        .await;

        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], Ok(PipelineEvent::PipelineComplete(_))));
    }

    #[tokio::test]
    async fn error_event_is_terminal() {
        let events = collect(decode_events(
            body(&[
                "event: error\ndata: {\"message\":\"backend exploded\"}\n\n",
                "event: pipeline_complete\ndata: {}\n\n",
            ]),
            ConnectionGuard::detached(),
        ))
        .await;

        assert_eq!(events.len(), 1);
        match &events[0] {
            Ok(PipelineEvent::Error(failure)) => assert_eq!(failure.text(), "backend exploded"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_payload_is_reported_distinctly() {
        let events = collect(decode_events(
            body(&[
                "event: planner_complete\ndata: {\"plan\": 7}\n\n",
                "event: pipeline_complete\ndata: {}\n\n",
            ]),
            ConnectionGuard::detached(),
        ))
        .await;

        assert_eq!(events.len(), 1);
        match &events[0] {
            Err(ConsoleError::MalformedEvent { event, .. }) => assert_eq!(event, "planner_complete"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn early_close_is_a_transport_error() {
        let events = collect(decode_events(
            body(&["event: pipeline_start\ndata: {}\n\n"]),
            ConnectionGuard::detached(),
        ))
        .await;

        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], Err(ConsoleError::Transport(_))));
    }

    #[tokio::test]
    async fn superseded_stream_ends_silently() {
        let current = Arc::new(AtomicU64::new(1));
        let guard = ConnectionGuard {
            generation: 1,
            current: Arc::clone(&current),
        };

        let mut events = decode_events(
            body(&[
                "event: pipeline_start\ndata: {}\n\n",
                "event: agent_start\ndata: {\"agent_id\":\"a\"}\n\n",
            ]),
            guard,
        );

        assert!(matches!(
            events.next().await,
            Some(Ok(PipelineEvent::PipelineStart(_)))
        ));
        current.fetch_add(1, Ordering::SeqCst);
        assert!(events.next().await.is_none());
    }

    #[test]
    fn ineligibility_reads_outputs() {
        let complete: AgentComplete = serde_json::from_str(
            r#"{"agent_id":"customer_intelligence","outputs":{"customer_eligible":false,"suppression_reason":"recent complaint"}}"#,
        )
        .unwrap();
        assert_eq!(complete.ineligibility().as_deref(), Some("recent complaint"));

        let eligible: AgentComplete = serde_json::from_str(
            r#"{"agent_id":"customer_intelligence","outputs":{"customer_eligible":true}}"#,
        )
        .unwrap();
        assert!(eligible.ineligibility().is_none());
    }

    #[derive(Default)]
    struct Counter {
        steps: usize,
        errors: usize,
    }

    impl EvaluationHandler for Counter {
        fn on_worker_step(&mut self, _event: &WorkerStep) {
            self.steps += 1;
        }

        fn on_error(&mut self, _event: &StreamFailure) {
            self.errors += 1;
        }
    }

    #[test]
    fn dispatch_routes_to_matching_handler() {
        let mut counter = Counter::default();
        dispatch(
            &PipelineEvent::WorkerStep(WorkerStep {
                step_id: "E1".into(),
                evaluation_type: None,
                recommendation: None,
                result: None,
            }),
            &mut counter,
        );
        dispatch(&PipelineEvent::Error(StreamFailure::new("x")), &mut counter);
        dispatch(&PipelineEvent::SolverComplete(SolverComplete::default()), &mut counter);

        assert_eq!(counter.steps, 1);
        assert_eq!(counter.errors, 1);
    }
}
