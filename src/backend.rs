use reqwest::{Client, Response, Url};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{
    config::ConsoleConfig,
    error::ConsoleError,
    types::{
        AgentPrompt, ApprovalRequest, InstructionResponse, PnrDetail, PnrSummary, PolicyValue,
        ReviewerDecision,
    },
};

/// REST side of the offers backend. The evaluation stream lives in
/// [`crate::stream::EventStreamClient`].
#[derive(Debug, Clone)]
pub struct BackendClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    detail: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct PolicyUpdateBody<'a> {
    value: &'a Value,
}

#[derive(Debug, Serialize)]
struct PromptUpdateBody<'a> {
    prompt: &'a str,
}

#[derive(Debug, Serialize)]
struct InstructionBody<'a> {
    instruction: &'a str,
}

impl BackendClient {
    pub fn from_config(config: &ConsoleConfig) -> Result<Self, ConsoleError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ConsoleError> {
        endpoint_url(&self.base_url, segments)
    }

    pub async fn list_pnrs(&self) -> Result<Vec<PnrSummary>, ConsoleError> {
        self.get_json(&["api", "pnrs"]).await
    }

    pub async fn get_pnr(&self, pnr: &str) -> Result<PnrDetail, ConsoleError> {
        self.get_json(&["api", "pnrs", pnr]).await
    }

    pub async fn pending_approvals(&self) -> Result<Vec<ApprovalRequest>, ConsoleError> {
        self.get_json(&["api", "approvals", "pending"]).await
    }

    /// Whether the approval queue still holds an item for `pnr`.
    pub async fn has_pending_approval(&self, pnr: &str) -> Result<bool, ConsoleError> {
        let pending = self.pending_approvals().await?;
        Ok(pending.iter().any(|request| request.pnr == pnr))
    }

    pub async fn approve(
        &self,
        request_id: &str,
        decision: &ReviewerDecision,
    ) -> Result<Value, ConsoleError> {
        self.post_json(&["api", "approvals", request_id, "approve"], decision)
            .await
    }

    pub async fn deny(
        &self,
        request_id: &str,
        decision: &ReviewerDecision,
    ) -> Result<Value, ConsoleError> {
        self.post_json(&["api", "approvals", request_id, "deny"], decision)
            .await
    }

    pub async fn resume(&self, request_id: &str) -> Result<Value, ConsoleError> {
        self.post_json(&["api", "approvals", request_id, "resume"], &Value::Null)
            .await
    }

    pub async fn list_policies(&self) -> Result<Vec<PolicyValue>, ConsoleError> {
        self.get_json(&["api", "policies"]).await
    }

    pub async fn update_policy(&self, key: &str, value: &Value) -> Result<PolicyValue, ConsoleError> {
        let response = self
            .client
            .put(self.endpoint(&["api", "policies", key])?)
            .json(&PolicyUpdateBody { value })
            .send()
            .await?;
        decode(response).await
    }

    pub async fn reset_policy(&self, key: &str) -> Result<PolicyValue, ConsoleError> {
        self.post_json(&["api", "policies", key, "reset"], &Value::Null)
            .await
    }

    pub async fn get_prompt(&self, agent: &str) -> Result<AgentPrompt, ConsoleError> {
        self.get_json(&["api", "prompts", agent]).await
    }

    pub async fn update_prompt(&self, agent: &str, prompt: &str) -> Result<AgentPrompt, ConsoleError> {
        let response = self
            .client
            .put(self.endpoint(&["api", "prompts", agent])?)
            .json(&PromptUpdateBody { prompt })
            .send()
            .await?;
        decode(response).await
    }

    pub async fn reset_prompt(&self, agent: &str) -> Result<AgentPrompt, ConsoleError> {
        self.post_json(&["api", "prompts", agent, "reset"], &Value::Null)
            .await
    }

    /// Sends a free-text instruction and applies nothing locally; callers
    /// decide what to do with the returned prompt updates.
    pub async fn send_instruction(&self, instruction: &str) -> Result<InstructionResponse, ConsoleError> {
        self.post_json(&["api", "instructions"], &InstructionBody { instruction })
            .await
    }

    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, ConsoleError> {
        let url = self.endpoint(segments)?;
        tracing::debug!(%url, "GET");
        let response = self.client.get(url).send().await?;
        decode(response).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        segments: &[&str],
        body: &B,
    ) -> Result<T, ConsoleError> {
        let url = self.endpoint(segments)?;
        tracing::debug!(%url, "POST");
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await?;
        decode(response).await
    }
}

/// Appends `segments` to the base URL's path, percent-encoding each one so
/// identifiers containing `/`, `?` or spaces stay a single segment.
pub(crate) fn endpoint_url(base_url: &str, segments: &[&str]) -> Result<Url, ConsoleError> {
    let mut url = Url::parse(base_url)
        .map_err(|err| ConsoleError::InvalidConfig(format!("invalid base_url `{base_url}`: {err}")))?;
    url.path_segments_mut()
        .map_err(|()| ConsoleError::InvalidConfig(format!("base_url `{base_url}` cannot take a path")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

pub(crate) async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ConsoleError> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await?;
        return Err(backend_error(status.as_u16(), &text));
    }

    Ok(response.json().await?)
}

pub(crate) fn backend_error(status: u16, body: &str) -> ConsoleError {
    let message = serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .and_then(|envelope| {
            envelope
                .detail
                .map(|detail| match detail {
                    Value::String(text) => text,
                    other => other.to_string(),
                })
                .or(envelope.error)
                .or(envelope.message)
        })
        .unwrap_or_else(|| body.trim().to_string());

    ConsoleError::Backend { status, message }
}
