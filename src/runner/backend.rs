//! The execution backend the runner drives, and normalization of its
//! loosely-shaped responses.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::checks::PhaseChecksReport;

/// Longest response rendering kept in a missing-thread-id error, ellipsis
/// included.
const RESPONSE_SUMMARY_MAX: usize = 240;
const ELLIPSIS: &str = "...";

/// The next phase to run, with its rendered prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextPhasePrompt {
    pub plan_id: String,
    pub task_id: String,
    pub phase_id: String,
    pub is_last_phase: bool,
    pub prompt_text: String,
}

/// Phase status as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseStatusReport {
    pub status: String,
    pub commit_sha: Option<String>,
}

/// Per-message options forwarded to the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collaboration_mode: Option<Value>,
}

/// Identifier of an agent thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThreadId(String);

impl ThreadId {
    /// Trimmed id, or `None` when blank.
    pub fn new(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        (!trimmed.is_empty()).then(|| Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the runner needs from the host and the agent.
///
/// Implementations talk to whatever actually stores plans and runs agent
/// turns. Every method is a suspension point for the runner; none of them is
/// retried by it.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn connect_workspace(&self, workspace_id: &str) -> Result<()>;

    async fn prepare_execution(&self, workspace_id: &str, plan_id: &str) -> Result<()>;

    /// `None` once no runnable phase remains.
    async fn next_phase_prompt(
        &self,
        workspace_id: &str,
        plan_id: &str,
    ) -> Result<Option<NextPhasePrompt>>;

    async fn phase_status(
        &self,
        workspace_id: &str,
        plan_id: &str,
        task_id: &str,
        phase_id: &str,
    ) -> Result<PhaseStatusReport>;

    async fn run_phase_checks(
        &self,
        workspace_id: &str,
        plan_id: &str,
        task_id: &str,
        phase_id: &str,
    ) -> Result<PhaseChecksReport>;

    /// Raw response; see [`extract_thread_id`].
    async fn start_thread(&self, workspace_id: &str) -> Result<Value>;

    /// Raw response; see [`extract_turn_id`].
    async fn send_user_message(
        &self,
        workspace_id: &str,
        thread_id: &ThreadId,
        text: &str,
        options: &MessageOptions,
    ) -> Result<Value>;

    async fn interrupt_turn(
        &self,
        workspace_id: &str,
        thread_id: &ThreadId,
        turn_id: &str,
    ) -> Result<()>;
}

/// `response.<key>.id`, or `response.result.<key>.id`, trimmed and non-empty.
fn nested_id<'v>(response: &'v Value, key: &str) -> Option<&'v str> {
    let direct = response.get(key).and_then(|obj| obj.get("id"));
    let nested = response
        .get("result")
        .and_then(|result| result.get(key))
        .and_then(|obj| obj.get("id"));
    [direct, nested]
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|id| !id.is_empty())
}

/// Thread id from a start-thread response, flat `{thread:{id}}` or nested
/// `{result:{thread:{id}}}`.
pub fn extract_thread_id(response: &Value) -> Option<ThreadId> {
    nested_id(response, "thread").and_then(ThreadId::new)
}

/// Turn id from a send-message response, same shapes as threads.
pub fn extract_turn_id(response: &Value) -> Option<String> {
    nested_id(response, "turn").map(str::to_string)
}

/// Compact JSON rendering of a response for error messages.
pub fn summarize_response(response: &Value) -> String {
    let text = response.to_string();
    if text.chars().count() <= RESPONSE_SUMMARY_MAX {
        return text;
    }
    let keep = RESPONSE_SUMMARY_MAX - ELLIPSIS.len();
    let mut cut: String = text.chars().take(keep).collect();
    cut.push_str(ELLIPSIS);
    cut
}
