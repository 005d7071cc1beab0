//! Terminal-state validation for tool-calling turns.
//!
//! Pure functions. The orchestrator records what happened in a
//! [`TurnTrace`], asks [`validate_terminal_state`] for a verdict, and asks
//! [`decide`] what to do about it given the retries already spent.

use super::types::{FinalResult, ResultStatus};

/// What the turn actually did, as seen by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnTrace {
    /// Every executed tool name (excluding `submit_result`).
    pub tool_calls: Vec<String>,
    /// Executed calls to artifact-producing tools, in call order.
    pub artifact_tool_calls: Vec<ArtifactCall>,
    /// Artifact ids actually emitted to the client.
    pub artifact_events: Vec<String>,
}

/// One artifact-tool call and the artifact it emitted, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactCall {
    pub tool: String,
    pub artifact_id: Option<String>,
}

impl TurnTrace {
    /// Artifact calls that emitted nothing and were not redone successfully
    /// by a later call to the same tool.
    pub fn failed_artifact_calls(&self) -> Vec<&str> {
        self.artifact_tool_calls
            .iter()
            .enumerate()
            .filter(|(i, call)| {
                call.artifact_id.is_none()
                    && !self.artifact_tool_calls[i + 1..]
                        .iter()
                        .any(|later| later.tool == call.tool && later.artifact_id.is_some())
            })
            .map(|(_, call)| call.tool.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    /// The result contradicts what happened. Must be retried.
    HardRetry(String),
    /// Plausible but probably not what was asked for.
    SoftRetry(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Accept a soft failure with a warning once retries are spent.
    pub accept_soft_failure: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Accept,
    Retry(String),
    AcceptWithWarning(String),
    Fail(String),
}

/// Check a terminal result against the trace. First failing rule wins:
///
/// 1. `artifact_ready` with no artifact tool call and no artifact event → hard
/// 2. an artifact tool call emitted no artifact and was not redone → hard
/// 3. `clarify_needed` without a question → hard
/// 4. an artifact was expected but the result is `answer_ready` → soft
pub fn validate_terminal_state(result: &FinalResult, trace: &TurnTrace, expect_artifact: bool) -> Verdict {
    if result.status == ResultStatus::ArtifactReady
        && trace.artifact_tool_calls.is_empty()
        && trace.artifact_events.is_empty()
    {
        return Verdict::HardRetry(
            "You reported artifact_ready but never called an artifact tool. \
             Call the appropriate generate or patch tool first, then submit_result."
                .into(),
        );
    }

    let failed = trace.failed_artifact_calls();
    if !failed.is_empty() {
        return Verdict::HardRetry(format!(
            "The artifact tool(s) {} produced no artifact. Call the tool again with valid arguments.",
            failed.join(", ")
        ));
    }

    if result.status == ResultStatus::ClarifyNeeded && result.clarify_question().is_none() {
        return Verdict::HardRetry(
            "You reported clarify_needed without a question. \
             Include clarify.question with the one thing you need to know."
                .into(),
        );
    }

    if expect_artifact && result.status == ResultStatus::AnswerReady {
        return Verdict::SoftRetry(
            "The user asked for generated content, but you only answered in text. \
             Produce the artifact with a tool, then submit_result with status artifact_ready."
                .into(),
        );
    }

    Verdict::Pass
}

/// Decide what to do with a verdict given `retries_used` so far.
pub fn decide(verdict: Verdict, retries_used: u32, policy: &RetryPolicy) -> RetryDecision {
    let can_retry = retries_used < policy.max_retries;
    match verdict {
        Verdict::Pass => RetryDecision::Accept,
        Verdict::HardRetry(reason) if can_retry => RetryDecision::Retry(reason),
        Verdict::HardRetry(reason) => RetryDecision::Fail(reason),
        Verdict::SoftRetry(reason) if can_retry => RetryDecision::Retry(reason),
        Verdict::SoftRetry(reason) if policy.accept_soft_failure => RetryDecision::AcceptWithWarning(reason),
        Verdict::SoftRetry(reason) => RetryDecision::Fail(reason),
    }
}
