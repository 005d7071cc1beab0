//! Confidence Router: deterministic post-processing of classifier output.
//!
//! The classifier proposes an intent with a confidence. The router decides
//! whether that confidence is high enough to build, low enough to fall back
//! to chat, or in between (ask the user). Pure: no I/O, no clock, no state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::RouterThresholds;

// ─── Intent tokens ──────────────────────────────────────────────────────────

pub const INTENT_QUIZ_GENERATE: &str = "quiz_generate";
pub const INTENT_CONTENT_GENERATE: &str = "content_generate";
pub const INTENT_PAGE_BUILD: &str = "page_build";
pub const INTENT_DATA_ANALYZE: &str = "data_analyze";
pub const INTENT_CONTENT_REFINE: &str = "content_refine";
pub const INTENT_CHAT_SMALLTALK: &str = "chat_smalltalk";
pub const INTENT_CHAT_QA: &str = "chat_qa";
pub const INTENT_PAGE_FOLLOWUP: &str = "page_followup";
pub const INTENT_CLARIFY: &str = "clarify";

/// Intent used when a build request is too uncertain to act on.
pub const CHAT_FALLBACK_INTENT: &str = INTENT_CHAT_QA;

const BUILD_INTENTS: &[&str] = &[
    INTENT_QUIZ_GENERATE,
    INTENT_CONTENT_GENERATE,
    INTENT_PAGE_BUILD,
    INTENT_DATA_ANALYZE,
    INTENT_CONTENT_REFINE,
];

const CHAT_INTENTS: &[&str] = &[INTENT_CHAT_SMALLTALK, INTENT_CHAT_QA, INTENT_PAGE_FOLLOWUP];

/// Whether an intent can lead to generated output.
pub fn is_build_capable(intent: &str) -> bool {
    BUILD_INTENTS.contains(&intent)
}

/// Whether an intent is answered conversationally.
pub fn is_chat_family(intent: &str) -> bool {
    CHAT_INTENTS.contains(&intent)
}

// ─── RouterResult ───────────────────────────────────────────────────────────

/// Classifier output, and after [`route`], the routing decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterResult {
    pub intent: String,
    /// In `[0, 1]`. Out-of-range values are clamped by [`route`].
    pub confidence: f64,
    pub should_build: bool,
    pub clarifying_question: Option<String>,
    pub route_hint: Option<String>,
    /// Granularity of a requested modification (`block`, `section`, `page`).
    pub refine_scope: Option<String>,
    pub model_tier: String,
    pub suggested_tools: Vec<String>,
    pub candidate_tools: Vec<String>,
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub completeness: f64,
    pub missing_critical: Vec<String>,
    /// `direct`, `pipeline`, or `agent`.
    pub strategy: String,
}

impl Default for RouterResult {
    fn default() -> Self {
        Self {
            intent: CHAT_FALLBACK_INTENT.into(),
            confidence: 0.0,
            should_build: false,
            clarifying_question: None,
            route_hint: None,
            refine_scope: None,
            model_tier: "fast".into(),
            suggested_tools: Vec::new(),
            candidate_tools: Vec::new(),
            parameters: BTreeMap::new(),
            completeness: 0.0,
            missing_critical: Vec::new(),
            strategy: "direct".into(),
        }
    }
}

impl RouterResult {
    /// The result used when the classifier itself is unavailable.
    pub fn fallback_chat() -> Self {
        Self::default()
    }
}

// ─── Routing ────────────────────────────────────────────────────────────────

/// Apply the confidence bands to a classifier result.
///
/// | confidence            | build-capable intent      | `clarify` intent | chat intent |
/// |-----------------------|---------------------------|------------------|-------------|
/// | `>= build`            | build                     | unchanged        | unchanged   |
/// | `[clarify, build)`    | clarify                   | clarify          | unchanged   |
/// | `< clarify`           | chat fallback             | unchanged        | unchanged   |
///
/// Intents outside these cells leave untouched apart from the confidence
/// clamp. A middle-band clarify leaves with a non-empty question; `message`
/// picks the language of a synthesized one.
pub fn route(mut result: RouterResult, message: &str, thresholds: &RouterThresholds) -> RouterResult {
    let confidence = if result.confidence.is_nan() {
        0.0
    } else {
        result.confidence.clamp(0.0, 1.0)
    };
    result.confidence = confidence;

    let build_capable = is_build_capable(&result.intent);
    let is_clarify = result.intent == INTENT_CLARIFY;

    if build_capable && confidence >= thresholds.build_threshold {
        result.should_build = true;
    } else if (build_capable || is_clarify)
        && confidence >= thresholds.clarify_threshold
        && confidence < thresholds.build_threshold
    {
        result.intent = INTENT_CLARIFY.into();
        result.should_build = false;
        let has_question = result
            .clarifying_question
            .as_deref()
            .is_some_and(|q| !q.trim().is_empty());
        if !has_question {
            result.clarifying_question = Some(generic_clarifying_question(message).into());
        }
    } else if build_capable && confidence < thresholds.clarify_threshold {
        result.intent = CHAT_FALLBACK_INTENT.into();
        result.should_build = false;
    }

    result
}

/// A generic clarifying question in the language of the user's message.
pub fn generic_clarifying_question(message: &str) -> &'static str {
    if contains_han(message) {
        "能再具体说明一下您想要的内容吗？比如年级、主题和时长。"
    } else {
        "Could you tell me a bit more about what you need, such as the grade, topic, and length?"
    }
}

pub(crate) fn contains_han(text: &str) -> bool {
    text.chars().any(|c| matches!(c, '\u{4E00}'..='\u{9FFF}' | '\u{3400}'..='\u{4DBF}'))
}

/// One-line human-readable explanation of a routing decision.
pub fn explain(original: &RouterResult, routed: &RouterResult) -> String {
    if original.intent == routed.intent {
        format!(
            "Intent {} at confidence {:.2}; {}.",
            routed.intent,
            routed.confidence,
            if routed.should_build { "building" } else { "no build needed" }
        )
    } else {
        format!(
            "Classifier proposed {} at confidence {:.2}; routed to {}.",
            original.intent, routed.confidence, routed.intent
        )
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
