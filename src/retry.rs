//! Per-node retry state and the retry controller's recovery-action decision.
//!
//! Decides between retry, use_default, skip, and fail based on a node's
//! retry policy, the classified error's category and code, and how many
//! attempts have already been spent.

use crate::error::{ErrorCategory, ErrorRecoveryAction, FlowError};
use crate::model::FlowNode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Retry policy for a single node. `policy_for` derives this from a node's
/// own settings layered over these defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
  pub enabled: bool,
  pub max_retries: u32,
  pub initial_delay_ms: u64,
  pub max_delay_ms: u64,
  pub backoff_multiplier: f64,
  pub use_jitter: bool,
  pub retry_on_categories: HashSet<ErrorCategory>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub retry_on_codes: Option<HashSet<String>>,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      max_retries: 3,
      initial_delay_ms: 1000,
      max_delay_ms: 30_000,
      backoff_multiplier: 2.0,
      use_jitter: true,
      retry_on_categories: [ErrorCategory::Transient, ErrorCategory::Unknown].into_iter().collect(),
      retry_on_codes: None,
    }
  }
}

// `ErrorCategory` needs `Hash`/`Eq` to live in a `HashSet`; derive them here
// rather than on the classifier type itself since only this module needs set
// membership.
impl std::hash::Hash for ErrorCategory {
  fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
    std::mem::discriminant(self).hash(state);
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttempt {
  pub attempt_number: u32,
  pub started_at: DateTime<Utc>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub completed_at: Option<DateTime<Utc>>,
  pub delay_ms: u64,
  pub success: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRetryState {
  pub retry_count: u32,
  pub max_retries: u32,
  pub attempts: Vec<RetryAttempt>,
  pub is_waiting_for_retry: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub next_retry_at: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub last_error: Option<String>,
  pub total_retry_time: u64,
}

impl NodeRetryState {
  pub fn new(max_retries: u32) -> Self {
    Self {
      retry_count: 0,
      max_retries,
      attempts: Vec::new(),
      is_waiting_for_retry: false,
      next_retry_at: None,
      last_error: None,
      total_retry_time: 0,
    }
  }
}

/// Stateless decision logic; all state lives in the `NodeRetryState` passed
/// in and returned by each call.
pub struct RetryController;

impl RetryController {
  pub fn new_state(max_retries: u32) -> NodeRetryState {
    NodeRetryState::new(max_retries)
  }

  /// Record a completed attempt (successful or not), clearing the waiting
  /// flag and folding `delay_ms` into the running total.
  pub fn record_attempt(
    mut state: NodeRetryState,
    success: bool,
    delay_ms: u64,
    error: Option<String>,
  ) -> NodeRetryState {
    let attempt_number = state.retry_count + 1;
    state.attempts.push(RetryAttempt {
      attempt_number,
      started_at: Utc::now(),
      completed_at: Some(Utc::now()),
      delay_ms,
      success,
      error: error.clone(),
    });
    state.retry_count += 1;
    state.total_retry_time += delay_ms;
    state.is_waiting_for_retry = false;
    state.next_retry_at = None;
    if !success {
      state.last_error = error;
    }
    state
  }

  pub fn mark_waiting(
    mut state: NodeRetryState,
    next_retry_at: DateTime<Utc>,
    last_error: String,
  ) -> NodeRetryState {
    state.is_waiting_for_retry = true;
    state.next_retry_at = Some(next_retry_at);
    state.last_error = Some(last_error);
    state
  }

  /// Derive the retry policy for `node`: `agent` nodes overlay their own
  /// `retry_on_error`/`max_retries` on the defaults; every other node type
  /// gets retries disabled outright.
  pub fn policy_for(node: &FlowNode) -> RetryConfig {
    match node {
      FlowNode::Agent { retry_on_error, max_retries, .. } => RetryConfig {
        enabled: *retry_on_error,
        max_retries: *max_retries,
        ..RetryConfig::default()
      },
      _ => RetryConfig {
        enabled: false,
        max_retries: 0,
        ..RetryConfig::default()
      },
    }
  }

  /// True iff policy, attempt budget, category, code, and retryability all
  /// permit another attempt.
  pub fn should_retry(error: &FlowError, state: &NodeRetryState, policy: &RetryConfig) -> bool {
    if !policy.enabled {
      return false;
    }
    if state.retry_count >= policy.max_retries {
      return false;
    }
    if !policy.retry_on_categories.is_empty() && !policy.retry_on_categories.contains(&error.category)
    {
      return false;
    }
    if let (Some(codes), Some(code)) = (&policy.retry_on_codes, &error.code) {
      if !codes.contains(code) {
        return false;
      }
    }
    error.is_retryable
  }

  /// Recovery-action precedence: retry > use_default > skip > fail.
  pub fn recovery_action(
    node: &FlowNode,
    error: &FlowError,
    state: &NodeRetryState,
    policy: &RetryConfig,
  ) -> ErrorRecoveryAction {
    if Self::should_retry(error, state, policy) {
      return ErrorRecoveryAction::Retry;
    }
    let metadata = node.metadata();
    if metadata.get("defaultOnError").is_some() {
      return ErrorRecoveryAction::UseDefault;
    }
    let optional = metadata.get("optional").and_then(|v| v.as_bool()).unwrap_or(false);
    let skip_on_error = metadata.get("skipOnError").and_then(|v| v.as_bool()).unwrap_or(false);
    if optional || skip_on_error {
      return ErrorRecoveryAction::Skip;
    }
    ErrorRecoveryAction::Fail
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::classify;
  use crate::model::FlowNode;
  use serde_json::json;
  use std::collections::HashMap;

  fn agent_node(retry_on_error: bool, max_retries: u32, metadata: HashMap<String, serde_json::Value>) -> FlowNode {
    FlowNode::Agent {
      node_id: "n1".into(),
      name: "agent".into(),
      next_node_id: None,
      metadata,
      retry_on_error,
      max_retries,
      timeout_ms: None,
      settings: json!({}),
    }
  }

  #[test]
  fn retry_bound_respected() {
    let policy = RetryConfig { max_retries: 2, ..RetryConfig::default() };
    let mut state = RetryController::new_state(2);
    let error = classify("ECONNRESET", None);

    assert!(RetryController::should_retry(&error, &state, &policy));
    state = RetryController::record_attempt(state, false, 10, Some(error.message.clone()));
    assert!(RetryController::should_retry(&error, &state, &policy));
    state = RetryController::record_attempt(state, false, 20, Some(error.message.clone()));
    assert!(!RetryController::should_retry(&error, &state, &policy));
    assert_eq!(state.retry_count, 2);
  }

  #[test]
  fn recovery_precedence_retry_beats_default() {
    let mut metadata = HashMap::new();
    metadata.insert("defaultOnError".to_string(), json!({"answer": "fallback"}));
    let node = agent_node(true, 3, metadata);
    let state = RetryController::new_state(3);
    let policy = RetryController::policy_for(&node);
    let error = classify("ECONNRESET", None);

    assert_eq!(
      RetryController::recovery_action(&node, &error, &state, &policy),
      ErrorRecoveryAction::Retry
    );
  }

  #[test]
  fn recovery_precedence_default_beats_skip() {
    let mut metadata = HashMap::new();
    metadata.insert("defaultOnError".to_string(), json!("fallback"));
    metadata.insert("optional".to_string(), json!(true));
    let node = agent_node(false, 0, metadata);
    let state = RetryController::new_state(0);
    let policy = RetryController::policy_for(&node);
    let error = classify("schema validation failed", None);

    assert_eq!(
      RetryController::recovery_action(&node, &error, &state, &policy),
      ErrorRecoveryAction::UseDefault
    );
  }

  #[test]
  fn recovery_precedence_skip_beats_fail() {
    let mut metadata = HashMap::new();
    metadata.insert("skipOnError".to_string(), json!(true));
    let node = agent_node(false, 0, metadata);
    let state = RetryController::new_state(0);
    let policy = RetryController::policy_for(&node);
    let error = classify("schema validation failed", None);

    assert_eq!(
      RetryController::recovery_action(&node, &error, &state, &policy),
      ErrorRecoveryAction::Skip
    );
  }

  #[test]
  fn recovery_defaults_to_fail() {
    let node = agent_node(false, 0, HashMap::new());
    let state = RetryController::new_state(0);
    let policy = RetryController::policy_for(&node);
    let error = classify("schema validation failed", None);

    assert_eq!(
      RetryController::recovery_action(&node, &error, &state, &policy),
      ErrorRecoveryAction::Fail
    );
  }

  #[test]
  fn non_agent_nodes_never_retry() {
    let node = FlowNode::Input {
      node_id: "in".into(),
      name: "input".into(),
      next_node_id: None,
      metadata: HashMap::new(),
    };
    let policy = RetryController::policy_for(&node);
    assert!(!policy.enabled);
    assert_eq!(policy.max_retries, 0);
  }
}
