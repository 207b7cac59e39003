//! Internal crate error type plus the classified, wire-shaped `FlowError`.
//!
//! `FlowCraftError` is the `std::error::Error` the engine itself returns from
//! fallible operations (definition lookup, graph validation, serialization).
//! `FlowError` is a distinct, serializable *data* type produced by the error
//! classifier (see [`classify`]) and carried on `NodeExecution`/`FlowExecution`
//! records and emitted on the update stream; it is never a Rust error value.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum FlowCraftError {
  #[error("Flow '{flow_id}' not found")]
  FlowNotFound { flow_id: String },

  #[error("Flow '{name}' is not active")]
  FlowInactive { name: String },

  #[error("No entry node found in flow")]
  NoEntryNode,

  #[error("Unknown transition: node '{node_id}' points to missing next node '{next_node_id}'")]
  UnknownNextNode {
    node_id: String,
    next_node_id: String,
  },

  #[error("No handler registered for node type: {node_type}")]
  HandlerNotRegistered { node_type: String },

  #[error("Node '{node_name}' timed out after {timeout_ms}ms")]
  NodeTimedOut { node_name: String, timeout_ms: u64 },

  #[error("Definition store error: {message}")]
  DefinitionStoreError { message: String },

  #[error("Serialization error: {0}")]
  SerializationError(String),

  #[error("Execution '{execution_id}' is not active")]
  ExecutionNotActive { execution_id: String },

  #[error("{0}")]
  Other(String),
}

pub type Result<T> = std::result::Result<T, FlowCraftError>;

impl From<serde_json::Error> for FlowCraftError {
  fn from(err: serde_json::Error) -> Self {
    FlowCraftError::SerializationError(err.to_string())
  }
}

/// Category a [`classify`]d error falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
  Transient,
  Permanent,
  Unknown,
}

/// Recovery action the retry controller derives for a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorRecoveryAction {
  Retry,
  UseDefault,
  Skip,
  Fail,
}

/// A classified failure, ready to be attached to a `NodeExecution` or emitted
/// on the update stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowError {
  pub message: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub code: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status_code: Option<u16>,
  pub category: ErrorCategory,
  pub suggested_action: ErrorRecoveryAction,
  pub is_retryable: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub stack: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub context: Option<String>,
  pub timestamp: DateTime<Utc>,
}

struct PatternRule {
  pattern: &'static str,
  code: &'static str,
  category: ErrorCategory,
}

// Permanent patterns are checked before transient ones: specificity wins over
// generality (P7). Case-insensitive; compiled once behind a OnceLock so the
// classifier pays the regex-compile cost only on first use.
const PERMANENT_PATTERNS: &[PatternRule] = &[
  PatternRule {
    pattern: r"(?i)unauthorized|invalid (api )?key|invalid token|forbidden",
    code: "AUTH_ERROR",
    category: ErrorCategory::Permanent,
  },
  PatternRule {
    pattern: r"(?i)not found",
    code: "NOT_FOUND",
    category: ErrorCategory::Permanent,
  },
  PatternRule {
    pattern: r"(?i)validation|invalid input|required field|schema",
    code: "VALIDATION_ERROR",
    category: ErrorCategory::Permanent,
  },
  PatternRule {
    pattern: r"(?i)configuration|handler.?missing|flow.?inactive|agent.?not.?found",
    code: "CONFIGURATION_ERROR",
    category: ErrorCategory::Permanent,
  },
  PatternRule {
    pattern: r"(?i)content policy|content.?filter|safety",
    code: "CONTENT_POLICY",
    category: ErrorCategory::Permanent,
  },
  PatternRule {
    pattern: r"\b(400|401|403|404)\b",
    code: "HTTP_CLIENT_ERROR",
    category: ErrorCategory::Permanent,
  },
];

const TRANSIENT_PATTERNS: &[PatternRule] = &[
  PatternRule {
    pattern: r"(?i)connection reset|connection refused|econnreset|econnrefused|host not found|enotfound",
    code: "NETWORK_ERROR",
    category: ErrorCategory::Transient,
  },
  PatternRule {
    pattern: r"(?i)timed out|timeout|etimedout|socket hang up",
    code: "TIMEOUT_ERROR",
    category: ErrorCategory::Transient,
  },
  PatternRule {
    pattern: r"(?i)rate limit|too many requests|quota|\b429\b",
    code: "RATE_LIMIT_ERROR",
    category: ErrorCategory::Transient,
  },
  PatternRule {
    pattern: r"(?i)service unavailable|temporarily unavailable|overloaded|\bbusy\b|capacity|\b(500|502|503|504)\b",
    code: "SERVICE_UNAVAILABLE",
    category: ErrorCategory::Transient,
  },
  PatternRule {
    pattern: r"(?i)upstream|api error",
    code: "UPSTREAM_ERROR",
    category: ErrorCategory::Transient,
  },
];

struct CompiledTable {
  permanent: Vec<(Regex, &'static str)>,
  transient: Vec<(Regex, &'static str)>,
}

fn table() -> &'static CompiledTable {
  static TABLE: OnceLock<CompiledTable> = OnceLock::new();
  TABLE.get_or_init(|| CompiledTable {
    permanent: PERMANENT_PATTERNS
      .iter()
      .map(|r| (Regex::new(r.pattern).expect("valid pattern"), r.code))
      .collect(),
    transient: TRANSIENT_PATTERNS
      .iter()
      .map(|r| (Regex::new(r.pattern).expect("valid pattern"), r.code))
      .collect(),
  })
}

/// Classify a raw failure message (plus an optional HTTP status) into a
/// [`FlowError`]. Rules are applied in strict order: permanent patterns,
/// then transient, then an HTTP-status fallback, then the default `unknown`
/// category, and the first match wins (P6, P7).
pub fn classify(message: &str, status_code: Option<u16>) -> FlowError {
  let t = table();

  for (re, code) in &t.permanent {
    if re.is_match(message) {
      return build(message, Some((*code).to_string()), status_code, ErrorCategory::Permanent);
    }
  }

  for (re, code) in &t.transient {
    if re.is_match(message) {
      return build(message, Some((*code).to_string()), status_code, ErrorCategory::Transient);
    }
  }

  if let Some(status) = status_code {
    if status >= 500 || status == 429 {
      return build(message, Some(format!("HTTP_{status}")), status_code, ErrorCategory::Transient);
    }
    if (400..500).contains(&status) {
      return build(message, Some(format!("HTTP_{status}")), status_code, ErrorCategory::Permanent);
    }
  }

  build(message, None, status_code, ErrorCategory::Unknown)
}

fn build(
  message: &str,
  code: Option<String>,
  status_code: Option<u16>,
  category: ErrorCategory,
) -> FlowError {
  let (suggested_action, is_retryable) = match category {
    ErrorCategory::Permanent => (ErrorRecoveryAction::Fail, false),
    ErrorCategory::Transient => (ErrorRecoveryAction::Retry, true),
    ErrorCategory::Unknown => (ErrorRecoveryAction::Retry, true),
  };

  FlowError {
    message: message.to_string(),
    code,
    status_code,
    category,
    suggested_action,
    is_retryable,
    stack: None,
    context: None,
    timestamp: Utc::now(),
  }
}

/// True if `message` matches the timeout pattern used by the classifier.
pub fn is_timeout_error(message: &str) -> bool {
  Regex::new(r"(?i)timed out|timeout|etimedout")
    .expect("valid pattern")
    .is_match(message)
}

/// True if `message` matches the rate-limit pattern used by the classifier.
pub fn is_rate_limit_error(message: &str) -> bool {
  Regex::new(r"(?i)rate limit|too many requests|quota|\b429\b")
    .expect("valid pattern")
    .is_match(message)
}

/// Scan a message for a bare 3-digit HTTP-ish status code (`\b[45]\d\d\b`).
pub fn extract_status_code(message: &str) -> Option<u16> {
  let re = Regex::new(r"\b([45]\d{2})\b").expect("valid pattern");
  re.captures(message)
    .and_then(|c| c.get(1))
    .and_then(|m| m.as_str().parse().ok())
}
