//! The flow/execution data model: the definitions fetched from the
//! definition store, the live mutable context a single run owns, and the
//! records persisted back to the execution store.
//!
//! Grounded on the teacher's `GraphNode`/`Flow` pair (`flow.rs`) for the
//! node-linkage shape, generalized from the teacher's DAG (dependencies +
//! `Map`/`While` node types) to a linear `nextNodeId` chain, and on
//! `config.rs`'s `#[serde(tag = "type")]` convention for tagging `FlowNode`
//! variants by their wire `type` field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::FlowError;

/// A mapping from string keys to arbitrary JSON values; `data`, `variables`,
/// and node `metadata` are all shaped this way.
pub type DynMap = HashMap<String, Value>;

/// Immutable flow definition as fetched from the definition store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
  pub id: String,
  pub name: String,
  pub is_active: bool,
  pub nodes: Vec<FlowNode>,
}

impl Flow {
  pub fn node(&self, node_id: &str) -> Option<&FlowNode> {
    self.nodes.iter().find(|n| n.node_id() == node_id)
  }

  /// The entry node: the first `input`-typed node, falling back to the first
  /// node in the sequence.
  pub fn entry_node(&self) -> Option<&FlowNode> {
    self
      .nodes
      .iter()
      .find(|n| matches!(n, FlowNode::Input { .. }))
      .or_else(|| self.nodes.first())
  }
}

/// Polymorphic node variant, tagged on the wire by `type`. `Generic` covers
/// any node type the engine doesn't special-case; it is still dispatched
/// through the handler registry by its `node_type` string, exactly like
/// `input`/`agent`/`output`, keeping the node-type set open to extension.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowNode {
  Input {
    #[serde(rename = "nodeId")]
    node_id: String,
    name: String,
    #[serde(rename = "nextNodeId", skip_serializing_if = "Option::is_none")]
    next_node_id: Option<String>,
    #[serde(default)]
    metadata: DynMap,
  },
  Agent {
    #[serde(rename = "nodeId")]
    node_id: String,
    name: String,
    #[serde(rename = "nextNodeId", skip_serializing_if = "Option::is_none")]
    next_node_id: Option<String>,
    #[serde(default)]
    metadata: DynMap,
    #[serde(rename = "retryOnError", default)]
    retry_on_error: bool,
    #[serde(rename = "maxRetries", default)]
    max_retries: u32,
    #[serde(rename = "timeout", skip_serializing_if = "Option::is_none")]
    timeout_ms: Option<u64>,
    /// Handler-specific settings (prompt, model, tool allowlist, …), opaque
    /// to the engine; only the registered `agent` handler interprets this.
    #[serde(default)]
    settings: Value,
  },
  Output {
    #[serde(rename = "nodeId")]
    node_id: String,
    name: String,
    #[serde(rename = "nextNodeId", skip_serializing_if = "Option::is_none")]
    next_node_id: Option<String>,
    #[serde(default)]
    metadata: DynMap,
  },
  #[serde(other)]
  Generic {
    #[serde(skip)]
    node_id: String,
    #[serde(skip)]
    name: String,
    #[serde(skip)]
    next_node_id: Option<String>,
    #[serde(skip)]
    metadata: DynMap,
  },
}

impl FlowNode {
  pub fn node_id(&self) -> &str {
    match self {
      FlowNode::Input { node_id, .. }
      | FlowNode::Agent { node_id, .. }
      | FlowNode::Output { node_id, .. }
      | FlowNode::Generic { node_id, .. } => node_id,
    }
  }

  pub fn name(&self) -> &str {
    match self {
      FlowNode::Input { name, .. }
      | FlowNode::Agent { name, .. }
      | FlowNode::Output { name, .. }
      | FlowNode::Generic { name, .. } => name,
    }
  }

  pub fn next_node_id(&self) -> Option<&str> {
    match self {
      FlowNode::Input { next_node_id, .. }
      | FlowNode::Agent { next_node_id, .. }
      | FlowNode::Output { next_node_id, .. }
      | FlowNode::Generic { next_node_id, .. } => next_node_id.as_deref(),
    }
  }

  pub fn metadata(&self) -> &DynMap {
    match self {
      FlowNode::Input { metadata, .. }
      | FlowNode::Agent { metadata, .. }
      | FlowNode::Output { metadata, .. }
      | FlowNode::Generic { metadata, .. } => metadata,
    }
  }

  /// The wire-level `type` string, used as the handler-registry key and in
  /// error messages (`"No handler registered for node type: <t>"`).
  pub fn node_type(&self) -> &str {
    match self {
      FlowNode::Input { .. } => "input",
      FlowNode::Agent { .. } => "agent",
      FlowNode::Output { .. } => "output",
      FlowNode::Generic { .. } => "generic",
    }
  }

  /// `agent`-only timeout, else the executor's default.
  pub fn timeout_ms(&self) -> Option<u64> {
    match self {
      FlowNode::Agent { timeout_ms, .. } => *timeout_ms,
      _ => None,
    }
  }
}

/// Status of a single node's execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
  Pending,
  Running,
  Completed,
  Failed,
  Skipped,
}

/// Status of a whole flow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
  Pending,
  Running,
  Completed,
  Failed,
  Cancelled,
}

/// What triggered a `startExecution` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
  Manual,
  Schedule,
  Webhook,
}

/// One `NodeExecution` per node-entry; retries mutate this record in place
/// rather than appending new ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
  pub node_id: String,
  pub node_type: String,
  pub status: NodeStatus,
  pub started_at: DateTime<Utc>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub completed_at: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub execution_time_ms: Option<i64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub output: Option<Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tokens_used: Option<u64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub cost: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error_details: Option<FlowError>,
  pub retry_count: u32,
}

impl NodeExecution {
  pub fn new(node: &FlowNode) -> Self {
    Self {
      node_id: node.node_id().to_string(),
      node_type: node.node_type().to_string(),
      status: NodeStatus::Pending,
      started_at: Utc::now(),
      completed_at: None,
      execution_time_ms: None,
      output: None,
      tokens_used: None,
      cost: None,
      error: None,
      error_details: None,
      retry_count: 0,
    }
  }
}

/// A single appended log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowExecutionLog {
  pub timestamp: DateTime<Utc>,
  pub level: LogLevel,
  pub message: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub node_id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub data: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
  Debug,
  Info,
  Warn,
  Error,
}

/// Persisted execution record, as the execution store would hold it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowExecution {
  pub id: String,
  pub flow_id: String,
  pub status: ExecutionStatus,
  pub input: DynMap,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub output: Option<DynMap>,
  pub logs: Vec<FlowExecutionLog>,
  pub node_executions: Vec<NodeExecution>,
  pub tokens_used: u64,
  pub cost: f64,
  pub triggered_by: TriggeredBy,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub trigger_data: Option<DynMap>,
  pub retry_count: u32,
  pub started_at: DateTime<Utc>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub completed_at: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub execution_time_ms: Option<i64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub current_node_id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error_details: Option<FlowError>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl FlowExecution {
  pub fn new(id: String, flow_id: String, input: DynMap, triggered_by: TriggeredBy, trigger_data: Option<DynMap>) -> Self {
    let now = Utc::now();
    Self {
      id,
      flow_id,
      status: ExecutionStatus::Pending,
      input,
      output: None,
      logs: Vec::new(),
      node_executions: Vec::new(),
      tokens_used: 0,
      cost: 0.0,
      triggered_by,
      trigger_data,
      retry_count: 0,
      started_at: now,
      completed_at: None,
      execution_time_ms: None,
      current_node_id: None,
      error: None,
      error_details: None,
      created_at: now,
      updated_at: now,
    }
  }

  pub fn node_execution_mut(&mut self, node_id: &str) -> Option<&mut NodeExecution> {
    self.node_executions.iter_mut().find(|ne| ne.node_id == node_id)
  }
}

/// The live, mutable run state. Owned and mutated exclusively by the task
/// running this one execution; no internal locking is needed on
/// `data`/`variables`/`is_cancelled`; the only shared-across-tasks field is
/// the cancellation flag, which is an atomic so a cancellation request
/// running on a different task can flip it.
pub struct FlowExecutionContext {
  pub flow: Flow,
  pub execution: FlowExecution,
  pub data: DynMap,
  pub variables: DynMap,
  pub start_time: DateTime<Utc>,
  cancelled: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl FlowExecutionContext {
  pub fn new(flow: Flow, execution: FlowExecution) -> Self {
    let mut variables = DynMap::new();
    variables.insert("input".to_string(), Value::Object(execution.input.clone().into_iter().collect()));
    Self {
      data: execution.input.clone(),
      variables,
      start_time: execution.started_at,
      flow,
      execution,
      cancelled: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
    }
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancelled.load(std::sync::atomic::Ordering::SeqCst)
  }

  pub fn cancel(&self) {
    self.cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
  }

  /// A clone of the cancellation flag, handed to the engine's active-set so
  /// a cancellation request can flip it from a different task without
  /// touching the rest of the context.
  pub fn cancel_handle(&self) -> std::sync::Arc<std::sync::atomic::AtomicBool> {
    self.cancelled.clone()
  }

  pub fn log(&mut self, level: LogLevel, message: impl Into<String>, node_id: Option<String>, data: Option<Value>) -> FlowExecutionLog {
    let entry = FlowExecutionLog {
      timestamp: Utc::now(),
      level,
      message: message.into(),
      node_id,
      data,
    };
    self.execution.logs.push(entry.clone());
    entry
  }
}

/// The shape of every event on the update stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowExecutionUpdate {
  #[serde(rename = "type")]
  pub update_type: UpdateType,
  pub execution_id: String,
  pub timestamp: DateTime<Utc>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub node_id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub node_type: Option<String>,
  pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
  ExecutionStarted,
  NodeStarted,
  NodeCompleted,
  NodeFailed,
  Log,
  ExecutionCompleted,
  ExecutionFailed,
  ExecutionCancelled,
}

/// Request payload for starting a new flow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartFlowExecutionRequest {
  pub flow_id: String,
  pub input: DynMap,
  #[serde(default = "default_triggered_by")]
  pub triggered_by: TriggeredBy,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub trigger_data: Option<DynMap>,
}

fn default_triggered_by() -> TriggeredBy {
  TriggeredBy::Manual
}

/// What `startExecution` returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowExecutionResult {
  pub success: bool,
  pub status: ExecutionStatus,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub output: Option<DynMap>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub execution_time_ms: Option<i64>,
  pub tokens_used: u64,
  pub cost: f64,
  pub node_executions: Vec<NodeExecution>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}
