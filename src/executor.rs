//! The Node Executor: runs exactly one node attempt under a deadline
//! and reports the raw (unclassified) outcome back to the engine.
//!
//! Races the handler call against a `tokio::time::timeout` deadline and
//! discards the loser; a one-shot per-attempt contract rather than a
//! reusable multi-policy timeout manager.

use chrono::Utc;
use serde_json::Value;

use crate::events::{HandlerRegistry, NodeExecutionResult, UpdateSink};
use crate::model::{DynMap, FlowExecutionContext, FlowNode, LogLevel, NodeExecution, NodeStatus, UpdateType};

const DEFAULT_TIMEOUT_MS: u64 = 300_000;

/// Outcome of one executor attempt, before the Flow Engine classifies a
/// failure and decides what to do about it.
pub enum ExecutorOutcome {
  Success(NodeExecutionResult),
  Failure { message: String, stack: Option<String> },
}

pub struct NodeExecutor<'a> {
  registry: &'a HandlerRegistry,
}

impl<'a> NodeExecutor<'a> {
  pub fn new(registry: &'a HandlerRegistry) -> Self {
    Self { registry }
  }

  /// Run one attempt of `node`. Creates (or reuses, on retry) the node's
  /// `NodeExecution` record, emits `node_started`, races the handler
  /// against its timeout, and updates the record on either path.
  pub async fn run(&self, node: &FlowNode, context: &mut FlowExecutionContext, sink: &UpdateSink) -> ExecutorOutcome {
    let node_id = node.node_id().to_string();
    let node_type = node.node_type().to_string();

    if context.execution.node_execution_mut(&node_id).is_none() {
      context.execution.node_executions.push(NodeExecution::new(node));
    }
    if let Some(ne) = context.execution.node_execution_mut(&node_id) {
      ne.status = NodeStatus::Running;
      ne.started_at = Utc::now();
    }
    context.execution.current_node_id = Some(node_id.clone());

    sink.emit(UpdateType::NodeStarted, Some(node_id.clone()), Some(node_type.clone()), Value::Null);

    let handler = match self.registry.get(node.node_type()) {
      Some(h) => h,
      None => {
        let message = format!("No handler registered for node type: {}", node.node_type());
        self.record_failure(context, sink, &node_id, &message);
        sink.emit(
          UpdateType::NodeFailed,
          Some(node_id.clone()),
          Some(node_type.clone()),
          serde_json::json!({ "error": message }),
        );
        return ExecutorOutcome::Failure { message, stack: None };
      }
    };

    let timeout_ms = node.timeout_ms().unwrap_or(DEFAULT_TIMEOUT_MS);
    let deadline = std::time::Duration::from_millis(timeout_ms);

    // Correctness note: `context` is borrowed immutably for the duration of
    // the handler call. Handlers never get `&mut FlowExecutionContext`; the
    // executor folds the returned `data`/`output` back in after the call
    // completes.
    let result = tokio::time::timeout(deadline, handler.execute(node, context)).await;

    match result {
      Err(_) => {
        let message = format!("Node {} timed out", node.name());
        #[cfg(feature = "observability")]
        tracing::warn!(node_id = %node_id, timeout_ms, "{}", message);
        self.record_failure(context, sink, &node_id, &message);
        sink.emit(
          UpdateType::NodeFailed,
          Some(node_id.clone()),
          Some(node_type.clone()),
          serde_json::json!({ "error": message }),
        );
        ExecutorOutcome::Failure { message, stack: None }
      }
      Ok(outcome) if outcome.success => {
        self.record_success(context, &node_id, &outcome);
        sink.emit(
          UpdateType::NodeCompleted,
          Some(node_id.clone()),
          Some(node_type.clone()),
          serde_json::json!({
            "output": outcome.output,
            "tokensUsed": outcome.tokens_used,
            "cost": outcome.cost,
          }),
        );
        ExecutorOutcome::Success(outcome)
      }
      Ok(outcome) => {
        let message = outcome.error.clone().unwrap_or_else(|| "Node execution failed".to_string());
        self.record_failure(context, sink, &node_id, &message);
        sink.emit(
          UpdateType::NodeFailed,
          Some(node_id.clone()),
          Some(node_type.clone()),
          serde_json::json!({ "error": message }),
        );
        ExecutorOutcome::Failure { message, stack: outcome.error_stack }
      }
    }
  }

  fn record_success(&self, context: &mut FlowExecutionContext, node_id: &str, outcome: &NodeExecutionResult) {
    let started_at = context
      .execution
      .node_execution_mut(node_id)
      .map(|ne| ne.started_at)
      .unwrap_or_else(Utc::now);
    let now = Utc::now();
    if let Some(ne) = context.execution.node_execution_mut(node_id) {
      ne.status = NodeStatus::Completed;
      ne.completed_at = Some(now);
      ne.execution_time_ms = Some((now - started_at).num_milliseconds());
      ne.output = outcome.output.clone();
      ne.tokens_used = outcome.tokens_used;
      ne.cost = outcome.cost;
    }
  }

  /// Records the raw outcome only. Classification (and what to do about a
  /// failure) is the engine's job, not the executor's.
  fn record_failure(&self, context: &mut FlowExecutionContext, sink: &UpdateSink, node_id: &str, message: &str) {
    let started_at = context
      .execution
      .node_execution_mut(node_id)
      .map(|ne| ne.started_at)
      .unwrap_or_else(Utc::now);
    let now = Utc::now();
    if let Some(ne) = context.execution.node_execution_mut(node_id) {
      ne.status = NodeStatus::Failed;
      ne.completed_at = Some(now);
      ne.execution_time_ms = Some((now - started_at).num_milliseconds());
      ne.error = Some(message.to_string());
    }
    let entry = context.log(LogLevel::Error, message.to_string(), Some(node_id.to_string()), None);
    sink.emit(UpdateType::Log, entry.node_id.clone(), None, serde_json::json!({ "message": entry.message }));
  }
}

/// Merge a handler's returned `data` into the running context, matching
/// Handler-returned `data` is merged into `context.data`.
pub fn merge_data(context: &mut FlowExecutionContext, data: Option<DynMap>) {
  if let Some(data) = data {
    for (k, v) in data {
      context.data.insert(k, v);
    }
  }
}
