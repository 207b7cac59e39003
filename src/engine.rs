//! The Flow Engine: owns the execution lifecycle (start, traverse,
//! cancel, fan out events) and the two external-store traits it consumes
//! (a definition store and an execution store).
//!
//! Owns a mutable run context per execution, drives nodes to completion,
//! and fans out events as it goes; `start_execution` looks up a definition,
//! builds a context, and hands off to the traversal loop. Multiple
//! executions run concurrently, tracked in an active-set keyed by
//! execution id.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{classify, FlowCraftError};
use crate::events::{EventBus, HandlerRegistry, NodeExecutionResult, NodeHandler, UpdateSink};
use crate::executor::{merge_data, ExecutorOutcome, NodeExecutor};
use crate::model::{
  DynMap, ExecutionStatus, Flow, FlowExecution, FlowExecutionContext, FlowExecutionResult,
  FlowExecutionUpdate, LogLevel, NodeStatus, StartFlowExecutionRequest, UpdateType,
};
use crate::observability::{ExecutionEvent, MetricsCollector};
use crate::retry::{NodeRetryState, RetryController};
use crate::{backoff, error::ErrorRecoveryAction};

/// Looks up a flow definition by id, async, may fail.
#[async_trait::async_trait]
pub trait DefinitionStore: Send + Sync {
  async fn get_flow(&self, flow_id: &str) -> std::result::Result<Option<Flow>, String>;
}

/// Persists execution records. Both operations are best-effort from the
/// engine's point of view: a failure here never aborts a run.
#[async_trait::async_trait]
pub trait ExecutionStore: Send + Sync {
  async fn create_flow_execution(&self, record: &FlowExecution) -> std::result::Result<String, String>;
  async fn update_flow_execution(&self, id: &str, record: &FlowExecution) -> std::result::Result<(), String>;
}

/// An in-memory definition store, useful for tests and as the default when
/// no real store is wired up; flows are registered directly.
#[derive(Default)]
pub struct InMemoryDefinitionStore {
  flows: Mutex<HashMap<String, Flow>>,
}

impl InMemoryDefinitionStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn insert(&self, flow: Flow) {
    self.flows.lock().await.insert(flow.id.clone(), flow);
  }
}

#[async_trait::async_trait]
impl DefinitionStore for InMemoryDefinitionStore {
  async fn get_flow(&self, flow_id: &str) -> std::result::Result<Option<Flow>, String> {
    Ok(self.flows.lock().await.get(flow_id).cloned())
  }
}

/// An in-memory execution store; durable persistence is a concern of the
/// real deployment, this is the default best-effort fallback.
#[derive(Default)]
pub struct InMemoryExecutionStore {
  records: Mutex<HashMap<String, FlowExecution>>,
}

impl InMemoryExecutionStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait::async_trait]
impl ExecutionStore for InMemoryExecutionStore {
  async fn create_flow_execution(&self, record: &FlowExecution) -> std::result::Result<String, String> {
    self.records.lock().await.insert(record.id.clone(), record.clone());
    Ok(record.id.clone())
  }

  async fn update_flow_execution(&self, id: &str, record: &FlowExecution) -> std::result::Result<(), String> {
    self.records.lock().await.insert(id.to_string(), record.clone());
    Ok(())
  }
}

/// Entry kept in the active-set: just enough to answer status lookups and
/// cancellation requests without reaching into the owning task.
struct ActiveEntry {
  cancel_flag: Arc<AtomicBool>,
  snapshot: Arc<Mutex<FlowExecution>>,
}

/// The Flow Engine. Cheap to clone (an `Arc` around its shared state), so a
/// single instance can be handed to an HTTP layer and invoked concurrently
/// from many request handlers.
#[derive(Clone)]
pub struct FlowEngine {
  definitions: Arc<dyn DefinitionStore>,
  executions: Arc<dyn ExecutionStore>,
  handlers: Arc<HandlerRegistry>,
  bus: EventBus,
  active: Arc<Mutex<HashMap<String, ActiveEntry>>>,
  metrics: Arc<MetricsCollector>,
}

impl FlowEngine {
  pub fn new(definitions: Arc<dyn DefinitionStore>, executions: Arc<dyn ExecutionStore>, handlers: HandlerRegistry) -> Self {
    Self {
      definitions,
      executions,
      handlers: Arc::new(handlers),
      bus: EventBus::default(),
      active: Arc::new(Mutex::new(HashMap::new())),
      metrics: Arc::new(MetricsCollector::new()),
    }
  }

  /// The engine's in-process metrics/event collector, for a caller that
  /// wants to inspect counters or wire up an `AlertManager` alongside it.
  pub fn metrics(&self) -> Arc<MetricsCollector> {
    self.metrics.clone()
  }

  pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<FlowExecutionUpdate> {
    self.bus.subscribe()
  }

  pub async fn get_active_execution_ids(&self) -> Vec<String> {
    self.active.lock().await.keys().cloned().collect()
  }

  /// A snapshot of the active execution, or `None` if it isn't running
  /// (never started, or already terminal).
  pub async fn get_execution_status(&self, id: &str) -> Option<FlowExecution> {
    let active = self.active.lock().await;
    let entry = active.get(id)?;
    Some(entry.snapshot.lock().await.clone())
  }

  /// Requests cancellation of a running execution. Returns `false` if `id`
  /// is not active.
  ///
  /// Only flips the cancellation flag here: the owning task running
  /// `start_execution` observes it at the next suspension point (loop top or
  /// a retry wait) and performs the single terminal transition and
  /// `execution_cancelled` emission itself. Doing the finalization from both
  /// sides would double-emit that terminal event.
  pub async fn cancel_execution(&self, id: &str) -> bool {
    let active = self.active.lock().await;
    match active.get(id) {
      Some(entry) => {
        entry.cancel_flag.store(true, std::sync::atomic::Ordering::SeqCst);
        #[cfg(feature = "observability")]
        tracing::info!(execution_id = %id, "cancellation requested");
        true
      }
      None => false,
    }
  }

  /// Handler registration happens at construction time via `HandlerRegistry`;
  /// engines are built once with a complete, read-only registry. This helper
  /// exists for callers that build the registry incrementally before
  /// constructing the engine.
  pub fn with_handler(mut registry: HandlerRegistry, node_type: impl Into<String>, handler: Arc<dyn NodeHandler>) -> HandlerRegistry {
    registry.register(node_type, handler);
    registry
  }

  /// Looks up the flow, starts a new execution record, and drives it to
  /// completion, cancellation, or failure.
  pub async fn start_execution(&self, request: StartFlowExecutionRequest) -> FlowExecutionResult {
    let execution_id = uuid::Uuid::new_v4().to_string();

    let flow = match self.definitions.get_flow(&request.flow_id).await {
      Ok(Some(flow)) if !flow.is_active => {
        return self.fatal_result(FlowCraftError::FlowInactive { name: flow.name }.to_string());
      }
      Ok(Some(flow)) => flow,
      Ok(None) => {
        return self.fatal_result(FlowCraftError::FlowNotFound { flow_id: request.flow_id }.to_string());
      }
      Err(message) => return self.fatal_result(message),
    };

    let mut execution = FlowExecution::new(
      execution_id.clone(),
      flow.id.clone(),
      request.input,
      request.triggered_by,
      request.trigger_data,
    );
    execution.status = ExecutionStatus::Running;

    #[cfg(feature = "observability")]
    tracing::info!(execution_id = %execution_id, flow_id = %execution.flow_id, "execution started");
    self.metrics.increment_counter("flow.execution_count", 1.0);
    self.metrics.record_event(ExecutionEvent::new(execution_id.clone(), "execution_started"));

    // Best-effort create: a store failure still proceeds with the
    // synthesized local id.
    let _ = self.executions.create_flow_execution(&execution).await;

    let snapshot = Arc::new(Mutex::new(execution.clone()));
    let mut context = FlowExecutionContext::new(flow, execution);
    let cancel_flag = context.cancel_handle();

    self.active.lock().await.insert(
      execution_id.clone(),
      ActiveEntry { cancel_flag: cancel_flag.clone(), snapshot: snapshot.clone() },
    );

    let sink = UpdateSink::new(execution_id.clone(), self.bus.clone(), None);
    sink.emit(UpdateType::ExecutionStarted, None, None, Value::Null);
    self.sync_snapshot(&snapshot, &context).await;

    let run_result = self.run_traversal(&mut context, &sink).await;

    let result = match run_result {
      Ok(()) if context.is_cancelled() => self.finalize_cancelled(&mut context, &sink).await,
      Ok(()) => self.finalize_completed(&mut context, &sink).await,
      Err(message) => self.finalize_failed(&mut context, &sink, message).await,
    };

    self.sync_snapshot(&snapshot, &context).await;
    self.active.lock().await.remove(&execution_id);

    result
  }

  fn fatal_result(&self, message: String) -> FlowExecutionResult {
    FlowExecutionResult {
      success: false,
      status: ExecutionStatus::Failed,
      output: None,
      execution_time_ms: None,
      tokens_used: 0,
      cost: 0.0,
      node_executions: Vec::new(),
      error: Some(message),
    }
  }

  async fn sync_snapshot(&self, snapshot: &Arc<Mutex<FlowExecution>>, context: &FlowExecutionContext) {
    *snapshot.lock().await = context.execution.clone();
  }

  /// The traversal loop. Returns `Ok(())` on clean completion or
  /// cancellation (both observed via `context.is_cancelled()` by the
  /// caller), `Err(message)` on a fatal (`fail`) recovery action or a graph
  /// error (unknown `nextNodeId`, no entry node).
  async fn run_traversal(&self, context: &mut FlowExecutionContext, sink: &UpdateSink) -> std::result::Result<(), String> {
    let mut current = match context.flow.entry_node() {
      Some(node) => node.clone(),
      None => return Err(FlowCraftError::NoEntryNode.to_string()),
    };

    let mut retry_states: HashMap<String, NodeRetryState> = HashMap::new();

    loop {
      if context.is_cancelled() {
        return Ok(());
      }

      let executor = NodeExecutor::new(&self.handlers);
      self.metrics.increment_counter("node.execution_count", 1.0);
      let attempt_start = std::time::Instant::now();
      let outcome = executor.run(&current, context, sink).await;
      let attempt_ms = attempt_start.elapsed().as_millis() as u64;

      match outcome {
        ExecutorOutcome::Success(result) => {
          self.metrics.increment_counter("node.success_count", 1.0);
          self.metrics.record_event(ExecutionEvent::new(current.node_id().to_string(), "node_completed").with_duration_ms(attempt_ms));
          self.apply_success(context, &current, &result);
          if result.continue_execution == Some(false) {
            return Ok(());
          }
        }
        ExecutorOutcome::Failure { message, stack } => {
          self.metrics.increment_counter("node.failure_count", 1.0);
          self.metrics.record_event(ExecutionEvent::new(current.node_id().to_string(), "node_failed").with_duration_ms(attempt_ms));
          let mut classified = classify(&message, None);
          classified.stack = stack;
          if let Some(ne) = context.execution.node_execution_mut(current.node_id()) {
            ne.error_details = Some(classified.clone());
          }

          let policy = RetryController::policy_for(&current);
          let state = retry_states
            .entry(current.node_id().to_string())
            .or_insert_with(|| RetryController::new_state(policy.max_retries));

          let action = RetryController::recovery_action(&current, &classified, state, &policy);
          match action {
            ErrorRecoveryAction::Retry => {
              let next_attempt = state.retry_count + 1;
              let mut jitter = backoff::RngJitterSource;
              let delay_ms = backoff::delay_for(next_attempt, &policy, &mut jitter);
              *state = RetryController::record_attempt(std::mem::replace(state, RetryController::new_state(0)), false, delay_ms, Some(message.clone()));

              #[cfg(feature = "observability")]
              tracing::warn!(
                node_id = %current.node_id(),
                attempt = next_attempt,
                delay_ms,
                "node failed, retrying: {}",
                message
              );

              if let Some(ne) = context.execution.node_execution_mut(current.node_id()) {
                ne.retry_count = state.retry_count;
                ne.status = NodeStatus::Pending;
              }

              if !self.cancellable_sleep(context, delay_ms).await {
                return Ok(());
              }
              continue;
            }
            ErrorRecoveryAction::UseDefault => {
              let default_value = current.metadata().get("defaultOnError").cloned().unwrap_or(Value::Null);
              context.variables.insert(current.node_id().to_string(), default_value.clone());
              if let Value::Object(map) = &default_value {
                for (k, v) in map {
                  context.data.insert(k.clone(), v.clone());
                }
              }
              let entry = context.log(
                LogLevel::Info,
                format!("Node '{}' failed; substituting default value", current.name()),
                Some(current.node_id().to_string()),
                Some(default_value),
              );
              sink.emit(UpdateType::Log, entry.node_id.clone(), None, serde_json::json!({ "message": entry.message }));
            }
            ErrorRecoveryAction::Skip => {
              if let Some(ne) = context.execution.node_execution_mut(current.node_id()) {
                ne.status = NodeStatus::Skipped;
              }
            }
            ErrorRecoveryAction::Fail => {
              #[cfg(feature = "observability")]
              tracing::error!(node_id = %current.node_id(), "node failed permanently: {}", message);
              return Err(message);
            }
          }
        }
      }

      match current.next_node_id() {
        Some(next_id) => match context.flow.node(next_id) {
          Some(next) => current = next.clone(),
          None => {
            return Err(
              FlowCraftError::UnknownNextNode { node_id: current.node_id().to_string(), next_node_id: next_id.to_string() }.to_string(),
            )
          }
        },
        None => return Ok(()),
      }
    }
  }

  fn apply_success(&self, context: &mut FlowExecutionContext, node: &crate::model::FlowNode, result: &NodeExecutionResult) {
    merge_data(context, result.data.clone());
    if let Some(output) = &result.output {
      context.variables.insert(node.node_id().to_string(), output.clone());
    }
    if let Some(tokens) = result.tokens_used {
      context.execution.tokens_used += tokens;
    }
    if let Some(cost) = result.cost {
      context.execution.cost += cost;
    }
  }

  /// Sleep for `delay_ms`, polling the cancellation flag so the wait is
  /// interruptible. Returns `false` if cancellation was observed before the
  /// delay elapsed.
  async fn cancellable_sleep(&self, context: &FlowExecutionContext, delay_ms: u64) -> bool {
    const POLL_MS: u64 = 10;
    let mut remaining = delay_ms;
    while remaining > 0 {
      if context.is_cancelled() {
        return false;
      }
      let step = remaining.min(POLL_MS);
      tokio::time::sleep(std::time::Duration::from_millis(step)).await;
      remaining -= step;
    }
    !context.is_cancelled()
  }

  async fn finalize_completed(&self, context: &mut FlowExecutionContext, sink: &UpdateSink) -> FlowExecutionResult {
    let now = Utc::now();
    context.execution.status = ExecutionStatus::Completed;
    context.execution.completed_at = Some(now);
    context.execution.execution_time_ms = Some((now - context.start_time).num_milliseconds());
    context.execution.output = Some(context.data.clone());
    context.execution.updated_at = now;
    let _ = self.executions.update_flow_execution(&context.execution.id, &context.execution).await;
    #[cfg(feature = "observability")]
    tracing::info!(execution_id = %context.execution.id, "execution completed");
    self.metrics.increment_counter("flow.success_count", 1.0);
    self.metrics.record_event(
      ExecutionEvent::new(context.execution.id.clone(), "execution_completed")
        .with_duration_ms(context.execution.execution_time_ms.unwrap_or(0).max(0) as u64),
    );
    sink.emit(UpdateType::ExecutionCompleted, None, None, serde_json::json!({ "output": context.data }));

    FlowExecutionResult {
      success: true,
      status: ExecutionStatus::Completed,
      output: Some(context.data.clone()),
      execution_time_ms: context.execution.execution_time_ms,
      tokens_used: context.execution.tokens_used,
      cost: context.execution.cost,
      node_executions: context.execution.node_executions.clone(),
      error: None,
    }
  }

  async fn finalize_failed(&self, context: &mut FlowExecutionContext, sink: &UpdateSink, message: String) -> FlowExecutionResult {
    let now = Utc::now();
    context.execution.status = ExecutionStatus::Failed;
    context.execution.completed_at = Some(now);
    context.execution.execution_time_ms = Some((now - context.start_time).num_milliseconds());
    context.execution.error = Some(message.clone());
    context.execution.error_details = Some(classify(&message, None));
    context.execution.updated_at = now;
    let _ = self.executions.update_flow_execution(&context.execution.id, &context.execution).await;
    #[cfg(feature = "observability")]
    tracing::error!(execution_id = %context.execution.id, "execution failed: {}", message);
    self.metrics.increment_counter("flow.failure_count", 1.0);
    self.metrics.record_event(
      ExecutionEvent::new(context.execution.id.clone(), "execution_failed")
        .with_duration_ms(context.execution.execution_time_ms.unwrap_or(0).max(0) as u64),
    );
    sink.emit(UpdateType::ExecutionFailed, None, None, serde_json::json!({ "error": message }));

    FlowExecutionResult {
      success: false,
      status: ExecutionStatus::Failed,
      output: None,
      execution_time_ms: context.execution.execution_time_ms,
      tokens_used: context.execution.tokens_used,
      cost: context.execution.cost,
      node_executions: context.execution.node_executions.clone(),
      error: Some(message),
    }
  }

  async fn finalize_cancelled(&self, context: &mut FlowExecutionContext, sink: &UpdateSink) -> FlowExecutionResult {
    let now = Utc::now();
    context.execution.status = ExecutionStatus::Cancelled;
    context.execution.completed_at = Some(now);
    context.execution.execution_time_ms = Some((now - context.start_time).num_milliseconds());
    context.execution.error = Some("Execution was cancelled".to_string());
    context.execution.updated_at = now;
    let _ = self.executions.update_flow_execution(&context.execution.id, &context.execution).await;
    self.metrics.increment_counter("flow.cancelled_count", 1.0);
    self.metrics.record_event(ExecutionEvent::new(context.execution.id.clone(), "execution_cancelled"));
    sink.emit(UpdateType::ExecutionCancelled, None, None, Value::Null);

    FlowExecutionResult {
      success: false,
      status: ExecutionStatus::Cancelled,
      output: None,
      execution_time_ms: context.execution.execution_time_ms,
      tokens_used: context.execution.tokens_used,
      cost: context.execution.cost,
      node_executions: context.execution.node_executions.clone(),
      error: Some("Execution was cancelled".to_string()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::events::NodeExecutionResult;
  use crate::model::FlowNode;
  use async_trait::async_trait;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn linear_flow() -> Flow {
    Flow {
      id: "flow-1".into(),
      name: "linear".into(),
      is_active: true,
      nodes: vec![
        FlowNode::Input { node_id: "n1".into(), name: "input".into(), next_node_id: Some("n2".into()), metadata: DynMap::new() },
        FlowNode::Agent {
          node_id: "n2".into(),
          name: "ask".into(),
          next_node_id: Some("n3".into()),
          metadata: DynMap::new(),
          retry_on_error: false,
          max_retries: 0,
          timeout_ms: None,
          settings: Value::Null,
        },
        FlowNode::Output { node_id: "n3".into(), name: "output".into(), next_node_id: None, metadata: DynMap::new() },
      ],
    }
  }

  struct EchoInput;
  #[async_trait]
  impl NodeHandler for EchoInput {
    async fn execute(&self, _node: &FlowNode, context: &FlowExecutionContext) -> NodeExecutionResult {
      let mut data = DynMap::new();
      data.insert("q".to_string(), context.data.get("q").cloned().unwrap_or(Value::Null));
      NodeExecutionResult { success: true, output: Some(context.data.get("q").cloned().unwrap_or(Value::Null)), data: Some(data), ..Default::default() }
    }
  }

  struct Answering;
  #[async_trait]
  impl NodeHandler for Answering {
    async fn execute(&self, _node: &FlowNode, _context: &FlowExecutionContext) -> NodeExecutionResult {
      NodeExecutionResult {
        success: true,
        output: Some(Value::String("answer".into())),
        tokens_used: Some(10),
        cost: Some(0.01),
        ..Default::default()
      }
    }
  }

  struct FinalOutput;
  #[async_trait]
  impl NodeHandler for FinalOutput {
    async fn execute(&self, _node: &FlowNode, _context: &FlowExecutionContext) -> NodeExecutionResult {
      let mut data = DynMap::new();
      data.insert("final".to_string(), Value::String("answer".into()));
      NodeExecutionResult {
        success: true,
        output: Some(serde_json::json!({ "final": "answer" })),
        data: Some(data),
        ..Default::default()
      }
    }
  }

  async fn engine_with(flow: Flow, registry: HandlerRegistry) -> (FlowEngine, String) {
    let definitions = Arc::new(InMemoryDefinitionStore::new());
    let flow_id = flow.id.clone();
    definitions.insert(flow).await;
    let executions = Arc::new(InMemoryExecutionStore::new());
    (FlowEngine::new(definitions, executions, registry), flow_id)
  }

  #[tokio::test]
  async fn linear_success_end_to_end() {
    let mut registry = HandlerRegistry::new();
    registry.register("input", Arc::new(EchoInput));
    registry.register("agent", Arc::new(Answering));
    registry.register("output", Arc::new(FinalOutput));
    let (engine, flow_id) = engine_with(linear_flow(), registry).await;

    let mut input = DynMap::new();
    input.insert("q".to_string(), Value::String("hi".into()));
    let result = engine
      .start_execution(StartFlowExecutionRequest { flow_id, input, triggered_by: crate::model::TriggeredBy::Manual, trigger_data: None })
      .await;

    assert!(result.success);
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.tokens_used, 10);
    assert_eq!(result.cost, 0.01);
    assert_eq!(result.output.as_ref().unwrap().get("final").unwrap(), "answer");
    assert_eq!(result.node_executions.len(), 3);
    assert!(result.node_executions.iter().all(|ne| ne.status == NodeStatus::Completed));
  }

  struct FlakyThenOk(AtomicU32);
  #[async_trait]
  impl NodeHandler for FlakyThenOk {
    async fn execute(&self, _node: &FlowNode, _context: &FlowExecutionContext) -> NodeExecutionResult {
      let attempt = self.0.fetch_add(1, Ordering::SeqCst);
      if attempt < 2 {
        NodeExecutionResult::failed("ECONNRESET")
      } else {
        NodeExecutionResult { success: true, output: Some(Value::String("ok".into())), tokens_used: Some(5), ..Default::default() }
      }
    }
  }

  fn single_agent_flow(max_retries: u32) -> Flow {
    Flow {
      id: "flow-retry".into(),
      name: "retry".into(),
      is_active: true,
      nodes: vec![FlowNode::Agent {
        node_id: "n1".into(),
        name: "flaky".into(),
        next_node_id: None,
        metadata: DynMap::new(),
        retry_on_error: true,
        max_retries,
        timeout_ms: None,
        settings: Value::Null,
      }],
    }
  }

  #[tokio::test]
  async fn transient_retry_then_success() {
    let mut registry = HandlerRegistry::new();
    registry.register("agent", Arc::new(FlakyThenOk(AtomicU32::new(0))));
    let (engine, flow_id) = engine_with(single_agent_flow(2), registry).await;

    let result = engine
      .start_execution(StartFlowExecutionRequest { flow_id, input: DynMap::new(), triggered_by: crate::model::TriggeredBy::Manual, trigger_data: None })
      .await;

    assert!(result.success);
    assert_eq!(result.tokens_used, 5);
    assert_eq!(result.node_executions[0].retry_count, 2);
  }

  struct AlwaysFails(&'static str);
  #[async_trait]
  impl NodeHandler for AlwaysFails {
    async fn execute(&self, _node: &FlowNode, _context: &FlowExecutionContext) -> NodeExecutionResult {
      NodeExecutionResult::failed(self.0)
    }
  }

  #[tokio::test]
  async fn permanent_failure_does_not_retry() {
    let mut registry = HandlerRegistry::new();
    registry.register("agent", Arc::new(AlwaysFails("401 Unauthorized")));
    let (engine, flow_id) = engine_with(single_agent_flow(3), registry).await;

    let result = engine
      .start_execution(StartFlowExecutionRequest { flow_id, input: DynMap::new(), triggered_by: crate::model::TriggeredBy::Manual, trigger_data: None })
      .await;

    assert!(!result.success);
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.node_executions[0].retry_count, 0);
    assert!(result.error.unwrap().contains("401 Unauthorized"));
  }

  #[tokio::test]
  async fn default_on_error_completes_with_fallback() {
    let mut metadata = DynMap::new();
    metadata.insert("defaultOnError".to_string(), serde_json::json!({ "answer": "fallback" }));
    let flow = Flow {
      id: "flow-default".into(),
      name: "default".into(),
      is_active: true,
      nodes: vec![FlowNode::Agent {
        node_id: "n1".into(),
        name: "ask".into(),
        next_node_id: None,
        metadata,
        retry_on_error: false,
        max_retries: 0,
        timeout_ms: None,
        settings: Value::Null,
      }],
    };

    let mut registry = HandlerRegistry::new();
    registry.register("agent", Arc::new(AlwaysFails("Schema error")));
    let (engine, flow_id) = engine_with(flow, registry).await;

    let result = engine
      .start_execution(StartFlowExecutionRequest { flow_id, input: DynMap::new(), triggered_by: crate::model::TriggeredBy::Manual, trigger_data: None })
      .await;

    assert!(result.success);
    assert_eq!(result.output.unwrap().get("answer").unwrap(), "fallback");
    assert_eq!(result.node_executions[0].status, NodeStatus::Failed);
  }

  #[tokio::test]
  async fn unregistered_handler_fails_execution() {
    let registry = HandlerRegistry::new();
    let (engine, flow_id) = engine_with(single_agent_flow(0), registry).await;

    let result = engine
      .start_execution(StartFlowExecutionRequest { flow_id, input: DynMap::new(), triggered_by: crate::model::TriggeredBy::Manual, trigger_data: None })
      .await;

    assert!(!result.success);
    assert_eq!(result.error.unwrap(), "No handler registered for node type: agent");
  }

  #[tokio::test]
  async fn flow_not_found_is_fatal() {
    let definitions = Arc::new(InMemoryDefinitionStore::new());
    let executions = Arc::new(InMemoryExecutionStore::new());
    let engine = FlowEngine::new(definitions, executions, HandlerRegistry::new());

    let result = engine
      .start_execution(StartFlowExecutionRequest { flow_id: "missing".into(), input: DynMap::new(), triggered_by: crate::model::TriggeredBy::Manual, trigger_data: None })
      .await;

    assert!(!result.success);
    assert!(result.error.unwrap().contains("not found"));
  }

  #[tokio::test]
  async fn inactive_flow_is_fatal() {
    let mut flow = single_agent_flow(0);
    flow.is_active = false;
    let registry = HandlerRegistry::new();
    let (engine, flow_id) = engine_with(flow, registry).await;

    let result = engine
      .start_execution(StartFlowExecutionRequest { flow_id, input: DynMap::new(), triggered_by: crate::model::TriggeredBy::Manual, trigger_data: None })
      .await;

    assert!(!result.success);
    assert!(result.error.unwrap().contains("not active"));
  }

  struct AlwaysTimesOut;
  #[async_trait]
  impl NodeHandler for AlwaysTimesOut {
    async fn execute(&self, _node: &FlowNode, _context: &FlowExecutionContext) -> NodeExecutionResult {
      NodeExecutionResult::failed("timeout")
    }
  }

  #[tokio::test]
  async fn cancel_mid_retry_transitions_to_cancelled() {
    let flow = Flow {
      id: "flow-cancel".into(),
      name: "cancel".into(),
      is_active: true,
      nodes: vec![FlowNode::Agent {
        node_id: "n1".into(),
        name: "flaky".into(),
        next_node_id: None,
        metadata: DynMap::new(),
        retry_on_error: true,
        max_retries: 5,
        timeout_ms: None,
        settings: Value::Null,
      }],
    };
    let mut registry = HandlerRegistry::new();
    registry.register("agent", Arc::new(AlwaysTimesOut));
    let definitions = Arc::new(InMemoryDefinitionStore::new());
    definitions.insert(flow.clone()).await;
    let executions = Arc::new(InMemoryExecutionStore::new());
    let engine = FlowEngine::new(definitions, executions, registry);

    let engine_clone = engine.clone();
    let flow_id = flow.id.clone();
    let handle = tokio::spawn(async move {
      engine_clone
        .start_execution(StartFlowExecutionRequest { flow_id, input: DynMap::new(), triggered_by: crate::model::TriggeredBy::Manual, trigger_data: None })
        .await
    });

    // Give the first failed attempt time to land and enter its retry sleep,
    // then cancel while it's waiting.
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    let active_ids = engine.get_active_execution_ids().await;
    assert_eq!(active_ids.len(), 1);
    let cancelled = engine.cancel_execution(&active_ids[0]).await;
    assert!(cancelled);

    let result = handle.await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Cancelled);
  }

  #[tokio::test]
  async fn cancel_on_terminal_execution_returns_false() {
    let definitions = Arc::new(InMemoryDefinitionStore::new());
    let executions = Arc::new(InMemoryExecutionStore::new());
    let engine = FlowEngine::new(definitions, executions, HandlerRegistry::new());
    assert!(!engine.cancel_execution("never-started").await);
  }

  #[tokio::test]
  async fn metrics_collector_observes_node_and_flow_outcomes() {
    let mut registry = HandlerRegistry::new();
    registry.register("input", Arc::new(EchoInput));
    registry.register("agent", Arc::new(Answering));
    registry.register("output", Arc::new(FinalOutput));
    let (engine, flow_id) = engine_with(linear_flow(), registry).await;
    let metrics = engine.metrics();

    let mut input = DynMap::new();
    input.insert("q".to_string(), Value::String("hi".into()));
    let result = engine
      .start_execution(StartFlowExecutionRequest { flow_id, input, triggered_by: crate::model::TriggeredBy::Manual, trigger_data: None })
      .await;

    assert!(result.success);
    assert_eq!(metrics.get_metric("flow.execution_count"), Some(1.0));
    assert_eq!(metrics.get_metric("flow.success_count"), Some(1.0));
    assert_eq!(metrics.get_metric("node.execution_count"), Some(3.0));
    assert_eq!(metrics.get_metric("node.success_count"), Some(3.0));
    assert_eq!(metrics.get_metric("node.failure_count"), None);

    let events = metrics.get_events();
    assert!(events.iter().any(|e| e.event_type == "execution_started"));
    assert!(events.iter().any(|e| e.event_type == "execution_completed"));
  }

  #[cfg(feature = "observability")]
  #[tokio::test]
  #[tracing_test::traced_test]
  async fn observability_feature_logs_execution_lifecycle() {
    let mut registry = HandlerRegistry::new();
    registry.register("agent", Arc::new(AlwaysFails("ECONNRESET")));
    let (engine, flow_id) = engine_with(single_agent_flow(0), registry).await;

    let _ = engine
      .start_execution(StartFlowExecutionRequest { flow_id, input: DynMap::new(), triggered_by: crate::model::TriggeredBy::Manual, trigger_data: None })
      .await;

    assert!(logs_contain("execution started"));
    assert!(logs_contain("execution failed"));
  }
}
