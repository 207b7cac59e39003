//! Node handler contract and the update-stream event bus.
//!
//! A handler implements a single `execute(node, context) -> NodeExecutionResult`
//! contract per node type. Updates fan out over `tokio::sync::broadcast`,
//! which gives a typed broadcast channel with bounded buffers and
//! drop-oldest semantics.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::model::{DynMap, FlowExecutionContext, FlowExecutionUpdate, FlowNode, UpdateType};

/// What a handler returns for one node attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeExecutionResult {
  pub success: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub output: Option<Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub data: Option<DynMap>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tokens_used: Option<u64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub cost: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error_stack: Option<String>,
  /// `None` means "continue"; only an explicit `Some(false)` stops
  /// traversal after this node.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub continue_execution: Option<bool>,
}

impl NodeExecutionResult {
  pub fn ok(output: Value) -> Self {
    Self { success: true, output: Some(output), ..Default::default() }
  }

  pub fn failed(message: impl Into<String>) -> Self {
    Self { success: false, error: Some(message.into()), ..Default::default() }
  }
}

/// A type-specific node handler, registered under its `nodeType` string.
/// Handlers are the only code that interprets a node's opaque settings or
/// talks to the agent runner / filesystem gateway; the engine and executor
/// never look past `node.metadata()`.
#[async_trait]
pub trait NodeHandler: Send + Sync {
  async fn execute(&self, node: &FlowNode, context: &FlowExecutionContext) -> NodeExecutionResult;
}

/// Mapping from `nodeType` to its handler, read-only once the engine is
/// built: set at startup and never mutated thereafter.
#[derive(Default)]
pub struct HandlerRegistry {
  handlers: HashMap<String, Arc<dyn NodeHandler>>,
}

impl HandlerRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&mut self, node_type: impl Into<String>, handler: Arc<dyn NodeHandler>) {
    self.handlers.insert(node_type.into(), handler);
  }

  pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeHandler>> {
    self.handlers.get(node_type).cloned()
  }
}

/// Many-writer, many-reader, non-blocking update bus. Bounded with
/// drop-oldest semantics: a slow subscriber falling
/// behind the buffer simply misses the oldest unread updates rather than
/// stalling a publisher (`tokio::sync::broadcast::Sender::send` never
/// blocks).
#[derive(Clone)]
pub struct EventBus {
  sender: tokio::sync::broadcast::Sender<FlowExecutionUpdate>,
}

impl EventBus {
  pub fn new(capacity: usize) -> Self {
    let (sender, _) = tokio::sync::broadcast::channel(capacity);
    Self { sender }
  }

  pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<FlowExecutionUpdate> {
    self.sender.subscribe()
  }

  /// Non-blocking publish. No receivers is not an error; the bus has no
  /// opinion on whether anyone is listening.
  pub fn publish(&self, update: FlowExecutionUpdate) {
    let _ = self.sender.send(update);
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new(1024)
  }
}

/// Per-execution sink: forwards to both the caller-supplied channel
/// (`context.onUpdate`, e.g. an SSE writer) and the process-wide bus. The
/// caller-supplied side is an `mpsc` sender so a single `startExecution`
/// caller can consume only its own execution's updates without filtering
/// the shared bus by id.
#[derive(Clone)]
pub struct UpdateSink {
  execution_id: String,
  bus: EventBus,
  direct: Option<tokio::sync::mpsc::UnboundedSender<FlowExecutionUpdate>>,
}

impl UpdateSink {
  pub fn new(execution_id: String, bus: EventBus, direct: Option<tokio::sync::mpsc::UnboundedSender<FlowExecutionUpdate>>) -> Self {
    Self { execution_id, bus, direct }
  }

  pub fn emit(&self, update_type: UpdateType, node_id: Option<String>, node_type: Option<String>, data: Value) {
    let update = FlowExecutionUpdate {
      update_type,
      execution_id: self.execution_id.clone(),
      timestamp: chrono::Utc::now(),
      node_id,
      node_type,
      data,
    };
    if let Some(direct) = &self.direct {
      let _ = direct.send(update.clone());
    }
    self.bus.publish(update);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct EchoHandler;

  #[async_trait]
  impl NodeHandler for EchoHandler {
    async fn execute(&self, node: &FlowNode, _context: &FlowExecutionContext) -> NodeExecutionResult {
      NodeExecutionResult::ok(Value::String(node.name().to_string()))
    }
  }

  #[test]
  fn registry_round_trips_handler_lookup() {
    let mut registry = HandlerRegistry::new();
    registry.register("agent", Arc::new(EchoHandler));
    assert!(registry.get("agent").is_some());
    assert!(registry.get("missing").is_none());
  }

  #[tokio::test]
  async fn bus_delivers_to_all_subscribers() {
    let bus = EventBus::new(16);
    let mut sub1 = bus.subscribe();
    let mut sub2 = bus.subscribe();

    bus.publish(FlowExecutionUpdate {
      update_type: UpdateType::ExecutionStarted,
      execution_id: "e1".into(),
      timestamp: chrono::Utc::now(),
      node_id: None,
      node_type: None,
      data: Value::Null,
    });

    let u1 = sub1.recv().await.unwrap();
    let u2 = sub2.recv().await.unwrap();
    assert_eq!(u1.execution_id, "e1");
    assert_eq!(u2.execution_id, "e1");
  }

  #[tokio::test]
  async fn update_sink_forwards_to_both_direct_and_bus() {
    let bus = EventBus::new(16);
    let mut bus_sub = bus.subscribe();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let sink = UpdateSink::new("e1".into(), bus.clone(), Some(tx));

    sink.emit(UpdateType::NodeStarted, Some("n1".into()), Some("agent".into()), Value::Null);

    let direct = rx.recv().await.unwrap();
    let via_bus = bus_sub.recv().await.unwrap();
    assert_eq!(direct.node_id.as_deref(), Some("n1"));
    assert_eq!(via_bus.node_id.as_deref(), Some("n1"));
  }
}
