//! A flow execution engine and error-classification/retry controller for
//! running linear, `nextNodeId`-chained agent workflows.

pub mod backoff;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod model;
pub mod observability;
pub mod retry;
pub mod shared_state;

pub use backoff::{delay_for, FixedJitterSource, JitterSource, RngJitterSource};
pub use engine::{DefinitionStore, ExecutionStore, FlowEngine, InMemoryDefinitionStore, InMemoryExecutionStore};
pub use error::{classify, ErrorCategory, ErrorRecoveryAction, FlowCraftError, FlowError, Result};
pub use events::{EventBus, HandlerRegistry, NodeExecutionResult, NodeHandler, UpdateSink};
pub use executor::{merge_data, ExecutorOutcome, NodeExecutor};
pub use model::{
  DynMap, ExecutionStatus, Flow, FlowExecution, FlowExecutionContext, FlowExecutionLog,
  FlowExecutionResult, FlowExecutionUpdate, FlowNode, LogLevel, NodeExecution, NodeStatus,
  StartFlowExecutionRequest, TriggeredBy, UpdateType,
};
pub use observability::{AlertManager, AlertRule, ExecutionEvent, MetricsCollector};
pub use retry::{NodeRetryState, RetryAttempt, RetryConfig, RetryController};
pub use shared_state::SharedState;
