//! Ambient instrumentation: a lightweight metrics/event collector and a
//! threshold-based alert manager, independent of the execution engine.
//!
//! `MetricsCollector` tracks named counters plus a recorded-event log;
//! `AlertManager` checks threshold rules against those counters. No
//! `/metrics` endpoint or exporter is wired up here, just the in-process
//! collection primitives a caller can build one on top of.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct ExecutionEvent {
  pub node_id: String,
  pub event_type: String,
  pub timestamp: Instant,
  pub duration_ms: Option<u64>,
  pub metadata: HashMap<String, String>,
}

impl ExecutionEvent {
  pub fn new(node_id: impl Into<String>, event_type: impl Into<String>) -> Self {
    Self {
      node_id: node_id.into(),
      event_type: event_type.into(),
      timestamp: Instant::now(),
      duration_ms: None,
      metadata: HashMap::new(),
    }
  }

  pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
    self.duration_ms = Some(duration_ms);
    self
  }
}

#[derive(Debug, Default)]
pub struct MetricsCollector {
  metrics: Arc<Mutex<HashMap<String, f64>>>,
  events: Arc<Mutex<Vec<ExecutionEvent>>>,
}

impl MetricsCollector {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn increment_counter(&self, name: &str, value: f64) {
    let mut metrics = self.metrics.lock().unwrap();
    *metrics.entry(name.to_string()).or_insert(0.0) += value;
  }

  pub fn record_event(&self, event: ExecutionEvent) {
    self.events.lock().unwrap().push(event);
  }

  pub fn get_metric(&self, name: &str) -> Option<f64> {
    self.metrics.lock().unwrap().get(name).copied()
  }

  pub fn get_events(&self) -> Vec<ExecutionEvent> {
    self.events.lock().unwrap().clone()
  }
}

#[derive(Debug)]
pub struct AlertRule {
  pub name: String,
  pub condition: String,
  pub threshold: f64,
  pub action: String,
}

#[derive(Debug, Default)]
pub struct AlertManager {
  rules: Vec<AlertRule>,
  triggered_alerts: Arc<Mutex<Vec<String>>>,
}

impl AlertManager {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_alert_rule(&mut self, rule: AlertRule) {
    self.rules.push(rule);
  }

  pub fn check_alerts(&self, metrics: &MetricsCollector) {
    for rule in &self.rules {
      if let Some(value) = metrics.get_metric(&rule.condition) {
        if value > rule.threshold {
          self.triggered_alerts.lock().unwrap().push(rule.name.clone());
        }
      }
    }
  }

  pub fn get_triggered_alerts(&self) -> Vec<String> {
    self.triggered_alerts.lock().unwrap().clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn counters_accumulate_across_calls() {
    let metrics = MetricsCollector::new();
    metrics.increment_counter("node.execution_count", 1.0);
    metrics.increment_counter("node.execution_count", 1.0);
    metrics.increment_counter("node.execution_count", 1.0);
    assert_eq!(metrics.get_metric("node.execution_count"), Some(3.0));
  }

  #[test]
  fn unknown_metric_returns_none() {
    let metrics = MetricsCollector::new();
    assert_eq!(metrics.get_metric("nothing.recorded"), None);
  }

  #[test]
  fn events_are_recorded_in_order() {
    let metrics = MetricsCollector::new();
    metrics.record_event(ExecutionEvent::new("n1", "node_started"));
    metrics.record_event(ExecutionEvent::new("n1", "node_completed").with_duration_ms(12));

    let events = metrics.get_events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type, "node_started");
    assert_eq!(events[1].event_type, "node_completed");
    assert_eq!(events[1].duration_ms, Some(12));
  }

  #[test]
  fn alert_fires_once_threshold_is_exceeded() {
    let metrics = MetricsCollector::new();
    let mut alerts = AlertManager::new();
    alerts.add_alert_rule(AlertRule {
      name: "too_many_failures".to_string(),
      condition: "node.failure_count".to_string(),
      threshold: 2.0,
      action: "notify".to_string(),
    });

    metrics.increment_counter("node.failure_count", 1.0);
    alerts.check_alerts(&metrics);
    assert!(alerts.get_triggered_alerts().is_empty());

    metrics.increment_counter("node.failure_count", 2.0);
    alerts.check_alerts(&metrics);
    assert_eq!(alerts.get_triggered_alerts(), vec!["too_many_failures".to_string()]);
  }

  #[test]
  fn alert_with_no_recorded_metric_never_fires() {
    let metrics = MetricsCollector::new();
    let mut alerts = AlertManager::new();
    alerts.add_alert_rule(AlertRule {
      name: "ghost_rule".to_string(),
      condition: "never.recorded".to_string(),
      threshold: 0.0,
      action: "notify".to_string(),
    });

    alerts.check_alerts(&metrics);
    assert!(alerts.get_triggered_alerts().is_empty());
  }
}
