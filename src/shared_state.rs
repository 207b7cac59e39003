use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone)]
pub struct SharedState {
  inner: Arc<RwLock<HashMap<String, Value>>>,
}

impl SharedState {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(RwLock::new(HashMap::new())),
    }
  }

  pub fn insert(&self, key: String, value: Value) {
    let mut map = self.inner.write().unwrap();
    map.insert(key, value);
  }

  pub fn get(&self, key: &str) -> Option<Value> {
    let map = self.inner.read().unwrap();
    map.get(key).cloned()
  }

  pub fn contains_key(&self, key: &str) -> bool {
    let map = self.inner.read().unwrap();
    map.contains_key(key)
  }

  pub fn remove(&self, key: &str) -> Option<Value> {
    let mut map = self.inner.write().unwrap();
    map.remove(key)
  }

  pub fn is_empty(&self) -> bool {
    let map = self.inner.read().unwrap();
    map.is_empty()
  }

  pub fn iter(&self) -> Vec<(String, Value)> {
    let map = self.inner.read().unwrap();
    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
  }

  /// Resolve template strings like "{{ key }}" with actual values from the state
  pub fn resolve_template(&self, template: &str) -> String {
    let mut result = template.to_string();

    // Handle simple variable substitutions like {{ key }}
    let map = self.inner.read().unwrap();
    for (key, value) in map.iter() {
      let placeholder = format!("{{{{{}}}}}", key);
      let replacement = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => serde_json::to_string(&value).unwrap_or_default(),
      };
      result = result.replace(&placeholder, &replacement);
    }

    result
  }

  /// Resolve template strings with nested object access like "{{ inputs.question }}"
  pub fn resolve_template_advanced(&self, template: &str) -> String {
    let mut result = template.to_string();

    // Pattern for {{ inputs.key }} or {{ data.nested.key }} or {{ key }}
    let re =
      regex::Regex::new(r"\{\{\s*([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)*)\s*\}\}")
        .expect("Valid regex pattern");

    let map = self.inner.read().unwrap();

    for captures in re.captures_iter(&template) {
      if let Some(full_match) = captures.get(0) {
        if let Some(path) = captures.get(1) {
          let path_str = path.as_str();

          // Try to resolve the path (handles both simple keys and nested paths)
          if let Some(resolved_value) = self.resolve_path(path_str, &map) {
            let replacement = match resolved_value {
              Value::String(s) => s,
              Value::Number(n) => n.to_string(),
              Value::Bool(b) => b.to_string(),
              _ => serde_json::to_string(&resolved_value).unwrap_or_default(),
            };
            result = result.replace(full_match.as_str(), &replacement);
          }
        }
      }
    }

    result
  }

  /// Resolve nested paths like "inputs.question" or simple keys like "model"
  fn resolve_path(&self, path: &str, map: &HashMap<String, Value>) -> Option<Value> {
    let parts: Vec<&str> = path.split('.').collect();

    if parts.is_empty() {
      return None;
    }

    // If it's a simple key (no dots), just look it up directly
    if parts.len() == 1 {
      return map.get(parts[0]).cloned();
    }

    // Start with the first part for nested paths
    let mut current = map.get(parts[0])?.clone();

    // Navigate through nested parts
    for part in &parts[1..] {
      match current {
        Value::Object(ref obj) => {
          current = obj.get(*part)?.clone();
        }
        _ => return None, // Can't navigate further if not an object
      }
    }

    Some(current)
  }
}

impl Default for SharedState {
  fn default() -> Self {
    Self::new()
  }
}

impl Serialize for SharedState {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: serde::Serializer,
  {
    let map = self.inner.read().unwrap();
    map.serialize(serializer)
  }
}

impl<'de> Deserialize<'de> for SharedState {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: serde::Deserializer<'de>,
  {
    let map = HashMap::<String, Value>::deserialize(deserializer)?;
    Ok(Self {
      inner: Arc::new(RwLock::new(map)),
    })
  }
}
