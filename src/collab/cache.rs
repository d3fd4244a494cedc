//! Cache adapter seam
//!
//! Workers invoke cache methods by name with a JSON argument list; the
//! orchestrator forwards the call to the shared adapter and replies with the
//! result.

use crate::error::BoxError;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

/// Cache reachable from every worker through the orchestrator
#[async_trait]
pub trait CacheAdapter: Send + Sync {
    /// Invoke `method` with `args`
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, BoxError>;
}

/// In-process key/value cache
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, Value>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

fn key_arg(method: &str, args: &[Value]) -> Result<String, BoxError> {
    match args.first() {
        Some(Value::String(key)) => Ok(key.clone()),
        Some(other) => Ok(other.to_string()),
        None => Err(format!("cache method '{method}' requires a key argument").into()),
    }
}

#[async_trait]
impl CacheAdapter for MemoryCache {
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, BoxError> {
        match method {
            "get" => {
                let key = key_arg(method, &args)?;
                Ok(self.entries.get(&key).map(|v| v.clone()).unwrap_or(Value::Null))
            }
            "set" => {
                let key = key_arg(method, &args)?;
                let value = args.get(1).cloned().unwrap_or(Value::Null);
                self.entries.insert(key, value);
                Ok(Value::Bool(true))
            }
            "delete" => {
                let key = key_arg(method, &args)?;
                Ok(Value::Bool(self.entries.remove(&key).is_some()))
            }
            "has" => {
                let key = key_arg(method, &args)?;
                Ok(Value::Bool(self.entries.contains_key(&key)))
            }
            "keys" => {
                let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
                keys.sort();
                Ok(Value::from(keys))
            }
            "size" => Ok(Value::from(self.entries.len())),
            "clear" => {
                self.entries.clear();
                Ok(Value::Bool(true))
            }
            other => Err(format!("unknown cache method '{other}'").into()),
        }
    }
}
