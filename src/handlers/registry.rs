use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use super::traits::JobHandler;

/// Registry mapping job names to handler instances
///
/// Registration works through a shared reference so handlers can be added
/// after the queue has started.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<BTreeMap<String, Arc<dyn JobHandler>>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous one
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let name = name.into();
        if self.handlers.write().insert(name.clone(), handler).is_some() {
            warn!(job = %name, "Replaced existing job handler");
        } else {
            debug!(job = %name, "Registered job handler");
        }
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.handlers.write().remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::traits::handler_fn;
    use serde_json::Value;

    #[test]
    fn test_register_and_lookup() {
        let registry = HandlerRegistry::new();
        registry.register("noop", Arc::new(handler_fn(|_, _| async { Ok(Value::Null) })));

        assert!(registry.contains("noop"));
        assert!(registry.get("noop").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["noop"]);

        assert!(registry.unregister("noop"));
        assert!(!registry.contains("noop"));
    }
}
