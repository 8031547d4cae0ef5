use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{ImError, Result};

/// Lookup of the live instances of a named service.
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    async fn list_instances(&self, service_name: &str) -> Result<Vec<String>>;
}

/// Fixed, in-process instance list. Registration is only useful for tests and
/// for a process advertising itself.
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    services: RwLock<HashMap<String, Vec<String>>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(self, name: &str, addrs: impl IntoIterator<Item = String>) -> Self {
        for a in addrs {
            self.register(name, a);
        }
        self
    }

    pub fn register(&self, name: &str, addr: impl Into<String>) {
        let addr = addr.into();
        let mut services = self.services.write().unwrap_or_else(|p| p.into_inner());
        let list = services.entry(name.to_string()).or_default();
        if !list.contains(&addr) {
            list.push(addr);
        }
    }

    pub fn deregister(&self, name: &str, addr: &str) {
        let mut services = self.services.write().unwrap_or_else(|p| p.into_inner());
        if let Some(list) = services.get_mut(name) {
            list.retain(|a| a != addr);
        }
    }
}

#[async_trait]
impl ServiceDiscovery for StaticDiscovery {
    async fn list_instances(&self, service_name: &str) -> Result<Vec<String>> {
        let services = self
            .services
            .read()
            .map_err(|_| ImError::Internal("discovery lock poisoned".into()))?;
        Ok(services.get(service_name).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_dedupes_and_deregister_removes() {
        let d = StaticDiscovery::new().with_service("gw", ["a:1".to_string(), "b:2".to_string()]);
        d.register("gw", "a:1");
        assert_eq!(d.list_instances("gw").await.unwrap(), vec!["a:1", "b:2"]);
        d.deregister("gw", "a:1");
        assert_eq!(d.list_instances("gw").await.unwrap(), vec!["b:2"]);
        assert!(d.list_instances("other").await.unwrap().is_empty());
    }
}
