use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// Describes the local service instance as it is announced to the registry.
///
/// Field names on the wire are camelCase and identical for every transport.
/// Two descriptors are equal when their `id`s are equal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub id: String,
    pub service_name: String,
    pub host: String,
    pub port: u16,
    pub url: String,
    pub health_path: String,
}

impl ServiceInstance {
    pub fn new(
        id: impl Into<String>,
        service_name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        let host = host.into();
        Self {
            id: id.into(),
            service_name: service_name.into(),
            url: format!("http://{}:{}", host, port),
            host,
            port,
            health_path: "/health".to_string(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_health_path(mut self, health_path: impl Into<String>) -> Self {
        self.health_path = health_path.into();
        self
    }
}

impl PartialEq for ServiceInstance {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ServiceInstance {}

impl Hash for ServiceInstance {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_wire_field_names() {
        let instance = ServiceInstance::new("orders-1", "orders", "10.0.0.7", 8080);
        let value = serde_json::to_value(&instance).unwrap();

        assert_eq!(value["id"], "orders-1");
        assert_eq!(value["serviceName"], "orders");
        assert_eq!(value["host"], "10.0.0.7");
        assert_eq!(value["port"], 8080);
        assert_eq!(value["url"], "http://10.0.0.7:8080");
        assert_eq!(value["healthPath"], "/health");
    }

    #[test]
    fn test_equality_and_hash_use_id_only() {
        let a = ServiceInstance::new("orders-1", "orders", "10.0.0.7", 8080);
        let b = ServiceInstance::new("orders-1", "orders-v2", "10.0.0.8", 9090)
            .with_health_path("/ready");
        let c = ServiceInstance::new("orders-2", "orders", "10.0.0.7", 8080);

        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }
}
