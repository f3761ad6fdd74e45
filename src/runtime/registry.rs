//! Name → connector registry.
//!
//! Records persist only the connector name, so every process that runs poll
//! or push callbacks must register the same connectors under the same names.

use crate::connector::Connector;
use std::collections::HashMap;
use std::sync::Arc;

/// Immutable, cheaply cloneable registry of connectors.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    inner: Arc<HashMap<String, Connector>>,
}

pub struct ConnectorRegistryBuilder {
    map: HashMap<String, Connector>,
    errors: Vec<String>,
}

impl ConnectorRegistry {
    pub fn builder() -> ConnectorRegistryBuilder {
        ConnectorRegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn builder_from(reg: &ConnectorRegistry) -> ConnectorRegistryBuilder {
        ConnectorRegistryBuilder {
            map: reg.inner.as_ref().clone(),
            errors: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Connector> {
        let result = self.inner.get(name);
        if result.is_none() {
            self.log_registry_miss(name);
        }
        result
    }

    /// List all registered names
    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }

    fn log_registry_miss(&self, name: &str) {
        tracing::debug!(
            target: "opwatch::runtime::registry",
            requested_name = %name,
            registered_count = self.inner.len(),
            registered_names = ?self.list_names(),
            "Connector registry lookup miss"
        );
    }
}

impl ConnectorRegistryBuilder {
    pub fn register(mut self, connector: Connector) -> Self {
        let name = connector.name().to_string();
        if self.map.contains_key(&name) {
            self.errors.push(format!("duplicate connector registration: {name}"));
            return self;
        }
        self.map.insert(name, connector);
        self
    }

    pub fn build(self) -> ConnectorRegistry {
        ConnectorRegistry {
            inner: Arc::new(self.map),
        }
    }

    /// Build the registry, returning an error if there were any registration errors.
    ///
    /// # Errors
    ///
    /// Returns an error string containing all registration errors.
    pub fn build_result(self) -> Result<ConnectorRegistry, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{RemoteError, RemoteOperationClient};
    use crate::request::OperationRequest;
    use crate::{ExternalRef, RemoteStatus};

    struct Noop;

    #[async_trait::async_trait]
    impl RemoteOperationClient for Noop {
        async fn start(&self, _request: &OperationRequest) -> Result<ExternalRef, RemoteError> {
            Ok(ExternalRef::new("x"))
        }
        async fn status(&self, _external_ref: &ExternalRef) -> Result<RemoteStatus, RemoteError> {
            Ok(RemoteStatus::running())
        }
    }

    #[test]
    fn duplicate_registration_is_reported() {
        let err = ConnectorRegistry::builder()
            .register(Connector::new("ci", Arc::new(Noop)))
            .register(Connector::new("ci", Arc::new(Noop)))
            .build_result()
            .err()
            .unwrap();
        assert!(err.contains("duplicate connector registration: ci"));
    }

    #[test]
    fn builder_from_extends_existing_registry() {
        let base = ConnectorRegistry::builder()
            .register(Connector::new("ci", Arc::new(Noop)))
            .build();
        let extended = ConnectorRegistry::builder_from(&base)
            .register(Connector::new("cloud", Arc::new(Noop)))
            .build();
        assert_eq!(extended.list_names(), vec!["ci".to_string(), "cloud".to_string()]);
        assert_eq!(base.count(), 1);
        assert!(extended.get("chat").is_none());
        assert!(extended.has("cloud"));
    }
}
