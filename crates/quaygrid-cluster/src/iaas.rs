//! Machine provider interface.
//!
//! Machine providers are pluggable infrastructure drivers that create and
//! destroy the virtual machines hosting nodes. The provisioner only
//! consumes this interface; concrete drivers register themselves at
//! startup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IaasError {
    #[error("unknown machine provider: {0}")]
    UnknownProvider(String),

    #[error("no default machine provider configured")]
    NoDefaultProvider,

    #[error("machine provider error: {0}")]
    Provider(String),
}

/// A machine created by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedMachine {
    pub id: String,
    pub status: String,
    pub address: String,
}

#[async_trait]
pub trait MachineProvider: Send + Sync {
    /// Human-readable description returned by the node-add endpoint.
    fn describe(&self) -> String;

    async fn create_machine(
        &self,
        params: &HashMap<String, String>,
    ) -> Result<ProvisionedMachine, IaasError>;

    async fn delete_machine(&self, machine: &ProvisionedMachine) -> Result<(), IaasError>;
}

/// Registry of machine providers, keyed by name.
#[derive(Default)]
pub struct MachineProviders {
    providers: Mutex<HashMap<String, Arc<dyn MachineProvider>>>,
}

impl MachineProviders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, provider: Arc<dyn MachineProvider>) {
        self.providers
            .lock()
            .expect("provider registry poisoned")
            .insert(name.to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn MachineProvider>, IaasError> {
        self.providers
            .lock()
            .expect("provider registry poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| IaasError::UnknownProvider(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestProvider;

    #[async_trait]
    impl MachineProvider for TestProvider {
        fn describe(&self) -> String {
            "my iaas description".to_string()
        }

        async fn create_machine(
            &self,
            params: &HashMap<String, String>,
        ) -> Result<ProvisionedMachine, IaasError> {
            let id = params.get("id").cloned().unwrap_or_default();
            Ok(ProvisionedMachine {
                address: format!("{id}.fake.host"),
                id,
                status: "running".to_string(),
            })
        }

        async fn delete_machine(&self, _machine: &ProvisionedMachine) -> Result<(), IaasError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn registry_lookup() {
        let providers = MachineProviders::new();
        providers.register("test-iaas", Arc::new(TestProvider));

        let provider = providers.get("test-iaas").unwrap();
        assert_eq!(provider.describe(), "my iaas description");

        let err = providers.get("nope");
        assert!(matches!(err, Err(IaasError::UnknownProvider(_))));
    }

    #[tokio::test]
    async fn create_machine_builds_address() {
        let provider = TestProvider;
        let params = HashMap::from([("id".to_string(), "test1".to_string())]);
        let machine = provider.create_machine(&params).await.unwrap();
        assert_eq!(machine.address, "test1.fake.host");
        assert_eq!(machine.status, "running");
    }
}
