//! In-memory fake host engine for tests.
//!
//! Behaves like a well-behaved container daemon: containers get sequential
//! IDs, in-container IPs, and published host ports; images live in a set.
//! Individual operations can be made to fail once via [`FakeEngine::fail_next`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bollard::models::{
    ContainerConfig, ContainerCreateBody, ContainerInspectResponse, NetworkSettings, PortBinding,
};

use quay_core::ProgressWriter;

use crate::engine::{EngineFactory, HostEngine};
use crate::error::{EngineError, EngineResult};

#[derive(Clone)]
struct FakeContainer {
    running: bool,
    ip: String,
    app_host_port: String,
    ssh_host_port: String,
    exit_code: i64,
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    images: HashSet<String>,
    fail_next: HashSet<&'static str>,
    calls: Vec<String>,
    log_lines: Vec<String>,
    default_exit_code: i64,
    next: u32,
    next_port: u32,
}

/// Fake [`HostEngine`] shared across all node addresses of a test cluster.
pub struct FakeEngine {
    app_port: String,
    state: Mutex<FakeState>,
}

impl FakeEngine {
    pub fn new(app_port: &str) -> Self {
        FakeEngine {
            app_port: app_port.to_string(),
            state: Mutex::new(FakeState {
                next_port: 49153,
                ..FakeState::default()
            }),
        }
    }

    /// Make the next call of `op` fail with a transport error. Ops:
    /// `create`, `start`, `stop`, `remove`, `inspect`, `wait`, `logs`,
    /// `commit`, `pull`, `push`, `remove_image`, `build`, `ping`.
    pub fn fail_next(&self, op: &'static str) {
        self.state.lock().unwrap().fail_next.insert(op);
    }

    /// Exit code reported for containers created from now on.
    pub fn set_default_exit_code(&self, code: i64) {
        self.state.lock().unwrap().default_exit_code = code;
    }

    /// Line emitted by `follow_logs`.
    pub fn push_log_line(&self, line: &str) {
        self.state.lock().unwrap().log_lines.push(line.to_string());
    }

    /// Journal of operations, e.g. `create:cafebabe`, `push:quay/myapp`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(id)
            .map(|c| c.running)
            .unwrap_or(false)
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.state.lock().unwrap().images.contains(image)
    }

    /// Drop a container behind the cluster's back.
    pub fn forget_container(&self, id: &str) {
        self.state.lock().unwrap().containers.remove(id);
    }

    fn take_failure(&self, op: &'static str) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(op.to_string());
        if state.fail_next.remove(op) {
            return Err(EngineError::Transport(format!("{op} failure injected")));
        }
        Ok(())
    }
}

#[async_trait]
impl HostEngine for FakeEngine {
    async fn create_container(
        &self,
        name: &str,
        _body: ContainerCreateBody,
    ) -> EngineResult<String> {
        self.take_failure("create")?;
        let mut state = self.state.lock().unwrap();
        state.next += 1;
        let id = format!("id-{}", state.next);
        let ip = format!("172.17.0.{}", state.next);
        let app_host_port = state.next_port.to_string();
        state.next_port += 1;
        let ssh_host_port = state.next_port.to_string();
        state.next_port += 1;
        let exit_code = state.default_exit_code;
        state.containers.insert(
            id.clone(),
            FakeContainer {
                running: false,
                ip,
                app_host_port,
                ssh_host_port,
                exit_code,
            },
        );
        state.calls.push(format!("create:{name}"));
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        self.take_failure("start")?;
        let mut state = self.state.lock().unwrap();
        match state.containers.get_mut(id) {
            Some(container) => {
                container.running = true;
                Ok(())
            }
            None => Err(EngineError::NotFound(id.to_string())),
        }
    }

    async fn stop_container(&self, id: &str, _grace_secs: i32) -> EngineResult<()> {
        self.take_failure("stop")?;
        let mut state = self.state.lock().unwrap();
        match state.containers.get_mut(id) {
            Some(container) => {
                container.running = false;
                Ok(())
            }
            None => Err(EngineError::NotFound(id.to_string())),
        }
    }

    async fn remove_container(&self, id: &str) -> EngineResult<()> {
        self.take_failure("remove")?;
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("remove:{id}"));
        match state.containers.remove(id) {
            Some(_) => Ok(()),
            None => Err(EngineError::NotFound(id.to_string())),
        }
    }

    async fn inspect_container(&self, id: &str) -> EngineResult<ContainerInspectResponse> {
        self.take_failure("inspect")?;
        let state = self.state.lock().unwrap();
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;

        let binding = |port: &str| {
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(port.to_string()),
            }])
        };
        let ports = HashMap::from([
            (
                format!("{}/tcp", self.app_port),
                binding(&container.app_host_port),
            ),
            ("22/tcp".to_string(), binding(&container.ssh_host_port)),
        ]);

        Ok(ContainerInspectResponse {
            id: Some(id.to_string()),
            config: Some(ContainerConfig {
                tty: Some(false),
                ..Default::default()
            }),
            network_settings: Some(NetworkSettings {
                ip_address: Some(container.ip.clone()),
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    async fn wait_container(&self, id: &str) -> EngineResult<i64> {
        self.take_failure("wait")?;
        let mut state = self.state.lock().unwrap();
        match state.containers.get_mut(id) {
            Some(container) => {
                container.running = false;
                Ok(container.exit_code)
            }
            None => Err(EngineError::NotFound(id.to_string())),
        }
    }

    async fn follow_logs(&self, id: &str, sink: &ProgressWriter) -> EngineResult<()> {
        self.take_failure("logs")?;
        let state = self.state.lock().unwrap();
        if !state.containers.contains_key(id) {
            return Err(EngineError::NotFound(id.to_string()));
        }
        for line in &state.log_lines {
            sink.raw(line.clone());
        }
        Ok(())
    }

    async fn commit_container(&self, id: &str, repository: &str) -> EngineResult<String> {
        self.take_failure("commit")?;
        let mut state = self.state.lock().unwrap();
        if !state.containers.contains_key(id) {
            return Err(EngineError::NotFound(id.to_string()));
        }
        state.images.insert(repository.to_string());
        state.calls.push(format!("commit:{repository}"));
        Ok(format!("sha256:fake-{repository}"))
    }

    async fn pull_image(&self, image: &str, _sink: &ProgressWriter) -> EngineResult<()> {
        self.take_failure("pull")?;
        let mut state = self.state.lock().unwrap();
        state.images.insert(image.to_string());
        state.calls.push(format!("pull:{image}"));
        Ok(())
    }

    async fn push_image(&self, image: &str) -> EngineResult<()> {
        self.take_failure("push")?;
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("push:{image}"));
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> EngineResult<()> {
        self.take_failure("remove_image")?;
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("remove_image:{image}"));
        if state.images.remove(image) {
            Ok(())
        } else {
            Err(EngineError::NotFound(image.to_string()))
        }
    }

    async fn build_image(
        &self,
        name: &str,
        _remote: &str,
        sink: &ProgressWriter,
    ) -> EngineResult<()> {
        self.take_failure("build")?;
        let mut state = self.state.lock().unwrap();
        state.images.insert(name.to_string());
        state.calls.push(format!("build:{name}"));
        drop(state);
        sink.raw(format!("Successfully built {name}"));
        Ok(())
    }

    async fn ping(&self) -> EngineResult<()> {
        self.take_failure("ping")
    }
}

/// Factory handing the same fake engine to every node address.
pub struct FakeEngineFactory {
    engine: Arc<FakeEngine>,
}

impl FakeEngineFactory {
    pub fn shared(engine: Arc<FakeEngine>) -> Self {
        FakeEngineFactory { engine }
    }
}

impl EngineFactory for FakeEngineFactory {
    fn engine(&self, _address: &str) -> EngineResult<Arc<dyn HostEngine>> {
        Ok(self.engine.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_engine_lifecycle() {
        let engine = FakeEngine::new("8888");
        let id = engine
            .create_container("cafebabe", ContainerCreateBody::default())
            .await
            .unwrap();

        engine.start_container(&id).await.unwrap();
        assert!(engine.is_running(&id));

        let inspect = engine.inspect_container(&id).await.unwrap();
        let settings = inspect.network_settings.unwrap();
        assert!(settings.ip_address.unwrap().starts_with("172.17.0."));
        let ports = settings.ports.unwrap();
        assert!(ports.contains_key("8888/tcp"));
        assert!(ports.contains_key("22/tcp"));

        engine.stop_container(&id, 10).await.unwrap();
        assert!(!engine.is_running(&id));
        engine.remove_container(&id).await.unwrap();
        let err = engine.remove_container(&id).await;
        assert!(matches!(err, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn injected_failure_fires_once() {
        let engine = FakeEngine::new("8888");
        engine.fail_next("ping");
        assert!(engine.ping().await.is_err());
        assert!(engine.ping().await.is_ok());
    }

    #[tokio::test]
    async fn wait_reports_configured_exit_code() {
        let engine = FakeEngine::new("8888");
        engine.set_default_exit_code(1);
        let id = engine
            .create_container("deadbeef", ContainerCreateBody::default())
            .await
            .unwrap();
        assert_eq!(engine.wait_container(&id).await.unwrap(), 1);
    }
}
