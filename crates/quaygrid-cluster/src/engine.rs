//! Host engine — one node's container daemon.
//!
//! [`HostEngine`] is the per-node surface the cluster routes calls to;
//! [`DockerEngine`] implements it against the Docker Engine API.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bollard::models::{ContainerConfig, ContainerCreateBody, ContainerInspectResponse};
use bollard::query_parameters::{
    BuildImageOptions, CommitContainerOptions, CreateContainerOptions, CreateImageOptions,
    InspectContainerOptions, LogsOptions, PushImageOptions, RemoveContainerOptions,
    RemoveImageOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::Docker;
use futures_util::StreamExt;
use tracing::debug;

use quay_core::ProgressWriter;

use crate::error::{EngineError, EngineResult};

/// Per-call timeout for engine RPCs, in seconds.
const ENGINE_TIMEOUT_SECS: u64 = 120;

#[async_trait]
pub trait HostEngine: Send + Sync {
    /// Create a container and return its engine-assigned ID.
    async fn create_container(
        &self,
        name: &str,
        body: ContainerCreateBody,
    ) -> EngineResult<String>;

    async fn start_container(&self, id: &str) -> EngineResult<()>;

    async fn stop_container(&self, id: &str, grace_secs: i32) -> EngineResult<()>;

    async fn remove_container(&self, id: &str) -> EngineResult<()>;

    async fn inspect_container(&self, id: &str) -> EngineResult<ContainerInspectResponse>;

    /// Block until the container exits; returns its exit code.
    async fn wait_container(&self, id: &str) -> EngineResult<i64>;

    /// Stream container output into the sink until the stream ends.
    async fn follow_logs(&self, id: &str, sink: &ProgressWriter) -> EngineResult<()>;

    /// Commit the container to an image under `repository`; returns the
    /// image ID.
    async fn commit_container(&self, id: &str, repository: &str) -> EngineResult<String>;

    async fn pull_image(&self, image: &str, sink: &ProgressWriter) -> EngineResult<()>;

    async fn push_image(&self, image: &str) -> EngineResult<()>;

    async fn remove_image(&self, image: &str) -> EngineResult<()>;

    /// Build an image from a remote build context.
    async fn build_image(
        &self,
        name: &str,
        remote: &str,
        sink: &ProgressWriter,
    ) -> EngineResult<()>;

    async fn ping(&self) -> EngineResult<()>;
}

/// Produces a [`HostEngine`] for a node address. Lets tests substitute
/// fakes without touching the cluster.
pub trait EngineFactory: Send + Sync {
    fn engine(&self, address: &str) -> EngineResult<Arc<dyn HostEngine>>;
}

// ── Docker implementation ──────────────────────────────────────────

/// Docker Engine API client for one node.
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub fn connect(address: &str) -> EngineResult<Self> {
        let docker = Docker::connect_with_http(
            address,
            ENGINE_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        )
        .map_err(|e| EngineError::Transport(e.to_string()))?;
        Ok(DockerEngine { docker })
    }
}

#[async_trait]
impl HostEngine for DockerEngine {
    async fn create_container(
        &self,
        name: &str,
        body: ContainerCreateBody,
    ) -> EngineResult<String> {
        let options = CreateContainerOptions {
            name: Some(name.to_string()),
            ..Default::default()
        };
        let created = self.docker.create_container(Some(options), body).await?;
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await?;
        Ok(())
    }

    async fn stop_container(&self, id: &str, grace_secs: i32) -> EngineResult<()> {
        let options = StopContainerOptions {
            t: Some(grace_secs),
            ..Default::default()
        };
        self.docker.stop_container(id, Some(options)).await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> EngineResult<()> {
        self.docker
            .remove_container(id, None::<RemoveContainerOptions>)
            .await?;
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> EngineResult<ContainerInspectResponse> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        Ok(inspect)
    }

    async fn wait_container(&self, id: &str) -> EngineResult<i64> {
        let mut stream = self.docker.wait_container(id, None::<WaitContainerOptions>);
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // The engine reports a non-zero exit as a wait error carrying
            // the code.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(err)) => Err(err.into()),
            None => Ok(0),
        }
    }

    async fn follow_logs(&self, id: &str, sink: &ProgressWriter) -> EngineResult<()> {
        let options = LogsOptions {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = self.docker.logs(id, Some(options));
        while let Some(chunk) = stream.next().await {
            let output = chunk?;
            sink.raw(output.to_string());
        }
        Ok(())
    }

    async fn commit_container(&self, id: &str, repository: &str) -> EngineResult<String> {
        let options = CommitContainerOptions {
            container: Some(id.to_string()),
            repo: Some(repository.to_string()),
            ..Default::default()
        };
        let commit = self
            .docker
            .commit_container(options, ContainerConfig::default())
            .await?;
        debug!(container = id, image = %commit.id, "container committed");
        Ok(commit.id)
    }

    async fn pull_image(&self, image: &str, sink: &ProgressWriter) -> EngineResult<()> {
        let options = CreateImageOptions {
            from_image: Some(image.to_string()),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            let info = progress?;
            if let Some(status) = info.status {
                sink.raw(status);
            }
        }
        Ok(())
    }

    async fn push_image(&self, image: &str) -> EngineResult<()> {
        let mut stream = self
            .docker
            .push_image(image, None::<PushImageOptions>, None);
        while let Some(progress) = stream.next().await {
            progress?;
        }
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> EngineResult<()> {
        self.docker
            .remove_image(image, None::<RemoveImageOptions>, None)
            .await?;
        Ok(())
    }

    async fn build_image(
        &self,
        name: &str,
        remote: &str,
        sink: &ProgressWriter,
    ) -> EngineResult<()> {
        let options = BuildImageOptions {
            t: Some(name.to_string()),
            remote: Some(remote.to_string()),
            nocache: true,
            rm: true,
            ..Default::default()
        };
        let mut stream = self.docker.build_image(options, None, None);
        while let Some(progress) = stream.next().await {
            let info = progress?;
            if let Some(line) = info.stream {
                sink.raw(line);
            }
        }
        Ok(())
    }

    async fn ping(&self) -> EngineResult<()> {
        self.docker.ping().await?;
        Ok(())
    }
}

/// Connects (and caches) one [`DockerEngine`] per node address.
#[derive(Default)]
pub struct DockerEngineFactory {
    cache: Mutex<HashMap<String, Arc<dyn HostEngine>>>,
}

impl DockerEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EngineFactory for DockerEngineFactory {
    fn engine(&self, address: &str) -> EngineResult<Arc<dyn HostEngine>> {
        let mut cache = self.cache.lock().expect("engine cache poisoned");
        if let Some(engine) = cache.get(address) {
            return Ok(engine.clone());
        }
        let engine: Arc<dyn HostEngine> = Arc::new(DockerEngine::connect(address)?);
        cache.insert(address.to_string(), engine.clone());
        Ok(engine)
    }
}
