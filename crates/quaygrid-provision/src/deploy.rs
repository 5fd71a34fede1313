//! The deploy flow: build in a throwaway container, commit, roll units.

use tracing::info;

use quay_core::{image, AppSpec, ProgressWriter};
use quaygrid_pipeline::Pipeline;

use crate::actions::{
    CreateContainer, FollowLogsAndCommit, InsertEmptyRecord, RunContainerCtx, StartContainer,
    UpdateRecord,
};
use crate::error::{ProvisionError, ProvisionResult};
use crate::lifecycle;
use crate::provisioner::Deps;

/// The image a deploy builds from: the app's last committed image, except
/// for the first deploy, every tenth deploy, and pending platform updates,
/// which start over from the platform image.
pub fn image_for_deploy(deps: &Deps, app: &AppSpec) -> ProvisionResult<String> {
    if app.use_platform_image() {
        return Ok(image::platform_image(&deps.config, &app.platform));
    }
    let containers = deps.store.list_by_app(&app.name)?;
    match containers.iter().find(|c| !c.image.is_empty()) {
        Some(record) => Ok(record.image.clone()),
        None => Ok(image::platform_image(&deps.config, &app.platform)),
    }
}

/// Run the build pipeline and return the committed image reference.
async fn build(
    deps: &Deps,
    app: &AppSpec,
    commands: Vec<String>,
    writer: &ProgressWriter,
) -> ProvisionResult<String> {
    let base_image = image_for_deploy(deps, app)?;
    let mut ctx = RunContainerCtx {
        app: app.clone(),
        image: base_image,
        commands,
        destination_hosts: Vec::new(),
        private_key: String::new(),
        writer: writer.clone(),
        container: None,
        built_image: None,
    };
    let actions: Vec<Box<dyn quaygrid_pipeline::Action<RunContainerCtx, ProvisionError>>> = vec![
        Box::new(InsertEmptyRecord { deps: deps.clone() }),
        Box::new(CreateContainer { deps: deps.clone() }),
        Box::new(StartContainer { deps: deps.clone() }),
        Box::new(UpdateRecord { deps: deps.clone() }),
        Box::new(FollowLogsAndCommit { deps: deps.clone() }),
    ];
    Pipeline::new(actions).execute(&mut ctx).await?;
    ctx.built_image
        .ok_or_else(|| ProvisionError::Internal("deploy pipeline produced no image".into()))
}

/// Full deploy: build and commit the image, then replace the app's units
/// (or create the first one).
pub async fn deploy(
    deps: &Deps,
    app: &AppSpec,
    commands: Vec<String>,
    writer: &ProgressWriter,
) -> ProvisionResult<String> {
    let built = build(deps, app, commands, writer).await?;
    info!(app = %app.name, image = %built, "image committed, rolling units");

    let containers = deps.store.list_by_app(&app.name)?;
    if containers.is_empty() {
        lifecycle::run_create_units(deps, app, 1, Vec::new(), writer).await?;
    } else {
        lifecycle::run_replace_units(deps, app, containers, Vec::new(), writer).await?;
    }
    Ok(built)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use quay_core::QuayConfig;
    use quaygrid_cluster::testing::{FakeEngine, FakeEngineFactory};
    use quaygrid_cluster::{Cluster, MemoryStorage};
    use quaygrid_shell::AgentClient;
    use quaygrid_state::{ContainerRecord, MetaStore, Status};

    struct FirstNode;

    #[async_trait::async_trait]
    impl quaygrid_cluster::Scheduler for FirstNode {
        async fn schedule(
            &self,
            nodes: &[quaygrid_cluster::Node],
            _app: &AppSpec,
        ) -> Result<quaygrid_cluster::Node, quaygrid_cluster::ScheduleError> {
            nodes
                .first()
                .cloned()
                .ok_or(quaygrid_cluster::ScheduleError::NoNodesAvailable)
        }
    }

    fn test_deps() -> Deps {
        let config = QuayConfig::default();
        let engine = Arc::new(FakeEngine::new(&config.run_cmd.port));
        let cluster = Arc::new(Cluster::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(FirstNode),
            Arc::new(FakeEngineFactory::shared(engine)),
        ));
        Deps {
            agent: Arc::new(AgentClient::new(config.ssh.agent_port)),
            config,
            cluster,
            store: MetaStore::open_in_memory().unwrap(),
            router: Arc::new(quaygrid_router::MemoryRouter::new()),
        }
    }

    fn committed_record(deps: &Deps, app_name: &str, image: &str) {
        let mut record = ContainerRecord::building(app_name, "python");
        record.id = format!("c-{app_name}");
        record.image = image.to_string();
        record.status = Status::Started;
        deps.store.add_container(&record).unwrap();
    }

    #[test]
    fn first_deploy_uses_the_platform_image() {
        let deps = test_deps();
        let app = AppSpec::new("myapp", "python", 0);
        assert_eq!(image_for_deploy(&deps, &app).unwrap(), "quay/python");
    }

    #[test]
    fn later_deploys_reuse_the_committed_image() {
        let deps = test_deps();
        committed_record(&deps, "myapp", "someimageid");
        let app = AppSpec::new("myapp", "python", 1);
        assert_eq!(image_for_deploy(&deps, &app).unwrap(), "someimageid");
    }

    #[test]
    fn every_tenth_deploy_resets_to_the_platform_image() {
        let deps = test_deps();
        committed_record(&deps, "myapp", "quay/myapp");
        let app = AppSpec::new("myapp", "python", 20);
        assert_eq!(image_for_deploy(&deps, &app).unwrap(), "quay/python");
    }

    #[test]
    fn platform_update_forces_the_platform_image() {
        let deps = test_deps();
        committed_record(&deps, "myapp", "quay/myapp");
        let app = AppSpec {
            update_platform: true,
            ..AppSpec::new("myapp", "python", 3)
        };
        assert_eq!(image_for_deploy(&deps, &app).unwrap(), "quay/python");
    }

    #[test]
    fn records_without_an_image_fall_back_to_the_platform() {
        let deps = test_deps();
        committed_record(&deps, "myapp", "");
        let app = AppSpec::new("myapp", "python", 1);
        assert_eq!(image_for_deploy(&deps, &app).unwrap(), "quay/python");
    }
}
