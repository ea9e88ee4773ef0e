//! Walks one Project through its whole life in memory
//!
//! Three registrations watch the same kind: a lifecycle holding a plain finalizer, a
//! cluster-scoped lifecycle holding one finalizer per cluster, and an audit handler
//! behind a feature flag. Run with `RUST_LOG=info,herd_runtime=debug` to see dispatch.
use async_trait::async_trait;
use herd::{
    runtime::lifecycle::finalizer_name, KindInfo, KindRegistry, Lifecycle, MemoryStore, ResourceExt, Scope,
    SharedControllerConfig, SharedControllerFactory, TypedClient,
};
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use std::{
    convert::Infallible,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::*;

#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, Default)]
#[kube(
    group = "management.cattle.io",
    version = "v3",
    kind = "Project",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSpec {
    display_name: String,
    cluster_name: String,
}

const INITIALIZED_LABEL: &str = "herd.dev/initialized";

/// Labels projects once and logs their removal
struct ProjectInit;

#[async_trait]
impl Lifecycle<Project> for ProjectInit {
    type Error = Infallible;

    async fn create(&self, mut project: Project) -> Result<Option<Project>, Infallible> {
        info!(project = %project.name_any(), "initializing");
        project.labels_mut().insert(INITIALIZED_LABEL.into(), "true".into());
        Ok(Some(project))
    }

    async fn remove(&self, project: Project) -> Result<Option<Project>, Infallible> {
        info!(project = %project.name_any(), "cleaning up");
        Ok(None)
    }

    async fn updated(&self, project: Project) -> Result<Option<Project>, Infallible> {
        info!(project = %project.name_any(), display_name = %project.spec.display_name, "updated");
        Ok(None)
    }
}

/// Per-cluster bookkeeping with nothing to do on update
struct ClusterQuota {
    cluster: String,
}

#[async_trait]
impl Lifecycle<Project> for ClusterQuota {
    type Error = Infallible;

    async fn create(&self, project: Project) -> Result<Option<Project>, Infallible> {
        info!(cluster = %self.cluster, project = %project.name_any(), "reserving quota");
        Ok(None)
    }

    async fn remove(&self, project: Project) -> Result<Option<Project>, Infallible> {
        info!(cluster = %self.cluster, project = %project.name_any(), "releasing quota");
        Ok(None)
    }

    async fn updated(&self, _project: Project) -> Result<Option<Project>, Infallible> {
        Ok(None)
    }
}

#[derive(clap::Parser)]
struct App {
    /// Cluster the project is created in
    #[arg(long, default_value = "c-demo")]
    cluster: String,
    /// Skip the audit handler
    #[arg(long)]
    no_audit: bool,
}

async fn wait_for<F: Fn(&Project) -> bool>(projects: &TypedClient<Project>, name: &str, check: F) -> anyhow::Result<()> {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(project) = projects.get(name).await {
                if check(&project) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let app: App = clap::Parser::parse();

    let kind = KindInfo::of::<Project>(Scope::Namespaced);
    let store = MemoryStore::new(kind.clone());
    let factory = SharedControllerFactory::new(
        KindRegistry::new().with::<Project>(Scope::Namespaced),
        SharedControllerConfig::default().workers(2),
    );
    let projects = factory.client::<Project>(store.clone(), &app.cluster)?;

    let token = CancellationToken::new();
    projects.add_lifecycle(token.child_token(), "project-init", ProjectInit);
    projects.add_cluster_scoped_lifecycle(token.child_token(), "cluster-quota", &app.cluster, ClusterQuota {
        cluster: app.cluster.clone(),
    });
    let audit = Arc::new(AtomicBool::new(!app.no_audit));
    projects.add_feature_handler(
        token.child_token(),
        move || audit.load(Ordering::Relaxed),
        "project-audit",
        |key: String, project: Option<Project>| async move {
            match project {
                Some(p) => info!(%key, resource_version = ?p.resource_version(), "audit: changed"),
                None => info!(%key, "audit: gone"),
            }
            Ok::<_, Infallible>(None)
        },
    );

    let shared = factory.for_kind::<Project>()?;
    let reflector = tokio::spawn({
        let shared = shared.clone();
        let store = store.clone();
        async move { shared.reflect(store.as_ref()).await }
    });
    factory.start();

    let name = "p-demo";
    let project = Project::new(name, ProjectSpec {
        display_name: "Demo".into(),
        cluster_name: app.cluster.clone(),
    });
    projects.create(&project).await?;

    let finalizers = [
        finalizer_name("project-init", false),
        finalizer_name(&format!("cluster-quota_{}", app.cluster), true),
    ];
    wait_for(&projects, name, |p| {
        finalizers.iter().all(|f| p.finalizers().contains(f)) && p.labels().contains_key(INITIALIZED_LABEL)
    })
    .await?;
    info!(finalizers = ?finalizers, "project is active");

    let mut project = projects.get(name).await?;
    project.spec.display_name = "Demo, renamed".into();
    projects.update(&project).await?;
    wait_for(&projects, name, |p| p.spec.display_name.ends_with("renamed")).await?;

    projects.delete(name).await?;
    tokio::time::timeout(Duration::from_secs(10), async {
        while projects.get(name).await.is_ok() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await?;
    info!("project finalized and deleted");

    token.cancel();
    factory.shutdown();
    reflector.await??;
    Ok(())
}
