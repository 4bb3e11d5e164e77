use crate::api::microservice::Microservice;
use crate::operator::store::{ClusterStore, KubeStore};
use crate::{telemetry, Error, Result};
use chrono::prelude::*;
use futures::{future::BoxFuture, FutureExt, StreamExt};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::{
    api::{Api, ListParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        events::Reporter,
        watcher,
    },
    Resource,
};
use prometheus::{histogram_opts, proto::MetricFamily, HistogramVec, IntCounter, Registry};
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};
use tokio::{sync::RwLock, time::Duration};
use tracing::{field, info, instrument, warn, Span};

/// Finalizer guarding the parent until its child Deployment is cleaned up
pub static MICROSERVICE_FINALIZER: &str = "microservice.finalizers.devops.example.com";

/// Fixed port the workload container listens on
const CONTAINER_PORT: i32 = 18080;

// Context for our reconciler
pub struct Data<S> {
    /// Cluster state access
    pub store: S,
    /// In memory state
    pub state: Arc<RwLock<State>>,
    /// Various prometheus metrics
    pub metrics: Metrics,
}

#[instrument(skip(msvc, ctx), fields(trace_id))]
async fn reconcile(msvc: Arc<Microservice>, ctx: Arc<Data<KubeStore>>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx
        .metrics
        .reconcile_duration
        .with_label_values(&[])
        .start_timer();
    ctx.metrics.handled_events.inc();
    ctx.state.write().await.last_event = Utc::now();

    // The trigger carries identity only; everything else is re-read from the
    // cluster inside the pass.
    let name = msvc.name_any();
    let namespace = msvc
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let action = reconcile_at(&namespace, &name, ctx.as_ref()).await?;
    info!("Reconciled Microservice \"{}\" in {}", name, namespace);
    Ok(action)
}

/// One level-triggered convergence pass for the parent identified by
/// (namespace, name).
///
/// Branches on presence and deletion intent: an active parent gets the
/// finalizer and a child Deployment matching its spec; a terminating parent
/// gets its child deleted before the finalizer is dropped. Every branch is
/// safe to repeat.
pub async fn reconcile_at<S: ClusterStore>(
    namespace: &str,
    name: &str,
    ctx: &Data<S>,
) -> Result<Action> {
    let msvc = match ctx.store.get_microservice(namespace, name).await? {
        Some(msvc) => msvc,
        None => {
            // Expected end of the deletion lifecycle, not an error.
            info!("Microservice \"{}\" in {} is gone", name, namespace);
            return Ok(Action::await_change());
        }
    };

    if msvc.meta().deletion_timestamp.is_none() {
        // Active branch: the deletion guard must be in place before any
        // child exists. If persisting it fails, abort the pass.
        if !has_finalizer(&msvc) {
            let mut updated = msvc.clone();
            updated
                .metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(MICROSERVICE_FINALIZER.to_string());
            ctx.store.update_microservice(&updated).await?;
        }
        apply_deployment(&ctx.store, namespace, name, &msvc.spec.image).await?;
        Ok(Action::requeue(Duration::from_secs(3600 / 2)))
    } else if has_finalizer(&msvc) {
        // Terminating branch: the child must be confirmed gone before the
        // finalizer is removed, or it could outlive the parent.
        clean_deployment(&ctx.store, namespace, name).await?;
        let mut updated = msvc.clone();
        if let Some(finalizers) = updated.metadata.finalizers.as_mut() {
            finalizers.retain(|token| token != MICROSERVICE_FINALIZER);
        }
        ctx.store.update_microservice(&updated).await?;
        info!("Released Microservice \"{}\" in {} for deletion", name, namespace);
        Ok(Action::await_change())
    } else {
        // Finalizer already removed; waiting for the apiserver to purge.
        Ok(Action::await_change())
    }
}

fn has_finalizer(msvc: &Microservice) -> bool {
    msvc.finalizers()
        .iter()
        .any(|token| token == MICROSERVICE_FINALIZER)
}

/// Create-or-overwrite the child Deployment so it matches the parent spec.
async fn apply_deployment<S: ClusterStore>(
    store: &S,
    namespace: &str,
    name: &str,
    image: &str,
) -> Result<()> {
    let mut desired = desired_deployment(namespace, name, image);
    match store.get_deployment(namespace, name).await? {
        None => {
            store.create_deployment(&desired).await?;
            info!("Created Deployment \"{}\" in {}", name, namespace);
        }
        Some(current) => {
            // A PUT needs the live resourceVersion. Nothing else of the
            // current object survives; the parent is the source of truth.
            desired.metadata.resource_version = current.metadata.resource_version;
            store.replace_deployment(&desired).await?;
        }
    }
    Ok(())
}

async fn clean_deployment<S: ClusterStore>(store: &S, namespace: &str, name: &str) -> Result<()> {
    if store.get_deployment(namespace, name).await?.is_some() {
        store.delete_deployment(namespace, name).await?;
        info!("Deleted Deployment \"{}\" in {}", name, namespace);
    }
    Ok(())
}

/// Desired child Deployment for a parent. Pure function of its inputs, which
/// is what makes repeated application converge.
pub fn desired_deployment(namespace: &str, name: &str, image: &str) -> Deployment {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), name.to_string());
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: name.to_string(),
                        image: Some(image.to_string()),
                        image_pull_policy: Some("Always".to_string()),
                        ports: Some(vec![ContainerPort {
                            container_port: CONTAINER_PORT,
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn error_policy(_msvc: Arc<Microservice>, error: &Error, ctx: Arc<Data<KubeStore>>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.failed_events.inc();
    Action::requeue(Duration::from_secs(360))
}

/// Metrics exposed on /metrics
#[derive(Clone)]
pub struct Metrics {
    pub handled_events: IntCounter,
    pub failed_events: IntCounter,
    pub reconcile_duration: HistogramVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "microservice_controller_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds",
                vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]
            ),
            &[],
        )
        .unwrap();
        Metrics {
            handled_events: IntCounter::new("microservice_controller_handled_events", "handled events")
                .unwrap(),
            failed_events: IntCounter::new("microservice_controller_failed_events", "failed reconciles")
                .unwrap(),
            reconcile_duration,
        }
    }
}

impl Metrics {
    /// Register the metrics into a registry to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.handled_events.clone()))?;
        registry.register(Box::new(self.failed_events.clone()))?;
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        Ok(self)
    }
}

/// In-memory reconciler state exposed on /
#[derive(Clone, Serialize)]
pub struct State {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for State {
    fn default() -> Self {
        State {
            last_event: Utc::now(),
            reporter: "microservice-operator".into(),
        }
    }
}

/// Data owned by the Manager
#[derive(Clone)]
pub struct Manager {
    /// In memory state
    state: Arc<RwLock<State>>,
    /// Registry backing the /metrics endpoint
    registry: Registry,
}

/// Manager that owns a Controller for Microservice
impl Manager {
    /// Lifecycle initialization interface for app
    ///
    /// This returns a `Manager` that drives a `Controller` + a future to be awaited
    /// It is up to `main` to wait for the controller stream.
    pub async fn new() -> (Self, BoxFuture<'static, ()>) {
        let client = Client::try_default().await.expect("create client");
        let registry = Registry::default();
        let metrics = Metrics::default()
            .register(&registry)
            .expect("register metrics");
        let state = Arc::new(RwLock::new(State::default()));
        let context = Arc::new(Data {
            store: KubeStore::new(client.clone()),
            state: state.clone(),
            metrics,
        });

        let msvcs = Api::<Microservice>::all(client);
        // Ensure CRD is installed before loop-watching
        let _r = msvcs
            .list(&ListParams::default().limit(1))
            .await
            .expect("is the crd installed? please run: cargo run --bin crdgen | kubectl apply -f -");

        // All good. Start controller and return its future.
        let drainer = Controller::new(msvcs, watcher::Config::default())
            .run(reconcile, error_policy, context)
            .filter_map(|x| async move { std::result::Result::ok(x) })
            .for_each(|_| futures::future::ready(()))
            .boxed();

        (Self { state, registry }, drainer)
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn state(&self) -> State {
        self.state.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::microservice::MicroserviceSpec;
    use crate::operator::store::mem::MemStore;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn parent(namespace: &str, name: &str, image: &str) -> Microservice {
        let mut msvc = Microservice::new(
            name,
            MicroserviceSpec {
                image: image.to_string(),
            },
        );
        msvc.metadata.namespace = Some(namespace.to_string());
        msvc
    }

    fn finalized(mut msvc: Microservice) -> Microservice {
        msvc.metadata.finalizers = Some(vec![MICROSERVICE_FINALIZER.to_string()]);
        msvc
    }

    fn terminating(mut msvc: Microservice) -> Microservice {
        msvc.metadata.deletion_timestamp = Some(Time(Utc::now()));
        msvc
    }

    fn ctx(store: MemStore) -> Data<MemStore> {
        Data {
            store,
            state: Arc::new(RwLock::new(State::default())),
            metrics: Metrics::default(),
        }
    }

    fn container(deployment: &Deployment) -> &Container {
        deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.template.spec.as_ref())
            .and_then(|pod| pod.containers.first())
            .expect("deployment has one container")
    }

    #[tokio::test]
    async fn first_pass_adds_finalizer_and_creates_deployment() {
        let store = MemStore::new();
        store
            .put_microservice(parent("default", "svc-a", "repo/a:1.0"))
            .await;
        let ctx = ctx(store);

        reconcile_at("default", "svc-a", &ctx).await.unwrap();

        let msvc = ctx.store.microservice("default", "svc-a").await.unwrap();
        assert_eq!(
            msvc.metadata.finalizers,
            Some(vec![MICROSERVICE_FINALIZER.to_string()])
        );

        let deployment = ctx.store.deployment("default", "svc-a").await.unwrap();
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "svc-a".to_string());
        assert_eq!(
            deployment.spec.as_ref().unwrap().selector.match_labels,
            Some(labels)
        );
        let container = container(&deployment);
        assert_eq!(container.name, "svc-a");
        assert_eq!(container.image.as_deref(), Some("repo/a:1.0"));
        assert_eq!(container.image_pull_policy.as_deref(), Some("Always"));
        assert_eq!(
            container.ports.as_ref().unwrap()[0].container_port,
            CONTAINER_PORT
        );
    }

    #[tokio::test]
    async fn active_pass_skips_finalizer_update_when_already_present() {
        let store = MemStore::new();
        store
            .put_microservice(finalized(parent("default", "svc-a", "repo/a:1.0")))
            .await;
        let ctx = ctx(store);

        reconcile_at("default", "svc-a", &ctx).await.unwrap();

        assert_eq!(ctx.store.parent_updates().await, 0);
        let msvc = ctx.store.microservice("default", "svc-a").await.unwrap();
        assert_eq!(msvc.metadata.finalizers.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn image_change_overwrites_existing_deployment() {
        let store = MemStore::new();
        store
            .put_microservice(parent("default", "svc-a", "repo/a:1.0"))
            .await;
        let ctx = ctx(store);
        reconcile_at("default", "svc-a", &ctx).await.unwrap();

        let mut msvc = ctx.store.microservice("default", "svc-a").await.unwrap();
        msvc.spec.image = "repo/a:2.0".to_string();
        ctx.store.put_microservice(msvc).await;
        reconcile_at("default", "svc-a", &ctx).await.unwrap();

        let deployment = ctx.store.deployment("default", "svc-a").await.unwrap();
        assert_eq!(container(&deployment).image.as_deref(), Some("repo/a:2.0"));
        // overwritten in place, not re-created
        assert_eq!(ctx.store.deployment_creates().await, 1);
        assert_eq!(ctx.store.deployment_count().await, 1);
    }

    #[tokio::test]
    async fn reconcile_twice_is_idempotent() {
        let store = MemStore::new();
        store
            .put_microservice(parent("default", "svc-a", "repo/a:1.0"))
            .await;
        let ctx = ctx(store);

        reconcile_at("default", "svc-a", &ctx).await.unwrap();
        let first_parent = ctx.store.microservice("default", "svc-a").await.unwrap();
        let first_child = ctx.store.deployment("default", "svc-a").await.unwrap();

        reconcile_at("default", "svc-a", &ctx).await.unwrap();
        let second_parent = ctx.store.microservice("default", "svc-a").await.unwrap();
        let second_child = ctx.store.deployment("default", "svc-a").await.unwrap();

        assert_eq!(first_parent.metadata.finalizers, second_parent.metadata.finalizers);
        assert_eq!(first_child, second_child);
        assert_eq!(ctx.store.deployment_creates().await, 1);
        assert_eq!(ctx.store.parent_updates().await, 1);
    }

    #[tokio::test]
    async fn missing_parent_short_circuits_with_no_side_effects() {
        let ctx = ctx(MemStore::new());

        let result = reconcile_at("default", "ghost", &ctx).await;

        assert!(result.is_ok());
        assert_eq!(ctx.store.deployment_count().await, 0);
        assert_eq!(ctx.store.parent_updates().await, 0);
    }

    #[tokio::test]
    async fn failed_finalizer_update_aborts_before_deployment_work() {
        let store = MemStore::new();
        store
            .put_microservice(parent("default", "svc-a", "repo/a:1.0"))
            .await;
        store.fail_parent_updates().await;
        let ctx = ctx(store);

        let result = reconcile_at("default", "svc-a", &ctx).await;

        assert!(result.is_err());
        assert_eq!(ctx.store.deployment_count().await, 0);
        let msvc = ctx.store.microservice("default", "svc-a").await.unwrap();
        assert_eq!(msvc.metadata.finalizers, None);
    }

    #[tokio::test]
    async fn terminating_deletes_deployment_then_drops_finalizer() {
        let store = MemStore::new();
        store
            .put_microservice(terminating(finalized(parent("default", "svc-a", "repo/a:1.0"))))
            .await;
        store
            .put_deployment(desired_deployment("default", "svc-a", "repo/a:1.0"))
            .await;
        let ctx = ctx(store);

        reconcile_at("default", "svc-a", &ctx).await.unwrap();

        assert!(ctx.store.deployment("default", "svc-a").await.is_none());
        let msvc = ctx.store.microservice("default", "svc-a").await.unwrap();
        assert_eq!(msvc.metadata.finalizers, Some(vec![]));
    }

    #[tokio::test]
    async fn terminating_with_deployment_already_gone_still_drops_finalizer() {
        let store = MemStore::new();
        store
            .put_microservice(terminating(finalized(parent("default", "svc-a", "repo/a:1.0"))))
            .await;
        let ctx = ctx(store);

        reconcile_at("default", "svc-a", &ctx).await.unwrap();

        let msvc = ctx.store.microservice("default", "svc-a").await.unwrap();
        assert_eq!(msvc.metadata.finalizers, Some(vec![]));
    }

    #[tokio::test]
    async fn terminating_without_finalizer_is_a_noop() {
        let store = MemStore::new();
        store
            .put_microservice(terminating(parent("default", "svc-a", "repo/a:1.0")))
            .await;
        store
            .put_deployment(desired_deployment("default", "svc-a", "repo/a:1.0"))
            .await;
        let ctx = ctx(store);

        reconcile_at("default", "svc-a", &ctx).await.unwrap();

        assert_eq!(ctx.store.parent_updates().await, 0);
        assert_eq!(ctx.store.deployment_count().await, 1);
    }

    #[tokio::test]
    async fn finalizer_survives_failed_deployment_delete() {
        let store = MemStore::new();
        store
            .put_microservice(terminating(finalized(parent("default", "svc-a", "repo/a:1.0"))))
            .await;
        store
            .put_deployment(desired_deployment("default", "svc-a", "repo/a:1.0"))
            .await;
        store.fail_deployment_deletes().await;
        let ctx = ctx(store);

        let result = reconcile_at("default", "svc-a", &ctx).await;

        assert!(result.is_err());
        let msvc = ctx.store.microservice("default", "svc-a").await.unwrap();
        assert_eq!(
            msvc.metadata.finalizers,
            Some(vec![MICROSERVICE_FINALIZER.to_string()])
        );
    }

    #[test]
    fn desired_deployment_is_pure_and_complete() {
        let first = desired_deployment("default", "svc-a", "repo/a:1.0");
        let second = desired_deployment("default", "svc-a", "repo/a:1.0");
        assert_eq!(first, second);

        assert_eq!(first.metadata.name.as_deref(), Some("svc-a"));
        assert_eq!(first.metadata.namespace.as_deref(), Some("default"));
        let container = container(&first);
        assert_eq!(container.image.as_deref(), Some("repo/a:1.0"));
        assert_eq!(container.image_pull_policy.as_deref(), Some("Always"));
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 18080);
    }
}
