use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    api::{Api, DeleteParams, PostParams, ResourceExt},
    client::Client,
    Resource,
};

use crate::api::microservice::Microservice;
use crate::{Error, Result};

/// The slice of cluster state the reconciler touches, injected as a
/// capability so tests can substitute an in-memory fake.
///
/// Gets map not-found to `Ok(None)`; delete maps not-found to `Ok(())`.
/// Everything else surfaces as a retryable [`Error`].
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get_microservice(&self, namespace: &str, name: &str) -> Result<Option<Microservice>>;

    /// Persist a metadata update on the parent. Spec is never written here.
    async fn update_microservice(&self, msvc: &Microservice) -> Result<Microservice>;

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment>;

    /// Full-replace (PUT) of an existing Deployment. The caller is expected
    /// to have set `metadata.resource_version` from the live object.
    async fn replace_deployment(&self, deployment: &Deployment) -> Result<Deployment>;

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Production store backed by the kube client.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn microservices(&self, namespace: &str) -> Api<Microservice> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get_microservice(&self, namespace: &str, name: &str) -> Result<Option<Microservice>> {
        self.microservices(namespace)
            .get_opt(name)
            .await
            .map_err(Error::KubeError)
    }

    async fn update_microservice(&self, msvc: &Microservice) -> Result<Microservice> {
        let namespace = msvc
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let name = msvc
            .meta()
            .name
            .clone()
            .ok_or(Error::MissingObjectKey(".metadata.name"))?;
        self.microservices(&namespace)
            .replace(&name, &PostParams::default(), msvc)
            .await
            .map_err(Error::KubeError)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        self.deployments(namespace)
            .get_opt(name)
            .await
            .map_err(Error::KubeError)
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        let namespace = deployment
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        self.deployments(&namespace)
            .create(&PostParams::default(), deployment)
            .await
            .map_err(Error::KubeError)
    }

    async fn replace_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        let namespace = deployment
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let name = deployment
            .meta()
            .name
            .clone()
            .ok_or(Error::MissingObjectKey(".metadata.name"))?;
        self.deployments(&namespace)
            .replace(&name, &PostParams::default(), deployment)
            .await
            .map_err(Error::KubeError)
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .deployments(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::KubeError(e)),
        }
    }
}
