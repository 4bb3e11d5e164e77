use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Our Microservice custom resource spec
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    kind = "Microservice",
    group = "devops.example.com",
    version = "v1",
    namespaced,
    shortname = "msvc"
)]
#[kube(status = "MicroserviceStatus")]
pub struct MicroserviceSpec {
    /// Container image reference for the workload. Required, no default.
    pub image: String,
}

/// Declared on the CRD but carries nothing yet.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct MicroserviceStatus {}
