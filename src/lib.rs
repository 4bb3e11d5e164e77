#![warn(rust_2018_idioms)]
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kube Api Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

// api
pub mod api;
// Generated type, for crdgen
pub use api::microservice::Microservice;

/// State machinery for kube, as exposeable to actix
pub mod operator;
pub use operator::microservice::Manager;
pub use operator::store::{ClusterStore, KubeStore};

/// Log and trace integrations
pub mod telemetry;
