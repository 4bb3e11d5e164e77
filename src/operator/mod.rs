pub mod microservice;
pub mod store;

pub use microservice::{desired_deployment, reconcile_at, Manager, MICROSERVICE_FINALIZER};
