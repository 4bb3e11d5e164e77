pub mod microservice;
pub use microservice::{Microservice, MicroserviceSpec, MicroserviceStatus};
