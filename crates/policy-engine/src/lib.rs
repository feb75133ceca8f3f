//! Per-rule policy evaluation for Kubernetes admission requests: variable
//! contexts with JMESPath queries, declarative pattern validation, strategic
//! merge and RFC 6902 mutation, foreach iteration and signature-based image
//! verification.

pub mod admission;
pub mod cel;
pub mod clients;
pub mod context;
pub mod engine;
pub mod errors;
pub mod foreach;
pub mod images;
pub mod mutate;
pub mod policy;
pub mod pss;
pub mod response;
pub mod validate;
pub mod verify_images;

mod wildcard;

#[cfg(test)]
pub(crate) mod test_utils;

pub use admission::{AdmissionRequest, Operation};
pub use engine::{EngineConfig, PolicyEngine};
pub use errors::EngineError;
pub use policy::{PolicySpec, Rule, ValidationFailureAction};
pub use response::{PolicyResponse, RuleResponse, RuleStatus, RuleType};
