//! Common types for the runner operator: CRDs, errors, the registration
//! service contract, and Kubernetes utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod registration;
pub mod telemetry;

pub use error::Error;
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};
pub use registration::{
    RegisteredRunner, RegistrationClient, RegistrationError, RegistrationToken, RunnerTarget,
};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for every patch issued by the operator
pub const FIELD_MANAGER: &str = "arc-runner-controller";

/// Label key for resources managed by the operator
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Label value for resources managed by the operator
pub const LABEL_MANAGED_BY_ARC: &str = "actions-runner-controller";
