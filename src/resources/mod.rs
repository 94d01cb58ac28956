pub mod cache;
pub mod credentials;
pub mod probe;
pub mod scale;

pub use cache::{ClusterCaches, DEPLOYMENT_KIND, DeploymentLookup};
pub use credentials::{
    CredentialError, CredentialResolver, KUBECONFIG_KEY, ResolvedCredential, SecretStoreResolver,
};
pub use probe::{ProbeExecutor, ProbeFailure, ProbeOutcome, VersionProbe};
pub use scale::{DependantLookup, FIELD_MANAGER, KubeScaleActuator, ScaleActuator, ScaleError};
