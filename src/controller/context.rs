use std::sync::Arc;

use crate::health::Metrics;
use crate::resources::credentials::CredentialResolver;
use crate::resources::probe::ProbeExecutor;
use crate::resources::scale::{DependantLookup, ScaleActuator};

/// Collaborators shared by the controller and every prober
#[derive(Clone)]
pub struct Context {
    pub resolver: Arc<dyn CredentialResolver>,
    pub executor: Arc<dyn ProbeExecutor>,
    pub actuator: Arc<dyn ScaleActuator>,
    pub dependants: Arc<dyn DependantLookup>,
    pub metrics: Arc<Metrics>,
}

impl Context {
    pub fn new(
        resolver: Arc<dyn CredentialResolver>,
        executor: Arc<dyn ProbeExecutor>,
        actuator: Arc<dyn ScaleActuator>,
        dependants: Arc<dyn DependantLookup>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            resolver,
            executor,
            actuator,
            dependants,
            metrics,
        }
    }
}
