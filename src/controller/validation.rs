//! Validation of the probe group configuration
//!
//! Any error here is fatal at startup: the watchdog never runs with a partial
//! or invalid configuration.

use std::collections::HashSet;

use crate::config::{ProbeDetails, ProbeGroup, ProbeSpec, ProbeTarget};
use crate::controller::error::{Error, Result};

/// Minimum probe timeout and period, in seconds
pub const MIN_PROBE_SECONDS: i32 = 1;

/// Minimum explicit restore replica count
pub const MIN_RESTORE_REPLICAS: i32 = 1;

/// Validate a whole probe group
pub fn validate_group(group: &ProbeGroup) -> Result<()> {
    if group.namespace.trim().is_empty() {
        return Err(Error::ValidationError(
            "probe group namespace must not be empty".to_string(),
        ));
    }
    if group.probes.is_empty() {
        return Err(Error::ValidationError(
            "probe group must contain at least one probe".to_string(),
        ));
    }

    let mut names = HashSet::new();
    for target in &group.probes {
        validate_target(group, target)?;
        if !names.insert(target.name.as_str()) {
            return Err(Error::ValidationError(format!(
                "duplicate probe name {:?}",
                target.name
            )));
        }
    }
    Ok(())
}

/// Validate one probe target
pub fn validate_target(group: &ProbeGroup, target: &ProbeTarget) -> Result<()> {
    if target.name.trim().is_empty() {
        return Err(Error::ValidationError(
            "probe name must not be empty".to_string(),
        ));
    }
    if target.name.contains('/') {
        return Err(Error::ValidationError(format!(
            "probe name {:?} must not contain '/'",
            target.name
        )));
    }

    validate_probe_spec(&target.name, &target.probe)?;

    if target.dependant_scales.is_empty() {
        return Err(Error::ValidationError(format!(
            "probe {:?} has no dependant scales",
            target.name
        )));
    }
    for dependant in &target.dependant_scales {
        let resource = dependant.resource_ref(&group.namespace)?;
        if resource.kind.is_empty() || resource.name.is_empty() {
            return Err(Error::ValidationError(format!(
                "probe {:?} has a scale reference without kind or name",
                target.name
            )));
        }
        if let Some(replicas) = dependant.replicas
            && replicas < MIN_RESTORE_REPLICAS
        {
            return Err(Error::ValidationError(format!(
                "restore replicas {} for {} is below minimum {}",
                replicas, resource, MIN_RESTORE_REPLICAS
            )));
        }
    }
    Ok(())
}

/// Validate probe paths, timing and thresholds
fn validate_probe_spec(name: &str, spec: &ProbeSpec) -> Result<()> {
    if spec.internal.is_none() && spec.external.is_none() {
        return Err(Error::ValidationError(format!(
            "probe {:?} must configure an internal or an external probe",
            name
        )));
    }
    for details in [&spec.internal, &spec.external].into_iter().flatten() {
        validate_details(name, details)?;
    }

    if let Some(delay) = spec.initial_delay_seconds
        && delay < 0
    {
        return Err(Error::ValidationError(format!(
            "probe {:?}: initialDelaySeconds must not be negative",
            name
        )));
    }
    for (field, value) in [
        ("timeoutSeconds", spec.timeout_seconds),
        ("periodSeconds", spec.period_seconds),
    ] {
        if let Some(value) = value
            && value < MIN_PROBE_SECONDS
        {
            return Err(Error::ValidationError(format!(
                "probe {:?}: {} must be at least {}",
                name, field, MIN_PROBE_SECONDS
            )));
        }
    }
    for (field, value) in [
        ("successThreshold", spec.success_threshold),
        ("failureThreshold", spec.failure_threshold),
    ] {
        if let Some(value) = value
            && value < 1
        {
            return Err(Error::ValidationError(format!(
                "probe {:?}: {} must be at least 1",
                name, field
            )));
        }
    }

    if spec.timeout() > spec.period() {
        return Err(Error::ValidationError(format!(
            "probe {:?}: timeout {:?} exceeds period {:?}",
            name,
            spec.timeout(),
            spec.period()
        )));
    }
    Ok(())
}

fn validate_details(name: &str, details: &ProbeDetails) -> Result<()> {
    if details.kubeconfig_secret_name.trim().is_empty() {
        return Err(Error::ValidationError(format!(
            "probe {:?}: kubeconfigSecretName must not be empty",
            name
        )));
    }
    Ok(())
}
