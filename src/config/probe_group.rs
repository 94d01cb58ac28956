//! Probe group configuration
//!
//! A probe group lists the API endpoints to watch in one namespace, how to
//! reach each of them from inside and outside the cluster, and which scalable
//! resources depend on them.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::autoscaling::v1::CrossVersionObjectReference;
use kube::core::GroupVersionKind;
use serde::{Deserialize, Serialize};

use crate::controller::error::{Error, Result};

/// Default probe timeout, in seconds
pub const DEFAULT_TIMEOUT_SECONDS: i32 = 1;
/// Default probe period, in seconds
pub const DEFAULT_PERIOD_SECONDS: i32 = 10;
/// Default consecutive successes needed to mark a probe path Up
pub const DEFAULT_SUCCESS_THRESHOLD: i32 = 1;
/// Default consecutive failures needed to mark a probe path Down
pub const DEFAULT_FAILURE_THRESHOLD: i32 = 3;

/// ProbeGroup is the root of the watchdog configuration document.
///
/// It is loaded once at process start and never changes afterwards.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeGroup {
    /// Namespace holding the credentials and the dependant resources
    pub namespace: String,

    /// Probe targets, in configuration order
    #[serde(default)]
    pub probes: Vec<ProbeTarget>,
}

impl ProbeGroup {
    /// Parse a probe group from YAML (or JSON) text
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Read and parse a probe group file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&text)
    }

    /// Registry key for a target of this group
    pub fn key_for(&self, target: &ProbeTarget) -> String {
        target_key(&self.namespace, &target.name)
    }

    /// Look up a target by its registry key
    pub fn target_for_key(&self, key: &str) -> Option<&ProbeTarget> {
        let (namespace, name) = split_key(key)?;
        if namespace != self.namespace {
            return None;
        }
        self.probes.iter().find(|t| t.name == name)
    }

    /// All registry keys, in configuration order
    pub fn keys(&self) -> Vec<String> {
        self.probes.iter().map(|t| self.key_for(t)).collect()
    }

    /// Keys of the targets that use the named secret for either probe path
    pub fn keys_for_secret(&self, namespace: &str, secret_name: &str) -> Vec<String> {
        if namespace != self.namespace {
            return Vec::new();
        }
        self.probes
            .iter()
            .filter(|t| t.probe.secret_names().any(|s| s == secret_name))
            .map(|t| self.key_for(t))
            .collect()
    }

    /// Keys of the targets that list the given resource among their dependants
    pub fn keys_for_dependant(&self, namespace: &str, kind: &str, name: &str) -> Vec<String> {
        if namespace != self.namespace {
            return Vec::new();
        }
        self.probes
            .iter()
            .filter(|t| {
                t.dependant_scales
                    .iter()
                    .any(|d| d.scale_ref.kind == kind && d.scale_ref.name == name)
            })
            .map(|t| self.key_for(t))
            .collect()
    }
}

/// One API endpoint to probe and the resources that depend on it
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeTarget {
    /// Target name, unique within the group
    pub name: String,

    /// How and how often to probe
    pub probe: ProbeSpec,

    /// Resources scaled to zero while the endpoint is unreachable from outside
    #[serde(default)]
    pub dependant_scales: Vec<DependantScaleRef>,
}

/// Probe paths and liveness-style timing for one target
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeSpec {
    /// Externally routed path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ProbeDetails>,

    /// In-cluster path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal: Option<ProbeDetails>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_delay_seconds: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_seconds: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<i32>,
}

impl ProbeSpec {
    pub fn initial_delay(&self) -> Duration {
        seconds(self.initial_delay_seconds.unwrap_or(0))
    }

    pub fn timeout(&self) -> Duration {
        seconds(self.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS))
    }

    pub fn period(&self) -> Duration {
        seconds(self.period_seconds.unwrap_or(DEFAULT_PERIOD_SECONDS))
    }

    pub fn success_threshold(&self) -> u32 {
        threshold(self.success_threshold.unwrap_or(DEFAULT_SUCCESS_THRESHOLD))
    }

    pub fn failure_threshold(&self) -> u32 {
        threshold(self.failure_threshold.unwrap_or(DEFAULT_FAILURE_THRESHOLD))
    }

    /// Secret name configured for a probe path, if that path is enabled
    pub fn secret_for(&self, path: ProbePath) -> Option<&str> {
        let details = match path {
            ProbePath::Internal => self.internal.as_ref(),
            ProbePath::External => self.external.as_ref(),
        };
        details.map(|d| d.kubeconfig_secret_name.as_str())
    }

    /// Names of every secret this spec depends on
    pub fn secret_names(&self) -> impl Iterator<Item = &str> {
        [ProbePath::Internal, ProbePath::External]
            .into_iter()
            .filter_map(|p| self.secret_for(p))
    }
}

fn seconds(value: i32) -> Duration {
    Duration::from_secs(u64::try_from(value).unwrap_or(0))
}

fn threshold(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(1).max(1)
}

/// Credential reference for one probe path
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeDetails {
    /// Secret carrying a kubeconfig under the `kubeconfig` key
    pub kubeconfig_secret_name: String,
}

/// Scalable resource that depends on a probe target
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DependantScaleRef {
    pub scale_ref: CrossVersionObjectReference,

    /// Replica count used when scaling back up. When absent the count observed
    /// right before scaling down is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

impl DependantScaleRef {
    /// Resolve the reference against the group namespace
    pub fn resource_ref(&self, namespace: &str) -> Result<ResourceRef> {
        let api_version = self.scale_ref.api_version.as_deref().unwrap_or_default();
        let (group, version) = parse_api_version(api_version).ok_or_else(|| {
            Error::ValidationError(format!(
                "invalid apiVersion {:?} for {}/{}",
                api_version, self.scale_ref.kind, self.scale_ref.name
            ))
        })?;

        Ok(ResourceRef {
            group,
            version,
            kind: self.scale_ref.kind.clone(),
            namespace: namespace.to_string(),
            name: self.scale_ref.name.clone(),
        })
    }
}

/// Split `group/version` (or a core `version`) into its parts
fn parse_api_version(api_version: &str) -> Option<(String, String)> {
    match api_version.split_once('/') {
        Some((group, version)) if !group.is_empty() && !version.is_empty() => {
            if version.contains('/') {
                None
            } else {
                Some((group.to_string(), version.to_string()))
            }
        }
        Some(_) => None,
        None if !api_version.is_empty() => Some((String::new(), api_version.to_string())),
        None => None,
    }
}

/// Fully resolved reference to a namespaced scalable resource
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceRef {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceRef {
    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// One of the two independent routes to the probed endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProbePath {
    Internal,
    External,
}

impl ProbePath {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbePath::Internal => "internal",
            ProbePath::External => "external",
        }
    }
}

impl fmt::Display for ProbePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the registry key `<namespace>/<name>`
pub fn target_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// Split a registry key into namespace and name
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    key.split_once('/')
}
