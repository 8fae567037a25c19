// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use itertools::Itertools;

use crate::resolver::canonical;

const KUBEENV_CONFIG: &str = "KUBEENV_CONFIG";
const CLUSTER_DOMAIN: &str = "CLUSTER_DOMAIN";
const SERVICE_LABEL: &str = "SERVICE_LABEL";
const CACHE_SYNC_TIMEOUT: &str = "CACHE_SYNC_TIMEOUT";
const CACHE_REFRESH_DURATION: &str = "CACHE_REFRESH_DURATION";
const LOOKUP_INGRESS_SOURCE_AND_ORIGIN: &str = "LOOKUP_INGRESS_SOURCE_AND_ORIGIN";
const LOCAL_PODS_PATH: &str = "LOCAL_PODS_PATH";
pub const KUBECONFIG: &str = "KUBECONFIG";

pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";
pub const DEFAULT_SERVICE_LABEL: &str = "app";
const DEFAULT_CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_CACHE_REFRESH_DURATION: Duration = Duration::from_secs(5 * 60);

/// Configuration of the workload resolver.
///
/// An instance must pass [Config::validate] before a resolver is built from it.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct Config {
    /// DNS suffix of the cluster, used to build canonical service names.
    pub cluster_domain_suffix: String,
    /// Pod label whose value names the service a workload belongs to.
    pub service_label_key: String,
    /// How long construction waits for the first full pod listing.
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub cache_sync_timeout: Duration,
    /// Period after which the pod cache re-lists from the cluster.
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub cache_refresh_duration: Duration,
    /// If true, source and origin are resolved even when the destination is a gateway.
    pub lookup_ingress_source_and_origin_values: bool,
    /// Cluster credentials passed to the client factory. KUBECONFIG takes precedence.
    pub kubeconfig_path: Option<PathBuf>,
    /// YAML pod listing served by the file-backed client.
    pub local_pods_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cluster_domain_suffix: DEFAULT_CLUSTER_DOMAIN.to_string(),
            service_label_key: DEFAULT_SERVICE_LABEL.to_string(),
            cache_sync_timeout: DEFAULT_CACHE_SYNC_TIMEOUT,
            cache_refresh_duration: DEFAULT_CACHE_REFRESH_DURATION,
            lookup_ingress_source_and_origin_values: false,
            kubeconfig_path: None,
            local_pods_path: None,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid env var {0}={1}")]
    EnvVar(String, String),
    #[error("failed to read config file {0}: {1}")]
    ReadFile(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config file {0}: {1}")]
    ParseFile(PathBuf, #[source] serde_yaml::Error),
    #[error(transparent)]
    Validation(#[from] ValidationErrors),
}

/// A single constraint violated by a [Config].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub field: &'static str,
    pub reason: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

/// Every violation found while validating a [Config]. Never empty.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid configuration: {}", .0.iter().join("; "))]
pub struct ValidationErrors(Vec<Violation>);

impl ValidationErrors {
    pub fn violations(&self) -> &[Violation] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Default)]
struct Violations(Vec<Violation>);

impl Violations {
    fn push(&mut self, field: &'static str, reason: impl Into<String>) {
        self.0.push(Violation {
            field,
            reason: reason.into(),
        });
    }

    fn finish(self) -> Result<(), ValidationErrors> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors(self.0))
        }
    }
}

impl Config {
    /// Checks every constraint and reports all violations together.
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut v = Violations::default();

        if self.service_label_key.is_empty() {
            v.push("serviceLabelKey", "field must be populated");
        }
        if self.cluster_domain_suffix.is_empty() {
            v.push("clusterDomainSuffix", "field must be populated");
        } else if let Err(reason) = canonical::validate_domain(&self.cluster_domain_suffix) {
            v.push("clusterDomainSuffix", reason);
        }
        if self.cache_sync_timeout.is_zero() {
            v.push("cacheSyncTimeout", "must be positive");
        }
        if self.cache_refresh_duration.is_zero() {
            v.push("cacheRefreshDuration", "must be positive");
        }

        v.finish()
    }

    /// Returns the credentials path handed to the client factory. A non-empty KUBECONFIG
    /// environment variable overrides the configured path.
    pub fn kubeconfig(&self) -> Option<PathBuf> {
        resolve_kubeconfig(std::env::var(KUBECONFIG).ok(), self.kubeconfig_path.as_deref())
    }
}

fn resolve_kubeconfig(env: Option<String>, configured: Option<&Path>) -> Option<PathBuf> {
    empty_to_none(env)
        .map(PathBuf::from)
        .or_else(|| configured.map(Path::to_path_buf))
}

/// GoDuration wraps a Duration to implement golang Duration parsing semantics
struct GoDuration(Duration);

impl FromStr for GoDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        duration_str::parse(s)
            .map(GoDuration)
            .map_err(|e| e.to_string())
    }
}

fn parse<T: FromStr>(env: &str) -> Result<Option<T>, Error> {
    match std::env::var(env) {
        Ok(val) => val
            .parse()
            .map(|v| Some(v))
            .map_err(|_| Error::EnvVar(env.to_string(), val)),
        Err(_) => Ok(None),
    }
}

/// Loads the configuration from KUBEENV_CONFIG (if set) and the environment, then validates it.
pub fn parse_config() -> Result<Config, Error> {
    let base = match parse::<PathBuf>(KUBEENV_CONFIG)? {
        Some(path) => read_config_file(&path)?,
        None => Config::default(),
    };
    let cfg = apply_env(base)?;
    cfg.validate()?;
    Ok(cfg)
}

pub fn read_config_file(path: &Path) -> Result<Config, Error> {
    let contents =
        std::fs::read_to_string(path).map_err(|e| Error::ReadFile(path.to_path_buf(), e))?;
    serde_yaml::from_str(&contents).map_err(|e| Error::ParseFile(path.to_path_buf(), e))
}

fn apply_env(mut cfg: Config) -> Result<Config, Error> {
    if let Some(domain) = parse::<String>(CLUSTER_DOMAIN)? {
        cfg.cluster_domain_suffix = domain;
    }
    if let Some(label) = parse::<String>(SERVICE_LABEL)? {
        cfg.service_label_key = label;
    }
    if let Some(GoDuration(d)) = parse(CACHE_SYNC_TIMEOUT)? {
        cfg.cache_sync_timeout = d;
    }
    if let Some(GoDuration(d)) = parse(CACHE_REFRESH_DURATION)? {
        cfg.cache_refresh_duration = d;
    }
    if let Some(lookup) = parse(LOOKUP_INGRESS_SOURCE_AND_ORIGIN)? {
        cfg.lookup_ingress_source_and_origin_values = lookup;
    }
    if let Some(path) = parse::<PathBuf>(LOCAL_PODS_PATH)? {
        cfg.local_pods_path = Some(path);
    }
    Ok(cfg)
}

pub fn empty_to_none<A: AsRef<str>>(inp: Option<A>) -> Option<A> {
    if let Some(inner) = &inp {
        if inner.as_ref().is_empty() {
            return None;
        }
    }
    inp
}
