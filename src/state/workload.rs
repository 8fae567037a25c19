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

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Serialize, Serializer};
use thiserror::Error;
use tracing::trace;

/// A single workload instance (pod) as observed from the cluster.
#[derive(Default, Debug, Eq, PartialEq, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Pod {
    pub name: String,
    pub namespace: String,

    #[serde(default, skip_serializing_if = "is_default")]
    pub labels: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "is_default")]
    pub host_ip: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "is_default")]
    pub pod_ip: Option<IpAddr>,

    #[serde(default, skip_serializing_if = "is_default")]
    pub service_account: String,
}

fn is_default<T: Default + PartialEq>(t: &T) -> bool {
    *t == Default::default()
}

impl Pod {
    pub fn key(&self) -> PodKey {
        PodKey::new(&self.namespace, &self.name)
    }
}

impl fmt::Display for Pod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Pod{{{}/{} at {}}}",
            self.namespace,
            self.name,
            self.pod_ip
                .map(|x| x.to_string())
                .unwrap_or_else(|| "None".into()),
        )
    }
}

/// The unique identity of a pod within the cluster.
#[derive(Debug, Eq, PartialEq, Hash, Clone, PartialOrd, Ord)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

impl PodKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        PodKey {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl FromStr for PodKey {
    type Err = WorkloadError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.split_once('/') {
            Some((namespace, name))
                if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(PodKey::new(namespace, name))
            }
            _ => Err(WorkloadError::PodKeyParse(value.to_string())),
        }
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// PodKey keys the dumped maps, so it serializes as namespace/name
impl Serialize for PodKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&self)
    }
}

/// A PodStore encapsulates all information about pods in the cluster
#[derive(serde::Serialize, Default, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PodStore {
    /// by_key maps namespace/name to pods
    by_key: HashMap<PodKey, Arc<Pod>>,
    /// by_ip maps pod IPs to pods. The most recently applied pod owns a shared address.
    by_ip: HashMap<IpAddr, Arc<Pod>>,
}

impl PodStore {
    pub fn insert(&mut self, pod: Pod) {
        // First, remove the entry entirely to make sure things are cleaned up properly.
        let key = pod.key();
        self.remove(&key);

        let pod = Arc::new(pod);
        if let Some(ip) = pod.pod_ip {
            if let Some(prev) = self.by_ip.insert(ip, pod.clone()) {
                trace!(%ip, previous=%prev, current=%pod, "pod address taken over");
            }
        }
        self.by_key.insert(key, pod);
    }

    pub fn remove(&mut self, key: &PodKey) -> Option<Arc<Pod>> {
        let prev = self.by_key.remove(key)?;
        if let Some(ip) = prev.pod_ip {
            // Only drop the address if a newer pod has not claimed it.
            if self.by_ip.get(&ip).is_some_and(|owner| owner.key() == *key) {
                self.by_ip.remove(&ip);
            }
        }
        Some(prev)
    }

    /// Replaces the entire contents of the store with the given listing.
    pub fn reset(&mut self, pods: Vec<Pod>) {
        self.by_key.clear();
        self.by_ip.clear();
        for pod in pods {
            self.insert(pod);
        }
    }

    /// Finds the pod by namespace/name.
    pub fn find_key(&self, key: &PodKey) -> Option<Arc<Pod>> {
        self.by_key.get(key).cloned()
    }

    /// Finds the pod by pod IP.
    pub fn find_ip(&self, ip: &IpAddr) -> Option<Arc<Pod>> {
        self.by_ip.get(ip).cloned()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WorkloadError {
    #[error("failed to parse pod key (expected namespace/name): {0}")]
    PodKeyParse(String),
}
