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

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tracing::{debug, info, instrument};

use crate::config::Config;
use crate::state::workload::{Pod, PodKey};

/// A change to the set of pods in the cluster, as delivered by a [ClusterClient] feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodEvent {
    /// A full listing of every pod; replaces anything seen before.
    Restarted(Vec<Pod>),
    /// A pod was created or updated.
    Applied(Pod),
    /// A pod was removed.
    Deleted(PodKey),
}

/// An ordered, unbounded stream of pod events. Errors are reported in-band; the consumer
/// decides whether to re-subscribe.
pub type PodEvents = BoxStream<'static, anyhow::Result<PodEvent>>;

/// ClusterClient is the handle to the cluster's source of truth for pods.
#[async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    /// Opens a new subscription. The first event delivered must be a [PodEvent::Restarted]
    /// listing, followed by incremental changes in the order the cluster applied them.
    async fn watch_pods(&self) -> anyhow::Result<PodEvents>;
}

/// ClientFactory builds the [ClusterClient] a resolver synchronizes from. It is invoked once,
/// at resolver construction.
pub trait ClientFactory: Send + Sync {
    fn build(
        &self,
        kubeconfig: Option<&Path>,
        cfg: &Config,
    ) -> anyhow::Result<Arc<dyn ClusterClient>>;
}

impl<F> ClientFactory for F
where
    F: Fn(Option<&Path>, &Config) -> anyhow::Result<Arc<dyn ClusterClient>> + Send + Sync,
{
    fn build(
        &self,
        kubeconfig: Option<&Path>,
        cfg: &Config,
    ) -> anyhow::Result<Arc<dyn ClusterClient>> {
        self(kubeconfig, cfg)
    }
}

#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    Static(String),
}

impl ConfigSource {
    pub async fn read_to_string(&self) -> anyhow::Result<String> {
        Ok(match self {
            ConfigSource::File(path) => tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?,
            ConfigSource::Static(data) => data.clone(),
        })
    }
}

#[derive(Default, Debug, Eq, PartialEq, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalConfig {
    #[serde(default)]
    pub pods: Vec<Pod>,
}

/// LocalClient serves a static pod listing from YAML instead of a live cluster.
/// Each subscription re-reads the source, so edits are picked up on the next relist.
pub struct LocalClient {
    pub cfg: ConfigSource,
}

#[async_trait]
impl ClusterClient for LocalClient {
    #[instrument(skip_all, name = "local_client")]
    async fn watch_pods(&self) -> anyhow::Result<PodEvents> {
        let r: LocalConfig = serde_yaml::from_str(&self.cfg.read_to_string().await?)?;
        info!(num_pods = r.pods.len(), "local pods loaded");
        let initial = stream::once(async move { Ok(PodEvent::Restarted(r.pods)) });
        // A file has no incremental changes; hold the subscription open until the next relist.
        Ok(initial.chain(stream::pending()).boxed())
    }
}

/// Builds a [LocalClient] from `localPodsPath`. This is the factory used by the binary.
pub fn local_client_factory(
    kubeconfig: Option<&Path>,
    cfg: &Config,
) -> anyhow::Result<Arc<dyn ClusterClient>> {
    if let Some(kubeconfig) = kubeconfig {
        debug!(
            kubeconfig = %kubeconfig.display(),
            "cluster credentials are not used by the local client"
        );
    }
    let path = cfg
        .local_pods_path
        .clone()
        .context("no pod source configured (set LOCAL_PODS_PATH)")?;
    Ok(Arc::new(LocalClient {
        cfg: ConfigSource::File(path),
    }))
}
