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
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::client::{ClientFactory, ClusterClient, LocalConfig, PodEvent, PodEvents};
use crate::config::Config;
use crate::state::workload::Pod;

pub mod helpers;

/// Pods used by the end-to-end resolution scenarios.
pub const GOLDEN_PODS: &str = r#"
pods:
- name: test-pod
  namespace: testns
  labels:
    app: test
    something: ""
  hostIp: 10.1.1.10
  podIp: 10.10.10.1
  serviceAccount: test
- name: pod-cluster
  namespace: testns
  labels:
    app: alt-svc-with-cluster.testns.svc.cluster:8080
- name: long-pod
  namespace: testns
  labels:
    app: long-svc.testns.svc.cluster.local.solar
- name: empty
  namespace: testns
  labels:
    app: ""
- name: alt-pod
  namespace: testns
  labels:
    app: alt-svc.testns
- name: bad-svc-pod
  namespace: testns
  labels:
    app: ":"
- name: ip-svc-pod
  namespace: testns
  labels:
    app: ipAddr
  podIp: 192.168.234.3
- name: ingress
  namespace: istio-system
  labels:
    istio: ingress
- name: ipApp
  namespace: testns
  labels:
    app: 10.1.10.1
"#;

pub fn golden_pods() -> Vec<Pod> {
    let cfg: LocalConfig = serde_yaml::from_str(GOLDEN_PODS).unwrap();
    cfg.pods
}

/// A pod labelled `app: <name>` with the `default` service account.
pub fn test_pod(namespace: &str, name: &str, pod_ip: Option<&str>) -> Pod {
    Pod {
        name: name.to_string(),
        namespace: namespace.to_string(),
        labels: [("app".to_string(), name.to_string())].into(),
        host_ip: Some("10.1.1.1".parse().unwrap()),
        pod_ip: pod_ip.map(|ip| ip.parse().unwrap()),
        service_account: "default".to_string(),
    }
}

/// FakeClient lists a set of pods on every subscription. Events sent on the channel returned
/// by [FakeClient::new] are delivered after the listing of the first subscription only.
///
/// The current subscription can be failed or closed, and the client made unreachable, to
/// exercise re-subscription.
pub struct FakeClient {
    listing: Mutex<Vec<Pod>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<PodEvent>>>,
    watches: AtomicUsize,
    reachable: AtomicBool,
    errors: Arc<Notify>,
    closes: Arc<Notify>,
}

impl FakeClient {
    pub fn new(initial: Vec<Pod>) -> (Arc<Self>, mpsc::UnboundedSender<PodEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = FakeClient {
            listing: Mutex::new(initial),
            events: Mutex::new(Some(rx)),
            watches: AtomicUsize::new(0),
            reachable: AtomicBool::new(true),
            errors: Default::default(),
            closes: Default::default(),
        };
        (Arc::new(client), tx)
    }

    /// Number of subscriptions attempted so far, including refused ones.
    pub fn watches(&self) -> usize {
        self.watches.load(Ordering::SeqCst)
    }

    /// Sets the listing served by later subscriptions.
    pub fn set_listing(&self, pods: Vec<Pod>) {
        *self.listing.lock() = pods;
    }

    /// While unreachable, every subscription attempt fails.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Delivers an error on the current subscription.
    pub fn fail_feed(&self) {
        self.errors.notify_one();
    }

    /// Ends the current subscription.
    pub fn close_feed(&self) {
        self.closes.notify_one();
    }
}

#[async_trait]
impl ClusterClient for FakeClient {
    async fn watch_pods(&self) -> anyhow::Result<PodEvents> {
        self.watches.fetch_add(1, Ordering::SeqCst);
        if !self.reachable.load(Ordering::SeqCst) {
            anyhow::bail!("cluster unreachable");
        }
        let listing = stream::iter([Ok(PodEvent::Restarted(self.listing.lock().clone()))]);
        let updates = match self.events.lock().take() {
            Some(rx) => UnboundedReceiverStream::new(rx).map(Ok).boxed(),
            None => stream::empty().boxed(),
        };
        let feed = listing.chain(updates).chain(stream::pending());

        let errors = self.errors.clone();
        let failure = stream::once(async move {
            errors.notified().await;
            Err(anyhow::anyhow!("feed interrupted"))
        });
        let closes = self.closes.clone();
        Ok(stream::select(feed, failure)
            .take_until(async move { closes.notified().await })
            .boxed())
    }
}

/// PendingClient accepts subscriptions but never lists anything.
pub struct PendingClient;

#[async_trait]
impl ClusterClient for PendingClient {
    async fn watch_pods(&self) -> anyhow::Result<PodEvents> {
        Ok(stream::pending().boxed())
    }
}

/// FixedFactory hands out the same client every time and records the credentials path of
/// each call.
pub struct FixedFactory {
    client: Arc<dyn ClusterClient>,
    calls: Mutex<Vec<Option<PathBuf>>>,
}

impl FixedFactory {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        FixedFactory {
            client,
            calls: Default::default(),
        }
    }

    pub fn calls(&self) -> Vec<Option<PathBuf>> {
        self.calls.lock().clone()
    }
}

impl ClientFactory for FixedFactory {
    fn build(
        &self,
        kubeconfig: Option<&Path>,
        _: &Config,
    ) -> anyhow::Result<Arc<dyn ClusterClient>> {
        self.calls.lock().push(kubeconfig.map(Path::to_path_buf));
        Ok(self.client.clone())
    }
}

pub fn failing_factory(_: Option<&Path>, _: &Config) -> anyhow::Result<Arc<dyn ClusterClient>> {
    anyhow::bail!("cluster client unavailable")
}
