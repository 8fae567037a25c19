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
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{Level, debug, info, instrument, trace};

use crate::client::ClientFactory;
use crate::config::{Config, ValidationErrors};
use crate::metrics::lookup::{Lookup as LookupEvent, Outcome, Side};
use crate::metrics::{IncrementRecorder, Metrics};
use crate::state::workload::Pod;
use crate::state::{self, PodCache};
use crate::workload_ref::{Lookup, WorkloadRef};

pub mod canonical;

/// Label marking a pod as a mesh gateway. Its presence alone is what counts.
pub const GATEWAY_LABEL: &str = "istio";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    ConfigValidation(#[from] ValidationErrors),
    #[error("failed to build cluster client: {0:#}")]
    ClientBuild(anyhow::Error),
    #[error("pod cache did not sync within {0:?}")]
    SyncTimeout(Duration),
    #[error("pod cache was closed before it synced")]
    CacheClosed,
}

impl From<state::Error> for Error {
    fn from(e: state::Error) -> Self {
        match e {
            state::Error::SyncTimeout(d) => Error::SyncTimeout(d),
            state::Error::Stopped => Error::CacheClosed,
        }
    }
}

/// The workloads observed on each side of a single transaction. Any side may be absent.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub source: Option<WorkloadRef>,
    pub destination: Option<WorkloadRef>,
    /// The original initiator of traffic relayed by a gateway.
    pub origin: Option<WorkloadRef>,
}

/// Attributes describing one resolved workload. Every field is empty when no pod was found.
#[derive(Default, Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attributes {
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pod_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<IpAddr>,
    /// Fully qualified service name derived from the service label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub service_account_name: String,
}

impl Attributes {
    pub fn is_empty(&self) -> bool {
        *self == Attributes::default()
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Output {
    pub source: Attributes,
    pub destination: Attributes,
    pub origin: Attributes,
}

/// Resolver turns workload references into [Attributes] using a synchronized [PodCache].
///
/// Resolution never fails: unknown or malformed references produce empty attributes.
/// Dropping the resolver stops cache synchronization.
pub struct Resolver {
    cfg: Config,
    cache: PodCache,
    metrics: Arc<Metrics>,
}

impl Resolver {
    pub async fn new(cfg: Config, factory: &dyn ClientFactory) -> Result<Self, Error> {
        Self::new_with_metrics(cfg, factory, Default::default()).await
    }

    /// Validates `cfg`, builds a client through `factory` and waits for the pod cache to sync.
    pub async fn new_with_metrics(
        cfg: Config,
        factory: &dyn ClientFactory,
        metrics: Arc<Metrics>,
    ) -> Result<Self, Error> {
        cfg.validate()?;
        let kubeconfig = cfg.kubeconfig();
        let client = factory
            .build(kubeconfig.as_deref(), &cfg)
            .map_err(Error::ClientBuild)?;

        let cache = PodCache::new(metrics.clone());
        cache
            .start(client, cfg.cache_refresh_duration, cfg.cache_sync_timeout)
            .await?;
        info!(num_pods = cache.len(), "resolver ready");
        Ok(Resolver {
            cfg,
            cache,
            metrics,
        })
    }

    pub fn cache(&self) -> &PodCache {
        &self.cache
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Resolves every side present in `req`.
    ///
    /// The destination is resolved first. If it is a gateway, the source and origin are only
    /// resolved when `lookupIngressSourceAndOriginValues` is set.
    #[instrument(level = Level::DEBUG, skip_all)]
    pub fn resolve(&self, req: &Request) -> Output {
        let destination = self.find(Side::destination, req.destination.as_ref());
        let skip_peers = !self.cfg.lookup_ingress_source_and_origin_values
            && destination
                .as_ref()
                .is_some_and(|pod| pod.labels.contains_key(GATEWAY_LABEL));
        if skip_peers {
            debug!("destination is a gateway, skipping source and origin");
        }

        let peer = |side, reference: Option<&WorkloadRef>| {
            if skip_peers {
                if reference.is_some() {
                    self.record(side, Outcome::skipped);
                }
                return None;
            }
            self.find(side, reference)
        };
        let source = peer(Side::source, req.source.as_ref());
        let origin = peer(Side::origin, req.origin.as_ref());

        Output {
            source: self.attributes(source.as_deref()),
            destination: self.attributes(destination.as_deref()),
            origin: self.attributes(origin.as_deref()),
        }
    }

    fn find(&self, side: Side, reference: Option<&WorkloadRef>) -> Option<Arc<Pod>> {
        let reference = reference?;
        let pod = match reference.lookup() {
            Lookup::Key(key) => self.cache.find_key(&key.namespace, &key.name),
            Lookup::Ip(ip) => self.cache.find_ip(&ip),
            Lookup::Malformed => {
                debug!(?side, %reference, "ignoring malformed workload reference");
                self.record(side, Outcome::malformed);
                return None;
            }
        };
        match &pod {
            Some(pod) => {
                trace!(?side, %reference, pod=%pod.key(), "resolved workload");
                self.record(side, Outcome::hit);
            }
            None => {
                trace!(?side, %reference, "workload not found");
                self.record(side, Outcome::miss);
            }
        }
        pod
    }

    fn record(&self, side: Side, outcome: Outcome) {
        self.metrics
            .lookup
            .increment(&LookupEvent { side, outcome });
    }

    fn attributes(&self, pod: Option<&Pod>) -> Attributes {
        let Some(pod) = pod else {
            return Attributes::default();
        };
        let service = pod
            .labels
            .get(&self.cfg.service_label_key)
            .or_else(|| pod.labels.get(GATEWAY_LABEL))
            .and_then(|v| {
                canonical::canonical_name(v, &pod.namespace, &self.cfg.cluster_domain_suffix)
            });
        Attributes {
            labels: pod.labels.clone(),
            namespace: pod.namespace.clone(),
            pod_name: pod.name.clone(),
            pod_ip: pod.pod_ip,
            host_ip: pod.host_ip,
            service,
            service_account_name: pod.service_account.clone(),
        }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.cache.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClusterClient;
    use crate::test_helpers::helpers::initialize_telemetry;
    use crate::test_helpers::{FakeClient, FixedFactory, test_pod};
    use std::path::Path;

    fn gateway() -> Pod {
        let mut pod = test_pod("istio-system", "ingress", Some("10.0.0.100"));
        pod.labels.clear();
        pod.labels
            .insert(GATEWAY_LABEL.to_string(), "ingressgateway".to_string());
        pod
    }

    fn uid(s: &str) -> Option<WorkloadRef> {
        Some(WorkloadRef::Uid(s.to_string()))
    }

    async fn resolver(pods: Vec<Pod>, cfg: Config) -> (Resolver, Arc<Metrics>) {
        initialize_telemetry();
        let (client, _tx) = FakeClient::new(pods);
        let metrics: Arc<Metrics> = Default::default();
        let r = Resolver::new_with_metrics(cfg, &FixedFactory::new(client), metrics.clone())
            .await
            .unwrap();
        (r, metrics)
    }

    fn count(metrics: &Metrics, side: Side, outcome: Outcome) -> u64 {
        metrics
            .lookup
            .lookups
            .get_or_create(&LookupEvent { side, outcome })
            .get()
    }

    #[tokio::test]
    async fn resolves_origin_side() {
        let (r, metrics) = resolver(
            vec![test_pod("ns", "client", Some("10.0.0.1"))],
            Config::default(),
        )
        .await;
        let out = r.resolve(&Request {
            origin: Some(WorkloadRef::Ip("10.0.0.1".parse().unwrap())),
            ..Default::default()
        });
        assert_eq!(out.origin.pod_name, "client");
        assert_eq!(
            out.origin.service.as_deref(),
            Some("client.ns.svc.cluster.local")
        );
        assert!(out.source.is_empty());
        assert!(out.destination.is_empty());
        assert_eq!(count(&metrics, Side::origin, Outcome::hit), 1);
    }

    #[tokio::test]
    async fn gateway_destination_skips_peers() {
        let pods = vec![gateway(), test_pod("ns", "client", Some("10.0.0.1"))];
        let (r, metrics) = resolver(pods, Config::default()).await;
        let req = Request {
            source: uid("kubernetes://client.ns"),
            destination: uid("kubernetes://ingress.istio-system"),
            origin: Some(WorkloadRef::Ip("10.0.0.1".parse().unwrap())),
        };
        let out = r.resolve(&req);
        assert_eq!(out.destination.pod_name, "ingress");
        assert!(out.source.is_empty());
        assert!(out.origin.is_empty());
        assert_eq!(count(&metrics, Side::source, Outcome::skipped), 1);
        assert_eq!(count(&metrics, Side::origin, Outcome::skipped), 1);
    }

    #[tokio::test]
    async fn gateway_destination_with_peer_lookup() {
        let pods = vec![gateway(), test_pod("ns", "client", Some("10.0.0.1"))];
        let cfg = Config {
            lookup_ingress_source_and_origin_values: true,
            ..Default::default()
        };
        let (r, _) = resolver(pods, cfg).await;
        let out = r.resolve(&Request {
            source: uid("kubernetes://client.ns"),
            destination: uid("10.0.0.100"),
            origin: Some(WorkloadRef::Ip("10.0.0.1".parse().unwrap())),
        });
        assert_eq!(out.destination.pod_name, "ingress");
        assert_eq!(
            out.destination.service.as_deref(),
            Some("ingressgateway.istio-system.svc.cluster.local")
        );
        assert_eq!(out.source.pod_name, "client");
        assert_eq!(out.origin.pod_name, "client");
    }

    #[tokio::test]
    async fn non_gateway_destination_never_skips() {
        let pods = vec![
            test_pod("ns", "server", Some("10.0.0.2")),
            test_pod("ns", "client", Some("10.0.0.1")),
        ];
        let (r, _) = resolver(pods, Config::default()).await;
        let out = r.resolve(&Request {
            source: uid("kubernetes://client.ns"),
            destination: uid("kubernetes://server.ns"),
            origin: None,
        });
        assert_eq!(out.source.pod_name, "client");
        assert_eq!(out.destination.pod_name, "server");
    }

    #[tokio::test]
    async fn custom_service_label_and_domain() {
        let mut pod = test_pod("bookinfo", "reviews-v1", None);
        pod.labels
            .insert("service".to_string(), "reviews".to_string());
        let cfg = Config {
            service_label_key: "service".to_string(),
            cluster_domain_suffix: "corp.example".to_string(),
            ..Default::default()
        };
        let (r, _) = resolver(vec![pod], cfg).await;
        let out = r.resolve(&Request {
            source: uid("kubernetes://reviews-v1.bookinfo"),
            ..Default::default()
        });
        assert_eq!(
            out.source.service.as_deref(),
            Some("reviews.bookinfo.svc.corp.example")
        );
    }

    #[tokio::test]
    async fn unknown_and_malformed_references_are_empty() {
        let (r, metrics) = resolver(vec![], Config::default()).await;
        let out = r.resolve(&Request {
            source: uid("kubernetes://nope.ns"),
            destination: uid("not-a-uid"),
            origin: Some(WorkloadRef::Ip("10.9.9.9".parse().unwrap())),
        });
        assert_eq!(out, Output::default());
        assert_eq!(count(&metrics, Side::source, Outcome::miss), 1);
        assert_eq!(count(&metrics, Side::destination, Outcome::malformed), 1);
        assert_eq!(count(&metrics, Side::origin, Outcome::miss), 1);
    }

    #[tokio::test]
    async fn sees_updates_after_sync() {
        initialize_telemetry();
        let (client, tx) = FakeClient::new(vec![]);
        let r = Resolver::new(Config::default(), &FixedFactory::new(client))
            .await
            .unwrap();
        let req = Request {
            destination: Some(WorkloadRef::Ip("10.0.0.7".parse().unwrap())),
            ..Default::default()
        };
        assert!(r.resolve(&req).destination.is_empty());

        tx.send(crate::client::PodEvent::Applied(test_pod(
            "ns",
            "late",
            Some("10.0.0.7"),
        )))
        .unwrap();
        for _ in 0..500 {
            if !r.resolve(&req).destination.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("update never observed");
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_building() {
        initialize_telemetry();
        let cfg = Config {
            service_label_key: String::new(),
            cluster_domain_suffix: "bad domain".to_string(),
            ..Default::default()
        };
        let called = std::sync::atomic::AtomicBool::new(false);
        let factory = |_: Option<&Path>, _: &Config| -> anyhow::Result<Arc<dyn ClusterClient>> {
            called.store(true, std::sync::atomic::Ordering::SeqCst);
            anyhow::bail!("unreachable")
        };
        match Resolver::new(cfg, &factory).await {
            Err(Error::ConfigValidation(e)) => assert_eq!(e.len(), 2),
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("expected an error"),
        }
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_resolves_see_whole_pods() {
        initialize_telemetry();
        const GENERATIONS: u32 = 2000;
        let churn = |generation: u32| {
            let mut pod = test_pod("ns", "churn", Some("10.0.0.9"));
            pod.labels
                .insert("generation".to_string(), generation.to_string());
            pod.service_account = generation.to_string();
            pod
        };
        let (client, tx) = FakeClient::new(vec![churn(0)]);
        let r = Arc::new(
            Resolver::new(Config::default(), &FixedFactory::new(client))
                .await
                .unwrap(),
        );
        let req = Request {
            source: uid("kubernetes://churn.ns"),
            destination: Some(WorkloadRef::Ip("10.0.0.9".parse().unwrap())),
            origin: None,
        };

        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let (r, req, done) = (r.clone(), req.clone(), done.clone());
                std::thread::spawn(move || {
                    let mut resolved = 0u64;
                    while !done.load(std::sync::atomic::Ordering::Acquire) {
                        let out = r.resolve(&req);
                        for attrs in [&out.source, &out.destination] {
                            assert_eq!(
                                attrs.labels["generation"], attrs.service_account_name,
                                "torn attributes {attrs:?}"
                            );
                        }
                        resolved += 1;
                    }
                    resolved
                })
            })
            .collect();

        for generation in 1..=GENERATIONS {
            tx.send(crate::client::PodEvent::Applied(churn(generation)))
                .unwrap();
        }
        let last = GENERATIONS.to_string();
        for _ in 0..500 {
            if r.resolve(&req).source.service_account_name == last {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        done.store(true, std::sync::atomic::Ordering::Release);
        for reader in readers {
            assert!(reader.join().unwrap() > 0);
        }
        assert_eq!(r.resolve(&req).destination.service_account_name, last);
    }
}
