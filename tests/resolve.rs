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
use std::sync::Arc;
use std::time::Duration;

use kubeenv::config::Config;
use kubeenv::resolver::{Attributes, Error, Output, Request, Resolver};
use kubeenv::test_helpers::helpers::initialize_telemetry;
use kubeenv::test_helpers::{FakeClient, FixedFactory, PendingClient, failing_factory, golden_pods};
use kubeenv::workload_ref::WorkloadRef;

async fn resolve(cfg: Config, req: Request) -> Output {
    initialize_telemetry();
    let (client, _tx) = FakeClient::new(golden_pods());
    let resolver = Resolver::new(cfg, &FixedFactory::new(client))
        .await
        .unwrap();
    resolver.resolve(&req)
}

fn uid(s: &str) -> Option<WorkloadRef> {
    Some(WorkloadRef::Uid(s.to_string()))
}

fn labels(kv: &[(&str, &str)]) -> HashMap<String, String> {
    kv.iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn test_pod_attributes() -> Attributes {
    Attributes {
        labels: labels(&[("app", "test"), ("something", "")]),
        namespace: "testns".to_string(),
        pod_name: "test-pod".to_string(),
        pod_ip: Some("10.10.10.1".parse().unwrap()),
        host_ip: Some("10.1.1.10".parse().unwrap()),
        service: Some("test.testns.svc.cluster.local".to_string()),
        service_account_name: "test".to_string(),
    }
}

fn ingress_attributes() -> Attributes {
    Attributes {
        labels: labels(&[("istio", "ingress")]),
        namespace: "istio-system".to_string(),
        pod_name: "ingress".to_string(),
        service: Some("ingress.istio-system.svc.cluster.local".to_string()),
        ..Default::default()
    }
}

fn source_only(pod: &str, app: &str, service: Option<&str>) -> Output {
    Output {
        source: Attributes {
            labels: labels(&[("app", app)]),
            namespace: "testns".to_string(),
            pod_name: pod.to_string(),
            service: service.map(str::to_string),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn destination_only(pod: &str, app: &str, service: Option<&str>) -> Output {
    let Output { source, .. } = source_only(pod, app, service);
    Output {
        destination: source,
        ..Default::default()
    }
}

#[tokio::test]
async fn source_pod_and_destination_service() {
    let req = Request {
        source: uid("kubernetes://test-pod.testns"),
        destination: uid("kubernetes://badsvcuid"),
        origin: uid("kubernetes://badsvcuid"),
    };
    let want = Output {
        source: test_pod_attributes(),
        ..Default::default()
    };
    assert_eq!(resolve(Config::default(), req).await, want);
}

#[tokio::test]
async fn namespace_qualified_service() {
    let req = Request {
        source: uid("kubernetes://alt-pod.testns"),
        ..Default::default()
    };
    assert_eq!(
        resolve(Config::default(), req).await,
        source_only(
            "alt-pod",
            "alt-svc.testns",
            Some("alt-svc.testns.svc.cluster.local")
        )
    );
}

#[tokio::test]
async fn partial_cluster_domain_service() {
    let req = Request {
        source: uid("kubernetes://pod-cluster.testns"),
        ..Default::default()
    };
    assert_eq!(
        resolve(Config::default(), req).await,
        source_only(
            "pod-cluster",
            "alt-svc-with-cluster.testns.svc.cluster:8080",
            Some("alt-svc-with-cluster.testns.svc.cluster.local")
        )
    );
}

#[tokio::test]
async fn extended_domain_service() {
    let req = Request {
        source: uid("kubernetes://long-pod.testns"),
        ..Default::default()
    };
    assert_eq!(
        resolve(Config::default(), req).await,
        source_only(
            "long-pod",
            "long-svc.testns.svc.cluster.local.solar",
            Some("long-svc.testns.svc.cluster.local.solar")
        )
    );
}

#[tokio::test]
async fn empty_service() {
    let req = Request {
        destination: uid("kubernetes://empty.testns"),
        ..Default::default()
    };
    assert_eq!(
        resolve(Config::default(), req).await,
        destination_only("empty", "", None)
    );
}

#[tokio::test]
async fn bad_destination_service() {
    let req = Request {
        destination: uid("kubernetes://bad-svc-pod.testns"),
        ..Default::default()
    };
    assert_eq!(
        resolve(Config::default(), req).await,
        destination_only("bad-svc-pod", ":", None)
    );
}

#[tokio::test]
async fn destination_ip_pod() {
    let ip = "192.168.234.3".parse().unwrap();
    let mut want = destination_only(
        "ip-svc-pod",
        "ipAddr",
        Some("ipAddr.testns.svc.cluster.local"),
    );
    want.destination.pod_ip = Some(ip);

    let by_ip = Request {
        destination: WorkloadRef::from_parts(None, Some(ip)),
        ..Default::default()
    };
    assert_eq!(resolve(Config::default(), by_ip).await, want);

    let by_uid = Request {
        destination: uid("kubernetes://ip-svc-pod.testns"),
        ..Default::default()
    };
    assert_eq!(resolve(Config::default(), by_uid).await, want);
}

#[tokio::test]
async fn ingress_destination_without_source_lookup() {
    let req = Request {
        destination: uid("kubernetes://ingress.istio-system"),
        source: uid("kubernetes://test-pod.testns"),
        origin: None,
    };
    let want = Output {
        destination: ingress_attributes(),
        ..Default::default()
    };
    assert_eq!(resolve(Config::default(), req).await, want);
}

#[tokio::test]
async fn ingress_destination_with_source_lookup() {
    let cfg = Config {
        lookup_ingress_source_and_origin_values: true,
        ..Default::default()
    };
    let req = Request {
        destination: uid("kubernetes://ingress.istio-system"),
        source: uid("kubernetes://test-pod.testns"),
        origin: None,
    };
    let want = Output {
        source: test_pod_attributes(),
        destination: ingress_attributes(),
        ..Default::default()
    };
    assert_eq!(resolve(cfg, req).await, want);
}

#[tokio::test]
async fn ip_literal_service_label() {
    let req = Request {
        destination: uid("kubernetes://ipApp.testns"),
        ..Default::default()
    };
    assert_eq!(
        resolve(Config::default(), req).await,
        destination_only("ipApp", "10.1.10.1", None)
    );
}

#[tokio::test]
async fn output_serializes_populated_fields_only() {
    let req = Request {
        destination: uid("kubernetes://empty.testns"),
        ..Default::default()
    };
    let out = resolve(Config::default(), req).await;
    let json = serde_json::to_value(&out).unwrap();
    assert_eq!(
        json,
        serde_json::json!({
            "source": {},
            "destination": {
                "labels": {"app": ""},
                "namespace": "testns",
                "podName": "empty",
            },
            "origin": {},
        })
    );
}

#[tokio::test]
async fn builder_error() {
    initialize_telemetry();
    match Resolver::new(Config::default(), &failing_factory).await {
        Err(Error::ClientBuild(e)) => assert!(e.to_string().contains("unavailable")),
        Err(e) => panic!("unexpected error {e}"),
        Ok(_) => panic!("expected an error"),
    }
}

#[tokio::test]
async fn sync_timeout() {
    initialize_telemetry();
    let cfg = Config {
        cache_sync_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    match Resolver::new(cfg, &FixedFactory::new(Arc::new(PendingClient))).await {
        Err(Error::SyncTimeout(d)) => assert_eq!(d, Duration::from_millis(50)),
        Err(e) => panic!("unexpected error {e}"),
        Ok(_) => panic!("expected an error"),
    }
}

#[tokio::test]
async fn empty_config_is_rejected() {
    initialize_telemetry();
    let cfg = Config {
        cluster_domain_suffix: String::new(),
        service_label_key: String::new(),
        cache_sync_timeout: Duration::ZERO,
        cache_refresh_duration: Duration::ZERO,
        ..Default::default()
    };
    let (client, _tx) = FakeClient::new(vec![]);
    let factory = FixedFactory::new(client);
    match Resolver::new(cfg, &factory).await {
        Err(Error::ConfigValidation(e)) => assert_eq!(e.len(), 4),
        Err(e) => panic!("unexpected error {e}"),
        Ok(_) => panic!("expected an error"),
    }
    assert!(factory.calls().is_empty());
}
