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

use std::net::IpAddr;

const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Marker of a partially qualified in-cluster name, such as `svc.ns.svc.cluster`.
const PARTIAL_CLUSTER_DOMAIN: &str = ".svc.cluster";

/// Builds the fully qualified service name for a service label `value` on a workload in
/// `namespace`. Returns `None` when the value cannot name a service.
///
/// The rules are applied in order, each assuming the earlier ones did not match:
/// 1. already qualified under `domain` (possibly extended, e.g. `x.svc.cluster.local.solar`): unchanged
/// 2. contains `.svc.cluster`: truncated there and re-suffixed with `.svc.<domain>`
/// 3. contains a `.` (`name.namespace`): suffixed with `.svc.<domain>`
/// 4. a bare name: suffixed with `.<namespace>.svc.<domain>`
///
/// A trailing `:<port>` is ignored. IP literals and values with characters not allowed in
/// DNS names never name a service.
pub fn canonical_name(value: &str, namespace: &str, domain: &str) -> Option<String> {
    let host = strip_port(value)?;
    if host.parse::<IpAddr>().is_ok() || !is_dns_name(host) {
        return None;
    }

    let suffix = format!(".{domain}");
    if host.ends_with(&suffix) || host.contains(&format!("{suffix}.")) {
        return Some(host.to_string());
    }
    if let Some(idx) = host.find(PARTIAL_CLUSTER_DOMAIN) {
        return Some(format!("{}.svc.{domain}", &host[..idx]));
    }
    if host.contains('.') {
        return Some(format!("{host}.svc.{domain}"));
    }
    Some(format!("{host}.{namespace}.svc.{domain}"))
}

fn strip_port(value: &str) -> Option<&str> {
    match value.split_once(':') {
        None if !value.is_empty() => Some(value),
        Some((host, port))
            if !host.is_empty() && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            Some(host)
        }
        _ => None,
    }
}

fn is_dns_name(host: &str) -> bool {
    host.split('.').all(|label| {
        !label.is_empty()
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}

/// Checks that `domain` is a usable DNS domain: at least two RFC 1123 labels.
pub fn validate_domain(domain: &str) -> Result<(), String> {
    if domain.len() > MAX_DOMAIN_LEN {
        return Err(format!("must be at most {MAX_DOMAIN_LEN} characters"));
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return Err("must have at least two segments, separated by a '.'".to_string());
    }
    for label in labels {
        if label.is_empty() {
            return Err("must not contain empty segments".to_string());
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(format!(
                "segment '{label}' is longer than {MAX_LABEL_LEN} characters"
            ));
        }
        if !label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-')
        {
            return Err(format!("segment '{label}' contains invalid characters"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(format!(
                "segment '{label}' must not start or end with '-'"
            ));
        }
    }
    Ok(())
}
