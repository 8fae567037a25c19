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

use std::convert::Infallible;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::state::workload::PodKey;

/// Prefix marking a uid as an in-mesh pod identifier rather than an opaque string.
pub const KUBERNETES_PREFIX: &str = "kubernetes://";

/// A request-side reference to a workload, either a uid or an address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WorkloadRef {
    /// A uid of the form `kubernetes://<name>.<namespace>`, or a bare IP.
    Uid(String),
    Ip(IpAddr),
}

/// How a [WorkloadRef] is looked up in the pod cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Key(PodKey),
    Ip(IpAddr),
    Malformed,
}

impl WorkloadRef {
    /// Builds a reference from the uid and IP a caller may supply for one side of a transaction.
    /// A non-empty uid takes precedence; an unspecified IP is treated as absent.
    pub fn from_parts(uid: Option<&str>, ip: Option<IpAddr>) -> Option<Self> {
        match (uid, ip) {
            (Some(uid), _) if !uid.is_empty() => Some(WorkloadRef::Uid(uid.to_string())),
            (_, Some(ip)) if !ip.is_unspecified() => Some(WorkloadRef::Ip(ip)),
            _ => None,
        }
    }

    pub fn lookup(&self) -> Lookup {
        match self {
            WorkloadRef::Ip(ip) => Lookup::Ip(*ip),
            WorkloadRef::Uid(uid) => parse_uid(uid),
        }
    }
}

fn parse_uid(uid: &str) -> Lookup {
    if let Ok(ip) = uid.parse::<IpAddr>() {
        return Lookup::Ip(ip);
    }
    let Some(fullname) = uid.strip_prefix(KUBERNETES_PREFIX) else {
        return Lookup::Malformed;
    };
    match fullname.split_once('.') {
        Some((name, namespace))
            if !name.is_empty() && !namespace.is_empty() && !namespace.contains('.') =>
        {
            Lookup::Key(PodKey::new(namespace, name))
        }
        _ => Lookup::Malformed,
    }
}

impl FromStr for WorkloadRef {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.parse::<IpAddr>() {
            Ok(ip) => WorkloadRef::Ip(ip),
            Err(_) => WorkloadRef::Uid(s.to_string()),
        })
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadRef::Uid(uid) => write!(f, "{uid}"),
            WorkloadRef::Ip(ip) => write!(f, "{ip}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn uid(s: &str) -> Lookup {
        WorkloadRef::Uid(s.to_string()).lookup()
    }

    #[test_case("kubernetes://test-pod.testns", Lookup::Key(PodKey::new("testns", "test-pod")); "pod uid")]
    #[test_case("192.168.234.3", Lookup::Ip("192.168.234.3".parse().unwrap()); "ip as uid")]
    #[test_case("fd00::1", Lookup::Ip("fd00::1".parse().unwrap()); "ipv6 as uid")]
    #[test_case("kubernetes://badsvcuid", Lookup::Malformed; "missing namespace")]
    #[test_case("kubernetes://a.b.c", Lookup::Malformed; "too many segments")]
    #[test_case("kubernetes://.testns", Lookup::Malformed; "empty name")]
    #[test_case("kubernetes://test-pod.", Lookup::Malformed; "empty namespace")]
    #[test_case("test-pod.testns", Lookup::Malformed; "missing scheme")]
    #[test_case("", Lookup::Malformed; "empty")]
    fn parse(input: &str, want: Lookup) {
        assert_eq!(uid(input), want);
    }

    #[test]
    fn from_parts_precedence() {
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(
            WorkloadRef::from_parts(Some("kubernetes://a.b"), Some(ip)),
            Some(WorkloadRef::Uid("kubernetes://a.b".to_string()))
        );
        assert_eq!(
            WorkloadRef::from_parts(Some(""), Some(ip)),
            Some(WorkloadRef::Ip(ip))
        );
        assert_eq!(
            WorkloadRef::from_parts(None, Some("0.0.0.0".parse().unwrap())),
            None
        );
        assert_eq!(WorkloadRef::from_parts(None, Some("::".parse().unwrap())), None);
        assert_eq!(WorkloadRef::from_parts(None, None), None);
    }

    #[test]
    fn from_str() {
        assert_eq!(
            "10.1.1.1".parse::<WorkloadRef>(),
            Ok(WorkloadRef::Ip("10.1.1.1".parse().unwrap()))
        );
        assert_eq!(
            "kubernetes://a.b".parse::<WorkloadRef>(),
            Ok(WorkloadRef::Uid("kubernetes://a.b".to_string()))
        );
    }
}
