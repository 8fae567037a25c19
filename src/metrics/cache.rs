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

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

use crate::metrics::Recorder;

pub struct Metrics {
    pub events: Family<CacheEvent, Counter>,
    pub relists: Counter,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct CacheEvent {
    pub kind: EventKind,
}

#[derive(Copy, Clone, Hash, Debug, PartialEq, Eq, EncodeLabelValue)]
pub enum EventKind {
    restarted,
    applied,
    deleted,
}

/// A re-subscription to the pod feed, either periodic or after a failure.
pub struct Relist;

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let events = Family::default();
        registry.register(
            "pod_cache_events",
            "The total number of pod feed events applied to the cache",
            events.clone(),
        );
        let relists = Counter::default();
        registry.register(
            "pod_cache_relists",
            "The total number of times the pod feed was re-established",
            relists.clone(),
        );

        Self { events, relists }
    }
}

impl Recorder<EventKind, u64> for Metrics {
    fn record(&self, kind: &EventKind, count: u64) {
        self.events
            .get_or_create(&CacheEvent { kind: *kind })
            .inc_by(count);
    }
}

impl Recorder<Relist, u64> for Metrics {
    fn record(&self, _: &Relist, count: u64) {
        self.relists.inc_by(count);
    }
}
