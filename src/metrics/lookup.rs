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
    pub lookups: Family<Lookup, Counter>,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct Lookup {
    pub side: Side,
    pub outcome: Outcome,
}

/// Which side of a transaction a workload reference describes.
#[derive(Copy, Clone, Hash, Debug, PartialEq, Eq, EncodeLabelValue)]
pub enum Side {
    source,
    destination,
    origin,
}

#[derive(Copy, Clone, Hash, Debug, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    /// A pod was found for the reference.
    hit,
    /// The reference was well formed, but no pod matched it.
    miss,
    /// The reference could not be interpreted as a pod identifier or IP.
    malformed,
    /// The lookup was suppressed by gateway policy.
    skipped,
}

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let lookups = Family::default();
        registry.register(
            "workload_lookups",
            "The total number of workload references resolved against the pod cache",
            lookups.clone(),
        );

        Self { lookups }
    }
}

impl Recorder<Lookup, u64> for Metrics {
    fn record(&self, lookup: &Lookup, count: u64) {
        self.lookups.get_or_create(lookup).inc_by(count);
    }
}
