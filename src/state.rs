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
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, Level, debug, info, info_span, instrument, warn};

use crate::client::{ClusterClient, PodEvent};
use crate::metrics::cache::{EventKind, Relist};
use crate::metrics::{IncrementRecorder, Metrics};
use crate::state::workload::{Pod, PodKey, PodStore};

pub mod workload;

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(15);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SyncState {
    /// No full listing has been received yet.
    Unsynced,
    /// At least one full listing has been applied.
    Synced,
    /// Synchronization was stopped.
    Stopped,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("pod cache did not sync within {0:?}")]
    SyncTimeout(Duration),
    #[error("pod cache was stopped before it synced")]
    Stopped,
}

/// PodCache is an in-memory, indexed view of every pod in the cluster, kept current by a
/// background task consuming a [ClusterClient] feed.
///
/// Reads take the lock only for a single index lookup and hand back a shared record, so a
/// caller never observes a pod half way through an update.
pub struct PodCache {
    state: Arc<RwLock<PodStore>>,
    sync: Arc<watch::Sender<SyncState>>,
    task: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<Metrics>,
}

impl PodCache {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        let (sync, _) = watch::channel(SyncState::Unsynced);
        PodCache {
            state: Default::default(),
            sync: Arc::new(sync),
            task: Mutex::new(None),
            metrics,
        }
    }

    /// Starts synchronizing from `client` and waits up to `timeout` for the first full listing.
    /// The feed is re-established every `refresh`.
    pub async fn start(
        &self,
        client: Arc<dyn ClusterClient>,
        refresh: Duration,
        timeout: Duration,
    ) -> Result<(), Error> {
        {
            let mut task = self.task.lock();
            if task.is_some() {
                warn!("pod cache already started");
            } else if *self.sync.borrow() == SyncState::Stopped {
                return Err(Error::Stopped);
            } else {
                let syncer = Syncer {
                    client,
                    state: self.state.clone(),
                    sync: self.sync.clone(),
                    refresh,
                    metrics: self.metrics.clone(),
                };
                *task = Some(tokio::spawn(
                    syncer.run().instrument(info_span!("pod_cache")),
                ));
            }
        }

        let mut rx = self.sync.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|s| *s != SyncState::Unsynced)).await {
            Ok(Ok(s)) if *s == SyncState::Synced => Ok(()),
            Ok(_) => Err(Error::Stopped),
            Err(_) => {
                warn!(?timeout, "pod cache did not sync in time");
                Err(Error::SyncTimeout(timeout))
            }
        }
    }

    /// Finds the pod by namespace and name.
    pub fn find_key(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
        self.state.read().find_key(&PodKey::new(namespace, name))
    }

    /// Finds the pod currently owning the given pod IP.
    pub fn find_ip(&self, ip: &IpAddr) -> Option<Arc<Pod>> {
        self.state.read().find_ip(ip)
    }

    pub fn len(&self) -> usize {
        self.state.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().is_empty()
    }

    pub fn sync_state(&self) -> SyncState {
        *self.sync.borrow()
    }

    /// Stops background synchronization. The last known state remains readable.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            debug!("pod cache stopped");
        }
        self.sync.send_replace(SyncState::Stopped);
    }

    /// Dumps the cache as JSON, for debugging.
    pub fn dump(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&*self.state.read())
    }
}

impl Drop for PodCache {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Syncer owns the subscription to the pod feed and applies its events to the store.
struct Syncer {
    client: Arc<dyn ClusterClient>,
    state: Arc<RwLock<PodStore>>,
    sync: Arc<watch::Sender<SyncState>>,
    refresh: Duration,
    metrics: Arc<Metrics>,
}

impl Syncer {
    async fn run(self) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match self.run_internal().await {
                Ok(()) => {
                    backoff = INITIAL_BACKOFF;
                    info!(refresh=?self.refresh, "refreshing pod feed");
                }
                Err(e) => {
                    warn!("pod feed failed: {e:#}; retrying in {:?}", backoff);
                    tokio::time::sleep(backoff).await;
                    backoff = std::cmp::min(MAX_BACKOFF, backoff * 2);
                }
            }
            self.metrics.cache.increment(&Relist);
        }
    }

    /// Consumes a single subscription. Returns Ok when it is time to relist.
    async fn run_internal(&self) -> anyhow::Result<()> {
        let mut events = self.client.watch_pods().await?;
        let relist = tokio::time::sleep(self.refresh);
        tokio::pin!(relist);
        loop {
            tokio::select! {
                _ = &mut relist => return Ok(()),
                event = events.next() => match event {
                    Some(event) => self.apply(event?),
                    None => anyhow::bail!("pod feed closed"),
                },
            }
        }
    }

    #[instrument(level = Level::TRACE, name = "apply", skip_all)]
    fn apply(&self, event: PodEvent) {
        // Each event is applied under a single write lock, so readers see it entirely or not at all.
        let mut state = self.state.write();
        match event {
            PodEvent::Restarted(pods) => {
                debug!(num_pods = pods.len(), "handling listing");
                state.reset(pods);
                self.metrics.cache.increment(&EventKind::restarted);
                let num_pods = state.len();
                drop(state);
                self.sync.send_if_modified(|s| {
                    if *s == SyncState::Unsynced {
                        info!(num_pods, "pod cache synced");
                        *s = SyncState::Synced;
                        true
                    } else {
                        false
                    }
                });
            }
            PodEvent::Applied(pod) => {
                debug!(pod=%pod.key(), "handling apply");
                state.insert(pod);
                self.metrics.cache.increment(&EventKind::applied);
            }
            PodEvent::Deleted(key) => {
                debug!(pod=%key, "handling delete");
                if state.remove(&key).is_none() {
                    debug!(pod=%key, "deleted pod was not cached");
                }
                self.metrics.cache.increment(&EventKind::deleted);
            }
        }
    }
}
