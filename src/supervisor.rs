//! Target registry / supervisor.
//!
//! Process-wide map from target address to its running probe. `start`
//! publishes the entry and blocks on the probe loop, `stop` fires the
//! cancel handle, `cleanup` releases metric registrations and subscriber
//! channels. Every control plane gates on `exists` before `start` and
//! pairs each `start` with exactly one `cleanup`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::cli::Request;
use crate::error::TcpProbeError;
use crate::metrics::{self, StatsCollector};
use crate::probe::Client;

/// Per-target context derived by every control plane: an optional interval
/// string and a JSON-encoded label object, both passed through verbatim.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub interval: Option<String>,
    pub labels: Option<String>,
}

impl Overrides {
    /// Parsed interval override. Unparsable or zero values silently fall
    /// back to the request default.
    pub fn interval(&self) -> Option<Duration> {
        self.interval
            .as_deref()
            .and_then(|s| humantime::parse_duration(s).ok())
            .filter(|d| !d.is_zero())
    }
}

struct Entry {
    cancel: CancellationToken,
    client: Arc<Client>,
    collector: StatsCollector,
}

#[derive(Default)]
pub struct Supervisor {
    targets: DashMap<String, Entry>,
}

impl Supervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Run a probe for `target`: publish the registry entry, register the
    /// metric collector, then block the caller until the probe loop exits.
    /// A concurrent duplicate is rejected here even if the caller's
    /// `exists` gate raced.
    pub async fn start(
        &self,
        parent: &CancellationToken,
        target: &str,
        req: Arc<Request>,
        overrides: Overrides,
    ) {
        let (token, client, collector) = match self.targets.entry(target.to_string()) {
            MapEntry::Occupied(_) => {
                warn!("{}: {}", TcpProbeError::TargetExist, target);
                return;
            }
            MapEntry::Vacant(slot) => {
                let token = parent.child_token();
                let client = Arc::new(Client::new(req, target));
                let collector = StatsCollector::new(
                    target,
                    overrides.labels.as_deref(),
                    client.stats_handle(),
                );
                slot.insert(Entry {
                    cancel: token.clone(),
                    client: Arc::clone(&client),
                    collector: collector.clone(),
                });
                (token, client, collector)
            }
        };

        // registration happens outside the map guard; stop/exists stay
        // callable while the probe runs
        metrics::register(&collector);
        client.probe(token, overrides.interval()).await;
    }

    /// Fire the target's cancel handle. Non-blocking and idempotent; the
    /// entry itself stays until `cleanup`.
    pub fn stop(&self, target: &str) {
        if let Some(entry) = self.targets.get(target) {
            entry.cancel.cancel();
        }
    }

    /// Release everything `start` acquired: the metric registration, the
    /// subscriber channels and the registry entry. Idempotent.
    pub fn cleanup(&self, target: &str) {
        if let Some((_, entry)) = self.targets.remove(target) {
            metrics::unregister(&entry.collector);
            entry.client.close_subscribers();
        }
    }

    pub fn exists(&self, target: &str) -> bool {
        self.targets.contains_key(target)
    }

    pub fn client(&self, target: &str) -> Option<Arc<Client>> {
        self.targets.get(target).map(|entry| Arc::clone(&entry.client))
    }
}

/// Scoped cleanup: runs `Supervisor::cleanup` when dropped, so teardown
/// happens exactly once per `start` even if the probe task unwinds.
pub struct CleanupGuard {
    tp: Arc<Supervisor>,
    target: String,
}

impl CleanupGuard {
    pub fn new(tp: Arc<Supervisor>, target: impl Into<String>) -> Self {
        Self {
            tp,
            target: target.into(),
        }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.tp.cleanup(&self.target);
    }
}
