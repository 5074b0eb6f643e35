//! Kubernetes control plane.
//!
//! Periodically lists pods in the configured namespace and starts probes
//! for newly observed Running pods carrying the `tcpprobe/*` annotations.
//! A watcher subscription stops the departed pod's targets on delete,
//! using the pod IP remembered at admission. Reconcile and delete handling
//! are plain methods so tests can drive them with constructed pod objects.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::Client as KubeClient;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::Request;
use crate::error::{Result, TcpProbeError};
use crate::supervisor::{CleanupGuard, Overrides, Supervisor};

const TARGETS_ANNOTATION: &str = "tcpprobe/targets";
const INTERVAL_ANNOTATION: &str = "tcpprobe/interval";
const LABELS_ANNOTATION: &str = "tcpprobe/labels";

pub struct Informer {
    // pod name -> pod ip, remembered for delete-time target derivation
    pods: DashMap<String, String>,
}

impl Informer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pods: DashMap::new(),
        })
    }

    /// Connect to the cluster and spawn the list loop and the delete
    /// watcher. Fails only when no client configuration is available.
    pub async fn start(
        self: Arc<Self>,
        token: CancellationToken,
        tp: Arc<Supervisor>,
        req: Arc<Request>,
    ) -> Result<()> {
        let client = KubeClient::try_default()
            .await
            .map_err(|err| TcpProbeError::Kubernetes(err.to_string()))?;
        let api: Api<Pod> = Api::namespaced(client, &req.namespace);

        {
            let informer = Arc::clone(&self);
            let api = api.clone();
            let token = token.clone();
            let tp = Arc::clone(&tp);
            let req = Arc::clone(&req);
            tokio::spawn(async move {
                loop {
                    match api.list(&Default::default()).await {
                        Ok(pods) => informer.reconcile(pods.items, &token, &tp, &req),
                        Err(err) => {
                            if token.is_cancelled() {
                                return;
                            }
                            warn!("pod list: {}", err);
                            tokio::select! {
                                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                                _ = token.cancelled() => return,
                            }
                            continue;
                        }
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                        _ = token.cancelled() => return,
                    }
                }
            });
        }

        {
            let informer = Arc::clone(&self);
            let tp = Arc::clone(&tp);
            tokio::spawn(async move {
                loop {
                    let mut stream = watcher::watcher(api.clone(), watcher::Config::default()).boxed();
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => return,
                            event = stream.try_next() => match event {
                                Ok(Some(Event::Delete(pod))) => informer.handle_delete(&pod, &tp),
                                Ok(Some(_)) => {}
                                Ok(None) => break,
                                Err(err) => {
                                    warn!("pod watch: {}", err);
                                    break;
                                }
                            }
                        }
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        _ = token.cancelled() => return,
                    }
                }
            });
        }

        info!("kubernetes control plane started");
        Ok(())
    }

    /// Start probes for newly observed Running pods. Each target follows
    /// the standard exists-gate, start-then-cleanup pattern on its own
    /// task.
    pub fn reconcile(
        &self,
        pods: Vec<Pod>,
        token: &CancellationToken,
        tp: &Arc<Supervisor>,
        req: &Arc<Request>,
    ) {
        for pod in pods {
            let name = match pod.metadata.name.clone() {
                Some(name) => name,
                None => continue,
            };
            if self.pods.contains_key(&name) {
                continue;
            }

            let phase = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.clone())
                .unwrap_or_default();
            if phase != "Running" {
                continue;
            }

            let ip = pod
                .status
                .as_ref()
                .and_then(|s| s.pod_ip.clone())
                .unwrap_or_default();
            self.pods.insert(name.clone(), ip.clone());

            let annotations = pod.metadata.annotations.clone().unwrap_or_default();
            for target in annotation_targets(&annotations, &ip) {
                if tp.exists(&target) {
                    warn!("{}: {}", TcpProbeError::TargetExist, target);
                    continue;
                }

                let overrides = Overrides {
                    interval: annotations.get(INTERVAL_ANNOTATION).cloned(),
                    labels: annotations.get(LABELS_ANNOTATION).cloned(),
                };
                let tp = Arc::clone(tp);
                let req = Arc::clone(req);
                let token = token.clone();
                let pod_name = name.clone();

                info!("pod: {}, target: {} has been added", pod_name, target);
                tokio::spawn(async move {
                    let _cleanup = CleanupGuard::new(Arc::clone(&tp), target.as_str());
                    tp.start(&token, &target, req, overrides).await;
                });
            }
        }
    }

    /// Stop every target the departed pod contributed, re-derived with the
    /// IP remembered at admission, then forget the pod.
    pub fn handle_delete(&self, pod: &Pod, tp: &Supervisor) {
        let name = match pod.metadata.name.as_deref() {
            Some(name) => name,
            None => return,
        };
        let ip = match self.pods.remove(name) {
            Some((_, ip)) => ip,
            None => return,
        };

        let annotations = pod.metadata.annotations.clone().unwrap_or_default();
        for target in annotation_targets(&annotations, &ip) {
            info!("pod: {}, target: {} has been deleted", name, target);
            tp.stop(&target);
        }
    }
}

/// Parse the `tcpprobe/targets` annotation: `;;`-delimited entries with
/// the literal `PODIP` replaced by the workload address.
fn annotation_targets(annotations: &BTreeMap<String, String>, pod_ip: &str) -> Vec<String> {
    match annotations.get(TARGETS_ANNOTATION) {
        Some(raw) => raw
            .replace("PODIP", pod_ip)
            .split(";;")
            .map(|t| t.to_string())
            .collect(),
        None => Vec::new(),
    }
}
