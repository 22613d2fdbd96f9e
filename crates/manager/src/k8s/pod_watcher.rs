//! Lazily consistent view of the pods scheduled to this node.

use std::collections::HashMap;
use std::collections::HashSet;
use std::time::Duration;

use dashmap::DashMap;
use error_stack::Report;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::watcher::watcher;
use kube::runtime::watcher::Config;
use kube::runtime::watcher::Event;
use kube::Client;
use tokio::select;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::k8s::pod_info;
use crate::k8s::types::KubernetesError;

/// Watches pods with `spec.nodeName == <local host>` and keeps them in a
/// local map keyed by uid. Readers tolerate eventual consistency: a pod
/// may linger briefly after deletion and vice versa.
pub struct PodWatcher {
    client: Client,
    node_name: String,
    store: DashMap<String, Pod>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl PodWatcher {
    pub fn new(client: Client, node_name: String) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        Self {
            client,
            node_name,
            store: DashMap::new(),
            ready_tx,
            ready_rx,
        }
    }

    /// Block until the first full list of node pods has been received.
    pub async fn wait_until_ready(&self) {
        let mut rx = self.ready_rx.clone();
        // Err means the sender is gone, in which case ready never comes
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Run the watch loop until cancelled, restarting the stream on
    /// failure.
    pub async fn run(&self, cancellation_token: CancellationToken) {
        info!(node = %self.node_name, "starting pod watcher");
        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("pod watcher shutdown requested");
                    return;
                }
                result = self.watch_pods() => {
                    match result {
                        Ok(()) => warn!("pod watch stream ended unexpectedly, restarting"),
                        Err(e) => {
                            error!("pod watch failed: {e:?}");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            }
        }
    }

    async fn watch_pods(&self) -> Result<(), Report<KubernetesError>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let config = Config::default().fields(&format!("spec.nodeName={}", self.node_name));

        let mut stream = watcher(api, config).boxed();
        let mut relist: HashSet<String> = HashSet::new();

        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Init) => relist.clear(),
                Ok(Event::InitApply(pod)) => {
                    let uid = pod_info::pod_uid(&pod);
                    if !uid.is_empty() {
                        relist.insert(uid.clone());
                        self.store.insert(uid, pod);
                    }
                }
                Ok(Event::InitDone) => {
                    self.store.retain(|uid, _| relist.contains(uid));
                    relist.clear();
                    let _ = self.ready_tx.send(true);
                }
                Ok(Event::Apply(pod)) => {
                    let uid = pod_info::pod_uid(&pod);
                    if !uid.is_empty() {
                        self.store.insert(uid, pod);
                    }
                }
                Ok(Event::Delete(pod)) => {
                    let uid = pod_info::pod_uid(&pod);
                    self.store.remove(&uid);
                }
                Err(e) => {
                    return Err(Report::new(KubernetesError::WatchFailed {
                        message: format!("Watch stream error: {e}"),
                    }));
                }
            }
        }

        Ok(())
    }

    /// GPU-requiring pods on this node that have not terminated, keyed by
    /// uid.
    pub fn active_pods(&self) -> HashMap<String, Pod> {
        self.store
            .iter()
            .filter(|entry| {
                !pod_info::pod_is_terminated(entry.value())
                    && pod_info::is_gpu_required_pod(entry.value())
            })
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Every pod currently known on this node, regardless of phase.
    pub fn pods_on_node(&self) -> Vec<Pod> {
        self.store.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Look up one pod, falling back to the API server on a cache miss.
    pub async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Pod, Report<KubernetesError>> {
        let cached = self.store.iter().find_map(|entry| {
            let pod = entry.value();
            if pod_info::pod_namespace(pod) == namespace && pod_info::pod_name(pod) == name {
                Some(pod.clone())
            } else {
                None
            }
        });

        let pod = match cached {
            Some(pod) => pod,
            None => {
                let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
                api.get(name).await.map_err(|e| {
                    Report::new(KubernetesError::PodNotFound {
                        namespace: namespace.to_string(),
                        name: name.to_string(),
                    })
                    .attach_printable(format!("Kubernetes API error: {e}"))
                })?
            }
        };

        if pod_info::pod_is_terminated(&pod) {
            return Err(Report::new(KubernetesError::PodTerminated {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }));
        }
        if !pod_info::is_gpu_required_pod(&pod) {
            return Err(Report::new(KubernetesError::NotGpuRequired {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }));
        }
        Ok(pod)
    }

    /// Test seam: watchers in unit tests are fed directly instead of
    /// through an API stream.
    #[cfg(test)]
    pub(crate) fn insert_for_test(&self, pod: Pod) {
        let uid = pod_info::pod_uid(&pod);
        self.store.insert(uid, pod);
        let _ = self.ready_tx.send(true);
    }

    #[cfg(test)]
    pub(crate) fn remove_for_test(&self, uid: &str) {
        self.store.remove(uid);
    }
}
