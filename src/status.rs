//! Status write-back to the cluster.
//!
//! Status updates are advisory: a failed write is logged and dropped, never
//! retried through the work queue, so a flapping API server cannot wedge
//! reconciliation. The trait seam lets tests capture updates in memory.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Patch, PatchParams};
use serde_json::json;
use tracing::{debug, warn};

use crate::api::{IngressLink, Route, TransportServer, VirtualServer};

pub(crate) const ROUTER_NAME: &str = "deckhand";

pub(crate) const ADMIT_REASON_OK: &str = "RouteAdmitted";
pub(crate) const ADMIT_REASON_CLAIMED: &str = "HostAlreadyClaimed";

#[async_trait]
pub(crate) trait StatusSink: Send + Sync {
    async fn virtual_server(&self, vs: &VirtualServer, ip: &str, status: &str);
    async fn transport_server(&self, ts: &TransportServer, ip: &str, status: &str);
    async fn ingress_link(&self, il: &IngressLink, ip: &str);
    /// Set the route's admit condition under our router name.
    async fn route_admit(&self, route: &Route, admitted: bool, reason: &str, message: &str);
    /// Record (or clear) an allocated address on a LoadBalancer service.
    async fn lb_service_ingress(&self, svc: &Service, ip: &str, remove: bool);
}

pub(crate) struct KubeStatus {
    client: kube::Client,
}

impl KubeStatus {
    pub(crate) fn new(client: kube::Client) -> Self {
        Self { client }
    }

    async fn patch_status<K>(&self, namespace: &str, name: &str, body: serde_json::Value)
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + serde::de::DeserializeOwned
            + Clone
            + std::fmt::Debug,
        K::DynamicType: Default,
    {
        let api: kube::Api<K> = kube::Api::namespaced(self.client.clone(), namespace);
        let patch = Patch::Merge(body);
        match api
            .patch_status(name, &PatchParams::default(), &patch)
            .await
        {
            Ok(_) => debug!(%namespace, %name, "status updated"),
            // conflicts mean someone raced us; the next sync writes again
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(%namespace, %name, "status update conflict")
            }
            Err(e) => warn!(%namespace, %name, err = %e, "status update failed"),
        }
    }
}

fn meta_names(meta: &kube::api::ObjectMeta) -> (String, String) {
    (
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

#[async_trait]
impl StatusSink for KubeStatus {
    async fn virtual_server(&self, vs: &VirtualServer, ip: &str, status: &str) {
        let (namespace, name) = meta_names(&vs.metadata);
        let body = json!({"status": {"vsAddress": ip, "status": status}});
        self.patch_status::<VirtualServer>(&namespace, &name, body)
            .await;
    }

    async fn transport_server(&self, ts: &TransportServer, ip: &str, status: &str) {
        let (namespace, name) = meta_names(&ts.metadata);
        let body = json!({"status": {"vsAddress": ip, "status": status}});
        self.patch_status::<TransportServer>(&namespace, &name, body)
            .await;
    }

    async fn ingress_link(&self, il: &IngressLink, ip: &str) {
        let (namespace, name) = meta_names(&il.metadata);
        let body = json!({"status": {"vsAddress": ip}});
        self.patch_status::<IngressLink>(&namespace, &name, body)
            .await;
    }

    async fn route_admit(&self, route: &Route, admitted: bool, reason: &str, message: &str) {
        let (namespace, name) = meta_names(&route.metadata);
        let status = if admitted { "True" } else { "False" };
        let body = json!({
            "status": {
                "ingress": [{
                    "host": route.spec.host,
                    "routerName": ROUTER_NAME,
                    "conditions": [{
                        "type": "Admitted",
                        "status": status,
                        "reason": reason,
                        "message": message,
                    }],
                }],
            }
        });
        self.patch_status::<Route>(&namespace, &name, body).await;
    }

    async fn lb_service_ingress(&self, svc: &Service, ip: &str, remove: bool) {
        let (namespace, name) = meta_names(&svc.metadata);
        let ingress = if remove {
            json!([])
        } else {
            json!([{"ip": ip}])
        };
        let body = json!({"status": {"loadBalancer": {"ingress": ingress}}});
        self.patch_status::<Service>(&namespace, &name, body).await;
    }
}

/// Swallows everything. Used by tests and by dry runs.
#[derive(Default)]
pub(crate) struct NullStatus;

#[async_trait]
impl StatusSink for NullStatus {
    async fn virtual_server(&self, _: &VirtualServer, _: &str, _: &str) {}
    async fn transport_server(&self, _: &TransportServer, _: &str, _: &str) {}
    async fn ingress_link(&self, _: &IngressLink, _: &str) {}
    async fn route_admit(&self, _: &Route, _: bool, _: &str, _: &str) {}
    async fn lb_service_ingress(&self, _: &Service, _: &str, _: bool) {}
}

#[cfg(test)]
pub(crate) mod recording {
    use super::*;
    use parking_lot::Mutex;

    /// Captures admit decisions for assertions.
    #[derive(Default)]
    pub(crate) struct RecordingStatus {
        pub admits: Mutex<Vec<(String, bool, String)>>,
        pub addresses: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl StatusSink for std::sync::Arc<RecordingStatus> {
        async fn virtual_server(&self, vs: &VirtualServer, ip: &str, _: &str) {
            let (ns, name) = meta_names(&vs.metadata);
            self.addresses
                .lock()
                .push((format!("{ns}/{name}"), ip.to_string()));
        }

        async fn transport_server(&self, ts: &TransportServer, ip: &str, _: &str) {
            let (ns, name) = meta_names(&ts.metadata);
            self.addresses
                .lock()
                .push((format!("{ns}/{name}"), ip.to_string()));
        }

        async fn ingress_link(&self, il: &IngressLink, ip: &str) {
            let (ns, name) = meta_names(&il.metadata);
            self.addresses
                .lock()
                .push((format!("{ns}/{name}"), ip.to_string()));
        }

        async fn route_admit(&self, route: &Route, admitted: bool, reason: &str, _: &str) {
            let (ns, name) = meta_names(&route.metadata);
            self.admits
                .lock()
                .push((format!("{ns}/{name}"), admitted, reason.to_string()));
        }

        async fn lb_service_ingress(&self, svc: &Service, ip: &str, remove: bool) {
            let (ns, name) = meta_names(&svc.metadata);
            let ip = if remove { String::new() } else { ip.to_string() };
            self.addresses.lock().push((format!("{ns}/{name}"), ip));
        }
    }
}
