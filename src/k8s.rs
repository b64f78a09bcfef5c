//! Kubernetes watches.
//!
//! Every watched kind runs its own watcher task and funnels events into the
//! single worker queue as upsert/delete tasks. Relists are flattened into
//! plain upserts; the worker's index makes re-applying an unchanged object
//! cheap, so no diffing happens here.

use std::fmt::Debug;

use futures::TryStreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Namespace, Node, Pod, Secret, Service};
use kube::{
    runtime::{self, watcher, WatchStreamExt},
    Resource, ResourceExt as _,
};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::api::{
    ExternalDNS, IngressLink, Ipam, LbPolicy, Route, TLSProfile, TransportServer, VirtualServer,
};
use crate::queue::{Payload, Task, TaskQueue};

const LAST_APPLIED_CONFIG: &str = "kubectl.kubernetes.io/last-applied-configuration";

pub(crate) trait WatchedResource:
    Clone + Debug + DeserializeOwned + Resource<DynamicType = ()> + Send + Sync + 'static
{
    fn static_kind() -> &'static str;

    fn payload(obj: Self) -> Payload;

    /// Strip fields that churn without carrying meaning.
    fn modify(&mut self) {
        self.annotations_mut().remove(LAST_APPLIED_CONFIG);
        self.managed_fields_mut().clear();
    }
}

macro_rules! watched {
    ($ty:ty, $kind:literal, $variant:ident) => {
        impl WatchedResource for $ty {
            fn static_kind() -> &'static str {
                $kind
            }

            fn payload(obj: Self) -> Payload {
                Payload::$variant(Box::new(obj))
            }
        }
    };
}

watched!(Route, "Route", Route);
watched!(VirtualServer, "VirtualServer", VirtualServer);
watched!(TransportServer, "TransportServer", TransportServer);
watched!(TLSProfile, "TLSProfile", TlsProfile);
watched!(LbPolicy, "Policy", Policy);
watched!(IngressLink, "IngressLink", IngressLink);
watched!(ExternalDNS, "ExternalDNS", ExternalDns);
watched!(Ipam, "IPAM", Ipam);
watched!(Secret, "Secret", Secret);
watched!(Service, "Service", Service);
watched!(Endpoints, "Endpoints", Endpoints);
watched!(Pod, "Pod", Pod);
watched!(ConfigMap, "ConfigMap", ConfigMap);
watched!(Node, "Node", Node);
watched!(Namespace, "Namespace", Namespace);

/// Run one kind's watch until its stream dies, feeding the worker queue.
pub(crate) async fn run_watch<T: WatchedResource>(
    api: kube::Api<T>,
    config: watcher::Config,
    queue: TaskQueue,
) -> Result<(), watcher::Error> {
    let stream = runtime::watcher(api, config.any_semantic())
        .default_backoff()
        .modify(T::modify);
    let mut stream = std::pin::pin!(stream);

    debug!(kind = T::static_kind(), "watch starting");
    while let Some(event) = stream.try_next().await? {
        match event {
            watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => {
                queue.push(Task::upsert(T::payload(obj)));
            }
            watcher::Event::Delete(obj) => {
                queue.push(Task::delete(T::payload(obj)));
            }
            watcher::Event::Init => {
                debug!(kind = T::static_kind(), "watch listing");
            }
            watcher::Event::InitDone => {
                debug!(kind = T::static_kind(), "watch list complete");
            }
        }
    }
    debug!(kind = T::static_kind(), "watch exiting");
    Ok(())
}

/// True when the watch failed because the kind isn't installed. CRD kinds
/// are optional; their watches are skipped with a warning instead of
/// crashing the process.
pub(crate) fn is_api_not_found(e: &watcher::Error) -> bool {
    matches!(
        e,
        watcher::Error::InitialListFailed(kube::Error::Api(e)) if e.code == 404,
    )
}
