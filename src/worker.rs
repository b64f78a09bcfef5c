//! The reconciliation loop.
//!
//! A single worker task owns all mutable state: the resource index, the
//! derived config store, the extended-spec store and the IPAM context. Watch
//! events arrive on one queue and are folded into the store one at a time;
//! whenever the queue drains with the store dirty, a numbered declaration is
//! handed to the publisher. Errors split two ways, the way the handlers
//! document them: a malformed resource is logged and skipped, a dependency
//! that may still appear (an unallocated address, a missing policy write)
//! requeues the event with backoff.

use std::collections::{BTreeSet, HashMap};

use anyhow::{anyhow, Result};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, Service};
use tracing::{debug, error, info, warn};

use crate::api::{
    ExternalDNS, HealthMonitor, IngressLink, Ipam, LbPolicy, TLSProfile, TransportServer,
    VirtualServer, HTTP_TRAFFIC_ALLOW, HTTP_TRAFFIC_REDIRECT, LB_SVC_IPAM_LABEL_ANNOTATION,
    LB_SVC_POLICY_ANNOTATION, NPL_POD_ANNOTATION, PortId,
};
use crate::assoc;
use crate::extended::{
    ExtendedSpecStore, RouteGroupChange, RouteGroupConfig, EXTENDED_SPEC_KEY,
};
use crate::ipam::{self, IpRequest, IpamManager};
use crate::members::{self, PoolMemberMode};
use crate::model::{
    format_ingress_link_name, format_lb_service_name, format_pool_name, ConfigOrigin, GslbPool,
    Monitor, Pool, Protocol, ResourceConfig, WideIp, DEFAULT_SNAT,
};
use crate::publish::Publisher;
use crate::queue::{Op, Payload, ResourceKind, Task, TaskQueue, TaskReceiver};
use crate::status::StatusSink;
use crate::store::{NplAnnotation, ResourceIndex, ResourceRef, ResourceStore};

/// Vendor ingress controllers expose their readiness endpoint here; the port
/// carries the health monitor, never a virtual.
const NGINX_MONITOR_PORT: i32 = 8081;

/// Startup knobs that never change after construction.
pub(crate) struct ControllerOptions {
    pub default_partition: String,
    pub default_route_domain: i32,
    pub share_nodes: bool,
    pub mode: PoolMemberMode,
    /// (namespace, name) of the global extended-spec ConfigMap.
    pub global_cm: (String, String),
    /// Services present at startup; processing this many ends the warm-up.
    pub initial_svc_count: i64,
}

pub(crate) struct Controller {
    pub(crate) store: ResourceStore,
    pub(crate) index: ResourceIndex,
    pub(crate) extended: ExtendedSpecStore,
    pub(crate) ipam: Option<IpamManager>,
    pub(crate) mode: PoolMemberMode,
    pub(crate) queue: TaskQueue,
    pub(crate) publisher: Publisher,
    pub(crate) status: Box<dyn StatusSink>,
    pub(crate) global_cm: (String, String),

    /// While warming, only Namespaces and Services are folded in; everything
    /// else waits so the first declaration is derived from a full picture.
    pub(crate) init_state: bool,
    initial_svc_count: i64,
}

fn meta_key(meta: &kube::api::ObjectMeta) -> (String, String) {
    (
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

/// True while some live virtual still rides the host group behind an IPAM
/// `_hg` key, which blocks releasing its address.
fn host_group_referenced(index: &ResourceIndex, key: &str) -> bool {
    index
        .virtual_servers
        .values()
        .any(|vs| !vs.spec.host_group.is_empty() && ipam::host_group_key(&vs.spec.host_group) == key)
        || index
            .transport_servers
            .values()
            .any(|ts| !ts.spec.host_group.is_empty() && ipam::host_group_key(&ts.spec.host_group) == key)
}

/// Fold an LbPolicy's settings onto a config's virtual.
pub(crate) fn apply_policy(cfg: &mut ResourceConfig, plc: &LbPolicy) {
    let spec = &plc.spec;
    if !spec.snat.is_empty() {
        cfg.virtual_server.snat = spec.snat.clone();
    }
    if !spec.waf.is_empty() {
        cfg.virtual_server.waf = spec.waf.clone();
    }
    if !spec.persistence_profile.is_empty() {
        cfg.virtual_server.persistence_profile = spec.persistence_profile.clone();
    }
    cfg.virtual_server
        .log_profiles
        .extend(spec.log_profiles.iter().cloned());
    cfg.virtual_server
        .irules
        .extend(spec.irule_list.iter().cloned());
}

impl Controller {
    pub(crate) fn new(
        opts: ControllerOptions,
        queue: TaskQueue,
        publisher: Publisher,
        status: Box<dyn StatusSink>,
        ipam: Option<IpamManager>,
    ) -> Self {
        let mut store = ResourceStore::new(&opts.default_partition);
        store.default_route_domain = opts.default_route_domain;
        store.share_nodes = opts.share_nodes;
        Self {
            store,
            index: ResourceIndex::default(),
            extended: ExtendedSpecStore::default(),
            ipam,
            mode: opts.mode,
            queue,
            publisher,
            status,
            global_cm: opts.global_cm,
            init_state: true,
            initial_svc_count: opts.initial_svc_count,
        }
    }

    pub(crate) async fn run(mut self, mut rx: TaskReceiver) {
        if let Some(mgr) = &self.ipam {
            let index = &self.index;
            mgr.migrate(&mut self.store.ipam_context, |k| {
                host_group_referenced(index, k)
            })
            .await;
        }
        if self.initial_svc_count <= 0 {
            self.init_state = false;
        }

        while let Some(task) = rx.next().await {
            self.process(task).await;

            if rx.is_drained() && self.store.is_dirty() {
                self.init_state = false;
                let req_id = self.publisher.publish(&mut self.store);
                info!(req_id, "declaration published");
            }
        }
        debug!("event queue closed, worker exiting");
    }

    pub(crate) async fn process(&mut self, task: Task) {
        let kind = task.payload.kind();
        if self.init_state && kind != ResourceKind::Namespace {
            if kind != ResourceKind::Service {
                self.queue.requeue(task);
                return;
            }
            self.initial_svc_count -= 1;
            if self.initial_svc_count <= 0 {
                self.init_state = false;
            }
        }

        let _timer = crate::metrics::scoped_timer!("sync_time", "kind" => kind.as_str());
        if let Err(e) = self.dispatch(&task).await {
            warn!(
                kind = kind.as_str(),
                namespace = %task.payload.namespace(),
                name = %task.payload.name(),
                err = %e,
                "sync failed, requeueing"
            );
            self.queue.requeue(task);
        }
    }

    async fn dispatch(&mut self, task: &Task) -> Result<()> {
        let is_delete = task.op == Op::Delete;
        match &task.payload {
            Payload::Route(r) => {
                let route = (**r).clone();
                let key = meta_key(&route.metadata);
                let rref = ResourceRef {
                    kind: ResourceKind::Route.as_str().to_string(),
                    namespace: key.0.clone(),
                    name: key.1.clone(),
                };
                if is_delete {
                    self.index.routes.remove(&key);
                    self.store.processed_native_resources.remove(&rref);
                    self.delete_host_path_map_entry(&route);
                } else {
                    let created = !self.index.routes.contains_key(&key);
                    self.index.routes.insert(key.clone(), route);
                    if created && self.store.processed_native_resources.contains(&rref) {
                        // already folded in by a sibling's group sync
                        return Ok(());
                    }
                }
                if let Some(group) = self.extended.group_key_for_namespace(&key.0) {
                    self.process_routes(&group, false).await?;
                }
                Ok(())
            }

            Payload::VirtualServer(v) => {
                let vs = (**v).clone();
                let key = meta_key(&vs.metadata);
                let rref = ResourceRef {
                    kind: ResourceKind::VirtualServer.as_str().to_string(),
                    namespace: key.0.clone(),
                    name: key.1.clone(),
                };
                if is_delete {
                    self.index.virtual_servers.remove(&key);
                    self.store.processed_native_resources.remove(&rref);
                } else {
                    let created = !self.index.virtual_servers.contains_key(&key);
                    self.index.virtual_servers.insert(key, vs.clone());
                    if created && self.store.processed_native_resources.contains(&rref) {
                        return Ok(());
                    }
                }
                self.process_virtual_servers(&vs, is_delete).await
            }

            Payload::TransportServer(t) => {
                let ts = (**t).clone();
                let key = meta_key(&ts.metadata);
                if is_delete {
                    self.index.transport_servers.remove(&key);
                } else {
                    self.index.transport_servers.insert(key, ts.clone());
                }
                self.process_transport_servers(&ts, is_delete).await
            }

            Payload::TlsProfile(p) => {
                let profile = (**p).clone();
                let key = meta_key(&profile.metadata);
                if is_delete {
                    self.index.tls_profiles.remove(&key);
                } else {
                    self.index.tls_profiles.insert(key.clone(), profile);
                }
                let virtuals: Vec<VirtualServer> =
                    assoc::virtuals_for_tls_profile(&self.index, &key.0, &key.1)
                        .into_iter()
                        .cloned()
                        .collect();
                for vs in virtuals {
                    self.process_virtual_servers(&vs, false).await?;
                }
                Ok(())
            }

            Payload::Secret(s) => {
                let secret = (**s).clone();
                let key = meta_key(&secret.metadata);
                if is_delete {
                    self.index.secrets.remove(&key);
                } else {
                    self.index.secrets.insert(key.clone(), secret);
                }
                if let Some(group) = self.extended.group_key_for_namespace(&key.0) {
                    self.process_routes(&group, false).await?;
                }
                let virtuals: Vec<VirtualServer> = self
                    .tls_profiles_for_secret(&key.0, &key.1)
                    .iter()
                    .flat_map(|p| {
                        let name = p.metadata.name.clone().unwrap_or_default();
                        assoc::virtuals_for_tls_profile(&self.index, &key.0, &name)
                            .into_iter()
                            .cloned()
                            .collect::<Vec<_>>()
                    })
                    .collect();
                for vs in virtuals {
                    self.process_virtual_servers(&vs, false).await?;
                }
                Ok(())
            }

            Payload::Policy(p) => {
                let plc = (**p).clone();
                let key = meta_key(&plc.metadata);
                if is_delete {
                    self.index.policies.remove(&key);
                } else {
                    self.index.policies.insert(key.clone(), plc);
                }
                self.process_policy_dependents(&key.0, &key.1).await
            }

            Payload::IngressLink(il) => {
                let link = (**il).clone();
                let key = meta_key(&link.metadata);
                if is_delete {
                    self.index.ingress_links.remove(&key);
                } else {
                    self.index.ingress_links.insert(key, link.clone());
                }
                self.process_ingress_link(&link, is_delete).await
            }

            Payload::ExternalDns(e) => {
                let edns = (**e).clone();
                let key = meta_key(&edns.metadata);
                if is_delete {
                    self.index.external_dns.remove(&key);
                } else {
                    self.index.external_dns.insert(key, edns.clone());
                }
                self.process_external_dns(&edns, is_delete);
                Ok(())
            }

            Payload::Ipam(i) => {
                let record = (**i).clone();
                let key = meta_key(&record.metadata);
                if is_delete {
                    self.index.ipams.remove(&key);
                } else {
                    self.index.ipams.insert(key, record.clone());
                }
                self.process_ipam(&record).await;
                Ok(())
            }

            Payload::Service(s) => {
                let svc = (**s).clone();
                let key = meta_key(&svc.metadata);
                if is_delete {
                    self.index.services.remove(&key);
                } else {
                    self.index.services.insert(key, svc.clone());
                }
                self.process_service(&svc, is_delete);
                if service_type(&svc) == "LoadBalancer" {
                    return self.process_lb_services(&svc, is_delete).await;
                }
                if self.init_state {
                    return Ok(());
                }
                self.process_service_dependents(&svc, is_delete).await
            }

            Payload::Endpoints(e) => {
                let eps = (**e).clone();
                let key = meta_key(&eps.metadata);
                if is_delete {
                    self.index.endpoints.remove(&key);
                } else {
                    self.index.endpoints.insert(key.clone(), eps);
                }
                // endpoints share their service's name
                let Some(svc) = self.index.services.get(&key).cloned() else {
                    return Ok(());
                };
                self.process_service(&svc, false);
                if service_type(&svc) == "LoadBalancer" {
                    return self.process_lb_services(&svc, false).await;
                }
                self.update_pool_members_for_service(&key.0, &key.1);
                Ok(())
            }

            Payload::Pod(p) => {
                let pod = (**p).clone();
                let key = meta_key(&pod.metadata);
                if is_delete {
                    self.index.pods.remove(&key);
                } else {
                    self.index.pods.insert(key, pod.clone());
                }
                self.process_pod(&pod, is_delete);
                let Some(svc) = members::service_for_pod(&self.index, &pod).cloned() else {
                    return Ok(());
                };
                self.process_service(&svc, false);
                if service_type(&svc) == "LoadBalancer" {
                    return self.process_lb_services(&svc, is_delete).await;
                }
                if self.init_state {
                    return Ok(());
                }
                self.process_service_dependents(&svc, false).await
            }

            Payload::ConfigMap(c) => {
                let cm = (**c).clone();
                let key = meta_key(&cm.metadata);
                if is_delete {
                    self.index.config_maps.remove(&key);
                } else {
                    self.index.config_maps.insert(key, cm.clone());
                }
                self.process_config_map(&cm, is_delete).await
            }

            Payload::Node(n) => {
                let node = (**n).clone();
                let name = node.metadata.name.clone().unwrap_or_default();
                if is_delete {
                    self.index.nodes.remove(&name);
                } else {
                    self.index.nodes.insert(name, node);
                }
                // member lists filter on the node inventory, so every cached
                // entry may have changed
                self.rebuild_pool_member_cache();
                self.update_all_pool_members();
                Ok(())
            }

            Payload::Namespace(n) => {
                let ns = (**n).clone();
                self.process_namespace(&ns, is_delete).await
            }
        }
    }

    async fn process_namespace(&mut self, ns: &Namespace, is_delete: bool) -> Result<()> {
        let name = ns.metadata.name.clone().unwrap_or_default();
        if is_delete {
            let virtuals: Vec<VirtualServer> = self
                .index
                .virtual_servers_in_namespace(&name)
                .cloned()
                .collect();
            let transports: Vec<TransportServer> = self
                .index
                .transport_servers_in_namespace(&name)
                .cloned()
                .collect();
            let group = self.extended.group_key_for_namespace(&name);

            self.index.namespaces.remove(&name);
            self.index.purge_namespace(&name);
            self.refresh_namespace_labels();
            debug!(namespace = %name, "removed namespace from scope");

            for vs in virtuals {
                self.process_virtual_servers(&vs, true).await?;
            }
            for ts in transports {
                self.process_transport_servers(&ts, true).await?;
            }
            if let Some(group) = group {
                let _ = self.process_routes(&group, true).await;
            }
            return Ok(());
        }

        let before = self.extended.group_key_for_namespace(&name);
        self.index.namespaces.insert(name.clone(), ns.clone());
        self.refresh_namespace_labels();
        let after = self.extended.group_key_for_namespace(&name);
        debug!(namespace = %name, "added namespace to scope");

        if self.init_state {
            return Ok(());
        }
        if let Some(group) = &after {
            self.process_routes(group, false).await?;
        }
        if before != after {
            if let Some(group) = before {
                self.process_routes(&group, false).await?;
            }
        }
        Ok(())
    }

    async fn process_config_map(&mut self, cm: &ConfigMap, is_delete: bool) -> Result<()> {
        let (namespace, name) = meta_key(&cm.metadata);
        let data = cm.data.clone().unwrap_or_default();

        let changes: Vec<RouteGroupChange> = if (namespace.as_str(), name.as_str())
            == (self.global_cm.0.as_str(), self.global_cm.1.as_str())
        {
            if is_delete {
                warn!("global extended ConfigMap deleted, keeping last accepted configuration");
                return Ok(());
            }
            let old_default = self.extended.default_group().cloned();
            match self.extended.process_global(&data) {
                Ok(mut changes) => {
                    self.refresh_namespace_labels();
                    let new_default = self.extended.default_group().cloned();
                    if new_default != old_default {
                        changes.extend(self.default_group_changes(old_default, new_default));
                    }
                    changes
                }
                Err(e) => {
                    error!(err = %e, "invalid extended spec, keeping prior state");
                    return Ok(());
                }
            }
        } else if is_delete {
            let fallback: Vec<_> = self
                .index
                .config_maps_in_namespace(&namespace)
                .filter(|c| c.metadata.name.as_deref() != Some(name.as_str()))
                .filter(|c| c.data.as_ref().is_some_and(|d| d.contains_key(EXTENDED_SPEC_KEY)))
                .map(|c| {
                    (
                        c.metadata.name.clone().unwrap_or_default(),
                        c.metadata.creation_timestamp.clone(),
                        c.data.clone().unwrap_or_default(),
                    )
                })
                .collect();
            self.extended
                .remove_local(&namespace, &name, fallback)
                .into_iter()
                .collect()
        } else if data.contains_key(EXTENDED_SPEC_KEY) {
            match self.extended.process_local(
                &namespace,
                &name,
                cm.metadata.creation_timestamp.clone(),
                &data,
            ) {
                Ok(change) => change.into_iter().collect(),
                Err(e) => {
                    error!(
                        %namespace, configmap = %name, err = %e,
                        "invalid local extended spec, keeping prior state"
                    );
                    return Ok(());
                }
            }
        } else {
            return Ok(());
        };

        for change in changes {
            match change {
                RouteGroupChange::Created(key) | RouteGroupChange::Updated(key) => {
                    self.process_routes(&key, false).await?;
                }
                RouteGroupChange::Renamed { key, old } => {
                    self.delete_route_group_virtuals(&old);
                    self.process_routes(&key, false).await?;
                }
                RouteGroupChange::Deleted { key, old } => {
                    self.delete_route_group_virtuals(&old);
                    let _ = self.process_routes(&key, true).await;
                }
            }
        }
        Ok(())
    }

    /// Per-namespace changes after the defaultRouteGroup fallback itself
    /// changed. Only namespaces no explicit group claims are affected.
    fn default_group_changes(
        &self,
        old: Option<RouteGroupConfig>,
        new: Option<RouteGroupConfig>,
    ) -> Vec<RouteGroupChange> {
        let mut changes = Vec::new();
        for ns in self.index.namespaces.keys() {
            if self.extended.group_keys().any(|k| k == ns) {
                continue;
            }
            if matches!(self.extended.group_key_for_namespace(ns), Some(key) if key != *ns) {
                continue;
            }
            let change = match (&old, &new) {
                (None, Some(_)) => RouteGroupChange::Created(ns.clone()),
                (Some(o), None) => RouteGroupChange::Deleted {
                    key: ns.clone(),
                    old: o.clone(),
                },
                (Some(o), Some(n))
                    if o.vserver_name != n.vserver_name || o.vserver_addr != n.vserver_addr =>
                {
                    RouteGroupChange::Renamed {
                        key: ns.clone(),
                        old: o.clone(),
                    }
                }
                (Some(_), Some(_)) => RouteGroupChange::Updated(ns.clone()),
                (None, None) => continue,
            };
            changes.push(change);
        }
        changes
    }

    /// Recompute which namespaces each label-scoped route group claims.
    fn refresh_namespace_labels(&mut self) {
        let extended = &self.extended;
        let labels: Vec<String> = extended
            .group_keys()
            .filter_map(|key| extended.effective(key))
            .filter_map(|config| config.scope_label)
            .collect();

        let mut map = HashMap::new();
        for label in labels {
            let Some((k, v)) = label.split_once('=') else {
                error!(%label, "malformed namespace label, expected key=value");
                continue;
            };
            let namespaces: BTreeSet<String> = self
                .index
                .namespaces
                .iter()
                .filter(|(_, ns)| {
                    ns.metadata
                        .labels
                        .as_ref()
                        .is_some_and(|l| l.get(k).map(String::as_str) == Some(v))
                })
                .map(|(name, _)| name.clone())
                .collect();
            map.insert(label, namespaces);
        }
        self.extended.inverted_namespace_label_map = map;
    }

    /// Rebuild the member cache entry for one service from its endpoints.
    fn process_service(&mut self, svc: &Service, is_delete: bool) {
        let key = meta_key(&svc.metadata);
        if is_delete {
            self.store.pool_mem_cache.remove(&key);
            return;
        }
        let eps = self.index.endpoints.get(&key).cloned().unwrap_or_default();
        let info = members::build_pool_members_info(svc, &eps, &self.index);
        self.store.pool_mem_cache.insert(key, info);
    }

    /// Record (or drop) a pod's NodePortLocal port mappings.
    fn process_pod(&mut self, pod: &Pod, is_delete: bool) {
        let key = meta_key(&pod.metadata);
        if is_delete {
            self.store.npl_store.remove(&key);
            return;
        }
        let Some(raw) = pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(NPL_POD_ANNOTATION))
        else {
            return;
        };
        match serde_json::from_str::<Vec<NplAnnotation>>(raw) {
            Ok(annotations) => {
                self.store.npl_store.insert(key, annotations);
            }
            Err(e) => warn!(pod = %key.1, err = %e, "unparseable nodeportlocal annotation"),
        }
    }

    async fn process_service_dependents(&mut self, svc: &Service, is_delete: bool) -> Result<()> {
        let (namespace, name) = meta_key(&svc.metadata);

        if let Some(group) = self.extended.group_key_for_namespace(&namespace) {
            self.process_routes(&group, false).await?;
        }

        let virtuals = self.virtuals_for_service(&namespace, &name);
        for vs in virtuals {
            self.process_virtual_servers(&vs, false).await?;
        }
        let transports = self.transports_for_service(&namespace, &name);
        for ts in transports {
            self.process_transport_servers(&ts, false).await?;
        }
        let links = self.ingress_links_for_service(svc);
        for link in links {
            // a deleted service tears the link's virtuals down with it
            self.process_ingress_link(&link, is_delete).await?;
        }
        Ok(())
    }

    async fn process_policy_dependents(&mut self, namespace: &str, name: &str) -> Result<()> {
        let qualified = format!("{namespace}/{name}");
        let groups: Vec<String> = {
            let extended = &self.extended;
            extended
                .group_keys()
                .filter(|key| {
                    extended
                        .effective(key)
                        .is_some_and(|config| config.policy == qualified)
                })
                .cloned()
                .collect()
        };
        for group in groups {
            let _ = self.process_routes(&group, false).await;
        }

        let virtuals: Vec<VirtualServer> = self
            .index
            .virtual_servers_in_namespace(namespace)
            .filter(|vs| vs.spec.policy_name == name)
            .cloned()
            .collect();
        for vs in virtuals {
            self.process_virtual_servers(&vs, false).await?;
        }

        let transports: Vec<TransportServer> = self
            .index
            .transport_servers_in_namespace(namespace)
            .filter(|ts| ts.spec.policy_name == name)
            .cloned()
            .collect();
        for ts in transports {
            self.process_transport_servers(&ts, false).await?;
        }

        let lb_services: Vec<Service> = self
            .services_in_namespace(namespace)
            .filter(|svc| {
                service_type(svc) == "LoadBalancer"
                    && svc
                        .metadata
                        .annotations
                        .as_ref()
                        .and_then(|a| a.get(LB_SVC_POLICY_ANNOTATION))
                        .map(String::as_str)
                        == Some(name)
            })
            .cloned()
            .collect();
        for svc in lb_services {
            self.process_lb_services(&svc, false).await?;
        }
        Ok(())
    }

    pub(crate) async fn process_lb_services(&mut self, svc: &Service, is_delete: bool) -> Result<()> {
        if self.ipam.is_none() {
            error!("ipam is not enabled, unable to process type=LoadBalancer services");
            return Ok(());
        }
        let (namespace, name) = meta_key(&svc.metadata);
        let Some(ipam_label) = svc
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(LB_SVC_IPAM_LABEL_ANNOTATION))
            .cloned()
        else {
            error!(
                %namespace, service = %name,
                "missing {LB_SVC_IPAM_LABEL_ANNOTATION} annotation, unable to process"
            );
            return Ok(());
        };

        let key = ipam::svc_key(&namespace, &name);
        let ip = if is_delete {
            self.release_ip(&ipam_label, "", &key).await
        } else {
            match self.request_ip(&ipam_label, "", &key).await {
                IpRequest::NotEnabled => {
                    debug!("ipam resource not available");
                    return Ok(());
                }
                IpRequest::InvalidInput => {
                    debug!(label = %ipam_label, service = %name, "invalid ipam label for service");
                    return Ok(());
                }
                IpRequest::NotRequested => {
                    return Err(anyhow!("unable to make ipam request, will be re-requested"))
                }
                IpRequest::Requested => {
                    debug!(%namespace, service = %name, "address requested for service");
                    return Ok(());
                }
                IpRequest::Allocated(addr) => addr,
            }
        };
        self.status.lb_service_ingress(svc, &ip, is_delete).await;

        let partition = self.store.default_partition.clone();
        let policy = svc
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(LB_SVC_POLICY_ANNOTATION))
            .and_then(|plc| self.index.policies.get(&(namespace.clone(), plc.clone())))
            .cloned();

        for port in svc.spec.iter().flat_map(|s| s.ports.iter().flatten()) {
            let rs_name = format_lb_service_name(&namespace, &name, &ip, port.port);
            if is_delete {
                self.store.delete_virtual_server(&partition, &rs_name);
                continue;
            }
            debug!(service = %name, port = port.port, "processing type=LoadBalancer service port");

            let mut cfg = ResourceConfig::default();
            cfg.meta.origin = ConfigOrigin::TransportServer;
            cfg.meta.namespace = namespace.clone();
            cfg.meta
                .base_resources
                .insert(format!("{namespace}/{name}"), "Service".to_string());
            cfg.virtual_server.partition = partition.clone();
            cfg.virtual_server.enabled = true;
            cfg.virtual_server.name = rs_name.clone();
            cfg.virtual_server.ip_protocol = port
                .protocol
                .clone()
                .unwrap_or_else(|| "TCP".to_string())
                .to_lowercase();
            cfg.virtual_server.set_virtual_address(&ip, port.port);
            if let Some(plc) = &policy {
                apply_policy(&mut cfg, plc);
            }

            let pool_port = PortId::Number(port.port);
            let pool = Pool {
                name: format_pool_name(&name, &pool_port, &namespace),
                partition: partition.clone(),
                service_name: name.clone(),
                service_namespace: namespace.clone(),
                service_port: pool_port,
                ..Default::default()
            };
            cfg.virtual_server.pool_name = pool.name.clone();
            cfg.pools.push(pool);

            members::update_pool_members(self.mode, &self.store, &self.index, &mut cfg, &namespace);
            self.store
                .partition_resource_map(&partition)
                .insert(rs_name, cfg);
        }
        Ok(())
    }

    pub(crate) async fn process_ingress_link(
        &mut self,
        link: &IngressLink,
        is_delete: bool,
    ) -> Result<()> {
        let (namespace, name) = meta_key(&link.metadata);
        let key = ipam::il_key(&namespace, &name);

        let ip = if self.ipam.is_some() {
            if is_delete && link.spec.virtual_server_address.is_empty() {
                self.release_ip(&link.spec.ipam_label, "", &key).await
            } else if !link.spec.virtual_server_address.is_empty() {
                link.spec.virtual_server_address.clone()
            } else {
                match self.request_ip(&link.spec.ipam_label, "", &key).await {
                    IpRequest::NotEnabled => {
                        debug!("ipam resource not available");
                        return Ok(());
                    }
                    IpRequest::InvalidInput => {
                        debug!(
                            label = %link.spec.ipam_label, link = %name,
                            "invalid ipam label for ingress link"
                        );
                        return Ok(());
                    }
                    IpRequest::NotRequested => {
                        return Err(anyhow!("unable to make ipam request, will be re-requested"))
                    }
                    IpRequest::Requested => {
                        debug!(%namespace, link = %name, "address requested for ingress link");
                        return Ok(());
                    }
                    IpRequest::Allocated(addr) => {
                        self.status.ingress_link(link, &addr).await;
                        addr
                    }
                }
            }
        } else {
            if link.spec.virtual_server_address.is_empty() {
                return Err(anyhow!("no address on ingress link and ipam not enabled"));
            }
            link.spec.virtual_server_address.clone()
        };

        let partition = self.store.default_partition.clone();
        if is_delete {
            let prefix = format!("ingress_link_{name}_");
            let stale: Vec<String> = self
                .store
                .partition_resource_map(&partition)
                .keys()
                .filter(|rs_name| rs_name.starts_with(&prefix))
                .cloned()
                .collect();
            let mut hostnames = Vec::new();
            for rs_name in stale {
                if let Some(cfg) = self.store.get_virtual_server(&partition, &rs_name) {
                    hostnames.extend(cfg.meta.hosts.iter().cloned());
                }
                self.store.delete_virtual_server(&partition, &rs_name);
            }
            if !hostnames.is_empty() {
                self.process_associated_external_dns(&hostnames);
            }
            return Ok(());
        }

        let Some(svc) = self.kic_service_for_ingress_link(link) else {
            debug!(link = %name, "no service matches the ingress link selector");
            return Ok(());
        };
        let svc_name = svc.metadata.name.clone().unwrap_or_default();

        let mut monitor_target = NGINX_MONITOR_PORT;
        if self.mode == PoolMemberMode::NodePort {
            monitor_target = node_port_for(&svc, NGINX_MONITOR_PORT);
            if monitor_target == 0 {
                error!(service = %svc_name, "no node port found for the readiness monitor port");
            }
        }

        for port in svc.spec.iter().flat_map(|s| s.ports.iter().flatten()) {
            if port.port == NGINX_MONITOR_PORT {
                continue;
            }
            let rs_name = format_ingress_link_name(&name, port.port);

            let mut cfg = ResourceConfig::default();
            cfg.meta.origin = ConfigOrigin::IngressLink;
            cfg.meta.namespace = namespace.clone();
            cfg.meta
                .base_resources
                .insert(format!("{namespace}/{name}"), "IngressLink".to_string());
            if !link.spec.host.is_empty() {
                cfg.meta.hosts.push(link.spec.host.clone());
            }
            cfg.virtual_server.partition = partition.clone();
            cfg.virtual_server.enabled = true;
            cfg.virtual_server.name = rs_name.clone();
            cfg.virtual_server.mode = "standard".to_string();
            cfg.virtual_server.snat = DEFAULT_SNAT.to_string();
            cfg.virtual_server.irules = link.spec.i_rules.clone();
            cfg.virtual_server.set_virtual_address(&ip, port.port);

            let pool_port = PortId::Number(port.port);
            let mut pool = Pool {
                name: format_pool_name(&svc_name, &pool_port, &namespace),
                partition: partition.clone(),
                service_name: svc_name.clone(),
                service_namespace: namespace.clone(),
                service_port: pool_port,
                ..Default::default()
            };
            let monitor_name = format!("{}_monitor", pool.name);
            cfg.monitors.push(Monitor {
                name: monitor_name.clone(),
                partition: partition.clone(),
                monitor_type: "http".to_string(),
                interval: 20,
                timeout: 10,
                send: "GET /nginx-ready HTTP/1.1\r\n".to_string(),
                recv: String::new(),
                target_port: monitor_target,
            });
            pool.monitor_names.push(monitor_name);
            cfg.virtual_server.pool_name = pool.name.clone();
            cfg.pools.push(pool);

            members::update_pool_members(self.mode, &self.store, &self.index, &mut cfg, &namespace);
            let hostnames = cfg.meta.hosts.clone();
            self.store
                .partition_resource_map(&partition)
                .insert(rs_name, cfg);
            if !hostnames.is_empty() {
                self.process_associated_external_dns(&hostnames);
            }
        }
        Ok(())
    }

    pub(crate) fn process_external_dns(&mut self, edns: &ExternalDNS, is_delete: bool) {
        let partition = self.store.default_partition.clone();
        let domain = edns.spec.domain_name.clone();
        let uid = edns.metadata.uid.clone().unwrap_or_default();

        if let Some(existing) = self
            .store
            .gtm
            .get(&partition)
            .and_then(|gtm| gtm.wide_ips.get(&domain))
        {
            if existing.uid != uid {
                error!(%domain, "another ExternalDNS with the same domain name exists");
                return;
            }
        }

        if is_delete {
            if let Some(gtm) = self.store.gtm.get_mut(&partition) {
                gtm.wide_ips.remove(&domain);
            }
            return;
        }

        let mut wip = WideIp {
            domain_name: domain.clone(),
            record_type: default_if_empty(&edns.spec.dns_record_type, "A"),
            lb_method: default_if_empty(&edns.spec.load_balance_method, "round-robin"),
            uid,
            pools: Vec::new(),
        };
        debug!(%domain, "processing wide ip");

        for pl in &edns.spec.pools {
            let pool_name = format!("{domain}_{partition}");
            let mut pool = GslbPool {
                name: pool_name.clone(),
                record_type: default_if_empty(&pl.dns_record_type, "A"),
                lb_method: default_if_empty(&pl.load_balance_method, "round-robin"),
                priority_order: pl.priority_order,
                data_server: pl.data_server_name.clone(),
                members: Vec::new(),
                monitors: Vec::new(),
            };

            for (part, config) in &self.store.ltm {
                for (vs_name, cfg) in &config.resources {
                    if !cfg.meta.hosts.iter().any(|h| h == &domain) {
                        continue;
                    }
                    // insecure virtuals that redirect or allow never join the
                    // wide ip; their secure sibling does
                    if cfg.meta.protocol == Protocol::Http
                        && (cfg.meta.http_traffic == HTTP_TRAFFIC_ALLOW
                            || cfg.meta.http_traffic == HTTP_TRAFFIC_REDIRECT)
                    {
                        continue;
                    }
                    let member = format!("/{part}/Shared/{vs_name}");
                    if !pool.members.is_empty() && vs_name.starts_with("ingress_link_") {
                        // one member per link, preferring its https virtual
                        if vs_name.ends_with("_443") {
                            pool.members[0] = member;
                        }
                        continue;
                    }
                    debug!(%member, "adding wide ip pool member");
                    pool.members.push(member);
                }
            }

            if let Some(monitor) = &pl.monitor {
                if !monitor.monitor_type.is_empty() {
                    pool.monitors.push(gslb_monitor(&pool_name, monitor));
                }
            }
            wip.pools.push(pool);
        }

        self.store
            .gtm
            .entry(partition)
            .or_default()
            .wide_ips
            .insert(domain, wip);
    }

    /// Re-derive the wide ips whose domains appeared on a changed virtual.
    pub(crate) fn process_associated_external_dns(&mut self, hostnames: &[String]) {
        let matching: Vec<ExternalDNS> = self
            .index
            .external_dns
            .values()
            .filter(|edns| hostnames.contains(&edns.spec.domain_name))
            .cloned()
            .collect();
        for edns in matching {
            self.process_external_dns(&edns, false);
        }
    }

    /// Fold new allocation rows into the context and re-derive the resources
    /// waiting on them.
    async fn process_ipam(&mut self, ipam: &Ipam) {
        let changed = ipam::changed_allocations(&self.store.ipam_context, ipam);
        for spec in changed {
            self.store
                .ipam_context
                .insert(spec.key.clone(), spec.clone());
            let Some((prefix, kind)) = spec.key.rsplit_once('_') else {
                continue;
            };
            let outcome = match kind {
                "hg" => self.reprocess_host_group(prefix).await,
                "host" => match prefix.split_once('/') {
                    Some((namespace, host)) => self.reprocess_host(namespace, host).await,
                    None => Ok(()),
                },
                "ts" => match prefix.split_once('/') {
                    Some((namespace, name)) => {
                        let ts = self
                            .index
                            .transport_servers
                            .get(&(namespace.to_string(), name.to_string()))
                            .cloned();
                        match ts {
                            Some(ts) => self.process_transport_servers(&ts, false).await,
                            None => Ok(()),
                        }
                    }
                    None => Ok(()),
                },
                "il" => match prefix.split_once('/') {
                    Some((namespace, name)) => {
                        let link = self
                            .index
                            .ingress_links
                            .get(&(namespace.to_string(), name.to_string()))
                            .cloned();
                        match link {
                            Some(link) => self.process_ingress_link(&link, false).await,
                            None => Ok(()),
                        }
                    }
                    None => Ok(()),
                },
                "svc" => match prefix.split_once('/') {
                    Some((namespace, name)) => {
                        let svc = self
                            .index
                            .services
                            .get(&(namespace.to_string(), name.to_string()))
                            .cloned();
                        match svc {
                            Some(svc) => self.process_lb_services(&svc, false).await,
                            None => Ok(()),
                        }
                    }
                    None => Ok(()),
                },
                _ => {
                    error!(key = %spec.key, "invalid key while processing ipam status");
                    Ok(())
                }
            };
            if let Err(e) = outcome {
                error!(key = %spec.key, err = %e, "unable to process ipam allocation");
            }
        }
    }

    async fn reprocess_host_group(&mut self, host_group: &str) -> Result<()> {
        let vs = self
            .index
            .virtual_servers
            .values()
            .find(|vs| vs.spec.host_group == host_group)
            .cloned();
        if let Some(vs) = vs {
            self.process_virtual_servers(&vs, false).await?;
        }
        let ts = self
            .index
            .transport_servers
            .values()
            .find(|ts| ts.spec.host_group == host_group)
            .cloned();
        if let Some(ts) = ts {
            self.process_transport_servers(&ts, false).await?;
        }
        Ok(())
    }

    async fn reprocess_host(&mut self, namespace: &str, host: &str) -> Result<()> {
        let vs = self
            .index
            .virtual_servers_in_namespace(namespace)
            .find(|vs| vs.spec.host == host)
            .cloned();
        if let Some(vs) = vs {
            self.process_virtual_servers(&vs, false).await?;
        }
        Ok(())
    }

    pub(crate) async fn request_ip(&mut self, ipam_label: &str, host: &str, key: &str) -> IpRequest {
        let Some(mgr) = &self.ipam else {
            return IpRequest::NotEnabled;
        };
        let index = &self.index;
        mgr.request_ip(&mut self.store.ipam_context, ipam_label, host, key, |k| {
            host_group_referenced(index, k)
        })
        .await
    }

    pub(crate) async fn release_ip(&mut self, ipam_label: &str, host: &str, key: &str) -> String {
        let Some(mgr) = &self.ipam else {
            return String::new();
        };
        let index = &self.index;
        mgr.release_ip(&mut self.store.ipam_context, ipam_label, host, key, |k| {
            host_group_referenced(index, k)
        })
        .await
    }

    /// Refresh members on every config whose pools point at the service.
    fn update_pool_members_for_service(&mut self, namespace: &str, svc_name: &str) {
        let entries: Vec<(String, String)> = self
            .store
            .ltm
            .iter()
            .flat_map(|(partition, config)| {
                config
                    .resources
                    .iter()
                    .filter(|(_, cfg)| {
                        cfg.pools.iter().any(|p| {
                            p.service_name == svc_name && p.service_namespace == namespace
                        })
                    })
                    .map(move |(name, _)| (partition.clone(), name.clone()))
            })
            .collect();
        for (partition, rs_name) in entries {
            let Some(mut cfg) = self.store.get_virtual_server(&partition, &rs_name).cloned()
            else {
                continue;
            };
            let cfg_namespace = cfg.meta.namespace.clone();
            members::update_pool_members(self.mode, &self.store, &self.index, &mut cfg, &cfg_namespace);
            self.store
                .partition_resource_map(&partition)
                .insert(rs_name, cfg);
        }
    }

    fn update_all_pool_members(&mut self) {
        let entries: Vec<(String, String)> = self
            .store
            .ltm
            .iter()
            .flat_map(|(partition, config)| {
                config
                    .resources
                    .keys()
                    .map(move |name| (partition.clone(), name.clone()))
            })
            .collect();
        for (partition, rs_name) in entries {
            let Some(mut cfg) = self.store.get_virtual_server(&partition, &rs_name).cloned()
            else {
                continue;
            };
            let cfg_namespace = cfg.meta.namespace.clone();
            members::update_pool_members(self.mode, &self.store, &self.index, &mut cfg, &cfg_namespace);
            self.store
                .partition_resource_map(&partition)
                .insert(rs_name, cfg);
        }
    }

    fn rebuild_pool_member_cache(&mut self) {
        let services: Vec<Service> = self.index.services.values().cloned().collect();
        for svc in services {
            self.process_service(&svc, false);
        }
    }

    pub(crate) fn virtuals_for_service(&self, namespace: &str, name: &str) -> Vec<VirtualServer> {
        self.index
            .virtual_servers
            .values()
            .filter(|vs| {
                let vs_namespace = vs.metadata.namespace.as_deref().unwrap_or_default();
                vs.spec.pools.iter().any(|pool| {
                    pool.service == name
                        && if pool.service_namespace.is_empty() {
                            vs_namespace == namespace
                        } else {
                            pool.service_namespace == namespace
                        }
                })
            })
            .cloned()
            .collect()
    }

    fn transports_for_service(&self, namespace: &str, name: &str) -> Vec<TransportServer> {
        self.index
            .transport_servers_in_namespace(namespace)
            .filter(|ts| ts.spec.pool.service == name)
            .cloned()
            .collect()
    }

    fn ingress_links_for_service(&self, svc: &Service) -> Vec<IngressLink> {
        let (namespace, _) = meta_key(&svc.metadata);
        let labels = svc.metadata.labels.clone().unwrap_or_default();
        self.index
            .ingress_links
            .range((namespace.clone(), String::new())..)
            .take_while(|((ns, _), _)| *ns == namespace)
            .map(|(_, link)| link)
            .filter(|link| {
                link.spec
                    .selector
                    .iter()
                    .any(|(k, v)| labels.get(k) == Some(v))
            })
            .cloned()
            .collect()
    }

    /// The ingress-controller service a link binds, the oldest one when the
    /// selector matches several.
    fn kic_service_for_ingress_link(&self, link: &IngressLink) -> Option<Service> {
        let (namespace, _) = meta_key(&link.metadata);
        let mut matches: Vec<&Service> = self
            .services_in_namespace(&namespace)
            .filter(|svc| {
                let labels = svc.metadata.labels.clone().unwrap_or_default();
                !link.spec.selector.is_empty()
                    && link
                        .spec
                        .selector
                        .iter()
                        .all(|(k, v)| labels.get(k) == Some(v))
            })
            .collect();
        matches.sort_by(|a, b| {
            (a.metadata.creation_timestamp.as_ref().map(|t| &t.0), &a.metadata.name)
                .cmp(&(b.metadata.creation_timestamp.as_ref().map(|t| &t.0), &b.metadata.name))
        });
        matches.first().map(|svc| (*svc).clone())
    }

    fn services_in_namespace<'a>(
        &'a self,
        namespace: &'a str,
    ) -> impl Iterator<Item = &'a Service> + 'a {
        self.index
            .services
            .range((namespace.to_string(), String::new())..)
            .take_while(move |((ns, _), _)| ns == namespace)
            .map(|(_, svc)| svc)
    }

    fn tls_profiles_for_secret(&self, namespace: &str, secret: &str) -> Vec<TLSProfile> {
        self.index
            .tls_profiles_in_namespace(namespace)
            .filter(|profile| {
                let tls = &profile.spec.tls;
                tls.client_ssl == secret
                    || tls.server_ssl == secret
                    || tls.client_ssls.iter().any(|s| s == secret)
                    || tls.server_ssls.iter().any(|s| s == secret)
            })
            .cloned()
            .collect()
    }

    pub(crate) fn get_policy(&self, namespace: &str, name: &str) -> Option<LbPolicy> {
        self.index
            .policies
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }
}

fn service_type(svc: &Service) -> &str {
    svc.spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .unwrap_or_default()
}

fn node_port_for(svc: &Service, port: i32) -> i32 {
    svc.spec
        .iter()
        .flat_map(|s| s.ports.iter().flatten())
        .find(|p| p.port == port)
        .and_then(|p| p.node_port)
        .unwrap_or_default()
}

fn default_if_empty(value: &str, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}

fn gslb_monitor(pool_name: &str, monitor: &HealthMonitor) -> Monitor {
    let mut out = Monitor {
        name: format!("{pool_name}_monitor"),
        partition: "Common".to_string(),
        monitor_type: monitor.monitor_type.clone(),
        interval: monitor.interval,
        timeout: monitor.timeout,
        ..Default::default()
    };
    if monitor.monitor_type == "http" || monitor.monitor_type == "https" {
        out.send = monitor.send.clone();
        out.recv = monitor.recv.clone();
    }
    out
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use crate::api::{
        EdnsPool, ExternalDNSSpec, IngressLinkSpec, IpamSpec, PortId, TransportServerSpec, TsPool,
        VirtualServerSpec, VsPool,
    };
    use crate::ipam::mem::MemIpam;
    use crate::publish;
    use crate::queue;
    use crate::status::NullStatus;

    pub(crate) fn controller() -> Controller {
        build(None, Box::new(NullStatus))
    }

    pub(crate) fn controller_with_ipam(ipam: Option<IpamManager>) -> Controller {
        build(ipam, Box::new(NullStatus))
    }

    pub(crate) fn controller_with_status(status: Box<dyn StatusSink>) -> Controller {
        build(None, status)
    }

    fn build(ipam: Option<IpamManager>, status: Box<dyn StatusSink>) -> Controller {
        let (queue, _rx) = queue::channel();
        let (publisher, _decls) = publish::channel();
        let mut controller = Controller::new(
            ControllerOptions {
                default_partition: "test".to_string(),
                default_route_domain: 0,
                share_nodes: false,
                mode: PoolMemberMode::Cluster,
                global_cm: ("kube-system".to_string(), "deckhand-config".to_string()),
                initial_svc_count: 0,
            },
            queue,
            publisher,
            status,
            ipam,
        );
        controller.init_state = false;
        controller
    }

    pub(crate) fn service(namespace: &str, name: &str, ports: &[i32]) -> Service {
        Service {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(
                    ports
                        .iter()
                        .map(|&port| ServicePort {
                            port,
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn virtual_server(name: &str, host: &str, addr: &str) -> VirtualServer {
        let mut vs = VirtualServer::new(
            name,
            VirtualServerSpec {
                host: host.to_string(),
                virtual_server_address: addr.to_string(),
                pools: vec![VsPool {
                    service: "foo".to_string(),
                    service_port: PortId::Number(80),
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        vs.metadata.namespace = Some("default".to_string());
        vs
    }

    #[tokio::test]
    async fn warming_defers_everything_but_services() {
        let mut controller = controller();
        controller.init_state = true;
        controller.initial_svc_count = 1;

        let vs = virtual_server("cafe", "cafe.example.com", "10.8.0.1");
        controller
            .process(Task::upsert(Payload::VirtualServer(Box::new(vs))))
            .await;
        assert!(controller.index.virtual_servers.is_empty());
        assert!(controller.init_state);

        let svc = service("default", "foo", &[80]);
        controller
            .process(Task::upsert(Payload::Service(Box::new(svc))))
            .await;
        assert!(!controller.init_state);
        assert!(controller
            .store
            .pool_mem_cache
            .contains_key(&("default".to_string(), "foo".to_string())));
    }

    #[tokio::test]
    async fn already_processed_virtuals_skip_their_create_event() {
        let mut controller = controller();
        controller.store.processed_native_resources.insert(ResourceRef {
            kind: "VirtualServer".to_string(),
            namespace: "default".to_string(),
            name: "cafe".to_string(),
        });

        let vs = virtual_server("cafe", "cafe.example.com", "10.8.0.1");
        controller
            .process(Task::upsert(Payload::VirtualServer(Box::new(vs.clone()))))
            .await;
        assert!(controller
            .index
            .virtual_servers
            .contains_key(&("default".to_string(), "cafe".to_string())));
        assert!(controller.store.ltm.is_empty());

        // the next event on a known resource is processed normally
        controller
            .process(Task::upsert(Payload::VirtualServer(Box::new(vs))))
            .await;
        assert!(controller
            .store
            .get_virtual_server("test", "crd_10_8_0_1_80")
            .is_some());
    }

    #[tokio::test]
    async fn lb_service_gets_a_virtual_per_port() {
        let mem = MemIpam::with(Ipam::new("deckhand.ipam", IpamSpec::default()));
        let mut controller =
            controller_with_ipam(Some(IpamManager::new(Box::new(mem.clone()))));

        let mut svc = service("default", "db", &[5432]);
        svc.spec.as_mut().unwrap().type_ = Some("LoadBalancer".to_string());
        svc.metadata.annotations = Some(BTreeMap::from([(
            LB_SVC_IPAM_LABEL_ANNOTATION.to_string(),
            "prod".to_string(),
        )]));
        controller
            .index
            .services
            .insert(("default".to_string(), "db".to_string()), svc.clone());

        // first pass only writes the allocation request
        controller.process_lb_services(&svc, false).await.unwrap();
        assert!(controller.store.ltm.is_empty());

        mem.allocate_all(&["10.8.0.5"]);
        controller.process_lb_services(&svc, false).await.unwrap();
        let cfg = controller
            .store
            .get_virtual_server("test", "vs_lb_svc_default_db_10_8_0_5_5432")
            .unwrap();
        assert_eq!(cfg.virtual_server.destination, "10.8.0.5:5432");
        assert_eq!(cfg.virtual_server.ip_protocol, "tcp");
        assert_eq!(cfg.virtual_server.pool_name, "db_5432_default");

        controller.process_lb_services(&svc, true).await.unwrap();
        assert!(controller
            .store
            .get_virtual_server("test", "vs_lb_svc_default_db_10_8_0_5_5432")
            .is_none());
    }

    #[tokio::test]
    async fn transport_server_builds_an_l4_config() {
        let mut controller = controller();
        let mut ts = TransportServer::new(
            "redis",
            TransportServerSpec {
                virtual_server_address: "10.8.0.7".to_string(),
                virtual_server_port: 6379,
                pool: TsPool {
                    service: "redis".to_string(),
                    service_port: PortId::Number(6379),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        ts.metadata.namespace = Some("default".to_string());

        controller.process_transport_servers(&ts, false).await.unwrap();
        let cfg = controller
            .store
            .get_virtual_server("test", "crd_10_8_0_7_6379")
            .unwrap();
        assert_eq!(cfg.virtual_server.ip_protocol, "tcp");
        assert_eq!(cfg.virtual_server.pool_name, "redis_6379_default");
        assert_eq!(cfg.pools.len(), 1);

        controller.process_transport_servers(&ts, true).await.unwrap();
        assert!(controller
            .store
            .get_virtual_server("test", "crd_10_8_0_7_6379")
            .is_none());
    }

    #[tokio::test]
    async fn ingress_link_binds_the_selected_service() {
        let mut controller = controller();
        let mut link = IngressLink::new(
            "nginx-il",
            IngressLinkSpec {
                virtual_server_address: "10.8.0.9".to_string(),
                host: "il.example.com".to_string(),
                selector: BTreeMap::from([("app".to_string(), "ingress".to_string())]),
                ..Default::default()
            },
        );
        link.metadata.namespace = Some("default".to_string());

        let mut svc = service("default", "nginx", &[80, NGINX_MONITOR_PORT]);
        svc.metadata.labels = Some(BTreeMap::from([(
            "app".to_string(),
            "ingress".to_string(),
        )]));
        controller
            .index
            .services
            .insert(("default".to_string(), "nginx".to_string()), svc);

        controller.process_ingress_link(&link, false).await.unwrap();
        // the readiness port carries a monitor, never a virtual
        assert!(controller
            .store
            .get_virtual_server("test", "ingress_link_nginx-il_8081")
            .is_none());
        let cfg = controller
            .store
            .get_virtual_server("test", "ingress_link_nginx-il_80")
            .unwrap();
        assert_eq!(cfg.meta.hosts, vec!["il.example.com"]);
        assert_eq!(cfg.monitors.len(), 1);
        assert_eq!(cfg.monitors[0].send, "GET /nginx-ready HTTP/1.1\r\n");
        assert_eq!(cfg.virtual_server.snat, DEFAULT_SNAT);

        controller.process_ingress_link(&link, true).await.unwrap();
        assert!(controller
            .store
            .get_virtual_server("test", "ingress_link_nginx-il_80")
            .is_none());
    }

    #[tokio::test]
    async fn wide_ip_members_skip_insecure_allow_virtuals() {
        let mut controller = controller();
        let host = "cafe.example.com".to_string();

        let mut https_cfg = ResourceConfig::default();
        https_cfg.meta.hosts.push(host.clone());
        https_cfg.meta.protocol = Protocol::Https;
        controller
            .store
            .partition_resource_map("test")
            .insert("ose-vserver_443".to_string(), https_cfg);
        let mut http_cfg = ResourceConfig::default();
        http_cfg.meta.hosts.push(host.clone());
        http_cfg.meta.protocol = Protocol::Http;
        http_cfg.meta.http_traffic = HTTP_TRAFFIC_ALLOW.to_string();
        controller
            .store
            .partition_resource_map("test")
            .insert("ose-vserver_80".to_string(), http_cfg);

        let mut edns = ExternalDNS::new(
            "cafe",
            ExternalDNSSpec {
                domain_name: host.clone(),
                pools: vec![EdnsPool {
                    data_server_name: "gslb-server".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        edns.metadata.namespace = Some("default".to_string());
        edns.metadata.uid = Some("uid-1".to_string());

        controller.process_external_dns(&edns, false);
        let gtm = controller.store.gtm.get("test").unwrap();
        let wip = gtm.wide_ips.get(&host).unwrap();
        assert_eq!(wip.record_type, "A");
        assert_eq!(wip.pools[0].members, vec!["/test/Shared/ose-vserver_443"]);

        // another resource claiming the same domain is rejected
        let mut other = edns.clone();
        other.metadata.uid = Some("uid-2".to_string());
        other.spec.load_balance_method = "topology".to_string();
        controller.process_external_dns(&other, false);
        let gtm = controller.store.gtm.get("test").unwrap();
        assert_eq!(gtm.wide_ips.get(&host).unwrap().lb_method, "round-robin");

        controller.process_external_dns(&edns, true);
        assert!(controller.store.gtm.get("test").unwrap().wide_ips.is_empty());
    }
}
