//! Output-side state: partitioned device configs, their last-published
//! caches, and the lookup caches pool resolution leans on.
//!
//! The worker is the only writer. Readers get deep copies, never references
//! into live maps.

use std::collections::{BTreeMap, HashMap, HashSet};

use k8s_openapi::api::core::v1::{
    ConfigMap, Endpoints, Namespace, Node, Pod, Secret, Service,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use parking_lot::Mutex;

use crate::api::{
    ExternalDNS, IngressLink, Ipam, IpSpec, LbPolicy, Route, TLSProfile, TransportServer,
    VirtualServer,
};
use crate::model::{GtmConfig, LtmConfig, PoolMember, ResourceConfig};

/// One service port's resolved members, keyed by how pools may reference it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub(crate) struct PortRef {
    pub name: String,
    pub port: i32,
}

/// A flattened service port, as declared on the Service itself.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct SvcPortSpec {
    pub name: String,
    pub port: i32,
    pub node_port: i32,
    pub target_port: crate::api::PortId,
}

/// Everything pool resolution needs about one service, rebuilt whenever the
/// service or its endpoints change.
#[derive(Clone, Debug, Default)]
pub(crate) struct PoolMembersInfo {
    pub service_type: String,
    pub port_spec: Vec<SvcPortSpec>,
    pub members_map: HashMap<PortRef, Vec<PoolMember>>,
}

/// Identity of a source object folded into some config.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ResourceRef {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

/// NodePortLocal annotation payload published by the CNI on each pod.
#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize)]
pub(crate) struct NplAnnotation {
    #[serde(rename = "podPort")]
    pub pod_port: i32,
    #[serde(rename = "nodeIP")]
    pub node_ip: String,
    #[serde(rename = "nodePort")]
    pub node_port: i32,
}

/// Hosts already claimed per `host + path`, shared with the status writer so
/// a rejected claimer can report which object won.
#[derive(Debug, Default)]
pub(crate) struct ProcessedHostPath {
    pub processed_hosts_path_map: Mutex<HashMap<String, Time>>,
}

#[derive(Debug, Default)]
pub(crate) struct ResourceStore {
    pub ltm: LtmConfig,
    ltm_cache: LtmConfig,
    pub gtm: GtmConfig,
    gtm_cache: GtmConfig,

    pub pool_mem_cache: HashMap<(String, String), PoolMembersInfo>,
    pub npl_store: HashMap<(String, String), Vec<NplAnnotation>>,
    pub processed_native_resources: HashSet<ResourceRef>,
    /// Allocation state keyed by request key, mirrored from the IPAM status.
    pub ipam_context: HashMap<String, IpSpec>,
    pub host_path: ProcessedHostPath,

    pub default_partition: String,
    pub default_route_domain: i32,
    pub share_nodes: bool,
}

impl ResourceStore {
    pub(crate) fn new(default_partition: &str) -> Self {
        Self {
            default_partition: default_partition.to_string(),
            ..Default::default()
        }
    }

    /// The live resource map for a partition, creating the partition on
    /// first touch.
    pub(crate) fn partition_resource_map(
        &mut self,
        partition: &str,
    ) -> &mut BTreeMap<String, ResourceConfig> {
        &mut self.ltm.entry(partition.to_string()).or_default().resources
    }

    pub(crate) fn get_virtual_server(
        &self,
        partition: &str,
        name: &str,
    ) -> Option<&ResourceConfig> {
        self.ltm.get(partition)?.resources.get(name)
    }

    /// Drop one virtual server; empty partitions vanish with their last
    /// config so the device-side partition can be pruned.
    pub(crate) fn delete_virtual_server(&mut self, partition: &str, name: &str) {
        if let Some(cfg) = self.ltm.get_mut(partition) {
            cfg.resources.remove(name);
            if cfg.resources.is_empty() {
                self.ltm.remove(partition);
            }
        }
    }

    /// True when the live config diverged from what was last handed to the
    /// publisher.
    pub(crate) fn is_dirty(&self) -> bool {
        self.ltm != self.ltm_cache || self.gtm != self.gtm_cache
    }

    pub(crate) fn update_caches(&mut self) {
        self.ltm_cache = self.ltm.clone();
        self.gtm_cache = self.gtm.clone();
    }

    /// Deep-copy snapshot for the publisher.
    pub(crate) fn snapshot(&self) -> (LtmConfig, GtmConfig) {
        (self.ltm.clone(), self.gtm.clone())
    }
}

macro_rules! namespaced_map {
    ($map:expr, $ns:expr) => {
        $map.range(($ns.to_string(), String::new())..)
            .take_while(move |((n, _), _)| n == $ns)
            .map(|(_, v)| v)
    };
}

/// The worker's own copy of every watched object, keyed `(namespace, name)`.
/// BTreeMaps keep iteration deterministic, which keeps derived names and
/// rule order deterministic.
#[derive(Debug, Default)]
pub(crate) struct ResourceIndex {
    pub routes: BTreeMap<(String, String), Route>,
    pub virtual_servers: BTreeMap<(String, String), VirtualServer>,
    pub transport_servers: BTreeMap<(String, String), TransportServer>,
    pub tls_profiles: BTreeMap<(String, String), TLSProfile>,
    pub policies: BTreeMap<(String, String), LbPolicy>,
    pub ingress_links: BTreeMap<(String, String), IngressLink>,
    pub external_dns: BTreeMap<(String, String), ExternalDNS>,
    pub ipams: BTreeMap<(String, String), Ipam>,
    pub secrets: BTreeMap<(String, String), Secret>,
    pub services: BTreeMap<(String, String), Service>,
    pub endpoints: BTreeMap<(String, String), Endpoints>,
    pub pods: BTreeMap<(String, String), Pod>,
    pub config_maps: BTreeMap<(String, String), ConfigMap>,
    pub nodes: BTreeMap<String, Node>,
    pub namespaces: BTreeMap<String, Namespace>,
}

impl ResourceIndex {
    pub(crate) fn routes_in_namespace<'a>(
        &'a self,
        ns: &'a str,
    ) -> impl Iterator<Item = &'a Route> + 'a {
        namespaced_map!(self.routes, ns)
    }

    pub(crate) fn virtual_servers_in_namespace<'a>(
        &'a self,
        ns: &'a str,
    ) -> impl Iterator<Item = &'a VirtualServer> + 'a {
        namespaced_map!(self.virtual_servers, ns)
    }

    pub(crate) fn transport_servers_in_namespace<'a>(
        &'a self,
        ns: &'a str,
    ) -> impl Iterator<Item = &'a TransportServer> + 'a {
        namespaced_map!(self.transport_servers, ns)
    }

    pub(crate) fn tls_profiles_in_namespace<'a>(
        &'a self,
        ns: &'a str,
    ) -> impl Iterator<Item = &'a TLSProfile> + 'a {
        namespaced_map!(self.tls_profiles, ns)
    }

    pub(crate) fn config_maps_in_namespace<'a>(
        &'a self,
        ns: &'a str,
    ) -> impl Iterator<Item = &'a ConfigMap> + 'a {
        namespaced_map!(self.config_maps, ns)
    }

    /// Drop everything indexed under a namespace. Used when a watched
    /// namespace stops matching the label selector.
    pub(crate) fn purge_namespace(&mut self, ns: &str) {
        let keep = |key: &(String, String)| key.0 != ns;
        self.routes.retain(|k, _| keep(k));
        self.virtual_servers.retain(|k, _| keep(k));
        self.transport_servers.retain(|k, _| keep(k));
        self.tls_profiles.retain(|k, _| keep(k));
        self.policies.retain(|k, _| keep(k));
        self.ingress_links.retain(|k, _| keep(k));
        self.external_dns.retain(|k, _| keep(k));
        self.secrets.retain(|k, _| keep(k));
        self.services.retain(|k, _| keep(k));
        self.endpoints.retain(|k, _| keep(k));
        self.pods.retain(|k, _| keep(k));
        self.config_maps.retain(|k, _| keep(k));
    }
}
