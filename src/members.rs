//! Pool member resolution. Three backends, picked once at startup: NodePort
//! (every node exposes the service's node port), Cluster (pod addresses from
//! Endpoints), and NodePortLocal (per-pod node ports advertised by the CNI
//! through pod annotations).

use k8s_openapi::api::core::v1::{Endpoints, Node, Pod, Service};
use tracing::{debug, error};

use crate::api::{PortId, NPL_SVC_ANNOTATION};
use crate::model::{PoolMember, ResourceConfig};
use crate::store::{PoolMembersInfo, PortRef, ResourceIndex, ResourceStore, SvcPortSpec};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum PoolMemberMode {
    NodePort,
    #[default]
    Cluster,
    NodePortLocal,
}

/// Fill in every pool's members on a config. `namespace` is the namespace
/// the config is being derived for; pools pointing at services that vanished
/// from it get an explicit empty member list.
pub(crate) fn update_pool_members(
    mode: PoolMemberMode,
    store: &ResourceStore,
    index: &ResourceIndex,
    cfg: &mut ResourceConfig,
    namespace: &str,
) {
    match mode {
        PoolMemberMode::NodePort => update_for_nodeport(store, index, cfg, namespace),
        PoolMemberMode::Cluster => update_for_cluster(store, cfg, namespace),
        PoolMemberMode::NodePortLocal => update_for_npl(store, index, cfg, namespace),
    }
}

fn update_for_nodeport(
    store: &ResourceStore,
    index: &ResourceIndex,
    cfg: &mut ResourceConfig,
    namespace: &str,
) {
    for pool in &mut cfg.pools {
        let svc_key = (pool.service_namespace.clone(), pool.service_name.clone());
        let info = store.pool_mem_cache.get(&svc_key);
        if info.map_or(true, |i| i.members_map.is_empty()) && pool.service_namespace == namespace {
            pool.members = Some(Vec::new());
            continue;
        }
        let Some(info) = info else { continue };

        if info.service_type != "NodePort" && info.service_type != "LoadBalancer" {
            debug!(
                service = %pool.service_name,
                "service backend is not of NodePort or LoadBalancer type"
            );
        }

        for svc_port in &info.port_spec {
            if svc_port.target_port == pool.service_port {
                cfg.meta.active = true;
                pool.members = Some(endpoints_for_nodeport(
                    index,
                    svc_port.node_port,
                    &pool.node_member_label,
                ));
            }
        }
        if pool.members.is_none() {
            error!(
                service = %pool.service_name,
                port = %pool.service_port,
                "no endpoints for service port"
            );
        }
    }
}

fn update_for_cluster(store: &ResourceStore, cfg: &mut ResourceConfig, namespace: &str) {
    for pool in &mut cfg.pools {
        let svc_key = (pool.service_namespace.clone(), pool.service_name.clone());
        let info = store.pool_mem_cache.get(&svc_key);
        if info.map_or(true, |i| i.members_map.is_empty()) && pool.service_namespace == namespace {
            pool.members = Some(Vec::new());
            continue;
        }
        let Some(info) = info else { continue };

        let (str_val, int_val) = match &pool.service_port {
            PortId::Name(name) => (name.as_str(), 0),
            PortId::Number(port) => ("", *port),
        };
        for (port_ref, members) in &info.members_map {
            // a port matches when either its name or number does
            if port_ref.name != str_val && port_ref.port != int_val {
                continue;
            }
            cfg.meta.active = true;
            pool.members = Some(members.clone());
        }
        if pool.members.is_none() {
            error!(
                service = %pool.service_name,
                port = %pool.service_port,
                "no endpoints for service port"
            );
        }
    }
}

fn update_for_npl(
    store: &ResourceStore,
    index: &ResourceIndex,
    cfg: &mut ResourceConfig,
    namespace: &str,
) {
    for pool in &mut cfg.pools {
        let svc_key = (pool.service_namespace.clone(), pool.service_name.clone());
        let Some(info) = store.pool_mem_cache.get(&svc_key) else {
            continue;
        };
        if info.service_type == "NodePort" {
            debug!(
                service = %pool.service_name,
                "NodePort service backends are not valid in nodeportlocal mode"
            );
            return;
        }
        let pods = pods_for_service(index, namespace, &pool.service_name, true);
        if pods.is_empty() {
            continue;
        }
        for svc_port in &info.port_spec {
            if svc_port.target_port == pool.service_port {
                cfg.meta.active = true;
                pool.members = Some(endpoints_for_npl(store, &svc_port.target_port, &pods));
            }
        }
    }
}

fn endpoints_for_nodeport(
    index: &ResourceIndex,
    node_port: i32,
    node_member_label: &str,
) -> Vec<PoolMember> {
    let nodes = if node_member_label.is_empty() {
        all_nodes(index)
    } else {
        nodes_with_label(index, node_member_label)
    };
    nodes
        .into_iter()
        .filter_map(|node| node_address(&node).map(|addr| PoolMember::new(&addr, node_port)))
        .collect()
}

fn endpoints_for_npl(store: &ResourceStore, target_port: &PortId, pods: &[&Pod]) -> Vec<PoolMember> {
    let mut members = Vec::new();
    for pod in pods {
        let pod_key = (
            pod.metadata.namespace.clone().unwrap_or_default(),
            pod.metadata.name.clone().unwrap_or_default(),
        );
        let Some(annotations) = store.npl_store.get(&pod_key) else {
            continue;
        };
        let pod_port = match target_port {
            // named ports resolve through the pod's container ports
            PortId::Name(name) => pod
                .spec
                .iter()
                .flat_map(|spec| &spec.containers)
                .flat_map(|c| c.ports.iter().flatten())
                .find(|p| p.name.as_deref() == Some(name))
                .map(|p| p.container_port)
                .unwrap_or_default(),
            PortId::Number(port) => *port,
        };
        for ann in annotations {
            if ann.pod_port == pod_port {
                members.push(PoolMember::new(&ann.node_ip, ann.node_port));
            }
        }
    }
    members
}

/// Pods selected by a service, optionally requiring the NPL annotation on
/// the service itself.
pub(crate) fn pods_for_service<'a>(
    index: &'a ResourceIndex,
    namespace: &str,
    service_name: &str,
    npl_annotation_required: bool,
) -> Vec<&'a Pod> {
    let Some(svc) = index
        .services
        .get(&(namespace.to_string(), service_name.to_string()))
    else {
        error!(%namespace, service = %service_name, "service not found");
        return Vec::new();
    };
    if npl_annotation_required
        && !svc
            .metadata
            .annotations
            .as_ref()
            .is_some_and(|a| a.contains_key(NPL_SVC_ANNOTATION))
    {
        error!(service = %service_name, "service is not annotated for nodeportlocal");
        return Vec::new();
    }
    let Some(selector) = svc.spec.as_ref().and_then(|s| s.selector.as_ref()) else {
        debug!(service = %service_name, "service has no label selector");
        return Vec::new();
    };
    if selector.is_empty() {
        return Vec::new();
    }

    index
        .pods
        .range((namespace.to_string(), String::new())..)
        .take_while(|((ns, _), _)| ns == namespace)
        .map(|(_, pod)| pod)
        .filter(|pod| {
            let labels = pod.metadata.labels.clone().unwrap_or_default();
            selector
                .iter()
                .all(|(k, v)| labels.get(k).map(String::as_str) == Some(v.as_str()))
        })
        .collect()
}

/// The service a pod belongs to, used to requeue services on pod churn.
/// NodePort services resolve members without pods and are skipped.
pub(crate) fn service_for_pod<'a>(index: &'a ResourceIndex, pod: &Pod) -> Option<&'a Service> {
    let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
    let pod_labels = pod.metadata.labels.clone().unwrap_or_default();
    index
        .services
        .range((namespace.to_string(), String::new())..)
        .take_while(|((ns, _), _)| ns == namespace)
        .map(|(_, svc)| svc)
        .find(|svc| {
            let spec = svc.spec.as_ref();
            if spec.and_then(|s| s.type_.as_deref()) == Some("NodePort") {
                return false;
            }
            match spec.and_then(|s| s.selector.as_ref()) {
                Some(selector) if !selector.is_empty() => selector
                    .iter()
                    .all(|(k, v)| pod_labels.get(k).map(String::as_str) == Some(v.as_str())),
                _ => false,
            }
        })
}

/// Rebuild the member cache entry for one service from its Endpoints. Every
/// subset port gets an entry, empty or not. Addresses on unknown nodes are
/// skipped unless the service is headless.
pub(crate) fn build_pool_members_info(
    svc: &Service,
    eps: &Endpoints,
    index: &ResourceIndex,
) -> PoolMembersInfo {
    let spec = svc.spec.clone().unwrap_or_default();
    let headless = spec.cluster_ip.as_deref() == Some("None");

    let mut info = PoolMembersInfo {
        service_type: spec.type_.clone().unwrap_or_default(),
        port_spec: spec
            .ports
            .iter()
            .flatten()
            .map(|p| SvcPortSpec {
                name: p.name.clone().unwrap_or_default(),
                port: p.port,
                node_port: p.node_port.unwrap_or_default(),
                target_port: match &p.target_port {
                    Some(k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(n)) => {
                        PortId::Number(*n)
                    }
                    Some(k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::String(s)) => {
                        PortId::Name(s.clone())
                    }
                    None => PortId::Number(p.port),
                },
            })
            .collect(),
        members_map: Default::default(),
    };

    for subset in eps.subsets.iter().flatten() {
        for port in subset.ports.iter().flatten() {
            let members: Vec<PoolMember> = subset
                .addresses
                .iter()
                .flatten()
                .filter(|addr| {
                    headless
                        || addr
                            .node_name
                            .as_ref()
                            .is_some_and(|n| index.nodes.contains_key(n))
                })
                .map(|addr| PoolMember::new(&addr.ip, port.port))
                .collect();
            info.members_map.insert(
                PortRef {
                    name: port.name.clone().unwrap_or_default(),
                    port: port.port,
                },
                members,
            );
        }
    }
    info
}

fn all_nodes(index: &ResourceIndex) -> Vec<Node> {
    index.nodes.values().cloned().collect()
}

fn nodes_with_label(index: &ResourceIndex, label: &str) -> Vec<Node> {
    let Some((key, value)) = label.split_once('=') else {
        error!(%label, "malformed node member label, expected key=value");
        return Vec::new();
    };
    index
        .nodes
        .values()
        .filter(|node| {
            node.metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(key))
                .map(String::as_str)
                == Some(value)
        })
        .cloned()
        .collect()
}

/// A node's member address: internal first, external as fallback.
fn node_address(node: &Node) -> Option<String> {
    let addresses = node.status.as_ref()?.addresses.as_ref()?;
    addresses
        .iter()
        .find(|a| a.type_ == "InternalIP")
        .or_else(|| addresses.iter().find(|a| a.type_ == "ExternalIP"))
        .map(|a| a.address.clone())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::Pool;
    use k8s_openapi::api::core::v1::{
        Container, ContainerPort, EndpointAddress, EndpointPort, EndpointSubset, NodeAddress,
        NodeStatus, PodSpec, ServicePort, ServiceSpec,
    };
    use std::collections::BTreeMap;

    fn node(name: &str, addr: &str, labels: &[(&str, &str)]) -> Node {
        let mut node = Node::default();
        node.metadata.name = Some(name.to_string());
        node.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        node.status = Some(NodeStatus {
            addresses: Some(vec![NodeAddress {
                address: addr.to_string(),
                type_: "InternalIP".to_string(),
            }]),
            ..Default::default()
        });
        node
    }

    fn service(ns: &str, name: &str, type_: &str, ports: Vec<ServicePort>) -> Service {
        let mut svc = Service::default();
        svc.metadata.namespace = Some(ns.to_string());
        svc.metadata.name = Some(name.to_string());
        svc.spec = Some(ServiceSpec {
            type_: Some(type_.to_string()),
            ports: Some(ports),
            selector: Some(BTreeMap::from([("app".to_string(), "web".to_string())])),
            ..Default::default()
        });
        svc
    }

    fn pool(ns: &str, svc: &str, port: PortId) -> Pool {
        Pool {
            name: format!("{svc}_pool"),
            service_name: svc.to_string(),
            service_namespace: ns.to_string(),
            service_port: port,
            ..Default::default()
        }
    }

    fn cluster_store(port_ref: PortRef, members: Vec<PoolMember>) -> ResourceStore {
        let mut store = ResourceStore::new("test");
        store.pool_mem_cache.insert(
            ("default".to_string(), "svc1".to_string()),
            PoolMembersInfo {
                service_type: "ClusterIP".to_string(),
                port_spec: Vec::new(),
                members_map: [(port_ref, members)].into_iter().collect(),
            },
        );
        store
    }

    #[test]
    fn test_cluster_matches_port_by_name_or_number() {
        let members = vec![PoolMember::new("10.244.1.1", 443)];
        let store = cluster_store(
            PortRef {
                name: "https".to_string(),
                port: 443,
            },
            members.clone(),
        );

        for port in [PortId::Number(443), PortId::Name("https".to_string())] {
            let mut cfg = ResourceConfig::default();
            cfg.pools = vec![pool("default", "svc1", port)];
            update_for_cluster(&store, &mut cfg, "default");
            assert_eq!(cfg.pools[0].members.as_deref(), Some(members.as_slice()));
            assert!(cfg.meta.active);
        }

        // wrong port number and wrong name both miss
        let mut cfg = ResourceConfig::default();
        cfg.pools = vec![pool("default", "svc1", PortId::Number(80))];
        update_for_cluster(&store, &mut cfg, "default");
        assert_eq!(cfg.pools[0].members, None);
        assert!(!cfg.meta.active);
    }

    #[test]
    fn test_missing_service_in_own_namespace_empties_pool() {
        let store = ResourceStore::new("test");
        let mut cfg = ResourceConfig::default();
        cfg.pools = vec![pool("default", "gone", PortId::Number(80))];
        update_for_cluster(&store, &mut cfg, "default");
        assert_eq!(cfg.pools[0].members.as_deref(), Some(&[][..]));

        // a foreign-namespace pool is left alone for its own namespace's pass
        let mut cfg = ResourceConfig::default();
        cfg.pools = vec![pool("other", "gone", PortId::Number(80))];
        update_for_cluster(&store, &mut cfg, "default");
        assert_eq!(cfg.pools[0].members, None);
    }

    #[test]
    fn test_endpoints_skip_addresses_on_unknown_nodes() {
        let mut index = ResourceIndex::default();
        index
            .nodes
            .insert("node1".to_string(), node("node1", "192.168.0.1", &[]));

        let svc = service("default", "svc1", "ClusterIP", vec![ServicePort {
            name: Some("http".to_string()),
            port: 80,
            ..Default::default()
        }]);
        let eps = Endpoints {
            subsets: Some(vec![EndpointSubset {
                addresses: Some(vec![
                    EndpointAddress {
                        ip: "10.244.1.1".to_string(),
                        node_name: Some("node1".to_string()),
                        ..Default::default()
                    },
                    EndpointAddress {
                        ip: "10.244.2.1".to_string(),
                        node_name: Some("node2".to_string()),
                        ..Default::default()
                    },
                ]),
                ports: Some(vec![EndpointPort {
                    name: Some("http".to_string()),
                    port: 80,
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let info = build_pool_members_info(&svc, &eps, &index);
        let members = &info.members_map[&PortRef {
            name: "http".to_string(),
            port: 80,
        }];
        assert_eq!(members, &vec![PoolMember::new("10.244.1.1", 80)]);

        // headless services keep every address
        let mut headless = svc.clone();
        if let Some(spec) = headless.spec.as_mut() {
            spec.cluster_ip = Some("None".to_string());
        }
        let info = build_pool_members_info(&headless, &eps, &index);
        assert_eq!(
            info.members_map[&PortRef {
                name: "http".to_string(),
                port: 80
            }]
            .len(),
            2
        );
    }

    #[test]
    fn test_nodeport_respects_node_member_label() {
        let mut index = ResourceIndex::default();
        index.nodes.insert(
            "node1".to_string(),
            node("node1", "192.168.0.1", &[("zone", "a")]),
        );
        index.nodes.insert(
            "node2".to_string(),
            node("node2", "192.168.0.2", &[("zone", "b")]),
        );

        let mut store = ResourceStore::new("test");
        store.pool_mem_cache.insert(
            ("default".to_string(), "svc1".to_string()),
            PoolMembersInfo {
                service_type: "NodePort".to_string(),
                port_spec: vec![SvcPortSpec {
                    name: "http".to_string(),
                    port: 80,
                    node_port: 30080,
                    target_port: PortId::Number(8080),
                }],
                members_map: [(
                    PortRef {
                        name: "http".to_string(),
                        port: 80,
                    },
                    Vec::new(),
                )]
                .into_iter()
                .collect(),
            },
        );

        let mut cfg = ResourceConfig::default();
        cfg.pools = vec![pool("default", "svc1", PortId::Number(8080))];
        cfg.pools[0].node_member_label = "zone=a".to_string();
        update_for_nodeport(&store, &index, &mut cfg, "default");
        assert_eq!(
            cfg.pools[0].members.as_deref(),
            Some(&[PoolMember::new("192.168.0.1", 30080)][..])
        );

        let mut cfg = ResourceConfig::default();
        cfg.pools = vec![pool("default", "svc1", PortId::Number(8080))];
        update_for_nodeport(&store, &index, &mut cfg, "default");
        assert_eq!(cfg.pools[0].members.as_ref().map(Vec::len), Some(2));
    }

    #[test]
    fn test_npl_resolves_named_target_port() {
        let mut index = ResourceIndex::default();
        let mut svc = service("default", "svc1", "ClusterIP", vec![ServicePort {
            name: Some("http".to_string()),
            port: 80,
            target_port: Some(
                k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::String(
                    "web-port".to_string(),
                ),
            ),
            ..Default::default()
        }]);
        svc.metadata.annotations = Some(BTreeMap::from([(
            NPL_SVC_ANNOTATION.to_string(),
            "true".to_string(),
        )]));
        index
            .services
            .insert(("default".to_string(), "svc1".to_string()), svc.clone());

        let mut pod = Pod::default();
        pod.metadata.namespace = Some("default".to_string());
        pod.metadata.name = Some("pod1".to_string());
        pod.metadata.labels = Some(BTreeMap::from([("app".to_string(), "web".to_string())]));
        pod.spec = Some(PodSpec {
            containers: vec![Container {
                name: "web".to_string(),
                ports: Some(vec![ContainerPort {
                    name: Some("web-port".to_string()),
                    container_port: 8080,
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            ..Default::default()
        });
        index
            .pods
            .insert(("default".to_string(), "pod1".to_string()), pod);

        let mut store = ResourceStore::new("test");
        store.pool_mem_cache.insert(
            ("default".to_string(), "svc1".to_string()),
            build_pool_members_info(&svc, &Endpoints::default(), &index),
        );
        store.npl_store.insert(
            ("default".to_string(), "pod1".to_string()),
            vec![crate::store::NplAnnotation {
                pod_port: 8080,
                node_ip: "192.168.0.1".to_string(),
                node_port: 40001,
            }],
        );

        let mut cfg = ResourceConfig::default();
        cfg.pools = vec![pool("default", "svc1", PortId::Name("web-port".to_string()))];
        update_for_npl(&store, &index, &mut cfg, "default");
        assert_eq!(
            cfg.pools[0].members.as_deref(),
            Some(&[PoolMember::new("192.168.0.1", 40001)][..])
        );
    }
}
