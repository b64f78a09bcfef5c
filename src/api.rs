//! The cluster-facing resource dialects.
//!
//! Two families of input feed the reconciler: OpenShift-style `Route`s paired
//! with an extended-spec ConfigMap, and our own custom resources
//! (`VirtualServer`, `TransportServer`, `TLSProfile`, `LbPolicy`,
//! `IngressLink`, `ExternalDNS`). The `Ipam` resource is the request/response
//! surface shared with an external address allocator.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub(crate) const DEFAULT_HTTP_PORT: i32 = 80;
pub(crate) const DEFAULT_HTTPS_PORT: i32 = 443;

pub(crate) const TLS_PASSTHROUGH: &str = "passthrough";
pub(crate) const TLS_EDGE: &str = "edge";
pub(crate) const TLS_REENCRYPT: &str = "reencrypt";

/// HTTPTraffic tokens on secured virtuals. Anything other than allow or
/// redirect means insecure traffic is dropped.
pub(crate) const HTTP_TRAFFIC_ALLOW: &str = "allow";
pub(crate) const HTTP_TRAFFIC_REDIRECT: &str = "redirect";

/// Annotation carrying the IPAM label on type=LoadBalancer Services.
pub(crate) const LB_SVC_IPAM_LABEL_ANNOTATION: &str = "deckhand.io/ipamLabel";
/// Annotation naming an LbPolicy on type=LoadBalancer Services.
pub(crate) const LB_SVC_POLICY_ANNOTATION: &str = "deckhand.io/policyName";

/// Annotation advertising NodePortLocal port mappings on a Pod.
pub(crate) const NPL_POD_ANNOTATION: &str = "nodeportlocal.antrea.io";
/// Annotation that marks a Service as NPL-enabled.
pub(crate) const NPL_SVC_ANNOTATION: &str = "nodeportlocal.antrea.io/enabled";

/// Annotation overriding the load-balancing mode on Route pools.
pub(crate) const ROUTE_BALANCE_ANNOTATION: &str = "deckhand.io/balance";
/// Annotations naming pre-existing client/server SSL profiles for a Route.
pub(crate) const ROUTE_CLIENT_SSL_ANNOTATION: &str = "deckhand.io/clientssl";
pub(crate) const ROUTE_SERVER_SSL_ANNOTATION: &str = "deckhand.io/serverssl";

/// References a service port by name or number.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(untagged)]
pub(crate) enum PortId {
    Number(i32),
    Name(String),
}

impl Default for PortId {
    fn default() -> Self {
        PortId::Number(0)
    }
}

impl std::fmt::Display for PortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortId::Number(n) => write!(f, "{n}"),
            PortId::Name(n) => f.write_str(n),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HealthMonitor {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub reference: String,
    #[serde(rename = "type", default)]
    pub monitor_type: String,
    #[serde(default)]
    pub interval: i32,
    #[serde(default)]
    pub timeout: i32,
    #[serde(default)]
    pub send: String,
    #[serde(default)]
    pub recv: String,
    #[serde(default)]
    pub target_port: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct VsPool {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path: String,
    pub service: String,
    #[serde(default)]
    pub service_port: PortId,
    #[serde(default)]
    pub service_namespace: String,
    #[serde(default)]
    pub node_member_label: String,
    #[serde(default)]
    pub balance: String,
    #[serde(default)]
    pub monitors: Vec<HealthMonitor>,
}

/// A single HTTP(S) access point. Virtuals that share a host (or an explicit
/// hostGroup) are merged into one load-balancer virtual server.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "deckhand.io",
    version = "v1",
    kind = "VirtualServer",
    status = "VirtualServerStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub(crate) struct VirtualServerSpec {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub host_group: String,
    #[serde(default)]
    pub virtual_server_address: String,
    #[serde(default)]
    pub virtual_server_name: String,
    /// 0 means the default port 80.
    #[serde(default)]
    pub virtual_server_http_port: i32,
    /// 0 means the default port 443.
    #[serde(default)]
    pub virtual_server_https_port: i32,
    #[serde(default)]
    pub ipam_label: String,
    #[serde(default)]
    pub tls_profile_name: String,
    /// "allow", "redirect", "none" or empty.
    #[serde(default)]
    pub http_traffic: String,
    #[serde(default)]
    pub http_mrf_routing_enabled: bool,
    #[serde(default)]
    pub policy_name: String,
    #[serde(default)]
    pub snat: String,
    #[serde(default)]
    pub pools: Vec<VsPool>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct VirtualServerStatus {
    #[serde(default)]
    pub vs_address: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TsPool {
    #[serde(default)]
    pub name: String,
    pub service: String,
    #[serde(default)]
    pub service_port: PortId,
    #[serde(default)]
    pub node_member_label: String,
    #[serde(default)]
    pub balance: String,
    #[serde(default)]
    pub monitors: Vec<HealthMonitor>,
}

/// An L4 access point: one address and port forwarding to one pool.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "deckhand.io",
    version = "v1",
    kind = "TransportServer",
    status = "TransportServerStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TransportServerSpec {
    #[serde(default)]
    pub virtual_server_address: String,
    #[serde(default)]
    pub virtual_server_name: String,
    #[serde(default)]
    pub virtual_server_port: i32,
    #[serde(default)]
    pub host_group: String,
    #[serde(default)]
    pub ipam_label: String,
    #[serde(default)]
    pub policy_name: String,
    /// "tcp" or "udp".
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub mode: String,
    pub pool: TsPool,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TransportServerStatus {
    #[serde(default)]
    pub vs_address: String,
    #[serde(default)]
    pub status: String,
}

/// Secret-or-BigIP reference discriminator on TLS profiles.
pub(crate) const TLS_REFERENCE_SECRET: &str = "secret";
pub(crate) const TLS_REFERENCE_BIGIP: &str = "bigip";

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TlsSettings {
    #[serde(default)]
    pub termination: String,
    /// "secret" or "bigip".
    #[serde(default)]
    pub reference: String,
    #[serde(default)]
    pub client_ssl: String,
    #[serde(rename = "clientSSLs", default)]
    pub client_ssls: Vec<String>,
    #[serde(default)]
    pub server_ssl: String,
    #[serde(rename = "serverSSLs", default)]
    pub server_ssls: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "deckhand.io",
    version = "v1",
    kind = "TLSProfile",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TLSProfileSpec {
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub tls: TlsSettings,
}

/// Reusable virtual-server settings referenced by name from virtuals, routes
/// and LB services.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(group = "deckhand.io", version = "v1", kind = "LbPolicy", namespaced)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LbPolicySpec {
    #[serde(default)]
    pub snat: String,
    #[serde(default)]
    pub waf: String,
    #[serde(default)]
    pub persistence_profile: String,
    #[serde(default)]
    pub irule_list: Vec<String>,
    #[serde(default)]
    pub log_profiles: Vec<String>,
}

/// Binds a vendor ingress controller Service to a device virtual server.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "deckhand.io",
    version = "v1",
    kind = "IngressLink",
    status = "IngressLinkStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub(crate) struct IngressLinkSpec {
    #[serde(default)]
    pub virtual_server_address: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub ipam_label: String,
    #[serde(default)]
    pub i_rules: Vec<String>,
    #[serde(default)]
    pub selector: std::collections::BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct IngressLinkStatus {
    #[serde(default)]
    pub vs_address: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EdnsPool {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub data_server_name: String,
    #[serde(default)]
    pub dns_record_type: String,
    #[serde(default)]
    pub load_balance_method: String,
    #[serde(default)]
    pub priority_order: i32,
    #[serde(default)]
    pub monitor: Option<HealthMonitor>,
}

/// Global-DNS wide-IP definition, published into the GTM half of the config.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "deckhand.io",
    version = "v1",
    kind = "ExternalDNS",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ExternalDNSSpec {
    pub domain_name: String,
    #[serde(default)]
    pub dns_record_type: String,
    #[serde(default)]
    pub load_balance_method: String,
    #[serde(default)]
    pub pools: Vec<EdnsPool>,
}

/// One address request row in the IPAM resource's spec.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HostSpec {
    #[serde(default)]
    pub ipam_label: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub key: String,
}

/// One allocation row in the IPAM resource's status. Correlated with a
/// HostSpec by (label, host-or-key), never by position.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct IpSpec {
    #[serde(default)]
    pub ipam_label: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub ip: String,
}

#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "ipam.deckhand.io",
    version = "v1",
    kind = "Ipam",
    status = "IpamStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub(crate) struct IpamSpec {
    #[serde(default)]
    pub host_specs: Vec<HostSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct IpamStatus {
    #[serde(default)]
    pub ip_status: Vec<IpSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RouteTarget {
    #[serde(default)]
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub weight: Option<i32>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RoutePort {
    #[serde(default)]
    pub target_port: PortId,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RouteTls {
    #[serde(default)]
    pub termination: String,
    #[serde(default)]
    pub certificate: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub ca_certificate: String,
    #[serde(default)]
    pub destination_ca_certificate: String,
    /// "Allow", "Redirect", "None" or empty.
    #[serde(default)]
    pub insecure_edge_termination_policy: String,
}

/// The ingress-route dialect, compatible with OpenShift routes.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "route.openshift.io",
    version = "v1",
    kind = "Route",
    status = "RouteStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RouteSpec {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub path: String,
    pub to: RouteTarget,
    #[serde(default)]
    pub alternate_backends: Vec<RouteTarget>,
    #[serde(default)]
    pub port: Option<RoutePort>,
    #[serde(default)]
    pub tls: Option<RouteTls>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RouteIngressCondition {
    #[serde(rename = "type", default)]
    pub condition_type: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RouteIngress {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub router_name: String,
    #[serde(default)]
    pub conditions: Vec<RouteIngressCondition>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RouteStatus {
    #[serde(default)]
    pub ingress: Vec<RouteIngress>,
}

impl Route {
    pub(crate) fn is_passthrough(&self) -> bool {
        self.spec
            .tls
            .as_ref()
            .is_some_and(|tls| tls.termination == TLS_PASSTHROUGH)
    }

    pub(crate) fn is_secured(&self) -> bool {
        self.spec
            .tls
            .as_ref()
            .is_some_and(|tls| !tls.termination.is_empty())
    }

    /// The insecure-traffic policy, normalized to lowercase with "none"
    /// collapsed to empty.
    pub(crate) fn insecure_policy(&self) -> String {
        let policy = self
            .spec
            .tls
            .as_ref()
            .map(|tls| tls.insecure_edge_termination_policy.to_lowercase())
            .unwrap_or_default();
        if policy == "none" {
            String::new()
        } else {
            policy
        }
    }
}

/// Matches a route/profile host pattern against a hostname. A leading `*.`
/// wildcard matches exactly one extra label.
pub(crate) fn host_matches(pattern: &str, host: &str) -> bool {
    if pattern == host {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        if let Some(host_suffix) = host.split_once('.').map(|(_, rest)| rest) {
            return host_suffix == suffix;
        }
    }
    false
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_port_id_parses_name_or_number() {
        let port: PortId = serde_json::from_str("8080").unwrap();
        assert_eq!(port, PortId::Number(8080));

        let port: PortId = serde_json::from_str("\"https\"").unwrap();
        assert_eq!(port, PortId::Name("https".to_string()));
    }

    #[test]
    fn test_host_matches() {
        assert!(host_matches("foo.com", "foo.com"));
        assert!(host_matches("*.foo.com", "bar.foo.com"));
        assert!(!host_matches("*.foo.com", "foo.com"));
        assert!(!host_matches("*.foo.com", "a.b.foo.com"));
        assert!(!host_matches("bar.com", "foo.com"));
    }
}
