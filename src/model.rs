//! The normalized output model pushed at the load-balancing device.
//!
//! One [ResourceConfig] is the complete declarative definition of one
//! physical virtual server. Configs live in per-partition maps ([LtmConfig])
//! plus a separate global-DNS half ([GtmConfig]). Everything here is plain
//! owned data: `clone()` is the deep-copy step that keeps reconciliation
//! paths from aliasing each other's edits.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::api::PortId;

/// Resource-name suffixes for the data groups and iRules attached to a
/// virtual; the full name is always scoped through [get_rscfg_res_name].
pub(crate) const PASSTHROUGH_HOSTS_DG_NAME: &str = "ssl_passthrough_servername_dg";
pub(crate) const AB_DEPLOYMENT_DG_NAME: &str = "ab_deployment_dg";
pub(crate) const HTTPS_REDIRECT_IRULE_NAME: &str = "http_redirect_irule";
pub(crate) const AB_PATH_IRULE_NAME: &str = "ab_deployment_path_irule";

pub(crate) const DEFAULT_SNAT: &str = "auto";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub(crate) enum Protocol {
    #[default]
    Http,
    Https,
    Tcp,
    Udp,
}

impl Protocol {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// A (name, partition) reference to a device object.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub(crate) struct NameRef {
    pub name: String,
    pub partition: String,
}

/// Keys custom TLS profiles by secret and owning resource so that two
/// resources referencing the same secret don't clobber each other.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub(crate) struct SecretKey {
    pub name: String,
    pub resource_name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub(crate) struct VirtualAddress {
    pub bind_addr: String,
    pub port: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub(crate) struct ProfileRef {
    pub name: String,
    pub partition: String,
    /// "clientside" or "serverside".
    pub context: String,
    /// Namespace of the owning resource, informational only.
    pub namespace: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub(crate) struct Virtual {
    pub name: String,
    pub partition: String,
    pub destination: String,
    pub enabled: bool,
    pub ip_protocol: String,
    pub virtual_address: Option<VirtualAddress>,
    pub policies: Vec<NameRef>,
    pub profiles: Vec<ProfileRef>,
    pub irules: Vec<String>,
    pub snat: String,
    pub waf: String,
    pub persistence_profile: String,
    pub log_profiles: Vec<String>,
    pub tls_termination: String,
    pub http_mrf_routing_enabled: bool,
    pub mode: String,
    /// Default pool, for configs without an L7 policy.
    pub pool_name: String,
}

impl Virtual {
    /// Point the virtual at a bind address. The destination string is what
    /// the device consumes; the structured form is kept for re-derivations.
    pub(crate) fn set_virtual_address(&mut self, bind_addr: &str, port: i32) {
        self.destination = format!("{bind_addr}:{port}");
        self.virtual_address = Some(VirtualAddress {
            bind_addr: bind_addr.to_string(),
            port,
        });
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub(crate) struct PoolMember {
    pub address: String,
    pub port: i32,
    pub session: String,
}

impl PoolMember {
    pub(crate) fn new(address: &str, port: i32) -> Self {
        Self {
            address: address.to_string(),
            port,
            session: "user-enabled".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub(crate) struct Pool {
    pub name: String,
    pub partition: String,
    pub service_name: String,
    pub service_namespace: String,
    pub service_port: PortId,
    pub balance: String,
    pub members: Option<Vec<PoolMember>>,
    pub node_member_label: String,
    pub monitor_names: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub(crate) struct Monitor {
    pub name: String,
    pub partition: String,
    pub monitor_type: String,
    pub interval: i32,
    pub timeout: i32,
    pub send: String,
    pub recv: String,
    pub target_port: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub(crate) struct Condition {
    pub name: String,
    /// Hostname equality match, if set.
    pub host: Option<String>,
    /// Path-segment equality match, if set.
    pub path_segment: Option<String>,
    pub request: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub(crate) struct Action {
    pub name: String,
    pub forward: bool,
    pub request: bool,
    pub pool: String,
    pub redirect: bool,
    pub location: String,
    pub reset: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub(crate) struct Rule {
    pub name: String,
    /// host + path of the claiming resource; rule identity for merging.
    pub full_uri: String,
    pub ordinal: usize,
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub(crate) struct L7Policy {
    pub name: String,
    pub partition: String,
    pub controls: Vec<String>,
    pub requires: Vec<String>,
    pub strategy: String,
    pub rules: Vec<Rule>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub(crate) struct DgRecord {
    pub name: String,
    pub data: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub(crate) struct InternalDataGroup {
    pub name: String,
    pub partition: String,
    pub records: Vec<DgRecord>,
}

impl InternalDataGroup {
    /// Insert or replace a record, keeping records sorted by name.
    pub(crate) fn add_or_update_record(&mut self, name: &str, data: &str) {
        match self.records.binary_search_by(|r| r.name.as_str().cmp(name)) {
            Ok(i) => self.records[i].data = data.to_string(),
            Err(i) => self.records.insert(
                i,
                DgRecord {
                    name: name.to_string(),
                    data: data.to_string(),
                },
            ),
        }
    }
}

/// Data groups are namespaced internally so one route group's records can be
/// torn down without touching a sibling namespace's.
pub(crate) type DataGroupNamespaceMap = BTreeMap<String, InternalDataGroup>;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub(crate) struct IRule {
    pub name: String,
    pub partition: String,
    pub code: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub(crate) struct CustomProfile {
    pub name: String,
    pub partition: String,
    /// "clientside" or "serverside".
    pub context: String,
    pub cert: String,
    pub key: String,
    pub server_name: String,
    pub sni_default: bool,
    pub ca_file: String,
    pub tls_version: String,
    pub ciphers: String,
    pub cipher_group: String,
}

/// Which source dialect produced a config; drives merge and delete rules.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub(crate) enum ConfigOrigin {
    #[default]
    VirtualServer,
    TransportServer,
    Route,
    IngressLink,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub(crate) struct MetaData {
    /// True once at least one pool resolved members.
    pub active: bool,
    pub origin: ConfigOrigin,
    /// Source objects merged into this config, "namespace/name" to kind.
    /// Deletion of a config is detected when this set drains.
    pub base_resources: BTreeMap<String, String>,
    pub namespace: String,
    pub hosts: Vec<String>,
    pub protocol: Protocol,
    pub http_traffic: String,
}

/// One physical virtual server's complete declarative definition.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub(crate) struct ResourceConfig {
    pub meta: MetaData,
    pub virtual_server: Virtual,
    pub pools: Vec<Pool>,
    pub policies: Vec<L7Policy>,
    pub monitors: Vec<Monitor>,
    pub irules_map: BTreeMap<NameRef, IRule>,
    pub int_dg_map: BTreeMap<NameRef, DataGroupNamespaceMap>,
    pub custom_profiles: BTreeMap<SecretKey, CustomProfile>,
}

impl ResourceConfig {
    /// Merge or append a policy by name. Rules with a full_uri already
    /// present replace the stale rule in place, otherwise they are appended
    /// in discovery order and re-numbered.
    pub(crate) fn add_rule_to_policy(&mut self, policy_name: &str, rule: Rule) {
        if let Some(policy) = self.policies.iter_mut().find(|p| p.name == policy_name) {
            if let Some(existing) = policy
                .rules
                .iter_mut()
                .find(|r| r.full_uri == rule.full_uri)
            {
                let ordinal = existing.ordinal;
                *existing = rule;
                existing.ordinal = ordinal;
            } else {
                policy.rules.push(rule);
            }
            for (i, r) in policy.rules.iter_mut().enumerate() {
                r.ordinal = i;
            }
            return;
        }

        let mut policy = L7Policy {
            name: policy_name.to_string(),
            partition: self.virtual_server.partition.clone(),
            controls: vec!["forwarding".to_string()],
            requires: vec!["http".to_string()],
            strategy: "first-match".to_string(),
            rules: vec![rule],
        };
        policy.rules[0].ordinal = 0;
        self.policies.push(policy);

        let policy_ref = NameRef {
            name: policy_name.to_string(),
            partition: self.virtual_server.partition.clone(),
        };
        if !self.virtual_server.policies.contains(&policy_ref) {
            self.virtual_server.policies.push(policy_ref);
        }
    }

}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub(crate) struct PartitionConfig {
    pub resources: BTreeMap<String, ResourceConfig>,
    pub priority: i32,
}

/// Partition name to that partition's virtual servers.
pub(crate) type LtmConfig = BTreeMap<String, PartitionConfig>;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub(crate) struct GslbPool {
    pub name: String,
    pub record_type: String,
    pub lb_method: String,
    pub priority_order: i32,
    pub members: Vec<String>,
    pub monitors: Vec<Monitor>,
    pub data_server: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub(crate) struct WideIp {
    pub domain_name: String,
    pub record_type: String,
    pub lb_method: String,
    pub uid: String,
    pub pools: Vec<GslbPool>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub(crate) struct GtmPartitionConfig {
    /// Keyed by domain name.
    pub wide_ips: BTreeMap<String, WideIp>,
}

pub(crate) type GtmConfig = BTreeMap<String, GtmPartitionConfig>;

/// Mangle an address into a device-safe name fragment.
fn mangle(addr: &str) -> String {
    addr.replace(['.', ':', '/', '%'], "_")
}

/// Name for an address-derived virtual server: `crd_10_8_0_1_443`.
pub(crate) fn format_virtual_server_name(ip: &str, port: i32) -> String {
    format!("crd_{}_{}", mangle(ip), port)
}

/// Name for an explicitly named virtual server: `samplevs_443`.
pub(crate) fn format_custom_virtual_server_name(name: &str, port: i32) -> String {
    format!("{name}_{port}")
}

/// Name for a type=LoadBalancer service virtual:
/// `vs_lb_svc_default_svc1_10_10_10_1_80`.
pub(crate) fn format_lb_service_name(namespace: &str, name: &str, ip: &str, port: i32) -> String {
    format!("vs_lb_svc_{namespace}_{name}_{}_{port}", mangle(ip))
}

/// Name for an IngressLink virtual: `ingress_link_nginx-il`.
pub(crate) fn format_ingress_link_name(name: &str, port: i32) -> String {
    format!("ingress_link_{name}_{port}")
}

/// Per-virtual name for an attached resource such as a data group or iRule.
pub(crate) fn get_rscfg_res_name(vs_name: &str, res_name: &str) -> String {
    format!("{vs_name}_{res_name}")
}

/// Name for a backend pool: `foo_80_default`.
pub(crate) fn format_pool_name(service: &str, port: &PortId, namespace: &str) -> String {
    mangle(&format!("{service}_{port}_{namespace}"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_virtual_server_names() {
        assert_eq!(format_virtual_server_name("10.8.0.1", 443), "crd_10_8_0_1_443");
        assert_eq!(format_custom_virtual_server_name("samplevs", 443), "samplevs_443");
        assert_eq!(
            format_lb_service_name("default", "svc1", "10.10.10.1", 80),
            "vs_lb_svc_default_svc1_10_10_10_1_80"
        );
        assert_eq!(
            get_rscfg_res_name("samplevs_443", PASSTHROUGH_HOSTS_DG_NAME),
            "samplevs_443_ssl_passthrough_servername_dg"
        );
    }

    #[test]
    fn test_rules_merge_by_full_uri() {
        let mut cfg = ResourceConfig::default();
        cfg.virtual_server.partition = "test".to_string();

        let rule = |uri: &str| Rule {
            name: uri.replace('/', "_"),
            full_uri: uri.to_string(),
            ..Default::default()
        };

        cfg.add_rule_to_policy("routes_policy", rule("foo.com/foo"));
        cfg.add_rule_to_policy("routes_policy", rule("bar.com/bar"));
        assert_eq!(cfg.policies.len(), 1);
        assert_eq!(cfg.policies[0].rules.len(), 2);
        assert_eq!(cfg.policies[0].rules[0].ordinal, 0);
        assert_eq!(cfg.policies[0].rules[1].ordinal, 1);

        // re-adding the same URI replaces in place, order is stable
        cfg.add_rule_to_policy("routes_policy", rule("foo.com/foo"));
        assert_eq!(cfg.policies[0].rules.len(), 2);
        assert_eq!(cfg.policies[0].rules[0].full_uri, "foo.com/foo");
    }

    #[test]
    fn test_data_group_records_sorted() {
        let mut dg = InternalDataGroup::default();
        dg.add_or_update_record("foo.com", "foo_80_default");
        dg.add_or_update_record("bar.com", "bar_80_default");
        dg.add_or_update_record("foo.com", "foo_8080_default");

        assert_eq!(dg.records.len(), 2);
        assert_eq!(dg.records[0].name, "bar.com");
        assert_eq!(dg.records[1].data, "foo_8080_default");
    }
}
