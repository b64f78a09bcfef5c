//! Grouping of VirtualServer resources into physical virtual servers.
//!
//! Virtuals sharing a hostGroup are merged across namespaces; without one
//! they merge by host, and hostless virtuals by address. A group is derived
//! as a whole: whenever any member changes, the survivors are re-associated
//! and the config rebuilt from scratch.

use tracing::{debug, error};

use crate::api::{
    host_matches, TLSProfile, VirtualServer, DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT,
    HTTP_TRAFFIC_ALLOW, HTTP_TRAFFIC_REDIRECT, TLS_REFERENCE_SECRET,
};
use crate::model::Protocol;
use crate::store::ResourceIndex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PortProto {
    pub protocol: Protocol,
    pub port: i32,
}

pub(crate) fn effective_http_port(vs: &VirtualServer) -> i32 {
    match vs.spec.virtual_server_http_port {
        0 => DEFAULT_HTTP_PORT,
        port => port,
    }
}

pub(crate) fn effective_https_port(vs: &VirtualServer) -> i32 {
    match vs.spec.virtual_server_https_port {
        0 => DEFAULT_HTTPS_PORT,
        port => port,
    }
}

pub(crate) fn is_tls_virtual(vs: &VirtualServer) -> bool {
    !vs.spec.tls_profile_name.is_empty()
}

/// True when a virtual accepts insecure traffic, either because it is
/// unsecured or because it allows/redirects HTTP alongside TLS.
fn handles_http(vs: &VirtualServer) -> bool {
    if !is_tls_virtual(vs) {
        return true;
    }
    vs.spec.http_traffic == HTTP_TRAFFIC_ALLOW || vs.spec.http_traffic == HTTP_TRAFFIC_REDIRECT
}

/// True when any group member handles HTTP on the same effective HTTP port
/// as `current`. Gates whether the group keeps an HTTP-protocol config.
pub(crate) fn group_handles_http(group: &[&VirtualServer], current: &VirtualServer) -> bool {
    let port = effective_http_port(current);
    group
        .iter()
        .any(|vs| handles_http(vs) && effective_http_port(vs) == port)
}

/// True when any secured group member shares `current`'s effective HTTPS
/// port. Gates HTTPS config teardown on deletion.
pub(crate) fn group_uses_same_https_port(group: &[&VirtualServer], current: &VirtualServer) -> bool {
    let port = effective_https_port(current);
    group
        .iter()
        .any(|vs| is_tls_virtual(vs) && effective_https_port(vs) == port)
}

/// The physical ports a virtual claims: HTTPS when secured, plus HTTP when
/// insecure traffic is configured at all.
pub(crate) fn virtual_ports(vs: &VirtualServer) -> Vec<PortProto> {
    let http = PortProto {
        protocol: Protocol::Http,
        port: effective_http_port(vs),
    };
    let https = PortProto {
        protocol: Protocol::Https,
        port: effective_https_port(vs),
    };
    if is_tls_virtual(vs) {
        let mut ports = vec![https];
        if !vs.spec.http_traffic.is_empty() {
            ports.push(http);
        }
        ports
    } else {
        vec![http]
    }
}

fn http_traffic_normalized(vs: &VirtualServer) -> &str {
    match vs.spec.http_traffic.as_str() {
        "none" => "",
        other => other,
    }
}

/// Whether `vrt` is port-incompatible with `current` and sits out this
/// group. Working through the shared-port combinations:
///   - same HTTP and HTTPS ports: keep
///   - no port in common: skip
///   - only HTTPS shared: keep only if both are secured
///   - only HTTP shared: keep only if every secured side actually handles
///     HTTP traffic on it
pub(crate) fn skip_virtual(current: &VirtualServer, vrt: &VirtualServer) -> bool {
    let same_https = effective_https_port(current) == effective_https_port(vrt);
    let same_http = effective_http_port(current) == effective_http_port(vrt);

    if same_https && same_http {
        return false;
    }
    if !same_https && !same_http {
        return true;
    }
    if same_https {
        return !(is_tls_virtual(current) && is_tls_virtual(vrt));
    }

    // only the HTTP port is shared
    let current_traffic = http_traffic_normalized(current);
    let vrt_traffic = http_traffic_normalized(vrt);
    if is_tls_virtual(current) && is_tls_virtual(vrt) {
        return current_traffic.is_empty() || vrt_traffic.is_empty();
    }
    if is_tls_virtual(current) && current_traffic.is_empty() {
        return true;
    }
    if is_tls_virtual(vrt) && vrt_traffic.is_empty() {
        return true;
    }
    false
}

/// Collect the virtuals merging with `current` into one config.
///
/// The group dissolves entirely (empty result) when members disagree on the
/// address or IPAM label for a host, or when a hostless virtual carries an
/// IPAM label. Individually incompatible members are merely skipped, and a
/// member re-claiming a (host, path) already claimed by an earlier member is
/// silently dropped.
pub(crate) fn associated_virtual_servers<'a>(
    current: &VirtualServer,
    all: &[&'a VirtualServer],
    is_deleted: bool,
    ipam_enabled: bool,
) -> Vec<&'a VirtualServer> {
    let mut group: Vec<&VirtualServer> = Vec::new();
    let mut host_paths: std::collections::HashMap<&str, std::collections::HashSet<&str>> =
        Default::default();

    for vrt in all {
        if is_deleted && vrt.metadata.name == current.metadata.name {
            continue;
        }
        if vrt.spec.host_group != current.spec.host_group {
            continue;
        }

        if current.spec.host_group.is_empty() {
            if vrt.spec.host != current.spec.host {
                continue;
            }
            if vrt.spec.virtual_server_address != current.spec.virtual_server_address {
                if !vrt.spec.host.is_empty() {
                    error!(
                        host = %vrt.spec.host,
                        "host is configured with more than one virtualServerAddress"
                    );
                    return Vec::new();
                }
                // hostless virtuals on another address are simply elsewhere
                continue;
            }
        }

        if ipam_enabled {
            if current.spec.host_group.is_empty() && vrt.spec.ipam_label != current.spec.ipam_label
            {
                error!(
                    host = %vrt.spec.host,
                    "host is configured with conflicting ipam labels"
                );
                return Vec::new();
            }
            if !vrt.spec.ipam_label.is_empty() && vrt.spec.host.is_empty() {
                error!(
                    name = ?vrt.metadata.name,
                    "hostless virtual cannot carry an ipam label"
                );
                return Vec::new();
            }
        }

        if skip_virtual(current, vrt) {
            continue;
        }

        let paths = host_paths.entry(vrt.spec.host.as_str()).or_default();
        let mut unique = true;
        for pool in &vrt.spec.pools {
            if !paths.insert(pool.path.as_str()) {
                // first claimer of a (host, path) wins
                debug!(
                    name = ?vrt.metadata.name,
                    path = %pool.path,
                    "discarding virtual with duplicate path"
                );
                unique = false;
                break;
            }
        }
        if unique {
            group.push(vrt);
        }
    }
    group
}

/// The group's IPAM label: first non-empty one wins.
pub(crate) fn group_ipam_label(group: &[&VirtualServer]) -> String {
    group
        .iter()
        .map(|vs| vs.spec.ipam_label.as_str())
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// The group's address. Every member that sets one must agree.
pub(crate) fn group_virtual_address(group: &[&VirtualServer]) -> anyhow::Result<String> {
    let mut addr = "";
    for vs in group {
        let vsa = vs.spec.virtual_server_address.as_str();
        if !vsa.is_empty() {
            if addr.is_empty() || addr == vsa {
                addr = vsa;
            } else {
                anyhow::bail!("more than one virtual server address found");
            }
        }
    }
    if !group.is_empty() && addr.is_empty() {
        anyhow::bail!("no virtual server address found");
    }
    Ok(addr.to_string())
}

/// Resolve a virtual's TLSProfile, validating that its referenced secrets
/// exist and its hosts cover the virtual's host. A hostless virtual accepts
/// any profile, serving as the shared-services fallback under SNI.
pub(crate) fn tls_profile_for_virtual<'a>(
    index: &'a ResourceIndex,
    vs: &VirtualServer,
    namespace: &str,
) -> Option<&'a TLSProfile> {
    let name = &vs.spec.tls_profile_name;
    let profile = index
        .tls_profiles
        .get(&(namespace.to_string(), name.clone()))?;

    if profile.spec.tls.reference == TLS_REFERENCE_SECRET {
        let mut secrets: Vec<&String> = profile.spec.tls.client_ssls.iter().collect();
        if secrets.is_empty() && !profile.spec.tls.client_ssl.is_empty() {
            secrets.push(&profile.spec.tls.client_ssl);
        }
        let found = !secrets.is_empty()
            && secrets.iter().all(|secret| {
                index
                    .secrets
                    .contains_key(&(namespace.to_string(), (*secret).clone()))
            });
        if !found {
            error!(profile = %name, "tls profile references missing secrets");
            return None;
        }
    }

    if vs.spec.host.is_empty() {
        return Some(profile);
    }
    if profile
        .spec
        .hosts
        .iter()
        .any(|host| host_matches(host, &vs.spec.host))
    {
        return Some(profile);
    }
    error!(
        profile = %name,
        host = %vs.spec.host,
        "tls profile hosts do not cover the virtual's host"
    );
    None
}

/// Virtuals referencing a TLSProfile, for requeueing on profile changes.
pub(crate) fn virtuals_for_tls_profile<'a>(
    index: &'a ResourceIndex,
    namespace: &'a str,
    profile_name: &str,
) -> Vec<&'a VirtualServer> {
    index
        .virtual_servers_in_namespace(namespace)
        .filter(|vs| vs.spec.tls_profile_name == profile_name)
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::{VirtualServerSpec, VsPool};

    fn vs(name: &str, spec: VirtualServerSpec) -> VirtualServer {
        let mut vs = VirtualServer::new(name, spec);
        vs.metadata.namespace = Some("default".to_string());
        vs
    }

    fn hosted(name: &str, host: &str, addr: &str, path: &str) -> VirtualServer {
        vs(
            name,
            VirtualServerSpec {
                host: host.to_string(),
                virtual_server_address: addr.to_string(),
                pools: vec![VsPool {
                    path: path.to_string(),
                    service: "svc1".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
        )
    }

    fn secured(name: &str, https_port: i32, http_port: i32, traffic: &str) -> VirtualServer {
        vs(
            name,
            VirtualServerSpec {
                host: "foo.com".to_string(),
                tls_profile_name: "tls1".to_string(),
                virtual_server_https_port: https_port,
                virtual_server_http_port: http_port,
                http_traffic: traffic.to_string(),
                ..Default::default()
            },
        )
    }

    fn unsecured(name: &str, http_port: i32) -> VirtualServer {
        vs(
            name,
            VirtualServerSpec {
                host: "foo.com".to_string(),
                virtual_server_http_port: http_port,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_effective_ports_default() {
        let plain = unsecured("vs1", 0);
        assert_eq!(effective_http_port(&plain), 80);
        assert_eq!(effective_https_port(&plain), 443);

        let custom = secured("vs2", 8443, 8080, "");
        assert_eq!(effective_http_port(&custom), 8080);
        assert_eq!(effective_https_port(&custom), 8443);
    }

    #[test]
    fn test_skip_virtual_port_compatibility() {
        // same ports on both sides: never skipped
        assert!(!skip_virtual(&unsecured("a", 0), &unsecured("b", 0)));
        // no shared port: skipped
        assert!(skip_virtual(
            &secured("a", 8443, 8080, "allow"),
            &secured("b", 9443, 9090, "allow")
        ));
        // only HTTPS shared: both must be secured
        assert!(!skip_virtual(
            &secured("a", 443, 8080, ""),
            &secured("b", 443, 9090, "")
        ));
        assert!(skip_virtual(
            &secured("a", 443, 8080, ""),
            &unsecured("b", 9090)
        ));
        // only HTTP shared, both secured: both must handle HTTP traffic
        assert!(!skip_virtual(
            &secured("a", 8443, 80, "allow"),
            &secured("b", 9443, 80, "redirect")
        ));
        assert!(skip_virtual(
            &secured("a", 8443, 80, "none"),
            &secured("b", 9443, 80, "allow")
        ));
        // only HTTP shared, one secured: the secured one must handle HTTP
        assert!(skip_virtual(
            &secured("a", 8443, 80, ""),
            &unsecured("b", 80)
        ));
        assert!(!skip_virtual(
            &secured("a", 8443, 80, "allow"),
            &unsecured("b", 80)
        ));
    }

    #[test]
    fn test_association_groups_by_host() {
        let a = hosted("a", "foo.com", "10.8.0.1", "/foo");
        let b = hosted("b", "foo.com", "10.8.0.1", "/bar");
        let c = hosted("c", "bar.com", "10.8.0.2", "/baz");
        let all = [&a, &b, &c];

        let group = associated_virtual_servers(&a, &all, false, false);
        let names: Vec<_> = group
            .iter()
            .map(|vs| vs.metadata.name.clone().unwrap_or_default())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_same_host_different_address_invalidates_group() {
        let a = hosted("a", "foo.com", "10.8.0.1", "/foo");
        let b = hosted("b", "foo.com", "10.8.0.2", "/bar");
        let all = [&a, &b];
        assert!(associated_virtual_servers(&a, &all, false, false).is_empty());
    }

    #[test]
    fn test_duplicate_path_drops_later_virtual() {
        let a = hosted("a", "foo.com", "10.8.0.1", "/foo");
        let b = hosted("b", "foo.com", "10.8.0.1", "/foo");
        let all = [&a, &b];

        let group = associated_virtual_servers(&a, &all, false, false);
        assert_eq!(group.len(), 1);
        assert_eq!(group[0].metadata.name.as_deref(), Some("a"));
    }

    #[test]
    fn test_deleted_virtual_excluded_from_group() {
        let a = hosted("a", "foo.com", "10.8.0.1", "/foo");
        let b = hosted("b", "foo.com", "10.8.0.1", "/bar");
        let all = [&a, &b];

        let group = associated_virtual_servers(&a, &all, true, false);
        assert_eq!(group.len(), 1);
        assert_eq!(group[0].metadata.name.as_deref(), Some("b"));
    }

    #[test]
    fn test_ipam_label_conflicts_invalidate_group() {
        let mut a = hosted("a", "foo.com", "", "/foo");
        a.spec.ipam_label = "prod".to_string();
        let mut b = hosted("b", "foo.com", "", "/bar");
        b.spec.ipam_label = "staging".to_string();
        let all = [&a, &b];
        assert!(associated_virtual_servers(&a, &all, false, true).is_empty());

        // without ipam the labels are ignored
        assert_eq!(associated_virtual_servers(&a, &all, false, false).len(), 2);
    }

    #[test]
    fn test_hostless_virtual_with_ipam_label_invalidates_group() {
        let mut a = hosted("a", "", "", "/foo");
        a.spec.ipam_label = "prod".to_string();
        let all = [&a];
        assert!(associated_virtual_servers(&a, &all, false, true).is_empty());
    }

    #[test]
    fn test_host_group_spans_hosts() {
        let mut a = hosted("a", "foo.com", "10.8.0.1", "/foo");
        a.spec.host_group = "apps".to_string();
        let mut b = hosted("b", "bar.com", "10.8.0.9", "/bar");
        b.spec.host_group = "apps".to_string();
        let c = hosted("c", "baz.com", "10.8.0.1", "/baz");
        let all = [&a, &b, &c];

        let group = associated_virtual_servers(&a, &all, false, false);
        assert_eq!(group.len(), 2);
    }

    #[test]
    fn test_group_address_must_agree() {
        let a = hosted("a", "foo.com", "10.8.0.1", "/foo");
        let b = hosted("b", "bar.com", "10.8.0.2", "/bar");
        assert!(group_virtual_address(&[&a]).is_ok());
        assert!(group_virtual_address(&[&a, &b]).is_err());

        let hostless = hosted("c", "", "", "/baz");
        assert!(group_virtual_address(&[&hostless]).is_err());
        assert!(group_virtual_address(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_virtual_ports() {
        let plain = unsecured("a", 0);
        assert_eq!(
            virtual_ports(&plain),
            vec![PortProto {
                protocol: Protocol::Http,
                port: 80
            }]
        );

        let tls = secured("b", 0, 0, "redirect");
        assert_eq!(
            virtual_ports(&tls),
            vec![
                PortProto {
                    protocol: Protocol::Https,
                    port: 443
                },
                PortProto {
                    protocol: Protocol::Http,
                    port: 80
                },
            ]
        );

        let tls_only = secured("c", 0, 0, "");
        assert_eq!(virtual_ports(&tls_only).len(), 1);
    }

    #[test]
    fn test_tls_profile_host_coverage() {
        use crate::api::{TLSProfileSpec, TlsSettings};

        let mut index = ResourceIndex::default();
        let mut profile = TLSProfile::new(
            "tls1",
            TLSProfileSpec {
                hosts: vec!["*.foo.com".to_string()],
                tls: TlsSettings {
                    termination: "edge".to_string(),
                    reference: "bigip".to_string(),
                    client_ssl: "/Common/clientssl".to_string(),
                    ..Default::default()
                },
            },
        );
        profile.metadata.namespace = Some("default".to_string());
        index
            .tls_profiles
            .insert(("default".to_string(), "tls1".to_string()), profile);

        let mut matching = secured("a", 0, 0, "");
        matching.spec.host = "app.foo.com".to_string();
        assert!(tls_profile_for_virtual(&index, &matching, "default").is_some());

        let mut other = secured("b", 0, 0, "");
        other.spec.host = "app.bar.com".to_string();
        assert!(tls_profile_for_virtual(&index, &other, "default").is_none());

        // hostless virtuals take any profile
        let mut hostless = secured("c", 0, 0, "");
        hostless.spec.host = String::new();
        assert!(tls_profile_for_virtual(&index, &hostless, "default").is_some());
    }
}
