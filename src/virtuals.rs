//! Deriving device configs from VirtualServer and TransportServer resources.
//!
//! A VirtualServer event re-derives its whole association group: the group is
//! resolved, an address is settled (spec, group consensus or IPAM), and one
//! config per claimed port is rebuilt from scratch and installed. Transport
//! servers are simpler, one config per resource.

use anyhow::{anyhow, Result};
use tracing::{debug, error};

use crate::api::{
    HealthMonitor, TLSProfile, TlsSettings, TransportServer, VirtualServer, HTTP_TRAFFIC_REDIRECT,
    TLS_EDGE, TLS_PASSTHROUGH, TLS_REENCRYPT, TLS_REFERENCE_BIGIP, TLS_REFERENCE_SECRET,
};
use crate::assoc;
use crate::ipam::{self, IpRequest};
use crate::members;
use crate::model::{
    format_custom_virtual_server_name, format_pool_name, format_virtual_server_name,
    get_rscfg_res_name, ConfigOrigin, CustomProfile, IRule, Monitor, NameRef, Pool, ProfileRef,
    Protocol, ResourceConfig, SecretKey, DEFAULT_SNAT, HTTPS_REDIRECT_IRULE_NAME,
};
use crate::queue::ResourceKind;
use crate::store::ResourceRef;
use crate::worker::{apply_policy, Controller};

/// The iRule bouncing insecure requests to their TLS sibling.
pub(crate) fn http_redirect_irule(rs_name: &str, partition: &str, https_port: i32) -> IRule {
    let code = format!(
        "when HTTP_REQUEST {{\n    \
             HTTP::redirect https://[getfield [HTTP::host] \":\" 1]:{https_port}[HTTP::uri]\n\
         }}"
    );
    IRule {
        name: get_rscfg_res_name(rs_name, HTTPS_REDIRECT_IRULE_NAME),
        partition: partition.to_string(),
        code,
    }
}

/// Attach a pool's health monitors: named ones are referenced as-is,
/// anonymous ones are created next to the config.
pub(crate) fn attach_monitors(
    cfg: &mut ResourceConfig,
    pool: &mut Pool,
    monitors: &[HealthMonitor],
    partition: &str,
) {
    for m in monitors {
        if !m.name.is_empty() {
            pool.monitor_names.push(m.name.clone());
            continue;
        }
        if m.monitor_type.is_empty() {
            continue;
        }
        let name = format!("{}_{}", pool.name, m.monitor_type);
        cfg.monitors.push(Monitor {
            name: name.clone(),
            partition: partition.to_string(),
            monitor_type: m.monitor_type.clone(),
            interval: m.interval,
            timeout: m.timeout,
            send: m.send.clone(),
            recv: m.recv.clone(),
            target_port: m.target_port,
        });
        pool.monitor_names.push(name);
    }
}

fn check_valid_virtual_server(vs: &VirtualServer) -> bool {
    let name = vs.metadata.name.as_deref().unwrap_or_default();
    if vs.spec.tls_profile_name.is_empty() && !vs.spec.http_traffic.is_empty() {
        error!(virtual = %name, "httpTraffic requires a tlsProfileName");
        return false;
    }
    if vs.spec.pools.is_empty() {
        error!(virtual = %name, "virtual server has no pools");
        return false;
    }
    true
}

fn check_valid_transport_server(ts: &TransportServer) -> bool {
    let name = ts.metadata.name.as_deref().unwrap_or_default();
    if ts.spec.virtual_server_port == 0 {
        error!(transport = %name, "transport server has no virtualServerPort");
        return false;
    }
    if ts.spec.pool.service.is_empty() {
        error!(transport = %name, "transport server has no pool service");
        return false;
    }
    true
}

impl Controller {
    pub(crate) async fn process_virtual_servers(
        &mut self,
        current: &VirtualServer,
        is_deleted: bool,
    ) -> Result<()> {
        let namespace = current.metadata.namespace.clone().unwrap_or_default();
        let name = current.metadata.name.clone().unwrap_or_default();
        if !is_deleted && !check_valid_virtual_server(current) {
            return Ok(());
        }
        debug!(virtual = %name, %namespace, deleted = is_deleted, "processing virtual server");

        // hostGroup merges across every watched namespace
        let all: Vec<VirtualServer> = if current.spec.host_group.is_empty() {
            self.index
                .virtual_servers_in_namespace(&namespace)
                .cloned()
                .collect()
        } else {
            self.index.virtual_servers.values().cloned().collect()
        };
        let all_refs: Vec<&VirtualServer> = all.iter().collect();
        let group: Vec<VirtualServer> =
            assoc::associated_virtual_servers(current, &all_refs, is_deleted, self.ipam.is_some())
                .into_iter()
                .cloned()
                .collect();
        let group_refs: Vec<&VirtualServer> = group.iter().collect();

        let key = if current.spec.host_group.is_empty() {
            ipam::host_key(&namespace, &current.spec.host)
        } else {
            ipam::host_group_key(&current.spec.host_group)
        };

        let ip = if self.ipam.is_some() {
            if is_deleted && group.is_empty() && current.spec.virtual_server_address.is_empty() {
                self.release_ip(&current.spec.ipam_label, &current.spec.host, &key)
                    .await
            } else if !current.spec.virtual_server_address.is_empty() {
                current.spec.virtual_server_address.clone()
            } else {
                let label = match assoc::group_ipam_label(&group_refs) {
                    l if l.is_empty() => current.spec.ipam_label.clone(),
                    l => l,
                };
                let host = if current.spec.host_group.is_empty() {
                    current.spec.host.as_str()
                } else {
                    ""
                };
                match self.request_ip(&label, host, &key).await {
                    IpRequest::NotEnabled => {
                        debug!("ipam resource not available");
                        return Ok(());
                    }
                    IpRequest::InvalidInput => {
                        debug!(virtual = %name, "invalid ipam inputs for virtual server");
                        return Ok(());
                    }
                    IpRequest::NotRequested => {
                        return Err(anyhow!("unable to make ipam request, will be re-requested"))
                    }
                    IpRequest::Requested => {
                        debug!(host = %current.spec.host, "address requested for host");
                        return Ok(());
                    }
                    IpRequest::Allocated(addr) => addr,
                }
            }
        } else if current.spec.host_group.is_empty() {
            match assoc::group_virtual_address(&group_refs) {
                Ok(addr) => addr,
                Err(e) => return Err(anyhow!("{name}: {e}")),
            }
        } else {
            match assoc::group_virtual_address(&group_refs) {
                Ok(addr) if !addr.is_empty() => addr,
                _ if !current.spec.virtual_server_address.is_empty() => {
                    current.spec.virtual_server_address.clone()
                }
                Ok(addr) => addr,
                Err(e) => return Err(anyhow!("{name}: {e}")),
            }
        };

        let partition = self.store.default_partition.clone();
        for port_proto in assoc::virtual_ports(current) {
            let rs_name = if current.spec.virtual_server_name.is_empty() {
                format_virtual_server_name(&ip, port_proto.port)
            } else {
                format_custom_virtual_server_name(
                    &current.spec.virtual_server_name,
                    port_proto.port,
                )
            };

            let drop_http = port_proto.protocol == Protocol::Http
                && !assoc::group_handles_http(&group_refs, current);
            let drop_https = is_deleted
                && port_proto.protocol == Protocol::Https
                && !assoc::group_uses_same_https_port(&group_refs, current);
            if group.is_empty() || drop_http || drop_https {
                let hostnames = self
                    .store
                    .get_virtual_server(&partition, &rs_name)
                    .map(|cfg| cfg.meta.hosts.clone())
                    .unwrap_or_default();
                self.store.delete_virtual_server(&partition, &rs_name);
                if !hostnames.is_empty() {
                    self.process_associated_external_dns(&hostnames);
                }
                continue;
            }

            let mut cfg = ResourceConfig::default();
            cfg.meta.origin = ConfigOrigin::VirtualServer;
            cfg.meta.namespace = namespace.clone();
            cfg.meta.protocol = port_proto.protocol;
            cfg.meta.http_traffic = current.spec.http_traffic.clone();
            cfg.virtual_server.partition = partition.clone();
            cfg.virtual_server.enabled = true;
            cfg.virtual_server.name = rs_name.clone();
            cfg.virtual_server.snat = DEFAULT_SNAT.to_string();
            cfg.virtual_server.http_mrf_routing_enabled = current.spec.http_mrf_routing_enabled;
            cfg.virtual_server.set_virtual_address(&ip, port_proto.port);
            if !current.spec.snat.is_empty() {
                cfg.virtual_server.snat = current.spec.snat.clone();
            }

            let mut processing_error = false;
            let policy_ref = group
                .iter()
                .find(|vrt| !vrt.spec.policy_name.is_empty())
                .map(|vrt| {
                    (
                        vrt.metadata.namespace.clone().unwrap_or_default(),
                        vrt.spec.policy_name.clone(),
                    )
                });
            if let Some((plc_ns, plc_name)) = policy_ref {
                match self.get_policy(&plc_ns, &plc_name) {
                    Some(plc) => apply_policy(&mut cfg, &plc),
                    None => {
                        error!(policy = %plc_name, namespace = %plc_ns, "referenced policy not found");
                        processing_error = true;
                    }
                }
            }

            if !processing_error {
                for vrt in &group {
                    let vrt_namespace = vrt.metadata.namespace.clone().unwrap_or_default();
                    let vrt_name = vrt.metadata.name.clone().unwrap_or_default();

                    let mut tls_profile: Option<TLSProfile> = None;
                    if assoc::is_tls_virtual(vrt) {
                        match assoc::tls_profile_for_virtual(&self.index, vrt, &vrt_namespace) {
                            Some(profile) => tls_profile = Some(profile.clone()),
                            None => {
                                processing_error = true;
                                break;
                            }
                        }
                    }
                    let passthrough = tls_profile
                        .as_ref()
                        .is_some_and(|p| p.spec.tls.termination == TLS_PASSTHROUGH);

                    cfg.meta
                        .base_resources
                        .insert(format!("{vrt_namespace}/{vrt_name}"), "VirtualServer".to_string());
                    self.prepare_rscfg_from_virtual_server(&mut cfg, vrt, passthrough);
                    if let Some(profile) = &tls_profile {
                        if !self.handle_virtual_server_tls(&mut cfg, vrt, profile) {
                            processing_error = true;
                            break;
                        }
                    }
                    self.store.processed_native_resources.insert(ResourceRef {
                        kind: ResourceKind::VirtualServer.as_str().to_string(),
                        namespace: vrt_namespace,
                        name: vrt_name,
                    });
                }
            }
            if processing_error {
                error!(virtual = %name, "discarding configuration due to processing errors");
                break;
            }

            members::update_pool_members(self.mode, &self.store, &self.index, &mut cfg, &namespace);
            let hostnames = cfg.meta.hosts.clone();
            self.store
                .partition_resource_map(&partition)
                .insert(rs_name, cfg);
            if !hostnames.is_empty() {
                self.process_associated_external_dns(&hostnames);
            }
        }

        if !is_deleted {
            self.status.virtual_server(current, &ip, "Ok").await;
        }
        Ok(())
    }

    /// Fold one group member's pools and forwarding rules into the config.
    fn prepare_rscfg_from_virtual_server(
        &self,
        cfg: &mut ResourceConfig,
        vrt: &VirtualServer,
        passthrough: bool,
    ) {
        let vrt_namespace = vrt.metadata.namespace.clone().unwrap_or_default();
        if !vrt.spec.host.is_empty() && !cfg.meta.hosts.contains(&vrt.spec.host) {
            cfg.meta.hosts.push(vrt.spec.host.clone());
        }
        let policy_name = get_rscfg_res_name(&cfg.virtual_server.name, "policy");
        let partition = cfg.virtual_server.partition.clone();

        for vs_pool in &vrt.spec.pools {
            let pool_namespace = if vs_pool.service_namespace.is_empty() {
                vrt_namespace.clone()
            } else {
                vs_pool.service_namespace.clone()
            };
            let pool_name = if vs_pool.name.is_empty() {
                format_pool_name(&vs_pool.service, &vs_pool.service_port, &pool_namespace)
            } else {
                vs_pool.name.clone()
            };
            if !cfg.pools.iter().any(|p| p.name == pool_name) {
                let mut pool = Pool {
                    name: pool_name.clone(),
                    partition: partition.clone(),
                    service_name: vs_pool.service.clone(),
                    service_namespace: pool_namespace,
                    service_port: vs_pool.service_port.clone(),
                    balance: vs_pool.balance.clone(),
                    node_member_label: vs_pool.node_member_label.clone(),
                    ..Default::default()
                };
                attach_monitors(cfg, &mut pool, &vs_pool.monitors, &partition);
                cfg.pools.push(pool);
            }

            // passthrough traffic is routed by SNI, not by L7 policy
            if passthrough {
                continue;
            }
            let full_uri = format!("{}{}", vrt.spec.host, vs_pool.path);
            let rule = forwarding_rule(&vrt.spec.host, &vs_pool.path, &pool_name, &full_uri);
            cfg.add_rule_to_policy(&policy_name, rule);
        }
    }

    /// Apply a TLSProfile to one side of a virtual. On the HTTPS config this
    /// installs termination and SSL profiles; on the HTTP sibling it installs
    /// the redirect iRule when the virtual redirects insecure traffic.
    fn handle_virtual_server_tls(
        &self,
        cfg: &mut ResourceConfig,
        vrt: &VirtualServer,
        profile: &TLSProfile,
    ) -> bool {
        let tls = &profile.spec.tls;

        if cfg.meta.protocol != Protocol::Https {
            if vrt.spec.http_traffic == HTTP_TRAFFIC_REDIRECT {
                let irule = http_redirect_irule(
                    &cfg.virtual_server.name,
                    &cfg.virtual_server.partition,
                    assoc::effective_https_port(vrt),
                );
                if !cfg.virtual_server.irules.contains(&irule.name) {
                    cfg.virtual_server.irules.push(irule.name.clone());
                }
                cfg.irules_map.insert(
                    NameRef {
                        name: irule.name.clone(),
                        partition: irule.partition.clone(),
                    },
                    irule,
                );
            }
            return true;
        }

        cfg.virtual_server.tls_termination = tls.termination.clone();
        match tls.termination.as_str() {
            TLS_PASSTHROUGH => true,
            TLS_EDGE => self.add_ssl_profiles(cfg, vrt, tls, "clientside"),
            TLS_REENCRYPT => {
                self.add_ssl_profiles(cfg, vrt, tls, "clientside")
                    && self.add_ssl_profiles(cfg, vrt, tls, "serverside")
            }
            other => {
                error!(termination = %other, "unknown TLS termination");
                false
            }
        }
    }

    fn add_ssl_profiles(
        &self,
        cfg: &mut ResourceConfig,
        vrt: &VirtualServer,
        tls: &TlsSettings,
        context: &str,
    ) -> bool {
        let namespace = vrt.metadata.namespace.clone().unwrap_or_default();
        let (named, single) = if context == "clientside" {
            (&tls.client_ssls, &tls.client_ssl)
        } else {
            (&tls.server_ssls, &tls.server_ssl)
        };
        let mut refs: Vec<String> = named.clone();
        if refs.is_empty() && !single.is_empty() {
            refs.push(single.clone());
        }

        match tls.reference.as_str() {
            TLS_REFERENCE_BIGIP => {
                for profile in refs {
                    cfg.virtual_server.profiles.push(ProfileRef {
                        name: profile,
                        partition: String::new(),
                        context: context.to_string(),
                        namespace: namespace.clone(),
                    });
                }
                true
            }
            TLS_REFERENCE_SECRET => {
                for secret_name in refs {
                    let Some(secret) = self
                        .index
                        .secrets
                        .get(&(namespace.clone(), secret_name.clone()))
                    else {
                        error!(secret = %secret_name, %namespace, "referenced secret not found");
                        return false;
                    };
                    let data = secret.data.clone().unwrap_or_default();
                    let field = |key: &str| {
                        data.get(key)
                            .map(|b| String::from_utf8_lossy(&b.0).to_string())
                            .unwrap_or_default()
                    };
                    cfg.custom_profiles.insert(
                        SecretKey {
                            name: secret_name.clone(),
                            resource_name: cfg.virtual_server.name.clone(),
                        },
                        CustomProfile {
                            name: secret_name.clone(),
                            partition: cfg.virtual_server.partition.clone(),
                            context: context.to_string(),
                            cert: field("tls.crt"),
                            key: if context == "clientside" {
                                field("tls.key")
                            } else {
                                String::new()
                            },
                            server_name: vrt.spec.host.clone(),
                            sni_default: false,
                            ca_file: String::new(),
                            tls_version: String::new(),
                            ciphers: String::new(),
                            cipher_group: String::new(),
                        },
                    );
                    cfg.virtual_server.profiles.push(ProfileRef {
                        name: secret_name,
                        partition: cfg.virtual_server.partition.clone(),
                        context: context.to_string(),
                        namespace: namespace.clone(),
                    });
                }
                true
            }
            other => {
                error!(reference = %other, "unknown TLS reference type");
                false
            }
        }
    }

    pub(crate) async fn process_transport_servers(
        &mut self,
        ts: &TransportServer,
        is_deleted: bool,
    ) -> Result<()> {
        let namespace = ts.metadata.namespace.clone().unwrap_or_default();
        let name = ts.metadata.name.clone().unwrap_or_default();
        if !is_deleted && !check_valid_transport_server(ts) {
            return Ok(());
        }
        debug!(transport = %name, %namespace, deleted = is_deleted, "processing transport server");

        let key = if ts.spec.host_group.is_empty() {
            ipam::ts_key(&namespace, &name)
        } else {
            ipam::host_group_key(&ts.spec.host_group)
        };

        let ip = if self.ipam.is_some() {
            if is_deleted && ts.spec.virtual_server_address.is_empty() {
                self.release_ip(&ts.spec.ipam_label, "", &key).await
            } else if !ts.spec.virtual_server_address.is_empty() {
                ts.spec.virtual_server_address.clone()
            } else {
                match self.request_ip(&ts.spec.ipam_label, "", &key).await {
                    IpRequest::NotEnabled => {
                        debug!("ipam resource not available");
                        return Ok(());
                    }
                    IpRequest::InvalidInput => {
                        debug!(transport = %name, "invalid ipam inputs for transport server");
                        return Ok(());
                    }
                    IpRequest::NotRequested => {
                        return Err(anyhow!("unable to make ipam request, will be re-requested"))
                    }
                    IpRequest::Requested => {
                        debug!(transport = %name, "address requested for transport server");
                        return Ok(());
                    }
                    IpRequest::Allocated(addr) => addr,
                }
            }
        } else {
            if ts.spec.virtual_server_address.is_empty() {
                return Err(anyhow!(
                    "no virtualServerAddress on transport server {name} and ipam not enabled"
                ));
            }
            ts.spec.virtual_server_address.clone()
        };

        let port = ts.spec.virtual_server_port;
        let rs_name = if ts.spec.virtual_server_name.is_empty() {
            format_virtual_server_name(&ip, port)
        } else {
            format_custom_virtual_server_name(&ts.spec.virtual_server_name, port)
        };
        let partition = self.store.default_partition.clone();

        if is_deleted {
            self.store.delete_virtual_server(&partition, &rs_name);
            return Ok(());
        }

        let mut cfg = ResourceConfig::default();
        cfg.meta.origin = ConfigOrigin::TransportServer;
        cfg.meta.namespace = namespace.clone();
        cfg.meta
            .base_resources
            .insert(format!("{namespace}/{name}"), "TransportServer".to_string());
        cfg.virtual_server.partition = partition.clone();
        cfg.virtual_server.enabled = true;
        cfg.virtual_server.name = rs_name.clone();
        cfg.virtual_server.mode = ts.spec.mode.clone();
        cfg.virtual_server.ip_protocol = if ts.spec.protocol.is_empty() {
            "tcp".to_string()
        } else {
            ts.spec.protocol.clone()
        };
        cfg.virtual_server.set_virtual_address(&ip, port);

        if !ts.spec.policy_name.is_empty() {
            match self.get_policy(&namespace, &ts.spec.policy_name) {
                Some(plc) => apply_policy(&mut cfg, &plc),
                None => {
                    error!(
                        policy = %ts.spec.policy_name, %namespace,
                        "referenced policy not found, discarding transport server configuration"
                    );
                    return Ok(());
                }
            }
        }

        let pool_name = if ts.spec.pool.name.is_empty() {
            format_pool_name(&ts.spec.pool.service, &ts.spec.pool.service_port, &namespace)
        } else {
            ts.spec.pool.name.clone()
        };
        let mut pool = Pool {
            name: pool_name,
            partition: partition.clone(),
            service_name: ts.spec.pool.service.clone(),
            service_namespace: namespace.clone(),
            service_port: ts.spec.pool.service_port.clone(),
            balance: ts.spec.pool.balance.clone(),
            node_member_label: ts.spec.pool.node_member_label.clone(),
            ..Default::default()
        };
        attach_monitors(&mut cfg, &mut pool, &ts.spec.pool.monitors, &partition);
        cfg.virtual_server.pool_name = pool.name.clone();
        cfg.pools.push(pool);

        members::update_pool_members(self.mode, &self.store, &self.index, &mut cfg, &namespace);
        self.store
            .partition_resource_map(&partition)
            .insert(rs_name, cfg);

        self.status.transport_server(ts, &ip, "Ok").await;
        Ok(())
    }
}

/// A first-match forwarding rule for one (host, path) claim.
pub(crate) fn forwarding_rule(host: &str, path: &str, pool_name: &str, full_uri: &str) -> crate::model::Rule {
    let mut conditions = Vec::new();
    if !host.is_empty() {
        conditions.push(crate::model::Condition {
            name: "0".to_string(),
            host: Some(host.to_string()),
            path_segment: None,
            request: true,
        });
    }
    for (i, segment) in path.split('/').filter(|s| !s.is_empty()).enumerate() {
        conditions.push(crate::model::Condition {
            name: (i + 1).to_string(),
            host: None,
            path_segment: Some(segment.to_string()),
            request: true,
        });
    }
    crate::model::Rule {
        name: rule_name(full_uri, pool_name),
        full_uri: full_uri.to_string(),
        ordinal: 0,
        conditions,
        actions: vec![crate::model::Action {
            name: "0".to_string(),
            forward: true,
            request: true,
            pool: pool_name.to_string(),
            ..Default::default()
        }],
    }
}

fn rule_name(full_uri: &str, pool_name: &str) -> String {
    let uri = full_uri.replace(['.', ':', '/', '%', '*'], "_");
    format!("vs_{uri}_{pool_name}")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::{TsPool, VirtualServerSpec, VsPool};
    use crate::api::PortId;

    fn vs(name: &str, spec: VirtualServerSpec) -> VirtualServer {
        let mut vs = VirtualServer::new(name, spec);
        vs.metadata.namespace = Some("default".to_string());
        vs
    }

    #[test]
    fn redirect_irule_targets_the_https_port() {
        let irule = http_redirect_irule("crd_10_1_1_1_80", "test", 8443);
        assert_eq!(irule.name, "crd_10_1_1_1_80_http_redirect_irule");
        assert!(irule.code.contains(":8443[HTTP::uri]"));
    }

    #[test]
    fn forwarding_rule_splits_path_segments() {
        let rule = forwarding_rule("cafe.example.com", "/coffee/dark", "svc_80_default", "cafe.example.com/coffee/dark");
        assert_eq!(rule.conditions.len(), 3);
        assert_eq!(rule.conditions[0].host.as_deref(), Some("cafe.example.com"));
        assert_eq!(rule.conditions[1].path_segment.as_deref(), Some("coffee"));
        assert_eq!(rule.conditions[2].path_segment.as_deref(), Some("dark"));
        assert!(rule.actions[0].forward);
        assert_eq!(rule.actions[0].pool, "svc_80_default");
    }

    #[test]
    fn anonymous_monitors_are_created_next_to_the_config() {
        let mut cfg = ResourceConfig::default();
        let mut pool = Pool {
            name: "svc_80_default".to_string(),
            ..Default::default()
        };
        let monitors = vec![
            HealthMonitor {
                monitor_type: "http".to_string(),
                interval: 5,
                timeout: 15,
                ..Default::default()
            },
            HealthMonitor {
                name: "/Common/custom".to_string(),
                ..Default::default()
            },
        ];
        attach_monitors(&mut cfg, &mut pool, &monitors, "test");
        assert_eq!(pool.monitor_names, vec!["svc_80_default_http", "/Common/custom"]);
        assert_eq!(cfg.monitors.len(), 1);
        assert_eq!(cfg.monitors[0].interval, 5);
    }

    #[test]
    fn virtual_without_pools_is_invalid() {
        let invalid = vs("cafe", VirtualServerSpec {
            host: "cafe.example.com".to_string(),
            virtual_server_address: "10.8.0.1".to_string(),
            ..Default::default()
        });
        assert!(!check_valid_virtual_server(&invalid));

        let valid = vs("cafe", VirtualServerSpec {
            host: "cafe.example.com".to_string(),
            virtual_server_address: "10.8.0.1".to_string(),
            pools: vec![VsPool {
                service: "svc".to_string(),
                service_port: PortId::Number(80),
                ..Default::default()
            }],
            ..Default::default()
        });
        assert!(check_valid_virtual_server(&valid));
    }

    #[test]
    fn http_traffic_without_tls_profile_is_invalid() {
        let invalid = vs("cafe", VirtualServerSpec {
            host: "cafe.example.com".to_string(),
            virtual_server_address: "10.8.0.1".to_string(),
            http_traffic: "redirect".to_string(),
            pools: vec![VsPool {
                service: "svc".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        });
        assert!(!check_valid_virtual_server(&invalid));
    }

    #[test]
    fn transport_server_requires_a_port() {
        let mut ts = TransportServer::new(
            "tcp-ts",
            crate::api::TransportServerSpec {
                virtual_server_address: "10.8.0.2".to_string(),
                pool: TsPool {
                    service: "svc".to_string(),
                    service_port: PortId::Number(6379),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        ts.metadata.namespace = Some("default".to_string());
        assert!(!check_valid_transport_server(&ts));
        ts.spec.virtual_server_port = 6379;
        assert!(check_valid_transport_server(&ts));
    }
}
