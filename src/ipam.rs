//! Address allocation through a shared `Ipam` resource.
//!
//! The reconciler writes desired allocations into the resource's spec as
//! `HostSpec` rows; an external allocator answers by appending `IpSpec` rows
//! to the status. Rows are correlated by (label, host) for host-based
//! requests and (label, key) for key-based ones, never by position.
//!
//! Request keys encode the requesting resource:
//!   `{ns}/{host}_host`   VirtualServer host
//!   `{hostGroup}_hg`     host group
//!   `{ns}/{name}_ts`     TransportServer
//!   `{ns}/{name}_il`     IngressLink
//!   `{ns}/{name}_svc`    type=LoadBalancer Service

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::api::{HostSpec, IpSpec, Ipam};

pub(crate) fn host_key(namespace: &str, host: &str) -> String {
    format!("{namespace}/{host}_host")
}

pub(crate) fn host_group_key(host_group: &str) -> String {
    format!("{host_group}_hg")
}

pub(crate) fn ts_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}_ts")
}

pub(crate) fn il_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}_il")
}

pub(crate) fn svc_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}_svc")
}

/// Outcome of one allocation request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum IpRequest {
    /// No allocator resource is reachable.
    NotEnabled,
    /// Caller passed no label, or neither host nor key.
    InvalidInput,
    /// A stale status row exists without a matching spec row; wait for the
    /// allocator to clean it up and retry.
    NotRequested,
    /// The spec row is in place, the allocator has not answered yet.
    Requested,
    Allocated(String),
}

/// The allocator resource's API surface. Kept minimal so tests can swap in
/// an in-memory resource.
#[async_trait]
pub(crate) trait IpamClient: Send + Sync {
    async fn get(&self) -> Option<Ipam>;
    async fn update(&self, ipam: Ipam) -> anyhow::Result<Ipam>;
}

pub(crate) struct KubeIpam {
    api: kube::Api<Ipam>,
    name: String,
}

impl KubeIpam {
    pub(crate) fn new(client: kube::Client, namespace: &str, name: &str) -> Self {
        Self {
            api: kube::Api::namespaced(client, namespace),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl IpamClient for KubeIpam {
    async fn get(&self) -> Option<Ipam> {
        match self.api.get(&self.name).await {
            Ok(ipam) => Some(ipam),
            Err(e) => {
                error!(err = %e, "failed to fetch ipam resource");
                None
            }
        }
    }

    async fn update(&self, ipam: Ipam) -> anyhow::Result<Ipam> {
        let updated = self
            .api
            .replace(&self.name, &Default::default(), &ipam)
            .await?;
        Ok(updated)
    }
}

pub(crate) struct IpamManager {
    client: Box<dyn IpamClient>,
}

impl IpamManager {
    pub(crate) fn new(client: Box<dyn IpamClient>) -> Self {
        Self { client }
    }

    /// Ask for an address. Host-based requests match rows by (label, host),
    /// key-based ones by (label, key). A label change on an existing row
    /// releases the old allocation before the new request is written.
    pub(crate) async fn request_ip(
        &self,
        ipam_context: &mut HashMap<String, IpSpec>,
        ipam_label: &str,
        host: &str,
        key: &str,
        host_group_in_use: impl Fn(&str) -> bool,
    ) -> IpRequest {
        let Some(mut ipam) = self.client.get().await else {
            return IpRequest::NotEnabled;
        };
        if ipam_label.is_empty() {
            return IpRequest::InvalidInput;
        }

        let status = ipam.status.clone().unwrap_or_default();
        let mut ip = String::new();
        let mut released = false;

        if !host.is_empty() {
            for ipst in &status.ip_status {
                if ipst.ipam_label == ipam_label && ipst.host == host {
                    ip = ipst.ip.clone();
                }
            }
            let mut matched = None;
            for hst in &ipam.spec.host_specs {
                if hst.host == host {
                    matched = Some(hst.clone());
                    break;
                }
            }
            if let Some(hst) = matched {
                if hst.ipam_label == ipam_label {
                    if !ip.is_empty() {
                        return IpRequest::Allocated(ip);
                    }
                    return IpRequest::Requested;
                }
                // label changed for the host; drop the old allocation so a
                // fresh one can be requested under the new label
                self.release_ip(ipam_context, &hst.ipam_label, &hst.host, "", &host_group_in_use)
                    .await;
                released = true;
            }
            if !ip.is_empty() && !released {
                // status row survived its spec row; wait out the cleanup
                return IpRequest::NotRequested;
            }
            ipam.spec.host_specs.push(HostSpec {
                ipam_label: ipam_label.to_string(),
                host: host.to_string(),
                key: key.to_string(),
            });
        } else if !key.is_empty() {
            for ipst in &status.ip_status {
                if ipst.ipam_label == ipam_label && ipst.key == key {
                    ip = ipst.ip.clone();
                }
            }
            let mut matched = None;
            for hst in &ipam.spec.host_specs {
                if hst.key == key {
                    matched = Some(hst.clone());
                    break;
                }
            }
            if let Some(hst) = matched {
                if hst.ipam_label == ipam_label {
                    if !ip.is_empty() {
                        return IpRequest::Allocated(ip);
                    }
                    return IpRequest::Requested;
                }
                self.release_ip(ipam_context, &hst.ipam_label, "", &hst.key, &host_group_in_use)
                    .await;
                released = true;
            }
            if !ip.is_empty() && !released {
                return IpRequest::NotRequested;
            }
            ipam.spec.host_specs.push(HostSpec {
                ipam_label: ipam_label.to_string(),
                host: String::new(),
                key: key.to_string(),
            });
        } else {
            debug!("ipam request with neither host nor key");
            return IpRequest::InvalidInput;
        }

        // writes back the copy fetched at entry; a release above went
        // through a fresh fetch, so its removal can be overwritten here and
        // both the old and new rows survive until the allocator reconciles
        match self.client.update(ipam).await {
            Ok(_) => {
                debug!(label = ipam_label, host, key, "ipam request written");
                IpRequest::Requested
            }
            Err(e) => {
                error!(err = %e, "failed to update ipam resource");
                IpRequest::NotRequested
            }
        }
    }

    /// Give an allocation back. Host-group rows are kept while any live
    /// resource still references the group. Returns the released address,
    /// if one had been allocated.
    pub(crate) async fn release_ip(
        &self,
        ipam_context: &mut HashMap<String, IpSpec>,
        ipam_label: &str,
        host: &str,
        key: &str,
        host_group_in_use: impl Fn(&str) -> bool,
    ) -> String {
        let Some(mut ipam) = self.client.get().await else {
            return String::new();
        };
        if ipam_label.is_empty() {
            return String::new();
        }

        let status = ipam.status.clone().unwrap_or_default();
        let mut ip = String::new();
        let index = if !host.is_empty() {
            for ipst in &status.ip_status {
                if ipst.ipam_label == ipam_label && ipst.host == host {
                    ip = ipst.ip.clone();
                }
            }
            ipam.spec
                .host_specs
                .iter()
                .position(|h| h.ipam_label == ipam_label && h.host == host)
        } else if !key.is_empty() {
            for ipst in &status.ip_status {
                if ipst.ipam_label == ipam_label && ipst.key == key {
                    ip = ipst.ip.clone();
                    break;
                }
            }
            ipam.spec
                .host_specs
                .iter()
                .position(|h| h.ipam_label == ipam_label && h.key == key)
        } else {
            debug!("ipam release with neither host nor key");
            None
        };

        let Some(index) = index else { return ip };

        if key.ends_with("_hg") && host_group_in_use(key) {
            // other virtuals still ride this host group's address
            return ip;
        }

        ipam_context.remove(key);
        ipam.spec.host_specs.remove(index);
        if let Err(e) = self.client.update(ipam).await {
            error!(err = %e, "failed to update ipam resource");
            return String::new();
        }
        debug!(label = ipam_label, host, key, "ipam allocation released");
        ip
    }

    /// Drop stale status rows left over by older key encodings. Recognized
    /// suffixes stay; `_hg` rows that carry a namespace prefix and anything
    /// unrecognized are released.
    pub(crate) async fn migrate(
        &self,
        ipam_context: &mut HashMap<String, IpSpec>,
        host_group_in_use: impl Fn(&str) -> bool,
    ) {
        let Some(ipam) = self.client.get().await else {
            return;
        };

        let mut stale = Vec::new();
        for spec in &ipam.status.clone().unwrap_or_default().ip_status {
            match spec.key.rsplit_once('_').map(|(_, kind)| kind) {
                Some("host") | Some("ts") | Some("il") | Some("svc") => continue,
                Some("hg") if !spec.key.contains('/') => continue,
                _ => stale.push(spec.clone()),
            }
        }

        for spec in stale {
            self.release_ip(
                ipam_context,
                &spec.ipam_label,
                &spec.host,
                &spec.key,
                &host_group_in_use,
            )
            .await;
        }
    }
}

/// Status rows that changed since the last observation. The worker requeues
/// the resources behind each changed key.
pub(crate) fn changed_allocations(
    ipam_context: &HashMap<String, IpSpec>,
    ipam: &Ipam,
) -> Vec<IpSpec> {
    let mut changed = Vec::new();
    if let Some(status) = &ipam.status {
        for ipst in &status.ip_status {
            match ipam_context.get(&ipst.key) {
                Some(seen) if seen == ipst => {}
                _ => changed.push(ipst.clone()),
            }
        }
    }
    changed
}

#[cfg(test)]
pub(crate) mod mem {
    use super::*;
    use parking_lot::Mutex;

    /// In-memory allocator resource for tests.
    #[derive(Default)]
    pub(crate) struct MemIpam {
        pub ipam: Mutex<Option<Ipam>>,
    }

    impl MemIpam {
        pub(crate) fn with(ipam: Ipam) -> std::sync::Arc<Self> {
            std::sync::Arc::new(Self {
                ipam: Mutex::new(Some(ipam)),
            })
        }

        /// Pretend the allocator answered every pending spec row.
        pub(crate) fn allocate_all(&self, addresses: &[&str]) {
            let mut guard = self.ipam.lock();
            if let Some(ipam) = guard.as_mut() {
                let status = ipam.status.get_or_insert_with(Default::default);
                for (hst, addr) in ipam.spec.host_specs.iter().zip(addresses) {
                    status.ip_status.push(IpSpec {
                        ipam_label: hst.ipam_label.clone(),
                        host: hst.host.clone(),
                        key: hst.key.clone(),
                        ip: addr.to_string(),
                    });
                }
            }
        }
    }

    #[async_trait]
    impl IpamClient for std::sync::Arc<MemIpam> {
        async fn get(&self) -> Option<Ipam> {
            self.ipam.lock().clone()
        }

        async fn update(&self, ipam: Ipam) -> anyhow::Result<Ipam> {
            *self.ipam.lock() = Some(ipam.clone());
            Ok(ipam)
        }
    }
}

#[cfg(test)]
mod test {
    use super::mem::MemIpam;
    use super::*;
    use crate::api::IpamSpec;

    fn empty_ipam() -> Ipam {
        Ipam::new("deckhand.ipam", IpamSpec::default())
    }

    fn manager(mem: &std::sync::Arc<MemIpam>) -> IpamManager {
        IpamManager::new(Box::new(mem.clone()))
    }

    #[tokio::test]
    async fn test_request_then_allocate() {
        let mem = MemIpam::with(empty_ipam());
        let mgr = manager(&mem);
        let mut ctx = HashMap::new();

        let key = host_key("default", "foo.com");
        let got = mgr
            .request_ip(&mut ctx, "prod", "foo.com", &key, |_| false)
            .await;
        assert_eq!(got, IpRequest::Requested);

        // asking again while unanswered stays pending
        let got = mgr
            .request_ip(&mut ctx, "prod", "foo.com", &key, |_| false)
            .await;
        assert_eq!(got, IpRequest::Requested);

        mem.allocate_all(&["10.8.3.11"]);
        let got = mgr
            .request_ip(&mut ctx, "prod", "foo.com", &key, |_| false)
            .await;
        assert_eq!(got, IpRequest::Allocated("10.8.3.11".to_string()));
    }

    #[tokio::test]
    async fn test_invalid_inputs() {
        let mem = MemIpam::with(empty_ipam());
        let mgr = manager(&mem);
        let mut ctx = HashMap::new();

        let got = mgr.request_ip(&mut ctx, "", "foo.com", "k", |_| false).await;
        assert_eq!(got, IpRequest::InvalidInput);

        let got = mgr.request_ip(&mut ctx, "prod", "", "", |_| false).await;
        assert_eq!(got, IpRequest::InvalidInput);

        let none = IpamManager::new(Box::new(std::sync::Arc::new(MemIpam::default())));
        let got = none
            .request_ip(&mut ctx, "prod", "foo.com", "k", |_| false)
            .await;
        assert_eq!(got, IpRequest::NotEnabled);
    }

    #[tokio::test]
    async fn test_label_change_leaves_both_rows_until_reconciled() {
        let mem = MemIpam::with(empty_ipam());
        let mgr = manager(&mem);
        let mut ctx = HashMap::new();

        let key = host_key("default", "foo.com");
        mgr.request_ip(&mut ctx, "prod", "foo.com", &key, |_| false)
            .await;
        mem.allocate_all(&["10.8.3.11"]);

        // the request is rewritten under a new label; the release of the old
        // row is clobbered by the stale write, so both rows remain
        let got = mgr
            .request_ip(&mut ctx, "staging", "foo.com", &key, |_| false)
            .await;
        assert_eq!(got, IpRequest::Requested);

        let ipam = mem.ipam.lock().clone().unwrap();
        assert_eq!(ipam.spec.host_specs.len(), 2);
        assert_eq!(ipam.spec.host_specs[0].ipam_label, "prod");
        assert_eq!(ipam.spec.host_specs[1].ipam_label, "staging");
    }

    #[tokio::test]
    async fn test_stale_status_row_is_not_requested() {
        let mut ipam = empty_ipam();
        ipam.status = Some(crate::api::IpamStatus {
            ip_status: vec![IpSpec {
                ipam_label: "prod".to_string(),
                host: "foo.com".to_string(),
                key: host_key("default", "foo.com"),
                ip: "10.8.3.11".to_string(),
            }],
        });
        let mem = MemIpam::with(ipam);
        let mgr = manager(&mem);
        let mut ctx = HashMap::new();

        let got = mgr
            .request_ip(&mut ctx, "prod", "foo.com", &host_key("default", "foo.com"), |_| false)
            .await;
        assert_eq!(got, IpRequest::NotRequested);
    }

    #[tokio::test]
    async fn test_release_removes_row_and_returns_ip() {
        let mem = MemIpam::with(empty_ipam());
        let mgr = manager(&mem);
        let mut ctx = HashMap::new();

        let key = ts_key("default", "ts1");
        mgr.request_ip(&mut ctx, "prod", "", &key, |_| false).await;
        mem.allocate_all(&["10.8.3.12"]);
        ctx.insert(key.clone(), IpSpec::default());

        let ip = mgr.release_ip(&mut ctx, "prod", "", &key, |_| false).await;
        assert_eq!(ip, "10.8.3.12");
        assert!(ctx.is_empty());
        assert!(mem.ipam.lock().clone().unwrap().spec.host_specs.is_empty());
    }

    #[tokio::test]
    async fn test_release_keeps_live_host_group() {
        let mem = MemIpam::with(empty_ipam());
        let mgr = manager(&mem);
        let mut ctx = HashMap::new();

        let key = host_group_key("apps");
        mgr.request_ip(&mut ctx, "prod", "", &key, |_| false).await;

        let ip = mgr
            .release_ip(&mut ctx, "prod", "", &key, |k| k == "apps_hg")
            .await;
        assert_eq!(ip, "");
        assert_eq!(mem.ipam.lock().clone().unwrap().spec.host_specs.len(), 1);
    }

    #[tokio::test]
    async fn test_migrate_releases_unrecognized_keys() {
        let mut ipam = empty_ipam();
        let rows = [
            ("default/foo.com_host", "foo.com"),
            ("default/ts1_ts", ""),
            ("apps_hg", ""),
            ("default/apps_hg", ""), // namespaced hg rows are an old encoding
            ("default/mystery", ""),
        ];
        ipam.spec.host_specs = rows
            .iter()
            .map(|(key, host)| HostSpec {
                ipam_label: "prod".to_string(),
                host: host.to_string(),
                key: key.to_string(),
            })
            .collect();
        ipam.status = Some(crate::api::IpamStatus {
            ip_status: rows
                .iter()
                .map(|(key, host)| IpSpec {
                    ipam_label: "prod".to_string(),
                    host: host.to_string(),
                    key: key.to_string(),
                    ip: "10.8.3.11".to_string(),
                })
                .collect(),
        });

        let mem = MemIpam::with(ipam);
        let mgr = manager(&mem);
        let mut ctx = HashMap::new();
        mgr.migrate(&mut ctx, |_| false).await;

        let keys: Vec<_> = mem
            .ipam
            .lock()
            .clone()
            .unwrap()
            .spec
            .host_specs
            .iter()
            .map(|h| h.key.clone())
            .collect();
        assert_eq!(keys, vec!["default/foo.com_host", "default/ts1_ts", "apps_hg"]);
    }

    #[test]
    fn test_changed_allocations() {
        let mut ipam = empty_ipam();
        let spec = IpSpec {
            ipam_label: "prod".to_string(),
            host: "foo.com".to_string(),
            key: host_key("default", "foo.com"),
            ip: "10.8.3.11".to_string(),
        };
        ipam.status = Some(crate::api::IpamStatus {
            ip_status: vec![spec.clone()],
        });

        let mut ctx = HashMap::new();
        assert_eq!(changed_allocations(&ctx, &ipam), vec![spec.clone()]);

        ctx.insert(spec.key.clone(), spec.clone());
        assert!(changed_allocations(&ctx, &ipam).is_empty());

        let mut stale = spec.clone();
        stale.ip = "10.8.3.99".to_string();
        ctx.insert(spec.key.clone(), stale);
        assert_eq!(changed_allocations(&ctx, &ipam), vec![spec]);
    }
}
