//! Operator-owned route-group configuration, delivered through ConfigMaps.
//!
//! One global ConfigMap carries an `extendedSpec` YAML document declaring
//! route groups: either one namespace or one namespace label selector per
//! group, plus the virtual-server identity the group's routes merge into.
//! Namespaces may additionally publish a local ConfigMap overriding a few
//! fields of their own group, but only when the global group opts in with
//! `allowOverride`.
//!
//! Parsing is all-or-nothing: an invalid document leaves the previously
//! accepted state in place.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde::Deserialize;

pub(crate) const EXTENDED_SPEC_KEY: &str = "extendedSpec";

fn timestamp(t: &Option<Time>) -> Option<chrono::DateTime<chrono::Utc>> {
    t.as_ref().map(|t| t.0)
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ExtendedConfigError {
    #[error("configmap has no '{EXTENDED_SPEC_KEY}' key")]
    MissingKey,

    #[error("invalid extendedSpec document: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("route group must set exactly one of namespace/namespaceLabel")]
    AmbiguousScope,

    #[error("more than one route group claims '{0}'")]
    DuplicateScope(String),

    #[error("invalid allowOverride value: {0:?}")]
    InvalidAllowOverride(String),

    #[error("local extendedSpec may only declare its own namespace")]
    ForeignNamespace,
}

/// allowOverride arrives as a bare bool or any of the usual string spellings.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub(crate) enum TolerantBool {
    Bool(bool),
    Str(String),
}

impl TolerantBool {
    pub(crate) fn parse(&self) -> Result<bool, ExtendedConfigError> {
        match self {
            TolerantBool::Bool(b) => Ok(*b),
            TolerantBool::Str(s) => match s.to_lowercase().as_str() {
                "true" | "1" | "t" | "yes" | "y" => Ok(true),
                "false" | "0" | "f" | "no" | "n" => Ok(false),
                _ => Err(ExtendedConfigError::InvalidAllowOverride(s.clone())),
            },
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DefaultSslProfile {
    #[serde(default, rename = "clientSSL")]
    pub client_ssl: String,
    #[serde(default, rename = "serverSSL")]
    pub server_ssl: String,
    #[serde(default)]
    pub reference: String,
}

/// Cipher settings applied to every custom client-ssl profile the route
/// pipeline creates.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TlsCipher {
    #[serde(default)]
    pub tls_version: String,
    #[serde(default)]
    pub ciphers: String,
    #[serde(default)]
    pub cipher_group: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BaseRouteSpec {
    #[serde(default)]
    pub tls_cipher: TlsCipher,
    #[serde(default, rename = "defaultTLS")]
    pub default_tls: Option<DefaultSslProfile>,
    /// Fallback settings for namespaces no extendedRouteSpec entry claims.
    #[serde(default)]
    default_route_group: Option<DefaultRouteGroupSpec>,
    #[serde(default)]
    pub auto_monitor: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DefaultRouteGroupSpec {
    #[serde(default)]
    big_ip_partition: String,
    #[serde(default)]
    vserver_name: String,
    #[serde(default)]
    vserver_addr: String,
    #[serde(default)]
    allow_override: Option<TolerantBool>,
    #[serde(default)]
    policy: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtendedRouteGroupSpec {
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    namespace_label: String,
    #[serde(default)]
    vserver_name: String,
    #[serde(default)]
    vserver_addr: String,
    #[serde(default)]
    allow_override: Option<TolerantBool>,
    #[serde(default)]
    big_ip_partition: String,
    #[serde(default)]
    policy: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtendedSpec {
    #[serde(default)]
    base_route_spec: BaseRouteSpec,
    #[serde(default)]
    extended_route_spec: Vec<ExtendedRouteGroupSpec>,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum GroupScope {
    /// Group claims exactly this namespace.
    Namespace(String),
    /// Group claims every namespace matching this `key=value` label.
    NamespaceLabel(String),
}

impl GroupScope {
    /// The map key a scope is filed under.
    pub(crate) fn key(&self) -> &str {
        match self {
            GroupScope::Namespace(ns) => ns,
            GroupScope::NamespaceLabel(l) => l,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct RouteGroupConfig {
    pub scope_label: Option<String>,
    pub vserver_name: String,
    pub vserver_addr: String,
    pub allow_override: bool,
    pub bigip_partition: String,
    pub policy: String,
}

/// Local override for a group, remembered alongside its ConfigMap identity
/// so that the newest local ConfigMap in a namespace wins.
#[derive(Clone, Debug, Default, PartialEq)]
struct LocalSpec {
    cm_name: String,
    cm_created: Option<Time>,
    vserver_name: String,
    vserver_addr: String,
    policy: String,
}

/// What changed for one route group, in the order the worker must act on it.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum RouteGroupChange {
    Created(String),
    /// Settings changed but the virtual's identity did not.
    Updated(String),
    /// vserverName or vserverAddr changed: the old virtual must be torn down
    /// before the group is re-derived under its new identity.
    Renamed { key: String, old: RouteGroupConfig },
    Deleted { key: String, old: RouteGroupConfig },
}

#[derive(Debug, Default)]
pub(crate) struct ExtendedSpecStore {
    pub base: BaseRouteSpec,
    groups: BTreeMap<String, RouteGroupConfig>,
    /// Fallback for namespaces no group claims; each such namespace forms
    /// its own group under its own name.
    default_group: Option<RouteGroupConfig>,
    local: HashMap<String, LocalSpec>,
    /// label selector string to the namespaces currently matching it.
    pub inverted_namespace_label_map: HashMap<String, BTreeSet<String>>,
}

impl ExtendedSpecStore {
    /// Ingest the global ConfigMap. Returns per-group changes against the
    /// previously accepted state; on error that state is untouched.
    pub(crate) fn process_global(
        &mut self,
        data: &BTreeMap<String, String>,
    ) -> Result<Vec<RouteGroupChange>, ExtendedConfigError> {
        let doc = data
            .get(EXTENDED_SPEC_KEY)
            .ok_or(ExtendedConfigError::MissingKey)?;
        let mut spec: ExtendedSpec = serde_yaml::from_str(doc)?;

        let default_group = match spec.base_route_spec.default_route_group.take() {
            Some(entry) => {
                let allow_override = match &entry.allow_override {
                    Some(v) => v.parse()?,
                    None => false,
                };
                Some(RouteGroupConfig {
                    scope_label: None,
                    vserver_name: entry.vserver_name,
                    vserver_addr: entry.vserver_addr,
                    allow_override,
                    bigip_partition: entry.big_ip_partition,
                    policy: entry.policy,
                })
            }
            None => None,
        };

        let mut groups = BTreeMap::new();
        for entry in &spec.extended_route_spec {
            let scope = match (entry.namespace.is_empty(), entry.namespace_label.is_empty()) {
                (false, true) => GroupScope::Namespace(entry.namespace.clone()),
                (true, false) => GroupScope::NamespaceLabel(entry.namespace_label.clone()),
                _ => return Err(ExtendedConfigError::AmbiguousScope),
            };
            let allow_override = match &entry.allow_override {
                Some(v) => v.parse()?,
                None => false,
            };
            let config = RouteGroupConfig {
                scope_label: match &scope {
                    GroupScope::NamespaceLabel(l) => Some(l.clone()),
                    GroupScope::Namespace(_) => None,
                },
                vserver_name: entry.vserver_name.clone(),
                vserver_addr: entry.vserver_addr.clone(),
                allow_override,
                bigip_partition: entry.big_ip_partition.clone(),
                policy: entry.policy.clone(),
            };
            let key = scope.key().to_string();
            if groups.insert(key.clone(), config).is_some() {
                return Err(ExtendedConfigError::DuplicateScope(key));
            }
        }

        let mut changes = Vec::new();
        for (key, old) in &self.groups {
            match groups.get(key) {
                None => changes.push(RouteGroupChange::Deleted {
                    key: key.clone(),
                    old: old.clone(),
                }),
                Some(new) if new == old => {}
                Some(new)
                    if new.vserver_name != old.vserver_name
                        || new.vserver_addr != old.vserver_addr =>
                {
                    changes.push(RouteGroupChange::Renamed {
                        key: key.clone(),
                        old: old.clone(),
                    })
                }
                Some(_) => changes.push(RouteGroupChange::Updated(key.clone())),
            }
        }
        for key in groups.keys() {
            if !self.groups.contains_key(key) {
                changes.push(RouteGroupChange::Created(key.clone()));
            }
        }

        self.base = spec.base_route_spec;
        self.groups = groups;
        self.default_group = default_group;
        Ok(changes)
    }

    /// The shared fallback settings, if defaultRouteGroup is configured.
    pub(crate) fn default_group(&self) -> Option<&RouteGroupConfig> {
        self.default_group.as_ref()
    }

    /// Ingest a namespace-local ConfigMap. A local document may only carry a
    /// single entry for the ConfigMap's own namespace, and it only takes
    /// effect if the global group allows overrides. Among several local maps
    /// in one namespace, the newest by creation timestamp wins.
    pub(crate) fn process_local(
        &mut self,
        namespace: &str,
        cm_name: &str,
        cm_created: Option<Time>,
        data: &BTreeMap<String, String>,
    ) -> Result<Option<RouteGroupChange>, ExtendedConfigError> {
        let doc = data
            .get(EXTENDED_SPEC_KEY)
            .ok_or(ExtendedConfigError::MissingKey)?;
        let spec: ExtendedSpec = serde_yaml::from_str(doc)?;

        let entry = match spec.extended_route_spec.as_slice() {
            [entry] if entry.namespace == namespace => entry,
            [] => return Err(ExtendedConfigError::AmbiguousScope),
            _ => return Err(ExtendedConfigError::ForeignNamespace),
        };

        if let Some(current) = self.local.get(namespace) {
            // a different, older configmap never displaces the winner
            if current.cm_name != cm_name && timestamp(&cm_created) < timestamp(&current.cm_created)
            {
                return Ok(None);
            }
        }

        let key = self.group_key_for_namespace(namespace);
        let old_effective = key.as_deref().and_then(|k| self.effective(k));

        self.local.insert(
            namespace.to_string(),
            LocalSpec {
                cm_name: cm_name.to_string(),
                cm_created,
                vserver_name: entry.vserver_name.clone(),
                vserver_addr: entry.vserver_addr.clone(),
                policy: entry.policy.clone(),
            },
        );

        Ok(self.change_for(key, old_effective))
    }

    /// Drop a local ConfigMap. `fallback` is the surviving local ConfigMaps
    /// of the namespace (name, created, data); the newest valid one is
    /// promoted in the deleted one's place.
    pub(crate) fn remove_local(
        &mut self,
        namespace: &str,
        cm_name: &str,
        fallback: Vec<(String, Option<Time>, BTreeMap<String, String>)>,
    ) -> Option<RouteGroupChange> {
        match self.local.get(namespace) {
            Some(current) if current.cm_name == cm_name => {}
            _ => return None,
        }

        let key = self.group_key_for_namespace(namespace);
        let old_effective = key.as_deref().and_then(|k| self.effective(k));
        self.local.remove(namespace);

        let mut candidates = fallback;
        candidates.sort_by(|a, b| timestamp(&b.1).cmp(&timestamp(&a.1)));
        for (name, created, data) in candidates {
            if self.process_local(namespace, &name, created, &data).is_ok() {
                break;
            }
        }

        self.change_for(key, old_effective)
    }

    fn change_for(
        &self,
        key: Option<String>,
        old: Option<RouteGroupConfig>,
    ) -> Option<RouteGroupChange> {
        let key = key?;
        let new = self.effective(&key)?;
        let old = old?;
        if new == old {
            None
        } else if new.vserver_name != old.vserver_name || new.vserver_addr != old.vserver_addr {
            Some(RouteGroupChange::Renamed { key, old })
        } else {
            Some(RouteGroupChange::Updated(key))
        }
    }

    /// The group key claiming a namespace: an exact-namespace group first,
    /// then any label group the namespace currently matches, and finally the
    /// defaultRouteGroup fallback under the namespace's own name.
    pub(crate) fn group_key_for_namespace(&self, namespace: &str) -> Option<String> {
        if self.groups.contains_key(namespace) {
            return Some(namespace.to_string());
        }
        if let Some(label) = self
            .inverted_namespace_label_map
            .iter()
            .filter(|(_, namespaces)| namespaces.contains(namespace))
            .map(|(label, _)| label)
            .find(|label| self.groups.contains_key(*label))
        {
            return Some(label.clone());
        }
        self.default_group.as_ref().map(|_| namespace.to_string())
    }

    /// Namespaces belonging to a group key.
    pub(crate) fn namespaces_for_group(&self, key: &str) -> Vec<String> {
        match self.groups.get(key).map(|g| g.scope_label.as_ref()) {
            Some(Some(label)) => self
                .inverted_namespace_label_map
                .get(label)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default(),
            Some(None) => vec![key.to_string()],
            None if self.default_group.is_some() => vec![key.to_string()],
            None => Vec::new(),
        }
    }

    /// The group's settings with any permitted local override applied.
    pub(crate) fn effective(&self, key: &str) -> Option<RouteGroupConfig> {
        let global = self.groups.get(key).or(self.default_group.as_ref())?;
        let mut config = global.clone();
        if !global.allow_override {
            return Some(config);
        }
        // label groups span namespaces; overrides stay namespace-scoped
        if let Some(local) = self.local.get(key) {
            if !local.vserver_name.is_empty() {
                config.vserver_name = local.vserver_name.clone();
            }
            if !local.vserver_addr.is_empty() {
                config.vserver_addr = local.vserver_addr.clone();
            }
            if !local.policy.is_empty() {
                config.policy = local.policy.clone();
            }
        }
        Some(config)
    }

    pub(crate) fn group_keys(&self) -> impl Iterator<Item = &String> {
        self.groups.keys()
    }
}
