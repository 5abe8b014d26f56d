//! Skiff core types: instance rows, environments and the service catalog.
//!
//! Everything here is pure data plus two pure transformations:
//! - [`table::parse`] turns whitespace-tabular pod listings into [`InstanceRow`]s
//! - [`resolve::resolve`] groups those rows into a [`ServiceCatalog`]
//!
//! [`Target`] turns a catalog entry back into a pod address for tunnels and logs.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod resolve;
pub mod table;
pub mod target;

pub use resolve::{list_service_names, lookup, resolve};
pub use table::{parse, MalformedTableError};
pub use target::{PortMapping, Target};

/// One parsed line of cluster-state output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRow {
    pub namespace: String,
    /// Raw pod name as reported by the cluster, e.g. `dev-billing-checkout-7f9c4d-x2k1p`.
    pub name: String,
}

/// Deployment environment, encoded as a pod name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Qa,
    Stg,
}

impl Environment {
    /// Classification order. Prefixes are disjoint, but the order stays fixed.
    pub const ALL: [Environment; 3] = [Environment::Dev, Environment::Qa, Environment::Stg];

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Qa => "qa",
            Environment::Stg => "stg",
        }
    }

    /// Name prefix including the trailing separator.
    pub fn prefix(&self) -> &'static str {
        match self {
            Environment::Dev => "dev-",
            Environment::Qa => "qa-",
            Environment::Stg => "stg-",
        }
    }

    /// Match `name` against the known prefixes and return the environment with the remainder.
    pub fn classify(name: &str) -> Option<(Environment, &str)> {
        Self::ALL
            .iter()
            .find_map(|env| name.strip_prefix(env.prefix()).map(|rest| (*env, rest)))
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown environment: {0} (expected dev, qa or stg)")]
pub struct UnknownEnvironment(pub String);

impl FromStr for Environment {
    type Err = UnknownEnvironment;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|env| env.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownEnvironment(s.to_string()))
    }
}

/// Address of one running instance of a service in one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRef {
    /// Last two dash-joined tokens of the pod name (hash + random suffix by convention).
    pub discriminator_id: String,
    pub namespace: String,
}

impl InstanceRef {
    /// Rebuild the pod name as `<env>-<ns>-<service>-<discriminator_id>`.
    pub fn pod_name(&self, env: Environment, service: &str) -> String {
        format!("{}-{}-{}-{}", env.as_str(), self.namespace, service, self.discriminator_id)
    }
}

/// Environment tag -> instance for a single service.
pub type EnvironmentBindings = BTreeMap<Environment, InstanceRef>;

/// Service name -> per-environment instances. Built fresh per discovery call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceCatalog {
    services: BTreeMap<String, EnvironmentBindings>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `(service, env)` to `instance`, replacing any earlier binding (last wins).
    /// Returns the replaced binding, if any.
    pub fn insert_or_update(&mut self, service: &str, env: Environment, instance: InstanceRef) -> Option<InstanceRef> {
        self.services.entry(service.to_string()).or_default().insert(env, instance)
    }

    pub fn get(&self, service: &str) -> Option<&EnvironmentBindings> {
        self.services.get(service)
    }

    /// Iterate services in ascending name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &EnvironmentBindings)> {
        self.services.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

pub mod prelude {
    pub use super::{
        list_service_names, lookup, parse, resolve, Environment, EnvironmentBindings, InstanceRef, InstanceRow,
        MalformedTableError, PortMapping, ServiceCatalog, Target,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_strips_known_prefixes() {
        assert_eq!(Environment::classify("dev-a-b-c"), Some((Environment::Dev, "a-b-c")));
        assert_eq!(Environment::classify("qa-x"), Some((Environment::Qa, "x")));
        assert_eq!(Environment::classify("stg-y"), Some((Environment::Stg, "y")));
        assert_eq!(Environment::classify("prod-y"), None);
        assert_eq!(Environment::classify("devx-y"), None);
        assert_eq!(Environment::classify("kube-proxy-abcde"), None);
    }

    #[test]
    fn environment_from_str() {
        assert_eq!("dev".parse::<Environment>(), Ok(Environment::Dev));
        assert_eq!("QA".parse::<Environment>(), Ok(Environment::Qa));
        assert_eq!(" stg ".parse::<Environment>(), Ok(Environment::Stg));
        assert!("prod".parse::<Environment>().is_err());
    }

    #[test]
    fn pod_name_reassembles_conventional_name() {
        let r = InstanceRef { discriminator_id: "7f9c4d-x2k1p".into(), namespace: "team-a".into() };
        assert_eq!(r.pod_name(Environment::Dev, "checkout"), "dev-team-a-checkout-7f9c4d-x2k1p");
    }

    #[test]
    fn insert_or_update_is_last_wins() {
        let mut c = ServiceCatalog::new();
        let a = InstanceRef { discriminator_id: "a-1".into(), namespace: "ns".into() };
        let b = InstanceRef { discriminator_id: "b-2".into(), namespace: "ns".into() };
        assert_eq!(c.insert_or_update("svc", Environment::Qa, a.clone()), None);
        assert_eq!(c.insert_or_update("svc", Environment::Qa, b.clone()), Some(a));
        assert_eq!(c.get("svc").and_then(|e| e.get(&Environment::Qa)), Some(&b));
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn catalog_serializes_as_nested_maps() {
        let mut c = ServiceCatalog::new();
        c.insert_or_update("svc", Environment::Stg, InstanceRef { discriminator_id: "h-r".into(), namespace: "ns".into() });
        let v = serde_json::to_value(&c).expect("json");
        assert_eq!(v, serde_json::json!({ "svc": { "stg": { "discriminator_id": "h-r", "namespace": "ns" } } }));
    }
}
