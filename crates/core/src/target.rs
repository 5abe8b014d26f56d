//! Tunnel/log targets resolved from the catalog.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Environment, InstanceRef, ServiceCatalog};

/// `local:remote` port pair. A local port of `0` lets the OS pick one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub local: u16,
    pub remote: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid port mapping {0:?} (expected PORT or LOCAL:REMOTE)")]
pub struct InvalidPortMapping(pub String);

impl FromStr for PortMapping {
    type Err = InvalidPortMapping;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || InvalidPortMapping(s.to_string());
        let (local, remote) = match s.trim().split_once(':') {
            Some((l, r)) => (l.parse::<u16>().map_err(|_| bad())?, r.parse::<u16>().map_err(|_| bad())?),
            None => {
                let p = s.trim().parse::<u16>().map_err(|_| bad())?;
                (p, p)
            }
        };
        if remote == 0 {
            return Err(bad());
        }
        Ok(PortMapping { local, remote })
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.local, self.remote)
    }
}

/// A service instance picked from the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub service: String,
    pub env: Environment,
    pub instance: InstanceRef,
}

impl Target {
    /// Pick `(service, env)` from `catalog`.
    pub fn select(catalog: &ServiceCatalog, service: &str, env: Environment) -> Option<Self> {
        crate::lookup(catalog, service, env)
            .map(|instance| Target { service: service.to_string(), env, instance: instance.clone() })
    }

    pub fn namespace(&self) -> &str {
        &self.instance.namespace
    }

    pub fn pod_name(&self) -> String {
        self.instance.pod_name(self.env, &self.service)
    }

    /// kubectl arguments for the equivalent tunnel.
    pub fn port_forward_args(&self, ports: PortMapping) -> Vec<String> {
        vec![
            "port-forward".to_string(),
            "--namespace".to_string(),
            self.namespace().to_string(),
            self.pod_name(),
            ports.to_string(),
        ]
    }

    /// kubectl arguments for the equivalent log stream.
    pub fn logs_args(&self, follow: bool) -> Vec<String> {
        let mut args = vec![
            "logs".to_string(),
            "--namespace".to_string(),
            self.namespace().to_string(),
            self.pod_name(),
        ];
        if follow {
            args.push("--follow".to_string());
        }
        args
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace(), self.pod_name())
    }
}
