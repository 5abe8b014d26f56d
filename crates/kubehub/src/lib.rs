//! Skiff kubehub – cluster-state query and service discovery wiring.
//!
//! Pod listings come either from `kubectl get pods` (tabular text, run through
//! the core parser) or straight from the API server via kube-rs.

#![forbid(unsafe_code)]

use std::time::Instant;

use anyhow::{Context, Result};
use kube::{api::{Api, ListParams}, Client, ResourceExt};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use skiff_core::{InstanceRow, MalformedTableError, ServiceCatalog};
use tracing::{debug, info};

/// Where the pod listing comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Source {
    /// `kubectl get pods` text output.
    #[default]
    Kubectl,
    /// List pods through the API server.
    Api,
}

/// Failure running the cluster-state query command.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// kubectl binary, `SKIFF_KUBECTL` or `kubectl` on PATH.
pub fn kubectl_program() -> String {
    std::env::var("SKIFF_KUBECTL").unwrap_or_else(|_| "kubectl".to_string())
}

/// Arguments for the pod listing: one namespace, or all of them.
pub fn query_args(namespace: Option<&str>) -> Vec<String> {
    let mut args = vec!["get".to_string(), "pods".to_string()];
    match namespace {
        Some(ns) => {
            args.push("--namespace".to_string());
            args.push(ns.to_string());
        }
        None => args.push("--all-namespaces".to_string()),
    }
    args
}

async fn run_query(program: &str, args: &[String]) -> Result<String, QueryError> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| QueryError::Spawn { program: program.to_string(), source })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(QueryError::Failed {
            program: program.to_string(),
            status: output.status,
            stderr: stderr.trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Run `kubectl get pods` and return its raw table.
pub async fn fetch_instance_table(program: &str, namespace: Option<&str>) -> Result<String, QueryError> {
    let args = query_args(namespace);
    debug!(program = %program, args = ?args, "querying instance table");
    run_query(program, &args).await
}

/// List pods through the API server, in the order the server returns them.
pub async fn list_instance_rows(namespace: Option<&str>) -> Result<Vec<InstanceRow>> {
    use k8s_openapi::api::core::v1::Pod;

    let client = Client::try_default().await?;
    let api: Api<Pod> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let list = api.list(&ListParams::default()).await.context("listing pods")?;
    let rows = list
        .items
        .iter()
        .filter_map(|p| {
            let name = p.name_any();
            let ns = p.namespace().or_else(|| namespace.map(|s| s.to_string()))?;
            if name.is_empty() {
                return None;
            }
            Some(InstanceRow { namespace: ns, name })
        })
        .collect();
    Ok(rows)
}

/// Parse and resolve a raw table. `namespace` doubles as the fixed namespace.
pub fn catalog_from_table(raw: &str, namespace: Option<&str>) -> Result<(usize, ServiceCatalog), MalformedTableError> {
    let rows = skiff_core::parse(raw, namespace)?;
    Ok((rows.len(), skiff_core::resolve(&rows)))
}

/// Query the cluster and build a fresh service catalog.
pub async fn discover(source: Source, namespace: Option<&str>) -> Result<ServiceCatalog> {
    let started = Instant::now();
    counter!("discover_runs_total", 1);
    let (rows, catalog) = match source {
        Source::Kubectl => {
            let program = kubectl_program();
            let raw = fetch_instance_table(&program, namespace).await?;
            catalog_from_table(&raw, namespace).context("parsing pod table")?
        }
        Source::Api => {
            let rows = list_instance_rows(namespace).await?;
            (rows.len(), skiff_core::resolve(&rows))
        }
    };
    counter!("discover_rows_total", rows as u64);
    counter!("discover_services_total", catalog.len() as u64);
    histogram!("discover_ms", started.elapsed().as_secs_f64() * 1000.0);
    info!(source = ?source, ns = ?namespace, rows, services = catalog.len(), "discovery complete");
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_core::Environment;

    #[test]
    fn query_args_all_namespaces() {
        assert_eq!(query_args(None), vec!["get", "pods", "--all-namespaces"]);
    }

    #[test]
    fn query_args_fixed_namespace() {
        assert_eq!(query_args(Some("team-a")), vec!["get", "pods", "--namespace", "team-a"]);
    }

    #[test]
    fn catalog_from_table_counts_rows() {
        let raw = "NAMESPACE NAME READY\nteam-a dev-team-a-checkout-7f9c4d-x2k1p 1/1\nkube-system coredns-5d78c9869d-8lq4z 1/1\n";
        let (rows, catalog) = catalog_from_table(raw, None).expect("table");
        assert_eq!(rows, 2);
        assert_eq!(catalog.len(), 1);
        assert!(skiff_core::lookup(&catalog, "checkout", Environment::Dev).is_some());
    }

    #[test]
    fn namespaced_table_takes_namespace_from_the_query() {
        // `kubectl get pods --namespace team-a` prints no NAMESPACE column.
        let raw = "NAME READY STATUS\ndev-team-a-checkout-7f9c4d-x2k1p 1/1 Running\nqa-team-a-cart-5c8b-9zz1q 1/1 Running\n";
        let (rows, catalog) = catalog_from_table(raw, Some("team-a")).expect("table");
        assert_eq!(rows, 2);
        let inst = skiff_core::lookup(&catalog, "checkout", Environment::Dev).expect("checkout/dev");
        assert_eq!(inst.namespace, "team-a");
        assert_eq!(inst.discriminator_id, "7f9c4d-x2k1p");
        let cart = skiff_core::lookup(&catalog, "cart", Environment::Qa).expect("cart/qa");
        assert_eq!(cart.namespace, "team-a");
    }

    #[test]
    fn namespaced_table_without_namespace_is_malformed() {
        let raw = "NAME READY\ndev-team-a-checkout-7f9c4d-x2k1p 1/1\n";
        assert!(catalog_from_table(raw, None).is_err());
    }

    #[test]
    fn catalog_from_table_propagates_malformed_header() {
        assert!(catalog_from_table("STATUS\nRunning\n", None).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_query_returns_stdout() {
        let args = vec!["-c".to_string(), "printf 'NAME\\ndev-ns-api-h-r\\n'".to_string()];
        let out = run_query("sh", &args).await.expect("stdout");
        assert_eq!(out, "NAME\ndev-ns-api-h-r\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_query_surfaces_stderr_on_failure() {
        let args = vec!["-c".to_string(), "echo 'no context' >&2; exit 3".to_string()];
        match run_query("sh", &args).await {
            Err(QueryError::Failed { stderr, status, .. }) => {
                assert_eq!(stderr, "no context");
                assert_eq!(status.code(), Some(3));
            }
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn run_query_reports_missing_binary() {
        let err = run_query("skiff-definitely-not-installed", &[]).await.unwrap_err();
        assert!(matches!(err, QueryError::Spawn { .. }));
    }
}
