//! Service resolution: group pod rows by the `<env>-<namespace>-<service>-<hash>-<suffix>`
//! naming convention.
//!
//! Rows that do not follow the convention (system pods, unprefixed workloads,
//! names too short to split) are skipped; they are expected noise, not errors.

#![forbid(unsafe_code)]

use crate::{Environment, InstanceRef, InstanceRow, ServiceCatalog};

/// Tokens taken by the discriminator id (`<hash>-<suffix>`).
const DISCRIMINATOR_TOKENS: usize = 2;

/// A row that follows the naming convention, split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved<'a> {
    pub env: Environment,
    pub service: String,
    pub discriminator_id: String,
    pub namespace: &'a str,
}

/// Remove a leading `<namespace>-` segment, only at the very start.
fn strip_namespace<'a>(name: &'a str, namespace: &str) -> &'a str {
    name.strip_prefix(namespace)
        .and_then(|rest| rest.strip_prefix('-'))
        .unwrap_or(name)
}

/// Classify and split one row, or `None` when it does not follow the convention.
pub fn resolve_row(row: &InstanceRow) -> Option<Resolved<'_>> {
    let (env, stripped) = Environment::classify(&row.name)?;
    let rest = strip_namespace(stripped, &row.namespace);

    // Doubled or dangling separators leave empty tokens; such names are not split.
    let tokens: Vec<&str> = rest.split('-').collect();
    if tokens.len() < DISCRIMINATOR_TOKENS + 1 || tokens.iter().any(|t| t.is_empty()) {
        return None;
    }
    let (service, id) = tokens.split_at(tokens.len() - DISCRIMINATOR_TOKENS);
    Some(Resolved { env, service: service.join("-"), discriminator_id: id.join("-"), namespace: &row.namespace })
}

/// Build a catalog from rows, in order; later rows overwrite earlier bindings.
pub fn resolve<'a, I>(rows: I) -> ServiceCatalog
where
    I: IntoIterator<Item = &'a InstanceRow>,
{
    let mut catalog = ServiceCatalog::new();
    for r in rows.into_iter().filter_map(resolve_row) {
        catalog.insert_or_update(
            &r.service,
            r.env,
            InstanceRef { discriminator_id: r.discriminator_id, namespace: r.namespace.to_string() },
        );
    }
    catalog
}

/// Service names in ascending lexicographic order.
pub fn list_service_names(catalog: &ServiceCatalog) -> Vec<String> {
    catalog.iter().map(|(name, _)| name.to_string()).collect()
}

pub fn lookup<'c>(catalog: &'c ServiceCatalog, service: &str, env: Environment) -> Option<&'c InstanceRef> {
    catalog.get(service).and_then(|bindings| bindings.get(&env))
}
