//! Picking a target out of the catalog, with hints when the pick is wrong.

use anyhow::{anyhow, Result};
use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use skiff_core::{list_service_names, Environment, ServiceCatalog, Target};

const MAX_SUGGESTIONS: usize = 3;

/// Closest service names to `query`, best first.
pub fn suggest(catalog: &ServiceCatalog, query: &str) -> Vec<String> {
    let matcher = SkimMatcherV2::default();
    let mut scored: Vec<(i64, String)> = list_service_names(catalog)
        .into_iter()
        .filter_map(|name| matcher.fuzzy_match(&name, query).map(|score| (score, name)))
        .collect();
    // Higher score first; names break ties so output is stable.
    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    scored.into_iter().take(MAX_SUGGESTIONS).map(|(_, n)| n).collect()
}

pub fn select_target(catalog: &ServiceCatalog, service: &str, env: Environment) -> Result<Target> {
    let Some(bindings) = catalog.get(service) else {
        if catalog.is_empty() {
            return Err(anyhow!("no services discovered (pods must be named <env>-<namespace>-<service>-<hash>-<suffix>)"));
        }
        let hints = suggest(catalog, service);
        return Err(if hints.is_empty() {
            anyhow!("unknown service: {}", service)
        } else {
            anyhow!("unknown service: {} (did you mean: {})", service, hints.join(", "))
        });
    };
    Target::select(catalog, service, env).ok_or_else(|| {
        let deployed: Vec<&str> = bindings.keys().map(|e| e.as_str()).collect();
        anyhow!("{} has no {} instance (deployed: {})", service, env, deployed.join(", "))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_core::InstanceRef;

    fn catalog() -> ServiceCatalog {
        let mut c = ServiceCatalog::new();
        for (svc, env) in [("checkout", Environment::Dev), ("checkout", Environment::Stg), ("cart-api", Environment::Qa), ("billing", Environment::Dev)] {
            c.insert_or_update(svc, env, InstanceRef { discriminator_id: "h-r".into(), namespace: "ns".into() });
        }
        c
    }

    #[test]
    fn selects_deployed_pair() {
        let t = select_target(&catalog(), "checkout", Environment::Stg).expect("target");
        assert_eq!(t.pod_name(), "stg-ns-checkout-h-r");
    }

    #[test]
    fn undeployed_environment_names_the_deployed_ones() {
        let err = select_target(&catalog(), "checkout", Environment::Qa).unwrap_err();
        assert_eq!(err.to_string(), "checkout has no qa instance (deployed: dev, stg)");
    }

    #[test]
    fn unknown_service_suggests_close_names() {
        let err = select_target(&catalog(), "chkout", Environment::Dev).unwrap_err();
        assert!(err.to_string().contains("did you mean: checkout"), "{}", err);
    }

    #[test]
    fn unknown_service_without_match_has_no_hint() {
        let err = select_target(&catalog(), "zzz", Environment::Dev).unwrap_err();
        assert_eq!(err.to_string(), "unknown service: zzz");
    }

    #[test]
    fn empty_catalog_explains_naming() {
        let err = select_target(&ServiceCatalog::new(), "x", Environment::Dev).unwrap_err();
        assert!(err.to_string().starts_with("no services discovered"));
    }

    #[test]
    fn suggestions_are_capped() {
        assert!(suggest(&catalog(), "c").len() <= MAX_SUGGESTIONS);
    }
}
