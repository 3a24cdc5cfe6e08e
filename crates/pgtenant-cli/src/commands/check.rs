//! Configuration check command.
//!
//! `pgtenant check` - Load and validate a configuration file, then resolve
//! every registered project the way the proxy would.

use anyhow::Context;
use pgtenant_core::PgTenantConfig;
use pgtenant_proxy::{ConfigRegistry, TenantKey, TenantResolver, UpstreamAddress};
use std::path::Path;
use std::sync::Arc;

use super::serve::load_keys;

/// Outcome of resolving one registered project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantStatus {
    pub tenant: String,
    /// `postgres://host:port/instance` when the tenant is ready, otherwise why not.
    pub result: Result<String, String>,
}

/// Resolve every project in the registry.
pub async fn resolve_tenants(config: &PgTenantConfig) -> Vec<TenantStatus> {
    let registry = ConfigRegistry::from_config(&config.registry);
    let keys: Vec<TenantKey> = registry
        .projects()
        .into_iter()
        .map(|p| TenantKey::new(p.org.clone(), p.name.clone()))
        .collect();
    let resolver = TenantResolver::new(Arc::new(registry));

    let mut statuses = Vec::with_capacity(keys.len());
    for key in keys {
        let result = match resolver.resolve(&key).await {
            Ok(target) => UpstreamAddress::parse(&target.host, config.upstream.port)
                .map(|address| address.dsn(&target.instance_id))
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        statuses.push(TenantStatus {
            tenant: key.to_string(),
            result,
        });
    }
    statuses
}

/// Run the check and print a report.
pub async fn run(config_path: &Path) -> anyhow::Result<()> {
    println!("🔍 Checking pgtenant configuration...");
    println!();

    let config = PgTenantConfig::from_file(config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;
    let settings = config.pool_settings()?;
    println!("  ✔ Configuration is valid");
    println!(
        "    Listener: {} (max {} clients)",
        config.proxy.bind_address(),
        config.proxy.max_client_connections
    );
    println!(
        "    Credential TTL: {}s, connections recycled after {}s",
        config.credentials.ttl_seconds,
        settings.max_conn_lifetime.as_secs()
    );

    let mut problems = 0;
    match load_keys(&config.biscuit) {
        Ok(_) => println!("  ✔ Biscuit keys loaded"),
        Err(e) => {
            problems += 1;
            println!("  ✖ Biscuit keys: {:#}", e);
        }
    }

    println!();
    println!("Tenants:");
    let statuses = resolve_tenants(&config).await;
    if statuses.is_empty() {
        println!("  (no projects registered)");
    }
    for status in &statuses {
        match &status.result {
            Ok(dsn) => println!("  ✔ {} → {}", status.tenant, dsn),
            Err(reason) => println!("  ⚠ {}: {}", status.tenant, reason),
        }
    }

    let ready = statuses.iter().filter(|s| s.result.is_ok()).count();
    println!();
    println!("{} of {} tenants ready", ready, statuses.len());

    if problems > 0 {
        anyhow::bail!("Configuration check failed with {} error(s)", problems);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgtenant_biscuit::KeyPair;
    use std::io::Write;

    const CONFIG: &str = r#"
upstream:
  port: 6432
registry:
  projects:
    - { org: acme, name: sales, prod_deployment: dep-1 }
    - { org: acme, name: unready }
    - { org: beta, name: web, prod_deployment: dep-2 }
  deployments:
    - { id: dep-1, runtime_host: "http://localhost:8081", runtime_instance_id: inst-1 }
    - { id: dep-2, runtime_host: "db.internal:7000", runtime_instance_id: inst-2 }
"#;

    #[tokio::test]
    async fn test_resolve_tenants() {
        let config = PgTenantConfig::from_yaml(CONFIG).unwrap();
        let statuses = resolve_tenants(&config).await;

        assert_eq!(
            statuses.iter().map(|s| s.tenant.as_str()).collect::<Vec<_>>(),
            vec!["acme.sales", "acme.unready", "beta.web"]
        );
        assert_eq!(statuses[0].result, Ok("postgres://localhost:6432/inst-1".to_string()));
        assert!(statuses[1].result.is_err());
        assert_eq!(statuses[2].result, Ok("postgres://db.internal:7000/inst-2".to_string()));
    }

    #[tokio::test]
    async fn test_run_with_and_without_keys() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("pgtenant.yaml");
        std::fs::write(&config_path, CONFIG).unwrap();

        // No private key configured
        assert!(run(&config_path).await.is_err());

        let key_path = dir.path().join("private.key");
        let keypair = KeyPair::generate().unwrap();
        keypair
            .save_to_files(&key_path, &dir.path().join("public.key"))
            .unwrap();

        let mut file = std::fs::OpenOptions::new().append(true).open(&config_path).unwrap();
        writeln!(file, "biscuit:\n  private_key_file: {}", key_path.display()).unwrap();
        run(&config_path).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("pgtenant.yaml");
        std::fs::write(
            &config_path,
            "credentials:\n  ttl_seconds: 30\npool:\n  lifetime_margin_seconds: 60\n",
        )
        .unwrap();

        let err = run(&config_path).await.unwrap_err();
        assert!(format!("{:#}", err).contains("lifetime_margin_seconds"));
    }
}
