//! Operator-facing declarative configuration: tenants, backends, and the
//! gateway's global listener/script settings. Parsed from YAML with serde
//! and validated at load time so startup fails fast on a bad config
//! (`spec.md` §6, §7 `ConfigInvalid`).

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: ListenConfig,

    /// Base path admin endpoints (`/health`, `/tenants`) are mounted under.
    /// Served by an external collaborator; the gateway only computes the
    /// bodies (see `admin.rs`).
    #[serde(default = "default_admin_base_path")]
    pub admin_base_path: String,

    /// Directory the Script Loader walks for `.lua` files.
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: String,

    /// Per-request timeout enforced at the gateway (spec.md §4.9, §5).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub script_pool: ScriptPoolConfig,

    #[serde(default)]
    pub connection_pool: ConnectionPoolConfig,

    pub tenants: Vec<Tenant>,
}

fn default_admin_base_path() -> String {
    "/".to_string()
}

fn default_scripts_dir() -> String {
    "./scripts".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    #[serde(default = "default_listen_address")]
    pub address: String,
    pub port: u16,
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

/// A tenant: a routing scope keyed by host set and/or path prefix, owning a
/// backend list and optionally a script (`spec.md` §3).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Tenant {
    pub name: String,

    #[serde(default)]
    pub domains: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,

    #[serde(default = "default_health_interval")]
    pub health_interval: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,

    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

fn default_health_interval() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_health_path")]
    pub health: String,
}

fn default_health_path() -> String {
    "/health".to_string()
}

/// Interpreter pool sizing (spec.md §4.1).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScriptPoolConfig {
    #[serde(default = "default_pool_size")]
    pub size: usize,
    /// Hard cap on burst growth above `size`. Equal to `size` disables burst.
    #[serde(default = "default_pool_max_burst")]
    pub max_burst: usize,
    #[serde(default = "default_pool_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

fn default_pool_size() -> usize {
    10
}

fn default_pool_max_burst() -> usize {
    10
}

fn default_pool_acquire_timeout_ms() -> u64 {
    5_000
}

impl Default for ScriptPoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            max_burst: default_pool_max_burst(),
            acquire_timeout_ms: default_pool_acquire_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionPoolConfig {
    #[serde(default = "default_pool_max_idle_per_host")]
    pub max_idle_per_host: usize,
    #[serde(default = "default_pool_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_pool_max_idle_per_host() -> usize {
    100
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_connect_timeout() -> u64 {
    5
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: default_pool_max_idle_per_host(),
            idle_timeout_secs: default_pool_idle_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates tenant declarations per spec.md §3's invariants.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        let mut seen_names = std::collections::HashSet::new();

        for tenant in &self.tenants {
            if !seen_names.insert(tenant.name.as_str()) {
                anyhow::bail!("duplicate tenant name: '{}'", tenant.name);
            }

            if tenant.domains.is_empty() && tenant.path_prefix.is_none() {
                anyhow::bail!(
                    "tenant '{}' must specify at least one of {{domains, path_prefix}}",
                    tenant.name
                );
            }

            if let Some(ref prefix) = tenant.path_prefix {
                if !prefix.starts_with('/') || !prefix.ends_with('/') {
                    anyhow::bail!(
                        "tenant '{}' path_prefix must start and end with '/': got '{}'",
                        tenant.name,
                        prefix
                    );
                }
            }

            let mut seen_services = std::collections::HashSet::new();
            for service in &tenant.services {
                if !seen_services.insert(service.name.as_str()) {
                    anyhow::bail!(
                        "tenant '{}' has duplicate service name '{}'",
                        tenant.name,
                        service.name
                    );
                }
                if service.url.parse::<hyper::Uri>().is_err() {
                    anyhow::bail!(
                        "tenant '{}' service '{}' has an invalid url: '{}'",
                        tenant.name,
                        service.name,
                        service.url
                    );
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r#"
listen:
  port: 8080
tenants:
  - name: a
    domains: ["a.example"]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.listen.port, 8080);
        assert_eq!(config.admin_base_path, "/");
        assert_eq!(config.scripts_dir, "./scripts");
        assert_eq!(config.tenants.len(), 1);
        assert_eq!(config.tenants[0].health_interval, 10);
    }

    #[test]
    fn test_tenant_requires_host_or_prefix() {
        let yaml = r#"
listen:
  port: 8080
tenants:
  - name: bad
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_path_prefix_must_be_slash_bounded() {
        let yaml = r#"
listen:
  port: 8080
tenants:
  - name: b
    path_prefix: "/api"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_hybrid_tenant_with_services() {
        let yaml = r#"
listen:
  port: 8080
  address: "127.0.0.1"
tenants:
  - name: c
    domains: ["c.example"]
    path_prefix: "/v2/"
    script: "c"
    services:
      - name: primary
        url: "http://u1:8000"
        health: "/healthz"
      - name: secondary
        url: "http://u2:8000"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.tenants[0].services.len(), 2);
        assert_eq!(config.tenants[0].services[0].health, "/healthz");
        assert_eq!(config.tenants[0].services[1].health, "/health");
    }

    #[test]
    fn test_duplicate_tenant_names_rejected() {
        let yaml = r#"
listen:
  port: 8080
tenants:
  - name: dup
    domains: ["x.example"]
  - name: dup
    domains: ["y.example"]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_service_url_rejected() {
        let yaml = r#"
listen:
  port: 8080
tenants:
  - name: d
    path_prefix: "/api/"
    services:
      - name: bad
        url: "::not a url::"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }
}
