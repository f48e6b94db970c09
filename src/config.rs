use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::provider::{Provider, ProviderRegistry, RegistryError, builtin_providers};

pub const DEFAULT_CACHE_TTL: u64 = 300;
const DEFAULT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_REDIRECTS: usize = 10;

/// Resolve the platform default path of `dohrelay.toml`.
pub fn default_config_path() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("dev", "dohrelay", "dohrelay")
        .context("Unable to resolve platform config directory")?;
    Ok(dirs.config_dir().join("dohrelay.toml"))
}

/// Runtime configuration parsed from `dohrelay.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub upstream: UpstreamSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default = "RelaySettings::default_providers")]
    pub providers: Vec<Provider>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "ServerSection::default_listen")]
    pub listen: String,
    #[serde(default = "ServerSection::default_path")]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_cert_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_key_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_listen: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSection {
    /// Per-attempt timeout. Zero waits indefinitely.
    #[serde(default = "UpstreamSection::default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "UpstreamSection::default_max_redirects")]
    pub max_redirects: usize,
    #[serde(default = "UpstreamSection::default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    #[serde(default = "CacheSection::default_ttl")]
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingSection {
    #[serde(default)]
    pub format: LogFormat,
    /// Directory for a daily rolling log file, in addition to stderr.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

impl ServerSection {
    fn default_listen() -> String {
        "127.0.0.1:8053".into()
    }

    fn default_path() -> String {
        "/dns-query".into()
    }

    /// Route path with a guaranteed leading slash.
    pub fn normalised_path(&self) -> String {
        let trimmed = self.path.trim();
        if trimmed.is_empty() {
            Self::default_path()
        } else if trimmed.starts_with('/') {
            trimmed.into()
        } else {
            format!("/{trimmed}")
        }
    }

    pub fn tls_paths(&self) -> Option<(&Path, &Path)> {
        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: Self::default_listen(),
            path: Self::default_path(),
            tls_cert_path: None,
            tls_key_path: None,
            metrics_listen: None,
        }
    }
}

impl UpstreamSection {
    fn default_timeout_ms() -> u64 {
        DEFAULT_TIMEOUT_MS
    }

    fn default_max_redirects() -> usize {
        DEFAULT_MAX_REDIRECTS
    }

    fn default_user_agent() -> String {
        format!("dohrelay/{}", env!("CARGO_PKG_VERSION"))
    }
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            timeout_ms: Self::default_timeout_ms(),
            max_redirects: Self::default_max_redirects(),
            user_agent: Self::default_user_agent(),
        }
    }
}

impl CacheSection {
    fn default_ttl() -> u64 {
        DEFAULT_CACHE_TTL
    }
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            ttl_seconds: Self::default_ttl(),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            server: ServerSection::default(),
            upstream: UpstreamSection::default(),
            cache: CacheSection::default(),
            logging: LoggingSection::default(),
            providers: Self::default_providers(),
        }
    }
}

/// Outcome of writing a configuration template to disk.
#[derive(Debug, Clone)]
pub struct ConfigWriteOutcome {
    pub path: PathBuf,
    pub action: ConfigWriteAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigWriteAction {
    Created,
    Updated,
    /// `overwrite` was set but the file already matches.
    Unchanged,
    Skipped,
}

impl RelaySettings {
    fn default_providers() -> Vec<Provider> {
        builtin_providers().iter().map(Provider::from).collect()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Unable to read dohrelay config at {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("Malformed dohrelay config at {}", path.display()))
    }

    /// Load from `path`, or fall back to defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn registry(&self) -> Result<ProviderRegistry, RegistryError> {
        ProviderRegistry::new(self.providers.clone())
    }

    pub fn render(&self) -> Result<String> {
        let body = toml::to_string_pretty(self).context("Failed to render dohrelay config")?;
        Ok(format!(
            "# dohrelay configuration\n# Generated by `dohrelay --write-config`.\n\n{body}"
        ))
    }

    /// Write these settings to `path`, leaving an existing file alone unless `overwrite`.
    pub fn write_config(&self, path: &Path, overwrite: bool) -> Result<ConfigWriteOutcome> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory {}", parent.display())
            })?;
        }

        let rendered = self.render()?;
        let outcome = |action| ConfigWriteOutcome {
            path: path.to_path_buf(),
            action,
        };

        if path.exists() {
            if !overwrite {
                return Ok(outcome(ConfigWriteAction::Skipped));
            }
            let current = fs::read_to_string(path).unwrap_or_default();
            if current == rendered {
                return Ok(outcome(ConfigWriteAction::Unchanged));
            }
            fs::write(path, rendered)
                .with_context(|| format!("Failed to update config at {}", path.display()))?;
            return Ok(outcome(ConfigWriteAction::Updated));
        }

        fs::write(path, rendered)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        Ok(outcome(ConfigWriteAction::Created))
    }

    /// Summarise problems with these settings without starting anything.
    pub fn health_report(&self) -> HealthReport {
        let mut issues = Vec::new();

        check_socket(&self.server.listen, "DoH listener", &mut issues);
        if let Some(metrics) = &self.server.metrics_listen {
            check_socket(metrics, "Metrics listener", &mut issues);
        }

        let tls = match (&self.server.tls_cert_path, &self.server.tls_key_path) {
            (Some(cert), Some(key)) => {
                for (label, path) in [("certificate", cert), ("private key", key)] {
                    if !path.exists() {
                        issues.push(format!("TLS {label} missing at {}", path.display()));
                    }
                }
                true
            }
            (None, None) => false,
            _ => {
                issues.push(
                    "TLS needs both tls_cert_path and tls_key_path; serving plain HTTP".into(),
                );
                false
            }
        };

        if self.upstream.timeout_ms == 0 {
            issues.push("upstream timeout disabled; a hanging provider hangs the request".into());
        }
        if self.cache.ttl_seconds == 0 {
            issues.push("cache ttl_seconds is zero; responses will not be cacheable".into());
        }

        let registry_error = match self.registry() {
            Ok(registry) => {
                for provider in registry.providers().iter().filter(|p| p.is_insecure()) {
                    issues.push(format!(
                        "provider '{}' uses plain HTTP ({})",
                        provider.name, provider.url
                    ));
                }
                None
            }
            Err(err) => Some(err.to_string()),
        };

        HealthReport {
            listen: self.server.listen.clone(),
            path: self.server.normalised_path(),
            tls,
            metrics_listen: self.server.metrics_listen.clone(),
            timeout_ms: self.upstream.timeout_ms,
            cache_ttl_seconds: self.cache.ttl_seconds,
            providers: self.providers.clone(),
            registry_error,
            issues,
        }
    }
}

fn check_socket(address: &str, label: &str, issues: &mut Vec<String>) {
    if address.trim().is_empty() {
        issues.push(format!("{label} address is empty"));
        return;
    }
    if address.parse::<SocketAddr>().is_err() {
        issues.push(format!("{label} address is invalid: {address}"));
    }
}

/// Diagnostic snapshot printed by `dohrelay --check`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub listen: String,
    pub path: String,
    pub tls: bool,
    pub metrics_listen: Option<String>,
    pub timeout_ms: u64,
    pub cache_ttl_seconds: u64,
    pub providers: Vec<Provider>,
    /// Set when the provider list would abort startup.
    pub registry_error: Option<String>,
    pub issues: Vec<String>,
}

impl HealthReport {
    pub fn is_startable(&self) -> bool {
        self.registry_error.is_none()
    }
}
