use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cache::CacheOptions;
use crate::cli::{Cli, LogFormat};

fn default_ttl() -> u64 {
    600
}

fn default_ignored_query_vars() -> Vec<String> {
    [
        "utm_source",
        "utm_medium",
        "utm_campaign",
        "utm_term",
        "utm_content",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_ignored_cookies() -> Vec<String> {
    vec!["test_cookie".to_string()]
}

fn default_allowed_status_codes() -> Vec<u16> {
    vec![200, 301, 302, 304, 404]
}

fn default_cacheable_methods() -> Vec<String> {
    vec!["GET".to_string(), "HEAD".to_string()]
}

fn default_lock_timeout_ms() -> u64 {
    250
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_sweep_batch_size() -> usize {
    1000
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub cache_dir: PathBuf,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default = "default_ttl")]
    pub ttl: u64,
    #[serde(default = "default_ignored_query_vars")]
    pub ignored_query_vars: Vec<String>,
    #[serde(default = "default_ignored_cookies")]
    pub ignored_cookies: Vec<String>,
    #[serde(default = "default_allowed_status_codes")]
    pub allowed_status_codes: Vec<u16>,
    #[serde(default = "default_cacheable_methods")]
    pub cacheable_methods: Vec<String>,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,
    #[serde(default = "default_sweep_batch_size")]
    pub sweep_batch_size: usize,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        let config_path = resolve_config_path(cli)?;

        builder = builder.add_source(File::from(config_path.clone()).required(true));

        builder = builder.add_source(
            Environment::with_prefix("FPCACHE")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.apply_base_dir(&config_path);
        settings.validate()?;
        Ok(settings)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval)
    }

    /// Translate the flat settings into the cache's option struct. Method
    /// names are uppercased so config casing never fragments admission.
    pub fn cache_options(&self) -> CacheOptions {
        CacheOptions {
            base_dir: self.cache_dir.clone(),
            ttl: self.ttl(),
            ignored_query_vars: self.ignored_query_vars.iter().cloned().collect(),
            ignored_cookies: self.ignored_cookies.iter().cloned().collect(),
            allowed_status_codes: self.allowed_status_codes.iter().copied().collect(),
            cacheable_methods: self
                .cacheable_methods
                .iter()
                .map(|method| method.to_ascii_uppercase())
                .collect(),
            lock_timeout: self.lock_timeout(),
        }
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

impl Cli {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

fn resolve_config_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = cli.config_path() {
        return Ok(path.to_path_buf());
    }

    for candidate in default_config_candidates() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!(
        "no configuration file provided via --config and none found in default locations: {}",
        default_config_candidates()
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/fpcache/fpcache.toml"),
        PathBuf::from("fpcache.toml"),
    ]
}

impl Settings {
    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        self.cache_dir = absolutize(&self.cache_dir, base_dir);
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.cache_dir.as_os_str().is_empty(),
            "cache_dir must not be empty"
        );
        ensure!(self.ttl > 0, "ttl must be greater than 0 (got {})", self.ttl);
        ensure!(
            self.lock_timeout_ms > 0,
            "lock_timeout_ms must be greater than 0 (got {})",
            self.lock_timeout_ms
        );
        ensure!(
            self.sweep_batch_size > 0,
            "sweep_batch_size must be greater than 0 (got {})",
            self.sweep_batch_size
        );
        ensure!(
            !self.cacheable_methods.is_empty(),
            "cacheable_methods must name at least one method"
        );
        ensure!(
            !self.allowed_status_codes.is_empty(),
            "allowed_status_codes must name at least one status code"
        );
        for code in &self.allowed_status_codes {
            ensure!(
                (100..=599).contains(code),
                "allowed_status_codes entry {code} is not a valid HTTP status code"
            );
        }
        Ok(())
    }
}

fn absolutize(path: &Path, base_dir: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}
