use crate::platform::get_system_info;
use crate::types::*;
use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const APP_NAME: &str = "newtsvc";
pub const WINDOWS_APP_DIR_NAME: &str = "NewtService";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const VERSION_FILE_NAME: &str = "version.txt";
pub const LOG_DIR_NAME: &str = "logs";
pub const CLIENT_LOG_FILE_NAME: &str = "newt.log";
pub const SERVICE_LOG_PREFIX: &str = "newtsvc";
pub const SERVICE_LOGS_KEPT: usize = 7;
pub const STAGING_DIR_NAME: &str = "newtsvc-update";

pub const DEFAULT_CLIENT_RELEASES_URL: &str = "https://api.github.com/repos/fosrl/newt/releases";
pub const DEFAULT_APP_RELEASES_URL: &str =
    "https://api.github.com/repos/memesalot/newt-service/releases/latest";

/// Well-known on-disk locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub data_dir: PathBuf,
    pub client_executable: PathBuf,
    pub config_file: PathBuf,
    pub version_file: PathBuf,
    pub log_dir: PathBuf,
    pub staging_dir: PathBuf,
}

impl AppPaths {
    pub fn resolve() -> Result<Self> {
        let data_dir = match std::env::var_os("NEWTSVC_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => default_data_dir()?,
        };
        let staging_dir = std::env::var_os("NEWTSVC_STAGING_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join(STAGING_DIR_NAME));
        Ok(Self::with_dirs(data_dir, staging_dir))
    }

    pub fn with_dirs(data_dir: impl Into<PathBuf>, staging_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let client_name = format!("newt{}", get_system_info().exe_suffix());
        Self {
            client_executable: data_dir.join(client_name),
            config_file: data_dir.join(CONFIG_FILE_NAME),
            version_file: data_dir.join(VERSION_FILE_NAME),
            log_dir: data_dir.join(LOG_DIR_NAME),
            staging_dir: staging_dir.into(),
            data_dir,
        }
    }

    pub fn client_log_file(&self) -> PathBuf {
        self.log_dir.join(CLIENT_LOG_FILE_NAME)
    }

    /// Creates the data and log directories; failure here is fatal for startup.
    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("Could not create data directory {}", self.data_dir.display()))?;
        fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("Could not create log directory {}", self.log_dir.display()))?;
        Ok(())
    }
}

fn default_data_dir() -> Result<PathBuf> {
    if cfg!(windows) {
        if let Some(program_data) = std::env::var_os("ProgramData") {
            return Ok(PathBuf::from(program_data).join(WINDOWS_APP_DIR_NAME));
        }
    }
    let path = dirs::data_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?
        .join(APP_NAME);
    tracing::debug!("Data directory: {}", path.display());
    Ok(path)
}

pub fn client_releases_url() -> String {
    std::env::var("NEWTSVC_CLIENT_RELEASES_URL")
        .unwrap_or_else(|_| DEFAULT_CLIENT_RELEASES_URL.to_string())
}

pub fn app_releases_url() -> String {
    std::env::var("NEWTSVC_APP_RELEASES_URL").unwrap_or_else(|_| DEFAULT_APP_RELEASES_URL.to_string())
}

/// Loads the config, falling back to defaults when the file is missing or unreadable.
///
/// The supervision loop reloads this before every restart, so a bad edit must
/// never take the service down.
pub fn load_config(config_path: &Path) -> ServiceConfig {
    let mut config = match read_config_file(config_path) {
        Ok(Some(config)) => config,
        Ok(None) => {
            tracing::debug!("Config file {} does not exist", config_path.display());
            ServiceConfig::default()
        }
        Err(e) => {
            tracing::error!("Failed to load config: {:#}", e);
            ServiceConfig::default()
        }
    };
    apply_env_overrides(&mut config);
    config
}

pub fn read_config_file(config_path: &Path) -> Result<Option<ServiceConfig>> {
    if !config_path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(config_path)
        .with_context(|| format!("Could not read config file at {}", config_path.display()))?;

    let config: ServiceConfig =
        serde_json::from_str(&content).with_context(|| "Could not parse config file as JSON")?;

    Ok(Some(config))
}

fn apply_env_overrides(config: &mut ServiceConfig) {
    if let Ok(endpoint) = std::env::var("NEWTSVC_ENDPOINT") {
        config.endpoint = Some(endpoint);
    }

    if let Ok(id) = std::env::var("NEWTSVC_ID") {
        config.id = Some(id);
    }

    if let Ok(secret) = std::env::var("NEWTSVC_SECRET") {
        config.secret = Some(secret);
    }

    if let Ok(secs) = std::env::var("NEWTSVC_CHECK_INTERVAL_SECS") {
        if let Ok(secs) = secs.parse::<u64>() {
            config.settings.check_interval_secs = secs;
        }
    }

    if let Ok(prerelease) = std::env::var("NEWTSVC_INCLUDE_PRERELEASE") {
        config.settings.include_prerelease = parse_bool(&prerelease);
    }
}

/// Writes the whole file through a sibling temp file so a reload racing with
/// `config set` sees either the old or the new settings.
pub fn save_config(config_path: &Path, config: &ServiceConfig) -> Result<()> {
    let config_dir = config_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Invalid config path"))?;

    fs::create_dir_all(config_dir)?;

    let content = serde_json::to_string_pretty(config)?;
    let mut tmp = NamedTempFile::new_in(config_dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(config_path)
        .map_err(|e| e.error)
        .with_context(|| format!("Could not write config file at {}", config_path.display()))?;

    Ok(())
}

/// Translates the connection settings into the client's command line.
///
/// Empty fields are left out entirely so the client falls back to its own defaults.
pub fn build_command_line_args(config: &ServiceConfig) -> Vec<String> {
    let mut args = Vec::new();

    for (flag, value) in [
        ("--id", &config.id),
        ("--secret", &config.secret),
        ("--endpoint", &config.endpoint),
    ] {
        if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
            args.push(flag.to_string());
            args.push(value.to_string());
        }
    }

    args
}

/// Command line rendered for logs, with the secret value masked.
pub fn redacted_args(args: &[String]) -> Vec<String> {
    let mut redacted = Vec::with_capacity(args.len());
    let mut mask_next = false;
    for arg in args {
        if mask_next {
            redacted.push(REDACTED.to_string());
            mask_next = false;
        } else {
            mask_next = arg == "--secret";
            redacted.push(arg.clone());
        }
    }
    redacted
}

pub fn parse_bool(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}

pub fn normalize_key(key: &str) -> String {
    key.replace('-', "_")
        .chars()
        .map(|c| {
            if c.is_ascii_uppercase() {
                format!("_{}", c.to_lowercase())
            } else {
                c.to_string()
            }
        })
        .collect::<String>()
        .to_lowercase()
}

/// Keys accepted by `config get|set|unset`, in display order.
pub const CONFIG_KEYS: &[&str] = &[
    "endpoint",
    "id",
    "secret",
    "check_interval_secs",
    "stop_timeout_secs",
    "auto_update_client",
    "update_check_hours",
    "include_prerelease",
    "auto_update_app",
];

pub const REDACTED: &str = "[redacted]";

fn unknown_key(key: &str) -> anyhow::Error {
    anyhow::anyhow!(
        "'{}' is not a valid configuration setting. Valid settings: {}",
        key,
        CONFIG_KEYS.join(", ")
    )
}

pub fn get_config_value(config: &ServiceConfig, key: &str) -> Result<String> {
    let key = normalize_key(key);
    let settings = &config.settings;
    let value = match key.as_str() {
        "endpoint" => config.endpoint.clone().unwrap_or_default(),
        "id" => config.id.clone().unwrap_or_default(),
        "secret" => config.secret.clone().unwrap_or_default(),
        "check_interval_secs" => settings.check_interval_secs.to_string(),
        "stop_timeout_secs" => settings.stop_timeout_secs.to_string(),
        "auto_update_client" => settings.auto_update_client.to_string(),
        "update_check_hours" => settings.update_check_hours.to_string(),
        "include_prerelease" => settings.include_prerelease.to_string(),
        "auto_update_app" => settings.auto_update_app.to_string(),
        _ => return Err(unknown_key(&key)),
    };
    Ok(value)
}

pub fn set_config_value(config: &mut ServiceConfig, key: &str, value: &str) -> Result<()> {
    let key = normalize_key(key);
    let number = || {
        value
            .parse::<u64>()
            .with_context(|| format!("Invalid value for '{}': {}", key, value))
    };
    let settings = &mut config.settings;
    match key.as_str() {
        "endpoint" => config.endpoint = Some(value.to_string()),
        "id" => config.id = Some(value.to_string()),
        "secret" => config.secret = Some(value.to_string()),
        "check_interval_secs" => settings.check_interval_secs = number()?.max(1),
        "stop_timeout_secs" => settings.stop_timeout_secs = number()?,
        "auto_update_client" => settings.auto_update_client = parse_bool(value),
        "update_check_hours" => settings.update_check_hours = number()?,
        "include_prerelease" => settings.include_prerelease = parse_bool(value),
        "auto_update_app" => settings.auto_update_app = parse_bool(value),
        _ => return Err(unknown_key(&key)),
    }
    Ok(())
}

/// Resets `key` to its default; connection fields become unset.
pub fn unset_config_value(config: &mut ServiceConfig, key: &str) -> Result<()> {
    let key = normalize_key(key);
    let defaults = ServiceSettings::default();
    let settings = &mut config.settings;
    match key.as_str() {
        "endpoint" => config.endpoint = None,
        "id" => config.id = None,
        "secret" => config.secret = None,
        "check_interval_secs" => settings.check_interval_secs = defaults.check_interval_secs,
        "stop_timeout_secs" => settings.stop_timeout_secs = defaults.stop_timeout_secs,
        "auto_update_client" => settings.auto_update_client = defaults.auto_update_client,
        "update_check_hours" => settings.update_check_hours = defaults.update_check_hours,
        "include_prerelease" => settings.include_prerelease = defaults.include_prerelease,
        "auto_update_app" => settings.auto_update_app = defaults.auto_update_app,
        _ => return Err(unknown_key(&key)),
    }
    Ok(())
}

/// Copy of `config` that is safe to print.
pub fn redacted_config(config: &ServiceConfig) -> ServiceConfig {
    let mut shown = config.clone();
    if shown.secret.as_deref().is_some_and(|s| !s.is_empty()) {
        shown.secret = Some(REDACTED.to_string());
    }
    shown
}
