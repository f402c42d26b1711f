use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.toml";
const SETTINGS_FILE: &str = "settings.json";
const APP_DIR: &str = "InlineInstallGuard";
const ENV_PREFIX: &str = "INSTALL_GUARD_";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub settings: SettingsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7171,
            token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SettingsConfig {
    pub path: Option<String>,
    pub write_debounce_ms: u64,
    pub max_writes_per_minute: u32,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            path: None,
            write_debounce_ms: 1000,
            max_writes_per_minute: 120,
        }
    }
}

impl SettingsConfig {
    pub fn resolved_path(&self) -> PathBuf {
        match &self.path {
            Some(path) => PathBuf::from(path),
            None => app_dir().join(SETTINGS_FILE),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::default();
        let config_path = active_config_path();

        if let Ok(raw) = fs::read_to_string(&config_path) {
            match toml::from_str::<Config>(&raw) {
                Ok(file_config) => config = file_config,
                Err(err) => {
                    tracing::warn!(path = %config_path.display(), error = %err, "ignoring invalid config file")
                }
            }
        }

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        // Server settings
        if let Ok(val) = env::var(format!("{}SERVER_HOST", ENV_PREFIX)) {
            self.server.host = val;
        }
        if let Ok(val) = env::var(format!("{}SERVER_PORT", ENV_PREFIX)) {
            if let Ok(port) = val.parse() {
                self.server.port = port;
            }
        }
        if let Ok(val) = env::var(format!("{}SERVER_TOKEN", ENV_PREFIX)) {
            self.server.token = Some(val);
        }

        // Settings store
        if let Ok(val) = env::var(format!("{}SETTINGS_PATH", ENV_PREFIX)) {
            self.settings.path = Some(val);
        }
        if let Ok(val) = env::var(format!("{}SETTINGS_DEBOUNCE_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.settings.write_debounce_ms = ms;
            }
        }
        if let Ok(val) = env::var(format!("{}SETTINGS_MAX_WRITES_PER_MINUTE", ENV_PREFIX)) {
            if let Ok(limit) = val.parse() {
                self.settings.max_writes_per_minute = limit;
            }
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.server.port == 0 {
            return Err("server.port must be non-zero".into());
        }
        if self.server.host.trim().is_empty() {
            return Err("server.host must be set".into());
        }
        if !(100..=60_000).contains(&self.settings.write_debounce_ms) {
            return Err("settings.write_debounce_ms must be between 100 and 60000".into());
        }
        if self.settings.max_writes_per_minute == 0 {
            return Err("settings.max_writes_per_minute must be non-zero".into());
        }
        Ok(())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err("config.toml already exists".into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

fn app_dir() -> PathBuf {
    let appdata = env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
    Path::new(&appdata).join(APP_DIR)
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    app_dir().join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}
