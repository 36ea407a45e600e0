use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "FIXTURE_HUB_";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub catalog: CatalogConfig,
    pub actuator: ActuatorConfig,
    pub snapshot: SnapshotConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Clients must present this token when set.
    pub client_token: Option<String>,
    /// Exact `Origin` values allowed to open client sockets. Empty allows any.
    pub allowed_origins: Vec<String>,
    pub outbound_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            client_token: None,
            allowed_origins: Vec::new(),
            outbound_queue: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub path: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: "fixtures.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ActuatorConfig {
    /// Generated at startup when unset.
    pub token: Option<String>,
    pub queue: usize,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            token: None,
            queue: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct SnapshotConfig {
    pub expose_holders: bool,
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::default();
        let config_path = active_config_path();

        if let Ok(raw) = fs::read_to_string(&config_path) {
            config = toml::from_str::<Config>(&raw)
                .map_err(|err| format!("invalid {}: {err}", config_path.display()))?;
        }

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var(format!("{}HOST", ENV_PREFIX)) {
            self.server.host = val;
        }
        if let Ok(val) = env::var(format!("{}PORT", ENV_PREFIX)) {
            if let Ok(port) = val.parse() {
                self.server.port = port;
            }
        }
        if let Ok(val) = env::var(format!("{}CLIENT_TOKEN", ENV_PREFIX)) {
            self.server.client_token = Some(val);
        }
        if let Ok(val) = env::var(format!("{}ALLOWED_ORIGINS", ENV_PREFIX)) {
            self.server.allowed_origins = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Ok(val) = env::var(format!("{}CATALOG_PATH", ENV_PREFIX)) {
            self.catalog.path = val;
        }

        if let Ok(val) = env::var(format!("{}ACTUATOR_TOKEN", ENV_PREFIX)) {
            self.actuator.token = Some(val);
        }

        if let Ok(val) = env::var(format!("{}EXPOSE_HOLDERS", ENV_PREFIX)) {
            self.snapshot.expose_holders = val.parse().unwrap_or(false);
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.server.port == 0 {
            return Err("server.port must be non-zero".into());
        }
        if self.server.host.trim().is_empty() {
            return Err("server.host must be set".into());
        }
        if self.server.outbound_queue < 2 {
            return Err("server.outbound_queue must be >= 2".into());
        }
        if self
            .server
            .client_token
            .as_deref()
            .is_some_and(|t| t.trim().is_empty())
        {
            return Err("server.client_token must not be blank".into());
        }
        if self.catalog.path.trim().is_empty() {
            return Err("catalog.path must be set".into());
        }
        if self.actuator.queue == 0 {
            return Err("actuator.queue must be non-zero".into());
        }
        if self
            .actuator
            .token
            .as_deref()
            .is_some_and(|t| t.trim().is_empty())
        {
            return Err("actuator.token must not be blank".into());
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

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    let base = env::var("XDG_CONFIG_HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&base).join("fixture-hub").join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}
