use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }
}

/// Connection credentials for the backend project.
///
/// Field names follow the web SDK config object, so an override file can be
/// pasted straight from the project console.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackendConfig {
    pub api_key: String,
    pub auth_domain: String,
    pub project_id: String,
    pub storage_bucket: String,
    pub messaging_sender_id: String,
    pub app_id: String,
    /// Realtime tree store root, e.g. `https://<project>-default-rtdb.firebaseio.com`
    #[serde(rename = "databaseURL")]
    pub database_url: String,
    /// Document store REST root (point at an emulator to test locally)
    pub firestore_endpoint: String,
    /// Identity REST root
    pub identity_endpoint: String,
    /// Token refresh REST root
    pub token_endpoint: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_key: "dualsync-default-api-key".to_string(),
            auth_domain: "dualsync-default.firebaseapp.com".to_string(),
            project_id: "dualsync-default".to_string(),
            storage_bucket: "dualsync-default.firebasestorage.app".to_string(),
            messaging_sender_id: String::new(),
            app_id: String::new(),
            database_url: "https://dualsync-default-default-rtdb.firebaseio.com".to_string(),
            firestore_endpoint: "https://firestore.googleapis.com/v1".to_string(),
            identity_endpoint: "https://identitytoolkit.googleapis.com/v1".to_string(),
            token_endpoint: "https://securetoken.googleapis.com/v1".to_string(),
        }
    }
}

impl BackendConfig {
    /// Reads the local override file, falling back to `fallback` when it is
    /// absent, unreadable, malformed or lacks an `apiKey`.
    pub fn resolve_override(path: &Path, fallback: &BackendConfig) -> BackendConfig {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No backend override at {}", path.display());
                return fallback.clone();
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to read backend override {}: {}",
                    path.display(),
                    e
                );
                return fallback.clone();
            }
        };

        match Self::parse_override(&contents) {
            Some(config) => {
                tracing::info!(
                    "Using backend override for project '{}'",
                    config.project_id
                );
                config
            }
            None => {
                tracing::warn!(
                    "Invalid backend override in {}, using configured backend",
                    path.display()
                );
                fallback.clone()
            }
        }
    }

    /// Parses override JSON. Requires a non-empty `apiKey`; other missing
    /// fields take compiled-in defaults.
    pub fn parse_override(contents: &str) -> Option<BackendConfig> {
        let raw: serde_json::Value = serde_json::from_str(contents).ok()?;
        let has_key = raw
            .get("apiKey")
            .and_then(|k| k.as_str())
            .is_some_and(|k| !k.is_empty());
        if !has_key {
            return None;
        }
        serde_json::from_value(raw).ok()
    }
}

/// Credentials used to sign in before running commands
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    pub email: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

impl AuthConfig {
    pub fn is_configured(&self) -> bool {
        self.email.is_some() && self.password.is_some()
    }
}

/// Application configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Backend credentials from the config file (before any override)
    pub backend: BackendConfig,
    /// Path of the local backend override file
    pub backend_override: ConfigValue<PathBuf>,
    /// Poll interval for document subscriptions, in milliseconds
    pub watch_interval_ms: ConfigValue<u64>,
    /// Sign-in credentials
    pub auth: AuthConfig,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    backend: Option<BackendConfig>,
    backend_override: Option<PathBuf>,
    watch_interval_ms: Option<u64>,
    auth: Option<AuthConfig>,
}

const DEFAULT_WATCH_INTERVAL_MS: u64 = 2000;

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut backend = BackendConfig::default();
        let mut backend_override =
            ConfigValue::new(Self::default_override_path(), ConfigSource::Default);
        let mut watch_interval_ms =
            ConfigValue::new(DEFAULT_WATCH_INTERVAL_MS, ConfigSource::Default);
        let mut auth = AuthConfig::default();
        let mut config_file = None;

        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config_file = Some(path.clone());

            if let Some(file_backend) = file_config.backend {
                backend = file_backend;
            }
            if let Some(override_path) = file_config.backend_override {
                // Resolve relative paths against config file's directory
                let resolved = if override_path.is_relative() {
                    path.parent()
                        .map(|p| p.join(&override_path))
                        .unwrap_or(override_path)
                } else {
                    override_path
                };
                backend_override = ConfigValue::new(resolved, ConfigSource::File);
            }
            if let Some(interval) = file_config.watch_interval_ms {
                watch_interval_ms = ConfigValue::new(interval, ConfigSource::File);
            }
            if let Some(file_auth) = file_config.auth {
                auth = file_auth;
            }
        }

        // Apply environment variable overrides
        if let Ok(override_path) = std::env::var("DUALSYNC_BACKEND_OVERRIDE") {
            backend_override =
                ConfigValue::new(PathBuf::from(override_path), ConfigSource::Environment);
        }
        if let Some(interval) = std::env::var("DUALSYNC_WATCH_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            watch_interval_ms = ConfigValue::new(interval, ConfigSource::Environment);
        }
        if let Ok(project_id) = std::env::var("DUALSYNC_PROJECT_ID") {
            backend.project_id = project_id;
        }
        if let Ok(api_key) = std::env::var("DUALSYNC_API_KEY") {
            backend.api_key = api_key;
        }
        if let Ok(database_url) = std::env::var("DUALSYNC_DATABASE_URL") {
            backend.database_url = database_url;
        }
        if let Ok(email) = std::env::var("DUALSYNC_EMAIL") {
            auth.email = Some(email);
        }
        if let Ok(password) = std::env::var("DUALSYNC_PASSWORD") {
            auth.password = Some(password);
        }

        Ok(Self {
            backend,
            backend_override,
            watch_interval_ms,
            auth,
            config_file,
        })
    }

    /// Backend to connect to: the override file if valid, else `backend`.
    ///
    /// Reads the override file; call once at startup.
    pub fn active_backend(&self) -> BackendConfig {
        BackendConfig::resolve_override(&self.backend_override.value, &self.backend)
    }

    /// Default config directory (platform-specific)
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dualsync")
    }

    /// Default config file path: <config_dir>/dualsync/config.yaml
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }

    /// Default override path: <config_dir>/dualsync/backend.json
    pub fn default_override_path() -> PathBuf {
        Self::default_config_dir().join("backend.json")
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(
                    f,
                    "Failed to parse config file '{}': {}",
                    path.display(),
                    e
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::ReadError(_, e) => Some(e),
            ConfigError::ParseError(_, e) => Some(e),
        }
    }
}
