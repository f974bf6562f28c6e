use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use config::{Environment, File, FileFormat};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::settings::AppConfig;
use super::{ConfigError, CONFIG_ENV_PREFIX, CONFIG_ENV_VAR, DEFAULT_CONFIG_FILE};

/// How long a loaded configuration is served before it is reloaded.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Something that can produce a fresh raw configuration.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn load(&self) -> Result<AppConfig, ConfigError>;
}

#[async_trait]
impl<S> ConfigSource for Arc<S>
where
    S: ConfigSource + ?Sized,
{
    async fn load(&self) -> Result<AppConfig, ConfigError> {
        (**self).load().await
    }
}

/// YAML file layered under `TIDEMARK__*` environment variables.
#[derive(Debug, Clone)]
pub struct LayeredSource {
    file: PathBuf,
    file_required: bool,
}

impl LayeredSource {
    /// The file named by `TIDEMARK_CONFIG` (required), else `tidemark.yaml`
    /// in the working directory (optional).
    pub fn from_env() -> Self {
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(path) if !path.trim().is_empty() => Self::new(path),
            _ => Self {
                file: PathBuf::from(DEFAULT_CONFIG_FILE),
                file_required: false,
            },
        }
    }

    /// Use `path`, failing if it does not exist.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: path.into(),
            file_required: true,
        }
    }

    pub fn load_now(&self) -> Result<AppConfig, ConfigError> {
        let file = self.file.to_string_lossy();

        let built = config::Config::builder()
            .add_source(File::new(&file, FileFormat::Yaml).required(self.file_required))
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("messaging.brokers")
                    .try_parsing(true),
            )
            .build()?;

        let config: AppConfig = built.try_deserialize()?;
        debug!(file = %file, "configuration loaded");
        Ok(config)
    }
}

#[async_trait]
impl ConfigSource for LayeredSource {
    async fn load(&self) -> Result<AppConfig, ConfigError> {
        self.load_now()
    }
}

struct Entry {
    value: Arc<AppConfig>,
    /// `None` once invalidated.
    loaded_at: Option<Instant>,
}

/// Time-bounded cache over a [`ConfigSource`].
///
/// - `get` serves the cached value while it is younger than the TTL and
///   reloads otherwise.
/// - `refresh` reloads unconditionally; the cached value is only replaced by
///   a configuration that validates.
/// - `invalidate` marks the cached value stale (push-style change hook).
///
/// When a reload fails and a previous value exists, `get` keeps serving the
/// last good value.
pub struct ConfigCache<S> {
    source: S,
    ttl: Duration,
    entry: RwLock<Option<Entry>>,
    reload: Mutex<()>,
}

impl<S: ConfigSource> ConfigCache<S> {
    pub fn new(source: S) -> Self {
        Self::with_ttl(source, DEFAULT_TTL)
    }

    pub fn with_ttl(source: S, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            entry: RwLock::new(None),
            reload: Mutex::new(()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get(&self) -> Result<Arc<AppConfig>, ConfigError> {
        if let Some(fresh) = self.fresh().await {
            return Ok(fresh);
        }

        let _reload = self.reload.lock().await;
        // Another caller may have reloaded while we waited.
        if let Some(fresh) = self.fresh().await {
            return Ok(fresh);
        }

        match self.load_validated().await {
            Ok(value) => Ok(value),
            Err(err) => match self.entry.read().await.as_ref() {
                Some(stale) => {
                    warn!(error = %err, "configuration reload failed; serving last good value");
                    Ok(stale.value.clone())
                }
                None => Err(err),
            },
        }
    }

    pub async fn refresh(&self) -> Result<Arc<AppConfig>, ConfigError> {
        let _reload = self.reload.lock().await;
        self.load_validated().await
    }

    pub async fn invalidate(&self) {
        if let Some(entry) = self.entry.write().await.as_mut() {
            entry.loaded_at = None;
        }
    }

    /// The cached value regardless of age.
    pub async fn cached(&self) -> Option<Arc<AppConfig>> {
        self.entry.read().await.as_ref().map(|e| e.value.clone())
    }

    async fn fresh(&self) -> Option<Arc<AppConfig>> {
        let entry = self.entry.read().await;
        let entry = entry.as_ref()?;
        let loaded_at = entry.loaded_at?;
        (loaded_at.elapsed() < self.ttl).then(|| entry.value.clone())
    }

    async fn load_validated(&self) -> Result<Arc<AppConfig>, ConfigError> {
        let loaded = self.source.load().await?;
        loaded.validate()?;

        let value = Arc::new(loaded);
        *self.entry.write().await = Some(Entry {
            value: value.clone(),
            loaded_at: Some(Instant::now()),
        });
        Ok(value)
    }
}
