//! Configuration structures, environment overrides and pool routing

use crate::embedder::{Device, Precision};
use crate::error::{ModelError, ModelResult};
use crate::gpu::Tier;
use crate::models::cache::get_cache_dir;
use crate::models::recovery::CacheRoots;
use crate::models::registry::{
    BUILTIN_DEFAULT_MODEL, FULL_POOL, PoolVariant, descriptor, known_model_names, pool_variant,
    pool_variant_names, require_descriptor,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Routing key of the implicit single-model slot
pub const DEFAULT_KEY: &str = "default";

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "EMBED_POOL_";

/// Service configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    pub api_port: u16,
    /// Configured cache root models are loaded from and downloaded into
    pub cache_dir: PathBuf,
    /// Default hub cache; `None` resolves through HF_HOME / XDG / home
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hf_cache_dir: Option<PathBuf>,
    pub device: Device,
    pub precision: Precision,
    /// Ask the remote registry whether a model exists before downloading
    pub verify_remote: bool,
    pub tei_binary_path: String,
    pub load_timeout_secs: u64,
    /// First port handed to spawned TEI processes
    pub base_port: u16,
    /// Separate settings file that replaces `models` when present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings_file: Option<PathBuf>,
    /// Persisted user model settings
    pub models: UserSettings,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            cache_dir: default_cache_dir(),
            hf_cache_dir: None,
            device: Device::default(),
            precision: Precision::default(),
            verify_remote: true,
            tei_binary_path: default_tei_binary_path(),
            load_timeout_secs: default_load_timeout(),
            base_port: default_base_port(),
            settings_file: None,
            models: UserSettings::default(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>, env: &EnvOverrides) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        if let Some(settings_file) = &config.settings_file
            && settings_file.exists()
        {
            config.models = UserSettings::load(settings_file)?;
        }

        if let Some(port) = env.api_port {
            config.api_port = port;
        }
        if let Some(cache_dir) = &env.cache_dir {
            config.cache_dir = cache_dir.clone();
        }
        if let Some(binary_path) = &env.tei_binary_path {
            config.tei_binary_path = binary_path.clone();
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.api_port < 1024 {
            anyhow::bail!("API port must be >= 1024 (got {})", self.api_port);
        }
        if self.base_port < 1024 {
            anyhow::bail!("Base port must be >= 1024 (got {})", self.base_port);
        }
        if self.base_port == self.api_port {
            anyhow::bail!("Base port {} conflicts with API port", self.base_port);
        }
        if self.load_timeout_secs == 0 {
            anyhow::bail!("load_timeout_secs must be > 0");
        }

        self.models.validate()
    }

    /// Custom and default cache roots
    pub fn cache_roots(&self) -> CacheRoots {
        CacheRoots {
            custom: self.cache_dir.clone(),
            default: self.hf_cache_dir.clone().unwrap_or_else(get_cache_dir),
        }
    }
}

/// Persisted per-user model settings
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct UserSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_variant: Option<String>,
    /// Per-model overrides keyed by hub identity
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub models: BTreeMap<String, ModelSettings>,
}

/// Per-model overrides
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ModelSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust_remote_code: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncate_dim: Option<usize>,
}

impl UserSettings {
    /// Read settings; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No settings file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {:?}", path))?;
        toml::from_str(&content).context("Failed to parse settings file")
    }

    /// Write settings atomically (temp file + rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize settings")?;

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create settings directory: {:?}", parent))?;
        }

        let temp_path = path.with_extension("tmp");
        let mut file = std::fs::File::create(&temp_path)
            .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
        file.write_all(content.as_bytes())
            .context("Failed to write settings")?;
        file.sync_all().context("Failed to sync settings file")?;

        std::fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to move settings into place: {:?}", path))?;

        tracing::debug!(path = %path.display(), "Settings saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(variant) = &self.pool_variant
            && pool_variant(variant).is_none()
        {
            anyhow::bail!(
                "Unknown pool variant '{}' (known: {})",
                variant,
                pool_variant_names().join(", ")
            );
        }

        if let Some(model) = &self.default_model {
            require_descriptor(model)?;
        }

        for (name, settings) in &self.models {
            let desc = require_descriptor(name)?;
            if let Some(dim) = settings.truncate_dim
                && (dim == 0 || dim > desc.dimension)
            {
                anyhow::bail!(
                    "truncate_dim {} for '{}' must be between 1 and {}",
                    dim,
                    name,
                    desc.dimension
                );
            }
        }

        Ok(())
    }
}

// ============================================================================
// Environment overrides
// ============================================================================

/// Overrides read from `EMBED_POOL_*` variables
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvOverrides {
    pub api_port: Option<u16>,
    pub cache_dir: Option<PathBuf>,
    pub default_model: Option<String>,
    pub pool_variant: Option<String>,
    pub multi_model: Option<bool>,
    pub tei_binary_path: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build overrides from any variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |suffix: &str| {
            lookup(&format!("{ENV_PREFIX}{suffix}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let api_port = match var("API_PORT") {
            Some(port) => Some(
                port.parse()
                    .with_context(|| format!("Invalid {ENV_PREFIX}API_PORT value: {port}"))?,
            ),
            None => None,
        };

        let multi_model = var("MULTI_MODEL").and_then(|raw| {
            let parsed = parse_flag(&raw);
            if parsed.is_none() {
                tracing::warn!(value = %raw, "Ignoring unrecognized {ENV_PREFIX}MULTI_MODEL value");
            }
            parsed
        });

        Ok(Self {
            api_port,
            cache_dir: var("CACHE_DIR").map(PathBuf::from),
            default_model: var("DEFAULT_MODEL"),
            pool_variant: var("POOL_VARIANT"),
            multi_model,
            tei_binary_path: var("TEI_BINARY_PATH"),
        })
    }
}

/// Parse a boolean environment token
///
/// Accepts `true/1/yes/on/enabled` and `false/0/no/off`, case-insensitive.
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" | "enabled" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

// ============================================================================
// Routing
// ============================================================================

/// The active routing table for the pool
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolConfig {
    pub multi_model: bool,
    pub default_model: String,
    /// Active variant, `None` in single-model mode
    pub variant: Option<&'static str>,
    /// Routing key → model identity
    pub routes: BTreeMap<String, String>,
    /// Per-model overrides carried over from user settings
    #[serde(skip)]
    pub model_settings: BTreeMap<String, ModelSettings>,
}

/// Where one `get` call lands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub key: String,
    pub model: String,
}

impl PoolConfig {
    /// Resolve a requested key and optional explicit model to a slot
    ///
    /// An explicit model bypasses mode and key checks. In single-model mode
    /// every key collapses onto the implicit default slot.
    pub fn route(&self, key: Option<&str>, model_override: Option<&str>) -> ModelResult<Route> {
        if let Some(model) = model_override {
            require_descriptor(model)?;
            return Ok(Route {
                key: key.unwrap_or(DEFAULT_KEY).to_string(),
                model: model.to_string(),
            });
        }

        if !self.multi_model {
            return Ok(Route {
                key: DEFAULT_KEY.to_string(),
                model: self.default_model.clone(),
            });
        }

        let key = match key {
            Some(key) => key,
            None => self
                .variant
                .and_then(pool_variant)
                .map(PoolVariant::primary_key)
                .unwrap_or(DEFAULT_KEY),
        };

        self.routes
            .get(key)
            .map(|model| Route {
                key: key.to_string(),
                model: model.clone(),
            })
            .ok_or_else(|| ModelError::UnknownModelKey {
                key: key.to_string(),
                known: self.routes.keys().cloned().collect(),
            })
    }

    /// Effective (trust_remote_code, truncate_dim) for a model
    pub fn model_options(&self, model: &str) -> (bool, Option<usize>) {
        let desc = descriptor(model);
        let settings = self.model_settings.get(model);

        let trust = settings
            .and_then(|s| s.trust_remote_code)
            .or(desc.map(|d| d.trust_remote_code))
            .unwrap_or(false);
        let truncate = settings
            .and_then(|s| s.truncate_dim)
            .or(desc.and_then(|d| d.truncate_dim));

        (trust, truncate)
    }
}

/// Resolve the routing table: persisted settings > environment > tier > built-in
pub fn resolve_pool_config(settings: &UserSettings, env: &EnvOverrides, tier: &Tier) -> PoolConfig {
    let tier_model = descriptor(tier.recommended_model).map(|d| d.name.to_string());
    let default_model = first_known_model([
        ("settings", settings.default_model.clone()),
        ("environment", env.default_model.clone()),
        ("tier", tier_model),
    ])
    .unwrap_or_else(|| BUILTIN_DEFAULT_MODEL.to_string());

    let multi_model = env.multi_model.unwrap_or(tier.multi_model_enabled);

    let mut routes = BTreeMap::new();
    routes.insert(DEFAULT_KEY.to_string(), default_model.clone());

    let variant = if multi_model {
        let variant = [
            settings.pool_variant.as_deref(),
            env.pool_variant.as_deref(),
            tier.pool_variant,
        ]
        .into_iter()
        .flatten()
        .find_map(|name| {
            let found = pool_variant(name);
            if found.is_none() {
                tracing::warn!(variant = name, "Ignoring unknown pool variant");
            }
            found
        })
        .or_else(|| pool_variant(FULL_POOL));

        if let Some(variant) = variant {
            for (key, model) in variant.routes {
                routes.insert(key.to_string(), model.to_string());
            }
        }
        variant.map(|v| v.name)
    } else {
        None
    };

    PoolConfig {
        multi_model,
        default_model,
        variant,
        routes,
        model_settings: settings.models.clone(),
    }
}

/// First candidate naming a registered model, warning about the rest
fn first_known_model<const N: usize>(candidates: [(&str, Option<String>); N]) -> Option<String> {
    candidates.into_iter().find_map(|(origin, candidate)| {
        let name = candidate?;
        if descriptor(&name).is_some() {
            Some(name)
        } else {
            tracing::warn!(
                model = %name,
                origin,
                known = %known_model_names().join(", "),
                "Ignoring unknown default model"
            );
            None
        }
    })
}

// Default functions
fn default_api_port() -> u16 {
    9100
}
fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("embed-pool/models")
}
fn default_tei_binary_path() -> String {
    "text-embeddings-router".to_string()
}
fn default_load_timeout() -> u64 {
    300
}
fn default_base_port() -> u16 {
    18080
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::tier_for_vram;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> EnvOverrides {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (format!("{ENV_PREFIX}{k}"), v.to_string()))
            .collect();
        EnvOverrides::from_lookup(|name| vars.get(name).cloned()).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = ServiceConfig::default();
        assert_eq!(config.api_port, 9100);
        assert_eq!(config.base_port, 18080);
        assert!(config.verify_remote);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_port_validation() {
        let config = ServiceConfig {
            api_port: 500,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_variant_and_model_rejected() {
        let mut config = ServiceConfig::default();
        config.models.pool_variant = Some("huge".to_string());
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.models.default_model = Some("nobody/nothing".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_truncate_dim_bounded_by_dimension() {
        let mut settings = UserSettings::default();
        settings.models.insert(
            "BAAI/bge-m3".to_string(),
            ModelSettings {
                trust_remote_code: None,
                truncate_dim: Some(2048),
            },
        );
        assert!(settings.validate().is_err());

        settings.models.get_mut("BAAI/bge-m3").unwrap().truncate_dim = Some(0);
        assert!(settings.validate().is_err());

        settings.models.get_mut("BAAI/bge-m3").unwrap().truncate_dim = Some(512);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let config: ServiceConfig = toml::from_str(
            r#"
            api_port = 9200
            device = "cpu"
            precision = "float32"

            [models]
            default_model = "BAAI/bge-m3"

            [models.models."Qwen/Qwen3-Embedding-4B"]
            truncate_dim = 512
            "#,
        )
        .unwrap();

        assert_eq!(config.api_port, 9200);
        assert_eq!(config.device, Device::Cpu);
        assert_eq!(config.precision, Precision::Float32);
        assert_eq!(config.models.default_model.as_deref(), Some("BAAI/bge-m3"));
        assert_eq!(
            config.models.models["Qwen/Qwen3-Embedding-4B"].truncate_dim,
            Some(512)
        );
    }

    #[test]
    fn test_settings_save_and_load() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("nested/settings.toml");

        let mut settings = UserSettings {
            default_model: Some("BAAI/bge-m3".to_string()),
            pool_variant: Some(FULL_POOL.to_string()),
            ..Default::default()
        };
        settings.models.insert(
            "nomic-ai/CodeRankEmbed".to_string(),
            ModelSettings {
                trust_remote_code: Some(true),
                truncate_dim: None,
            },
        );

        settings.save(&path).unwrap();
        assert!(!path.with_extension("tmp").exists());
        assert_eq!(UserSettings::load(&path).unwrap(), settings);
    }

    #[test]
    fn test_missing_settings_file_is_default() {
        let temp = tempfile::tempdir().unwrap();
        let settings = UserSettings::load(&temp.path().join("absent.toml")).unwrap();
        assert_eq!(settings, UserSettings::default());
    }

    #[test]
    fn test_parse_flag() {
        for token in ["true", "1", "YES", " on ", "Enabled"] {
            assert_eq!(parse_flag(token), Some(true), "{token}");
        }
        for token in ["false", "0", "No", "OFF"] {
            assert_eq!(parse_flag(token), Some(false), "{token}");
        }
        assert_eq!(parse_flag("maybe"), None);
        assert_eq!(parse_flag("disabled"), None);
    }

    #[test]
    fn test_env_overrides() {
        let env = env_from(&[
            ("API_PORT", "9300"),
            ("MULTI_MODEL", "off"),
            ("POOL_VARIANT", "full"),
            ("DEFAULT_MODEL", ""),
        ]);
        assert_eq!(env.api_port, Some(9300));
        assert_eq!(env.multi_model, Some(false));
        assert_eq!(env.pool_variant.as_deref(), Some("full"));
        assert_eq!(env.default_model, None);

        assert_eq!(env_from(&[("MULTI_MODEL", "sometimes")]).multi_model, None);

        let vars = HashMap::from([(format!("{ENV_PREFIX}API_PORT"), "high".to_string())]);
        assert!(EnvOverrides::from_lookup(|name| vars.get(name).cloned()).is_err());
    }

    #[test]
    fn test_load_applies_env_overrides() {
        let env = env_from(&[("API_PORT", "9400"), ("TEI_BINARY_PATH", "/opt/tei")]);
        let config = ServiceConfig::load(None, &env).unwrap();
        assert_eq!(config.api_port, 9400);
        assert_eq!(config.tei_binary_path, "/opt/tei");
    }

    #[test]
    fn test_precedence_settings_over_env_over_tier() {
        let tier = tier_for_vram(12.0);
        let env = env_from(&[("DEFAULT_MODEL", "BAAI/bge-m3")]);

        let resolved = resolve_pool_config(&UserSettings::default(), &EnvOverrides::default(), &tier);
        assert_eq!(resolved.default_model, "Qwen/Qwen3-Embedding-0.6B");

        let resolved = resolve_pool_config(&UserSettings::default(), &env, &tier);
        assert_eq!(resolved.default_model, "BAAI/bge-m3");

        let settings = UserSettings {
            default_model: Some("Alibaba-NLP/gte-modernbert-base".to_string()),
            ..Default::default()
        };
        let resolved = resolve_pool_config(&settings, &env, &tier);
        assert_eq!(resolved.default_model, "Alibaba-NLP/gte-modernbert-base");
    }

    #[test]
    fn test_unknown_env_model_falls_through_to_tier() {
        let tier = tier_for_vram(2.0);
        let env = env_from(&[("DEFAULT_MODEL", "nobody/nothing")]);
        let resolved = resolve_pool_config(&UserSettings::default(), &env, &tier);
        assert_eq!(resolved.default_model, BUILTIN_DEFAULT_MODEL);
    }

    #[test]
    fn test_single_model_mode_collapses_keys() {
        let tier = tier_for_vram(4.0);
        let config = resolve_pool_config(&UserSettings::default(), &EnvOverrides::default(), &tier);
        assert!(!config.multi_model);
        assert_eq!(config.variant, None);

        let route = config.route(None, None).unwrap();
        assert_eq!(route.key, DEFAULT_KEY);
        assert_eq!(route.model, BUILTIN_DEFAULT_MODEL);
        assert_eq!(config.route(Some("bge_m3"), None).unwrap().key, DEFAULT_KEY);
    }

    #[test]
    fn test_multi_model_routing() {
        let tier = tier_for_vram(12.0);
        let config = resolve_pool_config(&UserSettings::default(), &EnvOverrides::default(), &tier);
        assert!(config.multi_model);
        assert_eq!(config.variant, Some(FULL_POOL));

        let primary = config.route(None, None).unwrap();
        assert_eq!(primary.key, "qwen3");
        assert_eq!(config.route(Some("bge_m3"), None).unwrap().model, "BAAI/bge-m3");
        assert!(matches!(
            config.route(Some("nope"), None),
            Err(ModelError::UnknownModelKey { .. })
        ));
    }

    #[test]
    fn test_env_disables_multi_model_and_picks_variant() {
        let tier = tier_for_vram(12.0);
        let off = env_from(&[("MULTI_MODEL", "0")]);
        assert!(!resolve_pool_config(&UserSettings::default(), &off, &tier).multi_model);

        let variant = env_from(&[("POOL_VARIANT", "lightweight-speed")]);
        let config = resolve_pool_config(&UserSettings::default(), &variant, &tier);
        assert_eq!(config.route(None, None).unwrap().key, "gte_modernbert");
    }

    #[test]
    fn test_override_always_wins() {
        let tier = tier_for_vram(4.0);
        let config = resolve_pool_config(&UserSettings::default(), &EnvOverrides::default(), &tier);

        let route = config
            .route(Some("anything"), Some("nomic-ai/CodeRankEmbed"))
            .unwrap();
        assert_eq!(route.key, "anything");
        assert_eq!(route.model, "nomic-ai/CodeRankEmbed");

        assert!(matches!(
            config.route(None, Some("nobody/nothing")),
            Err(ModelError::UnknownModel { .. })
        ));
    }

    #[test]
    fn test_model_options_prefer_settings() {
        let mut settings = UserSettings::default();
        settings.models.insert(
            "Qwen/Qwen3-Embedding-4B".to_string(),
            ModelSettings {
                trust_remote_code: Some(true),
                truncate_dim: Some(256),
            },
        );
        let config = resolve_pool_config(&settings, &EnvOverrides::default(), &tier_for_vram(0.0));

        assert_eq!(config.model_options("Qwen/Qwen3-Embedding-4B"), (true, Some(256)));
        assert_eq!(config.model_options("Qwen/Qwen3-Embedding-8B"), (false, Some(1024)));
        assert_eq!(config.model_options("nomic-ai/CodeRankEmbed"), (true, None));
    }
}
