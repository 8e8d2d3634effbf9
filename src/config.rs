use serde::Deserialize;
use std::path::Path;

pub const DEFAULT_DATABASE_URL: &str = "sqlite:news_vibe.db?mode=rwc";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash-lite";
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_SOURCES_CONFIG: &str = "sources.toml";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Refresh interval in minutes; 0 disables the background timer
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
    #[serde(default = "default_categories")]
    pub categories: Vec<CategoryConfig>,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

fn default_refresh_interval() -> u64 {
    30
}

fn default_categories() -> Vec<CategoryConfig> {
    [
        ("AI", "Artificial intelligence and machine learning"),
        ("Robotics", "News about robotics and automation"),
        ("US Politics", "United States political news"),
    ]
    .into_iter()
    .map(|(name, description)| CategoryConfig {
        name: name.to_string(),
        description: description.to_string(),
    })
    .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CategoryConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub name: String,
    pub url: String,
    /// Free-form topic hint such as "tech/robotics" or "us politics"
    #[serde(default)]
    pub category_hint: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Items scoring below this are dropped; 0 keeps everything
    #[serde(default)]
    pub min_score: i64,
}

fn default_weight() -> f64 {
    1.0
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse config from a TOML string (useful for testing)
    pub fn from_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        if let Some(blank) = config.categories.iter().find(|c| c.name.trim().is_empty()) {
            anyhow::bail!("category names must not be empty (got {:?})", blank.name);
        }
        Ok(config)
    }
}

/// Settings that come from the process environment rather than the TOML file.
#[derive(Clone)]
pub struct EnvConfig {
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub gemini_base_url: String,
    pub database_url: String,
    pub sources_config: String,
    pub bind_addr: String,
}

impl std::fmt::Debug for EnvConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvConfig")
            .field("gemini_api_key", &self.gemini_api_key.as_deref().map(|_| "<redacted>"))
            .field("gemini_model", &self.gemini_model)
            .field("gemini_base_url", &self.gemini_base_url)
            .field("database_url", &self.database_url)
            .field("sources_config", &self.sources_config)
            .field("bind_addr", &self.bind_addr)
            .finish()
    }
}

impl EnvConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            gemini_api_key: get("GEMINI_API_KEY"),
            gemini_model: get("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            gemini_base_url: get("GEMINI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_GEMINI_BASE_URL.to_string()),
            database_url: get("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            sources_config: get("SOURCES_CONFIG")
                .unwrap_or_else(|| DEFAULT_SOURCES_CONFIG.to_string()),
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
        }
    }
}
