use std::{fs, path::Path};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Upstream endpoint plus the credential pool used for rotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_keys: Vec<String>,
}

impl ProviderConfig {
    fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            api_keys: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "default_groq")]
    pub groq: ProviderConfig,
    #[serde(default = "default_chutes")]
    pub chutes: ProviderConfig,
    #[serde(default = "default_cerebras")]
    pub cerebras: ProviderConfig,
    #[serde(default = "default_openrouter")]
    pub openrouter: ProviderConfig,
    #[serde(default = "default_ollama")]
    pub ollama: ProviderConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            groq: default_groq(),
            chutes: default_chutes(),
            cerebras: default_cerebras(),
            openrouter: default_openrouter(),
            ollama: default_ollama(),
        }
    }
}

fn default_groq() -> ProviderConfig {
    ProviderConfig::new("https://api.groq.com/openai/v1")
}

fn default_chutes() -> ProviderConfig {
    ProviderConfig::new("https://llm.chutes.ai/v1")
}

fn default_cerebras() -> ProviderConfig {
    ProviderConfig::new("https://api.cerebras.ai/v1")
}

fn default_openrouter() -> ProviderConfig {
    ProviderConfig::new("https://openrouter.ai/api/v1")
}

fn default_ollama() -> ProviderConfig {
    ProviderConfig::new("http://localhost:11434")
}

#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialProviderConfig {
    pub base_url: Option<String>,
    pub api_keys: Option<Vec<String>>,
}

impl PartialProviderConfig {
    fn merge_into(self, final_config: &mut ProviderConfig) {
        if let Some(base_url) = self.base_url {
            final_config.base_url = base_url;
        }
        if let Some(api_keys) = self.api_keys {
            final_config.api_keys = api_keys;
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialProvidersConfig {
    pub groq: Option<PartialProviderConfig>,
    pub chutes: Option<PartialProviderConfig>,
    pub cerebras: Option<PartialProviderConfig>,
    pub openrouter: Option<PartialProviderConfig>,
    pub ollama: Option<PartialProviderConfig>,
}

impl PartialProvidersConfig {
    fn merge_into(self, final_config: &mut ProvidersConfig) {
        if let Some(groq) = self.groq {
            groq.merge_into(&mut final_config.groq);
        }
        if let Some(chutes) = self.chutes {
            chutes.merge_into(&mut final_config.chutes);
        }
        if let Some(cerebras) = self.cerebras {
            cerebras.merge_into(&mut final_config.cerebras);
        }
        if let Some(openrouter) = self.openrouter {
            openrouter.merge_into(&mut final_config.openrouter);
        }
        if let Some(ollama) = self.ollama {
            ollama.merge_into(&mut final_config.ollama);
        }
    }
}

// Used for deserializing user-provided config files where all fields are optional.
#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub base_path: Option<String>,
    pub db_url: Option<String>,
    pub models_path: Option<String>,
    pub proxy: Option<String>,
    pub log_level: Option<String>,
    pub providers: Option<PartialProvidersConfig>,
}

impl PartialConfig {
    fn merge_into(self, final_config: &mut FinalConfig) {
        if let Some(host) = self.host {
            final_config.host = host;
        }
        if let Some(port) = self.port {
            final_config.port = port;
        }
        if let Some(base_path) = self.base_path {
            final_config.base_path = base_path;
        }
        if let Some(db_url) = self.db_url {
            final_config.db_url = db_url;
        }
        if let Some(models_path) = self.models_path {
            final_config.models_path = models_path;
        }
        if let Some(proxy) = self.proxy {
            final_config.proxy = Some(proxy);
        }
        if let Some(log_level) = self.log_level {
            final_config.log_level = log_level;
        }
        if let Some(providers) = self.providers {
            providers.merge_into(&mut final_config.providers);
        }
    }
}

// The fully resolved configuration used by the application.
#[derive(Debug, Deserialize, Serialize)]
pub struct FinalConfig {
    pub host: String,
    pub port: u16,
    pub base_path: String,
    pub db_url: String,
    pub models_path: String,
    pub proxy: Option<String>,
    pub log_level: String,
    pub providers: ProvidersConfig,
}

impl Default for FinalConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            base_path: "/ai".to_string(),
            db_url: "./storage/tollgate.db".to_string(),
            models_path: "models.yaml".to_string(),
            proxy: None,
            log_level: "info".to_string(),
            providers: ProvidersConfig::default(),
        }
    }
}

fn get_env_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn get_config_from_env() -> PartialConfig {
    PartialConfig {
        host: get_env_var("HOST"),
        port: get_env_var("PORT"),
        base_path: get_env_var("BASE_PATH"),
        db_url: get_env_var("DB_URL"),
        models_path: get_env_var("MODELS_PATH"),
        proxy: get_env_var("PROXY"),
        log_level: get_env_var("LOG_LEVEL"),
        providers: None,
    }
}

fn load_partial(path: &Path) -> Option<PartialConfig> {
    let config_str = fs::read_to_string(path).ok()?;
    let parsed = serde_yaml::from_str(&config_str)
        .unwrap_or_else(|e| panic!("Failed to parse configuration file at {:?}: {}", path, e));
    Some(parsed)
}

pub static CONFIG: Lazy<FinalConfig> = Lazy::new(|| {
    let mut final_config = FinalConfig::default();

    // config.default.yaml ships with the deployment; config.yaml carries
    // operator overrides. Env vars win over both.
    if let Some(file_defaults) = load_partial(Path::new("config.default.yaml")) {
        file_defaults.merge_into(&mut final_config);
    }
    if let Some(user_config) = load_partial(Path::new("config.yaml")) {
        user_config.merge_into(&mut final_config);
    }
    get_config_from_env().merge_into(&mut final_config);

    final_config
});
