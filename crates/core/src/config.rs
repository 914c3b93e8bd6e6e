use std::{
    collections::HashMap,
    fs::{self, File},
    io::Write,
    path::PathBuf,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

use crate::{
    backend::BackendConfig,
    paths::{config_file_path, default_config},
    segment::SegmenterConfig,
};

#[derive(Error, Debug)]
pub enum UtterConfigError {
    #[error("File system error: {0}")]
    IO(#[from] std::io::Error),
    #[error("YAML parsing error: {0}")]
    YAMLError(#[from] serde_yaml::Error),
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Sampling settings sent with every request.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ProfileConfig {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            max_tokens: 4096,
        }
    }
}

impl ProfileConfig {
    pub fn to_settings(&self) -> HashMap<String, String> {
        HashMap::from([
            ("temperature".to_string(), self.temperature.to_string()),
            ("max_tokens".to_string(), self.max_tokens.to_string()),
        ])
    }
}

/// A persona prompt, inline or read from a file.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum PersonaConfig {
    Inline { prompt: String },
    File { path: String },
}

impl PersonaConfig {
    pub fn load(&self) -> Result<String, UtterConfigError> {
        match self {
            PersonaConfig::Inline { prompt } => Ok(prompt.clone()),
            PersonaConfig::File { path } => {
                let path = shellexpand::tilde(path);
                let prompt = fs::read_to_string(path.as_ref()).map_err(|e| {
                    UtterConfigError::Config(format!("Failed to read persona '{path}': {e}"))
                })?;
                Ok(prompt.trim().to_string())
            }
        }
    }
}

/// Resolved chat mode: the backend, persona and conversation policy.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub backend: BackendConfig,
    pub persona: String,
    pub persona_name: Option<String>,
    pub profile: ProfileConfig,
    pub inject_every: u32,
    pub brainwash: bool,
    pub keep_history: bool,
}

#[derive(Debug)]
pub struct Config {
    pub backends: HashMap<String, BackendConfig>,
    pub personas: HashMap<String, PersonaConfig>,
    pub profiles: HashMap<String, ProfileConfig>,
    pub chat: ChatConfig,
    pub segmenter: SegmenterConfig,
}

impl Config {
    /// Looks up a backend by its key in the config.
    pub fn backend(&self, name: &str) -> Result<BackendConfig, UtterConfigError> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| UtterConfigError::Config(format!("Backend '{name}' not found")))
    }
}

#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum StringOrObject<T> {
    String(String),
    Object(T),
}

fn default_inject_every() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize, Debug)]
struct RawConfig {
    backends: HashMap<String, BackendConfig>,
    #[serde(default)]
    personas: HashMap<String, PersonaConfig>,
    #[serde(default)]
    profiles: HashMap<String, ProfileConfig>,
    chat: RawChatConfig,
    #[serde(default)]
    segmenter: SegmenterConfig,
}

#[derive(Deserialize, Debug)]
struct RawChatConfig {
    backend: StringOrObject<BackendConfig>,
    #[serde(default)]
    persona: Option<StringOrObject<PersonaConfig>>,
    #[serde(default)]
    profile: Option<StringOrObject<ProfileConfig>>,
    #[serde(default = "default_inject_every")]
    inject_every: u32,
    #[serde(default)]
    brainwash: bool,
    #[serde(default = "default_true")]
    keep_history: bool,
}

impl RawConfig {
    #[instrument(skip(self))]
    fn to_config(&self) -> Result<Config, UtterConfigError> {
        let mut backends = HashMap::new();
        for (k, v) in &self.backends {
            backends.insert(
                k.clone(),
                BackendConfig {
                    key: k.clone(),
                    ..v.clone()
                },
            );
        }

        let backend = match &self.chat.backend {
            StringOrObject::String(s) => backends
                .get(s)
                .cloned()
                .ok_or_else(|| UtterConfigError::Config(format!("Backend '{s}' not found")))?,
            StringOrObject::Object(b) => b.clone(),
        };

        let (persona, persona_name) = match &self.chat.persona {
            Some(StringOrObject::String(s)) => {
                let persona = self.personas.get(s).ok_or_else(|| {
                    UtterConfigError::Config(format!("Persona '{s}' not found"))
                })?;
                (persona.load()?, Some(s.clone()))
            }
            Some(StringOrObject::Object(p)) => (p.load()?, None),
            None => (String::new(), None),
        };

        let profile = match &self.chat.profile {
            Some(StringOrObject::String(s)) => self
                .profiles
                .get(s)
                .cloned()
                .ok_or_else(|| UtterConfigError::Config(format!("Profile '{s}' not found")))?,
            Some(StringOrObject::Object(p)) => p.clone(),
            None => ProfileConfig::default(),
        };

        Ok(Config {
            backends,
            personas: self.personas.clone(),
            profiles: self.profiles.clone(),
            chat: ChatConfig {
                backend,
                persona,
                persona_name,
                profile,
                inject_every: self.chat.inject_every,
                brainwash: self.chat.brainwash,
                keep_history: self.chat.keep_history,
            },
            segmenter: self.segmenter.clone(),
        })
    }
}

#[instrument(skip(config_path))]
pub fn create_or_get_config_file(
    config_path: Option<PathBuf>,
) -> Result<(bool, PathBuf), UtterConfigError> {
    let actual_path = match config_path {
        Some(path) => path,
        None => config_file_path()?,
    };

    let parent_dir = actual_path.parent().ok_or_else(|| {
        UtterConfigError::IO(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "Config path has no parent directory",
        ))
    })?;

    if !parent_dir.exists() {
        fs::create_dir_all(parent_dir)?;
    }

    if actual_path.exists() {
        Ok((true, actual_path))
    } else {
        File::create(&actual_path)?.write_all(default_config().as_bytes())?;
        Ok((false, actual_path))
    }
}

#[instrument(skip(config_path))]
pub fn get_config(config_path: Option<PathBuf>) -> Result<Config, UtterConfigError> {
    let (_, config_file) = create_or_get_config_file(config_path)?;
    let content = fs::read_to_string(&config_file)?;
    let raw: RawConfig = serde_yaml::from_str(&content)?;
    raw.to_config()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use crate::test_utils::create_temp_config;
    use tempfile::tempdir;

    const DUMMY_CONFIG_CONTENT: &str = r#"
backends:
  deepseek:
    name: deepseek-chat
    type: openai
    base_url: https://api.deepseek.com/v1
    api_key: sk-dummy
  web:
    type: web
    access_token: dummy-token
    paid: true
personas:
  host:
    prompt: 你是一名直播间的虚拟主播。
profiles:
  calm:
    temperature: 0.3
chat:
  backend: deepseek
  persona: host
  profile: calm
  inject_every: 3
segmenter:
  boundary_markers: ["。", "？"]
"#;

    #[test]
    fn test_profile_config_default() {
        let profile = ProfileConfig::default();
        assert_eq!(profile.temperature, 1.0);
        assert_eq!(profile.max_tokens, 4096);

        let settings = profile.to_settings();
        assert_eq!(settings["temperature"], "1");
        assert_eq!(settings["max_tokens"], "4096");
    }

    #[test]
    fn test_get_config_return_config_for_valid_schema() {
        let config_file = create_temp_config(DUMMY_CONFIG_CONTENT);
        let config = get_config(Some(config_file)).unwrap();

        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.chat.backend.name, "deepseek-chat");
        assert_eq!(config.chat.backend.key, "deepseek");
        assert_eq!(config.chat.backend.kind, BackendKind::Openai);
        assert_eq!(config.chat.persona, "你是一名直播间的虚拟主播。");
        assert_eq!(config.chat.persona_name.as_deref(), Some("host"));
        assert_eq!(config.chat.profile.temperature, 0.3);
        assert_eq!(config.chat.profile.max_tokens, 4096);
        assert_eq!(config.chat.inject_every, 3);
        assert!(!config.chat.brainwash);
        assert!(config.chat.keep_history);

        assert_eq!(config.segmenter.boundary_markers, vec!['。', '？']);
        assert_eq!(config.segmenter.min_first_chunk_length, 3);

        let web = config.backend("web").unwrap();
        assert_eq!(web.kind, BackendKind::Web);
        assert_eq!(web.key, "web");
        assert_eq!(web.get_setting::<bool>("paid"), Some(true));
        assert!(config.backend("missing").is_err());
    }

    #[test]
    fn test_get_config_inline_backend_and_defaults() {
        let content = r#"
backends: {}
chat:
  backend:
    name: qwen-plus
    type: openai
    api_key: env:DASHSCOPE_API_KEY
  persona:
    prompt: 简短回答。
"#;
        let config = get_config(Some(create_temp_config(content))).unwrap();
        assert_eq!(config.chat.backend.name, "qwen-plus");
        assert_eq!(config.chat.persona, "简短回答。");
        assert!(config.chat.persona_name.is_none());
        assert_eq!(config.chat.profile, ProfileConfig::default());
        assert_eq!(config.chat.inject_every, 5);
        assert_eq!(config.segmenter, SegmenterConfig::default());
    }

    #[test]
    fn test_persona_from_file() {
        let dir = tempdir().unwrap();
        let persona_path = dir.path().join("persona.txt");
        fs::write(&persona_path, "  来自文件的设定\n").unwrap();

        let persona = PersonaConfig::File {
            path: persona_path.to_string_lossy().to_string(),
        };
        assert_eq!(persona.load().unwrap(), "来自文件的设定");

        let missing = PersonaConfig::File {
            path: dir.path().join("nope.txt").to_string_lossy().to_string(),
        };
        assert!(matches!(missing.load(), Err(UtterConfigError::Config(_))));
    }

    #[test]
    fn test_get_config_throws_for_missing_referenced_backend() {
        let content = r#"
backends: {}
chat:
  backend: non-existent-backend
"#;
        let err = get_config(Some(create_temp_config(content))).unwrap_err();
        assert!(
            matches!(err, UtterConfigError::Config(msg) if msg.contains("Backend 'non-existent-backend' not found"))
        );
    }

    #[test]
    fn test_get_config_throws_for_missing_referenced_persona() {
        let content = r#"
backends:
  local:
    type: openai
    api_key: x
chat:
  backend: local
  persona: nobody
"#;
        let err = get_config(Some(create_temp_config(content))).unwrap_err();
        assert!(
            matches!(err, UtterConfigError::Config(msg) if msg.contains("Persona 'nobody' not found"))
        );
    }

    #[test]
    fn test_get_config_throws_for_missing_referenced_profile() {
        let content = r#"
backends:
  local:
    type: openai
    api_key: x
chat:
  backend: local
  profile: wild
"#;
        let err = get_config(Some(create_temp_config(content))).unwrap_err();
        assert!(
            matches!(err, UtterConfigError::Config(msg) if msg.contains("Profile 'wild' not found"))
        );
    }

    #[test]
    fn test_get_config_throws_for_invalid_yaml() {
        let config_file = create_temp_config("invalid yaml content: - [");
        let err = get_config(Some(config_file)).unwrap_err();
        assert!(matches!(err, UtterConfigError::YAMLError(_)));
        assert!(format!("{err}").contains("YAML parsing error"));
    }

    #[test]
    fn test_create_or_get_config_file_when_not_exist() {
        let config_dir = tempdir().unwrap();
        let config_file = config_dir.path().join("nested").join("utter.yml");

        let (exists, file_path) = create_or_get_config_file(Some(config_file.clone())).unwrap();
        assert!(!exists);
        assert_eq!(file_path, config_file);
        assert!(file_path.exists());

        let (exists, _) = create_or_get_config_file(Some(config_file)).unwrap();
        assert!(exists);
    }

    #[test]
    fn test_default_config_is_valid() {
        let config_dir = tempdir().unwrap();
        let config = get_config(Some(config_dir.path().join("utter.yml"))).unwrap();
        assert!(!config.backends.is_empty());
        assert_eq!(config.segmenter, SegmenterConfig::default());
        assert!(!config.chat.persona.is_empty());
    }
}
