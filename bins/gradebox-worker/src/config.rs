// Per-language sandbox settings loaded from config/languages.json
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "config/languages.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageExecution {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: String,
    pub version: String,
    pub image: String,
    /// Language id understood by a Judge0-compatible service
    pub judge0_language_id: u32,
    pub file_name: String,
    pub execution: LanguageExecution,
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
}

impl LanguageConfig {
    /// Shell line run inside the container: decode the program and its stdin
    /// from the environment, then execute
    pub fn shell_command(&self) -> String {
        let mut run = self.execution.command.clone();
        for arg in &self.execution.args {
            run.push(' ');
            run.push_str(arg);
        }
        format!(
            "cd /tmp && printf %s \"$SOURCE_CODE\" | base64 -d > {file} && printf %s \"$TEST_INPUT\" | base64 -d | {run}",
            file = self.file_name,
            run = run
        )
    }

    pub fn memory_limit_bytes(&self) -> i64 {
        (self.memory_limit_mb as i64) * 1024 * 1024
    }

    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_limit as f64 * 1_000_000_000.0) as i64
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageConfig>,
}

#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    configs: HashMap<String, LanguageConfig>,
}

impl LanguageConfigManager {
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path).context("Failed to read languages.json")?;
        Self::from_json(&content)
    }

    /// Path from LANGUAGES_CONFIG, else config/languages.json
    pub fn load_default() -> Result<Self> {
        let path = std::env::var("LANGUAGES_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load(Path::new(&path))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let languages_json: LanguagesJson =
            serde_json::from_str(content).context("Failed to parse languages.json")?;

        let configs: HashMap<String, LanguageConfig> = languages_json
            .languages
            .into_iter()
            .map(|lang| (lang.name.to_lowercase(), lang))
            .collect();

        if configs.is_empty() {
            bail!("No languages configured in languages.json");
        }
        Ok(Self { configs })
    }

    pub fn get_config(&self, language: &str) -> Result<&LanguageConfig> {
        self.configs
            .get(&language.to_lowercase())
            .ok_or_else(|| anyhow::anyhow!("No configuration found for language: {}", language))
    }

    pub fn list_languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "languages": [{
            "name": "Python",
            "version": "3.11",
            "image": "python:3.11-slim",
            "judge0_language_id": 71,
            "file_name": "main.py",
            "execution": {"command": "python3", "args": ["-u", "main.py"]},
            "memory_limit_mb": 256,
            "cpu_limit": 0.5
        }]
    }"#;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let manager = LanguageConfigManager::from_json(SAMPLE).unwrap();
        let config = manager.get_config("python").unwrap();
        assert_eq!(config.judge0_language_id, 71);
        assert_eq!(manager.list_languages(), vec!["python".to_string()]);
        assert!(manager.get_config("rust").is_err());
    }

    #[test]
    fn test_limits() {
        let manager = LanguageConfigManager::from_json(SAMPLE).unwrap();
        let config = manager.get_config("PYTHON").unwrap();
        assert_eq!(config.memory_limit_bytes(), 256 * 1024 * 1024);
        assert_eq!(config.nano_cpus(), 500_000_000);
    }

    #[test]
    fn test_shell_command() {
        let manager = LanguageConfigManager::from_json(SAMPLE).unwrap();
        let cmd = manager.get_config("python").unwrap().shell_command();
        assert!(cmd.contains("base64 -d > main.py"));
        assert!(cmd.ends_with("| python3 -u main.py"));
    }

    #[test]
    fn test_empty_config_rejected() {
        assert!(LanguageConfigManager::from_json(r#"{"languages": []}"#).is_err());
    }

    #[test]
    fn test_repository_config_parses() {
        let content = include_str!("../../../config/languages.json");
        let manager = LanguageConfigManager::from_json(content).unwrap();
        assert!(manager.get_config("python").is_ok());
    }
}
