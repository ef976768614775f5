// Languages accepted for batch grading, loaded from languages.json

use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "config/languages.json";

#[derive(Debug, Deserialize)]
struct LanguageEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
struct LanguagesFile {
    languages: Vec<LanguageEntry>,
}

/// Authoritative set of enabled languages. Each one needs a worker
/// listening on its queue.
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    enabled_languages: HashSet<String>,
}

impl LanguageRegistry {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| format!("Failed to read languages.json: {}", e))?;
        Self::from_json(&content)
    }

    /// Path from LANGUAGES_CONFIG, else config/languages.json
    pub fn load_default() -> Result<Self, String> {
        let path = std::env::var("LANGUAGES_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from_file(path)
    }

    pub fn from_json(content: &str) -> Result<Self, String> {
        let config: LanguagesFile =
            serde_json::from_str(content).map_err(|e| format!("Failed to parse languages.json: {}", e))?;

        let enabled_languages: HashSet<String> =
            config.languages.into_iter().map(|l| l.name.to_lowercase()).collect();

        if enabled_languages.is_empty() {
            return Err("No languages configured in languages.json".to_string());
        }
        Ok(Self { enabled_languages })
    }

    pub fn is_enabled(&self, language: &str) -> bool {
        self.enabled_languages.contains(&language.to_lowercase())
    }

    pub fn enabled_languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.enabled_languages.iter().cloned().collect();
        names.sort();
        names
    }
}
