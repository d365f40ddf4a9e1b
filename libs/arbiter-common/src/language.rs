use crate::error::{JudgeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Closed set of languages the judge can run
///
/// Adding a language means adding a variant here and a profile in
/// `LanguageRegistry::builtin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Java,
    Cpp,
    JavaScript,
}

impl Language {
    /// Returns all language variants
    pub fn all_variants() -> &'static [Language] {
        &[
            Language::Python,
            Language::Java,
            Language::Cpp,
            Language::JavaScript,
        ]
    }
}

impl FromStr for Language {
    type Err = JudgeError;

    /// Case-insensitive; anything else is an unsupported language
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "python" => Ok(Language::Python),
            "java" => Ok(Language::Java),
            "cpp" => Ok(Language::Cpp),
            "javascript" => Ok(Language::JavaScript),
            _ => Err(JudgeError::UnsupportedLanguage(s.to_string())),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::Python => write!(f, "python"),
            Language::Java => write!(f, "java"),
            Language::Cpp => write!(f, "cpp"),
            Language::JavaScript => write!(f, "javascript"),
        }
    }
}

/// Compile step for compiled languages, run inside `/code`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Static per-language execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageProfile {
    pub language: Language,
    /// Container image the program runs in
    pub image: String,
    /// File the source code is written to, e.g. `main.py`
    pub source_file: String,
    #[serde(default)]
    pub compile: Option<CompileCommand>,
    pub run: Vec<String>,
    pub memory_limit_mb: u64,
    pub timeout_ms: u64,
    /// Fraction of one CPU the sandbox may use
    #[serde(default = "default_cpu_share")]
    pub cpu_share: f64,
    /// Language id understood by the remote judge
    pub remote_language_id: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_cpu_share() -> f64 {
    0.25
}

fn default_enabled() -> bool {
    true
}

impl LanguageProfile {
    pub fn compile_needed(&self) -> bool {
        self.compile.is_some()
    }

    pub fn file_extension(&self) -> &str {
        Path::new(&self.source_file)
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("")
    }

    /// Full compile argv, `None` for interpreted languages
    pub fn compile_argv(&self) -> Option<Vec<String>> {
        self.compile.as_ref().map(|c| {
            let mut argv = Vec::with_capacity(c.args.len() + 1);
            argv.push(c.command.clone());
            argv.extend(c.args.iter().cloned());
            argv
        })
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

/// On-disk shape of `config/languages.json`
#[derive(Debug, Serialize, Deserialize)]
pub struct LanguagesFile {
    pub languages: Vec<LanguageProfile>,
}

/// Read-only language table, built once at startup
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    profiles: HashMap<Language, LanguageProfile>,
}

impl LanguageRegistry {
    pub fn builtin() -> Self {
        let profiles = vec![
            LanguageProfile {
                language: Language::Python,
                image: "python:3.11-slim".to_string(),
                source_file: "main.py".to_string(),
                compile: None,
                run: argv(&["python3", "main.py"]),
                memory_limit_mb: 256,
                timeout_ms: 10_000,
                cpu_share: default_cpu_share(),
                remote_language_id: 71,
                enabled: true,
            },
            LanguageProfile {
                language: Language::Java,
                image: "eclipse-temurin:17-jdk".to_string(),
                source_file: "Main.java".to_string(),
                compile: Some(CompileCommand {
                    command: "javac".to_string(),
                    args: argv(&["Main.java"]),
                }),
                run: argv(&["java", "-cp", "/code", "Main"]),
                memory_limit_mb: 512,
                timeout_ms: 15_000,
                cpu_share: default_cpu_share(),
                remote_language_id: 62,
                enabled: true,
            },
            LanguageProfile {
                language: Language::Cpp,
                image: "gcc:13".to_string(),
                source_file: "main.cpp".to_string(),
                compile: Some(CompileCommand {
                    command: "g++".to_string(),
                    args: argv(&["-O2", "-o", "main", "main.cpp"]),
                }),
                run: argv(&["./main"]),
                memory_limit_mb: 256,
                timeout_ms: 10_000,
                cpu_share: default_cpu_share(),
                remote_language_id: 54,
                enabled: true,
            },
            LanguageProfile {
                language: Language::JavaScript,
                image: "node:18-slim".to_string(),
                source_file: "main.js".to_string(),
                compile: None,
                run: argv(&["node", "main.js"]),
                memory_limit_mb: 256,
                timeout_ms: 10_000,
                cpu_share: default_cpu_share(),
                remote_language_id: 63,
                enabled: true,
            },
        ];

        Self {
            profiles: profiles.into_iter().map(|p| (p.language, p)).collect(),
        }
    }

    /// Built-in table with the profiles from a JSON file layered on top
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            JudgeError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let file: LanguagesFile = serde_json::from_str(&content).map_err(|e| {
            JudgeError::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        Self::builtin().with_overrides(file.languages)
    }

    pub fn with_overrides(mut self, overrides: Vec<LanguageProfile>) -> Result<Self> {
        for profile in overrides {
            if profile.run.is_empty() {
                return Err(JudgeError::Config(format!(
                    "profile for {} has an empty run command",
                    profile.language
                )));
            }
            if !(profile.cpu_share > 0.0 && profile.cpu_share <= 64.0) {
                return Err(JudgeError::Config(format!(
                    "profile for {} has an invalid cpu_share {}",
                    profile.language, profile.cpu_share
                )));
            }
            self.profiles.insert(profile.language, profile);
        }
        Ok(self)
    }

    pub fn get(&self, language: Language) -> Result<&LanguageProfile> {
        self.profiles
            .get(&language)
            .filter(|p| p.enabled)
            .ok_or_else(|| JudgeError::UnsupportedLanguage(language.to_string()))
    }

    /// Look up a profile by its user-facing key
    pub fn resolve(&self, key: &str) -> Result<&LanguageProfile> {
        self.get(key.parse()?)
    }

    pub fn enabled_languages(&self) -> Vec<Language> {
        Language::all_variants()
            .iter()
            .copied()
            .filter(|l| self.get(*l).is_ok())
            .collect()
    }
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_serialization() {
        let json = serde_json::to_string(&Language::JavaScript).unwrap();
        assert_eq!(json, "\"javascript\"");

        let lang: Language = serde_json::from_str("\"cpp\"").unwrap();
        assert_eq!(lang, Language::Cpp);
    }

    #[test]
    fn test_language_from_str() {
        assert_eq!("python".parse::<Language>().unwrap(), Language::Python);
        assert_eq!("Python".parse::<Language>().unwrap(), Language::Python);
        assert_eq!("JAVA".parse::<Language>().unwrap(), Language::Java);

        let err = "cobol".parse::<Language>().unwrap_err();
        assert!(matches!(err, JudgeError::UnsupportedLanguage(ref l) if l == "cobol"));
        assert!("".parse::<Language>().is_err());
    }

    #[test]
    fn test_builtin_profiles() {
        let registry = LanguageRegistry::builtin();

        let python = registry.get(Language::Python).unwrap();
        assert!(!python.compile_needed());
        assert_eq!(python.file_extension(), "py");
        assert_eq!(python.memory_limit_mb, 256);

        let cpp = registry.resolve("cpp").unwrap();
        assert!(cpp.compile_needed());
        assert_eq!(
            cpp.compile_argv().unwrap(),
            vec!["g++", "-O2", "-o", "main", "main.cpp"]
        );

        let java = registry.get(Language::Java).unwrap();
        assert_eq!(java.source_file, "Main.java");
        assert_eq!(java.timeout_ms, 15_000);
    }

    #[test]
    fn test_every_variant_has_profile() {
        let registry = LanguageRegistry::builtin();
        assert_eq!(
            registry.enabled_languages(),
            Language::all_variants().to_vec()
        );
    }

    #[test]
    fn test_resolve_unknown_language() {
        let registry = LanguageRegistry::builtin();
        assert!(matches!(
            registry.resolve("brainfuck"),
            Err(JudgeError::UnsupportedLanguage(_))
        ));
    }

    #[test]
    fn test_override_disables_language() {
        let mut js = LanguageRegistry::builtin()
            .get(Language::JavaScript)
            .unwrap()
            .clone();
        js.enabled = false;

        let registry = LanguageRegistry::builtin().with_overrides(vec![js]).unwrap();
        assert!(registry.get(Language::JavaScript).is_err());
        assert_eq!(registry.enabled_languages().len(), 3);
    }

    #[test]
    fn test_override_rejects_empty_run_command() {
        let mut python = LanguageRegistry::builtin()
            .get(Language::Python)
            .unwrap()
            .clone();
        python.run.clear();

        let result = LanguageRegistry::builtin().with_overrides(vec![python]);
        assert!(matches!(result, Err(JudgeError::Config(_))));
    }

    #[test]
    fn test_languages_file_defaults() {
        let json = r#"{
            "languages": [{
                "language": "python",
                "image": "python:3.12-alpine",
                "source_file": "main.py",
                "run": ["python3", "main.py"],
                "memory_limit_mb": 128,
                "timeout_ms": 5000,
                "remote_language_id": 71
            }]
        }"#;
        let file: LanguagesFile = serde_json::from_str(json).unwrap();
        let registry = LanguageRegistry::builtin()
            .with_overrides(file.languages)
            .unwrap();

        let python = registry.get(Language::Python).unwrap();
        assert_eq!(python.image, "python:3.12-alpine");
        assert_eq!(python.cpu_share, 0.25);
        assert!(python.enabled);
    }

    #[test]
    fn test_load_sample_config() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config/languages.json");
        let registry = LanguageRegistry::load_from_file(path).unwrap();

        let python = registry.get(Language::Python).unwrap();
        assert_eq!(python.image, "python:3.12-slim");
        assert_eq!(python.cpu_share, 0.5);
        assert!(registry.get(Language::JavaScript).is_err());
        assert!(registry.get(Language::Cpp).is_ok());
    }

    #[test]
    fn test_load_missing_file() {
        let result = LanguageRegistry::load_from_file("/nonexistent/languages.json");
        assert!(matches!(result, Err(JudgeError::Config(_))));
    }
}
