use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TriageError};
use crate::schema::Cause;

pub const CONFIG_FILE: &str = "triage.toml";
pub const KEYWORDS_FILE: &str = "keywords.yaml";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub classifier: ClassifierConfig,
    pub aggregate: AggregatePolicy,
    pub database_path: Option<PathBuf>,
    pub keywords: KeywordTable,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClassifierConfig {
    None,
    Command {
        program: String,
        args: Vec<String>,
        timeout: Duration,
    },
}

/// How report measurements are folded into a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregatePolicy {
    #[default]
    LatestWins,
    MovingAverage,
}

/// Ordered cause -> keyword table used by the heuristic analyzer. The first
/// cause with a matching keyword wins.
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordTable {
    pub entries: Vec<(Cause, Vec<String>)>,
}

pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    classifier: ClassifierSection,
    #[serde(default)]
    aggregate: AggregateSection,
    #[serde(default)]
    database: DatabaseSection,
}

#[derive(Debug, Clone, Deserialize)]
struct ClassifierSection {
    #[serde(default = "default_kind")]
    kind: String,
    program: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
}

impl Default for ClassifierSection {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            program: None,
            args: Vec::new(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_kind() -> String {
    "none".to_string()
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

#[derive(Debug, Clone, Default, Deserialize)]
struct AggregateSection {
    #[serde(default)]
    policy: AggregatePolicy,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct DatabaseSection {
    path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
struct KeywordsFile {
    causes: HashMap<String, Vec<String>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            classifier: ClassifierConfig::None,
            aggregate: AggregatePolicy::default(),
            database_path: None,
            keywords: KeywordTable::default(),
        }
    }
}

impl EngineConfig {
    /// Load `triage.toml` and the optional `keywords.yaml` from `path`.
    /// A missing directory or file yields the defaults.
    pub fn load_from_dir(path: &Path) -> Result<Self> {
        let config_path = path.join(CONFIG_FILE);
        let file: ConfigFile = if config_path.exists() {
            let config_str = fs::read_to_string(&config_path)?;
            toml::from_str(&config_str)
                .map_err(|e| TriageError::Config(format!("{}: {e}", config_path.display())))?
        } else {
            ConfigFile::default()
        };

        let mut keywords = KeywordTable::default();
        let keywords_path = path.join(KEYWORDS_FILE);
        if keywords_path.exists() {
            let keywords_str = fs::read_to_string(&keywords_path)?;
            let parsed: KeywordsFile = serde_yaml::from_str(&keywords_str)
                .map_err(|e| TriageError::Config(format!("{}: {e}", keywords_path.display())))?;
            keywords.apply_overrides(parsed.causes)?;
        }

        Ok(Self {
            classifier: parse_classifier(file.classifier)?,
            aggregate: file.aggregate.policy,
            database_path: file.database.path,
            keywords,
        })
    }
}

fn parse_classifier(section: ClassifierSection) -> Result<ClassifierConfig> {
    match section.kind.as_str() {
        "none" => Ok(ClassifierConfig::None),
        "command" => {
            let program = section
                .program
                .filter(|p| !p.trim().is_empty())
                .ok_or_else(|| {
                    TriageError::Config(
                        "classifier.program is required for kind = \"command\"".to_string(),
                    )
                })?;
            if section.timeout_ms == 0 {
                return Err(TriageError::Config(
                    "classifier.timeout_ms must be positive".to_string(),
                ));
            }
            Ok(ClassifierConfig::Command {
                program,
                args: section.args,
                timeout: Duration::from_millis(section.timeout_ms),
            })
        }
        other => Err(TriageError::Config(format!("Unknown classifier kind: {other}"))),
    }
}

impl Default for KeywordTable {
    fn default() -> Self {
        let table: [(Cause, &[&str]); 5] = [
            (Cause::Sampah, &["sampah", "plastik", "botol", "styrofoam", "trash", "garbage"]),
            (Cause::Limbah, &["limbah", "minyak", "oli", "pencemaran", "tercemar", "waste", "oil"]),
            (Cause::Erosi, &["erosi", "abrasi", "longsor", "tergerus", "erosion"]),
            (Cause::IkanPemakan, &["ikan", "hama", "kepiting", "dimakan", "predator", "teritip"]),
            (Cause::Alam, &["badai", "gelombang", "kekeringan", "rob", "banjir", "storm"]),
        ];
        Self {
            entries: table
                .into_iter()
                .map(|(cause, words)| (cause, words.iter().map(|w| w.to_string()).collect()))
                .collect(),
        }
    }
}

impl KeywordTable {
    /// Find the first cause with a keyword in `text`. Keywords match whole
    /// words; a multi-word keyword matches the same words in sequence.
    pub fn match_cause(&self, text: &str) -> Option<Cause> {
        let tokens = tokenize(text);
        self.entries
            .iter()
            .find(|(_, words)| {
                words.iter().any(|keyword| {
                    let needle = tokenize(keyword);
                    !needle.is_empty()
                        && tokens.windows(needle.len()).any(|w| w == needle.as_slice())
                })
            })
            .map(|(cause, _)| *cause)
    }

    fn apply_overrides(&mut self, overrides: HashMap<String, Vec<String>>) -> Result<()> {
        for (name, words) in overrides {
            let cause: Cause = name
                .parse()
                .map_err(|_| TriageError::Config(format!("Unknown cause in keywords: {name}")))?;
            let words: Vec<String> = words.into_iter().map(|w| w.to_lowercase()).collect();
            match self.entries.iter_mut().find(|(c, _)| *c == cause) {
                Some(entry) => entry.1 = words,
                None => self.entries.push((cause, words)),
            }
        }
        Ok(())
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect()
}
