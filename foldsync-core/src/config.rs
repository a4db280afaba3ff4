use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::filter::normalize_extensions;
use crate::schedule::Schedule;
#[cfg(windows)]
use crate::utils::normalize_long_path;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:8080";
pub const DEFAULT_DEBOUNCE_MS: u64 = 300;
pub const DEFAULT_COPY_WORKERS: u32 = 4;
pub const DEFAULT_HOOK_RETRIES: u32 = 3;

/// Root configuration persisted to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen: String,
    pub pairs: Vec<Pair>,
}

impl Default for Config {
    fn default() -> Self {
        Self { listen: DEFAULT_LISTEN.to_string(), pairs: Vec::new() }
    }
}

/// One source → target sync relationship with its filtering, schedule and
/// hooks. Runtime state (statistics, watcher activity) lives in the
/// scheduler and pair manager, not here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Pair {
    pub id: String,
    pub enabled: bool,
    pub source: PathBuf,
    pub target: PathBuf,
    pub include_extensions: Vec<String>,
    pub exclude_globs: Vec<String>,
    pub sync_strategy: SyncStrategy,
    pub debounce_ms: u64,
    pub mirror_deletes: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub copy_workers: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook_max_retries: Option<u32>,
    pub hooks: Vec<Hook>,
    pub schedule: Schedule,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl Pair {
    /// Debounce window with the default applied.
    pub fn debounce(&self) -> u64 {
        if self.debounce_ms == 0 { DEFAULT_DEBOUNCE_MS } else { self.debounce_ms }
    }

    pub fn workers(&self) -> u32 {
        self.copy_workers.unwrap_or(DEFAULT_COPY_WORKERS)
    }

    pub fn hook_retries(&self) -> u32 {
        self.hook_max_retries.unwrap_or(DEFAULT_HOOK_RETRIES)
    }

    /// Display name: the description when set, otherwise derived from the id.
    pub fn name(&self) -> String {
        if self.description.is_empty() {
            format!("Sync {}", self.id)
        } else {
            self.description.clone()
        }
    }
}

/// How changed files are detected during a full sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStrategy {
    /// Modification time (2 s tolerance) plus size.
    #[default]
    Mtime,
    /// SHA-256 content digest.
    Hash,
}

/// Post-sync action, either an HTTP request or a command, with optional
/// file filtering.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Hook {
    pub match_extensions: Vec<String>,
    pub match_globs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpHook>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandHook>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpHook {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body_template: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommandHook {
    pub executable: String,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub work_dir: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env_vars: BTreeMap<String, String>,
}

impl Config {
    /// Read the configuration from `path`. A missing file yields the
    /// default configuration; anything else must parse and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Config::default());
            }
            Err(err) => return Err(err.into()),
        };
        let mut config: Config = serde_json::from_str(&text)?;
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Persist atomically: write `<path>.tmp`, then rename over `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut tmp = path.as_os_str().to_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp, data)?;
        if let Err(err) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }

    pub fn apply_defaults(&mut self) {
        if self.listen.is_empty() {
            self.listen = DEFAULT_LISTEN.to_string();
        }
        for pair in &mut self.pairs {
            apply_pair_defaults(pair);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen.is_empty() {
            return Err(Error::InvalidConfig("listen address cannot be empty".into()));
        }
        for (i, pair) in self.pairs.iter().enumerate() {
            validate_pair_basics(pair)
                .map_err(|e| Error::InvalidConfig(format!("pair {} ({}): {e}", i, pair.id)))?;
        }
        Ok(())
    }
}

fn apply_pair_defaults(pair: &mut Pair) {
    if pair.debounce_ms == 0 {
        pair.debounce_ms = DEFAULT_DEBOUNCE_MS;
    }
    if pair.copy_workers.is_none() {
        pair.copy_workers = Some(DEFAULT_COPY_WORKERS);
    }
    if pair.hook_max_retries.is_none() {
        pair.hook_max_retries = Some(DEFAULT_HOOK_RETRIES);
    }
}

/// Admission validation run before a pair reaches the pair manager.
/// Rewrites Windows paths to long form, validates the schedule, applies
/// defaults and normalizes the include-extension list.
pub fn validate_pair(pair: &mut Pair) -> Result<()> {
    if pair.id.is_empty() {
        return Err(Error::InvalidPair("id is required".into()));
    }
    if pair.source.as_os_str().is_empty() || pair.target.as_os_str().is_empty() {
        return Err(Error::InvalidPair("source and target are required".into()));
    }
    if pair.source == pair.target {
        return Err(Error::InvalidPair("source and target cannot be the same".into()));
    }

    #[cfg(windows)]
    {
        pair.source = PathBuf::from(normalize_long_path(&pair.source.to_string_lossy()));
        pair.target = PathBuf::from(normalize_long_path(&pair.target.to_string_lossy()));
    }

    pair.schedule.validate()?;

    for hook in &pair.hooks {
        validate_hook(hook).map_err(|e| Error::InvalidPair(e.to_string()))?;
    }

    apply_pair_defaults(pair);
    pair.include_extensions = normalize_extensions(&pair.include_extensions);
    Ok(())
}

fn validate_pair_basics(pair: &Pair) -> Result<()> {
    if pair.id.is_empty() {
        return Err(Error::InvalidPair("pair ID cannot be empty".into()));
    }
    if pair.source.as_os_str().is_empty() {
        return Err(Error::InvalidPair("source path cannot be empty".into()));
    }
    if pair.target.as_os_str().is_empty() {
        return Err(Error::InvalidPair("target path cannot be empty".into()));
    }
    if pair.source == pair.target {
        return Err(Error::InvalidPair("source and target paths cannot be the same".into()));
    }
    for hook in &pair.hooks {
        validate_hook(hook)?;
    }
    Ok(())
}

fn validate_hook(hook: &Hook) -> Result<()> {
    match (&hook.http, &hook.command) {
        (None, None) => {
            Err(Error::InvalidPair("hook must have either http or command configuration".into()))
        }
        (Some(_), Some(_)) => {
            Err(Error::InvalidPair("hook cannot have both http and command configurations".into()))
        }
        (Some(http), None) => {
            if http.url.is_empty() {
                return Err(Error::InvalidPair("http hook URL cannot be empty".into()));
            }
            Ok(())
        }
        (None, Some(command)) => {
            if command.executable.is_empty() {
                return Err(Error::InvalidPair("command hook executable cannot be empty".into()));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::ScheduleKind;
    use tempfile::TempDir;

    fn sample_pair() -> Pair {
        Pair {
            id: "docs".into(),
            enabled: true,
            source: PathBuf::from("/data/src"),
            target: PathBuf::from("/data/dst"),
            include_extensions: vec![".TXT".into(), "md".into()],
            schedule: Schedule::interval("5m"),
            ..Pair::default()
        }
    }

    #[test]
    fn missing_file_yields_default_config() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(&dir.path().join("config.json")).unwrap();
        assert_eq!(config.listen, DEFAULT_LISTEN);
        assert!(config.pairs.is_empty());
    }

    #[test]
    fn save_load_save_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        let mut pair = sample_pair();
        validate_pair(&mut pair).unwrap();
        let config = Config { listen: DEFAULT_LISTEN.into(), pairs: vec![pair] };
        config.save(&path).unwrap();
        let first = fs::read_to_string(&path).unwrap();

        let reloaded = Config::load(&path).unwrap();
        reloaded.save(&path).unwrap();
        let second = fs::read_to_string(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        Config::default().save(&path).unwrap();
        assert!(path.exists());
        assert!(!dir.path().join("config.json.tmp").exists());
    }

    #[test]
    fn load_applies_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"pairs":[{"id":"p1","source":"/a","target":"/b","schedule":{"type":"watcher"}}]}"#,
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.listen, DEFAULT_LISTEN);
        let pair = &config.pairs[0];
        assert_eq!(pair.debounce_ms, DEFAULT_DEBOUNCE_MS);
        assert_eq!(pair.workers(), DEFAULT_COPY_WORKERS);
        assert_eq!(pair.hook_retries(), DEFAULT_HOOK_RETRIES);
        assert_eq!(pair.sync_strategy, SyncStrategy::Mtime);
    }

    #[test]
    fn missing_schedule_defaults_to_watcher() {
        let pair: Pair =
            serde_json::from_str(r#"{"id":"p1","source":"/a","target":"/b"}"#).unwrap();
        assert_eq!(pair.schedule.kind, ScheduleKind::Watcher);
    }

    #[test]
    fn validate_pair_requirements() {
        let mut pair = sample_pair();
        pair.id = String::new();
        assert!(matches!(validate_pair(&mut pair), Err(Error::InvalidPair(_))));

        let mut pair = sample_pair();
        pair.target = pair.source.clone();
        assert!(matches!(validate_pair(&mut pair), Err(Error::InvalidPair(_))));

        let mut pair = sample_pair();
        pair.schedule = Schedule::interval("");
        assert!(matches!(validate_pair(&mut pair), Err(Error::InvalidSchedule(_))));

        let mut pair = sample_pair();
        pair.schedule = Schedule::cron("");
        assert!(matches!(validate_pair(&mut pair), Err(Error::InvalidSchedule(_))));

        let mut pair = sample_pair();
        pair.schedule = Schedule::custom(vec![1], "25:00", "20:00", "1h");
        assert!(matches!(validate_pair(&mut pair), Err(Error::InvalidSchedule(_))));

        let mut pair = sample_pair();
        pair.schedule = Schedule::disabled();
        assert!(validate_pair(&mut pair).is_ok());

        let mut pair = sample_pair();
        pair.schedule = Schedule::watcher();
        assert!(validate_pair(&mut pair).is_ok());
    }

    #[test]
    fn validate_pair_normalizes_extensions() {
        let mut pair = sample_pair();
        validate_pair(&mut pair).unwrap();
        assert_eq!(pair.include_extensions, vec![".txt".to_string(), ".md".to_string()]);
    }

    #[test]
    fn hook_must_have_exactly_one_action() {
        let mut pair = sample_pair();
        pair.hooks.push(Hook::default());
        assert!(validate_pair(&mut pair).is_err());

        let mut pair = sample_pair();
        pair.hooks.push(Hook {
            http: Some(HttpHook { url: "http://localhost/x".into(), ..HttpHook::default() }),
            command: Some(CommandHook { executable: "touch".into(), ..CommandHook::default() }),
            ..Hook::default()
        });
        assert!(validate_pair(&mut pair).is_err());

        let mut pair = sample_pair();
        pair.hooks.push(Hook {
            http: Some(HttpHook { url: "http://localhost/x".into(), ..HttpHook::default() }),
            ..Hook::default()
        });
        assert!(validate_pair(&mut pair).is_ok());
    }

    #[test]
    fn pair_wire_field_names() {
        let mut pair = sample_pair();
        pair.mirror_deletes = true;
        validate_pair(&mut pair).unwrap();
        let json = serde_json::to_value(&pair).unwrap();
        for key in [
            "id",
            "enabled",
            "source",
            "target",
            "includeExtensions",
            "excludeGlobs",
            "syncStrategy",
            "debounceMs",
            "mirrorDeletes",
            "copyWorkers",
            "hookMaxRetries",
            "hooks",
            "schedule",
        ] {
            assert!(json.get(key).is_some(), "missing key {key}");
        }
        assert_eq!(json["syncStrategy"], "mtime");
        assert_eq!(json["schedule"]["type"], "interval");
    }
}
