//! Daemon settings (TOML) and the managed program's command configuration (JSON).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_RUN_COMMAND: &str = "python app.py";
pub const DEFAULT_TOKEN_ENV: &str = "GITHUB_TOKEN";
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 10;
pub const DEFAULT_LOG_MAX_LINES: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum CommandStoreError {
    #[error("failed to read command config at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid command config JSON at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize command config: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write command config at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no command config backup at {path}")]
    NoBackup { path: PathBuf },
}

/// Top-level daemon settings, read once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TendConfig {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Remote the managed program is cloned from.
    #[serde(default)]
    pub repo_url: String,
    #[serde(default)]
    pub branch: Option<String>,
    /// Environment variable holding the access token for https remotes.
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            repo_url: String::new(),
            branch: None,
            token_env: default_token_env(),
        }
    }
}

impl SourceConfig {
    /// Token from the configured environment variable, if set and non-empty.
    pub fn token(&self) -> Option<String> {
        std::env::var(&self.token_env)
            .ok()
            .filter(|token| !token.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Checkout of the managed program; every command runs here.
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: PathBuf,
    /// Durable supervisor state (pid registry, terminal log).
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_commands_file")]
    pub commands_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            runtime_dir: default_runtime_dir(),
            state_dir: default_state_dir(),
            commands_file: default_commands_file(),
        }
    }
}

impl PathsConfig {
    pub fn pid_registry_path(&self) -> PathBuf {
        self.state_dir.join("pids.sqlite")
    }

    pub fn terminal_log_path(&self) -> PathBuf {
        self.state_dir.join("terminal.log")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    #[serde(default = "default_log_max_lines")]
    pub log_max_lines: usize,
    /// Shell used to interpret commands. Empty means direct exec.
    #[serde(default = "default_shell")]
    pub shell: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
            log_max_lines: default_log_max_lines(),
            shell: default_shell(),
        }
    }
}

impl SupervisorConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn shell(&self) -> Option<&str> {
        let shell = self.shell.trim();
        (!shell.is_empty()).then_some(shell)
    }
}

fn default_token_env() -> String {
    DEFAULT_TOKEN_ENV.to_string()
}

fn default_runtime_dir() -> PathBuf {
    PathBuf::from("runtime")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".tend")
}

fn default_commands_file() -> PathBuf {
    PathBuf::from("config.json")
}

fn default_grace_period_secs() -> u64 {
    DEFAULT_GRACE_PERIOD_SECS
}

fn default_log_max_lines() -> usize {
    DEFAULT_LOG_MAX_LINES
}

fn default_shell() -> String {
    "sh".to_string()
}

pub fn parse_tend_config(contents: &str) -> Result<TendConfig, toml::de::Error> {
    toml::from_str(contents)
}

pub fn load_tend_config(path: impl AsRef<Path>) -> Result<TendConfig, ConfigError> {
    let path_ref = path.as_ref();
    let body = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
        path: path_ref.to_path_buf(),
        source,
    })?;
    parse_tend_config(&body).map_err(|source| ConfigError::Parse {
        path: path_ref.to_path_buf(),
        source,
    })
}

/// How the managed program is prepared and launched.
///
/// Field names follow the JSON document edited by operators: `start` is the
/// run command and `build` the optional build step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandConfig {
    #[serde(rename = "start", alias = "run", default = "default_run_command")]
    pub run_command: String,
    #[serde(rename = "build", default, skip_serializing_if = "Option::is_none")]
    pub build_command: Option<String>,
    /// Environment preparation, executed in order before `build`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub setup: Vec<String>,
    #[serde(default)]
    pub scripts: BTreeMap<String, String>,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            run_command: default_run_command(),
            build_command: None,
            setup: Vec::new(),
            scripts: BTreeMap::new(),
        }
    }
}

fn default_run_command() -> String {
    DEFAULT_RUN_COMMAND.to_string()
}

impl CommandConfig {
    /// Ordered preparation steps: setup commands, then the build command.
    ///
    /// `build_override` replaces the configured build command. Blank entries
    /// are skipped.
    pub fn prepare_steps(&self, build_override: Option<&str>) -> Vec<String> {
        let build = build_override.or(self.build_command.as_deref());
        self.setup
            .iter()
            .map(String::as_str)
            .chain(build)
            .map(str::trim)
            .filter(|step| !step.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn run_command_or(&self, run_override: Option<&str>) -> String {
        match run_override.map(str::trim) {
            Some(cmd) if !cmd.is_empty() => cmd.to_string(),
            _ => self.run_command.clone(),
        }
    }

    pub fn script(&self, name: &str) -> Option<&str> {
        self.scripts
            .get(name)
            .map(String::as_str)
            .filter(|cmd| !cmd.trim().is_empty())
    }
}

/// Source of the command configuration, consulted at the start of every
/// lifecycle operation.
pub trait CommandStore: Send + Sync {
    fn load(&self) -> Result<CommandConfig, CommandStoreError>;
}

/// A fixed configuration acts as its own store.
impl CommandStore for CommandConfig {
    fn load(&self) -> Result<CommandConfig, CommandStoreError> {
        Ok(self.clone())
    }
}

/// JSON file store with a single-generation backup next to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCommandStore {
    path: PathBuf,
}

impl FileCommandStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".bak");
        PathBuf::from(name)
    }

    /// Replace the configuration, keeping the previous file as backup.
    pub fn save(&self, config: &CommandConfig) -> Result<(), CommandStoreError> {
        let body = serde_json::to_string_pretty(config)
            .map_err(|source| CommandStoreError::Serialize { source })?;
        self.write_with_backup(&body)
    }

    /// Parse a JSON document destined for this store.
    pub fn parse(&self, body: &str) -> Result<CommandConfig, CommandStoreError> {
        serde_json::from_str(body).map_err(|source| CommandStoreError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// Copy the backup over the current configuration.
    pub fn restore(&self) -> Result<(), CommandStoreError> {
        let backup = self.backup_path();
        if !backup.exists() {
            return Err(CommandStoreError::NoBackup { path: backup });
        }
        fs::copy(&backup, &self.path).map_err(|source| CommandStoreError::Write {
            path: self.path.clone(),
            source,
        })?;
        tracing::info!(path = %self.path.display(), "restored command config from backup");
        Ok(())
    }

    fn write_with_backup(&self, body: &str) -> Result<(), CommandStoreError> {
        if self.path.exists() {
            let backup = self.backup_path();
            fs::copy(&self.path, &backup).map_err(|source| CommandStoreError::Write {
                path: backup,
                source,
            })?;
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| CommandStoreError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(&self.path, body).map_err(|source| CommandStoreError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

impl CommandStore for FileCommandStore {
    /// A missing file yields the default configuration.
    fn load(&self) -> Result<CommandConfig, CommandStoreError> {
        let body = match fs::read_to_string(&self.path) {
            Ok(body) => body,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CommandConfig::default())
            }
            Err(source) => {
                return Err(CommandStoreError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        self.parse(&body)
    }
}
