//! Executor configuration, usually stored in `campaign-exec.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::process::DEFAULT_OUTPUT_LIMIT_BYTES;
use crate::io::workspace::{DEFAULT_VOLUME_WORKSPACE_IMAGE, WorkspaceMode, WorkspaceSettings};

/// Default config file name looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "campaign-exec.toml";

/// Executor configuration (TOML).
///
/// Missing fields take their defaults, so an empty file is valid. CLI flags
/// override whatever is loaded here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum number of tasks running at once.
    pub parallelism: usize,

    /// Per-task wall-clock budget in seconds, covering fetch through diff.
    pub timeout_secs: u64,

    /// Delete cached results before running instead of reading them.
    pub clear_cache: bool,

    /// Bypass the cache entirely: no reads, no writes.
    pub skip_cache: bool,

    /// Keep per-task logs of successful tasks.
    pub keep_logs: bool,

    pub cache_dir: PathBuf,
    pub log_dir: PathBuf,

    /// Directory holding local clones, one per repository name.
    pub repos_dir: PathBuf,

    /// Where fetched repository archives are stored.
    pub archive_dir: PathBuf,

    /// Container runtime binary.
    pub container_program: String,

    /// Truncate captured step stdout/stderr beyond this many bytes. Diffs and
    /// status listings are never truncated.
    pub output_limit_bytes: usize,

    pub workspace: WorkspaceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub mode: WorkspaceMode,

    /// Image used to run git against volume workspaces.
    pub volume_image: String,

    /// Parent directory for bind workspaces. System temp dir when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            mode: WorkspaceMode::Auto,
            volume_image: DEFAULT_VOLUME_WORKSPACE_IMAGE.to_string(),
            temp_dir: None,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(4);
        Self {
            parallelism,
            timeout_secs: 60 * 60,
            clear_cache: false,
            skip_cache: false,
            keep_logs: false,
            cache_dir: PathBuf::from(".campaign-exec/cache"),
            log_dir: PathBuf::from(".campaign-exec/logs"),
            repos_dir: PathBuf::from("repos"),
            archive_dir: PathBuf::from(".campaign-exec/archives"),
            container_program: "docker".to_string(),
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            workspace: WorkspaceConfig::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(anyhow!("parallelism must be > 0"));
        }
        if self.timeout_secs == 0 {
            return Err(anyhow!("timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.container_program.trim().is_empty() {
            return Err(anyhow!("container_program must be non-empty"));
        }
        if self.workspace.volume_image.trim().is_empty() {
            return Err(anyhow!("workspace.volume_image must be non-empty"));
        }
        if self.clear_cache && self.skip_cache {
            return Err(anyhow!("clear_cache and skip_cache are mutually exclusive"));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn workspace_settings(&self) -> WorkspaceSettings {
        WorkspaceSettings {
            mode: self.workspace.mode,
            temp_dir: self.workspace.temp_dir.clone(),
            volume_image: self.workspace.volume_image.clone(),
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ExecutorConfig::default()`.
pub fn load_config(path: &Path) -> Result<ExecutorConfig> {
    if !path.exists() {
        let cfg = ExecutorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ExecutorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ExecutorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
