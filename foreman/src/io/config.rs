//! Supervisor configuration stored under `<repo>/.foreman/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::gate::QualityGate;
use crate::core::plan::{PhaseSpec, default_phase_specs, validate_phase_specs};
use crate::core::rules::{RuleSpec, RuleTable, default_rule_specs};
use crate::core::signals::{CompletionPattern, DEFAULT_COMPLETION_PATTERN};

/// Supervisor configuration (TOML).
///
/// Edited by humans; every field has a default so a partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ForemanConfig {
    /// Command line started inside each session (e.g. `["claude"]`).
    pub worker_command: Vec<String>,

    /// Parent directory for task worktrees. Defaults to `<repo_parent>/<repo_name>.foreman`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspaces_dir: Option<PathBuf>,

    /// Lines of session output read per capture.
    pub capture_lines: usize,

    pub poll_interval_ms: u64,

    /// Budget for the worker to reach its input prompt.
    pub startup_timeout_secs: u64,

    /// Budget for the whole phase plan once the mission is dispatched.
    pub run_timeout_secs: u64,

    /// Pause between typing input and pressing Enter.
    pub submit_delay_ms: u64,

    /// Kill a hung `tmux` helper call after this long.
    pub host_command_timeout_secs: u64,

    /// Simultaneously running phases in parallel/autonomous modes.
    pub max_concurrent_phases: usize,

    /// Regex with named groups `phase`, `attempt` and `score`.
    pub completion_pattern: String,

    pub quality: QualityGate,

    pub cleanup: CleanupConfig,

    /// Interaction rules, matched in category priority `error > approval > readiness`.
    pub rules: Vec<RuleSpec>,

    /// Phase graph template for every task.
    pub phases: Vec<PhaseSpec>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CleanupConfig {
    /// Remove the worktree after a completed run (dirty worktrees are always kept).
    pub remove_workspace_on_success: bool,
    /// Delete the task branch after a completed run.
    pub delete_branch_on_success: bool,
    /// Kill the session when a run fails, blocks or times out. Off by default so
    /// the operator can attach and continue by hand.
    pub kill_session_on_failure: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            remove_workspace_on_success: true,
            delete_branch_on_success: false,
            kill_session_on_failure: false,
        }
    }
}

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            worker_command: vec!["claude".to_string()],
            workspaces_dir: None,
            capture_lines: 200,
            poll_interval_ms: 1000,
            startup_timeout_secs: 120,
            run_timeout_secs: 4 * 60 * 60,
            submit_delay_ms: 150,
            host_command_timeout_secs: 10,
            max_concurrent_phases: 4,
            completion_pattern: DEFAULT_COMPLETION_PATTERN.to_string(),
            quality: QualityGate::default(),
            cleanup: CleanupConfig::default(),
            rules: default_rule_specs(),
            phases: default_phase_specs(),
        }
    }
}

impl ForemanConfig {
    pub fn validate(&self) -> Result<()> {
        if self.worker_command.is_empty() || self.worker_command[0].trim().is_empty() {
            return Err(anyhow!("worker_command must be a non-empty array"));
        }
        if self.capture_lines == 0 {
            return Err(anyhow!("capture_lines must be > 0"));
        }
        if self.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be > 0"));
        }
        if self.startup_timeout_secs == 0 {
            return Err(anyhow!("startup_timeout_secs must be > 0"));
        }
        if self.run_timeout_secs == 0 {
            return Err(anyhow!("run_timeout_secs must be > 0"));
        }
        if self.host_command_timeout_secs == 0 {
            return Err(anyhow!("host_command_timeout_secs must be > 0"));
        }
        if self.max_concurrent_phases == 0 {
            return Err(anyhow!("max_concurrent_phases must be > 0"));
        }
        if self.quality.threshold > 100 {
            return Err(anyhow!("quality.threshold must be within 0..=100"));
        }
        CompletionPattern::new(&self.completion_pattern)?;
        RuleTable::compile(&self.rules).context("invalid rules")?;
        let phase_errors = validate_phase_specs(&self.phases);
        if !phase_errors.is_empty() {
            return Err(anyhow!("invalid phases: {}", phase_errors.join("; ")));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn submit_delay(&self) -> Duration {
        Duration::from_millis(self.submit_delay_ms)
    }

    pub fn host_command_timeout(&self) -> Duration {
        Duration::from_secs(self.host_command_timeout_secs)
    }

    /// Directory holding task worktrees for `repo_root`.
    pub fn resolve_workspaces_dir(&self, repo_root: &Path) -> Result<PathBuf> {
        if let Some(dir) = &self.workspaces_dir {
            return Ok(if dir.is_absolute() {
                dir.clone()
            } else {
                repo_root.join(dir)
            });
        }
        let name = repo_root
            .file_name()
            .with_context(|| format!("repository path has no name: {}", repo_root.display()))?;
        let parent = repo_root
            .parent()
            .with_context(|| format!("repository path has no parent: {}", repo_root.display()))?;
        Ok(parent.join(format!("{}.foreman", name.to_string_lossy())))
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ForemanConfig::default()`.
pub fn load_config(path: &Path) -> Result<ForemanConfig> {
    if !path.exists() {
        let cfg = ForemanConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ForemanConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ForemanConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents).with_context(|| format!("write temp {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rules::RuleCategory;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, ForemanConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".foreman/config.toml");
        let cfg = ForemanConfig::default();
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
        assert!(!path.with_file_name("config.toml.tmp").exists());
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            r#"
worker_command = ["bash"]
poll_interval_ms = 250

[quality]
threshold = 75

[[rules]]
category = "readiness"
pattern = '\$ $'
"#,
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.worker_command, vec!["bash"]);
        assert_eq!(cfg.poll_interval(), Duration::from_millis(250));
        assert_eq!(cfg.quality.threshold, 75);
        assert_eq!(cfg.quality.max_iterations, 2);
        assert_eq!(cfg.rules.len(), 1);
        assert_eq!(cfg.rules[0].category, RuleCategory::Readiness);
        assert_eq!(cfg.phases, default_phase_specs());
    }

    #[test]
    fn rejects_cyclic_phase_graph() {
        let cfg = ForemanConfig {
            phases: vec![
                PhaseSpec::new("a", "r", &["b"], &[]),
                PhaseSpec::new("b", "r", &["a"], &[]),
            ],
            ..ForemanConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn rejects_zero_poll_interval_and_bad_threshold() {
        let cfg = ForemanConfig {
            poll_interval_ms: 0,
            ..ForemanConfig::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = ForemanConfig {
            quality: QualityGate {
                threshold: 101,
                max_iterations: 2,
            },
            ..ForemanConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn default_workspaces_dir_is_a_sibling_of_the_repo() {
        let cfg = ForemanConfig::default();
        let dir = cfg
            .resolve_workspaces_dir(Path::new("/src/app"))
            .expect("resolve");
        assert_eq!(dir, PathBuf::from("/src/app.foreman"));

        let cfg = ForemanConfig {
            workspaces_dir: Some(PathBuf::from("trees")),
            ..ForemanConfig::default()
        };
        assert_eq!(
            cfg.resolve_workspaces_dir(Path::new("/src/app"))
                .expect("resolve"),
            PathBuf::from("/src/app/trees")
        );
    }
}
