//! Engine configuration stored in `patcheval.toml`.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::types::{BackendParams, FoldPolicy, OutcomeRule, Plan, StageRules, StageSpec};

/// Default file name looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "patcheval.toml";

/// Backend option widened by `retry.widen_output_step`.
pub const OUTPUT_LIMIT_OPTION: &str = "num_predict";

/// Engine configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// values suitable for a local Ollama instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PatchevalConfig {
    /// Git repository whose history is classified.
    pub repo: PathBuf,

    /// Directory holding one `<stage>.md` template per stage.
    pub prompts_dir: PathBuf,

    /// Root under which each run creates a timestamped log directory.
    pub log_dir: PathBuf,

    /// Ordered stage names executed for every commit.
    pub plan: Vec<String>,

    /// Consecutive failing classifying stages that end a commit early (0 disables).
    pub skip_commit_on_consecutive_fails: u32,

    /// Skip merge commits even when they carry a diff.
    pub skip_merge_commits: bool,

    /// Upper bound for every git subprocess.
    pub git_timeout_secs: u64,

    pub backend: BackendConfig,

    pub retry: RetryConfig,

    pub stages: BTreeMap<String, StageConfig>,

    pub outcomes: Vec<OutcomeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendConfig {
    /// Generation endpoint (Ollama `/api/generate`).
    pub url: String,
    pub connect_timeout_secs: u64,
    /// Bound on waiting for a single generation. Inference can take minutes.
    pub read_timeout_secs: u64,
    /// Fixed pause between attempts after a transient fault.
    pub backoff_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:11434/api/generate".to_string(),
            connect_timeout_secs: 10,
            read_timeout_secs: 60 * 60,
            backoff_ms: 5_000,
        }
    }
}

impl BackendConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// Ambiguous responses tolerated per stage before it resolves `unknown`.
    pub max_retries: u32,
    /// Added to `num_predict` for each protocol retry. Every classifying
    /// stage in the plan must then set `num_predict` in its options.
    pub widen_output_step: Option<u64>,
    /// Cap for the widened `num_predict`.
    pub widen_output_max: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            widen_output_step: None,
            widen_output_max: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StageConfig {
    /// Pattern for an affirmative response.
    pub ok: Option<String>,
    /// Pattern for a negative response.
    pub fail: Option<String>,
    pub policy: FoldPolicy,
    /// Minijinja template with `retry` and `max_retries` in scope.
    pub repair_prompt: String,
    pub model: String,
    /// Passed verbatim as the backend `options` object.
    pub options: Map<String, Value>,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            ok: None,
            fail: None,
            policy: FoldPolicy::Any,
            repair_prompt: "Invalid response (retry {{ retry }}/{{ max_retries }}), reply with exactly one of the requested answers:".to_string(),
            model: String::new(),
            options: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutcomeConfig {
    pub name: String,
    #[serde(default = "default_outcome_policy")]
    pub policy: FoldPolicy,
    pub stages: Vec<String>,
}

fn default_outcome_policy() -> FoldPolicy {
    FoldPolicy::All
}

impl Default for PatchevalConfig {
    fn default() -> Self {
        Self {
            repo: PathBuf::from("."),
            prompts_dir: PathBuf::from("prompts"),
            log_dir: PathBuf::from("logs"),
            plan: Vec::new(),
            skip_commit_on_consecutive_fails: 1,
            skip_merge_commits: true,
            git_timeout_secs: 120,
            backend: BackendConfig::default(),
            retry: RetryConfig::default(),
            stages: BTreeMap::new(),
            outcomes: Vec::new(),
        }
    }
}

impl PatchevalConfig {
    pub fn validate(&self) -> Result<()> {
        if self.plan.is_empty() {
            return Err(anyhow!("plan must name at least one stage"));
        }
        let mut seen = HashSet::new();
        for name in &self.plan {
            if !seen.insert(name.as_str()) {
                return Err(anyhow!("plan lists stage '{name}' more than once"));
            }
            let stage = self
                .stages
                .get(name)
                .ok_or_else(|| anyhow!("plan references undefined stage '{name}'"))?;
            stage
                .validate()
                .with_context(|| format!("stage '{name}'"))?;
            if self.retry.widen_output_step.is_some()
                && stage.ok.is_some()
                && !stage.options.contains_key(OUTPUT_LIMIT_OPTION)
            {
                return Err(anyhow!(
                    "retry.widen_output_step needs stage '{name}' to set options.{OUTPUT_LIMIT_OPTION}"
                ));
            }
        }
        for outcome in &self.outcomes {
            if outcome.stages.is_empty() {
                return Err(anyhow!("outcome '{}' lists no stages", outcome.name));
            }
            for stage in &outcome.stages {
                if !self.plan.contains(stage) {
                    return Err(anyhow!(
                        "outcome '{}' references stage '{stage}' which is not in the plan",
                        outcome.name
                    ));
                }
            }
        }
        if self.git_timeout_secs == 0 {
            return Err(anyhow!("git_timeout_secs must be > 0"));
        }
        if self.backend.url.trim().is_empty() {
            return Err(anyhow!("backend.url must be set"));
        }
        if self.backend.connect_timeout_secs == 0 || self.backend.read_timeout_secs == 0 {
            return Err(anyhow!("backend timeouts must be > 0"));
        }
        if self.retry.max_retries == 0 {
            return Err(anyhow!("retry.max_retries must be > 0"));
        }
        if self.retry.widen_output_max.is_some() && self.retry.widen_output_step.is_none() {
            return Err(anyhow!(
                "retry.widen_output_max requires retry.widen_output_step"
            ));
        }
        Ok(())
    }

    /// Compile the configured stages into an executable [`Plan`].
    pub fn compile_plan(&self) -> Result<Plan> {
        self.validate()?;
        let mut stages = Vec::with_capacity(self.plan.len());
        for name in &self.plan {
            let stage = self
                .stages
                .get(name)
                .ok_or_else(|| anyhow!("plan references undefined stage '{name}'"))?;
            stages.push(stage.compile(name)?);
        }
        let outcomes = self
            .outcomes
            .iter()
            .map(|outcome| OutcomeRule {
                name: outcome.name.clone(),
                policy: outcome.policy,
                stages: outcome.stages.clone(),
            })
            .collect();
        Ok(Plan {
            stages,
            outcomes,
            skip_threshold: self.skip_commit_on_consecutive_fails,
            skip_merge_commits: self.skip_merge_commits,
        })
    }

    /// Resolve relative paths against the directory holding the config file.
    pub fn resolve_paths(&mut self, base: &Path) {
        for path in [&mut self.repo, &mut self.prompts_dir, &mut self.log_dir] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }
}

impl StageConfig {
    fn validate(&self) -> Result<()> {
        match (&self.ok, &self.fail) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(anyhow!(
                    "ok and fail patterns must be set together (or both omitted for a free-text stage)"
                ));
            }
            (Some(ok), Some(fail)) => {
                Regex::new(ok).with_context(|| format!("invalid ok pattern '{ok}'"))?;
                Regex::new(fail).with_context(|| format!("invalid fail pattern '{fail}'"))?;
            }
            (None, None) => {}
        }
        if self.model.trim().is_empty() {
            return Err(anyhow!("model must be set"));
        }
        Ok(())
    }

    fn compile(&self, name: &str) -> Result<StageSpec> {
        let rules = match (&self.ok, &self.fail) {
            (Some(ok), Some(fail)) => Some(StageRules {
                ok: Regex::new(ok).with_context(|| format!("stage '{name}' ok pattern"))?,
                fail: Regex::new(fail).with_context(|| format!("stage '{name}' fail pattern"))?,
            }),
            _ => None,
        };
        Ok(StageSpec {
            name: name.to_string(),
            rules,
            policy: self.policy,
            repair_prompt: self.repair_prompt.clone(),
            params: BackendParams {
                model: self.model.clone(),
                options: self.options.clone(),
            },
        })
    }
}

/// Load config from a TOML file and validate it.
///
/// Relative paths inside the file resolve against the file's directory.
pub fn load_config(path: &Path) -> Result<PatchevalConfig> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut cfg: PatchevalConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    cfg.resolve_paths(base);
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}
