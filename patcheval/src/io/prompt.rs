//! Stage prompt templates.
//!
//! One minijinja template per stage, loaded from `<prompts_dir>/<stage>.md`.
//! Rendering is a pure text substitution over [`PromptParams`].

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::core::types::Commit;

const TEMPLATE_EXTENSION: &str = "md";

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("no prompt template for stage '{stage}'")]
    TemplateMissing { stage: String },
    #[error("render prompt: {0}")]
    Render(#[from] minijinja::Error),
}

/// Values in scope for a stage template.
///
/// `plan_response_prev` and `plan_response_first` are empty for the first
/// stage of a plan.
#[derive(Debug, Clone, Serialize)]
pub struct PromptParams<'a> {
    pub commit: &'a str,
    pub message_short: &'a str,
    pub message: &'a str,
    pub diff: &'a str,
    pub plan_response_prev: &'a str,
    pub plan_response_first: &'a str,
}

impl<'a> PromptParams<'a> {
    pub fn new(commit: &'a Commit, response_prev: &'a str, response_first: &'a str) -> Self {
        Self {
            commit: &commit.id,
            message_short: &commit.message_short,
            message: &commit.message,
            diff: &commit.patch,
            plan_response_prev: response_prev,
            plan_response_first: response_first,
        }
    }
}

/// Stage-name keyed template sources.
#[derive(Debug, Clone, Default)]
pub struct PromptRenderer {
    templates: BTreeMap<String, String>,
}

impl PromptRenderer {
    pub fn from_templates<I, K, V>(templates: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            templates: templates
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Load templates for `stages` from `dir`. Stages without a file are left
    /// out; [`PromptRenderer::ensure_templates`] reports them.
    pub fn load_dir(dir: &Path, stages: &[&str]) -> Result<Self> {
        let mut templates = BTreeMap::new();
        for stage in stages {
            let path = dir.join(format!("{stage}.{TEMPLATE_EXTENSION}"));
            if !path.is_file() {
                continue;
            }
            let source = fs::read_to_string(&path)
                .with_context(|| format!("read template {}", path.display()))?;
            debug!(stage, path = %path.display(), bytes = source.len(), "loaded template");
            templates.insert(stage.to_string(), source);
        }
        Ok(Self { templates })
    }

    /// Fail with the first stage that has no template, and check each
    /// template parses.
    pub fn ensure_templates(&self, stages: &[&str]) -> Result<(), PromptError> {
        for stage in stages {
            let source = self.source(stage)?;
            let mut env = Environment::new();
            env.add_template(stage, source)?;
        }
        Ok(())
    }

    pub fn render(&self, stage: &str, params: &PromptParams<'_>) -> Result<String, PromptError> {
        let source = self.source(stage)?;
        let mut env = Environment::new();
        env.add_template(stage, source)?;
        let rendered = env.get_template(stage)?.render(params)?;
        Ok(rendered)
    }

    fn source(&self, stage: &str) -> Result<&str, PromptError> {
        self.templates
            .get(stage)
            .map(String::as_str)
            .ok_or_else(|| PromptError::TemplateMissing {
                stage: stage.to_string(),
            })
    }
}

/// Render a stage's repair prompt with the current and maximum retry counters.
pub fn render_repair(template: &str, retry: u32, max_retries: u32) -> Result<String, PromptError> {
    let mut env = Environment::new();
    env.add_template("repair", template)?;
    let rendered = env
        .get_template("repair")?
        .render(context! { retry => retry, max_retries => max_retries })?;
    Ok(rendered)
}
