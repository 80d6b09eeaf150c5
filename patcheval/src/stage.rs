//! Stage executor: one stage's request/retry/repair cycle.
//!
//! The cycle is an explicit state machine:
//!
//! ```text
//! Init -> PromptReady -> AwaitingBackend -> Classified     -> Resolved
//!                                        -> TransientFault -> (backoff) AwaitingBackend
//!                                        -> ProtocolFault  -> PromptReady | Exhausted
//! ```
//!
//! Transient faults (backend unreachable, busy, garbled) are retried after a
//! fixed backoff for as long as the operator lets the run continue and never
//! touch the retry budget. Protocol faults (a response that is not exactly one
//! of ok/fail) consume one retry each; once the budget is spent the stage
//! resolves `unknown` and the plan moves on.

use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::cancel::{CancelToken, Cancelled};
use crate::core::classifier::{Classification, classify_with_rules};
use crate::core::fold::PartFold;
use crate::core::types::{StageMetrics, StageResult, StageSpec, Verdict};
use crate::io::backend::{Backend, BackendError, GenerateRequest, GenerateResponse};
use crate::io::config::{OUTPUT_LIMIT_OPTION, PatchevalConfig};
use crate::io::prompt::{PromptParams, PromptRenderer, render_repair};
use crate::io::trace::{TraceEntry, TraceSink};

const SEED_KEY: &str = "seed";

/// Retry policy shared by every stage of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorSettings {
    /// Protocol faults tolerated before the stage is exhausted.
    pub max_retries: u32,
    /// Pause after a transient fault.
    pub backoff: Duration,
    /// Added to `num_predict` per protocol retry.
    pub widen_output_step: Option<u64>,
    pub widen_output_max: Option<u64>,
}

impl ExecutorSettings {
    pub fn from_config(cfg: &PatchevalConfig) -> Self {
        Self {
            max_retries: cfg.retry.max_retries,
            backoff: cfg.backend.backoff(),
            widen_output_step: cfg.retry.widen_output_step,
            widen_output_max: cfg.retry.widen_output_max,
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from_config(&PatchevalConfig::default())
    }
}

enum State {
    Init,
    PromptReady,
    AwaitingBackend(GenerateRequest),
    Classified {
        verdict: Verdict,
        reply: GenerateResponse,
    },
    TransientFault {
        request: GenerateRequest,
        reason: String,
    },
    ProtocolFault(GenerateResponse),
    Resolved {
        verdict: Verdict,
        reply: GenerateResponse,
    },
    Exhausted(GenerateResponse),
}

/// Mutable bookkeeping carried across the states of one stage.
struct Cycle {
    prompt: String,
    options: Map<String, Value>,
    attempts: u32,
    retries: u32,
    prompt_bytes: usize,
    response_bytes: usize,
}

pub struct StageExecutor<'a, B: Backend + ?Sized> {
    backend: &'a B,
    renderer: &'a PromptRenderer,
    settings: &'a ExecutorSettings,
    cancel: &'a CancelToken,
}

impl<'a, B: Backend + ?Sized> StageExecutor<'a, B> {
    pub fn new(
        backend: &'a B,
        renderer: &'a PromptRenderer,
        settings: &'a ExecutorSettings,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            backend,
            renderer,
            settings,
            cancel,
        }
    }

    /// Drive `spec` to a [`StageResult`].
    ///
    /// Errors are fatal to the run: operator cancellation ([`Cancelled`]),
    /// a backend rejection, a template failure, or a trace write failure.
    #[instrument(skip_all, fields(commit = params.commit, stage = %spec.name))]
    pub fn execute(
        &self,
        spec: &StageSpec,
        params: &PromptParams<'_>,
        trace: &mut dyn TraceSink,
    ) -> Result<StageResult> {
        let started = Instant::now();
        let mut cycle = Cycle {
            prompt: String::new(),
            options: spec.params.options.clone(),
            attempts: 0,
            retries: 0,
            prompt_bytes: 0,
            response_bytes: 0,
        };
        let mut state = State::Init;

        loop {
            state = match state {
                State::Init => {
                    cycle.prompt = self.renderer.render(&spec.name, params)?;
                    State::PromptReady
                }
                State::PromptReady => State::AwaitingBackend(GenerateRequest {
                    model: spec.params.model.clone(),
                    prompt: cycle.prompt.clone(),
                    options: cycle.options.clone(),
                    stream: false,
                }),
                State::AwaitingBackend(request) => {
                    self.cancel.check()?;
                    cycle.attempts += 1;
                    match self.backend.generate(&request, self.cancel) {
                        Ok(reply) => {
                            cycle.prompt_bytes += request.prompt.len();
                            cycle.response_bytes += reply.response.len();
                            let verdict = match &spec.rules {
                                None => Some(Verdict::Unknown),
                                Some(rules) => match classify_with_rules(&reply.response, rules) {
                                    Classification::Ok => Some(Verdict::Ok),
                                    Classification::Fail => Some(Verdict::Fail),
                                    Classification::Ambiguous => None,
                                },
                            };
                            let note = match verdict {
                                None => "ambiguous",
                                Some(_) if !spec.is_classifying() => "free text",
                                Some(verdict) => verdict.as_str(),
                            };
                            trace.record(&TraceEntry {
                                commit: params.commit.to_string(),
                                stage: spec.name.clone(),
                                attempt: cycle.attempts,
                                prompt: request.prompt.clone(),
                                response: Some(reply.response.clone()),
                                note: note.to_string(),
                            })?;
                            match verdict {
                                Some(verdict) => State::Classified { verdict, reply },
                                None => State::ProtocolFault(reply),
                            }
                        }
                        Err(BackendError::Transient(reason)) => {
                            trace.record(&TraceEntry {
                                commit: params.commit.to_string(),
                                stage: spec.name.clone(),
                                attempt: cycle.attempts,
                                prompt: request.prompt.clone(),
                                response: None,
                                note: format!("transient: {reason}"),
                            })?;
                            State::TransientFault { request, reason }
                        }
                        Err(BackendError::Cancelled) => return Err(Cancelled.into()),
                        Err(err) => {
                            trace.record(&TraceEntry {
                                commit: params.commit.to_string(),
                                stage: spec.name.clone(),
                                attempt: cycle.attempts,
                                prompt: request.prompt.clone(),
                                response: None,
                                note: format!("rejected: {err}"),
                            })?;
                            return Err(
                                anyhow::Error::new(err).context(format!("stage '{}'", spec.name))
                            );
                        }
                    }
                }
                State::TransientFault { request, reason } => {
                    warn!(
                        attempt = cycle.attempts,
                        backoff_ms = self.settings.backoff.as_millis() as u64,
                        %reason,
                        "backend unavailable, retrying"
                    );
                    self.cancel.sleep(self.settings.backoff)?;
                    State::AwaitingBackend(request)
                }
                State::ProtocolFault(reply) => {
                    cycle.retries += 1;
                    if cycle.retries >= self.settings.max_retries {
                        State::Exhausted(reply)
                    } else {
                        debug!(retry = cycle.retries, "ambiguous response, repairing");
                        let repair = render_repair(
                            &spec.repair_prompt,
                            cycle.retries,
                            self.settings.max_retries,
                        )?;
                        cycle.prompt = format!(
                            "{}\n\n{}\n\n{}",
                            cycle.prompt,
                            reply.response.trim_end(),
                            repair
                        );
                        self.perturb(&spec.params.options, &mut cycle);
                        State::PromptReady
                    }
                }
                State::Classified { verdict, reply } => State::Resolved { verdict, reply },
                State::Resolved { verdict, reply } => {
                    let contribution = if spec.is_classifying() {
                        let mut fold = PartFold::new(spec.policy);
                        fold.push(verdict == Verdict::Ok);
                        fold.value()
                    } else {
                        PartFold::new(spec.policy).value()
                    };
                    return Ok(finish(spec, verdict, Some(contribution), reply, &cycle, started));
                }
                State::Exhausted(reply) => {
                    info!(retries = cycle.retries, "retries exhausted, verdict unknown");
                    return Ok(finish(spec, Verdict::Unknown, None, reply, &cycle, started));
                }
            };
        }
    }

    /// Shift the seed and optionally widen the output budget for the next
    /// attempt, relative to the stage's configured options.
    fn perturb(&self, base: &Map<String, Value>, cycle: &mut Cycle) {
        let retries = u64::from(cycle.retries);
        let seed = base.get(SEED_KEY).and_then(Value::as_i64).unwrap_or(0);
        cycle
            .options
            .insert(SEED_KEY.to_string(), Value::from(seed + retries as i64));

        let Some(step) = self.settings.widen_output_step else {
            return;
        };
        let Some(limit) = base.get(OUTPUT_LIMIT_OPTION).and_then(Value::as_u64) else {
            return;
        };
        let mut widened = limit.saturating_add(step.saturating_mul(retries));
        if let Some(max) = self.settings.widen_output_max {
            widened = widened.min(max.max(limit));
        }
        cycle
            .options
            .insert(OUTPUT_LIMIT_OPTION.to_string(), Value::from(widened));
    }
}

fn finish(
    spec: &StageSpec,
    verdict: Verdict,
    contribution: Option<bool>,
    reply: GenerateResponse,
    cycle: &Cycle,
    started: Instant,
) -> StageResult {
    StageResult {
        stage: spec.name.clone(),
        verdict,
        classifying: spec.is_classifying(),
        contribution,
        metrics: StageMetrics {
            prompt_bytes: cycle.prompt_bytes,
            response_bytes: cycle.response_bytes,
            prompt_tokens: reply.prompt_eval_count,
            response_tokens: reply.eval_count,
            prompt_tokens_per_sec: rate(reply.prompt_eval_count, reply.prompt_eval_duration),
            response_tokens_per_sec: rate(reply.eval_count, reply.eval_duration),
            elapsed: started.elapsed(),
        },
        response: reply.response,
        retries: cycle.retries,
    }
}

/// Tokens per second from a count and a nanosecond duration.
fn rate(count: Option<u64>, duration_ns: Option<u64>) -> Option<f64> {
    match (count, duration_ns) {
        (Some(count), Some(ns)) if ns > 0 => Some(count as f64 / (ns as f64 / 1e9)),
        _ => None,
    }
}
