//! Per-tool circuit breaker.
//!
//! `tool_pre_invoke` rejects calls while a tool's circuit is open and stamps
//! the call start time into the plugin's local state. `tool_post_invoke`
//! records the outcome, which may open the circuit. One instance serves all
//! requests, so the per-tool windows live in a sharded map.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::error::PluginError;
use crate::hooks::{ToolPostInvokePayload, ToolPreInvokePayload};
use crate::plugin::base::Plugin;
use crate::plugin::config::PluginConfig;
use crate::plugin::schema::{PluginContext, PluginResult, PluginViolation};

pub const CIRCUIT_OPEN_CODE: &str = "CIRCUIT_OPEN";
const CALL_TIME_KEY: &str = "cb_call_time";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    #[serde(default = "default_min_calls")]
    pub min_calls: usize,
    #[serde(default = "default_consecutive_failure_threshold")]
    pub consecutive_failure_threshold: u32,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    #[serde(default)]
    pub tool_overrides: HashMap<String, CircuitBreakerOverride>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            error_rate_threshold: default_error_rate_threshold(),
            window_seconds: default_window_seconds(),
            min_calls: default_min_calls(),
            consecutive_failure_threshold: default_consecutive_failure_threshold(),
            cooldown_seconds: default_cooldown_seconds(),
            tool_overrides: HashMap::new(),
        }
    }
}

fn default_error_rate_threshold() -> f64 {
    0.5
}

fn default_window_seconds() -> u64 {
    60
}

fn default_min_calls() -> usize {
    10
}

fn default_consecutive_failure_threshold() -> u32 {
    5
}

fn default_cooldown_seconds() -> u64 {
    60
}

/// Per-tool replacements for any of the global thresholds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CircuitBreakerOverride {
    pub error_rate_threshold: Option<f64>,
    pub window_seconds: Option<u64>,
    pub min_calls: Option<usize>,
    pub consecutive_failure_threshold: Option<u32>,
    pub cooldown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct Thresholds {
    error_rate: f64,
    window: Duration,
    min_calls: usize,
    consecutive_failures: u32,
    cooldown: Duration,
}

#[derive(Debug, Default)]
struct ToolState {
    /// (completion time, failed)
    outcomes: VecDeque<(Instant, bool)>,
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

impl ToolState {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some((at, _)) = self.outcomes.front() {
            if now.duration_since(*at) > window {
                self.outcomes.pop_front();
            } else {
                break;
            }
        }
    }

    fn failures(&self) -> usize {
        self.outcomes.iter().filter(|(_, failed)| *failed).count()
    }

    fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            0.0
        } else {
            self.failures() as f64 / self.outcomes.len() as f64
        }
    }
}

pub struct CircuitBreakerPlugin {
    config: Arc<PluginConfig>,
    settings: CircuitBreakerConfig,
    tools: DashMap<String, ToolState>,
}

impl CircuitBreakerPlugin {
    pub fn new(config: PluginConfig) -> Result<Self, PluginError> {
        let settings: CircuitBreakerConfig = config.typed_config().map_err(|e| {
            PluginError::new(&config.name, format!("Invalid circuit breaker config: {e}"))
        })?;
        if !(0.0..=1.0).contains(&settings.error_rate_threshold) {
            return Err(PluginError::new(
                &config.name,
                "error_rate_threshold must be between 0 and 1",
            ));
        }
        Ok(Self {
            config: Arc::new(config),
            settings,
            tools: DashMap::new(),
        })
    }

    fn thresholds(&self, tool: &str) -> Thresholds {
        let base = &self.settings;
        let over = self.settings.tool_overrides.get(tool).cloned().unwrap_or_default();
        Thresholds {
            error_rate: over.error_rate_threshold.unwrap_or(base.error_rate_threshold),
            window: Duration::from_secs(over.window_seconds.unwrap_or(base.window_seconds)),
            min_calls: over.min_calls.unwrap_or(base.min_calls),
            consecutive_failures: over
                .consecutive_failure_threshold
                .unwrap_or(base.consecutive_failure_threshold),
            cooldown: Duration::from_secs(over.cooldown_seconds.unwrap_or(base.cooldown_seconds)),
        }
    }

    /// Whether the circuit for `tool` is currently open.
    pub fn is_open(&self, tool: &str) -> bool {
        self.tools
            .get(tool)
            .and_then(|s| s.open_until)
            .is_some_and(|until| Instant::now() < until)
    }
}

#[async_trait]
impl Plugin for CircuitBreakerPlugin {
    fn config(&self) -> Arc<PluginConfig> {
        self.config.clone()
    }

    async fn tool_pre_invoke(
        &self,
        payload: ToolPreInvokePayload,
        context: &mut PluginContext,
    ) -> Result<PluginResult<ToolPreInvokePayload>, PluginError> {
        let now = Instant::now();
        if let Some(mut state) = self.tools.get_mut(&payload.name) {
            match state.open_until {
                Some(until) if now < until => {
                    let retry_after = until.duration_since(now).as_secs_f64().ceil();
                    let violation = PluginViolation::new(
                        "Circuit open",
                        format!("Tool '{}' is temporarily unavailable", payload.name),
                        CIRCUIT_OPEN_CODE,
                    )
                    .with_detail("tool", json!(payload.name))
                    .with_detail("retry_after_seconds", json!(retry_after));
                    return Ok(PluginResult::blocked(violation)
                        .with_metadata("circuit_open", json!(true)));
                }
                Some(_) => {
                    // Cooldown elapsed: let calls through and start a fresh window.
                    state.open_until = None;
                    state.consecutive_failures = 0;
                    state.outcomes.clear();
                }
                None => {}
            }
        }

        let started = Utc::now().timestamp_millis() as f64 / 1000.0;
        context.set_state(CALL_TIME_KEY, json!(started));
        Ok(PluginResult::pass())
    }

    async fn tool_post_invoke(
        &self,
        payload: ToolPostInvokePayload,
        context: &mut PluginContext,
    ) -> Result<PluginResult<ToolPostInvokePayload>, PluginError> {
        let thresholds = self.thresholds(&payload.name);
        let failed = payload.is_error();
        let now = Instant::now();

        let mut state = self.tools.entry(payload.name.clone()).or_default();
        state.prune(now, thresholds.window);
        state.outcomes.push_back((now, failed));
        if failed {
            state.consecutive_failures += 1;
        } else {
            state.consecutive_failures = 0;
        }

        let calls = state.outcomes.len();
        let failure_rate = state.failure_rate();
        let trip_on_rate = calls >= thresholds.min_calls && failure_rate >= thresholds.error_rate;
        let trip_on_streak = state.consecutive_failures >= thresholds.consecutive_failures;
        if failed && (trip_on_rate || trip_on_streak) && state.open_until.is_none() {
            warn!(
                tool = %payload.name,
                failure_rate,
                consecutive_failures = state.consecutive_failures,
                "Opening circuit"
            );
            state.open_until = Some(now + thresholds.cooldown);
        }

        let mut result = PluginResult::pass()
            .with_metadata("circuit_calls_in_window", json!(calls))
            .with_metadata("circuit_failures_in_window", json!(state.failures()))
            .with_metadata("circuit_failure_rate", json!(failure_rate))
            .with_metadata(
                "circuit_consecutive_failures",
                json!(state.consecutive_failures),
            )
            .with_metadata("circuit_open", json!(state.open_until.is_some()));
        drop(state);

        if let Some(started) = context.get_state(CALL_TIME_KEY).and_then(|v| v.as_f64()) {
            let elapsed = Utc::now().timestamp_millis() as f64 / 1000.0 - started;
            result = result.with_metadata("circuit_call_duration_ms", json!((elapsed * 1000.0).max(0.0)));
        }
        Ok(result)
    }
}
