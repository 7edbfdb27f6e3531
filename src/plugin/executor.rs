//! Sequential chain execution.
//!
//! Plugins run strictly one after another: each sees the payload as left by
//! the previous one. Chains of different requests run concurrently.

use serde_json::{json, Map, Value};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::{GatewayError, PluginError, PluginViolationError};
use crate::hooks::Hook;
use crate::plugin::base::PluginRef;
use crate::plugin::conditions::{match_conditions, ConditionMatch};
use crate::plugin::config::PluginMode;
use crate::plugin::schema::{
    GlobalContext, PluginContext, PluginContextTable, PluginResult, PluginViolation,
};

/// Metadata key listing metadata keys written by more than one plugin.
pub const COLLISIONS_KEY: &str = "_collisions";
/// Metadata key listing violations downgraded by permissive plugins.
pub const VIOLATIONS_KEY: &str = "_violations";

#[derive(Debug, Clone)]
pub struct PluginExecutor {
    timeout: Duration,
    fail_on_plugin_error: bool,
}

impl PluginExecutor {
    pub fn new(timeout: Duration, fail_on_plugin_error: bool) -> Self {
        Self {
            timeout,
            fail_on_plugin_error,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs `plugins` (already sorted by priority) over `payload`.
    ///
    /// Returns the merged result and the local context of every plugin that
    /// ran, keyed by plugin name. Writes to the shared global state are
    /// applied to `global_context`.
    pub async fn execute<H: Hook>(
        &self,
        plugins: &[PluginRef],
        payload: H::Payload,
        global_context: &mut GlobalContext,
        local_contexts: Option<&PluginContextTable>,
        violations_as_exceptions: bool,
    ) -> Result<(PluginResult<H::Payload>, PluginContextTable), GatewayError> {
        let hook = H::hook_type();
        let mut current = payload;
        let mut modified = false;
        let mut metadata = Map::new();
        let mut outbound = PluginContextTable::new();

        for plugin in plugins {
            if plugin.mode() == PluginMode::Disabled {
                continue;
            }

            let matched = match_conditions(plugin.conditions(), H::target(&current), global_context);
            if !matched.applies() {
                debug!(plugin = plugin.name(), hook = %hook, "Conditions not met, skipping plugin");
                continue;
            }

            let mut context = match local_contexts.and_then(|t| t.get(plugin.name())) {
                Some(previous) => PluginContext {
                    state: previous.state.clone(),
                    global_context: global_context.clone(),
                    metadata: previous.metadata.clone(),
                    matched_condition: None,
                },
                None => PluginContext::new(global_context.clone()),
            };
            if let ConditionMatch::Matched(condition) = matched {
                context.matched_condition = Some(condition);
            }

            let outcome = self
                .execute_plugin::<H>(plugin, current.clone(), &mut context)
                .await;

            global_context.state = context.global_context.state.clone();
            outbound.insert(plugin.name().to_string(), context);

            let result = match outcome {
                Ok(result) => result,
                Err(err) => {
                    let err = attribute_error(err, plugin.name());
                    if plugin.mode().fails_on_error() || self.fail_on_plugin_error {
                        error!(plugin = plugin.name(), hook = %hook, "Plugin failed: {}", err);
                        return Err(err.into());
                    }
                    warn!(
                        plugin = plugin.name(),
                        hook = %hook,
                        "Plugin failed, continuing: {}",
                        err
                    );
                    continue;
                }
            };

            merge_metadata(&mut metadata, plugin.name(), result.metadata);

            if let Some(replacement) = result.modified_payload {
                current = replacement;
                modified = true;
            }

            if result.continue_processing {
                continue;
            }

            let violation = result.violation.map(|mut v| {
                v.plugin_name = plugin.name().to_string();
                v
            });

            if plugin.mode().blocks_on_violation() {
                info!(
                    plugin = plugin.name(),
                    hook = %hook,
                    code = violation.as_ref().map(|v| v.code.as_str()).unwrap_or_default(),
                    "Chain stopped by plugin"
                );
                if violations_as_exceptions {
                    if let Some(violation) = violation {
                        return Err(PluginViolationError::new(violation).into());
                    }
                }
                let blocked = PluginResult {
                    continue_processing: false,
                    modified_payload: modified.then_some(current),
                    violation,
                    metadata,
                };
                return Ok((blocked, outbound));
            }

            warn!(
                plugin = plugin.name(),
                hook = %hook,
                "Permissive plugin reported a violation, continuing"
            );
            if let Some(violation) = violation {
                record_violation(&mut metadata, violation);
            }
        }

        let result = PluginResult {
            continue_processing: true,
            modified_payload: modified.then_some(current),
            violation: None,
            metadata,
        };
        Ok((result, outbound))
    }

    /// Invokes one plugin under its timeout.
    pub async fn execute_plugin<H: Hook>(
        &self,
        plugin: &PluginRef,
        payload: H::Payload,
        context: &mut PluginContext,
    ) -> Result<PluginResult<H::Payload>, PluginError> {
        let timeout = plugin
            .config()
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.timeout);

        let span = info_span!(
            "plugin_execution",
            plugin = %plugin.name(),
            hook = %H::hook_type(),
            request_id = %context.global_context.request_id,
        );

        async move {
            let start = Instant::now();
            let outcome =
                tokio::time::timeout(timeout, H::invoke(plugin.plugin(), payload, context)).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            match outcome {
                Ok(Ok(result)) => {
                    debug!(
                        duration_ms,
                        continue_processing = result.continue_processing,
                        modified = result.modified_payload.is_some(),
                        has_violation = result.violation.is_some(),
                        "Plugin execution succeeded"
                    );
                    Ok(result)
                }
                Ok(Err(e)) => {
                    debug!(duration_ms, "Plugin execution failed: {}", e);
                    Err(e)
                }
                Err(_) => {
                    warn!(timeout_ms = timeout.as_millis() as u64, "Plugin execution timed out");
                    Err(PluginError::Timeout {
                        plugin_name: plugin.name().to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// Makes sure an error names the plugin it came from.
fn attribute_error(err: PluginError, plugin_name: &str) -> PluginError {
    match err {
        PluginError::Plugin { mut error } if error.plugin_name.is_empty() => {
            error.plugin_name = plugin_name.to_string();
            PluginError::Plugin { error }
        }
        PluginError::Hook(source) => PluginError::new(plugin_name, source.to_string()),
        other => other,
    }
}

/// Adds `incoming` to `acc`. A key already holding a different value keeps
/// the first value; the later one is listed under [`COLLISIONS_KEY`].
pub fn merge_metadata(acc: &mut Map<String, Value>, plugin_name: &str, incoming: Map<String, Value>) {
    for (key, value) in incoming {
        match acc.get(&key) {
            None => {
                acc.insert(key, value);
            }
            Some(existing) if *existing == value => {}
            Some(_) => {
                debug!(plugin = plugin_name, key = %key, "Metadata key collision");
                push_entry(
                    acc,
                    COLLISIONS_KEY,
                    json!({"key": key, "plugin": plugin_name, "value": value}),
                );
            }
        }
    }
}

fn record_violation(acc: &mut Map<String, Value>, violation: PluginViolation) {
    let value = serde_json::to_value(&violation).unwrap_or_else(|_| json!({"code": violation.code}));
    push_entry(acc, VIOLATIONS_KEY, value);
}

fn push_entry(acc: &mut Map<String, Value>, key: &str, value: Value) {
    let slot = acc
        .entry(key.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    match slot {
        Value::Array(items) => items.push(value),
        other => {
            let previous = other.take();
            *other = json!([previous, value]);
        }
    }
}
