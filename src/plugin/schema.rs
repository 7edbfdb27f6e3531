//! Request contexts and the result/violation shapes exchanged with plugins.
//!
//! Everything here is serializable because external plugins receive and
//! return these structures as JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Per-request context shared by every plugin in a chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalContext {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Mutable state visible to every plugin of the request. Later writers win.
    #[serde(default)]
    pub state: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl GlobalContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ..Default::default()
        }
    }

    /// A context with a freshly generated request id.
    pub fn generate() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }

    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// The condition that selected a plugin for the current call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchedCondition {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

/// Context handed to one plugin for one hook call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginContext {
    /// Plugin local state, carried between paired pre and post hooks.
    #[serde(default)]
    pub state: Map<String, Value>,
    pub global_context: GlobalContext,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_condition: Option<MatchedCondition>,
}

impl PluginContext {
    pub fn new(global_context: GlobalContext) -> Self {
        Self {
            global_context,
            ..Default::default()
        }
    }

    pub fn get_state(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    pub fn set_state(&mut self, key: impl Into<String>, value: Value) {
        self.state.insert(key.into(), value);
    }

    /// True when nothing was written to any of the mutable maps.
    pub fn is_empty(&self) -> bool {
        self.state.is_empty() && self.metadata.is_empty() && self.global_context.state.is_empty()
    }

    /// Global state entries named by the matched condition's `context` keys.
    pub fn exposed_context(&self) -> Map<String, Value> {
        let Some(matched) = &self.matched_condition else {
            return Map::new();
        };
        matched
            .context
            .iter()
            .filter_map(|key| {
                self.global_context
                    .state
                    .get(key)
                    .map(|value| (key.clone(), value.clone()))
            })
            .collect()
    }
}

/// Local contexts of one chain run, keyed by plugin name.
pub type PluginContextTable = HashMap<String, PluginContext>;

/// A policy denial reported by a plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginViolation {
    pub reason: String,
    pub description: String,
    pub code: String,
    #[serde(default)]
    pub details: Map<String, Value>,
    /// Filled in by the manager with the reporting plugin's name.
    #[serde(default)]
    pub plugin_name: String,
}

impl PluginViolation {
    pub fn new(
        reason: impl Into<String>,
        description: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self {
            reason: reason.into(),
            description: description.into(),
            code: code.into(),
            ..Default::default()
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

/// Serializable form of a plugin infrastructure failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginErrorModel {
    pub message: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub details: Map<String, Value>,
    #[serde(default)]
    pub plugin_name: String,
}

impl PluginErrorModel {
    pub fn new(plugin_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            plugin_name: plugin_name.into(),
            ..Default::default()
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }
}

fn default_continue() -> bool {
    true
}

/// Outcome of one hook call, and of a whole chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginResult<T> {
    #[serde(default = "default_continue")]
    pub continue_processing: bool,
    #[serde(default = "Option::default")]
    pub modified_payload: Option<T>,
    #[serde(default)]
    pub violation: Option<PluginViolation>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl<T> Default for PluginResult<T> {
    fn default() -> Self {
        Self {
            continue_processing: true,
            modified_payload: None,
            violation: None,
            metadata: Map::new(),
        }
    }
}

impl<T> PluginResult<T> {
    /// Continue unchanged.
    pub fn pass() -> Self {
        Self::default()
    }

    /// Continue with a replacement payload.
    pub fn modified(payload: T) -> Self {
        Self {
            modified_payload: Some(payload),
            ..Self::default()
        }
    }

    /// Stop the chain with a violation.
    pub fn blocked(violation: PluginViolation) -> Self {
        Self {
            continue_processing: false,
            violation: Some(violation),
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_result_defaults_when_fields_missing() {
        let result: PluginResult<String> = serde_json::from_value(json!({})).unwrap();
        assert!(result.continue_processing);
        assert!(result.modified_payload.is_none());
        assert!(result.violation.is_none());
        assert!(result.metadata.is_empty());
    }

    #[test]
    fn test_context_is_empty() {
        let mut ctx = PluginContext::new(GlobalContext::new("1"));
        assert!(ctx.is_empty());
        ctx.global_context.state.insert("k".into(), json!(1));
        assert!(!ctx.is_empty());
    }

    #[test]
    fn test_exposed_context_only_returns_named_keys() {
        let mut global = GlobalContext::new("1");
        global.state.insert("tenant_policy".into(), json!("strict"));
        global.state.insert("secret".into(), json!("x"));

        let mut ctx = PluginContext::new(global);
        assert!(ctx.exposed_context().is_empty());

        ctx.matched_condition = Some(MatchedCondition {
            index: 0,
            context: vec!["tenant_policy".into(), "missing".into()],
            extensions: None,
        });
        let exposed = ctx.exposed_context();
        assert_eq!(exposed.len(), 1);
        assert_eq!(exposed["tenant_policy"], json!("strict"));
    }
}
