use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::PluginError;
use crate::hooks::{PromptPrehookPayload, ToolPreInvokePayload};
use crate::plugin::base::Plugin;
use crate::plugin::config::PluginConfig;
use crate::plugin::schema::{PluginContext, PluginResult, PluginViolation};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DenyListConfig {
    #[serde(default)]
    pub words: Vec<String>,
}

/// Blocks prompts and tool calls whose arguments contain a denied word.
/// Matching ignores case.
pub struct DenyListPlugin {
    config: Arc<PluginConfig>,
    words: Vec<String>,
}

impl DenyListPlugin {
    pub fn new(config: PluginConfig) -> Result<Self, PluginError> {
        let typed: DenyListConfig = config.typed_config().map_err(|e| {
            PluginError::new(&config.name, format!("Invalid deny list config: {e}"))
        })?;
        Ok(Self {
            words: typed.words.iter().map(|w| w.to_lowercase()).collect(),
            config: Arc::new(config),
        })
    }

    fn find_word(&self, text: &str) -> Option<&str> {
        let text = text.to_lowercase();
        self.words
            .iter()
            .find(|word| text.contains(word.as_str()))
            .map(String::as_str)
    }

    fn find_in_value(&self, value: &Value) -> Option<&str> {
        match value {
            Value::String(s) => self.find_word(s),
            Value::Array(items) => items.iter().find_map(|v| self.find_in_value(v)),
            Value::Object(map) => map.values().find_map(|v| self.find_in_value(v)),
            _ => None,
        }
    }

    fn violation(&self, what: &str, word: &str, arg: &str) -> PluginViolation {
        PluginViolation::new(
            format!("{what} not allowed"),
            format!("A deny word was found in argument '{arg}'"),
            "deny",
        )
        .with_detail("word", json!(word))
        .with_detail("argument", json!(arg))
    }
}

#[async_trait]
impl Plugin for DenyListPlugin {
    fn config(&self) -> Arc<PluginConfig> {
        self.config.clone()
    }

    async fn prompt_pre_fetch(
        &self,
        payload: PromptPrehookPayload,
        _context: &mut PluginContext,
    ) -> Result<PluginResult<PromptPrehookPayload>, PluginError> {
        for (arg, value) in &payload.args {
            if let Some(word) = self.find_word(value) {
                return Ok(PluginResult::blocked(self.violation("Prompt", word, arg)));
            }
        }
        Ok(PluginResult::pass())
    }

    async fn tool_pre_invoke(
        &self,
        payload: ToolPreInvokePayload,
        _context: &mut PluginContext,
    ) -> Result<PluginResult<ToolPreInvokePayload>, PluginError> {
        for (arg, value) in &payload.args {
            if let Some(word) = self.find_in_value(value) {
                return Ok(PluginResult::blocked(self.violation("Tool call", word, arg)));
            }
        }
        Ok(PluginResult::pass())
    }
}
