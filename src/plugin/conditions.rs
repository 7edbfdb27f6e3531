//! Applicability matching of plugin conditions.

use std::collections::HashSet;

use crate::hooks::HookTarget;
use crate::plugin::config::PluginCondition;
use crate::plugin::schema::{GlobalContext, MatchedCondition};

/// Outcome of matching a plugin's conditions against one call.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionMatch {
    /// The plugin declares no conditions.
    Unconditional,
    /// The first matching condition.
    Matched(MatchedCondition),
    /// No condition matched; the plugin is skipped.
    Skipped,
}

impl ConditionMatch {
    pub fn applies(&self) -> bool {
        !matches!(self, ConditionMatch::Skipped)
    }
}

/// Conditions are OR-ed; the first match wins.
pub fn match_conditions(
    conditions: &[PluginCondition],
    target: HookTarget<'_>,
    context: &GlobalContext,
) -> ConditionMatch {
    if conditions.is_empty() {
        return ConditionMatch::Unconditional;
    }

    conditions
        .iter()
        .enumerate()
        .find(|(_, condition)| condition_matches(condition, target, context))
        .map(|(index, condition)| {
            ConditionMatch::Matched(MatchedCondition {
                index,
                context: condition.context.clone(),
                extensions: condition.extensions.clone(),
            })
        })
        .unwrap_or(ConditionMatch::Skipped)
}

/// Every field present in the condition must match.
pub fn condition_matches(
    condition: &PluginCondition,
    target: HookTarget<'_>,
    context: &GlobalContext,
) -> bool {
    if !optional_member(&condition.server_ids, context.server_id.as_deref()) {
        return false;
    }
    if !optional_member(&condition.tenant_ids, context.tenant_id.as_deref()) {
        return false;
    }

    if let Some(patterns) = &condition.user_patterns {
        let Some(user) = context.user.as_deref() else {
            return false;
        };
        if !patterns.iter().any(|pattern| user.contains(pattern.as_str())) {
            return false;
        }
    }

    if let Some(tags) = &condition.tags {
        if !context.tags.iter().any(|tag| tags.contains(tag)) {
            return false;
        }
    }

    match target {
        HookTarget::Tool(name) => optional_member(&condition.tools, Some(name)),
        HookTarget::Prompt(name) => optional_member(&condition.prompts, Some(name)),
        HookTarget::Resource(uri) => optional_member(&condition.resources, Some(uri)),
        HookTarget::Agent(id) => optional_member(&condition.agents, Some(id)),
        HookTarget::None => true,
    }
}

fn optional_member(set: &Option<HashSet<String>>, value: Option<&str>) -> bool {
    match (set, value) {
        (None, _) => true,
        (Some(set), Some(value)) => set.contains(value),
        (Some(_), None) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(values: &[&str]) -> Option<HashSet<String>> {
        Some(values.iter().map(|v| v.to_string()).collect())
    }

    #[test]
    fn test_no_conditions_is_unconditional() {
        let ctx = GlobalContext::new("1");
        assert_eq!(
            match_conditions(&[], HookTarget::Tool("x"), &ctx),
            ConditionMatch::Unconditional
        );
    }

    #[test]
    fn test_target_names_match_per_family() {
        let condition = PluginCondition {
            tools: set(&["calc"]),
            ..Default::default()
        };
        let ctx = GlobalContext::new("1");
        assert!(condition_matches(&condition, HookTarget::Tool("calc"), &ctx));
        assert!(!condition_matches(&condition, HookTarget::Tool("shell"), &ctx));
        // A tool filter does not restrict prompt hooks.
        assert!(condition_matches(&condition, HookTarget::Prompt("greet"), &ctx));
    }

    #[test]
    fn test_server_and_tenant_scoping() {
        let condition = PluginCondition {
            server_ids: set(&["prod"]),
            tenant_ids: set(&["acme"]),
            ..Default::default()
        };
        let ctx = GlobalContext::new("1")
            .with_server_id("prod")
            .with_tenant_id("acme");
        assert!(condition_matches(&condition, HookTarget::None, &ctx));

        let ctx = GlobalContext::new("1").with_server_id("prod");
        assert!(!condition_matches(&condition, HookTarget::None, &ctx));
    }

    #[test]
    fn test_user_patterns_are_substrings() {
        let condition = PluginCondition {
            user_patterns: Some(vec!["@example.com".into()]),
            ..Default::default()
        };
        let ctx = GlobalContext::new("1").with_user("alice@example.com");
        assert!(condition_matches(&condition, HookTarget::None, &ctx));
        let ctx = GlobalContext::new("1").with_user("bob@other.org");
        assert!(!condition_matches(&condition, HookTarget::None, &ctx));
        let ctx = GlobalContext::new("1");
        assert!(!condition_matches(&condition, HookTarget::None, &ctx));
    }

    #[test]
    fn test_tags_overlap() {
        let condition = PluginCondition {
            tags: set(&["pii"]),
            ..Default::default()
        };
        let ctx = GlobalContext::new("1").with_tags(["finance", "pii"]);
        assert!(condition_matches(&condition, HookTarget::None, &ctx));
        let ctx = GlobalContext::new("1").with_tags(["finance"]);
        assert!(!condition_matches(&condition, HookTarget::None, &ctx));
    }

    #[test]
    fn test_first_matching_condition_is_reported() {
        let conditions = vec![
            PluginCondition {
                tools: set(&["a"]),
                ..Default::default()
            },
            PluginCondition {
                tools: set(&["b"]),
                context: vec!["policy".into()],
                extensions: Some(serde_json::json!({"route": "strict"})),
                ..Default::default()
            },
        ];
        let ctx = GlobalContext::new("1");
        match match_conditions(&conditions, HookTarget::Tool("b"), &ctx) {
            ConditionMatch::Matched(matched) => {
                assert_eq!(matched.index, 1);
                assert_eq!(matched.context, vec!["policy".to_string()]);
                assert_eq!(matched.extensions.unwrap()["route"], "strict");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            match_conditions(&conditions, HookTarget::Tool("c"), &ctx),
            ConditionMatch::Skipped
        );
    }
}
