//! Named, reusable chain plans.
//!
//! A skill is a pre-authored `run_chain` plan with its own step budget —
//! grounded on `runner::run_chain`'s step semantics, reused here rather than
//! reimplemented, plus a declarative scope so `plan_skill` can validate a
//! skill's tool ids against a toolset before `run_skill` ever dispatches one.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::BackendManager;
use crate::errors::ToolError;
use crate::registry::ToolRegistry;
use crate::runner::{self, ChainOutcome, ChainStep, NullProgressSink, ProgressSink};

/// Declarative skill definition, as read from `skills:` in config.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SkillSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<ChainStep>,
    #[serde(default)]
    pub toolset: Option<String>,
    #[serde(default)]
    pub max_steps: Option<usize>,
    #[serde(default)]
    pub max_tool_calls: Option<usize>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

pub fn skill_id(name: &str) -> String {
    format!("skill:{}", crate::toolsets::toolset_id(name).trim_start_matches("toolset:"))
}

/// Result of validating a skill's steps against its declared scope, without
/// running anything.
#[derive(Debug, Clone, Serialize)]
pub struct SkillPlan {
    pub id: String,
    pub step_count: usize,
    pub tool_ids: Vec<String>,
}

/// Validate a skill: every step count within `max_steps`, and if a toolset
/// is declared, every step's tool id must be in scope for it.
pub fn plan_skill(
    spec: &SkillSpec,
    toolset: Option<&crate::toolsets::Toolset>,
    catalog: &[crate::registry::ToolEntry],
) -> Result<SkillPlan, ToolError> {
    if let Some(max) = spec.max_steps
        && spec.steps.len() > max
    {
        return Err(ToolError::validation_input(format!(
            "skill '{}' declares {} steps, exceeding max_steps ({max})",
            spec.name,
            spec.steps.len()
        )));
    }

    if let Some(ts) = toolset {
        let in_scope: std::collections::HashSet<&str> = ts
            .filter(catalog)
            .into_iter()
            .map(|e| e.name.as_str())
            .collect();
        for step in &spec.steps {
            if !in_scope.contains(step.tool_id.as_str()) {
                return Err(ToolError::validation_input(format!(
                    "skill '{}' step '{}' references tool '{}' outside toolset '{}'",
                    spec.name, step.step_id, step.tool_id, ts.id
                )));
            }
        }
    }

    Ok(SkillPlan {
        id: skill_id(&spec.name),
        step_count: spec.steps.len(),
        tool_ids: spec.steps.iter().map(|s| s.tool_id.clone()).collect(),
    })
}

/// Run a skill's steps via the shared chain runner, applying its own
/// `max_tool_calls`/`timeout_secs` guards (falling back to the caller's
/// request-level values when the skill declares none).
pub async fn run_skill(
    registry: &Arc<ToolRegistry>,
    manager: &Arc<BackendManager>,
    spec: &SkillSpec,
    max_tool_calls: Option<usize>,
    deadline: Option<Duration>,
    progress: &dyn ProgressSink,
    progress_token: Option<&serde_json::Value>,
) -> ChainOutcome {
    let cap = spec.max_tool_calls.or(max_tool_calls);
    let skill_deadline = spec
        .timeout_secs
        .map(Duration::from_secs)
        .or(deadline);

    runner::run_chain(
        registry,
        manager,
        &spec.steps,
        cap,
        skill_deadline,
        progress,
        progress_token,
    )
    .await
}

/// Convenience for callers that don't need progress reporting.
pub async fn run_skill_simple(
    registry: &Arc<ToolRegistry>,
    manager: &Arc<BackendManager>,
    spec: &SkillSpec,
) -> ChainOutcome {
    run_skill(registry, manager, spec, None, None, &NullProgressSink, None).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(id: &str, tool: &str) -> ChainStep {
        ChainStep {
            step_id: id.to_string(),
            tool_id: tool.to_string(),
            args: json!({}),
            use_previous: false,
        }
    }

    #[test]
    fn test_skill_id_is_namespaced_slug() {
        assert_eq!(skill_id("Daily Report"), "skill:daily-report");
    }

    #[test]
    fn test_plan_skill_rejects_too_many_steps() {
        let spec = SkillSpec {
            name: "x".to_string(),
            description: String::new(),
            steps: vec![step("a", "ns.a"), step("b", "ns.b")],
            toolset: None,
            max_steps: Some(1),
            max_tool_calls: None,
            timeout_secs: None,
        };
        let err = plan_skill(&spec, None, &[]).unwrap_err();
        assert_eq!(err.code, crate::errors::ErrorCode::ValidationInput);
    }

    #[test]
    fn test_plan_skill_rejects_out_of_scope_tool() {
        use crate::registry::ToolEntry;
        use crate::toolsets::{Toolset, ToolsetSpec, ToolsetPolicy};

        let catalog = vec![ToolEntry {
            name: "exa.search".to_string(),
            original_name: "search".to_string(),
            description: String::new(),
            backend_name: "exa".to_string(),
            input_schema: json!({}),
            tags: vec![],
        }];
        let ts = Toolset::from_spec(ToolsetSpec {
            name: "web".to_string(),
            namespaces: vec!["exa".to_string()],
            tags: vec![],
            allow: vec![],
            deny: vec![],
            policy: ToolsetPolicy::DenyAll,
        });

        let spec = SkillSpec {
            name: "cross-scope".to_string(),
            description: String::new(),
            steps: vec![step("a", "tavily.search")],
            toolset: Some("web".to_string()),
            max_steps: None,
            max_tool_calls: None,
            timeout_secs: None,
        };
        let err = plan_skill(&spec, Some(&ts), &catalog).unwrap_err();
        assert_eq!(err.code, crate::errors::ErrorCode::ValidationInput);
    }

    #[test]
    fn test_plan_skill_ok_within_scope() {
        use crate::registry::ToolEntry;
        use crate::toolsets::{Toolset, ToolsetSpec, ToolsetPolicy};

        let catalog = vec![ToolEntry {
            name: "exa.search".to_string(),
            original_name: "search".to_string(),
            description: String::new(),
            backend_name: "exa".to_string(),
            input_schema: json!({}),
            tags: vec![],
        }];
        let ts = Toolset::from_spec(ToolsetSpec {
            name: "web".to_string(),
            namespaces: vec!["exa".to_string()],
            tags: vec![],
            allow: vec![],
            deny: vec![],
            policy: ToolsetPolicy::DenyAll,
        });
        let spec = SkillSpec {
            name: "in-scope".to_string(),
            description: String::new(),
            steps: vec![step("a", "exa.search")],
            toolset: Some("web".to_string()),
            max_steps: None,
            max_tool_calls: None,
            timeout_secs: None,
        };
        let plan = plan_skill(&spec, Some(&ts), &catalog).unwrap();
        assert_eq!(plan.step_count, 1);
    }

    #[tokio::test]
    async fn test_run_skill_uses_own_max_tool_calls() {
        let registry = ToolRegistry::new();
        let manager = BackendManager::new();
        let mock = crate::testutil::MockBackend::new("ns", Duration::from_millis(0));
        crate::testutil::insert_mock(&manager, &registry, &mock).await;

        let spec = SkillSpec {
            name: "capped".to_string(),
            description: String::new(),
            steps: vec![step("a", "ns.echo_tool"), step("b", "ns.echo_tool")],
            toolset: None,
            max_steps: None,
            max_tool_calls: Some(1),
            timeout_secs: None,
        };
        let outcome = run_skill_simple(&registry, &manager, &spec).await;
        assert_eq!(outcome.results.len(), 1);
        assert!(outcome.error.is_some());
    }
}
