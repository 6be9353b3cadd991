use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{Provider, ProviderContext, ProviderRequest, ProviderResponse, ToolDescriptor};
use crate::errors::ToolError;
use crate::runner::{self, ChainStep, NullProgressSink};
use crate::tools::discovery;

pub fn all() -> Vec<Arc<dyn Provider>> {
    vec![
        Arc::new(SearchToolsProvider),
        Arc::new(ListToolsProvider),
        Arc::new(ListNamespacesProvider),
        Arc::new(DescribeToolProvider),
        Arc::new(ListToolExamplesProvider),
        Arc::new(RunToolProvider),
        Arc::new(RunChainProvider),
        Arc::new(ExecuteCodeProvider),
        Arc::new(ListToolsetsProvider),
        Arc::new(ListSkillsProvider),
        Arc::new(PlanSkillProvider),
        Arc::new(RunSkillProvider),
    ]
}

fn str_arg(args: &Value, key: &str) -> Result<String, ToolError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| ToolError::validation_input(format!("missing required argument '{key}'")))
}

fn opt_str_arg(args: &Value, key: &str) -> Option<String> {
    args.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn u32_arg(args: &Value, key: &str, default: u32) -> u32 {
    args.get(key).and_then(|v| v.as_u64()).map(|v| v as u32).unwrap_or(default)
}

pub struct SearchToolsProvider;

#[async_trait]
impl Provider for SearchToolsProvider {
    fn name(&self) -> &str {
        "search_tools"
    }

    fn tool(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: "Search the tool catalog with a natural-language query, paginated with an opaque cursor.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Natural language description of the task."},
                    "limit": {"type": "integer", "description": "Max results per page (default 20, capped at 100)."},
                    "cursor": {"type": "string", "description": "Opaque cursor from a previous page."}
                },
                "required": ["query"]
            }),
        }
    }

    async fn handle(&self, ctx: &ProviderContext, req: ProviderRequest) -> Result<ProviderResponse, ToolError> {
        let query = str_arg(&req.args, "query")?;
        let limit = u32_arg(&req.args, "limit", crate::registry::DEFAULT_PAGE_LIMIT);
        let cursor = opt_str_arg(&req.args, "cursor");
        let (results, next_cursor) = discovery::handle_search_page(&ctx.registry, &query, limit, cursor.as_deref())?;
        let value = json!({"results": results, "next_cursor": next_cursor});
        Ok(ProviderResponse { structured: Some(value.clone()), result: value })
    }
}

pub struct ListToolsProvider;

#[async_trait]
impl Provider for ListToolsProvider {
    fn name(&self) -> &str {
        "list_tools"
    }

    fn tool(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: "List every registered tool id, paginated with an opaque cursor.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "limit": {"type": "integer"},
                    "cursor": {"type": "string"}
                }
            }),
        }
    }

    async fn handle(&self, ctx: &ProviderContext, req: ProviderRequest) -> Result<ProviderResponse, ToolError> {
        let limit = u32_arg(&req.args, "limit", crate::registry::DEFAULT_PAGE_LIMIT);
        let cursor = opt_str_arg(&req.args, "cursor");
        let (names, next_cursor) = discovery::handle_list_paginated(&ctx.registry, cursor.as_deref(), limit)?;
        let value = json!({"tools": names, "next_cursor": next_cursor});
        Ok(ProviderResponse { structured: Some(value.clone()), result: value })
    }
}

pub struct ListNamespacesProvider;

#[async_trait]
impl Provider for ListNamespacesProvider {
    fn name(&self) -> &str {
        "list_namespaces"
    }

    fn tool(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: "List the backend namespaces currently registered.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "limit": {"type": "integer"},
                    "offset": {"type": "integer"}
                }
            }),
        }
    }

    async fn handle(&self, ctx: &ProviderContext, req: ProviderRequest) -> Result<ProviderResponse, ToolError> {
        let limit = u32_arg(&req.args, "limit", 50);
        let offset = req.args.get("offset").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
        let (namespaces, has_more) = ctx.registry.list_namespaces_page(limit, offset);
        let value = json!({"namespaces": namespaces, "has_more": has_more});
        Ok(ProviderResponse { structured: Some(value.clone()), result: value })
    }
}

pub struct DescribeToolProvider;

#[async_trait]
impl Provider for DescribeToolProvider {
    fn name(&self) -> &str {
        "describe_tool"
    }

    fn tool(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: "Get the full description and input schema for one tool.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {"tool_id": {"type": "string"}},
                "required": ["tool_id"]
            }),
        }
    }

    async fn handle(&self, ctx: &ProviderContext, req: ProviderRequest) -> Result<ProviderResponse, ToolError> {
        let tool_id = str_arg(&req.args, "tool_id")?;
        let info = discovery::handle_tool_info(&ctx.registry, &tool_id)
            .ok_or_else(|| ToolError::tool_not_found(&tool_id))?;
        let value = serde_json::to_value(&info).map_err(|e| ToolError::internal(e.to_string()))?;
        Ok(ProviderResponse { structured: Some(value.clone()), result: value })
    }
}

pub struct ListToolExamplesProvider;

#[async_trait]
impl Provider for ListToolExamplesProvider {
    fn name(&self) -> &str {
        "list_tool_examples"
    }

    fn tool(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: "Get synthesized call examples for one tool, derived from its input schema.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {"tool_id": {"type": "string"}},
                "required": ["tool_id"]
            }),
        }
    }

    async fn handle(&self, ctx: &ProviderContext, req: ProviderRequest) -> Result<ProviderResponse, ToolError> {
        let tool_id = str_arg(&req.args, "tool_id")?;
        let examples = discovery::handle_list_tool_examples(&ctx.registry, &tool_id)
            .ok_or_else(|| ToolError::tool_not_found(&tool_id))?;
        let value = serde_json::to_value(&examples).map_err(|e| ToolError::internal(e.to_string()))?;
        Ok(ProviderResponse { structured: Some(value.clone()), result: value })
    }
}

pub struct RunToolProvider;

#[async_trait]
impl Provider for RunToolProvider {
    fn name(&self) -> &str {
        "run_tool"
    }

    fn tool(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: "Invoke a single registered tool by id.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "tool_id": {"type": "string"},
                    "args": {"type": "object"},
                    "backend_override": {"type": "string"},
                    "timeout_ms": {"type": "integer"}
                },
                "required": ["tool_id"]
            }),
        }
    }

    async fn handle(&self, ctx: &ProviderContext, req: ProviderRequest) -> Result<ProviderResponse, ToolError> {
        let tool_id = str_arg(&req.args, "tool_id")?;
        let args = req.args.get("args").cloned().unwrap_or(Value::Null);
        let backend_override = opt_str_arg(&req.args, "backend_override");
        let deadline = req
            .args
            .get("timeout_ms")
            .and_then(|v| v.as_u64())
            .map(std::time::Duration::from_millis);

        let outcome = runner::run_tool(
            &ctx.registry,
            &ctx.manager,
            &tool_id,
            args,
            backend_override.as_deref(),
            deadline,
            &NullProgressSink,
            req.progress_token.as_ref(),
        )
        .await?;

        Ok(ProviderResponse {
            structured: outcome.structured,
            result: outcome.result,
        })
    }
}

fn parse_steps(args: &Value) -> Result<Vec<ChainStep>, ToolError> {
    let steps = args
        .get("steps")
        .ok_or_else(|| ToolError::validation_input("missing required argument 'steps'"))?;
    serde_json::from_value(steps.clone())
        .map_err(|e| ToolError::validation_input(format!("invalid 'steps': {e}")))
}

pub struct RunChainProvider;

#[async_trait]
impl Provider for RunChainProvider {
    fn name(&self) -> &str {
        "run_chain"
    }

    fn tool(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: "Run a sequence of tool calls, optionally merging each step's output into the next.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "steps": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "step_id": {"type": "string"},
                                "tool_id": {"type": "string"},
                                "args": {"type": "object"},
                                "use_previous": {"type": "boolean"}
                            },
                            "required": ["step_id", "tool_id"]
                        }
                    },
                    "max_tool_calls": {"type": "integer"}
                },
                "required": ["steps"]
            }),
        }
    }

    async fn handle(&self, ctx: &ProviderContext, req: ProviderRequest) -> Result<ProviderResponse, ToolError> {
        let steps = parse_steps(&req.args)?;
        let max_tool_calls = req.args.get("max_tool_calls").and_then(|v| v.as_u64()).map(|v| v as usize);

        let outcome = runner::run_chain(
            &ctx.registry,
            &ctx.manager,
            &steps,
            max_tool_calls,
            None,
            &NullProgressSink,
            req.progress_token.as_ref(),
        )
        .await;

        let value = json!({
            "results": outcome.results,
            "error": outcome.error.as_ref().map(|e| serde_json::to_value(e).unwrap_or(Value::Null)),
        });

        match outcome.error {
            Some(e) => Err(e.with_op("run_chain")),
            None => Ok(ProviderResponse { structured: Some(value.clone()), result: value }),
        }
    }
}

pub struct ExecuteCodeProvider;

#[async_trait]
impl Provider for ExecuteCodeProvider {
    fn name(&self) -> &str {
        "execute_code"
    }

    fn enabled(&self, ctx: &ProviderContext) -> bool {
        ctx.sandbox_enabled
    }

    fn tool(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: "Execute TypeScript code with direct access to every registered tool as a hierarchical function.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "code": {"type": "string"},
                    "timeout_ms": {"type": "integer"},
                    "max_output_size": {"type": "integer"}
                },
                "required": ["code"]
            }),
        }
    }

    async fn handle(&self, ctx: &ProviderContext, req: ProviderRequest) -> Result<ProviderResponse, ToolError> {
        let code = str_arg(&req.args, "code")?;
        let timeout = req.args.get("timeout_ms").and_then(|v| v.as_u64());
        let max_output_size = req.args.get("max_output_size").and_then(|v| v.as_u64()).map(|v| v as usize);

        let output = crate::tools::sandbox::handle_call_tool_chain(
            &ctx.registry,
            &ctx.manager,
            &code,
            timeout,
            max_output_size,
            &ctx.sandbox_semaphore,
        )
        .await
        .map_err(|e| ToolError::execution_failed(e.to_string()))?;

        Ok(ProviderResponse {
            structured: None,
            result: Value::String(output),
        })
    }
}

pub struct ListToolsetsProvider;

#[async_trait]
impl Provider for ListToolsetsProvider {
    fn name(&self) -> &str {
        "list_toolsets"
    }

    fn tool(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: "List the configured toolsets and how many catalog tools each currently matches.".to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        }
    }

    async fn handle(&self, ctx: &ProviderContext, _req: ProviderRequest) -> Result<ProviderResponse, ToolError> {
        let catalog = ctx.registry.get_all();
        let mut entries: Vec<Value> = ctx
            .toolsets
            .values()
            .map(|ts| json!({"id": ts.id, "name": ts.spec.name, "tool_count": ts.filter(&catalog).len()}))
            .collect();
        entries.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));
        let value = json!({"toolsets": entries});
        Ok(ProviderResponse { structured: Some(value.clone()), result: value })
    }
}

pub struct ListSkillsProvider;

#[async_trait]
impl Provider for ListSkillsProvider {
    fn name(&self) -> &str {
        "list_skills"
    }

    fn tool(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: "List the configured skills and their step counts.".to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        }
    }

    async fn handle(&self, ctx: &ProviderContext, _req: ProviderRequest) -> Result<ProviderResponse, ToolError> {
        let mut entries: Vec<Value> = ctx
            .skills
            .values()
            .map(|s| json!({"id": crate::skills::skill_id(&s.name), "name": s.name, "description": s.description, "steps": s.steps.len()}))
            .collect();
        entries.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));
        let value = json!({"skills": entries});
        Ok(ProviderResponse { structured: Some(value.clone()), result: value })
    }
}

fn find_skill<'a>(ctx: &'a ProviderContext, name_or_id: &str) -> Option<&'a crate::skills::SkillSpec> {
    ctx.skills.get(name_or_id).or_else(|| {
        ctx.skills
            .values()
            .find(|s| crate::skills::skill_id(&s.name) == name_or_id)
    })
}

pub struct PlanSkillProvider;

#[async_trait]
impl Provider for PlanSkillProvider {
    fn name(&self) -> &str {
        "plan_skill"
    }

    fn tool(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: "Validate a skill's steps against its declared scope without running anything.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {"skill_id": {"type": "string"}},
                "required": ["skill_id"]
            }),
        }
    }

    async fn handle(&self, ctx: &ProviderContext, req: ProviderRequest) -> Result<ProviderResponse, ToolError> {
        let skill_id = str_arg(&req.args, "skill_id")?;
        let spec = find_skill(ctx, &skill_id)
            .ok_or_else(|| ToolError::validation_input(format!("unknown skill '{skill_id}'")))?;
        let toolset = spec.toolset.as_deref().and_then(|name| {
            ctx.toolsets
                .get(name)
                .or_else(|| ctx.toolsets.values().find(|t| t.spec.name == name))
        });
        let catalog = ctx.registry.get_all();
        let plan = crate::skills::plan_skill(spec, toolset, &catalog)?;
        let value = serde_json::to_value(&plan).map_err(|e| ToolError::internal(e.to_string()))?;
        Ok(ProviderResponse { structured: Some(value.clone()), result: value })
    }
}

pub struct RunSkillProvider;

#[async_trait]
impl Provider for RunSkillProvider {
    fn name(&self) -> &str {
        "run_skill"
    }

    fn tool(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: "Run a named skill's steps via the chain runner, enforcing its own step/timeout guards.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {"skill_id": {"type": "string"}},
                "required": ["skill_id"]
            }),
        }
    }

    async fn handle(&self, ctx: &ProviderContext, req: ProviderRequest) -> Result<ProviderResponse, ToolError> {
        let skill_id = str_arg(&req.args, "skill_id")?;
        let spec = find_skill(ctx, &skill_id)
            .ok_or_else(|| ToolError::validation_input(format!("unknown skill '{skill_id}'")))?
            .clone();

        let outcome = crate::skills::run_skill(
            &ctx.registry,
            &ctx.manager,
            &spec,
            None,
            None,
            &NullProgressSink,
            req.progress_token.as_ref(),
        )
        .await;

        let value = json!({
            "results": outcome.results,
            "error": outcome.error.as_ref().map(|e| serde_json::to_value(e).unwrap_or(Value::Null)),
        });

        match outcome.error {
            Some(e) => Err(e.with_op("run_skill")),
            None => Ok(ProviderResponse { structured: Some(value.clone()), result: value }),
        }
    }
}
