use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use rmcp::{
    ErrorData as McpError, RoleServer, ServerHandler,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::*,
    schemars,
    service::RequestContext,
    tool, tool_handler, tool_router,
};
use serde::Deserialize;
use serde_json::Value;

use crate::backend::BackendManager;
use crate::registry::ToolRegistry;
use crate::runner::{self, ChainStep, NullProgressSink};
use crate::skills::SkillSpec;
use crate::toolsets::Toolset;
use crate::tracker::CallTracker;

// --- Parameter structs for each meta-tool ---

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct RegisterManualParams {
    /// The call template for the manual backend endpoint.
    pub manual_call_template: Value,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct DeregisterManualParams {
    /// The name of the manual to deregister.
    pub manual_name: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct SearchToolsParams {
    /// A natural language description of the task.
    pub task_description: String,
    /// Maximum number of results to return.
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Return brief results (name, backend, first sentence). Default: true. Set false for full descriptions.
    #[serde(default = "default_true")]
    pub brief: bool,
}

fn default_limit() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

fn default_page_size() -> u32 {
    50
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ToolInfoParams {
    /// Name of the tool to get information for.
    pub tool_name: String,
    /// Detail level: "brief" returns name, backend, first-sentence description, parameter names (~200 tokens). "full" returns complete schema (~10k tokens). Default: "brief".
    #[serde(default = "default_detail")]
    pub detail: String,
}

fn default_detail() -> String {
    "brief".to_string()
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ListToolsMetaParams {
    /// Pagination cursor from a previous response.
    #[serde(default)]
    pub cursor: Option<String>,
    /// Number of tools per page (default: 50).
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ListNamespacesParams {
    /// Number of namespaces per page (default: 50).
    #[serde(default = "default_page_size")]
    pub limit: u32,
    /// Offset into the namespace list.
    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ListToolExamplesParams {
    /// Name of the tool to get synthesized call examples for.
    pub tool_name: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct RequiredKeysParams {
    /// Name of the tool to get required variables for.
    pub tool_name: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct CallToolChainParams {
    /// TypeScript code to execute with access to all registered tools.
    pub code: String,
    /// Optional timeout in milliseconds (default: 30000).
    pub timeout: Option<u64>,
    /// Optional maximum output size in characters (default: 200000).
    pub max_output_size: Option<usize>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct RunToolParams {
    /// Registry id of the tool to invoke (e.g. "exa.web_search").
    pub tool_id: String,
    /// Arguments to pass to the tool.
    #[serde(default)]
    pub args: Value,
    /// Require a specific backend to serve this call; error if it doesn't match.
    #[serde(default)]
    pub backend_override: Option<String>,
    /// Abort the call if it hasn't completed within this many milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct RunChainParams {
    /// Ordered steps to run; each may merge the previous step's output into its own args.
    pub steps: Vec<ChainStep>,
    /// Cap on the number of steps actually dispatched.
    #[serde(default)]
    pub max_tool_calls: Option<usize>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct SkillIdParams {
    /// Skill id (e.g. "skill:daily-report") or its configured name.
    pub skill_id: String,
}

/// The MCP server exposed to Claude Code over stdio, and reused by the
/// streamable-HTTP transport for every operation both surfaces share.
#[derive(Clone)]
pub struct BrokerServer {
    pub registry: Arc<ToolRegistry>,
    pub backend_manager: Arc<BackendManager>,
    pub tracker: Arc<CallTracker>,
    pub cache_path: PathBuf,
    pub allow_runtime_registration: bool,
    pub max_dynamic_backends: usize,
    pub sandbox_semaphore: Arc<tokio::sync::Semaphore>,
    pub toolsets: Arc<HashMap<String, Toolset>>,
    pub skills: Arc<HashMap<String, SkillSpec>>,
    tool_router: ToolRouter<Self>,
}

impl BrokerServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ToolRegistry>,
        backend_manager: Arc<BackendManager>,
        tracker: Arc<CallTracker>,
        cache_path: PathBuf,
        allow_runtime_registration: bool,
        max_dynamic_backends: usize,
        sandbox_semaphore: Arc<tokio::sync::Semaphore>,
        toolsets: Arc<HashMap<String, Toolset>>,
        skills: Arc<HashMap<String, SkillSpec>>,
    ) -> Self {
        Self {
            registry,
            backend_manager,
            tracker,
            cache_path,
            allow_runtime_registration,
            max_dynamic_backends,
            sandbox_semaphore,
            toolsets,
            skills,
            tool_router: Self::tool_router(),
        }
    }

    fn find_skill(&self, skill_id: &str) -> Option<&SkillSpec> {
        self.skills.get(skill_id).or_else(|| {
            self.skills
                .values()
                .find(|s| crate::skills::skill_id(&s.name) == skill_id)
        })
    }
}

#[tool_router]
impl BrokerServer {
    #[tool(description = "Registers a new tool provider by providing its call template.")]
    async fn register_manual(
        &self,
        Parameters(params): Parameters<RegisterManualParams>,
    ) -> Result<CallToolResult, McpError> {
        if !self.allow_runtime_registration {
            return Ok(CallToolResult::error(vec![Content::text(
                "Runtime registration is disabled (allow_runtime_registration: false in config).",
            )]));
        }

        let result = crate::tools::register::handle_register(
            &self.backend_manager,
            &self.registry,
            params.manual_call_template,
            self.max_dynamic_backends,
        )
        .await;

        match result {
            Ok(msg) => {
                let reg = Arc::clone(&self.registry);
                let trk = Arc::clone(&self.tracker);
                let cp = self.cache_path.clone();
                tokio::spawn(async move { crate::cache::save(&cp, &reg, Some(&trk)).await });
                Ok(CallToolResult::success(vec![Content::text(msg)]))
            }
            Err(e) => Ok(CallToolResult::error(vec![Content::text(e.to_string())])),
        }
    }

    #[tool(description = "Deregisters a tool provider from the gateway.")]
    async fn deregister_manual(
        &self,
        Parameters(params): Parameters<DeregisterManualParams>,
    ) -> Result<CallToolResult, McpError> {
        if !self.allow_runtime_registration {
            return Ok(CallToolResult::error(vec![Content::text(
                "Runtime registration is disabled (allow_runtime_registration: false in config).",
            )]));
        }

        let result = crate::tools::register::handle_deregister(
            &self.backend_manager,
            &self.registry,
            &params.manual_name,
        )
        .await;

        match result {
            Ok(msg) => {
                let reg = Arc::clone(&self.registry);
                let trk = Arc::clone(&self.tracker);
                let cp = self.cache_path.clone();
                tokio::spawn(async move { crate::cache::save(&cp, &reg, Some(&trk)).await });
                Ok(CallToolResult::success(vec![Content::text(msg)]))
            }
            Err(e) => Ok(CallToolResult::error(vec![Content::text(e.to_string())])),
        }
    }

    #[tool(description = "Searches for relevant tools based on a task description. Default: brief=true for compact results.")]
    async fn search_tools(
        &self,
        Parameters(params): Parameters<SearchToolsParams>,
    ) -> Result<CallToolResult, McpError> {
        let json = if params.brief {
            let results = crate::tools::discovery::handle_search_brief(
                &self.registry,
                &params.task_description,
                params.limit,
            );
            serde_json::to_string_pretty(&results)
        } else {
            let results = crate::tools::discovery::handle_search(
                &self.registry,
                &params.task_description,
                params.limit,
            );
            serde_json::to_string_pretty(&results)
        }
        .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(CallToolResult::success(vec![Content::text(json)]))
    }

    #[tool(description = "Returns a cursor-paginated list of all tool names currently registered.")]
    async fn list_tools_meta(
        &self,
        Parameters(params): Parameters<ListToolsMetaParams>,
    ) -> Result<CallToolResult, McpError> {
        let (names, next_cursor) = crate::tools::discovery::handle_list_paginated(
            &self.registry,
            params.cursor.as_deref(),
            params.page_size,
        )
        .map_err(to_call_result_error)?;
        let result = serde_json::json!({
            "tools": names,
            "next_cursor": next_cursor,
        });
        let json = serde_json::to_string_pretty(&result)
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(CallToolResult::success(vec![Content::text(json)]))
    }

    #[tool(description = "Lists the backend namespaces currently registered, paginated.")]
    async fn list_namespaces(
        &self,
        Parameters(params): Parameters<ListNamespacesParams>,
    ) -> Result<CallToolResult, McpError> {
        let (namespaces, has_more) = self.registry.list_namespaces_page(params.limit, params.offset);
        let result = serde_json::json!({"namespaces": namespaces, "has_more": has_more});
        let json = serde_json::to_string_pretty(&result)
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(CallToolResult::success(vec![Content::text(json)]))
    }

    #[tool(description = "Get complete information about a specific tool including its input schema.")]
    async fn tool_info(
        &self,
        Parameters(params): Parameters<ToolInfoParams>,
    ) -> Result<CallToolResult, McpError> {
        let json = if params.detail == "full" {
            let result =
                crate::tools::discovery::handle_tool_info(&self.registry, &params.tool_name);
            match result {
                Some(info) => serde_json::to_string_pretty(&info)
                    .map_err(|e| McpError::internal_error(e.to_string(), None))?,
                None => {
                    return Ok(CallToolResult::error(vec![Content::text(format!(
                        "Tool '{}' not found",
                        params.tool_name
                    ))]));
                }
            }
        } else {
            let result =
                crate::tools::discovery::handle_tool_info_brief(&self.registry, &params.tool_name);
            match result {
                Some(info) => serde_json::to_string_pretty(&info)
                    .map_err(|e| McpError::internal_error(e.to_string(), None))?,
                None => {
                    return Ok(CallToolResult::error(vec![Content::text(format!(
                        "Tool '{}' not found. Use tool_info with detail=\"full\" for complete schema.",
                        params.tool_name
                    ))]));
                }
            }
        };
        Ok(CallToolResult::success(vec![Content::text(json)]))
    }

    #[tool(description = "Get synthesized call examples for one tool, derived from its input schema.")]
    async fn list_tool_examples(
        &self,
        Parameters(params): Parameters<ListToolExamplesParams>,
    ) -> Result<CallToolResult, McpError> {
        match crate::tools::discovery::handle_list_tool_examples(&self.registry, &params.tool_name) {
            Some(examples) => {
                let json = serde_json::to_string_pretty(&examples)
                    .map_err(|e| McpError::internal_error(e.to_string(), None))?;
                Ok(CallToolResult::success(vec![Content::text(json)]))
            }
            None => Ok(CallToolResult::error(vec![Content::text(format!(
                "Tool '{}' not found",
                params.tool_name
            ))])),
        }
    }

    #[tool(description = "Get required environment variables for a registered tool.")]
    async fn get_required_keys_for_tool(
        &self,
        Parameters(params): Parameters<RequiredKeysParams>,
    ) -> Result<CallToolResult, McpError> {
        let result = crate::tools::discovery::handle_required_keys_async(
            &self.registry,
            &self.backend_manager,
            &params.tool_name,
        )
        .await;
        match result {
            Some(keys) => {
                let json = serde_json::to_string_pretty(&keys)
                    .map_err(|e| McpError::internal_error(e.to_string(), None))?;
                Ok(CallToolResult::success(vec![Content::text(json)]))
            }
            None => Ok(CallToolResult::error(vec![Content::text(format!(
                "Tool '{}' not found",
                params.tool_name
            ))])),
        }
    }

    #[tool(description = "Invoke a single registered tool by id, with schema validation and on-demand backend restart.")]
    async fn run_tool(
        &self,
        Parameters(params): Parameters<RunToolParams>,
    ) -> Result<CallToolResult, McpError> {
        let deadline = params.timeout_ms.map(std::time::Duration::from_millis);
        let outcome = runner::run_tool(
            &self.registry,
            &self.backend_manager,
            &params.tool_id,
            params.args,
            params.backend_override.as_deref(),
            deadline,
            &NullProgressSink,
            None,
        )
        .await;

        match outcome {
            Ok(o) => {
                let json = serde_json::to_string_pretty(&o.result)
                    .map_err(|e| McpError::internal_error(e.to_string(), None))?;
                Ok(CallToolResult::success(vec![Content::text(json)]))
            }
            Err(e) => Ok(CallToolResult::error(vec![Content::text(e.to_string())])),
        }
    }

    #[tool(description = "Run a sequence of tool calls, optionally merging each step's output into the next. Halts on the first failing step.")]
    async fn run_chain(
        &self,
        Parameters(params): Parameters<RunChainParams>,
    ) -> Result<CallToolResult, McpError> {
        let outcome = runner::run_chain(
            &self.registry,
            &self.backend_manager,
            &params.steps,
            params.max_tool_calls,
            None,
            &NullProgressSink,
            None,
        )
        .await;

        let result = serde_json::json!({
            "results": outcome.results,
            "error": outcome.error.as_ref().and_then(|e| serde_json::to_value(e).ok()),
        });
        let json = serde_json::to_string_pretty(&result)
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        if outcome.error.is_some() {
            Ok(CallToolResult::error(vec![Content::text(json)]))
        } else {
            Ok(CallToolResult::success(vec![Content::text(json)]))
        }
    }

    #[tool(description = "List the configured toolsets and how many catalog tools each currently matches.")]
    async fn list_toolsets(&self) -> Result<CallToolResult, McpError> {
        let catalog = self.registry.get_all();
        let mut entries: Vec<Value> = self
            .toolsets
            .values()
            .map(|ts| serde_json::json!({"id": ts.id, "name": ts.spec.name, "tool_count": ts.filter(&catalog).len()}))
            .collect();
        entries.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));
        let json = serde_json::to_string_pretty(&entries)
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(CallToolResult::success(vec![Content::text(json)]))
    }

    #[tool(description = "List the configured skills and their step counts.")]
    async fn list_skills(&self) -> Result<CallToolResult, McpError> {
        let mut entries: Vec<Value> = self
            .skills
            .values()
            .map(|s| {
                serde_json::json!({
                    "id": crate::skills::skill_id(&s.name),
                    "name": s.name,
                    "description": s.description,
                    "steps": s.steps.len(),
                })
            })
            .collect();
        entries.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));
        let json = serde_json::to_string_pretty(&entries)
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(CallToolResult::success(vec![Content::text(json)]))
    }

    #[tool(description = "Validate a skill's steps against its declared toolset scope without running anything.")]
    async fn plan_skill(
        &self,
        Parameters(params): Parameters<SkillIdParams>,
    ) -> Result<CallToolResult, McpError> {
        let Some(spec) = self.find_skill(&params.skill_id) else {
            return Ok(CallToolResult::error(vec![Content::text(format!(
                "unknown skill '{}'",
                params.skill_id
            ))]));
        };
        let toolset = spec.toolset.as_deref().and_then(|name| {
            self.toolsets
                .get(name)
                .or_else(|| self.toolsets.values().find(|t| t.spec.name == name))
        });
        let catalog = self.registry.get_all();
        match crate::skills::plan_skill(spec, toolset, &catalog) {
            Ok(plan) => {
                let json = serde_json::to_string_pretty(&plan)
                    .map_err(|e| McpError::internal_error(e.to_string(), None))?;
                Ok(CallToolResult::success(vec![Content::text(json)]))
            }
            Err(e) => Ok(CallToolResult::error(vec![Content::text(e.to_string())])),
        }
    }

    #[tool(description = "Run a named skill's steps via the chain runner, enforcing its own step/timeout guards.")]
    async fn run_skill(
        &self,
        Parameters(params): Parameters<SkillIdParams>,
    ) -> Result<CallToolResult, McpError> {
        let Some(spec) = self.find_skill(&params.skill_id).cloned() else {
            return Ok(CallToolResult::error(vec![Content::text(format!(
                "unknown skill '{}'",
                params.skill_id
            ))]));
        };

        let outcome = crate::skills::run_skill(
            &self.registry,
            &self.backend_manager,
            &spec,
            None,
            None,
            &NullProgressSink,
            None,
        )
        .await;

        let result = serde_json::json!({
            "results": outcome.results,
            "error": outcome.error.as_ref().and_then(|e| serde_json::to_value(e).ok()),
        });
        let json = serde_json::to_string_pretty(&result)
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        if outcome.error.is_some() {
            Ok(CallToolResult::error(vec![Content::text(json)]))
        } else {
            Ok(CallToolResult::success(vec![Content::text(json)]))
        }
    }

    #[tool(description = "Execute TypeScript code with direct access to all registered tools as hierarchical functions (e.g., manual.tool()).")]
    async fn call_tool_chain(
        &self,
        Parameters(params): Parameters<CallToolChainParams>,
    ) -> Result<CallToolResult, McpError> {
        let result = crate::tools::sandbox::handle_call_tool_chain(
            &self.registry,
            &self.backend_manager,
            &params.code,
            params.timeout,
            params.max_output_size,
            &self.sandbox_semaphore,
        )
        .await;

        match result {
            Ok(output) => Ok(CallToolResult::success(vec![Content::text(output)])),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(e.to_string())])),
        }
    }
}

fn to_call_result_error(e: crate::errors::ToolError) -> McpError {
    McpError::internal_error(e.to_string(), None)
}

#[tool_handler]
impl ServerHandler for BrokerServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_resources()
                .build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "metatools is an MCP gateway that aggregates tools from multiple backend MCP servers.\n\n\
                 IMPORTANT: Backend tools (e.g. firecrawl_search, web_search_exa) are NOT direct MCP tools. \
                 Call them via run_tool/run_chain/call_tool_chain instead.\n\n\
                 ## Discovery Workflow (use progressive disclosure to save context)\n\
                 1. search_tools(\"your task\") → brief results by default (~60 tokens/result)\n\
                 2. tool_info(\"name\") → brief: name, backend, description, param names (~200 tokens)\n\
                 3. tool_info(\"name\", detail=\"full\") → complete schema, ONLY when ready to call (~10k tokens)\n\
                 4. run_tool(\"name\", args) → invoke a single tool directly\n\
                 5. run_chain(steps) → invoke a sequence of tools, merging outputs between steps\n\
                 6. call_tool_chain(\"code\") → execute TypeScript: `const r = await backend.tool({params}); return r;`\n\n\
                 ## Key Tools\n\
                 - search_tools: BM25 search across all tools. brief=true (default) or brief=false for full descriptions\n\
                 - tool_info: Get tool details. detail=\"brief\" (default) or detail=\"full\" for complete input schema\n\
                 - list_tools_meta / list_namespaces: Paginated catalog browsing via opaque cursors\n\
                 - list_tool_examples: Synthesized sample arguments for a tool\n\
                 - run_tool / run_chain: Direct, structured invocation (preferred over call_tool_chain)\n\
                 - list_toolsets / list_skills / plan_skill / run_skill: Pre-authored, scoped chain plans\n\
                 - call_tool_chain: Execute TypeScript with tools as `backend.tool_name(args)`\n\n\
                 ## Resources (load on-demand via @ mention)\n\
                 - @metatools://overview → gateway guide with live tool/backend counts\n\
                 - @metatools://backends → all backends with status and tool counts\n\
                 - @metatools://tools → compact index of ALL tools (~3k tokens vs ~40k for full schemas)\n\
                 - @metatools://tool/{name} → full schema for one tool (on-demand)\n\
                 - @metatools://backend/{name} → backend details + tool list\n\n\
                 ## call_tool_chain Sandbox\n\
                 - ES module sandbox (V8) — NO require(), import, fs, path, or Node.js APIs\n\
                 - Tools as functions: `const r = await backend.tool_name({params}); return r;`\n\
                 - Introspection: `__getToolInterface('backend.tool')` returns schema\n\
                 - Standard JS only: JSON, Math, Array, Object, Promise, async/await, console\n\
                 - If a backend is stopped, the tool call will auto-restart it\n\n\
                 ## Example: Find and use a web search tool\n\
                 ```\n\
                 search_tools(\"web search\")           → [{name: \"web_search_exa\", backend: \"exa\", ...}]\n\
                 tool_info(\"web_search_exa\")           → {params: [\"query\", \"num_results\", ...]}\n\
                 run_tool(\"exa.web_search_exa\", {query: \"MCP protocol\"})\n\
                 ```"
                    .into(),
            ),
        }
    }

    fn list_resources(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListResourcesResult, McpError>> + Send + '_ {
        std::future::ready(Ok(ListResourcesResult {
            meta: None,
            next_cursor: None,
            resources: crate::resources::list_static_resources(),
        }))
    }

    fn list_resource_templates(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListResourceTemplatesResult, McpError>> + Send + '_
    {
        std::future::ready(Ok(ListResourceTemplatesResult {
            meta: None,
            next_cursor: None,
            resource_templates: crate::resources::list_resource_templates(),
        }))
    }

    fn read_resource(
        &self,
        request: ReadResourceRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ReadResourceResult, McpError>> + Send + '_ {
        let registry = Arc::clone(&self.registry);
        let backend_manager = Arc::clone(&self.backend_manager);
        let tracker = Arc::clone(&self.tracker);
        async move {
            crate::resources::read_resource(&request.uri, &registry, &backend_manager, &tracker)
                .await
        }
    }

    fn complete(
        &self,
        request: CompleteRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<CompleteResult, McpError>> + Send + '_ {
        let registry = Arc::clone(&self.registry);
        async move { crate::resources::complete(&request, &registry) }
    }
}
