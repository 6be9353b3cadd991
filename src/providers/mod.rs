//! Declarative tool providers: every operation the gateway exposes (catalog
//! search, tool execution, chain/skill running, code execution) is a
//! [`Provider`] with a name, an enabled flag, a JSON-Schema tool descriptor
//! and an async handler — grounded on `server.rs`'s `#[tool_router]` method
//! bodies, generalized here so the method bodies are reusable outside rmcp's
//! macro-generated dispatch (the streamable-HTTP transport in particular).
//!
//! Providers are registered once at startup and wrapped by the configured
//! [`crate::middleware`] chain; callers always go through [`ProviderRegistry::dispatch`]
//! rather than holding a reference to an individual provider.

mod builtin;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::backend::BackendManager;
use crate::errors::ToolError;
use crate::registry::ToolRegistry;
use crate::skills::SkillSpec;
use crate::toolsets::Toolset;
use crate::tracker::CallTracker;

/// Shared state every provider dispatches against.
#[derive(Clone)]
pub struct ProviderContext {
    pub registry: Arc<ToolRegistry>,
    pub manager: Arc<BackendManager>,
    pub tracker: Arc<CallTracker>,
    pub toolsets: Arc<HashMap<String, Toolset>>,
    pub skills: Arc<HashMap<String, SkillSpec>>,
    pub sandbox_semaphore: Arc<tokio::sync::Semaphore>,
    pub sandbox_enabled: bool,
}

/// A single dispatch's arguments and out-of-band metadata.
#[derive(Default)]
pub struct ProviderRequest {
    pub args: Value,
    pub progress_token: Option<Value>,
    /// Bearer token forwarded by the transport layer, checked by the `auth`
    /// middleware when configured. `None` for transports with no such
    /// concept (stdio) or when the caller sent none.
    pub auth_token: Option<String>,
}

/// A successful dispatch's result. `structured` carries the machine-readable
/// payload used for `run_chain`'s `use_previous` merging; `result` is what's
/// returned to the caller (usually the same value).
pub struct ProviderResponse {
    pub result: Value,
    pub structured: Option<Value>,
}

/// Declarative description of a provider's wire-facing tool, independent of
/// any specific transport's schema representation.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// One gateway operation: `search_tools`, `run_tool`, `run_chain`,
/// `execute_code`, toolset/skill operations, and so on.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this provider is exposed at all, given the running context
    /// (e.g. `execute_code` is disabled when the sandbox feature is off).
    fn enabled(&self, ctx: &ProviderContext) -> bool {
        let _ = ctx;
        true
    }

    fn tool(&self) -> ToolDescriptor;

    async fn handle(&self, ctx: &ProviderContext, req: ProviderRequest) -> Result<ProviderResponse, ToolError>;
}

/// Registry of every provider the gateway exposes, each already wrapped by
/// the configured middleware chain at construction time — wrapping happens
/// exactly once, at registration, never per-call.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Build the registry from the built-in provider set, wrapping each with
    /// `wrap` (the middleware chain) and dropping providers whose config
    /// entry disables them.
    pub fn new(
        disabled: &[String],
        wrap: impl Fn(Arc<dyn Provider>) -> Arc<dyn Provider>,
    ) -> Self {
        let mut providers = HashMap::new();
        for provider in builtin::all() {
            if disabled.iter().any(|d| d == provider.name()) {
                continue;
            }
            providers.insert(provider.name().to_string(), wrap(provider));
        }
        Self { providers }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Provider>> {
        self.providers.get(name)
    }

    /// Tool descriptors for every enabled provider, for transport-level
    /// `tools/list` responses.
    pub fn list_tools(&self, ctx: &ProviderContext) -> Vec<ToolDescriptor> {
        let mut tools: Vec<ToolDescriptor> = self
            .providers
            .values()
            .filter(|p| p.enabled(ctx))
            .map(|p| p.tool())
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub async fn dispatch(
        &self,
        ctx: &ProviderContext,
        name: &str,
        req: ProviderRequest,
    ) -> Result<ProviderResponse, ToolError> {
        let provider = self
            .providers
            .get(name)
            .ok_or_else(|| ToolError::tool_not_found(name))?;
        if !provider.enabled(ctx) {
            return Err(ToolError::tool_not_found(name));
        }
        provider.handle(ctx, req).await
    }
}

pub use builtin::{
    DescribeToolProvider, ExecuteCodeProvider, ListNamespacesProvider, ListSkillsProvider,
    ListToolExamplesProvider, ListToolsProvider, ListToolsetsProvider, PlanSkillProvider,
    RunChainProvider, RunSkillProvider, RunToolProvider, SearchToolsProvider,
};
