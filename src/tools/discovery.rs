use serde::Serialize;
use serde_json::Value;

use crate::backend::BackendManager;
use crate::errors::ToolError;
use crate::registry::{ToolEntry, ToolRegistry};

/// Search result returned by search_tools (full mode).
#[derive(Debug, Serialize)]
pub struct SearchResult {
    pub name: String,
    pub description: String,
    pub backend: String,
}

/// Brief search result — name, backend, first sentence of description, call example.
#[derive(Debug, Serialize)]
pub struct BriefSearchResult {
    pub name: String,
    pub backend: String,
    pub description: String,
    /// How to call this tool (backend tools are NOT direct MCP tools).
    pub call: String,
}

/// Full tool info returned by tool_info (full mode).
#[derive(Debug, Serialize)]
pub struct ToolInfoResult {
    pub name: String,
    pub description: String,
    pub backend: String,
    pub input_schema: Value,
}

/// Brief tool info — name, backend, first sentence of description, parameter names, call example.
#[derive(Debug, Serialize)]
pub struct BriefToolInfoResult {
    pub name: String,
    pub backend: String,
    pub description: String,
    pub parameters: Vec<String>,
    /// How to call this tool (backend tools are NOT direct MCP tools).
    pub call: String,
}

/// Sanitize a name for use in a JS call example.
/// Delegates to the shared `sanitize_identifier` which handles leading digits and empty strings.
fn sanitize_js_name(name: &str) -> String {
    crate::sandbox::bridge::sanitize_identifier(name)
}

/// Extract the first sentence from a description string.
fn first_sentence(text: &str) -> String {
    // Find first period followed by space or end of string
    if let Some(idx) = text.find(". ") {
        text[..=idx].to_string()
    } else if let Some(idx) = text.find(".\n") {
        text[..=idx].to_string()
    } else if text.ends_with('.') {
        text.to_string()
    } else if text.len() > 200 {
        // Truncate long descriptions without sentence boundary
        format!("{}...", &text[..200])
    } else {
        text.to_string()
    }
}

/// Extract parameter names from a JSON schema's `properties` object.
fn extract_param_names(schema: &Value) -> Vec<String> {
    schema
        .get("properties")
        .and_then(|p| p.as_object())
        .map(|obj| obj.keys().cloned().collect())
        .unwrap_or_default()
}

/// Search the registry, using hybrid BM25+semantic when the semantic feature is active.
fn search_tools(registry: &ToolRegistry, query: &str, limit: u32) -> Vec<ToolEntry> {
    #[cfg(feature = "semantic")]
    {
        registry.search_hybrid(query, limit)
    }
    #[cfg(not(feature = "semantic"))]
    {
        registry.search(query, limit)
    }
}

/// Handle search_tools: BM25 (or hybrid) search across names and descriptions.
pub fn handle_search(registry: &ToolRegistry, query: &str, limit: u32) -> Vec<SearchResult> {
    search_tools(registry, query, limit)
        .into_iter()
        .map(|e| SearchResult {
            name: e.name,
            description: e.description,
            backend: e.backend_name,
        })
        .collect()
}

/// Handle search_tools with brief=true: returns compact results.
pub fn handle_search_brief(
    registry: &ToolRegistry,
    query: &str,
    limit: u32,
) -> Vec<BriefSearchResult> {
    search_tools(registry, query, limit)
        .into_iter()
        .map(|e| {
            let orig = if e.original_name.is_empty() {
                &e.name
            } else {
                &e.original_name
            };
            let call = format!(
                "call_tool_chain: await {}.{}({{...}})",
                sanitize_js_name(&e.backend_name),
                sanitize_js_name(orig)
            );
            BriefSearchResult {
                name: e.name,
                backend: e.backend_name,
                description: first_sentence(&e.description),
                call,
            }
        })
        .collect()
}

/// Handle `list_tools`: opaque-cursor pagination over the full catalog,
/// delegating to [`ToolRegistry::search_page`] with an empty query.
pub fn handle_list_paginated(
    registry: &ToolRegistry,
    cursor: Option<&str>,
    page_size: u32,
) -> Result<(Vec<String>, Option<String>), ToolError> {
    let (page, next_cursor) = registry.search_page("", page_size, cursor)?;
    Ok((page.into_iter().map(|e| e.name).collect(), next_cursor))
}

/// Handle `search_tools` with opaque-cursor pagination (the wire-facing
/// counterpart of `handle_search`/`handle_search_brief`, which return an
/// unpaged top-K instead).
pub fn handle_search_page(
    registry: &ToolRegistry,
    query: &str,
    limit: u32,
    cursor: Option<&str>,
) -> Result<(Vec<BriefSearchResult>, Option<String>), ToolError> {
    let (page, next_cursor) = registry.search_page(query, limit, cursor)?;
    let results = page
        .into_iter()
        .map(|e| {
            let orig = if e.original_name.is_empty() {
                e.name.clone()
            } else {
                e.original_name.clone()
            };
            let call = format!(
                "call_tool_chain: await {}.{}({{...}})",
                sanitize_js_name(&e.backend_name),
                sanitize_js_name(&orig)
            );
            BriefSearchResult {
                name: e.name,
                backend: e.backend_name,
                description: first_sentence(&e.description),
                call,
            }
        })
        .collect();
    Ok((results, next_cursor))
}

/// One usage example for a tool, derived from its input schema: the call
/// snippet plus a sample arguments object built from `required` properties.
#[derive(Debug, Serialize)]
pub struct ToolExample {
    pub tool_id: String,
    pub call: String,
    pub sample_args: Value,
}

fn sample_value_for_schema(schema: &Value) -> Value {
    match schema.get("type").and_then(|t| t.as_str()) {
        Some("string") => Value::String(
            schema
                .get("example")
                .and_then(|e| e.as_str())
                .unwrap_or("example")
                .to_string(),
        ),
        Some("integer") | Some("number") => Value::from(1),
        Some("boolean") => Value::Bool(true),
        Some("array") => Value::Array(vec![]),
        Some("object") => Value::Object(Default::default()),
        _ => Value::Null,
    }
}

/// Handle `list_tool_examples`: one synthesized example per matching tool,
/// built from its `required` input-schema properties (no live call is made).
pub fn handle_list_tool_examples(registry: &ToolRegistry, tool_name: &str) -> Option<Vec<ToolExample>> {
    let entry = registry.get_by_name(tool_name)?;
    let orig = if entry.original_name.is_empty() {
        &entry.name
    } else {
        &entry.original_name
    };
    let call = format!(
        "call_tool_chain: await {}.{}({{...}})",
        sanitize_js_name(&entry.backend_name),
        sanitize_js_name(orig)
    );

    let required = entry
        .input_schema
        .get("required")
        .and_then(|r| r.as_array())
        .cloned()
        .unwrap_or_default();
    let properties = entry
        .input_schema
        .get("properties")
        .and_then(|p| p.as_object())
        .cloned()
        .unwrap_or_default();

    let mut sample = serde_json::Map::new();
    for req in &required {
        let Some(name) = req.as_str() else { continue };
        let prop_schema = properties.get(name).cloned().unwrap_or(Value::Null);
        sample.insert(name.to_string(), sample_value_for_schema(&prop_schema));
    }

    Some(vec![ToolExample {
        tool_id: entry.name,
        call,
        sample_args: Value::Object(sample),
    }])
}

/// Handle tool_info: return full schema for a specific tool.
pub fn handle_tool_info(registry: &ToolRegistry, tool_name: &str) -> Option<ToolInfoResult> {
    registry.get_by_name(tool_name).map(|e| ToolInfoResult {
        name: e.name,
        description: e.description,
        backend: e.backend_name,
        input_schema: e.input_schema,
    })
}

/// Handle tool_info with brief mode: returns compact info.
pub fn handle_tool_info_brief(
    registry: &ToolRegistry,
    tool_name: &str,
) -> Option<BriefToolInfoResult> {
    registry.get_by_name(tool_name).map(|e| {
        let orig = if e.original_name.is_empty() {
            &e.name
        } else {
            &e.original_name
        };
        let parameters = extract_param_names(&e.input_schema);
        let call = format!(
            "call_tool_chain: await {}.{}({{...}})",
            sanitize_js_name(&e.backend_name),
            sanitize_js_name(orig)
        );
        BriefToolInfoResult {
            name: e.name,
            backend: e.backend_name,
            description: first_sentence(&e.description),
            parameters,
            call,
        }
    })
}

/// Handle get_required_keys_for_tool: return env var keys the backend needs.
pub async fn handle_required_keys_async(
    registry: &ToolRegistry,
    manager: &BackendManager,
    tool_name: &str,
) -> Option<Vec<String>> {
    let entry = registry.get_by_name(tool_name)?;
    let config = manager.get_backend_config(&entry.backend_name).await?;

    // Return the env var keys from the backend config + explicit required_keys
    let mut keys: Vec<String> = config.env.keys().cloned().collect();
    for k in &config.required_keys {
        if !keys.contains(k) {
            keys.push(k.clone());
        }
    }
    Some(keys)
}
