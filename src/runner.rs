//! Executes individual tool calls and multi-step chains against the backend
//! manager, translating backend failures into the closed [`ToolError`] set
//! and enforcing schema validation at the dispatch boundary.
//!
//! Grounded on `tools/sandbox.rs`'s `call_tool_by_dotted_name` (backend
//! resolution, stopped-backend on-demand restart) and `backend/mod.rs`'s
//! `dispatch` (concurrency-limited call path) — this module is the single
//! place both `run_tool` and `run_chain` funnel through instead of each
//! provider re-implementing backend resolution.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::backend::BackendManager;
use crate::errors::ToolError;
use crate::registry::ToolRegistry;

/// One step of a `run_chain`/`run_skill` plan.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize, rmcp::schemars::JsonSchema)]
pub struct ChainStep {
    pub step_id: String,
    pub tool_id: String,
    #[serde(default)]
    pub args: Value,
    /// Merge the previous step's structured output into this step's args
    /// before dispatch (by shallow object merge; previous-step keys win).
    #[serde(default)]
    pub use_previous: bool,
}

/// Progress update emitted during a `run_tool`/`run_chain` call when the
/// caller supplied a progress token.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProgressEvent {
    pub token: Value,
    pub progress: u64,
    pub total: Option<u64>,
    pub message: Option<String>,
}

/// Sink for progress events. `run_tool`/`run_chain` emit coarse
/// started/completed events for backends with no native progress reporting;
/// cancellation mid-call stops further events for that token by simply
/// dropping the sink.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// A sink that drops every event — used when the caller passed no token.
pub struct NullProgressSink;
impl ProgressSink for NullProgressSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Outcome of a single tool invocation.
pub struct RunOutcome {
    pub result: Value,
    pub structured: Option<Value>,
}

/// Validate `args` against a tool's input JSON-Schema.
///
/// This is a boundary check, not a full JSON-Schema validator: it enforces
/// `required` properties and top-level `type: object`, which covers the
/// overwhelming majority of tool schemas in this codebase (and matches the
/// level of validation `rmcp`'s own `Parameters<T>` extractor performs via
/// serde before a tool body ever runs).
fn validate_against_schema(args: &Value, schema: &Value) -> Result<(), ToolError> {
    let Some(obj) = schema.as_object() else {
        return Ok(());
    };
    if obj.get("type").and_then(|t| t.as_str()) == Some("object") && !args.is_object() && !args.is_null()
    {
        return Err(ToolError::validation_input(
            "arguments must be a JSON object",
        ));
    }
    if let Some(required) = obj.get("required").and_then(|r| r.as_array()) {
        let provided = args.as_object().cloned().unwrap_or_default();
        for req in required {
            let Some(name) = req.as_str() else { continue };
            if !provided.contains_key(name) {
                return Err(ToolError::validation_input(format!(
                    "missing required argument '{name}'"
                )));
            }
        }
    }
    Ok(())
}

/// Resolve and validate an optional `backend_override` against the tool's
/// single registered backend.
///
/// The catalog (`ToolRegistry`) currently aggregates one primary backend per
/// tool id rather than the full `Backend` sum-type fan-out a multi-server
/// aggregator would carry; override matching is narrowed to backend-name
/// equality accordingly (see `DESIGN.md`).
fn check_backend_override(
    tool_id: &str,
    entry_backend: &str,
    backend_override: Option<&str>,
) -> Result<(), ToolError> {
    match backend_override {
        None => Ok(()),
        Some(name) if name.trim().is_empty() => Err(ToolError::backend_override_invalid(
            "backend_override must not be empty",
        )),
        Some(name) if name == entry_backend => Ok(()),
        Some(_) => Err(ToolError::backend_override_no_match(tool_id)),
    }
}

/// Run a single tool by its registry id, with schema validation, coarse
/// progress reporting and on-demand restart of a stopped backend.
pub async fn run_tool(
    registry: &Arc<ToolRegistry>,
    manager: &Arc<BackendManager>,
    tool_id: &str,
    args: Value,
    backend_override: Option<&str>,
    deadline: Option<Duration>,
    progress: &dyn ProgressSink,
    progress_token: Option<&Value>,
) -> Result<RunOutcome, ToolError> {
    let entry = registry
        .get_by_name(tool_id)
        .ok_or_else(|| ToolError::tool_not_found(tool_id))?;

    check_backend_override(tool_id, &entry.backend_name, backend_override)?;
    validate_against_schema(&args, &entry.input_schema)?;

    if let Some(token) = progress_token {
        progress.emit(ProgressEvent {
            token: token.clone(),
            progress: 0,
            total: Some(1),
            message: Some("started".to_string()),
        });
    }

    let call_name = if entry.original_name.is_empty() {
        entry.name.as_str()
    } else {
        entry.original_name.as_str()
    };
    let arguments = if args.is_null() { None } else { Some(args) };

    let call = manager.call_tool(&entry.backend_name, call_name, arguments.clone());
    let result = match deadline {
        Some(d) => match tokio::time::timeout(d, call).await {
            Ok(inner) => inner,
            Err(_) => {
                return Err(ToolError::timeout(format!(
                    "tool '{tool_id}' did not complete within {d:?}"
                ))
                .with_tool_id(tool_id));
            }
        },
        None => call.await,
    };

    let value = match result {
        Ok(v) => v,
        Err(e) if e.to_string().contains("not available") && e.to_string().contains("Stopped") => {
            debug!(backend = %entry.backend_name, tool = %call_name, "on-demand restart before retry");
            manager
                .restart_backend(&entry.backend_name, registry)
                .await
                .map_err(|e| {
                    ToolError::execution_failed(format!(
                        "restart of '{}' failed: {e}",
                        entry.backend_name
                    ))
                    .with_tool_id(tool_id)
                })?;
            manager
                .call_tool(&entry.backend_name, call_name, arguments)
                .await
                .map_err(|e| ToolError::from_backend_error(tool_id, &entry.backend_name, &e))?
        }
        Err(e) => return Err(ToolError::from_backend_error(tool_id, &entry.backend_name, &e)),
    };

    if let Some(token) = progress_token {
        progress.emit(ProgressEvent {
            token: token.clone(),
            progress: 1,
            total: Some(1),
            message: Some("completed".to_string()),
        });
    }

    Ok(RunOutcome {
        structured: Some(value.clone()),
        result: value,
    })
}

/// Outcome of a full chain: results collected so far, plus the failure (if
/// any) that halted the chain.
pub struct ChainOutcome {
    pub results: Vec<Value>,
    pub error: Option<ToolError>,
}

/// Run a sequential chain of tool calls. Halts on the first failing step,
/// returning every result collected before the failure alongside a
/// `chain_step_failed` error tagging `step_index`.
///
/// `max_tool_calls`, when set, caps the number of steps actually dispatched
/// (a step beyond the cap is reported as `chain_step_failed` rather than
/// silently dropped).
pub async fn run_chain(
    registry: &Arc<ToolRegistry>,
    manager: &Arc<BackendManager>,
    steps: &[ChainStep],
    max_tool_calls: Option<usize>,
    deadline: Option<Duration>,
    progress: &dyn ProgressSink,
    progress_token: Option<&Value>,
) -> ChainOutcome {
    let mut results = Vec::with_capacity(steps.len());
    let mut previous_structured: Option<Value> = None;

    for (index, step) in steps.iter().enumerate() {
        if let Some(max) = max_tool_calls
            && index >= max
        {
            let err = ToolError::chain_step_failed(
                index,
                ToolError::execution_failed(format!(
                    "chain exceeded max_tool_calls ({max})"
                )),
            );
            return ChainOutcome {
                results,
                error: Some(err),
            };
        }

        let mut args = step.args.clone();
        if step.use_previous
            && let Some(prev) = &previous_structured
        {
            merge_into(&mut args, prev);
        }

        if let Some(token) = progress_token {
            progress.emit(ProgressEvent {
                token: token.clone(),
                progress: index as u64,
                total: Some(steps.len() as u64),
                message: Some(format!("running step '{}'", step.step_id)),
            });
        }

        match run_tool(
            registry,
            manager,
            &step.tool_id,
            args,
            None,
            deadline,
            progress,
            None,
        )
        .await
        {
            Ok(outcome) => {
                previous_structured = outcome.structured.clone();
                results.push(outcome.result);
            }
            Err(e) => {
                return ChainOutcome {
                    results,
                    error: Some(ToolError::chain_step_failed(index, e)),
                };
            }
        }
    }

    if let Some(token) = progress_token {
        progress.emit(ProgressEvent {
            token: token.clone(),
            progress: steps.len() as u64,
            total: Some(steps.len() as u64),
            message: Some("completed".to_string()),
        });
    }

    ChainOutcome {
        results,
        error: None,
    }
}

/// Shallow-merge `src`'s object keys into `dst`, `src` winning on conflicts.
/// Non-object inputs are left untouched (a chain step with scalar args simply
/// doesn't participate in `use_previous` merging).
fn merge_into(dst: &mut Value, src: &Value) {
    let (Some(dst_obj), Some(src_obj)) = (dst.as_object_mut(), src.as_object()) else {
        return;
    };
    for (k, v) in src_obj {
        dst_obj.insert(k.clone(), v.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_against_schema_missing_required() {
        let schema = json!({"type": "object", "required": ["query"]});
        let err = validate_against_schema(&json!({}), &schema).unwrap_err();
        assert_eq!(err.code, crate::errors::ErrorCode::ValidationInput);
    }

    #[test]
    fn test_validate_against_schema_ok() {
        let schema = json!({"type": "object", "required": ["query"]});
        assert!(validate_against_schema(&json!({"query": "x"}), &schema).is_ok());
    }

    #[test]
    fn test_check_backend_override_match() {
        assert!(check_backend_override("ns:tool", "exa", Some("exa")).is_ok());
    }

    #[test]
    fn test_check_backend_override_no_match() {
        let err = check_backend_override("ns:tool", "exa", Some("tavily")).unwrap_err();
        assert_eq!(err.code, crate::errors::ErrorCode::BackendOverrideNoMatch);
    }

    #[test]
    fn test_check_backend_override_empty_invalid() {
        let err = check_backend_override("ns:tool", "exa", Some("")).unwrap_err();
        assert_eq!(err.code, crate::errors::ErrorCode::BackendOverrideInvalid);
    }

    #[test]
    fn test_merge_into_previous_wins() {
        let mut dst = json!({"a": 1, "b": 2});
        let src = json!({"b": 99, "c": 3});
        merge_into(&mut dst, &src);
        assert_eq!(dst, json!({"a": 1, "b": 99, "c": 3}));
    }

    #[tokio::test]
    async fn test_run_chain_halts_on_failure_with_step_index() {
        let registry = ToolRegistry::new();
        let manager = crate::backend::BackendManager::new();
        let mock = crate::testutil::MockBackend::new("ns", Duration::from_millis(0));
        crate::testutil::insert_mock(&manager, &registry, &mock).await;

        let steps = vec![
            ChainStep {
                step_id: "s0".to_string(),
                tool_id: "ns.echo_tool".to_string(),
                args: json!({}),
                use_previous: false,
            },
            ChainStep {
                step_id: "s1".to_string(),
                tool_id: "ns.missing".to_string(),
                args: json!({}),
                use_previous: false,
            },
        ];

        let outcome = run_chain(&registry, &manager, &steps, None, None, &NullProgressSink, None).await;
        assert_eq!(outcome.results.len(), 1);
        let err = outcome.error.unwrap();
        assert_eq!(err.code, crate::errors::ErrorCode::ChainStepFailed);
        assert_eq!(err.step_index, Some(1));
    }
}
