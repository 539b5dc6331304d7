//! Mapping from stream events to log records

use relay_core::stream::{EventCategory, EventStreamEntry, EventType};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::Result;
use crate::task_log::TaskLog;

/// Tool name prefixes whose calls are also knowledge interactions
pub const KNOWLEDGE_TOOL_PREFIXES: [&str; 6] = [
    "mcp__llamaindex__",
    "mcp__gkg__",
    "mcp__knowledge",
    "knowledge_query",
    "knowledge_search",
    "code_search",
];

pub fn is_knowledge_tool(name: &str) -> bool {
    KNOWLEDGE_TOOL_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

fn field(payload: &Value, key: &str) -> Value {
    payload.get(key).cloned().unwrap_or(Value::Null)
}

fn field_or(payload: &Value, key: &str, default: Value) -> Value {
    match payload.get(key) {
        Some(Value::Null) | None => default,
        Some(value) => value.clone(),
    }
}

/// Whether the final result on disk has this outcome. A redelivered
/// terminal event whose metadata merge failed last time gets to finish it;
/// a conflicting late terminal event does not.
fn recorded_outcome_is(log: &TaskLog, written: bool, success: bool) -> Result<bool> {
    if written {
        return Ok(true);
    }
    let recorded = log
        .final_result()?
        .and_then(|result| result.get("success").and_then(Value::as_bool));
    Ok(recorded == Some(success))
}

/// `received` for `webhook:received`; other flow families keep their prefix
/// (`response_immediate`, `notification_ops`)
pub fn flow_stage(event_type: &str) -> String {
    match (EventCategory::of(event_type), event_type.split_once(':')) {
        (EventCategory::Webhook, Some((_, stage))) => stage.to_string(),
        _ => event_type.replace(':', "_"),
    }
}

/// Webhook-flow journal record for an entry
pub fn flow_record(entry: &EventStreamEntry, payload: &Value) -> Value {
    json!({
        "timestamp": entry.timestamp.to_rfc3339(),
        "stage": flow_stage(&entry.event_type),
        "data": payload,
    })
}

pub fn apply_task_event(
    log: &TaskLog,
    kind: EventType,
    timestamp: &str,
    payload: &Value,
) -> Result<()> {
    match kind {
        EventType::TaskCreated => {
            let mut metadata = match payload {
                Value::Object(map) => map.clone(),
                _ => Default::default(),
            };
            metadata.insert("created_at".to_string(), json!(timestamp));
            metadata
                .entry("task_id".to_string())
                .or_insert_with(|| json!(log.task_id()));
            log.write_metadata(&Value::Object(metadata))?;
            log.write_input(&json!({"message": field(payload, "input_message")}))?;
        }
        EventType::TaskStarted => {
            log.enrich_metadata(json!({
                "status": "running",
                "started_at": timestamp,
                "session_id": field(payload, "session_id"),
            }))?;
        }
        EventType::TaskContextBuilt => {
            log.enrich_input(json!({
                "enriched_prompt": field(payload, "enriched_prompt"),
                "conversation_context": field(payload, "conversation_context"),
                "source_metadata": field(payload, "source_metadata"),
            }))?;
            log.enrich_metadata(json!({
                "flow_id": field(payload, "flow_id"),
                "conversation_id": field(payload, "conversation_id"),
            }))?;
        }
        EventType::TaskOutput => {
            log.append_agent_output(&json!({
                "timestamp": timestamp,
                "type": "output",
                "content": field(payload, "content"),
            }))?;
        }
        EventType::TaskThinking => {
            log.append_agent_output(&json!({
                "timestamp": timestamp,
                "type": "thinking",
                "content": field_or(payload, "content", json!("")),
            }))?;
        }
        EventType::TaskToolCall => {
            let name = payload.get("name").and_then(Value::as_str).unwrap_or("");
            let input = match field_or(payload, "input", json!({})) {
                Value::String(s) => s,
                other => other.to_string(),
            };
            log.append_agent_output(&json!({
                "timestamp": timestamp,
                "type": "tool_call",
                "tool_name": name,
                "tool_input": input,
            }))?;
            if is_knowledge_tool(name) {
                log.append_knowledge_interaction(&json!({
                    "timestamp": timestamp,
                    "type": "query",
                    "tool_name": name,
                    "input": input,
                }))?;
            }
        }
        EventType::TaskToolResult => {
            let name = payload.get("name").and_then(Value::as_str).unwrap_or("");
            let content = field_or(payload, "content", json!(""));
            let is_error = field_or(payload, "is_error", json!(false));
            log.append_agent_output(&json!({
                "timestamp": timestamp,
                "type": "tool_result",
                "tool_name": name,
                "content": content,
                "is_error": is_error,
            }))?;
            if is_knowledge_tool(name) {
                log.append_knowledge_interaction(&json!({
                    "timestamp": timestamp,
                    "type": "result",
                    "tool_name": name,
                    "content": content,
                    "is_error": is_error,
                }))?;
            }
        }
        EventType::TaskRawOutput => {
            let content = match payload.get("raw_output") {
                Some(Value::Null) | None => field_or(payload, "content", json!("")),
                Some(raw) => raw.clone(),
            };
            log.append_agent_output(&json!({
                "timestamp": timestamp,
                "type": "raw_output",
                "content": content,
            }))?;
        }
        EventType::TaskUserInput => {
            log.append_user_input(&json!({
                "timestamp": timestamp,
                "type": "user_response",
                "question_type": field_or(payload, "question_type", json!("clarification")),
                "content": field(payload, "content"),
            }))?;
        }
        EventType::TaskMetrics => {
            log.enrich_metadata(json!({
                "cost_usd": field(payload, "cost_usd"),
                "input_tokens": field(payload, "input_tokens"),
                "output_tokens": field(payload, "output_tokens"),
                "duration_seconds": field(payload, "duration_seconds"),
            }))?;
        }
        EventType::TaskCompleted => {
            let written = log.write_final_result(&json!({
                "success": true,
                "result": field(payload, "result"),
                "metrics": {
                    "cost_usd": field(payload, "cost_usd"),
                    "duration_seconds": field(payload, "duration_seconds"),
                    "input_tokens": field(payload, "input_tokens"),
                    "output_tokens": field(payload, "output_tokens"),
                },
                "completed_at": timestamp,
            }))?;
            if !recorded_outcome_is(log, written, true)? {
                return Ok(());
            }
            log.enrich_metadata(json!({
                "status": field_or(payload, "status", json!("completed")),
                "cost_usd": field(payload, "cost_usd"),
                "duration_seconds": field(payload, "duration_seconds"),
                "completed_at": timestamp,
            }))?;
        }
        EventType::TaskFailed => {
            let written = log.write_final_result(&json!({
                "success": false,
                "error": field(payload, "error"),
                "completed_at": timestamp,
            }))?;
            if !recorded_outcome_is(log, written, false)? {
                return Ok(());
            }
            log.enrich_metadata(json!({
                "status": "failed",
                "error": field(payload, "error"),
                "completed_at": timestamp,
            }))?;
        }
        EventType::TaskResponsePosted => {
            log.append_response_posting(&json!({
                "timestamp": timestamp,
                "method": field(payload, "method"),
                "source": field(payload, "source"),
                "mcp_detected": field(payload, "mcp_detected"),
                "fallback_posted": field(payload, "fallback_posted"),
                "comment_ids": field_or(payload, "comment_ids", json!([])),
            }))?;
        }
        other => debug!(event_type = %other, "Not a task lifecycle event, skipped"),
    }
    Ok(())
}

pub fn apply_knowledge_event(
    log: &TaskLog,
    kind: EventType,
    timestamp: &str,
    payload: &Value,
) -> Result<()> {
    let tool_name = field_or(payload, "tool_name", json!("unknown"));
    let record = match kind {
        EventType::KnowledgeQuery => json!({
            "timestamp": timestamp,
            "type": "query",
            "tool_name": tool_name,
            "query": field_or(payload, "query", json!("")),
            "source_types": field_or(payload, "source_types", json!([])),
            "org_id": field(payload, "org_id"),
        }),
        EventType::KnowledgeResult => {
            let preview: Vec<Value> = payload
                .get("results_preview")
                .and_then(Value::as_array)
                .map(|items| items.iter().take(5).cloned().collect())
                .unwrap_or_default();
            json!({
                "timestamp": timestamp,
                "type": "result",
                "tool_name": tool_name,
                "query": field_or(payload, "query", json!("")),
                "results_count": field_or(payload, "results_count", json!(0)),
                "results_preview": preview,
                "query_time_ms": field_or(payload, "query_time_ms", json!(0.0)),
                "cached": field_or(payload, "cached", json!(false)),
            })
        }
        EventType::KnowledgeToolCall => json!({
            "timestamp": timestamp,
            "type": "tool_call",
            "tool_name": tool_name,
            "parameters": field_or(payload, "parameters", json!({})),
        }),
        EventType::KnowledgeContextUsed => json!({
            "timestamp": timestamp,
            "type": "context_used",
            "tool_name": tool_name,
            "contexts_count": field_or(payload, "contexts_count", json!(0)),
            "relevance_scores": field_or(payload, "relevance_scores", json!([])),
            "total_tokens": field(payload, "total_tokens"),
        }),
        other => {
            debug!(event_type = %other, "Not a knowledge event, skipped");
            return Ok(());
        }
    };
    log.append_knowledge_interaction(&record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::task_log::assemble;

    const TS: &str = "2026-01-05T14:03:22+00:00";

    fn open(temp_dir: &TempDir) -> TaskLog {
        TaskLog::open(temp_dir.path(), "t-1", Some("api")).unwrap()
    }

    #[test]
    fn test_flow_stage() {
        assert_eq!(flow_stage("webhook:received"), "received");
        assert_eq!(flow_stage("webhook:task_created"), "task_created");
        assert_eq!(flow_stage("response:immediate"), "response_immediate");
        assert_eq!(flow_stage("notification:ops"), "notification_ops");
    }

    #[test]
    fn test_knowledge_tool_prefixes() {
        assert!(is_knowledge_tool("mcp__llamaindex__query"));
        assert!(is_knowledge_tool("code_search"));
        assert!(!is_knowledge_tool("Read"));
        assert!(!is_knowledge_tool("my_code_search"));
    }

    #[test]
    fn test_lifecycle_builds_directory() {
        let temp_dir = TempDir::new().unwrap();
        let log = open(&temp_dir);

        apply_task_event(
            &log,
            EventType::TaskCreated,
            TS,
            &json!({"source": "api", "input_message": "Fix the build"}),
        )
        .unwrap();
        apply_task_event(
            &log,
            EventType::TaskContextBuilt,
            TS,
            &json!({"enriched_prompt": "## Task Context", "flow_id": "jira:KAN-1"}),
        )
        .unwrap();
        apply_task_event(
            &log,
            EventType::TaskToolCall,
            TS,
            &json!({"name": "mcp__gkg__search", "input": {"q": "login"}}),
        )
        .unwrap();
        apply_task_event(
            &log,
            EventType::TaskCompleted,
            TS,
            &json!({"result": "Done", "cost_usd": 0.05, "duration_seconds": 12.5}),
        )
        .unwrap();

        let logs = assemble(log.dir()).unwrap();
        assert_eq!(logs["metadata"]["task_id"], "t-1");
        assert_eq!(logs["metadata"]["created_at"], TS);
        assert_eq!(logs["metadata"]["flow_id"], "jira:KAN-1");
        assert_eq!(logs["metadata"]["status"], "completed");
        assert_eq!(logs["input"]["message"], "Fix the build");
        assert_eq!(logs["input"]["enriched_prompt"], "## Task Context");
        assert_eq!(logs["agent_output"][0]["tool_input"], r#"{"q":"login"}"#);
        assert_eq!(logs["knowledge_interactions"][0]["type"], "query");
        assert_eq!(logs["final_result"]["success"], true);
        assert_eq!(logs["final_result"]["metrics"]["cost_usd"], 0.05);
    }

    #[test]
    fn test_failed_after_completed_keeps_first_result() {
        let temp_dir = TempDir::new().unwrap();
        let log = open(&temp_dir);
        apply_task_event(&log, EventType::TaskCompleted, TS, &json!({"result": "ok"})).unwrap();
        apply_task_event(&log, EventType::TaskFailed, TS, &json!({"error": "late"})).unwrap();

        let logs = assemble(log.dir()).unwrap();
        assert_eq!(logs["final_result"]["success"], true);
        assert_eq!(logs["metadata"]["status"], "completed");
    }

    #[test]
    fn test_redelivered_completion_finishes_metadata() {
        let temp_dir = TempDir::new().unwrap();
        let log = open(&temp_dir);
        let blocker = log.dir().join("metadata.json");
        std::fs::create_dir(&blocker).unwrap();
        let payload = json!({"result": "ok", "status": "completed"});

        assert!(apply_task_event(&log, EventType::TaskCompleted, TS, &payload).is_err());
        std::fs::remove_dir(&blocker).unwrap();
        apply_task_event(&log, EventType::TaskCompleted, TS, &payload).unwrap();

        let logs = assemble(log.dir()).unwrap();
        assert_eq!(logs["final_result"]["success"], true);
        assert_eq!(logs["metadata"]["status"], "completed");
        assert_eq!(logs["metadata"]["completed_at"], TS);
    }

    #[test]
    fn test_knowledge_result_preview_is_capped() {
        let temp_dir = TempDir::new().unwrap();
        let log = open(&temp_dir);
        apply_knowledge_event(
            &log,
            EventType::KnowledgeResult,
            TS,
            &json!({"tool_name": "knowledge_query", "results_preview": [1, 2, 3, 4, 5, 6, 7]}),
        )
        .unwrap();

        let logs = assemble(log.dir()).unwrap();
        let record = &logs["knowledge_interactions"][0];
        assert_eq!(record["results_preview"], json!([1, 2, 3, 4, 5]));
        assert_eq!(record["cached"], false);
    }

    #[test]
    fn test_flow_record_shape() {
        let entry = EventStreamEntry::new(EventType::WebhookValidated, &json!({"ok": true}))
            .with_webhook_event_id("wh-1");
        let record = flow_record(&entry, &entry.payload());
        assert_eq!(record["stage"], "validated");
        assert_eq!(record["data"]["ok"], true);
    }
}
