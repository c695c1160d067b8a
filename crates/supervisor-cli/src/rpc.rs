//! JSON-RPC 2.0 framed as newline-delimited JSON over stdio.

use crate::dispatcher::Dispatcher;
use crate::tools;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct Response {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<Value>,
}

/// Runs the request/response loop until stdin reaches EOF.
pub async fn run_stdio_loop(dispatcher: Dispatcher) {
    let stdin = tokio::io::stdin();
    let mut reader = BufReader::new(stdin).lines();
    let mut stdout = tokio::io::stdout();

    while let Ok(Some(line)) = reader.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_line(&dispatcher, &line).await;
        if let Ok(serialized) = serde_json::to_string(&response) {
            let _ = stdout.write_all(serialized.as_bytes()).await;
            let _ = stdout.write_all(b"\n").await;
            let _ = stdout.flush().await;
        }
    }
}

async fn handle_line(dispatcher: &Dispatcher, line: &str) -> Response {
    let request: Request = match serde_json::from_str(line) {
        Ok(req) => req,
        Err(e) => {
            return Response {
                jsonrpc: "2.0",
                id: Value::Null,
                result: None,
                error: Some(json!({"code": -32700, "message": format!("parse error: {e}")})),
            }
        }
    };

    match request.method.as_str() {
        "initialize" => Response {
            jsonrpc: "2.0",
            id: request.id,
            result: Some(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "serverInfo": {"name": "mcp-process", "version": env!("CARGO_PKG_VERSION")},
                "capabilities": {"tools": {}},
            })),
            error: None,
        },
        "tools/list" => {
            let tool_list: Vec<Value> = tools::all()
                .into_iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "inputSchema": t.input_schema,
                    })
                })
                .collect();
            Response {
                jsonrpc: "2.0",
                id: request.id,
                result: Some(json!({"tools": tool_list})),
                error: None,
            }
        }
        "tools/call" => {
            let tool_name = request
                .params
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let arguments = request
                .params
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| json!({}));

            if tool_name.is_empty() || !tools::all().iter().any(|t| t.name == tool_name) {
                let body = json!({"status": "error", "code": "Unknown", "message": format!("unknown tool `{tool_name}`")});
                return Response {
                    jsonrpc: "2.0",
                    id: request.id,
                    result: Some(json!({
                        "content": [{"type": "text", "text": body.to_string()}],
                        "isError": true,
                    })),
                    error: None,
                };
            }

            let outcome = dispatcher.call(&tool_name, arguments).await;
            let is_error = outcome.get("status").and_then(Value::as_str) == Some("error");
            Response {
                jsonrpc: "2.0",
                id: request.id,
                result: Some(json!({
                    "content": [{"type": "text", "text": outcome.to_string()}],
                    "isError": is_error,
                })),
                error: None,
            }
        }
        other => Response {
            jsonrpc: "2.0",
            id: request.id,
            result: None,
            error: Some(json!({
                "code": -32601,
                "message": format!("unknown method `{other}`"),
            })),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use supervisor_core::config::SecurityConfig;

    fn dispatcher() -> Dispatcher {
        let mut cfg = SecurityConfig::default();
        cfg.allowed_executables = vec!["echo".into()];
        Dispatcher::new(supervisor_core::SupervisorState::new(cfg).unwrap())
    }

    #[tokio::test]
    async fn initialize_echoes_request_id() {
        let dispatcher = dispatcher();
        let response = handle_line(&dispatcher, r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#).await;
        assert_eq!(response.id, json!(1));
        assert!(response.result.is_some());
    }

    #[tokio::test]
    async fn tools_list_contains_all_twelve_tools() {
        let dispatcher = dispatcher();
        let response = handle_line(&dispatcher, r#"{"jsonrpc":"2.0","id":2,"method":"tools/list","params":{}}"#).await;
        let tools = response.result.unwrap()["tools"].as_array().unwrap().len();
        assert_eq!(tools, 12);
    }

    #[tokio::test]
    async fn unknown_method_returns_json_rpc_error() {
        let dispatcher = dispatcher();
        let response = handle_line(&dispatcher, r#"{"jsonrpc":"2.0","id":3,"method":"bogus","params":{}}"#).await;
        assert!(response.error.is_some());
    }

    #[tokio::test]
    async fn unknown_tool_name_sets_is_error() {
        let dispatcher = dispatcher();
        let response = handle_line(
            &dispatcher,
            r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"not_a_tool","arguments":{}}}"#,
        )
        .await;
        let result = response.result.unwrap();
        assert_eq!(result["isError"], json!(true));
    }
}
