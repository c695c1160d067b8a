//! Tool schema definitions published by `tools/list`.

use serde_json::{json, Value};

pub struct ToolDef {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

pub fn all() -> Vec<ToolDef> {
    vec![
        ToolDef {
            name: "process_start",
            description: "Launch a sandboxed child process under the security policy.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "executable": {"type": "string"},
                    "args": {"type": "array", "items": {"type": "string"}},
                    "cwd": {"type": "string"},
                    "env": {"type": "object"},
                    "captureOutput": {"type": "boolean"},
                    "timeoutMs": {"type": "integer"},
                    "agentId": {"type": "string"}
                },
                "required": ["executable"]
            }),
        },
        ToolDef {
            name: "process_terminate",
            description: "Terminate a managed process, gracefully or forcefully.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "pid": {"type": "integer"},
                    "force": {"type": "boolean"},
                    "timeoutMs": {"type": "integer"}
                },
                "required": ["pid"]
            }),
        },
        ToolDef {
            name: "process_get_stats",
            description: "Retrieve the most recent resource sample for a managed process.",
            input_schema: json!({
                "type": "object",
                "properties": {"pid": {"type": "integer"}},
                "required": ["pid"]
            }),
        },
        ToolDef {
            name: "process_send_stdin",
            description: "Write bytes to a managed process's stdin.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "pid": {"type": "integer"},
                    "data": {"type": "string"},
                    "encoding": {"type": "string"}
                },
                "required": ["pid", "data"]
            }),
        },
        ToolDef {
            name: "process_get_output",
            description: "Retrieve captured stdout/stderr for a managed process.",
            input_schema: json!({
                "type": "object",
                "properties": {"pid": {"type": "integer"}},
                "required": ["pid"]
            }),
        },
        ToolDef {
            name: "process_list",
            description: "List every currently-registered managed process.",
            input_schema: json!({"type": "object", "properties": {}}),
        },
        ToolDef {
            name: "process_get_status",
            description: "Retrieve full status for a managed process.",
            input_schema: json!({
                "type": "object",
                "properties": {"pid": {"type": "integer"}},
                "required": ["pid"]
            }),
        },
        ToolDef {
            name: "process_create_group",
            description: "Create a process group, optionally a stdout-to-stdin pipeline.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string"},
                    "pipeline": {"type": "boolean"}
                },
                "required": ["name"]
            }),
        },
        ToolDef {
            name: "process_add_to_group",
            description: "Add a managed pid to an existing group.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "groupId": {"type": "string"},
                    "pid": {"type": "integer"}
                },
                "required": ["groupId", "pid"]
            }),
        },
        ToolDef {
            name: "process_terminate_group",
            description: "Terminate every process in a group concurrently.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "groupId": {"type": "string"},
                    "force": {"type": "boolean"},
                    "timeoutMs": {"type": "integer"}
                },
                "required": ["groupId"]
            }),
        },
        ToolDef {
            name: "process_start_service",
            description: "Start a long-running service with health-check and restart policy.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string"},
                    "executable": {"type": "string"},
                    "args": {"type": "array", "items": {"type": "string"}},
                    "cwd": {"type": "string"},
                    "env": {"type": "object"},
                    "healthCheck": {"type": "object"},
                    "restartPolicy": {"type": "object"}
                },
                "required": ["name", "executable"]
            }),
        },
        ToolDef {
            name: "process_stop_service",
            description: "Stop a managed service and remove its entry.",
            input_schema: json!({
                "type": "object",
                "properties": {"name": {"type": "string"}},
                "required": ["name"]
            }),
        },
    ]
}
