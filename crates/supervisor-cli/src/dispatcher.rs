//! Dispatcher: translates `tools/call` requests into Core operations and
//! formats `{status, ...}` responses, owning the error-taxonomy mapping.

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use supervisor_core::config::{
    HealthCheckConfig, ProcessConfig, RestartPolicy, ServiceConfig,
};
use supervisor_core::error::{ErrorResponse, SupervisorError};
use supervisor_core::SupervisorState;

pub struct Dispatcher {
    state: Arc<SupervisorState>,
}

impl Dispatcher {
    pub fn new(state: Arc<SupervisorState>) -> Self {
        Dispatcher { state }
    }

    /// Routes one `tools/call` invocation. Never propagates a
    /// `SupervisorError` past this boundary — every failure becomes a
    /// `{status:"error", ...}` JSON value.
    pub async fn call(&self, name: &str, arguments: Value) -> Value {
        let result = match name {
            "process_start" => self.process_start(arguments).await,
            "process_terminate" => self.process_terminate(arguments).await,
            "process_get_stats" => self.process_get_stats(arguments),
            "process_send_stdin" => self.process_send_stdin(arguments),
            "process_get_output" => self.process_get_output(arguments),
            "process_list" => Ok(self.process_list()),
            "process_get_status" => self.process_get_status(arguments),
            "process_create_group" => self.process_create_group(arguments),
            "process_add_to_group" => self.process_add_to_group(arguments),
            "process_terminate_group" => self.process_terminate_group(arguments).await,
            "process_start_service" => self.process_start_service(arguments),
            "process_stop_service" => self.process_stop_service(arguments),
            other => Err(SupervisorError::Unknown(format!("unknown tool `{other}`"))),
        };
        match result {
            Ok(value) => value,
            Err(err) => error_envelope(&err),
        }
    }

    async fn process_start(&self, args: Value) -> Result<Value, SupervisorError> {
        let config = parse_process_config(&args)?;
        let pid = self.state.process_start(config)?;
        Ok(json!({"status": "success", "pid": pid}))
    }

    async fn process_terminate(&self, args: Value) -> Result<Value, SupervisorError> {
        let pid = require_u32(&args, "pid")?;
        let force = args.get("force").and_then(Value::as_bool).unwrap_or(false);
        let timeout_ms = args.get("timeoutMs").and_then(Value::as_u64).unwrap_or(0);
        let result = self.state.process_terminate(pid, force, timeout_ms).await?;
        let status = if result.success { "success" } else { "error" };
        let mut value = serde_json::to_value(&result).unwrap_or_default();
        value["status"] = json!(status);
        Ok(value)
    }

    fn process_get_stats(&self, args: Value) -> Result<Value, SupervisorError> {
        let pid = require_u32(&args, "pid")?;
        let stats = self.state.process_get_stats(pid)?;
        let mut value = serde_json::to_value(&stats).unwrap_or_default();
        value["status"] = json!("success");
        Ok(value)
    }

    fn process_send_stdin(&self, args: Value) -> Result<Value, SupervisorError> {
        let pid = require_u32(&args, "pid")?;
        let data = args
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| SupervisorError::Unknown("missing `data`".to_string()))?;
        let written = self.state.process_send_stdin(pid, data.as_bytes())?;
        Ok(json!({"status": "success", "bytesWritten": written}))
    }

    fn process_get_output(&self, args: Value) -> Result<Value, SupervisorError> {
        let pid = require_u32(&args, "pid")?;
        let output = self.state.process_get_output(pid)?;
        Ok(json!({
            "status": "success",
            "stdout": output.stdout_text,
            "stdoutBytes": output.stdout_bytes,
            "stderr": output.stderr_text,
            "stderrBytes": output.stderr_bytes,
        }))
    }

    fn process_list(&self) -> Value {
        let processes = self.state.process_list();
        json!({"status": "success", "processes": processes})
    }

    fn process_get_status(&self, args: Value) -> Result<Value, SupervisorError> {
        let pid = require_u32(&args, "pid")?;
        let status = self.state.process_get_status(pid)?;
        let mut value = serde_json::to_value(&status).unwrap_or_default();
        value["status"] = json!("success");
        Ok(value)
    }

    fn process_create_group(&self, args: Value) -> Result<Value, SupervisorError> {
        let name = args
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| SupervisorError::Unknown("missing `name`".to_string()))?;
        let pipeline = args.get("pipeline").and_then(Value::as_bool).unwrap_or(false);
        let group_id = self.state.process_create_group(name, pipeline);
        Ok(json!({"status": "success", "groupId": group_id}))
    }

    fn process_add_to_group(&self, args: Value) -> Result<Value, SupervisorError> {
        let group_id = args
            .get("groupId")
            .and_then(Value::as_str)
            .ok_or_else(|| SupervisorError::Unknown("missing `groupId`".to_string()))?;
        let pid = require_u32(&args, "pid")?;
        self.state.process_add_to_group(group_id, pid)?;
        Ok(json!({"status": "success"}))
    }

    async fn process_terminate_group(&self, args: Value) -> Result<Value, SupervisorError> {
        let group_id = args
            .get("groupId")
            .and_then(Value::as_str)
            .ok_or_else(|| SupervisorError::Unknown("missing `groupId`".to_string()))?;
        let force = args.get("force").and_then(Value::as_bool).unwrap_or(false);
        let timeout_ms = args.get("timeoutMs").and_then(Value::as_u64).unwrap_or(0);
        let (results, summary) = self
            .state
            .process_terminate_group(group_id, force, timeout_ms)
            .await?;
        let status = if summary.succeeded == summary.total { "success" } else { "error" };
        Ok(json!({
            "status": status,
            "results": results,
            "total": summary.total,
            "succeeded": summary.succeeded,
        }))
    }

    fn process_start_service(&self, args: Value) -> Result<Value, SupervisorError> {
        let config = parse_service_config(&args)?;
        let status = self.state.process_start_service(config)?;
        let mut value = serde_json::to_value(&status).unwrap_or_default();
        value["status"] = json!("success");
        Ok(value)
    }

    fn process_stop_service(&self, args: Value) -> Result<Value, SupervisorError> {
        let name = args
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| SupervisorError::Unknown("missing `name`".to_string()))?;
        self.state.process_stop_service(name)?;
        Ok(json!({"status": "success"}))
    }
}

fn require_u32(args: &Value, field: &str) -> Result<u32, SupervisorError> {
    args.get(field)
        .and_then(Value::as_u64)
        .map(|v| v as u32)
        .ok_or_else(|| SupervisorError::Unknown(format!("missing or invalid `{field}`")))
}

fn parse_process_config(args: &Value) -> Result<ProcessConfig, SupervisorError> {
    let executable = args
        .get("executable")
        .and_then(Value::as_str)
        .ok_or_else(|| SupervisorError::Unknown("missing `executable`".to_string()))?
        .to_string();
    let process_args = args
        .get("args")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();
    let cwd = args.get("cwd").and_then(Value::as_str).map(String::from);
    let env = args.get("env").and_then(Value::as_object).map(|obj| {
        obj.iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect::<BTreeMap<_, _>>()
    });
    let capture_output = args.get("captureOutput").and_then(Value::as_bool).unwrap_or(false);
    let timeout_ms = args.get("timeoutMs").and_then(Value::as_u64);
    let agent_id = args.get("agentId").and_then(Value::as_str).map(String::from);

    Ok(ProcessConfig {
        executable,
        args: process_args,
        cwd,
        env,
        capture_output,
        timeout_ms,
        resource_limits: None,
        agent_id,
    })
}

fn parse_service_config(args: &Value) -> Result<ServiceConfig, SupervisorError> {
    let name = args
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| SupervisorError::Unknown("missing `name`".to_string()))?
        .to_string();
    let process = parse_process_config(args)?;
    let health_check = args.get("healthCheck").and_then(|v| {
        Some(HealthCheckConfig {
            command: v.get("command")?.as_str()?.to_string(),
            args: v
                .get("args")
                .and_then(Value::as_array)
                .map(|arr| arr.iter().filter_map(|x| x.as_str().map(String::from)).collect())
                .unwrap_or_default(),
            interval_ms: v.get("intervalMs").and_then(Value::as_u64).unwrap_or(30_000),
            timeout_ms: v.get("timeoutMs").and_then(Value::as_u64).unwrap_or(5_000),
        })
    });
    let restart_policy = args
        .get("restartPolicy")
        .map(|v| RestartPolicy {
            enabled: v.get("enabled").and_then(Value::as_bool).unwrap_or(false),
            max_retries: v.get("maxRetries").and_then(Value::as_u64).unwrap_or(0) as u32,
            backoff_ms: v.get("backoffMs").and_then(Value::as_u64).unwrap_or(1000),
        })
        .unwrap_or_default();

    Ok(ServiceConfig {
        name,
        process,
        health_check,
        restart_policy,
    })
}

fn error_envelope(err: &SupervisorError) -> Value {
    let response: ErrorResponse = err.into();
    serde_json::to_value(response).unwrap_or_else(|_| {
        json!({"status": "error", "code": "Unknown", "message": err.to_string()})
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use supervisor_core::config::SecurityConfig;

    fn dispatcher() -> Dispatcher {
        let mut cfg = SecurityConfig::default();
        cfg.allowed_executables = vec!["echo".into(), "/bin/echo".into()];
        let state = SupervisorState::new(cfg).unwrap();
        Dispatcher::new(state)
    }

    #[tokio::test]
    async fn unknown_tool_returns_error_envelope() {
        let dispatcher = dispatcher();
        let result = dispatcher.call("not_a_real_tool", json!({})).await;
        assert_eq!(result["status"], json!("error"));
    }

    #[tokio::test]
    async fn process_list_returns_success_envelope() {
        let dispatcher = dispatcher();
        let result = dispatcher.call("process_list", json!({})).await;
        assert_eq!(result["status"], json!("success"));
        assert_eq!(result["processes"], json!([]));
    }

    #[tokio::test]
    async fn process_start_missing_executable_is_error() {
        let dispatcher = dispatcher();
        let result = dispatcher.call("process_start", json!({})).await;
        assert_eq!(result["status"], json!("error"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_start_disallowed_executable_returns_security_error() {
        let dispatcher = dispatcher();
        let result = dispatcher
            .call("process_start", json!({"executable": "sudo", "args": ["ls"]}))
            .await;
        assert_eq!(result["status"], json!("error"));
        assert_eq!(result["code"], json!("DangerousExecutable"));
    }
}
