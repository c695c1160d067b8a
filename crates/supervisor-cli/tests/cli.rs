//! Black-box tests driving the compiled `mcp-process` binary: clap smoke
//! tests via `assert_cmd`, plus end-to-end JSON-RPC stdio round trips
//! exercising the same properties the core test suites cover from inside
//! the process.

use assert_cmd::Command as AssertCommand;
use predicates::str::contains;
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::process::{Command, Stdio};
use std::time::Duration;

#[test]
fn help_smoke() {
    AssertCommand::cargo_bin("mcp-process")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("mcp-process"));
}

#[test]
fn create_config_writes_sample_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sample.json");

    AssertCommand::cargo_bin("mcp-process")
        .unwrap()
        .arg("--create-config")
        .arg(path.to_str().unwrap())
        .assert()
        .success()
        .stdout(contains("wrote sample config"));

    let contents = std::fs::read_to_string(&path).unwrap();
    let parsed: Value = serde_json::from_str(&contents).unwrap();
    assert!(parsed["allowedExecutables"].as_array().unwrap().len() > 0);
}

/// Drives the stdio JSON-RPC loop of a freshly spawned supervisor, with an
/// allowlist limited to `echo`/`cat` for the duration of one test.
struct Session {
    child: std::process::Child,
    stdin: std::process::ChildStdin,
    stdout: BufReader<std::process::ChildStdout>,
    _config_dir: tempfile::TempDir,
}

impl Session {
    fn spawn() -> Self {
        let config_dir = tempfile::tempdir().unwrap();
        let config_path = config_dir.path().join("config.json");
        let config = json!({
            "allowedExecutables": ["echo", "cat", "/bin/echo", "/bin/cat", "/usr/bin/echo", "/usr/bin/cat"],
            "maxConcurrentProcesses": 16,
            "maxLaunchesPerMinute": 120,
        });
        std::fs::write(&config_path, serde_json::to_string(&config).unwrap()).unwrap();

        let mut child = Command::new(assert_cmd::cargo::cargo_bin("mcp-process"))
            .arg("--config")
            .arg(&config_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn mcp-process");

        let stdin = child.stdin.take().unwrap();
        let stdout = BufReader::new(child.stdout.take().unwrap());
        Session {
            child,
            stdin,
            stdout,
            _config_dir: config_dir,
        }
    }

    fn request(&mut self, id: i64, method: &str, params: Value) -> Value {
        let request = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        writeln!(self.stdin, "{}", request).unwrap();
        self.stdin.flush().unwrap();

        let mut line = String::new();
        self.stdout.read_line(&mut line).expect("read response line");
        serde_json::from_str(&line).expect("valid json-rpc response")
    }

    fn call_tool(&mut self, id: i64, name: &str, arguments: Value) -> Value {
        let response = self.request(id, "tools/call", json!({"name": name, "arguments": arguments}));
        let text = response["result"]["content"][0]["text"].as_str().unwrap().to_string();
        serde_json::from_str(&text).unwrap()
    }

    fn shutdown(mut self) {
        drop(self.stdin);
        let _ = self.child.wait();
    }
}

#[test]
fn initialize_and_tools_list_round_trip() {
    let mut session = Session::spawn();

    let init = session.request(1, "initialize", json!({}));
    assert_eq!(init["id"], json!(1));
    assert_eq!(init["result"]["protocolVersion"], json!("2024-11-05"));

    let list = session.request(2, "tools/list", json!({}));
    let tools = list["result"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 12);
    let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
    assert!(names.contains(&"process_start"));
    assert!(names.contains(&"process_terminate_group"));

    session.shutdown();
}

#[test]
fn process_start_get_output_and_terminate() {
    let mut session = Session::spawn();
    session.request(1, "initialize", json!({}));

    let started = session.call_tool(
        2,
        "process_start",
        json!({"executable": "echo", "args": ["hello-supervisor"], "captureOutput": true}),
    );
    assert_eq!(started["status"], json!("success"));
    let pid = started["pid"].as_u64().unwrap();

    std::thread::sleep(Duration::from_millis(200));

    let output = session.call_tool(3, "process_get_output", json!({"pid": pid}));
    assert_eq!(output["status"], json!("success"));
    assert!(output["stdout"].as_str().unwrap().contains("hello-supervisor"));

    let status = session.call_tool(4, "process_get_status", json!({"pid": pid}));
    assert_eq!(status["status"], json!("success"));

    session.shutdown();
}

#[test]
fn process_start_rejects_unlisted_executable() {
    let mut session = Session::spawn();
    session.request(1, "initialize", json!({}));

    let result = session.call_tool(2, "process_start", json!({"executable": "curl", "args": []}));
    assert_eq!(result["status"], json!("error"));
    assert_eq!(result["code"], json!("NotInAllowlist"));

    session.shutdown();
}

#[test]
fn process_group_lifecycle() {
    let mut session = Session::spawn();
    session.request(1, "initialize", json!({}));

    let group = session.call_tool(2, "process_create_group", json!({"name": "demo", "pipeline": false}));
    assert_eq!(group["status"], json!("success"));
    let group_id = group["groupId"].as_str().unwrap().to_string();

    let started = session.call_tool(3, "process_start", json!({"executable": "cat", "args": []}));
    let pid = started["pid"].as_u64().unwrap();

    let added = session.call_tool(4, "process_add_to_group", json!({"groupId": group_id, "pid": pid}));
    assert_eq!(added["status"], json!("success"));

    let terminated = session.call_tool(
        5,
        "process_terminate_group",
        json!({"groupId": group_id, "force": true, "timeoutMs": 500}),
    );
    assert_eq!(terminated["status"], json!("success"));
    assert_eq!(terminated["total"], json!(1));
    assert_eq!(terminated["succeeded"], json!(1));
    let results = terminated["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["pid"], json!(pid));
    assert_eq!(results[0]["success"], json!(true));
    assert!(results[0]["reason"] == json!("forced") || results[0]["reason"] == json!("alreadyterminal"));

    session.shutdown();
}

#[test]
fn unknown_tool_name_reports_is_error() {
    let mut session = Session::spawn();
    session.request(1, "initialize", json!({}));

    let response = session.request(2, "tools/call", json!({"name": "not_a_tool", "arguments": {}}));
    assert_eq!(response["result"]["isError"], json!(true));

    session.shutdown();
}
