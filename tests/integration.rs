use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

const BIN: &str = env!("CARGO_BIN_EXE_mcp-fs-sandbox");

struct RpcClient {
	child: Child,
	stdin: ChildStdin,
	stdout: BufReader<ChildStdout>,
	next_id: u64,
}

impl RpcClient {
	fn spawn(root: &Path) -> Self {
		let mut child = Command::new(BIN)
			.arg(root)
			.current_dir(root)
			.env_remove("MCP_ALLOWED_ROOTS")
			.env_remove("MCP_CONFIG")
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::null())
			.spawn()
			.expect("spawn mcp-fs-sandbox");
		let stdin = child.stdin
			.take()
			.expect("stdin");
		let stdout = child.stdout
			.take()
			.expect("stdout");
		Self {
			child,
			stdin,
			stdout: BufReader::new(stdout),
			next_id: 1
		}
	}
	fn write_line(&mut self, req: &Value) {
		let line = serde_json::to_string(req).expect("serialize request");
		writeln!(self.stdin, "{}", line).expect("write request");
		self.stdin
			.flush()
			.expect("flush request");
	}
	fn notify(&mut self, method: &str) {
		self.write_line(&json!({
			"jsonrpc": "2.0",
			"method": method
		}));
	}
	fn send(&mut self, method: &str, params: Value) -> Value {
		let id = self.next_id;
		self.next_id += 1;
		self.write_line(&json!({
			"jsonrpc": "2.0",
			"id": id,
			"method": method,
			"params": params
		}));
		let mut resp_line = String::new();
		loop {
			resp_line.clear();
			let bytes = self.stdout
				.read_line(&mut resp_line)
				.expect("read response");
			if bytes == 0 {
				panic!("mcp-fs-sandbox exited unexpectedly");
			}
			let trimmed = resp_line.trim();
			if trimmed.is_empty() {
				continue;
			}
			let parsed: Value = match serde_json::from_str(trimmed) {
				Ok(value) => value,
				Err(_) => continue,
			};
			assert!(parsed.get("id").and_then(Value::as_u64).is_some(), "unexpected response without id: {}", parsed);
			if parsed.get("id").and_then(Value::as_u64) == Some(id) {
				return parsed;
			}
		}
	}
	fn call(&mut self, name: &str, arguments: Value) -> Value {
		let resp = self.send("tools/call", json!({
			"name": name,
			"arguments": arguments
		}));
		resp.get("result")
			.cloned()
			.unwrap_or_else(|| panic!("no result in {}", resp))
	}
}

impl Drop for RpcClient {
	fn drop(&mut self) {
		let _ = self.child.kill();
	}
}

fn write_text(path: &Path, contents: &str) {
	std::fs::create_dir_all(path.parent().expect("parent")).expect("create parent");
	std::fs::write(path, contents).expect("write file");
}

fn text_lines(count: usize) -> String {
	(1..=count).map(|n| format!("line {}", n)).collect::<Vec<_>>().join("\n")
}

fn text_of(result: &Value) -> String {
	result.get("content")
		.and_then(Value::as_array)
		.and_then(|items| items.first())
		.and_then(|item| item.get("text"))
		.and_then(Value::as_str)
		.unwrap_or_default()
		.to_string()
}

fn error_code(result: &Value) -> Option<String> {
	if result.get("isError").and_then(Value::as_bool) != Some(true) {
		return None;
	}
	result.get("structuredContent")
		.and_then(|s| s.get("code"))
		.and_then(Value::as_str)
		.map(str::to_string)
}

#[test]
fn initialize_and_list_tools() {
	let root = tempfile::tempdir().expect("tempdir");
	let mut client = RpcClient::spawn(root.path());
	let resp = client.send("initialize", json!({}));
	let result = resp.get("result").expect("result");
	assert_eq!(
		result.get("serverInfo").and_then(|info| info.get("name")).and_then(Value::as_str),
		Some("mcp-fs-sandbox")
	);
	client.notify("notifications/initialized");
	let resp = client.send("tools/list", json!({}));
	let tools = resp.get("result")
		.and_then(|r| r.get("tools"))
		.and_then(Value::as_array)
		.expect("tools");
	assert_eq!(tools.len(), 12);
	let resp = client.send("ping", json!({}));
	assert!(resp.get("result").is_some());
	let resp = client.send("no/such/method", json!({}));
	assert_eq!(resp.get("error").and_then(|e| e.get("code")).and_then(Value::as_i64), Some(-32601));
}

#[test]
fn read_file_head_and_tail() {
	let root = tempfile::tempdir().expect("tempdir");
	write_text(&root.path().join("log.txt"), &text_lines(100));
	let mut client = RpcClient::spawn(root.path());
	let result = client.call("read_file", json!({ "path": "log.txt", "head": 10, "tail": 5 }));
	let text = text_of(&result);
	let lines: Vec<&str> = text.lines().collect();
	assert_eq!(lines.len(), 16);
	assert_eq!(lines[9], "line 10");
	assert_eq!(lines[10], "...");
	assert_eq!(lines[11], "line 96");
	let result = client.call("read_file", json!({ "path": "log.txt", "tail": 2 }));
	assert_eq!(text_of(&result), "line 99\nline 100");
	let result = client.call("read_file", json!({ "path": "log.txt", "head": u64::MAX, "tail": 1 }));
	assert_eq!(text_of(&result), text_lines(100));
	let resp = client.send("ping", json!({}));
	assert!(resp.get("result").is_some());
}

#[test]
fn read_multiple_files_reports_missing_inline() {
	let root = tempfile::tempdir().expect("tempdir");
	write_text(&root.path().join("a.txt"), "alpha");
	write_text(&root.path().join("b.txt"), "beta");
	let mut client = RpcClient::spawn(root.path());
	let result = client.call("read_multiple_files", json!({ "paths": ["a.txt", "missing.txt", "b.txt"] }));
	assert!(result.get("isError").is_none());
	let text = text_of(&result);
	let parts: Vec<&str> = text.split("\n---\n").collect();
	assert_eq!(parts.len(), 3);
	assert!(parts[0].contains("alpha"));
	assert!(parts[1].starts_with("missing.txt: Error"));
	assert!(parts[2].contains("beta"));
	let structured = result.get("structuredContent").expect("structured");
	assert_eq!(structured.get("failed").and_then(Value::as_u64), Some(1));
}

#[test]
fn write_then_read_round_trip() {
	let root = tempfile::tempdir().expect("tempdir");
	let mut client = RpcClient::spawn(root.path());
	let result = client.call("write_file", json!({ "path": "notes.md", "content": "# Notes\n" }));
	assert!(error_code(&result).is_none());
	assert_eq!(std::fs::read_to_string(root.path().join("notes.md")).expect("read"), "# Notes\n");
	let result = client.call("write_file", json!({ "path": "nope/notes.md", "content": "x" }));
	assert_eq!(error_code(&result).as_deref(), Some("PARENT_MISSING"));
}

#[test]
fn edit_file_dry_run_matches_real_run() {
	let root = tempfile::tempdir().expect("tempdir");
	let file = root.path().join("server.js");
	write_text(&file, "const port = 3000;\napp.listen(port);\n");
	let mut client = RpcClient::spawn(root.path());
	let edits = json!([{ "oldText": "const port = 3000;", "newText": "const port = process.env.PORT || 3000;" }]);
	let preview = client.call("edit_file", json!({ "path": "server.js", "edits": edits, "dryRun": true }));
	assert!(error_code(&preview).is_none());
	assert!(text_of(&preview).starts_with("```diff\n"));
	assert_eq!(std::fs::read_to_string(&file).expect("read"), "const port = 3000;\napp.listen(port);\n");
	let preview_uri = preview.get("structuredContent")
		.and_then(|s| s.get("previewUri"))
		.and_then(Value::as_str)
		.expect("preview uri")
		.to_string();
	let applied = client.call("edit_file", json!({ "path": "server.js", "edits": edits }));
	assert!(error_code(&applied).is_none());
	assert_eq!(
		preview.get("structuredContent").and_then(|s| s.get("diff")),
		applied.get("structuredContent").and_then(|s| s.get("diff"))
	);
	assert_eq!(
		std::fs::read_to_string(&file).expect("read"),
		"const port = process.env.PORT || 3000;\napp.listen(port);\n"
	);
	let resp = client.send("resources/read", json!({ "uri": preview_uri }));
	let text = resp.get("result")
		.and_then(|r| r.get("contents"))
		.and_then(|c| c.get(0))
		.and_then(|c| c.get("text"))
		.and_then(Value::as_str)
		.expect("diff resource");
	assert!(text.contains("+const port = process.env.PORT || 3000;"));
}

#[test]
fn edit_file_fuzzy_match_and_missing_text() {
	let root = tempfile::tempdir().expect("tempdir");
	let file = root.path().join("main.py");
	write_text(&file, "def main():\n    total = 1\n    print(total)\n");
	let mut client = RpcClient::spawn(root.path());
	let result = client.call("edit_file", json!({
		"path": "main.py",
		"edits": [{ "oldText": "total = 1  \nprint(total)", "newText": "total = 2\nprint(total)" }]
	}));
	assert!(error_code(&result).is_none(), "{}", result);
	assert_eq!(
		std::fs::read_to_string(&file).expect("read"),
		"def main():\n    total = 2\nprint(total)\n"
	);
	let result = client.call("edit_file", json!({
		"path": "main.py",
		"edits": [{ "oldText": "does not exist", "newText": "x" }]
	}));
	assert_eq!(error_code(&result).as_deref(), Some("EDIT_NOT_FOUND"));
}

#[test]
fn edit_file_rejects_invalid_json() {
	let root = tempfile::tempdir().expect("tempdir");
	let file = root.path().join("config.json");
	write_text(&file, "{\"a\": 1}\n");
	let mut client = RpcClient::spawn(root.path());
	let edits = json!([{ "oldText": "\"a\": 1", "newText": "\"a\": 1," }]);
	let result = client.call("edit_file", json!({ "path": "config.json", "edits": edits }));
	assert_eq!(error_code(&result).as_deref(), Some("VALIDATION_FAILED"));
	assert!(text_of(&result).contains("skipValidation"));
	assert_eq!(std::fs::read_to_string(&file).expect("read"), "{\"a\": 1}\n");
	let result = client.call("edit_file", json!({ "path": "config.json", "edits": edits, "skipValidation": true }));
	assert!(error_code(&result).is_none());
	assert_eq!(std::fs::read_to_string(&file).expect("read"), "{\"a\": 1,}\n");
}

#[test]
fn search_files_with_wildcard() {
	let root = tempfile::tempdir().expect("tempdir");
	write_text(&root.path().join("ci/deploy-pipeline.yml"), "x");
	write_text(&root.path().join("src/pipeline-config.js"), "x");
	write_text(&root.path().join("src/other.js"), "x");
	let mut client = RpcClient::spawn(root.path());
	let result = client.call("search_files", json!({ "path": ".", "pattern": "*pipeline*" }));
	let structured = result.get("structuredContent").expect("structured");
	assert_eq!(structured.get("count").and_then(Value::as_u64), Some(2));
	let text = text_of(&result);
	assert!(text.contains("deploy-pipeline.yml"));
	assert!(text.contains("pipeline-config.js"));
	let result = client.call("search_files", json!({ "path": ".", "pattern": "*.js", "excludePatterns": ["src"] }));
	assert_eq!(text_of(&result), "No matches found");
}

#[test]
fn delete_needs_recursive_for_populated_directory() {
	let root = tempfile::tempdir().expect("tempdir");
	write_text(&root.path().join("build/out/app.bin"), "x");
	let mut client = RpcClient::spawn(root.path());
	let result = client.call("delete_file", json!({ "path": "build" }));
	assert_eq!(error_code(&result).as_deref(), Some("NOT_EMPTY"));
	assert!(root.path().join("build/out/app.bin").exists());
	let result = client.call("delete_file", json!({ "path": "build", "recursive": true }));
	assert!(error_code(&result).is_none());
	assert!(!root.path().join("build").exists());
	let result = client.call("delete_file", json!({ "path": "." }));
	assert_eq!(error_code(&result).as_deref(), Some("ROOT_PROTECTED"));
}

#[test]
fn move_file_and_target_exists() {
	let root = tempfile::tempdir().expect("tempdir");
	write_text(&root.path().join("src/nested/file.txt"), "data");
	write_text(&root.path().join("taken.txt"), "taken");
	let mut client = RpcClient::spawn(root.path());
	let result = client.call("move_file", json!({ "source": "src", "destination": "dst" }));
	assert!(error_code(&result).is_none());
	assert!(root.path().join("dst/nested/file.txt").exists());
	assert!(!root.path().join("src").exists());
	let result = client.call("move_file", json!({ "source": "dst/nested/file.txt", "destination": "taken.txt" }));
	assert_eq!(error_code(&result).as_deref(), Some("TARGET_EXISTS"));
	assert_eq!(std::fs::read_to_string(root.path().join("taken.txt")).expect("read"), "taken");
}

#[test]
fn paths_outside_root_are_denied() {
	let base = tempfile::tempdir().expect("tempdir");
	let root = base.path().join("root");
	std::fs::create_dir_all(&root).expect("root");
	write_text(&base.path().join("escape.txt"), "secret");
	let mut client = RpcClient::spawn(&root);
	let result = client.call("read_file", json!({ "path": "../escape.txt" }));
	assert_eq!(error_code(&result).as_deref(), Some("ACCESS_DENIED"));
	let absolute = base.path().join("escape.txt");
	let result = client.call("write_file", json!({ "path": absolute.to_string_lossy(), "content": "x" }));
	assert_eq!(error_code(&result).as_deref(), Some("ACCESS_DENIED"));
	assert_eq!(std::fs::read_to_string(&absolute).expect("read"), "secret");
}

#[test]
fn directories_info_and_roots() {
	let root = tempfile::tempdir().expect("tempdir");
	let mut client = RpcClient::spawn(root.path());
	let result = client.call("create_directory", json!({ "path": "a/b/c" }));
	assert!(error_code(&result).is_none());
	let result = client.call("create_directory", json!({ "path": "a/b/c" }));
	assert!(error_code(&result).is_none());
	write_text(&root.path().join("a/file.txt"), "12345");
	let result = client.call("list_directory", json!({ "path": "a" }));
	assert_eq!(text_of(&result), "[DIR] b\n[FILE] file.txt");
	let result = client.call("get_file_info", json!({ "path": "a/file.txt" }));
	let structured = result.get("structuredContent").expect("structured");
	assert_eq!(structured.get("size").and_then(Value::as_u64), Some(5));
	assert_eq!(structured.get("isFile").and_then(Value::as_bool), Some(true));
	let result = client.call("list_allowed_directories", json!({}));
	let roots = result.get("structuredContent")
		.and_then(|s| s.get("roots"))
		.and_then(Value::as_array)
		.expect("roots");
	assert_eq!(roots.len(), 1);
}

#[cfg(unix)]
#[test]
fn run_command_output_failure_and_timeout() {
	let root = tempfile::tempdir().expect("tempdir");
	write_text(&root.path().join("sub/marker.txt"), "x");
	let mut client = RpcClient::spawn(root.path());
	let result = client.call("run_command", json!({ "command": "ls", "workingDirectory": "sub" }));
	assert!(error_code(&result).is_none());
	assert_eq!(text_of(&result).trim(), "marker.txt");
	let result = client.call("run_command", json!({ "command": "echo out; echo err 1>&2", "includeStderr": true }));
	assert!(text_of(&result).contains("[stderr]\nerr"));
	let result = client.call("run_command", json!({ "command": "exit 4" }));
	assert_eq!(error_code(&result).as_deref(), Some("COMMAND_FAILED"));
	let structured = result.get("structuredContent").expect("structured");
	assert_eq!(structured.get("exitCode").and_then(Value::as_i64), Some(4));
	assert_eq!(structured.get("killed").and_then(Value::as_bool), Some(false));
	let result = client.call("run_command", json!({ "command": "sleep 5", "timeout": 200 }));
	assert_eq!(error_code(&result).as_deref(), Some("COMMAND_FAILED"));
	let structured = result.get("structuredContent").expect("structured");
	assert_eq!(structured.get("killed").and_then(Value::as_bool), Some(true));
	let result = client.call("run_command", json!({ "command": "pwd", "workingDirectory": "/" }));
	assert_eq!(error_code(&result).as_deref(), Some("ACCESS_DENIED"));
}

#[test]
fn startup_fails_for_missing_root() {
	let base = tempfile::tempdir().expect("tempdir");
	let output = Command::new(BIN)
		.arg(base.path().join("does-not-exist"))
		.env_remove("MCP_ALLOWED_ROOTS")
		.env_remove("MCP_CONFIG")
		.stdin(Stdio::null())
		.output()
		.expect("run binary");
	assert!(!output.status.success());
	let output = Command::new(BIN)
		.env_remove("MCP_ALLOWED_ROOTS")
		.env_remove("MCP_CONFIG")
		.stdin(Stdio::null())
		.output()
		.expect("run binary");
	assert!(!output.status.success());
}
