use crate::edit::{self, EditOperation, EditRequest};
use crate::error::{error_code, format_io_error, FsError};
use crate::fs;
use crate::guard::{canonical_root, PathGuard};
use crate::protocol::{Request, Response, INVALID_PARAMS, METHOD_NOT_FOUND, PARSE_ERROR, SERVER_ERROR};
use crate::search;
use anyhow::{anyhow, Result};
use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace as sdktrace;
use opentelemetry_semantic_conventions::resource as semconv;
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, info_span, warn, Span};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const SERVER_NAME: &str = "mcp-fs-sandbox";
const PROTOCOL_VERSION: &str = "2024-11-05";
const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug)]
struct ProtocolError {
	code: i64,
	message: String,
}

impl ProtocolError {
	fn new(code: i64, message: impl Into<String>) -> Self {
		Self {
			code,
			message: message.into()
		}
	}
}

impl std::fmt::Display for ProtocolError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.message)
	}
}

impl std::error::Error for ProtocolError {}

#[derive(Clone)]
struct PreviewEntry {
	uri: String,
	diff: String,
	path: String,
}

/// LRU of dry-run edit diffs, keyed by `ui://edit_file/<id>`.
struct PreviewCache {
	capacity: Option<usize>,
	map: HashMap<String, PreviewEntry>,
	order: VecDeque<String>,
}

impl PreviewCache {
	fn new(capacity: Option<usize>) -> Self {
		Self {
			capacity,
			map: HashMap::new(),
			order: VecDeque::new()
		}
	}
	fn set_capacity(&mut self, capacity: Option<usize>) {
		self.capacity = capacity;
		self.trim();
	}
	fn insert(&mut self, entry: PreviewEntry) {
		let key = entry.uri.clone();
		if self.map.contains_key(&key) {
			self.touch(&key);
			self.map.insert(key, entry);
			return;
		}
		self.map.insert(key.clone(), entry);
		self.order.push_back(key);
		self.trim();
	}
	fn get(&mut self, uri: &str) -> Option<PreviewEntry> {
		if self.map.contains_key(uri) {
			self.touch(uri);
		}
		self.map
			.get(uri)
			.cloned()
	}
	fn list(&self) -> Vec<PreviewEntry> {
		self.order
			.iter()
			.filter_map(|key| self.map.get(key))
			.cloned()
			.collect()
	}
	fn touch(&mut self, uri: &str) {
		if let Some(pos) = self.order
			.iter()
			.position(|item| item == uri) {
			self.order.remove(pos);
		}
		self.order.push_back(uri.to_string());
	}
	fn trim(&mut self) {
		let Some(capacity) = self.capacity else {
			return;
		};
		while self.order.len() > capacity {
			if let Some(key) = self.order.pop_front() {
				self.map.remove(&key);
			}
		}
	}
}

static PREVIEW_CACHE: Lazy<Mutex<PreviewCache>> = Lazy::new(|| Mutex::new(PreviewCache::new(Some(100))));

fn preview_cache() -> MutexGuard<'static, PreviewCache> {
	PREVIEW_CACHE.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
pub struct Config {
	pub guard: PathGuard,
	pub command_timeout: Duration,
	pub preview_cache_size: Option<usize>,
	pub otel_enabled: bool,
	pub otel_endpoint: String,
	pub otel_service_name: String,
	pub session_id: String,
}

struct Settings {
	roots: Vec<String>,
	command_timeout_ms: u64,
	preview_cache_size: Option<usize>,
	otel_enabled: bool,
	otel_endpoint: String,
	otel_service_name: String,
}

pub fn load_config() -> Result<Config> {
	let mut settings = Settings {
		roots: Vec::new(),
		command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
		preview_cache_size: Some(100),
		otel_enabled: false,
		otel_endpoint: String::from("http://127.0.0.1:4317"),
		otel_service_name: String::from(SERVER_NAME),
	};
	let mut config_path: Option<String> = None;
	if let Ok(env_config) = std::env::var("MCP_CONFIG") {
		if !env_config.trim().is_empty() {
			config_path = Some(env_config);
		}
	}
	if let Ok(env_roots) = std::env::var("MCP_ALLOWED_ROOTS") {
		for value in env_roots.split(',') {
			let trimmed = value.trim();
			if !trimmed.is_empty() {
				settings.roots.push(trimmed.to_string());
			}
		}
	}
	if let Ok(env_timeout) = std::env::var("MCP_COMMAND_TIMEOUT_MS") {
		if !env_timeout.trim().is_empty() {
			settings.command_timeout_ms = parse_timeout(&env_timeout, "MCP_COMMAND_TIMEOUT_MS")?;
		}
	}
	if let Ok(env_limit) = std::env::var("MCP_PREVIEW_CACHE_SIZE") {
		if !env_limit.trim().is_empty() {
			settings.preview_cache_size = parse_optional_limit(&env_limit, "MCP_PREVIEW_CACHE_SIZE")?;
		}
	}
	if let Ok(env_enabled) = std::env::var("MCP_OTEL_ENABLED") {
		if !env_enabled.trim().is_empty() {
			settings.otel_enabled = parse_bool(&env_enabled, "MCP_OTEL_ENABLED")?;
		}
	}
	if let Ok(env_endpoint) = std::env::var("MCP_OTEL_ENDPOINT") {
		if !env_endpoint.trim().is_empty() {
			settings.otel_endpoint = env_endpoint;
		}
	}
	if let Ok(env_service) = std::env::var("MCP_OTEL_SERVICE_NAME") {
		if !env_service.trim().is_empty() {
			settings.otel_service_name = env_service;
		}
	}
	let mut print_schema = false;
	let mut args = std::env::args().skip(1);
	while let Some(arg) = args.next() {
		match arg.as_str() {
			"--config" => {
				let value = args.next().ok_or_else(|| anyhow!("--config requires a value"))?;
				config_path = Some(value);
			}
			"--print-config-schema" => {
				print_schema = true;
			}
			"--command-timeout-ms" => {
				let value = args.next().ok_or_else(|| anyhow!("--command-timeout-ms requires a value"))?;
				settings.command_timeout_ms = parse_timeout(&value, "--command-timeout-ms")?;
			}
			"--preview-cache-size" => {
				let value = args.next().ok_or_else(|| anyhow!("--preview-cache-size requires a value"))?;
				settings.preview_cache_size = parse_optional_limit(&value, "--preview-cache-size")?;
			}
			"--otel-enabled" => {
				let value = args.next().ok_or_else(|| anyhow!("--otel-enabled requires a value"))?;
				settings.otel_enabled = parse_bool(&value, "--otel-enabled")?;
			}
			"--otel-endpoint" => {
				let value = args.next().ok_or_else(|| anyhow!("--otel-endpoint requires a value"))?;
				settings.otel_endpoint = value;
			}
			"--otel-service-name" => {
				let value = args.next().ok_or_else(|| anyhow!("--otel-service-name requires a value"))?;
				settings.otel_service_name = value;
			}
			flag if flag.starts_with("--") => return Err(anyhow!("unknown argument: {}", flag)),
			root => settings.roots.push(root.to_string()),
		}
	}
	if print_schema {
		let schema = config_schema();
		let payload = serde_json::to_string_pretty(&schema)?;
		println!("{}", payload);
		std::process::exit(0);
	}
	if let Some(path) = config_path {
		let override_value = load_config_value(&path)?;
		apply_config_override(&mut settings, &override_value)?;
	}
	let cwd = std::env::current_dir()?;
	build_config(settings, &cwd)
}

fn build_config(settings: Settings, cwd: &Path) -> Result<Config> {
	if settings.roots.is_empty() {
		return Err(anyhow!("usage: {} <allowed-directory> [additional-directories...]", SERVER_NAME));
	}
	let roots = settings.roots
		.iter()
		.map(|raw| canonical_root(raw, cwd))
		.collect::<Result<Vec<_>>>()?;
	Ok(Config {
		guard: PathGuard::new(roots, cwd.to_path_buf()),
		command_timeout: Duration::from_millis(settings.command_timeout_ms),
		preview_cache_size: settings.preview_cache_size,
		otel_enabled: settings.otel_enabled,
		otel_endpoint: settings.otel_endpoint,
		otel_service_name: settings.otel_service_name,
		session_id: uuid::Uuid::new_v4().to_string(),
	})
}

pub fn init_preview_cache(config: &Config) {
	preview_cache().set_capacity(config.preview_cache_size);
}

pub fn init_tracing(config: &Config) {
	let _ = global::set_error_handler(|_| {});
	let default_root = config.guard
		.default_root()
		.map(|root| root.display().to_string())
		.unwrap_or_default();
	let resource = Resource::new(
		vec![
		opentelemetry::KeyValue::new(semconv::SERVICE_NAME, config.otel_service_name.clone()),
		opentelemetry::KeyValue::new(semconv::SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
		opentelemetry::KeyValue::new("mcp.session_id", config.session_id.clone()),
		opentelemetry::KeyValue::new("mcp.root", default_root),
		]
	);
	let tracing_layer = if config.otel_enabled {
		let exporter = opentelemetry_otlp::new_exporter().tonic().with_endpoint(config.otel_endpoint.clone());
		let provider = opentelemetry_otlp::new_pipeline()
			.tracing()
			.with_exporter(exporter)
			.with_trace_config(sdktrace::Config::default().with_resource(resource))
			.install_batch(opentelemetry_sdk::runtime::Tokio)
			.ok();
		if let Some(provider) = provider {
			let tracer = provider.tracer(config.otel_service_name.clone());
			global::set_tracer_provider(provider);
			Some(OpenTelemetryLayer::new(tracer))
		}
		else {
			None
		}
	}
	else {
		None
	};
	// stdout carries the protocol
	let fmt_layer = tracing_subscriber::fmt::layer()
		.with_target(false)
		.with_writer(std::io::stderr);
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let subscriber = tracing_subscriber::registry().with(filter).with(fmt_layer);
	if let Some(layer) = tracing_layer {
		subscriber.with(layer).init();
	}
	else {
		subscriber.init();
	}
}

pub async fn run(config: Config) -> Result<()> {
	let stdin = io::stdin();
	let stdout = io::stdout();
	let mut reader = BufReader::new(stdin).lines();
	let mut writer = io::BufWriter::new(stdout);
	info!(roots = ?config.guard.roots(), "serving allowed directories");
	while let Some(line) = reader.next_line().await? {
		if line.trim().is_empty() {
			continue;
		}
		let req: Request = match serde_json::from_str(&line) {
			Ok(req) => req,
			Err(err) => {
				let resp = Response::err(Value::Null, PARSE_ERROR, err.to_string());
				write_response(&mut writer, resp).await?;
				continue;
			}
		};
		if req.is_notification() {
			debug!(method = %req.method, "notification");
			continue;
		}
		let resp = handle_request(&config, req).await;
		write_response(&mut writer, resp).await?;
	}
	Ok(())
}

async fn handle_request(config: &Config, req: Request) -> Response {
	let id = req.id.clone().unwrap_or(Value::Null);
	let method = req.method.clone();
	let tool_name = extract_tool_name(&method, &req.params);
	let span = info_span!(
		"mcp.request",
		"mcp.session_id" = %config.session_id,
		"mcp.method" = %method,
		"mcp.tool_name" = tool_name.as_deref().unwrap_or(""),
		"mcp.is_error" = tracing::field::Empty,
		"mcp.error_code" = tracing::field::Empty,
		"mcp.count" = tracing::field::Empty,
		"mcp.response_bytes" = tracing::field::Empty,
	);
	let _guard = span.enter();
	match route(config, &req).await {
		Ok(value) => {
			record_result(&span, &value);
			Response::ok(id, value)
		}
		Err(err) => {
			warn!(error = %err, "request failed");
			if let Some(protocol) = err.downcast_ref::<ProtocolError>() {
				Response::err(id, protocol.code, protocol.message.clone())
			}
			else {
				Response::err(id, SERVER_ERROR, err.to_string())
			}
		}
	}
}

async fn route(config: &Config, req: &Request) -> Result<Value> {
	match req.method.as_str() {
		"initialize" => Ok(json!({
			"protocolVersion": PROTOCOL_VERSION,
			"serverInfo": {
				"name": SERVER_NAME,
				"version": env!("CARGO_PKG_VERSION")
			},
			"configSchema": config_schema(),
			"capabilities": {
				"resources": {
					"listChanged": false
				},
				"tools": {
					"listChanged": false
				}
			}
		})),
		"ping" => Ok(json!({})),
		"tools/list" => Ok(json!({
			"tools": tool_definitions(),
		})),
		"tools/call" => {
			let name = req.params
				.get("name")
				.and_then(Value::as_str)
				.ok_or_else(|| ProtocolError::new(INVALID_PARAMS, "name is required"))?;
			let arguments = req.params
				.get("arguments")
				.cloned()
				.unwrap_or_else(|| json!({}));
			execute_tool(config, name, &arguments).await
		}
		"resources/list" => Ok(resources_list()),
		"resources/read" => resources_read(req),
		_ => Err(ProtocolError::new(METHOD_NOT_FOUND, "method not found").into()),
	}
}

/// Structured payload, human-readable text, and any resource links for one tool call.
struct ToolReply {
	structured: Value,
	text: String,
	links: Vec<Value>,
}

impl ToolReply {
	fn new(structured: Value, text: impl Into<String>) -> Self {
		Self {
			structured,
			text: text.into(),
			links: Vec::new()
		}
	}
}

async fn run_tool<F, Fut>(name: &str, handler: F) -> Value
where
	F: FnOnce() -> Fut,
	Fut: std::future::Future<Output = Result<ToolReply>>, {
	match handler().await {
		Ok(reply) => tool_success(reply),
		Err(err) => {
			debug!(tool = name, error = %err, "tool failed");
			tool_error(&err)
		}
	}
}

fn resources_list() -> Value {
	let resources: Vec<Value> = preview_cache()
		.list()
		.into_iter()
		.map(|entry| json!({
			"uri": format!("{}.diff", entry.uri),
			"name": format!("edit preview for {}", entry.path),
			"mimeType": "text/x-diff"
		}))
		.collect();
	json!({
		"resources": resources
	})
}

fn resources_read(req: &Request) -> Result<Value> {
	let uri = req.params
		.get("uri")
		.and_then(Value::as_str)
		.ok_or_else(|| ProtocolError::new(INVALID_PARAMS, "uri is required"))?;
	let base_uri = uri.strip_suffix(".diff").unwrap_or(uri);
	if base_uri.starts_with("ui://edit_file/") {
		if let Some(entry) = preview_cache().get(base_uri) {
			return Ok(json!({
				"contents": [
					{
						"uri": uri,
						"mimeType": "text/x-diff",
						"text": entry.diff
					}
				]
			}));
		}
	}
	Err(ProtocolError::new(SERVER_ERROR, "resource not found").into())
}

fn tool_success(reply: ToolReply) -> Value {
	let mut content = vec![json!({
		"type": "text",
		"text": reply.text
	})];
	content.extend(reply.links);
	json!({
		"structuredContent": reply.structured,
		"content": content
	})
}

fn tool_error(err: &anyhow::Error) -> Value {
	let message = err.to_string();
	let mut structured = json!({
		"code": error_code(err)
	});
	if let Some(FsError::CommandFailed { exit_code, killed, stdout, stderr }) = err.downcast_ref::<FsError>() {
		structured["exitCode"] = json!(exit_code);
		structured["killed"] = json!(killed);
		structured["stdout"] = json!(stdout);
		structured["stderr"] = json!(stderr);
	}
	let text = match err.downcast_ref::<FsError>() {
		Some(FsError::CommandFailed { stdout, stderr, .. }) => command_failure_text(&message, stdout, stderr),
		_ => format!("Error: {}", message),
	};
	json!({
		"isError": true,
		"structuredContent": structured,
		"content": [
			{
				"type": "text",
				"text": text
			}
		]
	})
}

fn command_failure_text(message: &str, stdout: &str, stderr: &str) -> String {
	let mut text = format!("Error: {}", message);
	if !stdout.is_empty() {
		text.push_str(&format!("\n[stdout]\n{}", stdout));
	}
	if !stderr.is_empty() {
		text.push_str(&format!("\n[stderr]\n{}", stderr));
	}
	text
}

async fn execute_tool(config: &Config, name: &str, arguments: &Value) -> Result<Value> {
	let params = arguments.as_object().ok_or_else(|| ProtocolError::new(INVALID_PARAMS, "arguments must be an object"))?;
	let args = Value::Object(params.clone());
	let guard = &config.guard;
	let result = match name {
		"read_file" => run_tool(name, || async {
			let path = required_str(&args, "path")?;
			let head = optional_usize(&args, "head")?;
			let tail = optional_usize(&args, "tail")?;
			let resolved = guard.authorize(path)?;
			let content = fs::read_file(&resolved, head, tail)
				.await
				.map_err(|err| format_io_error("read", path, err))?;
			Ok(ToolReply::new(json!({
				"path": display_path(guard, &resolved),
				"content": content
			}), content))
		}).await,
		"read_multiple_files" => run_tool(name, || async {
			let paths = required_str_list(&args, "paths")?;
			let reads = fs::read_multiple(guard, &paths).await;
			let text = fs::join_reads(&reads);
			let failed = reads.iter().filter(|read| read.error.is_some()).count();
			Ok(ToolReply::new(json!({
				"files": reads,
				"count": paths.len(),
				"failed": failed
			}), text))
		}).await,
		"write_file" => run_tool(name, || async {
			let path = required_str(&args, "path")?;
			let content = required_str(&args, "content")?;
			let resolved = guard.authorize(path)?;
			fs::atomic_write(&resolved, content)
				.await
				.map_err(|err| format_io_error("write", path, err))?;
			info!(path = %resolved.display(), bytes = content.len(), "file written");
			Ok(ToolReply::new(json!({
				"path": display_path(guard, &resolved),
				"bytes": content.len()
			}), format!("Successfully wrote to {}", path)))
		}).await,
		"edit_file" => run_tool(name, || async { edit_file_tool(guard, &args).await }).await,
		"create_directory" => run_tool(name, || async {
			let path = required_str(&args, "path")?;
			let resolved = guard.authorize_for_create(path)?;
			fs::create_directory(&resolved)
				.await
				.map_err(|err| format_io_error("create directory", path, err))?;
			Ok(ToolReply::new(json!({
				"path": display_path(guard, &resolved)
			}), format!("Successfully created directory {}", path)))
		}).await,
		"list_directory" => run_tool(name, || async {
			let path = required_str(&args, "path")?;
			let resolved = guard.authorize(path)?;
			let entries = fs::list_directory(&resolved)
				.await
				.map_err(|err| format_io_error("list", path, err))?;
			let text = fs::format_listing(&entries);
			Ok(ToolReply::new(json!({
				"path": display_path(guard, &resolved),
				"count": entries.len(),
				"entries": entries
			}), text))
		}).await,
		"search_files" => run_tool(name, || async {
			let path = required_str(&args, "path")?;
			let pattern = required_str(&args, "pattern")?.to_string();
			let exclude = optional_str_list(&args, "excludePatterns")?;
			let root = guard.authorize(path)?;
			let walk_guard = guard.clone();
			let walk_root = root.clone();
			let matches = tokio::task::spawn_blocking(move || search::search(&walk_guard, &walk_root, &pattern, &exclude)).await??;
			let listed: Vec<String> = matches.iter()
				.map(|found| found.display().to_string())
				.collect();
			let text = if listed.is_empty() {
				"No matches found".to_string()
			}
			else {
				listed.join("\n")
			};
			Ok(ToolReply::new(json!({
				"path": display_path(guard, &root),
				"count": listed.len(),
				"matches": listed
			}), text))
		}).await,
		"get_file_info" => run_tool(name, || async {
			let path = required_str(&args, "path")?;
			let resolved = guard.authorize(path)?;
			let info = fs::file_info(&resolved)
				.await
				.map_err(|err| format_io_error("stat", path, err))?;
			let structured = serde_json::to_value(&info)?;
			let text = format_info(&structured);
			Ok(ToolReply::new(structured, text))
		}).await,
		"move_file" => run_tool(name, || async {
			let source = required_str(&args, "source")?;
			let destination = required_str(&args, "destination")?;
			let from = guard.authorize(source)?;
			if guard.is_root(&from) {
				return Err(FsError::RootProtected {
					action: "move",
					path: from
				}.into());
			}
			let to = guard.authorize(destination)?;
			fs::move_path(&from, &to)
				.await
				.map_err(|err| format_io_error("move", source, err))?;
			info!(from = %from.display(), to = %to.display(), "path moved");
			Ok(ToolReply::new(json!({
				"source": display_path(guard, &from),
				"destination": display_path(guard, &to)
			}), format!("Successfully moved {} to {}", source, destination)))
		}).await,
		"delete_file" => run_tool(name, || async {
			let path = required_str(&args, "path")?;
			let recursive = optional_bool(&args, "recursive")?.unwrap_or(false);
			let resolved = guard.authorize(path)?;
			if guard.is_root(&resolved) {
				return Err(FsError::RootProtected {
					action: "delete",
					path: resolved
				}.into());
			}
			fs::delete_path(&resolved, recursive)
				.await
				.map_err(|err| format_io_error("delete", path, err))?;
			info!(path = %resolved.display(), recursive, "path deleted");
			Ok(ToolReply::new(json!({
				"path": display_path(guard, &resolved),
				"recursive": recursive
			}), format!("Successfully deleted {}", path)))
		}).await,
		"run_command" => run_tool(name, || async { run_command_tool(config, &args).await }).await,
		"list_allowed_directories" => run_tool(name, || async {
			let roots: Vec<String> = guard.roots()
				.iter()
				.map(|root| root.display().to_string())
				.collect();
			let text = format!("Allowed directories:\n{}", roots.join("\n"));
			Ok(ToolReply::new(json!({
				"roots": roots
			}), text))
		}).await,
		_ => return Err(ProtocolError::new(METHOD_NOT_FOUND, format!("unknown tool: {}", name)).into()),
	};
	Ok(result)
}

async fn edit_file_tool(guard: &PathGuard, args: &Value) -> Result<ToolReply> {
	let path = required_str(args, "path")?;
	let edits = args.get("edits").ok_or_else(|| FsError::invalid("edits is required"))?;
	let edits: Vec<EditOperation> = serde_json::from_value(edits.clone())
		.map_err(|err| FsError::invalid(format!("edits must be a list of {{oldText, newText}}: {}", err)))?;
	let dry_run = optional_bool(args, "dryRun")?.unwrap_or(false);
	let skip_validation = optional_bool(args, "skipValidation")?.unwrap_or(false);
	let resolved = guard.authorize(path)?;
	let display = display_path(guard, &resolved);
	let result = edit::edit_file(EditRequest {
		path: &resolved,
		display: &display,
		edits: &edits,
		dry_run,
		skip_validation
	}).await.map_err(|err| format_io_error("edit", path, err))?;
	let matches: Vec<Value> = result.matches
		.iter()
		.map(|found| match found {
			edit::EditMatch::Exact => json!({
				"kind": found.as_str()
			}),
			edit::EditMatch::Fuzzy { line } => json!({
				"kind": found.as_str(),
				"line": line
			}),
		})
		.collect();
	let mut structured = json!({
		"path": display,
		"dryRun": dry_run,
		"persisted": result.persisted,
		"matches": matches,
		"bytesBefore": result.original.len(),
		"bytesAfter": result.modified.len(),
		"diff": result.diff
	});
	let mut links = Vec::new();
	if dry_run {
		let uri = format!("ui://edit_file/{}", uuid::Uuid::new_v4());
		let diff_uri = format!("{}.diff", uri);
		preview_cache().insert(PreviewEntry {
			uri,
			diff: result.diff.clone(),
			path: display.clone()
		});
		structured["previewUri"] = json!(diff_uri);
		links.push(json!({
			"type": "diff",
			"url": diff_uri,
			"mimeType": "text/x-diff"
		}));
	}
	else {
		info!(path = %resolved.display(), edits = edits.len(), "file edited");
	}
	Ok(ToolReply {
		structured,
		text: result.report(),
		links
	})
}

async fn run_command_tool(config: &Config, args: &Value) -> Result<ToolReply> {
	let command = required_str(args, "command")?;
	if command.trim().is_empty() {
		return Err(FsError::invalid("command is empty").into());
	}
	let cwd = match optional_str(args, "workingDirectory")? {
		Some(dir) => config.guard.authorize(dir)?,
		None => config.guard
			.default_root()
			.cloned()
			.ok_or_else(|| anyhow!("no allowed directories configured"))?,
	};
	let timeout = optional_u64(args, "timeout")?
		.map(Duration::from_millis)
		.unwrap_or(config.command_timeout);
	let include_stderr = optional_bool(args, "includeStderr")?.unwrap_or(false);
	info!(command, cwd = %cwd.display(), timeout_ms = timeout.as_millis() as u64, "running command");
	let output = fs::run_command(fs::CommandRequest {
		command,
		cwd: &cwd,
		timeout
	}).await.map_err(|err| format_io_error("run command in", &cwd.display().to_string(), err))?;
	let mut text = output.stdout.clone();
	if include_stderr && !output.stderr.is_empty() {
		if !text.is_empty() && !text.ends_with('\n') {
			text.push('\n');
		}
		text.push_str(&format!("[stderr]\n{}", output.stderr));
	}
	let mut structured = json!({
		"exitCode": output.exit_code,
		"stdout": output.stdout,
		"workingDirectory": cwd.display().to_string()
	});
	if include_stderr {
		structured["stderr"] = json!(output.stderr);
	}
	Ok(ToolReply::new(structured, text))
}

fn display_path(guard: &PathGuard, path: &Path) -> String {
	for root in guard.roots() {
		if let Ok(rel) = path.strip_prefix(root) {
			let rel = rel.to_string_lossy().to_string();
			if !rel.is_empty() {
				return rel;
			}
		}
	}
	path.display().to_string()
}

fn format_info(info: &Value) -> String {
	let Some(obj) = info.as_object() else {
		return String::new();
	};
	obj.iter()
		.map(|(key, value)| match value {
			Value::String(text) => format!("{}: {}", key, text),
			Value::Null => format!("{}: unavailable", key),
			other => format!("{}: {}", key, other),
		})
		.collect::<Vec<_>>()
		.join("\n")
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
	optional_str(args, key)?.ok_or_else(|| FsError::invalid(format!("{} is required", key)).into())
}

fn optional_str<'a>(args: &'a Value, key: &str) -> Result<Option<&'a str>> {
	match args.get(key) {
		None | Some(Value::Null) => Ok(None),
		Some(Value::String(value)) => Ok(Some(value.as_str())),
		Some(_) => Err(FsError::invalid(format!("{} must be a string", key)).into()),
	}
}

fn optional_u64(args: &Value, key: &str) -> Result<Option<u64>> {
	match args.get(key) {
		None | Some(Value::Null) => Ok(None),
		Some(value) => value.as_u64()
			.map(Some)
			.ok_or_else(|| FsError::invalid(format!("{} must be a non-negative integer", key)).into()),
	}
}

fn optional_usize(args: &Value, key: &str) -> Result<Option<usize>> {
	Ok(optional_u64(args, key)?.map(|value| value as usize))
}

fn optional_bool(args: &Value, key: &str) -> Result<Option<bool>> {
	match args.get(key) {
		None | Some(Value::Null) => Ok(None),
		Some(Value::Bool(value)) => Ok(Some(*value)),
		Some(_) => Err(FsError::invalid(format!("{} must be a boolean", key)).into()),
	}
}

fn required_str_list(args: &Value, key: &str) -> Result<Vec<String>> {
	if args.get(key).map(Value::is_null).unwrap_or(true) {
		return Err(FsError::invalid(format!("{} is required", key)).into());
	}
	optional_str_list(args, key)
}

fn optional_str_list(args: &Value, key: &str) -> Result<Vec<String>> {
	match args.get(key) {
		None | Some(Value::Null) => Ok(Vec::new()),
		Some(value) => parse_string_list(value, key),
	}
}

fn parse_string_list(value: &Value, label: &str) -> Result<Vec<String>> {
	let items = value.as_array().ok_or_else(|| FsError::invalid(format!("{} must be an array of strings", label)))?;
	items.iter()
		.map(|item| item.as_str()
			.map(|text| text.to_string())
			.ok_or_else(|| anyhow::Error::from(FsError::invalid(format!("{} must be an array of strings", label)))))
		.collect()
}

fn config_schema() -> Value {
	json!({
		"$schema": "http://json-schema.org/draft-07/schema#",
		"title": "mcp-fs-sandbox configuration",
		"type": "object",
		"additionalProperties": false,
		"properties": {
			"roots": {
				"type": "array",
				"items": { "type": "string" },
				"description": "Allowed directories, added to those given on the command line. Each must exist."
			},
			"command_timeout_ms": {
				"type": "integer",
				"minimum": 1,
				"description": "Default run_command timeout in milliseconds."
			},
			"preview_cache_size": {
				"type": "integer",
				"minimum": 0,
				"description": "Number of dry-run edit previews kept as resources; 0 keeps all."
			},
			"otel_enabled": {
				"type": "boolean",
				"description": "Export traces over OTLP."
			},
			"otel_endpoint": {
				"type": "string",
				"description": "OTLP gRPC endpoint."
			},
			"otel_service_name": {
				"type": "string",
				"description": "OTEL service.name."
			}
		}
	})
}

fn load_config_value(path: &str) -> Result<Value> {
	let content = std::fs::read_to_string(path)
		.map_err(|err| anyhow!("failed to read config {}: {}", path, err))?;
	let value: Value = serde_json::from_str(&content)
		.map_err(|err| anyhow!("failed to parse config {}: {}", path, err))?;
	Ok(value)
}

fn apply_config_override(settings: &mut Settings, value: &Value) -> Result<()> {
	let obj = value.as_object().ok_or_else(|| anyhow!("config must be an object"))?;
	for (key, value) in obj {
		match key.as_str() {
			"roots" => {
				settings.roots.extend(parse_string_list(value, "roots")?);
			}
			"command_timeout_ms" => {
				let timeout = value.as_u64().ok_or_else(|| anyhow!("command_timeout_ms must be a positive integer"))?;
				if timeout == 0 {
					return Err(anyhow!("command_timeout_ms must be a positive integer"));
				}
				settings.command_timeout_ms = timeout;
			}
			"preview_cache_size" => {
				settings.preview_cache_size = parse_optional_usize_value(value, "preview_cache_size")?;
			}
			"otel_enabled" => {
				if !value.is_null() {
					settings.otel_enabled = value.as_bool().ok_or_else(|| anyhow!("otel_enabled must be a boolean"))?;
				}
			}
			"otel_endpoint" => {
				if !value.is_null() {
					settings.otel_endpoint = value.as_str().ok_or_else(|| anyhow!("otel_endpoint must be a string"))?.to_string();
				}
			}
			"otel_service_name" => {
				if !value.is_null() {
					settings.otel_service_name = value.as_str().ok_or_else(|| anyhow!("otel_service_name must be a string"))?.to_string();
				}
			}
			_ => return Err(anyhow!("unknown config key: {}", key)),
		}
	}
	Ok(())
}

fn parse_optional_usize_value(value: &Value, label: &str) -> Result<Option<usize>> {
	if value.is_null() {
		return Ok(None);
	}
	let number = value.as_u64().ok_or_else(|| anyhow!("{} must be a non-negative integer", label))?;
	if number == 0 {
		return Ok(None);
	}
	Ok(Some(number as usize))
}

fn parse_usize(value: &str, label: &str) -> Result<usize> {
	value.trim().parse::<usize>().map_err(|_| anyhow!("{} must be a non-negative integer", label))
}

fn parse_optional_limit(value: &str, label: &str) -> Result<Option<usize>> {
	let parsed = parse_usize(value, label)?;
	if parsed == 0 {
		return Ok(None);
	}
	Ok(Some(parsed))
}

fn parse_timeout(value: &str, label: &str) -> Result<u64> {
	let parsed = parse_usize(value, label)?;
	if parsed == 0 {
		return Err(anyhow!("{} must be greater than zero", label));
	}
	Ok(parsed as u64)
}

fn parse_bool(value: &str, label: &str) -> Result<bool> {
	let value = value.trim().to_lowercase();
	match value.as_str() {
		"1" | "true" | "yes" | "on" => Ok(true),
		"0" | "false" | "no" | "off" => Ok(false),
		_ => Err(anyhow!("{} must be a boolean", label)),
	}
}

fn path_property(description: &str) -> Value {
	json!({
		"type": "string",
		"description": description
	})
}

fn tool_definitions() -> Vec<Value> {
	vec![
	json!({
		"name": "read_file",
		"description": "Read a text file. Use head or tail to read only the first or last N lines; with both, the middle is replaced by a '...' line.",
		"inputSchema": {
			"type": "object",
			"properties": {
				"path": path_property("File to read."),
				"head": { "type": "integer", "minimum": 0, "description": "Return only the first N lines." },
				"tail": { "type": "integer", "minimum": 0, "description": "Return only the last N lines." }
			},
			"required": ["path"],
			"additionalProperties": false
		}
	}),
	json!({
		"name": "read_multiple_files",
		"description": "Read several files at once. A file that cannot be read is reported inline and does not stop the others.",
		"inputSchema": {
			"type": "object",
			"properties": {
				"paths": {
					"type": "array",
					"items": { "type": "string" },
					"description": "Files to read."
				}
			},
			"required": ["paths"],
			"additionalProperties": false
		}
	}),
	json!({
		"name": "write_file",
		"description": "Create a file or overwrite it completely. The write is atomic.",
		"inputSchema": {
			"type": "object",
			"properties": {
				"path": path_property("File to write. Its parent directory must exist."),
				"content": { "type": "string", "description": "Full new content." }
			},
			"required": ["path", "content"],
			"additionalProperties": false
		}
	}),
	json!({
		"name": "edit_file",
		"description": "Apply a sequence of text replacements to a file. Each oldText is matched exactly first, then line by line ignoring surrounding whitespace. The result is syntax-checked for known file types before it is saved. Returns a git-style diff.",
		"inputSchema": {
			"type": "object",
			"properties": {
				"path": path_property("File to edit."),
				"edits": {
					"type": "array",
					"items": {
						"type": "object",
						"properties": {
							"oldText": { "type": "string", "description": "Text to find. Must not be empty." },
							"newText": { "type": "string", "description": "Replacement text." }
						},
						"required": ["oldText", "newText"],
						"additionalProperties": false
					}
				},
				"dryRun": { "type": "boolean", "default": false, "description": "Preview the diff without saving." },
				"skipValidation": { "type": "boolean", "default": false, "description": "Save even if the syntax check fails." }
			},
			"required": ["path", "edits"],
			"additionalProperties": false
		}
	}),
	json!({
		"name": "create_directory",
		"description": "Create a directory, including missing parents. Succeeds if it already exists.",
		"inputSchema": {
			"type": "object",
			"properties": {
				"path": path_property("Directory to create.")
			},
			"required": ["path"],
			"additionalProperties": false
		}
	}),
	json!({
		"name": "list_directory",
		"description": "List the direct children of a directory, marked [FILE] or [DIR].",
		"inputSchema": {
			"type": "object",
			"properties": {
				"path": path_property("Directory to list.")
			},
			"required": ["path"],
			"additionalProperties": false
		}
	}),
	json!({
		"name": "search_files",
		"description": "Recursively find files and directories whose name or relative path matches a case-insensitive glob pattern. A pattern that is not a valid glob is matched as literal text.",
		"inputSchema": {
			"type": "object",
			"properties": {
				"path": path_property("Directory to search from."),
				"pattern": { "type": "string", "description": "Glob such as *.rs, src/**/*.ts or *config*." },
				"excludePatterns": {
					"type": "array",
					"items": { "type": "string" },
					"description": "Globs to skip. A bare name such as node_modules skips that directory at any depth."
				}
			},
			"required": ["path", "pattern"],
			"additionalProperties": false
		}
	}),
	json!({
		"name": "get_file_info",
		"description": "Show size, timestamps, type and permissions of a file or directory.",
		"inputSchema": {
			"type": "object",
			"properties": {
				"path": path_property("File or directory to inspect.")
			},
			"required": ["path"],
			"additionalProperties": false
		}
	}),
	json!({
		"name": "move_file",
		"description": "Move or rename a file or directory. Fails if the destination exists.",
		"inputSchema": {
			"type": "object",
			"properties": {
				"source": path_property("Existing path."),
				"destination": path_property("New path. Its parent directory must exist.")
			},
			"required": ["source", "destination"],
			"additionalProperties": false
		}
	}),
	json!({
		"name": "delete_file",
		"description": "Delete a file or directory. A non-empty directory needs recursive: true.",
		"inputSchema": {
			"type": "object",
			"properties": {
				"path": path_property("Path to delete."),
				"recursive": { "type": "boolean", "default": false, "description": "Delete directory contents too." }
			},
			"required": ["path"],
			"additionalProperties": false
		}
	}),
	json!({
		"name": "run_command",
		"description": "Run a shell command inside an allowed directory and return its output.",
		"inputSchema": {
			"type": "object",
			"properties": {
				"command": { "type": "string", "description": "Command line passed to sh -c." },
				"workingDirectory": path_property("Directory to run in. Defaults to the first allowed directory."),
				"timeout": { "type": "integer", "minimum": 1, "description": "Timeout in milliseconds." },
				"includeStderr": { "type": "boolean", "default": false, "description": "Append stderr to the output." }
			},
			"required": ["command"],
			"additionalProperties": false
		}
	}),
	json!({
		"name": "list_allowed_directories",
		"description": "List the directories this server may access.",
		"inputSchema": {
			"type": "object",
			"properties": {},
			"additionalProperties": false
		}
	}),
	]
}

fn extract_tool_name(method: &str, params: &Value) -> Option<String> {
	if method != "tools/call" {
		return None;
	}
	params.get("name")
		.and_then(Value::as_str)
		.map(|value| value.to_string())
}

fn record_result(span: &Span, result: &Value) {
	let response_bytes = serde_json::to_string(result).map(|value| value.len() as u64).ok();
	if let Some(bytes) = response_bytes {
		span.record("mcp.response_bytes", bytes);
	}
	let is_error = result.get("isError")
		.and_then(Value::as_bool)
		.unwrap_or(false);
	span.record("mcp.is_error", is_error);
	if let Some(code) = result.get("structuredContent")
		.and_then(|value| value.get("code"))
		.and_then(Value::as_str) {
		span.record("mcp.error_code", code);
	}
	if let Some(count) = result.get("structuredContent")
		.and_then(|value| value.get("count"))
		.and_then(Value::as_u64) {
		span.record("mcp.count", count);
	}
}

async fn write_response(writer: &mut io::BufWriter<io::Stdout>, resp: Response) -> Result<()> {
	let line = serde_json::to_string(&resp)?;
	writer.write_all(line.as_bytes()).await?;
	writer.write_all(b"\n").await?;
	writer.flush().await?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn entry(uri: &str) -> PreviewEntry {
		PreviewEntry {
			uri: uri.to_string(),
			diff: format!("diff for {}", uri),
			path: "file.txt".to_string()
		}
	}

	#[test]
	fn preview_cache_evicts_least_recently_used() {
		let mut cache = PreviewCache::new(Some(2));
		cache.insert(entry("ui://edit_file/a"));
		cache.insert(entry("ui://edit_file/b"));
		assert!(cache.get("ui://edit_file/a").is_some());
		cache.insert(entry("ui://edit_file/c"));
		assert!(cache.get("ui://edit_file/b").is_none());
		let uris: Vec<String> = cache.list().into_iter().map(|entry| entry.uri).collect();
		assert_eq!(uris, vec!["ui://edit_file/a", "ui://edit_file/c"]);
		cache.set_capacity(Some(1));
		assert_eq!(cache.list().len(), 1);
	}

	#[test]
	fn config_file_extends_roots_and_rejects_unknown_keys() {
		let mut settings = Settings {
			roots: vec!["/first".to_string()],
			command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
			preview_cache_size: Some(100),
			otel_enabled: false,
			otel_endpoint: String::new(),
			otel_service_name: String::new(),
		};
		apply_config_override(&mut settings, &json!({
			"roots": ["/second"],
			"command_timeout_ms": 500,
			"preview_cache_size": 0
		})).expect("applied");
		assert_eq!(settings.roots, vec!["/first", "/second"]);
		assert_eq!(settings.command_timeout_ms, 500);
		assert_eq!(settings.preview_cache_size, None);
		assert!(apply_config_override(&mut settings, &json!({ "allow_escape": true })).is_err());
		assert!(apply_config_override(&mut settings, &json!({ "command_timeout_ms": 0 })).is_err());
	}

	#[test]
	fn missing_roots_are_fatal() {
		let dir = tempfile::tempdir().expect("tempdir");
		let settings = |roots: Vec<String>| Settings {
			roots,
			command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
			preview_cache_size: None,
			otel_enabled: false,
			otel_endpoint: String::new(),
			otel_service_name: String::new(),
		};
		assert!(build_config(settings(Vec::new()), dir.path()).is_err());
		assert!(build_config(settings(vec!["nope".to_string()]), dir.path()).is_err());
		let config = build_config(settings(vec![".".to_string()]), dir.path()).expect("config");
		assert_eq!(config.guard.roots().len(), 1);
	}

	#[test]
	fn tool_errors_carry_code_and_command_details() {
		let err: anyhow::Error = FsError::CommandFailed {
			exit_code: Some(2),
			killed: false,
			stdout: "partial".to_string(),
			stderr: "bad".to_string()
		}.into();
		let value = tool_error(&err);
		assert_eq!(value["isError"], json!(true));
		assert_eq!(value["structuredContent"]["code"], json!("COMMAND_FAILED"));
		assert_eq!(value["structuredContent"]["exitCode"], json!(2));
		assert_eq!(value["structuredContent"]["killed"], json!(false));
		let text = value["content"][0]["text"].as_str().unwrap_or_default();
		assert!(text.contains("[stderr]\nbad"));
	}

	#[test]
	fn every_tool_is_listed() {
		let names: Vec<String> = tool_definitions()
			.iter()
			.filter_map(|tool| tool["name"].as_str().map(str::to_string))
			.collect();
		for expected in ["read_file", "read_multiple_files", "write_file", "edit_file", "create_directory", "list_directory", "search_files", "get_file_info", "move_file", "delete_file", "run_command", "list_allowed_directories"] {
			assert!(names.iter().any(|name| name == expected), "missing {}", expected);
		}
	}

	#[test]
	fn argument_helpers_reject_wrong_types() {
		let args = json!({ "path": 3, "head": -1, "dryRun": "yes" });
		assert!(required_str(&args, "path").is_err());
		assert!(optional_usize(&args, "head").is_err());
		assert!(optional_bool(&args, "dryRun").is_err());
		assert_eq!(optional_usize(&args, "tail").expect("absent"), None);
		let err = required_str(&json!({}), "path").expect_err("missing");
		assert_eq!(error_code(&err), "INVALID_ARGUMENT");
	}
}
