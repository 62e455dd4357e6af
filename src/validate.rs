//! Lightweight structural checks run before an edit is committed.
//!
//! None of these are parsers. They catch the breakage an edit most often
//! introduces (unbalanced brackets, stray tabs, unclosed tags) and leave
//! everything else alone.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::path::Path;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
	Json,
	JavaScript,
	TypeScript,
	Yaml,
	Xml,
	Html,
	Dockerfile,
	Unknown,
}

const JSON_FILENAMES: &[&str] = &[".babelrc", ".eslintrc", ".prettierrc", ".jshintrc", ".swcrc", "composer.lock"];

impl FileKind {
	pub fn detect(path: &Path) -> Self {
		let name = path.file_name()
			.and_then(|name| name.to_str())
			.unwrap_or("");
		let lower = name.to_ascii_lowercase();
		if lower.ends_with(".json") || JSON_FILENAMES.contains(&lower.as_str()) {
			return FileKind::Json;
		}
		if lower.starts_with("dockerfile") {
			return FileKind::Dockerfile;
		}
		let ext = path.extension()
			.and_then(|ext| ext.to_str())
			.map(|ext| ext.to_ascii_lowercase())
			.unwrap_or_default();
		Self::from_extension(&ext)
	}

	pub fn from_extension(ext: &str) -> Self {
		match ext {
			"json" | "jsonc" => FileKind::Json,
			"js" | "jsx" | "mjs" | "cjs" => FileKind::JavaScript,
			"ts" | "tsx" | "mts" | "cts" => FileKind::TypeScript,
			"yml" | "yaml" => FileKind::Yaml,
			"xml" | "svg" | "xsd" | "xsl" | "xslt" | "plist" | "csproj" => FileKind::Xml,
			"html" | "htm" | "xhtml" => FileKind::Html,
			"dockerfile" => FileKind::Dockerfile,
			_ => FileKind::Unknown,
		}
	}

	pub fn as_str(self) -> &'static str {
		match self {
			FileKind::Json => "json",
			FileKind::JavaScript => "javascript",
			FileKind::TypeScript => "typescript",
			FileKind::Yaml => "yaml",
			FileKind::Xml => "xml",
			FileKind::Html => "html",
			FileKind::Dockerfile => "dockerfile",
			FileKind::Unknown => "unknown",
		}
	}

	pub fn hints(self) -> &'static [&'static str] {
		match self {
			FileKind::Json => &[
				"Remove trailing commas after the last item of objects and arrays",
				"Quote every key and string value with double quotes",
				"Comments are not allowed in JSON",
			],
			FileKind::JavaScript => &[
				"Check that every {, [ and ( has a matching closer in the right order",
				"Look for an unterminated string or template literal near the reported line",
				"Make sure the replacement text did not drop a closing brace of the surrounding block",
			],
			FileKind::TypeScript => &[
				"Check that every {, [ and ( has a matching closer in the right order",
				"Every ':' annotation needs a type after it",
				"interface and type declarations must open a body with '{' or assign with '='",
			],
			FileKind::Yaml => &[
				"Indent with spaces, never tabs",
				"Separate keys from values with ': ' (colon followed by a space)",
				"Keep sibling keys at the same indentation level",
			],
			FileKind::Xml | FileKind::Html => &[
				"Close every opened tag, or self-close it with '/>'",
				"Closing tags must match the most recently opened tag",
				"Escape literal '<' and '&' in text content",
			],
			FileKind::Dockerfile => &[
				"Start every instruction line with a Dockerfile keyword such as RUN, COPY or ENV",
				"Only ARG may appear before the first FROM",
				"End a line with '\\' to continue an instruction on the next line",
			],
			FileKind::Unknown => &[],
		}
	}
}

impl fmt::Display for FileKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationIssue {
	pub message: String,
	pub line: Option<usize>,
	pub column: Option<usize>,
	pub hints: Vec<String>,
}

impl ValidationIssue {
	pub fn location(&self) -> String {
		match (self.line, self.column) {
			(Some(line), Some(column)) => format!(" (line {}, column {})", line, column),
			(Some(line), None) => format!(" (line {})", line),
			_ => String::new(),
		}
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidationOutcome {
	Valid,
	Invalid(ValidationIssue),
}

impl ValidationOutcome {
	pub fn is_valid(&self) -> bool {
		matches!(self, ValidationOutcome::Valid)
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StructuralError {
	UnexpectedClosing {
		found: char,
		line: usize,
		column: usize
	},
	Mismatched {
		expected: char,
		found: char,
		line: usize,
		column: usize
	},
	Unclosed {
		opener: char,
		line: usize,
		column: usize
	},
	Other {
		message: String,
		line: Option<usize>,
		column: Option<usize>
	},
}

impl StructuralError {
	fn other(message: impl Into<String>, line: Option<usize>, column: Option<usize>) -> Self {
		StructuralError::Other {
			message: message.into(),
			line,
			column
		}
	}

	fn into_issue(self, kind: FileKind) -> ValidationIssue {
		let (message, line, column) = match self {
			StructuralError::UnexpectedClosing { found, line, column } => (format!("unexpected closing '{}'", found), Some(line), Some(column)),
			StructuralError::Mismatched { expected, found, line, column } => (
				format!("mismatched bracket: expected '{}' but found '{}'", expected, found),
				Some(line),
				Some(column)
			),
			StructuralError::Unclosed { opener, line, column } => (format!("unclosed '{}'", opener), Some(line), Some(column)),
			StructuralError::Other { message, line, column } => (message, line, column),
		};
		ValidationIssue {
			message,
			line,
			column,
			hints: kind.hints()
				.iter()
				.map(|hint| hint.to_string())
				.collect()
		}
	}
}

type Validator = fn(&str) -> Result<(), StructuralError>;

fn validator_for(kind: FileKind) -> Option<Validator> {
	match kind {
		FileKind::Json => Some(validate_json),
		FileKind::JavaScript => Some(validate_javascript),
		FileKind::TypeScript => Some(validate_typescript),
		FileKind::Yaml => Some(validate_yaml),
		FileKind::Xml => Some(validate_xml),
		FileKind::Html => Some(validate_html),
		FileKind::Dockerfile => Some(validate_dockerfile),
		FileKind::Unknown => None,
	}
}

pub fn validate(content: &str, kind: FileKind) -> ValidationOutcome {
	let Some(validator) = validator_for(kind) else {
		return ValidationOutcome::Valid;
	};
	match validator(content) {
		Ok(()) => ValidationOutcome::Valid,
		Err(err) => ValidationOutcome::Invalid(err.into_issue(kind)),
	}
}

fn validate_json(content: &str) -> Result<(), StructuralError> {
	match serde_json::from_str::<serde_json::Value>(content) {
		Ok(_) => Ok(()),
		Err(err) => Err(StructuralError::other(err.to_string(), Some(err.line()), Some(err.column()))),
	}
}

fn closer_for(opener: char) -> char {
	match opener {
		'(' => ')',
		'[' => ']',
		_ => '}',
	}
}

fn validate_javascript(content: &str) -> Result<(), StructuralError> {
	let mut stack: Vec<(char, usize, usize)> = Vec::new();
	let mut quote: Option<char> = None;
	let mut block_comment = false;
	for (line_index, line) in content.lines().enumerate() {
		let line_no = line_index + 1;
		// plain strings cannot span lines; template literals can
		if quote != Some('`') {
			quote = None;
		}
		let mut escaped = false;
		let chars: Vec<char> = line.chars().collect();
		let mut i = 0usize;
		while i < chars.len() {
			let ch = chars[i];
			let next = chars.get(i + 1).copied();
			if block_comment {
				if ch == '*' && next == Some('/') {
					block_comment = false;
					i += 2;
					continue;
				}
				i += 1;
				continue;
			}
			if let Some(open_quote) = quote {
				if escaped {
					escaped = false;
				}
				else if ch == '\\' {
					escaped = true;
				}
				else if ch == open_quote {
					quote = None;
				}
				i += 1;
				continue;
			}
			match ch {
				'/' if next == Some('/') => break,
				'/' if next == Some('*') => {
					block_comment = true;
					i += 2;
					continue;
				}
				'\'' | '"' | '`' => quote = Some(ch),
				'(' | '[' | '{' => stack.push((ch, line_no, i + 1)),
				')' | ']' | '}' => {
					let Some((opener, _, _)) = stack.pop() else {
						return Err(StructuralError::UnexpectedClosing {
							found: ch,
							line: line_no,
							column: i + 1
						});
					};
					let expected = closer_for(opener);
					if expected != ch {
						return Err(StructuralError::Mismatched {
							expected,
							found: ch,
							line: line_no,
							column: i + 1
						});
					}
				}
				_ => {}
			}
			i += 1;
		}
	}
	if let Some((opener, line, column)) = stack.pop() {
		return Err(StructuralError::Unclosed {
			opener,
			line,
			column
		});
	}
	Ok(())
}

static EMPTY_ANNOTATION: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\w$\])]\??\s*:\s*[,;)=]").expect("empty annotation regex"));

static TYPE_DECLARATION: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*(?:export\s+)?(?:declare\s+)?(interface|type)\s+[A-Za-z_$][\w$]*").expect("type declaration regex"));

fn validate_typescript(content: &str) -> Result<(), StructuralError> {
	validate_javascript(content)?;
	let lines: Vec<&str> = content.lines().collect();
	let mut in_template = false;
	for (index, raw) in lines.iter().enumerate() {
		let line_no = index + 1;
		let (code, still_in_template) = strip_strings(raw, in_template);
		in_template = still_in_template;
		if let Some(found) = EMPTY_ANNOTATION.find(&code) {
			let colon = code[found.start()..].find(':').map(|offset| found.start() + offset);
			return Err(StructuralError::other(
				"missing type annotation after ':'",
				Some(line_no),
				colon.map(|pos| code[..pos].chars().count() + 1)
			));
		}
		if let Some(caps) = TYPE_DECLARATION.captures(&code) {
			if code.contains('{') || code.contains('=') || code.trim_end().ends_with(['<', ',', '(']) {
				continue;
			}
			let continued = lines[index + 1..]
				.iter()
				.map(|line| line.trim())
				.find(|line| !line.is_empty())
				.map(|line| line.starts_with('{') || line.starts_with('='))
				.unwrap_or(false);
			if !continued {
				let keyword = caps.get(1).map(|m| m.as_str()).unwrap_or("type");
				return Err(StructuralError::other(
					format!("{} declaration must open a body with '{{' or assign with '='", keyword),
					Some(line_no),
					None
				));
			}
		}
	}
	Ok(())
}

// Blanks out string contents and trailing line comments so the line checks
// only see code. Returns whether a template literal is still open.
fn strip_strings(line: &str, mut in_template: bool) -> (String, bool) {
	let mut out = String::with_capacity(line.len());
	let mut quote: Option<char> = if in_template {
		Some('`')
	}
	else {
		None
	};
	let mut escaped = false;
	let mut chars = line.chars().peekable();
	while let Some(ch) = chars.next() {
		if let Some(open_quote) = quote {
			if escaped {
				escaped = false;
			}
			else if ch == '\\' {
				escaped = true;
			}
			else if ch == open_quote {
				quote = None;
				out.push(ch);
				continue;
			}
			out.push(' ');
			continue;
		}
		if ch == '/' && chars.peek() == Some(&'/') {
			break;
		}
		if ch == '\'' || ch == '"' || ch == '`' {
			quote = Some(ch);
		}
		out.push(ch);
	}
	in_template = quote == Some('`');
	(out, in_template)
}

fn validate_yaml(content: &str) -> Result<(), StructuralError> {
	let mut block_scalar_indent: Option<usize> = None;
	for (index, line) in content.lines().enumerate() {
		let line_no = index + 1;
		if let Some(column) = line.find('\t') {
			return Err(StructuralError::other(
				"tab character found; YAML requires spaces",
				Some(line_no),
				Some(line[..column].chars().count() + 1)
			));
		}
		let trimmed = line.trim();
		if trimmed.is_empty() {
			continue;
		}
		let indent = line.len() - line.trim_start().len();
		if let Some(parent_indent) = block_scalar_indent {
			if indent > parent_indent {
				continue;
			}
			block_scalar_indent = None;
		}
		if is_block_scalar_header(trimmed) {
			block_scalar_indent = Some(indent);
		}
		if yaml_line_exempt(trimmed) {
			continue;
		}
		let content_part = strip_yaml_comment(trimmed);
		if has_mapping_separator(content_part) {
			continue;
		}
		return Err(StructuralError::other(
			format!("expected 'key: value' but found '{}'", content_part),
			Some(line_no),
			Some(indent + 1)
		));
	}
	Ok(())
}

fn yaml_line_exempt(trimmed: &str) -> bool {
	trimmed.starts_with('#')
		|| trimmed == "-"
		|| trimmed.starts_with("- ")
		|| trimmed.starts_with("---")
		|| trimmed.starts_with("...")
		|| trimmed.starts_with('%')
		|| trimmed.starts_with(['[', ']', '{', '}', '"', '\'', '&', '*', '!', '?', '|', '>'])
}

fn is_block_scalar_header(trimmed: &str) -> bool {
	let value = strip_yaml_comment(trimmed).trim_end();
	let value = value.rsplit(": ").next().unwrap_or(value);
	let value = value.strip_prefix("- ").unwrap_or(value).trim();
	matches!(value.chars().next(), Some('|') | Some('>'))
		&& value.chars().skip(1).all(|ch| ch == '-' || ch == '+' || ch.is_ascii_digit())
}

fn strip_yaml_comment(trimmed: &str) -> &str {
	match trimmed.find(" #") {
		Some(pos) => trimmed[..pos].trim_end(),
		None => trimmed,
	}
}

fn has_mapping_separator(text: &str) -> bool {
	text.ends_with(':') || text.contains(": ")
}

static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<(/?)([A-Za-z_][\w:.\-]*)([^<>]*?)(/?)>").expect("tag regex"));

static IGNORED_MARKUP: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->|<!\[CDATA\[.*?\]\]>|<\?.*?\?>|<![A-Za-z][^>]*>").expect("ignored markup regex"));

static RAW_TEXT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)(<script\b[^>]*>).*?(</script\s*>)|(<style\b[^>]*>).*?(</style\s*>)").expect("raw text regex"));

const VOID_ELEMENTS: &[&str] = &[
	"area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source", "track", "wbr",
];

fn validate_xml(content: &str) -> Result<(), StructuralError> {
	check_tags(content, false)
}

fn validate_html(content: &str) -> Result<(), StructuralError> {
	check_tags(content, true)
}

// Keeps newlines so reported line numbers stay correct.
fn blank_span(text: &str) -> String {
	text.chars()
		.map(|ch| if ch == '\n' {
			'\n'
		}
		else {
			' '
		})
		.collect()
}

fn check_tags(content: &str, html: bool) -> Result<(), StructuralError> {
	let mut cleaned = IGNORED_MARKUP.replace_all(content, |caps: &regex::Captures| blank_span(&caps[0])).into_owned();
	if html {
		cleaned = RAW_TEXT.replace_all(
			&cleaned,
			|caps: &regex::Captures| {
				let whole = &caps[0];
				let open = caps.get(1).or_else(|| caps.get(3)).map(|m| m.as_str()).unwrap_or("");
				let close = caps.get(2).or_else(|| caps.get(4)).map(|m| m.as_str()).unwrap_or("");
				let inner = &whole[open.len()..whole.len() - close.len()];
				format!("{}{}{}", open, blank_span(inner), close)
			}
		).into_owned();
	}
	let mut stack: Vec<(String, usize, usize)> = Vec::new();
	let mut position = Position::default();
	for caps in TAG.captures_iter(&cleaned) {
		let whole = caps.get(0).map(|m| m.start()).unwrap_or(0);
		let closing = !caps[1].is_empty();
		let name = caps[2].to_string();
		let self_closing = !caps[4].is_empty();
		let (line, column) = position.advance(&cleaned, whole);
		let compare_name = if html {
			name.to_ascii_lowercase()
		}
		else {
			name.clone()
		};
		if self_closing {
			continue;
		}
		if html && VOID_ELEMENTS.contains(&compare_name.as_str()) {
			continue;
		}
		if !closing {
			stack.push((compare_name, line, column));
			continue;
		}
		match stack.pop() {
			None => return Err(StructuralError::other(format!("unexpected closing tag </{}>", name), Some(line), Some(column))),
			Some((open, open_line, _)) if open != compare_name => {
				return Err(StructuralError::other(
					format!("closing tag </{}> does not match <{}> opened on line {}", name, open, open_line),
					Some(line),
					Some(column)
				));
			}
			Some(_) => {}
		}
	}
	if let Some((name, line, column)) = stack.last() {
		let open: Vec<String> = stack.iter()
			.map(|(name, _, _)| format!("<{}>", name))
			.collect();
		return Err(StructuralError::other(
			format!("unclosed tag <{}> (still open: {})", name, open.join(", ")),
			Some(*line),
			Some(*column)
		));
	}
	Ok(())
}

const DOCKERFILE_INSTRUCTIONS: &[&str] = &[
	"ADD", "ARG", "CMD", "COPY", "ENTRYPOINT", "ENV", "EXPOSE", "FROM", "HEALTHCHECK", "LABEL", "MAINTAINER", "ONBUILD",
	"RUN", "SHELL", "STOPSIGNAL", "USER", "VOLUME", "WORKDIR",
];

fn validate_dockerfile(content: &str) -> Result<(), StructuralError> {
	let mut seen_from = false;
	let mut continued = false;
	for (index, line) in content.lines().enumerate() {
		let trimmed = line.trim();
		let skippable = trimmed.is_empty() || trimmed.starts_with('#');
		if continued {
			continued = skippable || trimmed.ends_with('\\');
			continue;
		}
		if skippable {
			continue;
		}
		continued = trimmed.ends_with('\\');
		let keyword = trimmed.split_whitespace()
			.next()
			.unwrap_or("")
			.to_ascii_uppercase();
		let column = line.chars().take_while(|ch| ch.is_whitespace()).count() + 1;
		if !DOCKERFILE_INSTRUCTIONS.contains(&keyword.as_str()) {
			return Err(StructuralError::other(format!("unknown instruction '{}'", keyword), Some(index + 1), Some(column)));
		}
		if !seen_from && keyword != "FROM" && keyword != "ARG" {
			return Err(StructuralError::other(format!("{} appears before the first FROM", keyword), Some(index + 1), Some(column)));
		}
		seen_from |= keyword == "FROM";
	}
	if !seen_from {
		return Err(StructuralError::other("no FROM instruction", None, None));
	}
	Ok(())
}

/// Line and column tracker for offsets visited in increasing order.
struct Position {
	offset: usize,
	line: usize,
	column: usize,
}

impl Default for Position {
	fn default() -> Self {
		Self {
			offset: 0,
			line: 1,
			column: 1
		}
	}
}

impl Position {
	fn advance(&mut self, text: &str, offset: usize) -> (usize, usize) {
		for ch in text[self.offset..offset].chars() {
			if ch == '\n' {
				self.line += 1;
				self.column = 1;
			}
			else {
				self.column += 1;
			}
		}
		self.offset = offset;
		(self.line, self.column)
	}
}
