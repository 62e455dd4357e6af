use crate::error::FsError;
use crate::fs::atomic_write;
use crate::validate::{validate, FileKind, ValidationIssue, ValidationOutcome};
use anyhow::Result;
use serde::Deserialize;
use similar::TextDiff;
use std::path::Path;
use tracing::{debug, info};

#[derive(Clone, Debug, Deserialize)]
pub struct EditOperation {
	#[serde(rename = "oldText")]
	pub old_text: String,
	#[serde(rename = "newText")]
	pub new_text: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EditMatch {
	Exact,
	/// Whitespace-tolerant match starting at this 1-based line.
	Fuzzy {
		line: usize
	},
}

impl EditMatch {
	pub fn as_str(self) -> &'static str {
		match self {
			EditMatch::Exact => "exact",
			EditMatch::Fuzzy { .. } => "fuzzy",
		}
	}
}

#[derive(Debug)]
pub struct EditResult {
	pub original: String,
	pub modified: String,
	pub diff: String,
	pub matches: Vec<EditMatch>,
	pub persisted: bool,
}

impl EditResult {
	pub fn report(&self) -> String {
		render_report(&self.diff)
	}
}

pub struct EditRequest<'a> {
	pub path: &'a Path,
	pub display: &'a str,
	pub edits: &'a [EditOperation],
	pub dry_run: bool,
	pub skip_validation: bool,
}

pub fn normalize_line_endings(text: &str) -> String {
	text.replace("\r\n", "\n")
}

pub fn apply_edits(content: &str, edits: &[EditOperation]) -> Result<(String, Vec<EditMatch>), FsError> {
	edits.iter()
		.enumerate()
		.try_fold(
			(normalize_line_endings(content), Vec::with_capacity(edits.len())),
			|(current, mut matches), (index, edit)| -> Result<(String, Vec<EditMatch>), FsError> {
				let (next, found) = apply_edit(&current, edit, index)?;
				matches.push(found);
				Ok((next, matches))
			}
		)
}

fn apply_edit(content: &str, edit: &EditOperation, index: usize) -> Result<(String, EditMatch), FsError> {
	let old_text = normalize_line_endings(&edit.old_text);
	let new_text = normalize_line_endings(&edit.new_text);
	if old_text.is_empty() {
		return Err(FsError::invalid(format!("oldText is empty at edit {}", index)));
	}
	if content.contains(&old_text) {
		return Ok((content.replacen(&old_text, &new_text, 1), EditMatch::Exact));
	}
	let old_lines: Vec<&str> = old_text.split('\n').collect();
	let content_lines: Vec<&str> = content.split('\n').collect();
	if old_lines.len() > content_lines.len() {
		return Err(not_found(index, edit));
	}
	for start in 0..=content_lines.len() - old_lines.len() {
		let window = &content_lines[start..start + old_lines.len()];
		let matched = old_lines.iter()
			.zip(window)
			.all(|(old, current)| old.trim() == current.trim());
		if !matched {
			continue;
		}
		let original_indent = leading_whitespace(content_lines[start]);
		let replacement: Vec<String> = new_text.split('\n')
			.enumerate()
			.map(|(offset, line)| reindent_line(line, offset, original_indent, &old_lines))
			.collect();
		let mut lines: Vec<String> = Vec::with_capacity(content_lines.len() - old_lines.len() + replacement.len());
		lines.extend(content_lines[..start].iter().map(|line| line.to_string()));
		lines.extend(replacement);
		lines.extend(content_lines[start + old_lines.len()..].iter().map(|line| line.to_string()));
		debug!(edit = index, line = start + 1, "applied whitespace-tolerant match");
		return Ok((lines.join("\n"), EditMatch::Fuzzy {
			line: start + 1
		}));
	}
	Err(not_found(index, edit))
}

fn reindent_line(line: &str, offset: usize, original_indent: &str, old_lines: &[&str]) -> String {
	if offset == 0 {
		return format!("{}{}", original_indent, line.trim_start());
	}
	let old_indent = old_lines.get(offset)
		.map(|old| leading_whitespace(old))
		.unwrap_or("");
	let new_indent = leading_whitespace(line);
	if old_indent.is_empty() || new_indent.is_empty() {
		return line.to_string();
	}
	let relative = new_indent.chars().count().saturating_sub(old_indent.chars().count());
	format!("{}{}{}", original_indent, " ".repeat(relative), line.trim_start())
}

fn leading_whitespace(line: &str) -> &str {
	&line[..line.len() - line.trim_start().len()]
}

fn not_found(index: usize, edit: &EditOperation) -> FsError {
	FsError::EditNotFound {
		index,
		search: edit.old_text.clone()
	}
}

pub fn make_diff(original: &str, modified: &str, display: &str) -> String {
	TextDiff::from_lines(original, modified)
		.unified_diff()
		.context_radius(3)
		.header(&format!("a/{}", display), &format!("b/{}", display))
		.to_string()
}

pub fn render_report(diff: &str) -> String {
	let fence = "`".repeat((longest_backtick_run(diff) + 1).max(3));
	let body = if diff.ends_with('\n') || diff.is_empty() {
		diff.to_string()
	}
	else {
		format!("{}\n", diff)
	};
	format!("{}diff\n{}{}\n\n", fence, body, fence)
}

fn longest_backtick_run(text: &str) -> usize {
	let mut longest = 0usize;
	let mut current = 0usize;
	for ch in text.chars() {
		if ch == '`' {
			current += 1;
			longest = longest.max(current);
		}
		else {
			current = 0;
		}
	}
	longest
}

pub fn validation_report(display: &str, kind: FileKind, issue: &ValidationIssue) -> String {
	let mut report = format!(
		"Syntax validation failed for {} ({}):\n  {}{}\n",
		display,
		kind,
		issue.message,
		issue.location()
	);
	if !issue.hints.is_empty() {
		report.push_str(&format!("\nSuggestions for {} files:\n", kind));
		for hint in &issue.hints {
			report.push_str(&format!("  - {}\n", hint));
		}
	}
	report.push_str("\nGeneral guidance:\n");
	report.push_str("  - Re-read the file and make sure oldText matches the current content\n");
	report.push_str("  - Preview the result first with dryRun: true\n");
	report.push_str("  - If the file is intentionally non-standard, retry with skipValidation: true\n");
	report
}

pub async fn edit_file(request: EditRequest<'_>) -> Result<EditResult> {
	if request.edits.is_empty() {
		return Err(FsError::invalid("edits is empty").into());
	}
	let original = tokio::fs::read_to_string(request.path).await?;
	let original = normalize_line_endings(&original);
	let (modified, matches) = apply_edits(&original, request.edits)?;
	if !request.skip_validation {
		let kind = FileKind::detect(request.path);
		if let ValidationOutcome::Invalid(issue) = validate(&modified, kind) {
			info!(path = request.display, kind = %kind, message = %issue.message, "edit rejected by validation");
			return Err(FsError::ValidationFailed {
				report: validation_report(request.display, kind, &issue)
			}.into());
		}
	}
	let diff = make_diff(&original, &modified, request.display);
	let persisted = !request.dry_run;
	if persisted {
		atomic_write(request.path, &modified).await?;
	}
	Ok(EditResult {
		original,
		modified,
		diff,
		matches,
		persisted
	})
}
