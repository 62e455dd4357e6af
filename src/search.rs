use crate::error::FsError;
use crate::guard::PathGuard;
use anyhow::Result;
use globset::{Glob, GlobBuilder, GlobMatcher, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use tracing::debug;

pub fn search(guard: &PathGuard, root: &Path, pattern: &str, exclude: &[String]) -> Result<Vec<PathBuf>> {
	if pattern.is_empty() {
		return Err(FsError::invalid("pattern is required").into());
	}
	let matcher = build_matcher(pattern);
	let exclude_set = build_exclude_set(exclude)?;
	let fragments: Option<Vec<String>> = if pattern.contains('*') {
		Some(pattern.split('*')
			.filter(|part| !part.is_empty())
			.map(|part| part.to_lowercase())
			.collect())
	}
	else {
		None
	};
	let mut builder = WalkBuilder::new(root);
	builder.standard_filters(false);
	builder.follow_links(false);
	builder.sort_by_file_name(|a, b| a.cmp(b));
	if let Some(excludes) = exclude_set {
		let walk_root = root.to_path_buf();
		builder.filter_entry(move |entry| {
			if entry.depth() == 0 {
				return true;
			}
			let rel = relative_display(&walk_root, entry.path());
			!excludes.is_match(&rel)
		});
	}
	let mut matches = Vec::new();
	for entry in builder.build() {
		let entry = match entry {
			Ok(entry) => entry,
			Err(err) => {
				debug!(error = %err, "skipping unreadable entry");
				continue;
			}
		};
		if entry.depth() == 0 {
			continue;
		}
		let path = entry.path();
		let resolved = match guard.authorize(&path.to_string_lossy()) {
			Ok(resolved) => resolved,
			Err(err) => {
				debug!(path = %path.display(), error = %err, "skipping unauthorized entry");
				continue;
			}
		};
		let name = entry.file_name().to_string_lossy();
		let rel = relative_display(root, path);
		if candidate_matches(&matcher, fragments.as_deref(), &name, &rel, path) {
			matches.push(resolved);
		}
	}
	Ok(matches)
}

enum Matcher {
	Glob(GlobMatcher),
	/// Case-insensitive substring, used when the pattern is not a valid glob.
	Literal(String),
}

impl Matcher {
	fn is_match(&self, name: &str, rel: &str, absolute: &Path) -> bool {
		match self {
			Matcher::Glob(glob) => glob.is_match(name) || glob.is_match(rel) || glob.is_match(absolute),
			Matcher::Literal(text) => name.to_lowercase().contains(text.as_str()) || rel.to_lowercase().contains(text.as_str()),
		}
	}
}

fn candidate_matches(
	matcher: &Matcher,
	fragments: Option<&[String]>,
	name: &str,
	rel: &str,
	absolute: &Path) -> bool {
	if matcher.is_match(name, rel, absolute) {
		return true;
	}
	let Some(fragments) = fragments else {
		return false;
	};
	let name = name.to_lowercase();
	let rel = rel.to_lowercase();
	fragments.iter().all(|part| name.contains(part.as_str()) || rel.contains(part.as_str()))
}

fn build_matcher(pattern: &str) -> Matcher {
	let glob = GlobBuilder::new(pattern)
		.case_insensitive(true)
		.literal_separator(true)
		.build();
	match glob {
		Ok(glob) => Matcher::Glob(glob.compile_matcher()),
		Err(err) => {
			debug!(pattern, error = %err, "pattern is not a valid glob; matching literally");
			Matcher::Literal(pattern.to_lowercase())
		}
	}
}

fn build_exclude_set(patterns: &[String]) -> Result<Option<GlobSet>> {
	let patterns: Vec<&String> = patterns.iter()
		.filter(|pattern| !pattern.trim().is_empty())
		.collect();
	if patterns.is_empty() {
		return Ok(None);
	}
	let mut builder = GlobSetBuilder::new();
	for pattern in patterns {
		// bare names exclude that name at any depth
		let expanded = if pattern.contains('*') {
			pattern.to_string()
		}
		else {
			format!("**/{}/**", pattern.trim_matches('/'))
		};
		let glob = match exclude_glob(&expanded) {
			Ok(glob) => glob,
			Err(err) => {
				debug!(pattern = %pattern, error = %err, "exclude is not a valid glob; excluding the literal name");
				let literal = format!("**/{}/**", globset::escape(pattern.trim_matches('/')));
				exclude_glob(&literal).map_err(|err| FsError::invalid(format!("invalid exclude glob {}: {}", pattern, err)))?
			}
		};
		builder.add(glob);
	}
	let set = builder.build().map_err(|err| FsError::invalid(format!("invalid exclude set: {}", err)))?;
	Ok(Some(set))
}

fn exclude_glob(pattern: &str) -> Result<Glob, globset::Error> {
	GlobBuilder::new(pattern)
		.case_insensitive(true)
		.literal_separator(true)
		.build()
}

fn relative_display(root: &Path, path: &Path) -> String {
	if let Ok(rel) = path.strip_prefix(root) {
		return rel.to_string_lossy().to_string();
	}
	path.to_string_lossy().to_string()
}
