use crate::error::FsError;
use anyhow::{anyhow, Result};
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

#[derive(Clone, Debug)]
pub struct PathGuard {
	roots: Arc<Vec<PathBuf>>,
	base: PathBuf,
}

impl PathGuard {
	/// Roots must already be absolute and canonical; see [`canonical_root`].
	pub fn new(roots: Vec<PathBuf>, base: PathBuf) -> Self {
		let mut unique: Vec<PathBuf> = Vec::new();
		for root in roots {
			if !unique.contains(&root) {
				unique.push(root);
			}
		}
		Self {
			roots: Arc::new(unique),
			base
		}
	}

	pub fn roots(&self) -> &[PathBuf] {
		&self.roots
	}

	pub fn default_root(&self) -> Option<&PathBuf> {
		self.roots.first()
	}

	pub fn is_root(&self, path: &Path) -> bool {
		self.roots.iter().any(|root| root == path)
	}

	pub fn contains(&self, path: &Path) -> bool {
		self.roots.iter().any(|root| is_within(root, path))
	}

	pub fn authorize(&self, requested: &str) -> Result<PathBuf> {
		self.resolve(requested, false)
	}

	/// Like [`PathGuard::authorize`], but a missing parent is walked up to the
	/// nearest existing ancestor instead of failing.
	pub fn authorize_for_create(&self, requested: &str) -> Result<PathBuf> {
		self.resolve(requested, true)
	}

	fn resolve(&self, requested: &str, allow_missing_parents: bool) -> Result<PathBuf> {
		if requested.trim().is_empty() {
			return Err(FsError::invalid("path is required").into());
		}
		let expanded = expand_home(requested);
		let absolute = if expanded.is_absolute() {
			expanded
		}
		else {
			self.base.join(expanded)
		};
		let normalized = normalize_path(&absolute);
		if !self.contains(&normalized) {
			return Err(FsError::AccessDenied {
				path: normalized
			}.into());
		}
		match std::fs::canonicalize(&normalized) {
			Ok(real) => {
				if !self.contains(&real) {
					debug!(requested = %normalized.display(), resolved = %real.display(), "symlink resolves outside allowed roots");
					return Err(FsError::AccessDenied {
						path: normalized
					}.into());
				}
				Ok(real)
			}
			Err(_) => self.resolve_missing_target(&normalized, allow_missing_parents),
		}
	}

	/// Returns the target joined onto its real (symlink-free) existing ancestor.
	fn resolve_missing_target(&self, normalized: &Path, allow_missing_parents: bool) -> Result<PathBuf> {
		let denied = || FsError::AccessDenied {
			path: normalized.to_path_buf()
		};
		let parent = normalized.parent().ok_or_else(denied)?;
		let name = normalized.file_name().ok_or_else(denied)?;
		let (real_ancestor, missing) = if allow_missing_parents {
			nearest_existing_ancestor(parent)?
		}
		else {
			let real = std::fs::canonicalize(parent).map_err(|_| FsError::ParentMissing {
				path: parent.to_path_buf()
			})?;
			(real, PathBuf::new())
		};
		if !self.contains(&real_ancestor) {
			return Err(denied().into());
		}
		let resolved = join_tail(real_ancestor, &missing).join(name);
		// dangling symlink: the link exists but its target does not
		if let Ok(meta) = std::fs::symlink_metadata(&resolved) {
			if meta.file_type().is_symlink() {
				let target = std::fs::read_link(&resolved)?;
				let target = match resolved.parent() {
					Some(link_dir) if !target.is_absolute() => link_dir.join(target),
					_ => target,
				};
				let target = normalize_path(&target);
				let escapes = match (target.parent(), target.file_name()) {
					(Some(target_parent), Some(target_name)) => {
						let (real, rest) = nearest_existing_ancestor(target_parent)?;
						!self.contains(&join_tail(real, &rest).join(target_name))
					}
					_ => true,
				};
				if escapes {
					return Err(denied().into());
				}
			}
		}
		Ok(resolved)
	}
}

pub fn canonical_root(raw: &str, cwd: &Path) -> Result<PathBuf> {
	let expanded = expand_home(raw.trim());
	let absolute = if expanded.is_absolute() {
		expanded
	}
	else {
		cwd.join(expanded)
	};
	let normalized = normalize_path(&absolute);
	let real = std::fs::canonicalize(&normalized).map_err(|err| anyhow!("allowed directory {} is not accessible: {}", normalized.display(), err))?;
	if !real.is_dir() {
		return Err(anyhow!("allowed directory {} is not a directory", real.display()));
	}
	Ok(real)
}

pub fn is_within(root: &Path, path: &Path) -> bool {
	if path == root {
		return true;
	}
	match path.strip_prefix(root) {
		Ok(rel) => !rel.is_absolute() && !rel.components().any(|component| matches!(component, Component::ParentDir)),
		Err(_) => false,
	}
}

pub fn expand_home(raw: &str) -> PathBuf {
	if raw == "~" {
		if let Some(home) = dirs::home_dir() {
			return home;
		}
	}
	if let Some(rest) = raw.strip_prefix("~/") {
		if let Some(home) = dirs::home_dir() {
			return home.join(rest);
		}
	}
	PathBuf::from(raw)
}

pub fn normalize_path(path: &Path) -> PathBuf {
	let mut stack: Vec<OsString> = Vec::new();
	let mut prefix: Option<OsString> = None;
	let mut absolute = false;
	for component in path.components() {
		match component {
			Component::Prefix(prefix_component) => {
				prefix = Some(prefix_component.as_os_str().to_os_string());
			}
			Component::RootDir => {
				absolute = true;
				stack.clear();
			}
			Component::CurDir => {}
			Component::ParentDir => {
				if stack.last().map(|last| last != "..").unwrap_or(false) {
					stack.pop();
				}
				else if !absolute {
					stack.push(OsString::from(".."));
				}
			}
			Component::Normal(part) => stack.push(part.to_os_string()),
		}
	}
	let mut out = PathBuf::new();
	if let Some(prefix) = prefix {
		out.push(prefix);
	}
	if absolute {
		out.push(Path::new("/"));
	}
	for part in stack {
		out.push(part);
	}
	out
}

fn join_tail(mut base: PathBuf, tail: &Path) -> PathBuf {
	if !tail.as_os_str().is_empty() {
		base.push(tail);
	}
	base
}

/// Canonical form of the deepest existing ancestor, plus the missing tail below it.
fn nearest_existing_ancestor(path: &Path) -> Result<(PathBuf, PathBuf)> {
	let mut current = Some(path);
	while let Some(candidate) = current {
		if let Ok(real) = std::fs::canonicalize(candidate) {
			let rest = path.strip_prefix(candidate)
				.map(Path::to_path_buf)
				.unwrap_or_default();
			return Ok((real, rest));
		}
		current = candidate.parent();
	}
	Err(FsError::ParentMissing {
		path: path.to_path_buf()
	}.into())
}
