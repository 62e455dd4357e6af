use crate::error::{error_code, FsError};
use crate::guard::PathGuard;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use filetime::{set_file_times, FileTime};
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, warn};

pub const ELLIPSIS_MARKER: &str = "...";

pub async fn read_file(path: &Path, head: Option<usize>, tail: Option<usize>) -> Result<String> {
	let content = fs::read_to_string(path).await?;
	Ok(slice_lines(&content, head, tail))
}

pub fn slice_lines(content: &str, head: Option<usize>, tail: Option<usize>) -> String {
	if head.is_none() && tail.is_none() {
		return content.to_string();
	}
	let lines: Vec<&str> = content.lines().collect();
	let total = lines.len();
	match (head, tail) {
		(Some(head), Some(tail)) => {
			if head.saturating_add(tail) >= total {
				return lines.join("\n");
			}
			let mut out: Vec<&str> = Vec::with_capacity(head + tail + 1);
			out.extend_from_slice(&lines[..head]);
			out.push(ELLIPSIS_MARKER);
			out.extend_from_slice(&lines[total - tail..]);
			out.join("\n")
		}
		(Some(head), None) => lines[..head.min(total)].join("\n"),
		(None, Some(tail)) => lines[total.saturating_sub(tail)..].join("\n"),
		(None, None) => content.to_string(),
	}
}

#[derive(Debug, Serialize)]
pub struct FileRead {
	pub path: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub content: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub code: Option<String>,
}

pub async fn read_multiple(guard: &PathGuard, paths: &[String]) -> Vec<FileRead> {
	let mut out = Vec::with_capacity(paths.len());
	for path in paths {
		let result = match guard.authorize(path) {
			Ok(resolved) => fs::read_to_string(&resolved).await.map_err(anyhow::Error::from),
			Err(err) => Err(err),
		};
		out.push(match result {
			Ok(content) => FileRead {
				path: path.clone(),
				content: Some(content),
				error: None,
				code: None
			},
			Err(err) => {
				debug!(path = %path, error = %err, "read failed in batch");
				let err = crate::error::format_io_error("read", path, err);
				FileRead {
					path: path.clone(),
					content: None,
					error: Some(err.to_string()),
					code: Some(error_code(&err).to_string())
				}
			}
		});
	}
	out
}

pub fn join_reads(reads: &[FileRead]) -> String {
	reads.iter()
		.map(|read| match (&read.content, &read.error) {
			(Some(content), _) => format!("{}:\n{}\n", read.path, content),
			(None, Some(error)) => format!("{}: Error - {}", read.path, error),
			(None, None) => format!("{}:", read.path),
		})
		.collect::<Vec<_>>()
		.join("\n---\n")
}

/// Writes through a sibling temp file and renames it over the target, so a
/// symlink planted at the target is replaced rather than followed.
pub async fn atomic_write(path: &Path, content: &str) -> Result<()> {
	let parent = path.parent().ok_or_else(|| anyhow!("path has no parent: {}", path.display()))?;
	let name = path.file_name()
		.map(|name| name.to_string_lossy().to_string())
		.unwrap_or_else(|| "file".to_string());
	let suffix = uuid::Uuid::new_v4().simple().to_string();
	let temp = parent.join(format!(".{}.{}.tmp", name, suffix));
	let existing_permissions = fs::symlink_metadata(path).await
		.ok()
		.filter(|meta| meta.is_file())
		.map(|meta| meta.permissions());
	let result = async {
		fs::write(&temp, content).await?;
		if let Some(permissions) = existing_permissions {
			fs::set_permissions(&temp, permissions).await?;
		}
		fs::rename(&temp, path).await?;
		Ok::<(), anyhow::Error>(())
	}.await;
	if let Err(err) = result {
		if let Err(cleanup) = fs::remove_file(&temp).await {
			debug!(temp = %temp.display(), error = %cleanup, "temp file cleanup failed");
		}
		return Err(err);
	}
	Ok(())
}

pub async fn create_directory(path: &Path) -> Result<()> {
	fs::create_dir_all(path).await?;
	Ok(())
}

#[derive(Debug, Serialize)]
pub struct DirEntryInfo {
	pub name: String,
	#[serde(rename = "type")]
	pub kind: &'static str,
}

pub async fn list_directory(path: &Path) -> Result<Vec<DirEntryInfo>> {
	let mut entries = fs::read_dir(path).await?;
	let mut out = Vec::new();
	while let Some(entry) = entries.next_entry().await? {
		let is_dir = entry.file_type()
			.await
			.map(|ftype| ftype.is_dir())
			.unwrap_or(false);
		out.push(DirEntryInfo {
			name: entry.file_name().to_string_lossy().to_string(),
			kind: if is_dir {
				"directory"
			}
			else {
				"file"
			}
		});
	}
	out.sort_by(|a, b| a.name.cmp(&b.name));
	Ok(out)
}

pub fn format_listing(entries: &[DirEntryInfo]) -> String {
	entries.iter()
		.map(|entry| if entry.kind == "directory" {
			format!("[DIR] {}", entry.name)
		}
		else {
			format!("[FILE] {}", entry.name)
		})
		.collect::<Vec<_>>()
		.join("\n")
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
	pub size: u64,
	pub created: Option<String>,
	pub modified: Option<String>,
	pub accessed: Option<String>,
	pub is_directory: bool,
	pub is_file: bool,
	pub is_symlink: bool,
	pub permissions: String,
}

pub async fn file_info(path: &Path) -> Result<FileInfo> {
	let meta = fs::metadata(path).await?;
	let is_symlink = fs::symlink_metadata(path).await
		.map(|link| link.file_type().is_symlink())
		.unwrap_or(false);
	Ok(FileInfo {
		size: meta.len(),
		created: meta.created().ok().map(rfc3339),
		modified: meta.modified().ok().map(rfc3339),
		accessed: meta.accessed().ok().map(rfc3339),
		is_directory: meta.is_dir(),
		is_file: meta.is_file(),
		is_symlink,
		permissions: permission_bits(&meta)
	})
}

fn rfc3339(time: SystemTime) -> String {
	DateTime::<Utc>::from(time).to_rfc3339()
}

#[cfg(unix)]
fn permission_bits(meta: &std::fs::Metadata) -> String {
	use std::os::unix::fs::PermissionsExt;
	format!("{:o}", meta.permissions().mode() & 0o777)
}

#[cfg(not(unix))]
fn permission_bits(meta: &std::fs::Metadata) -> String {
	if meta.permissions().readonly() {
		"444".to_string()
	}
	else {
		"666".to_string()
	}
}

pub async fn move_path(from: &Path, to: &Path) -> Result<()> {
	if fs::symlink_metadata(to).await.is_ok() {
		return Err(FsError::TargetExists {
			path: to.to_path_buf()
		}.into());
	}
	match fs::rename(from, to).await {
		Ok(_) => return Ok(()),
		Err(err) => {
			if !is_cross_device(&err) {
				return Err(err.into());
			}
		}
	}
	warn!(from = %from.display(), to = %to.display(), "rename crossed devices; copying instead");
	let meta = fs::metadata(from).await?;
	if meta.is_dir() {
		copy_dir_recursive(from.to_path_buf(), to.to_path_buf()).await?;
		fs::remove_dir_all(from).await?;
	}
	else {
		copy_file_with_meta(from, to).await?;
		fs::remove_file(from).await?;
	}
	Ok(())
}

pub async fn delete_path(path: &Path, recursive: bool) -> Result<()> {
	let meta = fs::symlink_metadata(path).await?;
	if !meta.is_dir() {
		fs::remove_file(path).await?;
		return Ok(());
	}
	if recursive {
		fs::remove_dir_all(path).await?;
		return Ok(());
	}
	let mut entries = fs::read_dir(path).await?;
	if entries.next_entry().await?.is_some() {
		return Err(FsError::NotEmpty {
			path: path.to_path_buf()
		}.into());
	}
	fs::remove_dir(path).await?;
	Ok(())
}

async fn copy_file_with_meta(from: &Path, to: &Path) -> Result<()> {
	fs::copy(from, to).await?;
	let meta = fs::metadata(from).await?;
	fs::set_permissions(to, meta.permissions()).await?;
	let atime = FileTime::from_last_access_time(&meta);
	let mtime = FileTime::from_last_modification_time(&meta);
	set_file_times(to, atime, mtime)?;
	Ok(())
}

fn copy_dir_recursive(from: PathBuf, to: PathBuf) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
	Box::pin(
		async move {
			fs::create_dir_all(&to).await?;
			let mut entries = fs::read_dir(&from).await?;
			while let Some(entry) = entries.next_entry().await? {
				let src = entry.path();
				let dst = to.join(entry.file_name());
				let meta = fs::symlink_metadata(&src).await?;
				if meta.is_dir() {
					copy_dir_recursive(src, dst).await?;
				}
				else if meta.file_type().is_symlink() {
					let target = fs::read_link(&src).await?;
					symlink(&target, &dst).await?;
				}
				else {
					copy_file_with_meta(&src, &dst).await?;
				}
			}
			let meta = fs::metadata(&from).await?;
			fs::set_permissions(&to, meta.permissions()).await?;
			let atime = FileTime::from_last_access_time(&meta);
			let mtime = FileTime::from_last_modification_time(&meta);
			set_file_times(&to, atime, mtime)?;
			Ok(())
		}
	)
}

#[cfg(unix)]
async fn symlink(target: &Path, link: &Path) -> Result<()> {
	fs::symlink(target, link).await?;
	Ok(())
}

#[cfg(not(unix))]
async fn symlink(target: &Path, link: &Path) -> Result<()> {
	Err(anyhow!("cannot copy symlink {} -> {}", link.display(), target.display()))
}

fn is_cross_device(err: &std::io::Error) -> bool {
	err.raw_os_error() == Some(libc::EXDEV)
}

pub struct CommandRequest<'a> {
	pub command: &'a str,
	pub cwd: &'a Path,
	pub timeout: Duration,
}

#[derive(Debug)]
pub struct CommandOutput {
	pub exit_code: i32,
	pub stdout: String,
	pub stderr: String,
}

fn shell_command(command: &str) -> Command {
	if cfg!(windows) {
		let mut cmd = Command::new("cmd");
		cmd.arg("/C").arg(command);
		cmd
	}
	else {
		let mut cmd = Command::new("sh");
		cmd.arg("-c").arg(command);
		cmd
	}
}

pub async fn run_command(request: CommandRequest<'_>) -> Result<CommandOutput> {
	let mut cmd = shell_command(request.command);
	cmd.current_dir(request.cwd);
	cmd.stdin(Stdio::null());
	cmd.stdout(Stdio::piped());
	cmd.stderr(Stdio::piped());
	cmd.kill_on_drop(true);
	let child = cmd.spawn()?;
	// dropping the wait future drops the child, which kills it
	let output = match tokio::time::timeout(request.timeout, child.wait_with_output()).await {
		Ok(output) => output?,
		Err(_) => {
			warn!(command = request.command, timeout_ms = request.timeout.as_millis() as u64, "command timed out");
			return Err(FsError::CommandFailed {
				exit_code: None,
				killed: true,
				stdout: String::new(),
				stderr: String::new()
			}.into());
		}
	};
	let stdout = String::from_utf8_lossy(&output.stdout).to_string();
	let stderr = String::from_utf8_lossy(&output.stderr).to_string();
	if !output.status.success() {
		return Err(FsError::CommandFailed {
			exit_code: output.status.code(),
			killed: false,
			stdout,
			stderr
		}.into());
	}
	Ok(CommandOutput {
		exit_code: output.status.code().unwrap_or(0),
		stdout,
		stderr
	})
}
