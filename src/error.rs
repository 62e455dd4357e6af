use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
	#[error("access denied - path outside allowed directories: {}", path.display())]
	AccessDenied {
		path: PathBuf
	},
	#[error("parent directory does not exist: {}", path.display())]
	ParentMissing {
		path: PathBuf
	},
	#[error("not found: {}", path.display())]
	NotFound {
		path: PathBuf
	},
	#[error("directory not empty: {} (pass recursive: true to delete its contents)", path.display())]
	NotEmpty {
		path: PathBuf
	},
	#[error("target exists: {}", path.display())]
	TargetExists {
		path: PathBuf
	},
	#[error("cannot {action} an allowed root directory: {}", path.display())]
	RootProtected {
		action: &'static str,
		path: PathBuf
	},
	#[error("{0}")]
	InvalidArgument(String),
	#[error("could not find a match for edit {index}:\n{search}")]
	EditNotFound {
		index: usize,
		search: String
	},
	#[error("{report}")]
	ValidationFailed {
		report: String
	},
	#[error("{}", command_failure_message(*exit_code, *killed))]
	CommandFailed {
		exit_code: Option<i32>,
		killed: bool,
		stdout: String,
		stderr: String
	},
}

impl FsError {
	pub fn invalid(message: impl Into<String>) -> Self {
		FsError::InvalidArgument(message.into())
	}
	pub fn code(&self) -> &'static str {
		match self {
			FsError::AccessDenied { .. } => "ACCESS_DENIED",
			FsError::ParentMissing { .. } => "PARENT_MISSING",
			FsError::NotFound { .. } => "NOT_FOUND",
			FsError::NotEmpty { .. } => "NOT_EMPTY",
			FsError::TargetExists { .. } => "TARGET_EXISTS",
			FsError::RootProtected { .. } => "ROOT_PROTECTED",
			FsError::InvalidArgument(_) => "INVALID_ARGUMENT",
			FsError::EditNotFound { .. } => "EDIT_NOT_FOUND",
			FsError::ValidationFailed { .. } => "VALIDATION_FAILED",
			FsError::CommandFailed { .. } => "COMMAND_FAILED",
		}
	}
}

fn command_failure_message(exit_code: Option<i32>, killed: bool) -> String {
	if killed {
		return "command killed after timeout".to_string();
	}
	match exit_code {
		Some(code) => format!("command failed with exit code {}", code),
		None => "command terminated by signal".to_string(),
	}
}

pub fn error_code(err: &anyhow::Error) -> &'static str {
	if let Some(fs_err) = err.downcast_ref::<FsError>() {
		return fs_err.code();
	}
	if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
		return match io_err.kind() {
			std::io::ErrorKind::NotFound => "NOT_FOUND",
			std::io::ErrorKind::PermissionDenied => "PERMISSION_DENIED",
			std::io::ErrorKind::AlreadyExists => "TARGET_EXISTS",
			std::io::ErrorKind::InvalidData => "INVALID_DATA",
			_ => "IO_ERROR",
		};
	}
	"EXECUTION_ERROR"
}

// io errors lose the path they were about; callers re-wrap them here
pub fn format_io_error(action: &str, path: &str, err: anyhow::Error) -> anyhow::Error {
	let Some(io_err) = err.downcast_ref::<std::io::Error>() else {
		return err;
	};
	match io_err.kind() {
		std::io::ErrorKind::NotFound => FsError::NotFound {
			path: PathBuf::from(path)
		}.into(),
		std::io::ErrorKind::PermissionDenied => err.context(format!("{} {}: permission denied", action, path)),
		std::io::ErrorKind::InvalidData => err.context(format!("{} {}: file is not valid UTF-8", action, path)),
		_ => err.context(format!("{} {}", action, path)),
	}
}
