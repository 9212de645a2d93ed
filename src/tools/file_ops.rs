//! `file_operations` tool: read and write UTF-8 files inside allow-listed
//! directories.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{Tool, ToolError, str_arg};
use crate::config::FileOperationsConfig;

/// Longest accepted `filepath` argument, in bytes.
const MAX_PATH_LEN: usize = 4096;

/// Secure file read/write within allowed directories.
#[derive(Debug, Clone)]
pub struct FileOperationsTool {
    allowed_directories: Vec<PathBuf>,
    max_file_size_bytes: u64,
    allowed_extensions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Read,
    Write,
}

impl FileOperationsTool {
    /// Create the tool. Allowed directories are resolved once, here.
    #[must_use]
    pub fn new(
        allowed_directories: &[PathBuf],
        max_file_size_bytes: u64,
        allowed_extensions: &[String],
    ) -> Self {
        let allowed_directories: Vec<PathBuf> = allowed_directories
            .iter()
            .map(|dir| resolve(dir).unwrap_or_else(|_| dir.clone()))
            .collect();
        let allowed_extensions = allowed_extensions
            .iter()
            .map(|ext| normalize_extension(ext))
            .collect();

        info!(
            directories = allowed_directories.len(),
            max_file_size_bytes,
            "File operations tool initialized"
        );

        Self {
            allowed_directories,
            max_file_size_bytes,
            allowed_extensions,
        }
    }

    /// Create the tool from configuration.
    #[must_use]
    pub fn from_config(config: &FileOperationsConfig) -> Self {
        Self::new(
            &config.allowed_directories,
            config.max_file_size_bytes,
            &config.allowed_extensions,
        )
    }

    fn validate_path(&self, filepath: &str) -> Result<PathBuf, ToolError> {
        if filepath.is_empty() {
            return Err(ToolError::PathNotAllowed("file path cannot be empty".into()));
        }
        if filepath.len() > MAX_PATH_LEN {
            return Err(ToolError::PathNotAllowed(format!(
                "file path too long ({} chars, max {MAX_PATH_LEN})",
                filepath.len()
            )));
        }
        if filepath.contains('\0') {
            return Err(ToolError::PathNotAllowed("file path contains null bytes".into()));
        }

        let path = Path::new(filepath);
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(ToolError::PathNotAllowed(format!(
                "path traversal detected in '{filepath}'"
            )));
        }

        let resolved = resolve(path)
            .map_err(|e| ToolError::PathNotAllowed(format!("invalid file path '{filepath}': {e}")))?;

        if !self
            .allowed_directories
            .iter()
            .any(|dir| resolved.starts_with(dir))
        {
            return Err(ToolError::PathNotAllowed(format!(
                "'{filepath}' is not within allowed directories"
            )));
        }

        Ok(resolved)
    }

    fn validate_extension(&self, path: &Path) -> Result<(), ToolError> {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return Err(ToolError::InvalidExtension("file must have an extension".into()));
        };
        let ext = normalize_extension(ext);
        if self.allowed_extensions.contains(&ext) {
            Ok(())
        } else {
            Err(ToolError::InvalidExtension(format!(
                "'{ext}' (allowed: {})",
                self.allowed_extensions.join(", ")
            )))
        }
    }

    fn read(&self, path: &Path) -> Result<Value, ToolError> {
        let shown = path.display().to_string();
        let metadata = match fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(ToolError::FileNotFound(shown)),
            Err(e) => return Err(permission_denied(&shown, "read", &e)),
        };
        if !metadata.is_file() {
            return Err(ToolError::InvalidParams(format!("path is not a file: {shown}")));
        }

        let size = metadata.len();
        if size > self.max_file_size_bytes {
            return Err(ToolError::FileTooLarge {
                size,
                max: self.max_file_size_bytes,
            });
        }

        let content = fs::read_to_string(path).map_err(|e| match e.kind() {
            ErrorKind::InvalidData => {
                ToolError::InvalidParams(format!("file is not valid UTF-8: {shown}"))
            }
            _ => permission_denied(&shown, "read", &e),
        })?;

        let modified_at = metadata
            .modified()
            .map(|t| DateTime::<Utc>::from(t).to_rfc3339())
            .ok();

        info!(filepath = %shown, size_bytes = size, "File read");
        Ok(json!({
            "content": content,
            "metadata": {
                "filepath": shown,
                "size_bytes": size,
                "modified_at": modified_at,
                "encoding": "utf-8",
            }
        }))
    }

    fn write(&self, path: &Path, content: &str) -> Result<Value, ToolError> {
        let shown = path.display().to_string();
        let size = content.len() as u64;
        if size > self.max_file_size_bytes {
            return Err(ToolError::FileTooLarge {
                size,
                max: self.max_file_size_bytes,
            });
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| permission_denied(&parent.display().to_string(), "create directory", &e))?;
        }
        fs::write(path, content).map_err(|e| permission_denied(&shown, "write", &e))?;

        let bytes_written = fs::metadata(path).map_or(size, |m| m.len());
        #[allow(clippy::cast_precision_loss)]
        let size_kb = (bytes_written as f64 / 1024.0 * 100.0).round() / 100.0;

        info!(filepath = %shown, bytes_written, "File written");
        Ok(json!({
            "success": true,
            "filepath": shown,
            "bytes_written": bytes_written,
            "size_kb": size_kb,
        }))
    }
}

impl Tool for FileOperationsTool {
    fn name(&self) -> &str {
        "file_operations"
    }

    fn description(&self) -> &str {
        "Read or write UTF-8 files within allowed directories"
    }

    fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let operation = match str_arg(&args, "operation")?
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "read" => Operation::Read,
            "write" => Operation::Write,
            other => {
                return Err(ToolError::InvalidParams(format!(
                    "unknown operation '{other}' (expected read or write)"
                )));
            }
        };
        let filepath = str_arg(&args, "filepath")?;
        debug!(operation = ?operation, filepath = %filepath, "Executing file operation");

        let path = self.validate_path(filepath)?;
        self.validate_extension(&path)?;

        match operation {
            Operation::Read => self.read(&path),
            Operation::Write => {
                let content = args.get("content").and_then(Value::as_str).ok_or_else(|| {
                    ToolError::InvalidParams("content is required for write operation".into())
                })?;
                self.write(&path, content)
            }
        }
    }
}

fn permission_denied(path: &str, operation: &str, err: &io::Error) -> ToolError {
    debug!(path = %path, operation = %operation, error = %err, "File operation refused");
    ToolError::PermissionDenied {
        path: path.to_string(),
        operation: operation.to_string(),
    }
}

fn normalize_extension(ext: &str) -> String {
    format!(".{}", ext.trim_start_matches('.').to_ascii_lowercase())
}

/// Absolute form of `path` with symlinks resolved as far as the path exists.
///
/// Components below the deepest existing ancestor are appended unchanged,
/// so a file about to be created still resolves inside its real parent.
fn resolve(path: &Path) -> io::Result<PathBuf> {
    let absolute = std::path::absolute(path)?;
    let mut existing = absolute.as_path();
    let mut pending = Vec::new();

    loop {
        if let Ok(mut resolved) = existing.canonicalize() {
            for name in pending.iter().rev() {
                resolved.push(name);
            }
            return Ok(resolved);
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                pending.push(name.to_os_string());
                existing = parent;
            }
            _ => return Ok(absolute),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn tool(dir: &TempDir) -> FileOperationsTool {
        FileOperationsTool::new(
            &[dir.path().to_path_buf()],
            64,
            &[".txt".to_string(), "JSON".to_string()],
        )
    }

    fn path_in(dir: &TempDir, name: &str) -> String {
        dir.path().join(name).display().to_string()
    }

    #[test]
    fn write_then_read_inside_allowed_dir() {
        // GIVEN: an allowed temp directory
        let dir = TempDir::new().unwrap();
        let tool = tool(&dir);
        let target = path_in(&dir, "nested/notes.txt");

        // WHEN: a file is written into a not-yet-existing subdirectory
        let written = tool
            .execute(json!({"operation": "write", "filepath": target, "content": "hello"}))
            .unwrap();

        // THEN: it is created and reads back with metadata
        assert_eq!(written["bytes_written"], 5);
        assert_eq!(written["success"], true);
        let read = tool
            .execute(json!({"operation": "READ", "filepath": target}))
            .unwrap();
        assert_eq!(read["content"], "hello");
        assert_eq!(read["metadata"]["size_bytes"], 5);
        assert_eq!(read["metadata"]["encoding"], "utf-8");
    }

    #[test]
    fn rejects_path_outside_allowed_dirs() {
        let dir = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let tool = tool(&dir);

        let err = tool
            .execute(json!({"operation": "read", "filepath": path_in(&other, "a.txt")}))
            .unwrap_err();

        assert!(matches!(err, ToolError::PathNotAllowed(_)));
    }

    #[test]
    fn rejects_parent_dir_traversal() {
        let dir = TempDir::new().unwrap();
        let tool = tool(&dir);
        let sneaky = format!("{}/sub/../../etc/passwd.txt", dir.path().display());

        let err = tool
            .execute(json!({"operation": "read", "filepath": sneaky}))
            .unwrap_err();

        assert!(matches!(err, ToolError::PathNotAllowed(_)));
    }

    #[test]
    fn rejects_nul_and_overlong_paths() {
        let dir = TempDir::new().unwrap();
        let tool = tool(&dir);

        let nul = tool
            .execute(json!({"operation": "read", "filepath": "a\0b.txt"}))
            .unwrap_err();
        let long = tool
            .execute(json!({"operation": "read", "filepath": "a".repeat(MAX_PATH_LEN + 1)}))
            .unwrap_err();

        assert!(matches!(nul, ToolError::PathNotAllowed(_)));
        assert!(matches!(long, ToolError::PathNotAllowed(_)));
    }

    #[test]
    fn rejects_disallowed_extension() {
        let dir = TempDir::new().unwrap();
        let tool = tool(&dir);

        let err = tool
            .execute(json!({"operation": "write", "filepath": path_in(&dir, "run.sh"), "content": "x"}))
            .unwrap_err();

        assert_eq!(err.code(), -32006);
    }

    #[test]
    fn extension_match_is_case_insensitive() {
        let dir = TempDir::new().unwrap();
        let tool = tool(&dir);

        let result = tool.execute(json!({
            "operation": "write",
            "filepath": path_in(&dir, "data.Json"),
            "content": "{}"
        }));

        assert!(result.is_ok());
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let tool = tool(&dir);

        let err = tool
            .execute(json!({"operation": "read", "filepath": path_in(&dir, "absent.txt")}))
            .unwrap_err();

        assert!(matches!(err, ToolError::FileNotFound(_)));
    }

    #[test]
    fn oversized_content_and_files_are_rejected() {
        let dir = TempDir::new().unwrap();
        let tool = tool(&dir);
        let big = "x".repeat(65);

        let write = tool
            .execute(json!({"operation": "write", "filepath": path_in(&dir, "big.txt"), "content": big}))
            .unwrap_err();
        assert!(matches!(write, ToolError::FileTooLarge { size: 65, max: 64 }));

        fs::write(dir.path().join("big.txt"), "y".repeat(100)).unwrap();
        let read = tool
            .execute(json!({"operation": "read", "filepath": path_in(&dir, "big.txt")}))
            .unwrap_err();
        assert!(matches!(read, ToolError::FileTooLarge { size: 100, .. }));
    }

    #[test]
    fn write_requires_content() {
        let dir = TempDir::new().unwrap();
        let tool = tool(&dir);

        let err = tool
            .execute(json!({"operation": "write", "filepath": path_in(&dir, "a.txt")}))
            .unwrap_err();

        assert!(matches!(err, ToolError::InvalidParams(_)));
    }

    #[test]
    fn unknown_operation_is_invalid_params() {
        let dir = TempDir::new().unwrap();
        let tool = tool(&dir);

        let err = tool
            .execute(json!({"operation": "delete", "filepath": path_in(&dir, "a.txt")}))
            .unwrap_err();

        assert_eq!(err.code(), -32602);
    }
}
