//! Reference builtin server exposing a sandboxed slice of the local disk.

use super::BuiltinServer;
use crate::mcp::error::McpError;
use async_trait::async_trait;
use rust_mcp_schema::RpcError;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use url::Url;

const SEARCH_MAX_DEPTH: usize = 16;
const SEARCH_MAX_RESULTS: usize = 200;

const READ_TOOLS: [&str; 3] = ["list_directory", "read_file", "search_files"];
const WRITE_TOOLS: [&str; 4] = ["write_file", "create_directory", "move_file", "delete_file"];

/// Resolves requested paths and refuses anything outside the allowed roots.
#[derive(Debug, Clone)]
pub struct PathGuard {
    roots: Vec<PathBuf>,
}

impl PathGuard {
    pub fn new(allowed_paths: &[String]) -> Result<Self, String> {
        let roots: Vec<PathBuf> = allowed_paths
            .iter()
            .map(|path| path.trim())
            .filter(|path| !path.is_empty())
            .filter_map(|path| {
                let path = Path::new(path);
                if !path.is_absolute() {
                    warn!(path = %path.display(), "Ignoring relative allowed path");
                    return None;
                }
                Some(resolve_existing_prefix(&normalize_path(path)))
            })
            .collect();
        if roots.is_empty() {
            return Err("Filesystem server requires at least one absolute allowed path.".to_string());
        }
        Ok(Self { roots })
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Relative paths are taken from the first root. Symlinks are followed
    /// for every existing ancestor, so a link cannot smuggle a path out.
    pub fn resolve(&self, requested: &str) -> Result<PathBuf, McpError> {
        let requested = requested.trim();
        if requested.is_empty() {
            return Err(McpError::AccessDenied("empty path".to_string()));
        }
        let path = Path::new(requested);
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.roots[0].join(path)
        };
        let resolved = resolve_existing_prefix(&normalize_path(&absolute));

        if self.roots.iter().any(|root| resolved.starts_with(root)) {
            Ok(resolved)
        } else {
            Err(McpError::AccessDenied(format!(
                "{requested} is outside the allowed directories"
            )))
        }
    }
}

/// Resolves `.` and `..` without touching the disk.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if !components.is_empty() && !matches!(components.last(), Some(Component::RootDir))
                {
                    components.pop();
                }
            }
            Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

/// Canonicalizes the longest existing ancestor and re-appends the rest.
fn resolve_existing_prefix(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut rest = Vec::new();
    loop {
        if let Ok(canonical) = std::fs::canonicalize(&existing) {
            return rest
                .iter()
                .rev()
                .fold(canonical, |acc: PathBuf, part: &std::ffi::OsString| acc.join(part));
        }
        match (existing.file_name().map(|name| name.to_os_string()), existing.parent()) {
            (Some(name), Some(parent)) => {
                rest.push(name);
                existing = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }
}

pub struct FilesystemServer {
    guard: PathGuard,
    read_only: bool,
    validators: HashMap<&'static str, jsonschema::Validator>,
}

impl FilesystemServer {
    pub fn new(allowed_paths: &[String], read_only: bool) -> Result<Self, String> {
        let mut validators = HashMap::new();
        for name in READ_TOOLS.iter().chain(WRITE_TOOLS.iter()) {
            let validator = jsonschema::validator_for(&input_schema(name))
                .map_err(|err| format!("Invalid schema for {name}: {err}"))?;
            validators.insert(*name, validator);
        }
        Ok(Self {
            guard: PathGuard::new(allowed_paths)?,
            read_only,
            validators,
        })
    }

    pub fn guard(&self) -> &PathGuard {
        &self.guard
    }

    fn validate_arguments(&self, name: &str, arguments: &Value) -> Result<(), RpcError> {
        let Some(validator) = self.validators.get(name) else {
            return Err(RpcError::invalid_params().with_message(&format!("Unknown tool: {name}")));
        };
        let problems: Vec<String> = validator
            .iter_errors(arguments)
            .map(|err| err.to_string())
            .collect();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(RpcError::invalid_params()
                .with_message(&format!("Invalid arguments for {name}: {}", problems.join("; "))))
        }
    }

    async fn run_tool(&self, name: &str, arguments: &Value) -> Result<String, McpError> {
        if self.read_only && WRITE_TOOLS.contains(&name) {
            return Err(McpError::AccessDenied(
                "write operations are disabled (server is read-only)".to_string(),
            ));
        }
        let path_arg = |key: &str| arguments.get(key).and_then(Value::as_str).unwrap_or("");

        match name {
            "list_directory" => {
                let path = self.guard.resolve(path_arg("path"))?;
                list_directory(&path).await
            }
            "read_file" => {
                let path = self.guard.resolve(path_arg("path"))?;
                tokio::fs::read_to_string(&path).await.map_err(io_failure)
            }
            "search_files" => {
                let path = self.guard.resolve(path_arg("path"))?;
                self.search(&path, path_arg("pattern")).await
            }
            "write_file" => {
                let path = self.guard.resolve(path_arg("path"))?;
                let content = path_arg("content");
                tokio::fs::write(&path, content).await.map_err(io_failure)?;
                Ok(format!(
                    "Wrote {} bytes to {}",
                    content.len(),
                    path.display()
                ))
            }
            "create_directory" => {
                let path = self.guard.resolve(path_arg("path"))?;
                tokio::fs::create_dir_all(&path).await.map_err(io_failure)?;
                Ok(format!("Created directory {}", path.display()))
            }
            "move_file" => {
                let source = self.guard.resolve(path_arg("source"))?;
                let destination = self.guard.resolve(path_arg("destination"))?;
                tokio::fs::rename(&source, &destination)
                    .await
                    .map_err(io_failure)?;
                Ok(format!(
                    "Moved {} to {}",
                    source.display(),
                    destination.display()
                ))
            }
            "delete_file" => {
                let path = self.guard.resolve(path_arg("path"))?;
                tokio::fs::remove_file(&path).await.map_err(io_failure)?;
                Ok(format!("Deleted {}", path.display()))
            }
            other => Err(McpError::ToolInvocation(format!("Unknown tool: {other}"))),
        }
    }

    /// Case-insensitive file name match, skipping symlinks.
    async fn search(&self, start: &Path, pattern: &str) -> Result<String, McpError> {
        let needle = pattern.to_lowercase();
        let mut matches = Vec::new();
        let mut stack = vec![(start.to_path_buf(), 0usize)];

        while let Some((dir, depth)) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if depth == 0 => return Err(io_failure(err)),
                Err(_) => continue,
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let Ok(file_type) = entry.file_type().await else {
                    continue;
                };
                if file_type.is_symlink() {
                    continue;
                }
                let path = entry.path();
                if entry
                    .file_name()
                    .to_string_lossy()
                    .to_lowercase()
                    .contains(&needle)
                {
                    matches.push(path.display().to_string());
                    if matches.len() >= SEARCH_MAX_RESULTS {
                        return Ok(matches.join("\n"));
                    }
                }
                if file_type.is_dir() && depth + 1 < SEARCH_MAX_DEPTH {
                    stack.push((path, depth + 1));
                }
            }
        }

        if matches.is_empty() {
            Ok("No matches found".to_string())
        } else {
            matches.sort();
            Ok(matches.join("\n"))
        }
    }
}

#[async_trait]
impl BuiltinServer for FilesystemServer {
    fn name(&self) -> &str {
        "filesystem"
    }

    fn tools(&self) -> Vec<Value> {
        READ_TOOLS
            .iter()
            .chain(WRITE_TOOLS.iter().filter(|_| !self.read_only))
            .map(|name| {
                json!({
                    "name": name,
                    "description": tool_description(name),
                    "inputSchema": input_schema(name),
                })
            })
            .collect()
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, RpcError> {
        self.validate_arguments(name, &arguments)?;
        debug!(tool = %name, "Builtin filesystem tool call");
        let result = match self.run_tool(name, &arguments).await {
            Ok(text) => json!({"content": [{"type": "text", "text": text}], "isError": false}),
            Err(err) => {
                json!({"content": [{"type": "text", "text": err.to_string()}], "isError": true})
            }
        };
        Ok(result)
    }

    fn resources(&self) -> Vec<Value> {
        self.guard
            .roots()
            .iter()
            .filter_map(|root| {
                let uri = Url::from_directory_path(root).ok()?;
                let name = root
                    .file_name()
                    .map(|name| name.to_string_lossy().to_string())
                    .unwrap_or_else(|| root.display().to_string());
                Some(json!({
                    "uri": uri.as_str(),
                    "name": name,
                    "description": format!("Allowed directory {}", root.display()),
                    "mimeType": "inode/directory",
                }))
            })
            .collect()
    }

    async fn read_resource(&self, uri: &str) -> Result<Value, RpcError> {
        let path = Url::parse(uri)
            .ok()
            .filter(|url| url.scheme() == "file")
            .and_then(|url| url.to_file_path().ok())
            .ok_or_else(|| {
                RpcError::invalid_params().with_message(&format!("Unsupported resource uri: {uri}"))
            })?;
        let path = self
            .guard
            .resolve(&path.to_string_lossy())
            .map_err(|err| RpcError::invalid_params().with_message(&err.to_string()))?;

        let text = if path.is_dir() {
            list_directory(&path).await
        } else {
            tokio::fs::read_to_string(&path).await.map_err(io_failure)
        };
        let text = text.map_err(|err| RpcError::internal_error().with_message(&err.to_string()))?;
        Ok(json!({"contents": [{"uri": uri, "mimeType": "text/plain", "text": text}]}))
    }
}

async fn list_directory(path: &Path) -> Result<String, McpError> {
    let mut entries = tokio::fs::read_dir(path).await.map_err(io_failure)?;
    let mut lines = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_failure)? {
        let is_dir = entry
            .file_type()
            .await
            .map(|file_type| file_type.is_dir())
            .unwrap_or(false);
        let label = if is_dir { "[DIR]" } else { "[FILE]" };
        lines.push(format!("{label} {}", entry.file_name().to_string_lossy()));
    }
    lines.sort();
    Ok(lines.join("\n"))
}

fn io_failure(err: std::io::Error) -> McpError {
    McpError::ToolInvocation(err.to_string())
}

fn tool_description(name: &str) -> &'static str {
    match name {
        "list_directory" => "List the entries of a directory.",
        "read_file" => "Read a UTF-8 text file.",
        "search_files" => "Recursively find files whose name contains a pattern.",
        "write_file" => "Create or overwrite a file with the given content.",
        "create_directory" => "Create a directory and any missing parents.",
        "move_file" => "Move or rename a file or directory.",
        "delete_file" => "Delete a file.",
        _ => "",
    }
}

fn input_schema(name: &str) -> Value {
    let path = json!({"type": "string", "minLength": 1});
    match name {
        "search_files" => json!({
            "type": "object",
            "properties": {"path": path, "pattern": {"type": "string", "minLength": 1}},
            "required": ["path", "pattern"]
        }),
        "write_file" => json!({
            "type": "object",
            "properties": {"path": path, "content": {"type": "string"}},
            "required": ["path", "content"]
        }),
        "move_file" => json!({
            "type": "object",
            "properties": {"source": path, "destination": path},
            "required": ["source", "destination"]
        }),
        _ => json!({
            "type": "object",
            "properties": {"path": path},
            "required": ["path"]
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn server(temp_dir: &TempDir, read_only: bool) -> FilesystemServer {
        let root = temp_dir.path().join("docs");
        std::fs::create_dir_all(&root).expect("create root");
        FilesystemServer::new(&[root.to_string_lossy().to_string()], read_only)
            .expect("server")
    }

    fn text(result: &Value) -> &str {
        result["content"][0]["text"].as_str().unwrap_or_default()
    }

    #[test]
    fn normalize_path_resolves_parent_components() {
        assert_eq!(
            normalize_path(Path::new("/srv/docs/a/../../etc/passwd")),
            PathBuf::from("/srv/etc/passwd")
        );
        assert_eq!(normalize_path(Path::new("/../..")), PathBuf::from("/"));
    }

    #[test]
    fn guard_rejects_paths_outside_roots() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let server = server(&temp_dir, false);
        let guard = server.guard();

        assert!(guard.resolve("notes/a.txt").is_ok());
        let escape = temp_dir.path().join("docs/../secret.txt");
        assert!(matches!(
            guard.resolve(&escape.to_string_lossy()),
            Err(McpError::AccessDenied(_))
        ));
        assert!(matches!(
            guard.resolve("../secret.txt"),
            Err(McpError::AccessDenied(_))
        ));
        let sibling = temp_dir.path().join("docs-other/file.txt");
        assert!(guard.resolve(&sibling.to_string_lossy()).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn guard_follows_symlinks_out_of_the_root() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let server = server(&temp_dir, false);
        std::fs::create_dir_all(temp_dir.path().join("outside")).expect("outside dir");
        std::os::unix::fs::symlink(
            temp_dir.path().join("outside"),
            temp_dir.path().join("docs/link"),
        )
        .expect("symlink");

        assert!(server.guard().resolve("link/file.txt").is_err());
    }

    #[test]
    fn guard_requires_an_absolute_root() {
        assert!(PathGuard::new(&["relative/dir".to_string()]).is_err());
        assert!(PathGuard::new(&[]).is_err());
    }

    #[tokio::test]
    async fn every_tool_rejects_out_of_root_paths() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let server = server(&temp_dir, false);
        let outside = temp_dir.path().join("outside.txt");
        std::fs::write(&outside, "secret").expect("write outside");
        let outside = outside.to_string_lossy().to_string();

        let calls = [
            ("list_directory", json!({"path": temp_dir.path().to_string_lossy()})),
            ("read_file", json!({"path": outside})),
            ("search_files", json!({"path": "/", "pattern": "outside"})),
            ("write_file", json!({"path": outside, "content": "x"})),
            ("create_directory", json!({"path": outside})),
            ("move_file", json!({"source": outside, "destination": "moved.txt"})),
            ("delete_file", json!({"path": outside})),
        ];
        for (tool, arguments) in calls {
            let result = server.call_tool(tool, arguments).await.expect("tool result");
            assert_eq!(result["isError"], true, "{tool} should be rejected");
            assert!(text(&result).starts_with("Access denied"), "{tool}: {}", text(&result));
        }
        assert_eq!(
            std::fs::read_to_string(temp_dir.path().join("outside.txt")).expect("still there"),
            "secret"
        );
    }

    #[tokio::test]
    async fn read_only_rejects_mutations_for_in_root_paths() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let server = server(&temp_dir, true);
        let root = server.guard().roots()[0].clone();
        std::fs::write(root.join("a.txt"), "keep").expect("seed");
        let a = root.join("a.txt").to_string_lossy().to_string();

        let calls = [
            ("write_file", json!({"path": a, "content": "x"})),
            ("create_directory", json!({"path": "sub"})),
            ("move_file", json!({"source": a, "destination": "b.txt"})),
            ("delete_file", json!({"path": a})),
        ];
        for (tool, arguments) in calls {
            let result = server.call_tool(tool, arguments).await.expect("tool result");
            assert_eq!(result["isError"], true);
            assert!(text(&result).contains("write operations are disabled"));
        }
        assert_eq!(std::fs::read_to_string(root.join("a.txt")).expect("read"), "keep");
        assert!(!root.join("sub").exists());

        let names: Vec<_> = server
            .tools()
            .iter()
            .filter_map(|tool| tool["name"].as_str().map(str::to_string))
            .collect();
        assert_eq!(names, vec!["list_directory", "read_file", "search_files"]);
    }

    #[tokio::test]
    async fn writable_server_round_trips_files() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let server = server(&temp_dir, false);

        let written = server
            .call_tool("write_file", json!({"path": "notes.txt", "content": "hello"}))
            .await
            .expect("write");
        assert_eq!(written["isError"], false);

        let read = server
            .call_tool("read_file", json!({"path": "notes.txt"}))
            .await
            .expect("read");
        assert_eq!(text(&read), "hello");

        let found = server
            .call_tool("search_files", json!({"path": ".", "pattern": "NOTES"}))
            .await
            .expect("search");
        assert!(text(&found).ends_with("notes.txt"));

        server
            .call_tool("create_directory", json!({"path": "archive"}))
            .await
            .expect("mkdir");
        server
            .call_tool(
                "move_file",
                json!({"source": "notes.txt", "destination": "archive/notes.txt"}),
            )
            .await
            .expect("move");
        let listing = server
            .call_tool("list_directory", json!({"path": "archive"}))
            .await
            .expect("list");
        assert_eq!(text(&listing), "[FILE] notes.txt");
    }

    #[tokio::test]
    async fn invalid_arguments_fail_schema_validation() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let server = server(&temp_dir, false);

        let err = server
            .call_tool("write_file", json!({"path": "a.txt"}))
            .await
            .expect_err("missing content");
        assert!(err.message.contains("Invalid arguments for write_file"));

        let err = server
            .call_tool("format_disk", json!({}))
            .await
            .expect_err("unknown tool");
        assert!(err.message.contains("Unknown tool"));
    }

    #[tokio::test]
    async fn roots_are_listed_and_readable_as_resources() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let server = server(&temp_dir, true);
        let root = server.guard().roots()[0].clone();
        std::fs::write(root.join("readme.md"), "# hi").expect("seed");

        let resources = server.resources();
        assert_eq!(resources.len(), 1);
        let uri = resources[0]["uri"].as_str().expect("uri").to_string();
        assert!(uri.starts_with("file://"));

        let listing = server.read_resource(&uri).await.expect("read root");
        assert_eq!(listing["contents"][0]["text"], "[FILE] readme.md");

        let file_uri = Url::from_file_path(root.join("readme.md")).expect("file url");
        let file = server
            .read_resource(file_uri.as_str())
            .await
            .expect("read file");
        assert_eq!(file["contents"][0]["text"], "# hi");

        assert!(server.read_resource("file:///etc/hostname").await.is_err());
    }
}
