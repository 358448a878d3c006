//! 文件访问能力
//!
//! 后端读取本地文件的唯一通道。请求路径必须是项目根目录下的相对路径，
//! 经过字面检查和规范化后的包含检查才会被读取。

use serde_json::json;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

use crate::llm::ToolDefinition;

/// 工具名称
pub const FILE_TOOL_NAME: &str = "get_additional_file";

/// 唯一的必填参数
pub const FILE_PATH_ARG: &str = "file_path";

/// 构建文件获取工具定义
pub fn file_tool_definition() -> ToolDefinition {
    ToolDefinition {
        name: FILE_TOOL_NAME.to_string(),
        description: "Retrieve the contents of an additional file required for documentation."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                FILE_PATH_ARG: {
                    "type": "string",
                    "description": "Path of the file, relative to the project root."
                }
            },
            "required": [FILE_PATH_ARG],
            "additionalProperties": false
        }),
    }
}

/// 文件访问错误
///
/// 错误文本会作为工具结果原样发送给后端。
#[derive(Debug, thiserror::Error)]
pub enum FileAccessError {
    #[error("access denied: absolute paths are not allowed ({0}); use a path relative to the project root")]
    AbsolutePath(String),

    #[error("access denied: parent directory segments are not allowed ({0})")]
    ParentTraversal(String),

    #[error("access denied: {0} resolves outside the project root")]
    OutsideRoot(String),

    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl FileAccessError {
    /// 是否为安全违规（区别于普通 IO 失败）
    pub fn is_security_violation(&self) -> bool {
        !matches!(self, FileAccessError::Io { .. })
    }
}

/// 项目根目录内的只读文件访问
#[derive(Debug, Clone)]
pub struct FileAccess {
    /// 规范化后的项目根目录
    project_root: PathBuf,
}

impl FileAccess {
    /// 创建文件访问能力，根目录会被规范化
    pub fn new(project_root: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self {
            project_root: project_root.as_ref().canonicalize()?,
        })
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// 校验并解析请求路径
    ///
    /// 相同输入重复调用得到相同结果，没有副作用。
    pub async fn resolve(&self, requested: &str) -> Result<PathBuf, FileAccessError> {
        check_literal(requested)?;

        let joined = self.project_root.join(requested);
        let resolved = fs::canonicalize(&joined)
            .await
            .map_err(|source| FileAccessError::Io {
                path: requested.to_string(),
                source,
            })?;

        // 规范化后再检查一次，防止符号链接逃逸
        if !resolved.starts_with(&self.project_root) {
            return Err(FileAccessError::OutsideRoot(requested.to_string()));
        }

        Ok(resolved)
    }

    /// 读取文件全部文本内容
    pub async fn read(&self, requested: &str) -> Result<String, FileAccessError> {
        let resolved = self.resolve(requested).await?;
        fs::read_to_string(&resolved)
            .await
            .map_err(|source| FileAccessError::Io {
                path: requested.to_string(),
                source,
            })
    }
}

/// 字面检查：拒绝绝对路径和任何 `..` 段
fn check_literal(requested: &str) -> Result<(), FileAccessError> {
    let path = Path::new(requested);
    let rooted = requested.starts_with('/') || requested.starts_with('\\');
    let has_prefix = path
        .components()
        .any(|c| matches!(c, Component::Prefix(_) | Component::RootDir));

    if path.is_absolute() || rooted || has_prefix || is_drive_path(requested) {
        return Err(FileAccessError::AbsolutePath(requested.to_string()));
    }

    if requested.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(FileAccessError::ParentTraversal(requested.to_string()));
    }

    Ok(())
}

/// Windows 盘符路径（在非 Windows 平台上 Path 不会识别）
fn is_drive_path(requested: &str) -> bool {
    let bytes = requested.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs as std_fs;
    use tempfile::TempDir;

    fn project() -> (TempDir, FileAccess) {
        let dir = TempDir::new().unwrap();
        std_fs::create_dir_all(dir.path().join("src")).unwrap();
        std_fs::write(dir.path().join("src/helpers.py"), "def helper(): pass\n").unwrap();
        let access = FileAccess::new(dir.path()).unwrap();
        (dir, access)
    }

    #[tokio::test]
    async fn test_read_relative_file() {
        let (_dir, access) = project();
        let content = access.read("src/helpers.py").await.unwrap();
        assert_eq!(content, "def helper(): pass\n");
    }

    #[tokio::test]
    async fn test_rejects_parent_segments() {
        let (_dir, access) = project();
        for path in ["../../etc/passwd", "src/../../secret", "src/..", "..\\windows\\win.ini", "src/./../src/helpers.py"] {
            let err = access.read(path).await.unwrap_err();
            assert!(err.is_security_violation(), "{} should be rejected", path);
            assert!(matches!(err, FileAccessError::ParentTraversal(_)));
        }
    }

    #[tokio::test]
    async fn test_rejects_absolute_paths() {
        let (dir, access) = project();
        let inside = dir.path().join("src/helpers.py");
        for path in ["/etc/passwd", "\\etc\\passwd", "C:\\Windows\\win.ini", "c:/x", inside.to_str().unwrap()] {
            let err = access.read(path).await.unwrap_err();
            assert!(matches!(err, FileAccessError::AbsolutePath(_)), "{} should be rejected", path);
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_io_failure() {
        let (_dir, access) = project();
        let err = access.read("src/missing.py").await.unwrap_err();
        assert!(!err.is_security_violation());
        assert!(matches!(err, FileAccessError::Io { .. }));
    }

    #[tokio::test]
    async fn test_directory_is_io_failure() {
        let (_dir, access) = project();
        let err = access.read("src").await.unwrap_err();
        assert!(!err.is_security_violation());
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let (_dir, access) = project();
        let first = access.resolve("src/helpers.py").await.unwrap();
        let second = access.resolve("src/helpers.py").await.unwrap();
        let dotted = access.resolve("./src/helpers.py").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, dotted);
        assert!(first.starts_with(access.project_root()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rejects_symlink_escape() {
        let outside = TempDir::new().unwrap();
        std_fs::write(outside.path().join("secret.txt"), "top secret").unwrap();

        let (dir, access) = project();
        std::os::unix::fs::symlink(outside.path().join("secret.txt"), dir.path().join("src/link.txt")).unwrap();

        let err = access.read("src/link.txt").await.unwrap_err();
        assert!(matches!(err, FileAccessError::OutsideRoot(_)));
        assert!(!err.to_string().contains("top secret"));
    }

    #[test]
    fn test_tool_definition_schema() {
        let tool = file_tool_definition();
        assert_eq!(tool.name, "get_additional_file");
        assert_eq!(tool.parameters["required"][0], "file_path");
        assert_eq!(tool.parameters["properties"]["file_path"]["type"], "string");
    }
}
