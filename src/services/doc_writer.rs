//! 文档写入器
//!
//! 将后端生成的文本组装为最终的 markdown 文档，按源码目录结构镜像保存，
//! 并在运行结束后生成目录索引。

use chrono::Local;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::context_tree::ContextTree;

/// 目录索引文件名
pub const INDEX_FILE: &str = "index.md";

/// 文档写入器
pub struct DocWriter {
    /// 文档根目录
    output_root: PathBuf,
    /// 文档文件后缀（默认 ".md"）
    suffix: String,
    project_name: String,
}

impl DocWriter {
    pub fn new(
        output_root: impl Into<PathBuf>,
        suffix: impl Into<String>,
        project_name: impl Into<String>,
    ) -> Self {
        Self {
            output_root: output_root.into(),
            suffix: suffix.into(),
            project_name: project_name.into(),
        }
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// 获取文件的文档路径
    ///
    /// 例如: src/utils/helper.py -> output_root/src/utils/helper.py.md
    pub fn doc_path(&self, relative: &Path) -> PathBuf {
        let mut name = relative
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(&self.suffix);

        match relative.parent() {
            Some(p) if !p.as_os_str().is_empty() => self.output_root.join(p).join(name),
            _ => self.output_root.join(name),
        }
    }

    /// 组装完整文档
    pub fn render_document(&self, relative: &Path, documentation: &str, source: &str) -> String {
        let file_name = relative
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let mut doc = preface(&self.project_name, relative);
        doc.push('\n');
        doc.push_str(documentation.trim_end());
        doc.push('\n');
        doc.push_str(&code_block(source, &file_name));
        doc.push_str(&footer(&file_name));
        doc
    }

    /// 写入单个文件的文档
    pub async fn write_document(
        &self,
        relative: &Path,
        documentation: &str,
        source: &str,
    ) -> Result<PathBuf, WriterError> {
        let path = self.doc_path(relative);
        let content = self.render_document(relative, documentation, source);
        save_document(&path, &content).await?;
        info!("Documentation saved: {}", path.display());
        Ok(path)
    }

    /// 生成目录索引
    pub fn render_index(&self, tree: &ContextTree) -> String {
        let mut out = format!("# Table of Contents for {}\n\n", self.project_name);
        for entry in tree.walk() {
            out.push_str(&"  ".repeat(entry.depth));
            if entry.is_dir {
                out.push_str(&format!("- **{}/**\n", entry.name));
            } else {
                out.push_str(&format!(
                    "- [{}]({}{})\n",
                    entry.name,
                    entry.link_path(),
                    self.suffix
                ));
            }
        }
        out.push_str(&footer(INDEX_FILE));
        out
    }

    /// 写入目录索引
    pub async fn write_index(&self, tree: &ContextTree) -> Result<PathBuf, WriterError> {
        let path = self.output_root.join(INDEX_FILE);
        save_document(&path, &self.render_index(tree)).await?;
        info!("Table of contents saved: {}", path.display());
        Ok(path)
    }
}

/// 文档开头：返回目录的链接和标题
///
/// 每多一级目录，链接多一个 `../`。
pub fn preface(project_name: &str, relative: &Path) -> String {
    let depth = relative.components().count().saturating_sub(1);
    let display = relative.to_string_lossy().replace('\\', "/");
    format!(
        "[<< Table of Contents]({}{})\n\n# AI Generated documentation for `{}/{}`\n---\n",
        "../".repeat(depth),
        INDEX_FILE,
        project_name,
        display
    )
}

/// 源码完整列表
pub fn code_block(code: &str, file_name: &str) -> String {
    let fence = "`".repeat(longest_backtick_run(code).max(2) + 1);
    format!(
        "\n# Full listing of {}\n{}{}\n{}\n{}\n",
        file_name,
        fence,
        guess_language(file_name),
        code.trim_end_matches('\n'),
        fence
    )
}

fn longest_backtick_run(code: &str) -> usize {
    code.split(|c: char| c != '`').map(str::len).max().unwrap_or(0)
}

/// 文档结尾
pub fn footer(file_name: &str) -> String {
    format!(
        "\n---\n*Documentation for `{}` generated by doc-buddy on {}.*\n",
        file_name,
        Local::now().format("%Y-%m-%d %H:%M:%S")
    )
}

/// 根据扩展名猜测 markdown 代码块语言，未知时为空
pub fn guess_language(file_name: &str) -> &'static str {
    let ext = Path::new(file_name)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "py" => "python",
        "js" => "javascript",
        "ts" => "typescript",
        "html" => "html",
        "css" => "css",
        "java" => "java",
        "c" => "c",
        "cpp" => "cpp",
        "cs" => "csharp",
        "rb" => "ruby",
        "php" => "php",
        "sh" | "bash" | "zsh" => "bash",
        "go" => "go",
        "rs" => "rust",
        "swift" => "swift",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "xml" => "xml",
        "sql" => "sql",
        "kt" => "kotlin",
        "m" => "matlab",
        "r" => "r",
        "pl" => "perl",
        "dockerfile" => "dockerfile",
        "ps1" => "powershell",
        "vim" => "vim",
        "lua" => "lua",
        "scala" => "scala",
        "hs" => "haskell",
        "md" => "markdown",
        _ => "",
    }
}

/// 保存文档到文件
async fn save_document(path: &Path, content: &str) -> Result<(), WriterError> {
    // 确保父目录存在
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| WriterError::IoError(parent.to_path_buf(), e))?;
    }

    let mut file = fs::File::create(path)
        .await
        .map_err(|e| WriterError::IoError(path.to_path_buf(), e))?;

    file.write_all(content.as_bytes())
        .await
        .map_err(|e| WriterError::IoError(path.to_path_buf(), e))?;

    Ok(())
}

/// 写入错误类型
#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("IO错误 ({0}): {1}")]
    IoError(PathBuf, #[source] std::io::Error),
}
