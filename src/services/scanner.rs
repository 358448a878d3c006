//! 文件扫描器
//!
//! 枚举需要生成文档的文件。输入路径位于 git 仓库内时使用
//! `git ls-files` 以遵循 .gitignore，否则递归遍历目录。

use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 默认忽略模式
pub fn default_ignore_patterns() -> Vec<String> {
    [
        ".git",
        "node_modules",
        "__pycache__",
        ".venv",
        "venv",
        "target",
        "dist",
        "build",
        ".idea",
        ".vscode",
        ".cache",
        "*.pyc",
        "*.pyo",
        "*.so",
        "*.dll",
        "*.exe",
    ]
    .iter()
    .map(|p| p.to_string())
    .collect()
}

/// 扫描结果
#[derive(Debug, Clone)]
pub struct ScanResult {
    /// 项目根目录（git 模式下为仓库根目录）
    pub project_root: PathBuf,
    /// 相对项目根目录的文件路径，已排序
    pub files: Vec<PathBuf>,
    pub git_mode: bool,
}

/// 文件扫描器
pub struct FileScanner {
    /// 扩展名过滤（小写、不带点），为空表示不过滤
    file_types: Vec<String>,
    ignore_patterns: Vec<glob::Pattern>,
    /// 不参与扫描的目录（通常是文档输出目录）
    excluded: Option<PathBuf>,
}

impl FileScanner {
    pub fn new(file_types: &[String], ignore_patterns: &[String]) -> Self {
        let file_types = file_types
            .iter()
            .map(|t| t.trim().trim_start_matches('.').to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();

        let ignore_patterns = ignore_patterns
            .iter()
            .filter_map(|p| match glob::Pattern::new(p) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!("Invalid ignore pattern '{}': {}", p, e);
                    None
                }
            })
            .collect();

        Self {
            file_types,
            ignore_patterns,
            excluded: None,
        }
    }

    /// 排除某个目录（不存在时忽略）
    pub fn exclude(mut self, dir: &Path) -> Self {
        self.excluded = dir.canonicalize().ok();
        self
    }

    /// 扫描输入路径
    pub fn scan(&self, input: &Path) -> Result<ScanResult, ScanError> {
        let input = input
            .canonicalize()
            .map_err(|_| ScanError::PathNotFound(input.to_path_buf()))?;

        let git_root = find_git_root(&input);
        match &git_root {
            Some(root) => info!("Git root found at {}", root.display()),
            None => info!("No git root found, walking {}", input.display()),
        }

        if input.is_file() {
            let project_root = match (&git_root, input.parent()) {
                (Some(root), _) => root.clone(),
                (None, Some(parent)) => parent.to_path_buf(),
                (None, None) => return Err(ScanError::PathNotFound(input)),
            };
            let relative = relative_to(&input, &project_root)?;
            return Ok(ScanResult {
                project_root,
                files: vec![relative],
                git_mode: git_root.is_some(),
            });
        }

        if !input.is_dir() {
            return Err(ScanError::NotADirectory(input));
        }

        let (project_root, listed) = match git_root {
            Some(root) => match git_files(&root, &input) {
                Ok(files) => (root, Some(files)),
                Err(e) => {
                    warn!("git ls-files failed, falling back to directory walk: {}", e);
                    (root, None)
                }
            },
            None => (input.clone(), None),
        };
        let git_mode = listed.is_some();

        let mut files = match listed {
            Some(files) => files
                .into_iter()
                .filter(|f| !self.is_excluded(&project_root.join(f)))
                .collect(),
            None => self.walk_files(&input, &project_root)?,
        };

        files.retain(|f| self.matches_file_types(f));
        files.sort();
        files.dedup();

        info!("Scan completed: {} files", files.len());
        Ok(ScanResult {
            project_root,
            files,
            git_mode,
        })
    }

    /// 递归遍历目录
    fn walk_files(&self, input: &Path, project_root: &Path) -> Result<Vec<PathBuf>, ScanError> {
        let mut files = Vec::new();

        for entry in WalkDir::new(input)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !self.should_ignore(e.path()))
            .filter_map(|e| match e {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!("Skipping unreadable entry: {}", err);
                    None
                }
            })
        {
            if entry.file_type().is_file() {
                files.push(relative_to(entry.path(), project_root)?);
            }
        }

        Ok(files)
    }

    /// 检查是否应该忽略该路径
    fn should_ignore(&self, path: &Path) -> bool {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        if name.starts_with('.') {
            debug!("Ignoring hidden entry: {}", path.display());
            return true;
        }

        if self.ignore_patterns.iter().any(|p| p.matches(&name)) {
            debug!("Ignoring: {}", path.display());
            return true;
        }

        self.is_excluded(path)
    }

    fn is_excluded(&self, path: &Path) -> bool {
        matches!(&self.excluded, Some(dir) if path.starts_with(dir))
    }

    fn matches_file_types(&self, path: &Path) -> bool {
        if self.file_types.is_empty() {
            return true;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        self.file_types
            .iter()
            .any(|ext| name.ends_with(&format!(".{}", ext)))
    }
}

/// 从路径开始向上查找包含 `.git` 的目录
pub fn find_git_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(".git").exists())
        .map(Path::to_path_buf)
}

/// 通过 git 列出已跟踪和未被忽略的文件
fn git_files(root: &Path, input: &Path) -> Result<Vec<PathBuf>, ScanError> {
    let output = Command::new("git")
        .arg("-C")
        .arg(root)
        .args(["ls-files", "--others", "--cached", "--exclude-standard", "--"])
        .arg(input)
        .output()
        .map_err(|e| ScanError::GitError(format!("cannot run git: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ScanError::GitError(stderr.trim().to_string()));
    }

    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(PathBuf::from)
        .collect())
}

fn relative_to(path: &Path, root: &Path) -> Result<PathBuf, ScanError> {
    path.strip_prefix(root)
        .map(Path::to_path_buf)
        .map_err(|_| ScanError::OutsideRoot(path.to_path_buf()))
}

/// 扫描错误类型
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("路径不存在: {0}")]
    PathNotFound(PathBuf),

    #[error("路径既不是文件也不是目录: {0}")]
    NotADirectory(PathBuf),

    #[error("路径不在项目根目录内: {0}")]
    OutsideRoot(PathBuf),

    #[error("git 命令失败: {0}")]
    GitError(String),
}
