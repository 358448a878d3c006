//! 上下文树
//!
//! 将扁平的相对路径列表构建为按字母序排列的目录树，
//! 用于 Prompt 上下文和面向用户的目录展示。

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::warn;

/// 树节点
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeNode {
    /// 目录，子节点按名称有序
    Directory { children: BTreeMap<String, TreeNode> },
    /// 文件；大小在渲染时查询，不在构建时缓存
    File,
}

impl TreeNode {
    fn directory() -> Self {
        TreeNode::Directory {
            children: BTreeMap::new(),
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, TreeNode::Directory { .. })
    }
}

/// 树构建错误
#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    /// 同一段在一条路径中是文件、在另一条路径中是目录
    #[error("路径冲突: {0} 同时被用作文件和目录")]
    Ambiguous(String),

    #[error("无效的相对路径: {0}")]
    InvalidPath(String),
}

/// 上下文树
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextTree {
    root: BTreeMap<String, TreeNode>,
}

impl ContextTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// 由相对路径列表构建
    pub fn from_paths<I, P>(paths: I) -> Result<Self, TreeError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut tree = Self::new();
        for path in paths {
            tree.insert(path.as_ref())?;
        }
        Ok(tree)
    }

    /// 插入一条文件路径，已存在的段会被复用
    pub fn insert(&mut self, path: &Path) -> Result<(), TreeError> {
        let display = path.to_string_lossy().replace('\\', "/");
        let mut segments = Vec::new();
        for component in path.components() {
            match component {
                Component::Normal(seg) => segments.push(seg.to_string_lossy().to_string()),
                Component::CurDir => {}
                _ => return Err(TreeError::InvalidPath(display)),
            }
        }

        if segments.is_empty() {
            return Err(TreeError::InvalidPath(display));
        }

        let last = segments.len() - 1;
        let mut current = &mut self.root;
        for (i, segment) in segments.into_iter().enumerate() {
            let is_leaf = i == last;
            let node = current.entry(segment).or_insert_with(|| {
                if is_leaf {
                    TreeNode::File
                } else {
                    TreeNode::directory()
                }
            });

            current = match (node, is_leaf) {
                (TreeNode::File, true) => return Ok(()),
                (TreeNode::Directory { children }, false) => children,
                _ => return Err(TreeError::Ambiguous(display)),
            };
        }

        Ok(())
    }

    /// 文件数量
    pub fn file_count(&self) -> usize {
        self.walk().filter(|e| !e.is_dir).count()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// 所有文件的相对路径（字母序）
    pub fn file_paths(&self) -> Vec<PathBuf> {
        self.walk().filter(|e| !e.is_dir).map(|e| e.path).collect()
    }

    /// 深度优先遍历，每次调用都从头开始
    pub fn walk(&self) -> TreeWalk<'_> {
        TreeWalk {
            stack: vec![Level {
                entries: self.root.iter().collect(),
                next: 0,
                path: PathBuf::new(),
            }],
        }
    }

    /// 渲染为文本树
    pub fn render(&self, options: &RenderOptions) -> String {
        let mut out = String::new();
        for entry in self.walk() {
            out.push_str(&entry.prefix());
            out.push_str(&render_label(&entry, options));
            out.push('\n');
        }
        out
    }
}

/// 渲染选项
#[derive(Debug, Clone, Default)]
pub struct RenderOptions {
    /// 文件渲染为 markdown 链接时附加的后缀；None 表示不渲染链接
    pub link_suffix: Option<String>,
    /// 查询文件大小的根目录；None 表示不显示大小
    pub size_root: Option<PathBuf>,
}

impl RenderOptions {
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn with_links(mut self, suffix: impl Into<String>) -> Self {
        self.link_suffix = Some(suffix.into());
        self
    }

    pub fn with_sizes(mut self, root: impl Into<PathBuf>) -> Self {
        self.size_root = Some(root.into());
        self
    }
}

fn render_label(entry: &TreeEntry<'_>, options: &RenderOptions) -> String {
    if entry.is_dir {
        return format!("{}/", entry.name);
    }

    let mut label = match &options.link_suffix {
        Some(suffix) => format!("[{}]({}{})", entry.name, entry.link_path(), suffix),
        None => entry.name.to_string(),
    };

    if let Some(root) = &options.size_root {
        let full = root.join(&entry.path);
        match fs::metadata(&full) {
            Ok(meta) => label.push_str(&format!(" [{} bytes]", meta.len())),
            Err(e) => {
                warn!("Failed to read size of {}: {}", full.display(), e);
                label.push_str(" [unknown size]");
            }
        }
    }

    label
}

/// 遍历产生的条目
#[derive(Debug, Clone)]
pub struct TreeEntry<'a> {
    pub name: &'a str,
    /// 相对路径
    pub path: PathBuf,
    /// 深度（顶层为 0）
    pub depth: usize,
    /// 是否为同级最后一个
    pub is_last: bool,
    /// 各级祖先是否为其同级最后一个（从顶层开始）
    pub ancestors_last: Vec<bool>,
    pub is_dir: bool,
}

impl TreeEntry<'_> {
    /// 连接线前缀；顶层条目不带连接线
    pub fn prefix(&self) -> String {
        if self.depth == 0 {
            return String::new();
        }

        let mut prefix = String::new();
        for last in self.ancestors_last.iter().skip(1) {
            prefix.push_str(if *last { "    " } else { "│   " });
        }
        prefix.push_str(if self.is_last { "└── " } else { "├── " });
        prefix
    }

    /// 使用 `/` 分隔的路径
    pub fn link_path(&self) -> String {
        self.path.to_string_lossy().replace('\\', "/")
    }
}

struct Level<'a> {
    entries: Vec<(&'a String, &'a TreeNode)>,
    next: usize,
    path: PathBuf,
}

/// 惰性深度优先遍历
pub struct TreeWalk<'a> {
    stack: Vec<Level<'a>>,
}

impl<'a> Iterator for TreeWalk<'a> {
    type Item = TreeEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let depth = self.stack.len().checked_sub(1)?;
            let level = self.stack.last_mut()?;

            if level.next >= level.entries.len() {
                self.stack.pop();
                continue;
            }

            let (name, node) = level.entries[level.next];
            level.next += 1;
            let is_last = level.next == level.entries.len();
            let path = level.path.join(name);

            // 每一级祖先的 is_last 就是该级最近一次产出的条目是否为最后一个
            let ancestors_last = self.stack[..depth]
                .iter()
                .map(|l| l.next == l.entries.len())
                .collect();

            let entry = TreeEntry {
                name: name.as_str(),
                path: path.clone(),
                depth,
                is_last,
                ancestors_last,
                is_dir: node.is_dir(),
            };

            if let TreeNode::Directory { children } = node {
                self.stack.push(Level {
                    entries: children.iter().collect(),
                    next: 0,
                    path,
                });
            }

            return Some(entry);
        }
    }
}
