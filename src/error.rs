//! 统一错误处理模块
//!
//! 定义应用级错误类型。单个文件的对话失败不会上升为应用错误，
//! 只有配置、扫描、写入等影响整次运行的失败才会。

use std::path::PathBuf;
use thiserror::Error;

use crate::llm::LlmError;
use crate::services::context_tree::TreeError;
use crate::services::doc_writer::WriterError;
use crate::services::prompt::TemplateError;
use crate::services::scanner::ScanError;

/// 应用错误枚举
#[derive(Error, Debug)]
pub enum AppError {
    /// 配置相关错误
    #[error("配置错误: {0}")]
    Config(String),

    /// Prompt 模板错误，在联系后端之前报告
    #[error("模板错误: {0}")]
    Template(#[from] TemplateError),

    /// 后端初始化错误
    #[error("LLM 错误: {0}")]
    Llm(#[from] LlmError),

    #[error("扫描错误: {0}")]
    Scan(#[from] ScanError),

    #[error("目录树错误: {0}")]
    Tree(#[from] TreeError),

    #[error("写入错误: {0}")]
    Writer(#[from] WriterError),

    #[error("IO错误 ({0}): {1}")]
    Io(PathBuf, #[source] std::io::Error),

    /// 内部错误
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 便捷类型别名
pub type AppResult<T> = Result<T, AppError>;
