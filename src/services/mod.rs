//! 服务层模块

pub mod context_tree;
pub mod conversation;
pub mod doc_writer;
pub mod file_access;
pub mod pipeline;
pub mod prompt;
pub mod scanner;

pub use pipeline::{DocPipeline, PipelineOutcome, PipelineSettings, TaskStats};
