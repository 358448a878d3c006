//! 工具模块

pub mod transcript;

pub use transcript::TranscriptLogger;
