//! doc-buddy: 借助 LLM 工具调用为代码库逐文件生成文档

pub mod config;
pub mod error;
pub mod llm;
pub mod services;
pub mod utils;
