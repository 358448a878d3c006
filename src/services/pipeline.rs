//! 文档生成流水线
//!
//! 按字母序逐个处理文件：组装 Prompt、驱动对话、写入文档。
//! 单个文件的失败不会中断整次运行；取消标志只在文件之间检查。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::{error, info, warn};

use super::context_tree::{ContextTree, RenderOptions};
use super::conversation::{Orchestrator, ProgressChannel, ProgressPresenter};
use super::doc_writer::DocWriter;
use super::file_access::{file_tool_definition, FileAccess};
use super::prompt::{PromptContext, PromptTemplate, SYSTEM_PROMPT, TOOL_BLOCK};
use super::scanner::ScanResult;
use crate::error::{AppError, AppResult};
use crate::llm::{ChatBackend, LlmError, ToolDefinition};
use crate::utils::TranscriptLogger;

/// 流水线设置（均为已解析的值）
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub project_name: String,
    pub prompt: PromptTemplate,
    pub documentation_suffix: String,
    pub output_root: PathBuf,
    pub max_turns: usize,
    pub debug_prompt: bool,
    pub dry_run: bool,
}

/// 任务统计
#[derive(Debug, Clone, Default)]
pub struct TaskStats {
    /// 总文件数
    pub total_files: usize,
    /// 成功生成文档的文件数
    pub processed_files: usize,
    /// 失败数量
    pub failed_count: usize,
    /// 跳过数量（无法读取为文本或因取消未处理）
    pub skipped_count: usize,
    pub cancelled: bool,
    pub elapsed: Duration,
}

/// 流水线结果
#[derive(Debug)]
pub enum PipelineOutcome {
    /// 试运行：将要处理的文件树
    DryRun { tree: String },
    /// 调试模式：第一个文件的完整 Prompt
    DebugPrompt { file_path: PathBuf, prompt: String },
    Completed(TaskStats),
}

/// 单个文件的处理结果
enum FileResult {
    Documented(PathBuf),
    Failed(String),
    Skipped(String),
}

/// 一次运行中各文件共享的资源
struct RunContext<'a> {
    orchestrator: Orchestrator,
    backend_name: String,
    files: FileAccess,
    writer: DocWriter,
    tool: ToolDefinition,
    tree_text: &'a str,
}

/// 文档生成流水线
pub struct DocPipeline {
    settings: PipelineSettings,
    cancel: Arc<AtomicBool>,
    transcript: Option<TranscriptLogger>,
}

impl DocPipeline {
    pub fn new(settings: PipelineSettings) -> Self {
        Self {
            settings,
            cancel: Arc::new(AtomicBool::new(false)),
            transcript: None,
        }
    }

    /// 使用外部的取消标志（例如 Ctrl-C 处理器）
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_transcript(mut self, logger: TranscriptLogger) -> Self {
        self.transcript = Some(logger);
        self
    }

    /// 执行流水线
    ///
    /// 试运行和调试模式在构造后端之前返回。
    pub async fn run<B, F, P>(
        &self,
        scan: &ScanResult,
        make_backend: B,
        make_presenter: F,
    ) -> AppResult<PipelineOutcome>
    where
        B: FnOnce() -> Result<Arc<dyn ChatBackend>, LlmError>,
        F: Fn(&Path) -> P,
        P: ProgressPresenter,
    {
        let started = Instant::now();
        let tree = ContextTree::from_paths(&scan.files)?;

        if self.settings.dry_run {
            let options = RenderOptions::plain()
                .with_links(self.settings.documentation_suffix.clone())
                .with_sizes(&scan.project_root);
            return Ok(PipelineOutcome::DryRun {
                tree: tree.render(&options),
            });
        }

        let tree_text = tree.render(&RenderOptions::plain());
        let targets = tree.file_paths();

        if self.settings.debug_prompt {
            let Some(first) = targets.first() else {
                return Err(AppError::Config("没有可用于调试 Prompt 的文件".to_string()));
            };
            let source = fs::read_to_string(scan.project_root.join(first))
                .await
                .map_err(|e| AppError::Io(first.clone(), e))?;
            let prompt = self.build_prompt(&tree_text, first, &source);
            return Ok(PipelineOutcome::DebugPrompt {
                file_path: first.clone(),
                prompt,
            });
        }

        let mut stats = TaskStats {
            total_files: targets.len(),
            ..Default::default()
        };

        if targets.is_empty() {
            warn!("No files to document");
            return Ok(PipelineOutcome::Completed(stats));
        }

        let backend = make_backend()?;
        let ctx = RunContext {
            backend_name: backend.describe(),
            orchestrator: Orchestrator::new(backend).with_max_turns(self.settings.max_turns),
            files: FileAccess::new(&scan.project_root)
                .map_err(|e| AppError::Io(scan.project_root.clone(), e))?,
            writer: DocWriter::new(
                &self.settings.output_root,
                self.settings.documentation_suffix.clone(),
                self.settings.project_name.clone(),
            ),
            tool: file_tool_definition(),
            tree_text: &tree_text,
        };

        info!(
            "Documenting {} files with {} into {}",
            targets.len(),
            ctx.backend_name,
            self.settings.output_root.display()
        );

        for (i, relative) in targets.iter().enumerate() {
            if self.cancel.load(Ordering::SeqCst) {
                warn!("Cancelled, {} files left undocumented", targets.len() - i);
                stats.cancelled = true;
                stats.skipped_count += targets.len() - i;
                break;
            }

            info!("[{}/{}] Documenting {}", i + 1, targets.len(), relative.display());
            match self.process_file(&ctx, scan, relative, &make_presenter).await {
                FileResult::Documented(path) => {
                    info!("Documented {} -> {}", relative.display(), path.display());
                    stats.processed_files += 1;
                }
                FileResult::Failed(reason) => {
                    error!("Failed to document {}: {}", relative.display(), reason);
                    stats.failed_count += 1;
                }
                FileResult::Skipped(reason) => {
                    warn!("Skipped {}: {}", relative.display(), reason);
                    stats.skipped_count += 1;
                }
            }
        }

        ctx.writer.write_index(&tree).await?;

        stats.elapsed = started.elapsed();
        Ok(PipelineOutcome::Completed(stats))
    }

    fn build_prompt(&self, tree_text: &str, relative: &Path, source: &str) -> String {
        let file_path = relative.to_string_lossy().replace('\\', "/");
        self.settings.prompt.render(&PromptContext {
            project_name: &self.settings.project_name,
            tree: tree_text,
            file_path: &file_path,
            file_contents: source,
            tool_block: Some(TOOL_BLOCK.as_str()),
        })
    }

    /// 处理单个文件
    async fn process_file<F, P>(
        &self,
        ctx: &RunContext<'_>,
        scan: &ScanResult,
        relative: &Path,
        make_presenter: &F,
    ) -> FileResult
    where
        F: Fn(&Path) -> P,
        P: ProgressPresenter,
    {
        let source = match fs::read_to_string(scan.project_root.join(relative)).await {
            Ok(source) => source,
            Err(e) => return FileResult::Skipped(format!("cannot read as text: {}", e)),
        };

        let prompt = self.build_prompt(ctx.tree_text, relative, &source);
        let started = Instant::now();

        let channel = ProgressChannel::open(make_presenter(relative));
        let run = ctx
            .orchestrator
            .run(SYSTEM_PROMPT, &prompt, &ctx.tool, &ctx.files, channel.sink())
            .await;
        if let Err(e) = channel.close().await {
            warn!("Progress presenter ended abnormally: {}", e);
        }

        if let Some(logger) = &self.transcript {
            logger.record(
                &relative.to_string_lossy(),
                &ctx.backend_name,
                &run,
                started.elapsed(),
            );
        }

        match run.outcome {
            Ok(text) => match ctx.writer.write_document(relative, &text, &source).await {
                Ok(path) => FileResult::Documented(path),
                Err(e) => FileResult::Failed(e.to_string()),
            },
            Err(e) => FileResult::Failed(e.to_string()),
        }
    }
}
