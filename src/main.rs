//! doc-buddy 命令行入口
//!
//! 扫描输入路径，逐个文件与 LLM 对话生成文档，写入输出目录。

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use doc_buddy::config::AppConfig;
use doc_buddy::llm::{ChatBackend, LlmClient};
use doc_buddy::services::conversation::SpinnerPresenter;
use doc_buddy::services::prompt::PromptTemplate;
use doc_buddy::services::scanner::FileScanner;
use doc_buddy::services::{DocPipeline, PipelineOutcome, PipelineSettings};
use doc_buddy::utils::TranscriptLogger;

#[derive(Parser)]
#[command(name = "doc-buddy")]
#[command(about = "Generate per-file documentation for a code base with an LLM", long_about = None)]
#[command(version)]
struct Cli {
    /// 要生成文档的文件或目录
    input_path: PathBuf,

    /// 文档输出目录
    output_path: PathBuf,

    /// 只处理这些扩展名（可带或不带前导点）
    #[arg(long, num_args = 0..)]
    file_types: Vec<String>,

    /// 只列出将要处理的文件
    #[arg(long)]
    dry_run: bool,

    /// 生成项目摘要（尚未实现）
    #[arg(long)]
    summary: bool,

    /// 配置文件路径
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// 在 Windows 上设置控制台代码页为 UTF-8
#[cfg(windows)]
fn setup_console_encoding() {
    unsafe {
        extern "system" {
            fn SetConsoleOutputCP(code_page: u32) -> i32;
        }
        SetConsoleOutputCP(65001);
    }
}

#[cfg(not(windows))]
fn setup_console_encoding() {}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "doc_buddy=debug" } else { "doc_buddy=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// 项目名：配置优先，否则取项目根目录名
fn project_name(config: &AppConfig, root: &Path) -> String {
    config
        .project_name
        .clone()
        .filter(|n| !n.trim().is_empty())
        .or_else(|| root.file_name().map(|n| n.to_string_lossy().to_string()))
        .unwrap_or_else(|| "project".to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_console_encoding();
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if cli.summary {
        println!("Generating summary...");
        println!("Not implemented yet.");
        return Ok(());
    }

    let config = AppConfig::load(cli.config.as_deref())?;

    // 模板错误在联系后端之前报告
    let prompt = PromptTemplate::resolve(config.prompt_template.as_deref())?;

    let scan = FileScanner::new(&cli.file_types, &config.ignore_patterns)
        .exclude(&cli.output_path)
        .scan(&cli.input_path)?;
    info!(
        "Found {} files under {} (git mode: {})",
        scan.files.len(),
        scan.project_root.display(),
        scan.git_mode
    );

    let settings = PipelineSettings {
        project_name: project_name(&config, &scan.project_root),
        prompt,
        documentation_suffix: config.documentation_suffix.clone(),
        output_root: cli.output_path.clone(),
        max_turns: config.max_turns,
        debug_prompt: config.debug_prompt,
        dry_run: cli.dry_run,
    };

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping after the current file");
                cancel.store(true, Ordering::SeqCst);
            }
        });
    }

    let mut pipeline = DocPipeline::new(settings).with_cancel_flag(cancel);
    if let Some(dir) = &config.transcript_dir {
        match TranscriptLogger::new(dir) {
            Ok(logger) => {
                info!("Recording conversations to {}", logger.log_path().display());
                pipeline = pipeline.with_transcript(logger);
            }
            Err(e) => warn!("Transcript disabled, cannot create {}: {}", dir.display(), e),
        }
    }

    let make_backend = || {
        LlmClient::new(
            config.provider,
            config.api_key.clone(),
            config.effective_base_url(),
            config.effective_model(),
            config.chat_options(),
        )
        .map(|client| Arc::new(client) as Arc<dyn ChatBackend>)
    };
    let make_presenter = |path: &Path| SpinnerPresenter::new(path.display().to_string());

    let outcome = pipeline
        .run(&scan, make_backend, make_presenter)
        .await
        .context("documentation run failed")?;

    match outcome {
        PipelineOutcome::DryRun { tree } => {
            println!("Dry run enabled. No files will be created.");
            println!("Files to be processed:");
            print!("{}", tree);
        }
        PipelineOutcome::DebugPrompt { file_path, prompt } => {
            println!("Prompt for {}:", file_path.display());
            println!("{}", prompt);
        }
        PipelineOutcome::Completed(stats) => {
            info!(
                "Done in {:.1}s: {} documented, {} failed, {} skipped of {} files",
                stats.elapsed.as_secs_f64(),
                stats.processed_files,
                stats.failed_count,
                stats.skipped_count,
                stats.total_files
            );
            if stats.cancelled {
                warn!("Run was cancelled before all files were documented");
            }
        }
    }

    Ok(())
}
