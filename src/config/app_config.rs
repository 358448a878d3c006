//! 应用配置管理
//!
//! 配置先从 JSON 文件加载（不存在时使用默认值），再由环境变量覆盖。
//! 核心模块只接收解析完成的值，自身不读取环境变量。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{AppError, AppResult};
use crate::llm::{BackendKind, ChatOptions};
use crate::services::conversation::DEFAULT_MAX_TURNS;
use crate::services::scanner::default_ignore_patterns;

/// 配置文件名
pub const CONFIG_FILE_NAME: &str = "doc-buddy.json";

/// 获取默认配置文件路径
///
/// 配置文件位于可执行文件同级目录
pub fn default_config_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_FILE_NAME)
}

/// 应用配置结构体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 后端类型
    #[serde(default)]
    pub provider: BackendKind,

    /// 模型名称，为空时使用后端默认模型
    #[serde(default)]
    pub model: String,

    /// API 密钥
    #[serde(default)]
    pub api_key: String,

    /// API 基础 URL，为空时使用后端默认地址
    #[serde(default)]
    pub base_url: String,

    /// 温度参数 (0.0 - 2.0)
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// 最大 token 数
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// 自定义 Prompt 模板
    #[serde(default)]
    pub prompt_template: Option<String>,

    /// 文档文件后缀
    #[serde(default = "default_documentation_suffix")]
    pub documentation_suffix: String,

    /// 项目名称，为空时使用项目根目录名
    #[serde(default)]
    pub project_name: Option<String>,

    /// 只打印第一个文件的 Prompt，不调用后端
    #[serde(default)]
    pub debug_prompt: bool,

    /// 单次对话最大轮数
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,

    /// 对话记录目录，为空时不记录
    #[serde(default)]
    pub transcript_dir: Option<PathBuf>,

    /// 目录遍历时的忽略模式
    #[serde(default = "default_ignore_patterns")]
    pub ignore_patterns: Vec<String>,
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_documentation_suffix() -> String {
    ".md".to_string()
}

fn default_max_turns() -> usize {
    DEFAULT_MAX_TURNS
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            provider: BackendKind::default(),
            model: String::new(),
            api_key: String::new(),
            base_url: String::new(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            prompt_template: None,
            documentation_suffix: default_documentation_suffix(),
            project_name: None,
            debug_prompt: false,
            max_turns: default_max_turns(),
            transcript_dir: None,
            ignore_patterns: default_ignore_patterns(),
        }
    }
}

impl AppConfig {
    /// 加载配置
    ///
    /// 显式指定的配置文件必须存在；默认位置的配置文件可以不存在。
    pub fn load(explicit: Option<&Path>) -> AppResult<Self> {
        let mut config = match explicit {
            Some(path) => Self::load_file(path)?,
            None => {
                let path = default_config_path();
                if path.exists() {
                    Self::load_file(&path)?
                } else {
                    debug!("No config file at {}, using defaults", path.display());
                    Self::default()
                }
            }
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// 从文件加载配置
    fn load_file(path: &Path) -> AppResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("读取配置文件失败 {}: {}", path.display(), e)))?;
        let config = serde_json::from_str(&content)
            .map_err(|e| AppError::Config(format!("解析配置文件失败 {}: {}", path.display(), e)))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// 使用环境变量覆盖配置
    pub fn apply_env<F>(&mut self, lookup: F) -> AppResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |keys: &[&str]| {
            keys.iter()
                .filter_map(|k| lookup(*k))
                .map(|v| v.trim().to_string())
                .find(|v| !v.is_empty())
        };

        if let Some(provider) = get(&["AI_PROVIDER"]) {
            self.provider = provider.parse().map_err(AppError::Config)?;
        }

        let model_vars: &[&str] = match self.provider {
            BackendKind::Google => &["AI_MODEL", "GOOGLE_GEM_MODEL"],
            _ => &["AI_MODEL", "OPENAI_MODEL"],
        };
        if let Some(model) = get(model_vars) {
            self.model = model;
        }

        let key_vars: &[&str] = match self.provider {
            BackendKind::Anthropic => &["ANTHROPIC_API_KEY", "AI_API_KEY"],
            BackendKind::Google => &["GOOGLE_API_KEY", "AI_API_KEY"],
            _ => &["OPENAI_API_KEY", "AI_API_KEY"],
        };
        if let Some(key) = get(key_vars) {
            self.api_key = key;
        }

        let url_vars: &[&str] = match self.provider {
            BackendKind::Ollama => &["OLLAMA_HOST", "AI_BASE_URL"],
            BackendKind::Google => &["AI_BASE_URL"],
            _ => &["OPENAI_API_URL", "AI_BASE_URL"],
        };
        if let Some(url) = get(url_vars) {
            self.base_url = url;
        }

        if let Some(prompt) = get(&["AI_PROMPT"]) {
            self.prompt_template = Some(prompt);
        }

        if let Some(suffix) = get(&["DOCUMENTATION_SUFFIX"]) {
            self.documentation_suffix = suffix;
        }

        if let Some(name) = get(&["PROJECT_NAME"]) {
            self.project_name = Some(name);
        }

        if let Some(flag) = get(&["DEBUG_PROMPT"]) {
            self.debug_prompt = matches!(flag.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }

        if let Some(turns) = get(&["AI_MAX_TURNS"]) {
            self.max_turns = turns
                .parse()
                .map_err(|_| AppError::Config(format!("AI_MAX_TURNS 不是有效的数字: {}", turns)))?;
        }

        Ok(())
    }

    /// 实际使用的模型
    pub fn effective_model(&self) -> &str {
        if self.model.is_empty() {
            self.provider.default_model()
        } else {
            &self.model
        }
    }

    /// 实际使用的 API 地址
    pub fn effective_base_url(&self) -> &str {
        if self.base_url.is_empty() {
            self.provider.default_base_url()
        } else {
            &self.base_url
        }
    }

    pub fn chat_options(&self) -> ChatOptions {
        ChatOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
        }
    }
}
