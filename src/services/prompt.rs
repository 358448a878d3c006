//! Prompt 组装
//!
//! 模板在启动时解析一次，之后的渲染不会失败。
//! 占位符：`{project_name}` `{tree}` `{file_path}` `{tool_block}` `{file_contents}`，
//! `{{` 和 `}}` 表示字面量花括号。

use once_cell::sync::Lazy;
use regex::Regex;
use std::str::FromStr;

use super::file_access::FILE_TOOL_NAME;

/// 系统提示词
pub const SYSTEM_PROMPT: &str = "You are a helpful assistant that documents code in detail.";

/// 默认模板
pub const DEFAULT_TEMPLATE: &str = r#"Please provide detailed documentation for the following file of the project "{project_name}".

Project structure:
{tree}
File path: {file_path}
{tool_block}
File contents:
{file_contents}

Make sure to include explanations for all functions, classes, and key logic in the file."#;

/// 文件获取能力说明
pub static TOOL_BLOCK: Lazy<String> = Lazy::new(|| {
    format!(
        "\nIf documenting this file accurately requires the contents of another file in the project, \
call the `{}` tool with that file's path relative to the project root, as shown in the project structure above.\n",
        FILE_TOOL_NAME
    )
});

static RE_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{|\}\}|\{([^{}]*)\}|[{}]").unwrap());

/// 模板配置错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("未知的模板占位符: {{{0}}}，可用占位符: {{project_name}} {{tree}} {{file_path}} {{tool_block}} {{file_contents}}")]
    UnknownPlaceholder(String),

    #[error("模板第 {0} 个字符处的花括号不成对，字面量花括号请写成 {{{{ 或 }}}}")]
    UnbalancedBrace(usize),
}

/// 模板占位符
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placeholder {
    ProjectName,
    Tree,
    FilePath,
    ToolBlock,
    FileContents,
}

impl FromStr for Placeholder {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "project_name" => Ok(Placeholder::ProjectName),
            "tree" => Ok(Placeholder::Tree),
            "file_path" => Ok(Placeholder::FilePath),
            "tool_block" => Ok(Placeholder::ToolBlock),
            "file_contents" => Ok(Placeholder::FileContents),
            other => Err(TemplateError::UnknownPlaceholder(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(Placeholder),
}

/// 渲染 Prompt 所需的上下文
#[derive(Debug, Clone, Copy)]
pub struct PromptContext<'a> {
    pub project_name: &'a str,
    /// 已渲染的上下文树
    pub tree: &'a str,
    /// 目标文件的项目相对路径
    pub file_path: &'a str,
    pub file_contents: &'a str,
    /// 后端支持文件获取时的能力说明
    pub tool_block: Option<&'a str>,
}

impl PromptContext<'_> {
    fn value(&self, placeholder: Placeholder) -> &str {
        match placeholder {
            Placeholder::ProjectName => self.project_name,
            Placeholder::Tree => self.tree,
            Placeholder::FilePath => self.file_path,
            Placeholder::ToolBlock => self.tool_block.unwrap_or(""),
            Placeholder::FileContents => self.file_contents,
        }
    }
}

/// 已校验的 Prompt 模板
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    segments: Vec<Segment>,
}

impl PromptTemplate {
    /// 解析并校验模板
    pub fn parse(template: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut last = 0;

        for caps in RE_TOKEN.captures_iter(template) {
            let Some(token) = caps.get(0) else { continue };
            literal.push_str(&template[last..token.start()]);
            last = token.end();

            match token.as_str() {
                "{{" => literal.push('{'),
                "}}" => literal.push('}'),
                "{" | "}" => {
                    let position = template[..token.start()].chars().count() + 1;
                    return Err(TemplateError::UnbalancedBrace(position));
                }
                _ => {
                    let name = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
                    let placeholder = name.parse::<Placeholder>()?;
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Placeholder(placeholder));
                }
            }
        }

        literal.push_str(&template[last..]);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self { segments })
    }

    /// 使用自定义模板，未配置时使用默认模板
    pub fn resolve(custom: Option<&str>) -> Result<Self, TemplateError> {
        match custom {
            Some(template) if !template.trim().is_empty() => Self::parse(template),
            _ => Self::parse(DEFAULT_TEMPLATE),
        }
    }

    /// 渲染最终 Prompt
    pub fn render(&self, ctx: &PromptContext<'_>) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(p) => out.push_str(ctx.value(*p)),
            }
        }
        out
    }
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            segments: Self::parse(DEFAULT_TEMPLATE)
                .map(|t| t.segments)
                .unwrap_or_else(|_| vec![Segment::Literal(DEFAULT_TEMPLATE.to_string())]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(tool_block: Option<&'a str>) -> PromptContext<'a> {
        PromptContext {
            project_name: "demo",
            tree: "src/\n└── main.py\n",
            file_path: "src/main.py",
            file_contents: "print('hi')\n",
            tool_block,
        }
    }

    #[test]
    fn test_default_template_order() {
        let prompt = PromptTemplate::default().render(&ctx(Some(TOOL_BLOCK.as_str())));

        let positions: Vec<usize> = ["demo", "└── main.py", "File path: src/main.py", "get_additional_file", "print('hi')"]
            .iter()
            .map(|needle| prompt.find(needle).unwrap())
            .collect();
        let mut sorted = positions.clone();
        sorted.sort();
        assert_eq!(positions, sorted);
    }

    #[test]
    fn test_default_template_without_tool_block() {
        let prompt = PromptTemplate::resolve(None).unwrap().render(&ctx(None));
        assert!(!prompt.contains("get_additional_file"));
        assert!(prompt.contains("print('hi')"));
    }

    #[test]
    fn test_custom_template_substitution_and_escapes() {
        let template = PromptTemplate::parse("{{ {project_name} }} {file_path}:{ file_contents }").unwrap();
        assert_eq!(template.render(&ctx(None)), "{ demo } src/main.py:print('hi')\n");
    }

    #[test]
    fn test_placeholder_values_are_not_reinterpreted() {
        let template = PromptTemplate::parse("{file_contents}").unwrap();
        let mut context = ctx(None);
        context.file_contents = "fn main() { let x = {tree}; }";
        assert_eq!(template.render(&context), "fn main() { let x = {tree}; }");
    }

    #[test]
    fn test_unknown_placeholder_rejected() {
        let err = PromptTemplate::parse("Document {file_name} in {project_path}").unwrap_err();
        assert_eq!(err, TemplateError::UnknownPlaceholder("file_name".to_string()));
    }

    #[test]
    fn test_unbalanced_brace_rejected() {
        assert_eq!(PromptTemplate::parse("abc { def").unwrap_err(), TemplateError::UnbalancedBrace(5));
        assert!(matches!(PromptTemplate::parse("x }").unwrap_err(), TemplateError::UnbalancedBrace(_)));
    }

    #[test]
    fn test_blank_custom_template_falls_back_to_default() {
        assert_eq!(PromptTemplate::resolve(Some("   ")).unwrap(), PromptTemplate::default());
    }
}
