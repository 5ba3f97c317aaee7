//! 推送给浏览器的 HTML 片段
//!
//! 片段遵循 htmx 的 out-of-band swap 约定：带 `hx-swap-oob` 的元素按 id
//! 更新页面上已有的元素，而不是追加到主响应中。

use anyhow::{anyhow, Result};
use handlebars::Handlebars;
use pulldown_cmark::{html, Event, Options, Parser};
use rust_embed::RustEmbed;
use serde_json::json;

#[derive(RustEmbed)]
#[folder = "templates/"]
struct Templates;

const USER_MESSAGE: &str = "user_message";
const SYSTEM_MESSAGE: &str = "system_message";
const FINAL_SYSTEM_MESSAGE: &str = "final_system_message";

pub struct Renderer {
    registry: Handlebars<'static>,
}

impl Renderer {
    pub fn new() -> Result<Self> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        for name in [USER_MESSAGE, SYSTEM_MESSAGE, FINAL_SYSTEM_MESSAGE] {
            let file = Templates::get(&format!("{}.hbs", name)).ok_or_else(|| anyhow!("缺少模板 {}", name))?;
            let source = std::str::from_utf8(&file.data)?;
            registry.register_template_string(name, source)?;
        }
        Ok(Self { registry })
    }

    /// 用户消息回显，内容会被转义
    pub fn user_message(&self, message_text: &str) -> Result<String> {
        Ok(self
            .registry
            .render(USER_MESSAGE, &json!({ "message_text": message_text }))?)
    }

    /// 等待流式输出的空容器
    pub fn system_message(&self, contents_div_id: &str) -> Result<String> {
        Ok(self
            .registry
            .render(SYSTEM_MESSAGE, &json!({ "contents_div_id": contents_div_id }))?)
    }

    /// 用完整渲染后的内容替换容器
    pub fn final_system_message(&self, contents_div_id: &str, message: &str) -> Result<String> {
        Ok(self.registry.render(
            FINAL_SYSTEM_MESSAGE,
            &json!({
                "contents_div_id": contents_div_id,
                "message_html": markdown_to_html(message),
            }),
        )?)
    }
}

pub fn contents_div_id(message_id: i32) -> String {
    format!("message-response-{}", message_id)
}

/// 流式输出阶段只做最基本的格式化：转义并把换行换成 <br>
pub fn format_token(token: &str) -> String {
    html_escape::encode_text(token).replace('\n', "<br>")
}

/// 把一个 token 追加到容器末尾
pub fn token_fragment(contents_div_id: &str, token: &str) -> String {
    format!(
        r#"<div hx-swap-oob="beforeend:#{}">{}</div>"#,
        contents_div_id,
        format_token(token)
    )
}

/// Markdown 转 HTML，模型输出中的原始 HTML 按文本转义
pub fn markdown_to_html(text: &str) -> String {
    let options = Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH | Options::ENABLE_TASKLISTS;
    let parser = Parser::new_ext(text, options).map(|event| match event {
        Event::Html(raw) | Event::InlineHtml(raw) => Event::Text(raw),
        other => other,
    });
    let mut output = String::with_capacity(text.len() * 3 / 2);
    html::push_html(&mut output, parser);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_fragment_targets_container() {
        assert_eq!(
            token_fragment("message-response-7", "Hi\nthere"),
            r#"<div hx-swap-oob="beforeend:#message-response-7">Hi<br>there</div>"#
        );
    }

    #[test]
    fn test_format_token_escapes_markup() {
        assert_eq!(format_token("<b>&"), "&lt;b&gt;&amp;");
    }

    #[test]
    fn test_markdown_escapes_raw_html() {
        let html = markdown_to_html("**bold** <script>alert(1)</script>");
        assert!(html.contains("<strong>bold</strong>"));
        assert!(!html.contains("<script>"));
        assert!(html.contains("&lt;script&gt;"));
    }

    #[test]
    fn test_templates_render() {
        let renderer = Renderer::new().unwrap();

        let echo = renderer.user_message("<i>hello</i>").unwrap();
        assert!(echo.contains("&lt;i&gt;hello&lt;/i&gt;"));
        assert!(echo.contains(r#"hx-swap-oob="beforeend""#));

        let placeholder = renderer.system_message("message-response-3").unwrap();
        assert!(placeholder.contains(r#"id="message-response-3""#));

        let done = renderer.final_system_message("message-response-3", "# Title").unwrap();
        assert!(done.contains(r#"id="message-response-3""#));
        assert!(done.contains(r#"hx-swap-oob="true""#));
        assert!(done.contains("<h1>Title</h1>"));
    }
}
