mod args;
mod manager;

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

pub use args::{Command, UserCommand, ARGS};
pub use manager::ConfigManager;

/// 配置目录：优先使用命令行/环境变量指定的目录
pub static CONFIG_DIR: Lazy<PathBuf> = Lazy::new(|| {
    ARGS.config_dir.clone().unwrap_or_else(|| {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chat-relay")
    })
});

/// 全局配置，支持热重载
static CONFIG: Lazy<ArcSwap<Config>> = Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// 获取当前生效的配置快照
pub fn current() -> Arc<Config> {
    CONFIG.load_full()
}

/// 替换当前生效的配置
pub fn reload(config: Config) {
    CONFIG.store(Arc::new(config));
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct Config {
    /// 监听地址
    pub bind_address: String,
    /// 面向用户的提示语言
    pub language: Language,
    /// 补全服务配置
    pub llm: LlmConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:12345".to_string(),
            language: Language::default(),
            llm: LlmConfig::default(),
        }
    }
}

impl Config {
    /// 检查配置，返回发现的问题（不阻止启动）
    pub fn check(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.bind_address.parse::<std::net::SocketAddr>().is_err() {
            problems.push(format!("监听地址 {} 无效", self.bind_address));
        }
        if self.llm.model.trim().is_empty() {
            problems.push("未配置模型名称".to_string());
        }
        if self.llm.base_url.trim().is_empty() {
            problems.push("未配置补全服务地址".to_string());
        }
        if self.llm.provider == ProviderKind::OpenAi
            && self.llm.api_key.as_deref().map_or(true, |key| key.trim().is_empty())
        {
            problems.push("OpenAI 兼容接口需要配置 api_key".to_string());
        }
        problems
    }

    /// 用于 API 输出的副本，隐藏密钥
    pub fn masked(&self) -> Self {
        let mut config = self.clone();
        if let Some(key) = config.llm.api_key.as_mut() {
            *key = mask_secret(key);
        }
        config
    }
}

/// 客户端回传 masked() 的结果时，llm 中省略或仍为遮盖值的 api_key 还原为当前密钥
pub fn restore_masked_secret(current: &Config, key: &str, value: &mut Value) {
    if key != "llm" {
        return;
    }
    let (Some(object), Some(secret)) = (value.as_object_mut(), current.llm.api_key.as_deref()) else {
        return;
    };
    let keep = match object.get("api_key") {
        None | Some(Value::Null) => true,
        Some(Value::String(incoming)) => *incoming == mask_secret(secret),
        Some(_) => false,
    };
    if keep {
        object.insert("api_key".to_string(), Value::String(secret.to_string()));
    }
}

fn mask_secret(secret: &str) -> String {
    let visible: String = secret.chars().take(4).collect();
    if secret.chars().count() <= 4 {
        "****".to_string()
    } else {
        format!("{}****", visible)
    }
}

/// 面向用户的提示语言
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    En,
    Zh,
}

impl Language {
    /// 本轮回复失败时展示给用户的通用错误
    pub fn reply_error_message(&self) -> &'static str {
        match self {
            Language::En => "Sorry, there was an error with your message. Please try again.",
            Language::Zh => "抱歉，处理您的消息时出错，请重试。",
        }
    }
}

/// 补全服务类型
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum ProviderKind {
    /// OpenAI 兼容的 chat/completions 接口（OpenAI / DeepSeek / 其它兼容服务）
    #[default]
    #[serde(rename = "openai", alias = "deepseek", alias = "custom")]
    OpenAi,
    /// 本地 Ollama 的 /api/chat 接口
    #[serde(rename = "ollama")]
    Ollama,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: ProviderKind,
    /// 接口 base url，例如：
    /// - https://api.openai.com/v1
    /// - https://api.deepseek.com/v1
    /// - http://127.0.0.1:11434
    pub base_url: String,
    pub api_key: Option<String>,
    /// 模型名，例如 gpt-4o-mini / deepseek-chat / llama3
    pub model: String,
    /// 流式响应中两个数据块之间允许的最长间隔（秒）
    pub timeout_seconds: u64,
    pub temperature: Option<f32>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::OpenAi,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            timeout_seconds: 60,
            temperature: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.language, Language::En);
        assert_eq!(config.llm.provider, ProviderKind::OpenAi);
        assert_eq!(config.llm.timeout_seconds, 60);
        // 默认没有 api_key
        assert_eq!(config.check().len(), 1);
    }

    #[test]
    fn test_provider_aliases() {
        let llm: LlmConfig = serde_json::from_str(r#"{"provider":"deepseek","model":"deepseek-chat"}"#).unwrap();
        assert_eq!(llm.provider, ProviderKind::OpenAi);
        assert_eq!(llm.model, "deepseek-chat");
        assert_eq!(llm.base_url, "https://api.openai.com/v1");

        let llm: LlmConfig = serde_json::from_str(r#"{"provider":"ollama"}"#).unwrap();
        assert_eq!(llm.provider, ProviderKind::Ollama);
    }

    #[test]
    fn test_masked_hides_api_key() {
        let mut config = Config::default();
        config.llm.api_key = Some("sk-1234567890".to_string());
        assert_eq!(config.masked().llm.api_key.as_deref(), Some("sk-1****"));

        config.llm.api_key = Some("abc".to_string());
        assert_eq!(config.masked().llm.api_key.as_deref(), Some("****"));
    }

    #[test]
    fn test_restore_masked_secret() {
        let mut config = Config::default();
        config.llm.api_key = Some("sk-REALSECRETKEY".to_string());

        let mut echoed = serde_json::to_value(&config.masked().llm).unwrap();
        echoed["model"] = Value::from("gpt-4o");
        restore_masked_secret(&config, "llm", &mut echoed);
        assert_eq!(echoed["api_key"], "sk-REALSECRETKEY");
        assert_eq!(echoed["model"], "gpt-4o");

        let mut omitted = serde_json::json!({"model": "gpt-4o"});
        restore_masked_secret(&config, "llm", &mut omitted);
        assert_eq!(omitted["api_key"], "sk-REALSECRETKEY");

        let mut replaced = serde_json::json!({"api_key": "sk-NEWKEY"});
        restore_masked_secret(&config, "llm", &mut replaced);
        assert_eq!(replaced["api_key"], "sk-NEWKEY");

        // 空字符串用于清除密钥
        let mut cleared = serde_json::json!({"api_key": ""});
        restore_masked_secret(&config, "llm", &mut cleared);
        assert_eq!(cleared["api_key"], "");
    }

    #[test]
    fn test_reply_error_message_is_localized() {
        assert!(Language::En.reply_error_message().starts_with("Sorry"));
        assert_ne!(Language::Zh.reply_error_message(), Language::En.reply_error_message());
    }
}
