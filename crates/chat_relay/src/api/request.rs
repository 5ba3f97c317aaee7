use serde::Deserialize;
use utoipa::ToSchema;

#[derive(Deserialize, ToSchema)]
pub struct UpdateConfigItemRequest {
    /// 顶层配置项名称，例如 language / llm
    pub key: String,
    pub value: serde_json::Value,
}
