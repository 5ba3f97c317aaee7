use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use serde_json::{Map, Value};
use tracing::{debug, error, info};

use crate::config::{restore_masked_secret, Config};
use chat_relay_entity::entities::{config_item, prelude::ConfigItem};

/// 配置管理器，负责配置的数据库存储
#[derive(Clone)]
pub struct ConfigManager {
    db: DatabaseConnection,
}

impl ConfigManager {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// 从数据库加载配置，首次启动时写入默认配置
    pub async fn load_or_init(&self) -> Result<Config> {
        let items = ConfigItem::find().all(&self.db).await?;
        if items.is_empty() {
            info!("数据库中没有配置项，写入默认配置");
            let config = Config::default();
            self.save_config(&config).await?;
            return Ok(config);
        }

        let mut config_map: HashMap<String, Value> = HashMap::new();
        for item in items {
            let value: Value =
                serde_json::from_str(&item.value_json).with_context(|| format!("解析配置项 {} 失败", item.key_name))?;
            config_map.insert(item.key_name, value);
        }
        let config = Self::build_config_from_map(config_map)?;
        debug!("从数据库加载配置成功");
        Ok(config)
    }

    /// 从配置映射构建 Config 对象，缺失的键使用默认值
    fn build_config_from_map(config_map: HashMap<String, Value>) -> Result<Config> {
        let config_json = Value::Object(config_map.into_iter().collect::<Map<String, Value>>());
        serde_json::from_value(config_json).map_err(|e| {
            error!("配置反序列化失败: {}", e);
            anyhow!("从数据库数据构建配置对象失败: {}", e)
        })
    }

    /// 将配置保存到数据库（按顶级键拆分存储）
    pub async fn save_config(&self, config: &Config) -> Result<()> {
        let config_map = Self::flatten_config_json(serde_json::to_value(config)?)?;
        for (key, value) in config_map {
            self.upsert_item(&key, &value).await?;
        }
        info!("配置已保存到数据库");
        Ok(())
    }

    /// 更新单个配置项，先与当前配置合并校验，成功后返回新的配置
    pub async fn update_config_item(&self, current: &Config, key: &str, mut value: Value) -> Result<Config> {
        let mut config_map = Self::flatten_config_json(serde_json::to_value(current)?)?;
        if !config_map.contains_key(key) {
            return Err(anyhow!("未知的配置项: {}", key));
        }
        restore_masked_secret(current, key, &mut value);
        config_map.insert(key.to_string(), value.clone());
        let updated = Self::build_config_from_map(config_map)?;

        self.upsert_item(key, &value).await?;
        debug!("配置项 {} 已更新", key);
        Ok(updated)
    }

    async fn upsert_item(&self, key: &str, value: &Value) -> Result<()> {
        let value_json = serde_json::to_string(value)?;
        match ConfigItem::find_by_id(key.to_string()).one(&self.db).await? {
            Some(existing) => {
                let mut active_model: config_item::ActiveModel = existing.into();
                active_model.value_json = Set(value_json);
                active_model.updated_at = Set(Utc::now());
                active_model.update(&self.db).await?;
            }
            None => {
                config_item::ActiveModel {
                    key_name: Set(key.to_string()),
                    value_json: Set(value_json),
                    updated_at: Set(Utc::now()),
                }
                .insert(&self.db)
                .await?;
            }
        }
        Ok(())
    }

    /// 扁平化配置 JSON 为键值对，复杂对象整体存储
    fn flatten_config_json(config_json: Value) -> Result<HashMap<String, Value>> {
        match config_json {
            Value::Object(map) => Ok(map.into_iter().collect()),
            _ => Err(anyhow!("配置必须是JSON对象")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Language, ProviderKind};
    use crate::database::setup_memory_database;

    async fn stored_item(db: &DatabaseConnection, key: &str) -> Value {
        let item = ConfigItem::find_by_id(key.to_string()).one(db).await.unwrap().unwrap();
        serde_json::from_str(&item.value_json).unwrap()
    }

    #[tokio::test]
    async fn test_load_or_init_seeds_defaults() {
        let db = setup_memory_database().await.unwrap();
        let manager = ConfigManager::new(db.clone());

        let config = manager.load_or_init().await.unwrap();
        assert_eq!(config.bind_address, Config::default().bind_address);
        let stored = stored_item(&db, "llm").await;
        assert_eq!(stored["model"], "gpt-4o-mini");
    }

    #[tokio::test]
    async fn test_update_config_item_roundtrips_through_database() {
        let db = setup_memory_database().await.unwrap();
        let manager = ConfigManager::new(db);
        let config = manager.load_or_init().await.unwrap();

        let updated = manager
            .update_config_item(&config, "language", serde_json::json!("zh"))
            .await
            .unwrap();
        assert_eq!(updated.language, Language::Zh);

        let reloaded = manager.load_or_init().await.unwrap();
        assert_eq!(reloaded.language, Language::Zh);
        assert_eq!(reloaded.llm.provider, ProviderKind::OpenAi);
    }

    #[tokio::test]
    async fn test_masked_api_key_roundtrip_keeps_stored_key() {
        let db = setup_memory_database().await.unwrap();
        let manager = ConfigManager::new(db.clone());
        let mut config = manager.load_or_init().await.unwrap();
        config.llm.api_key = Some("sk-REALSECRETKEY".to_string());
        manager.save_config(&config).await.unwrap();

        // 客户端读取遮盖后的配置，只改模型名后原样提交
        let mut llm = serde_json::to_value(&config.masked().llm).unwrap();
        llm["model"] = Value::from("gpt-4o");
        let updated = manager.update_config_item(&config, "llm", llm).await.unwrap();
        assert_eq!(updated.llm.api_key.as_deref(), Some("sk-REALSECRETKEY"));
        assert_eq!(updated.llm.model, "gpt-4o");
        assert_eq!(stored_item(&db, "llm").await["api_key"], "sk-REALSECRETKEY");

        let updated = manager
            .update_config_item(&updated, "llm", serde_json::json!({"model": "gpt-4o-mini"}))
            .await
            .unwrap();
        assert_eq!(updated.llm.api_key.as_deref(), Some("sk-REALSECRETKEY"));
        assert_eq!(
            manager.load_or_init().await.unwrap().llm.api_key.as_deref(),
            Some("sk-REALSECRETKEY")
        );
    }

    #[tokio::test]
    async fn test_update_config_item_rejects_invalid_values() {
        let db = setup_memory_database().await.unwrap();
        let manager = ConfigManager::new(db);
        let config = manager.load_or_init().await.unwrap();

        assert!(manager
            .update_config_item(&config, "unknown_key", serde_json::json!(1))
            .await
            .is_err());
        assert!(manager
            .update_config_item(&config, "language", serde_json::json!("klingon"))
            .await
            .is_err());
        // 失败的更新不落库
        assert_eq!(manager.load_or_init().await.unwrap().language, Language::En);
    }
}
