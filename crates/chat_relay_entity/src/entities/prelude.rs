pub use super::config_item::Entity as ConfigItem;
pub use super::conversation::Entity as Conversation;
pub use super::message::Entity as Message;
pub use super::user::Entity as User;
