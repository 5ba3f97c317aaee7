pub mod prelude;

pub mod config_item;
pub mod conversation;
pub mod message;
pub mod user;
