pub use sea_orm_migration::prelude::*;

mod m20260301_000001_create_user;
mod m20260301_000002_create_conversation;
mod m20260301_000003_create_message;
mod m20260302_000001_create_config_items;
mod m20260303_000001_add_user_is_admin;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20260301_000001_create_user::Migration),
            Box::new(m20260301_000002_create_conversation::Migration),
            Box::new(m20260301_000003_create_message::Migration),
            Box::new(m20260302_000001_create_config_items::Migration),
            Box::new(m20260303_000001_add_user_is_admin::Migration),
        ]
    }
}
