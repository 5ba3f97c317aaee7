use std::path::PathBuf;

use clap::{Parser, Subcommand};
use once_cell::sync::Lazy;

pub static ARGS: Lazy<Args> = Lazy::new(Args::parse);

#[derive(Parser, Debug)]
#[command(name = "chat-relay", version, about, long_about = None)]
pub struct Args {
    /// 日志过滤规则
    #[arg(short, long, default_value = "None,chat_relay=info", env = "RUST_LOG")]
    pub log_level: String,

    /// 配置与数据库所在目录
    #[arg(short, long, env = "CHAT_RELAY_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// 覆盖配置中的监听地址
    #[arg(short, long, env = "CHAT_RELAY_BIND_ADDRESS")]
    pub bind_address: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// 用户管理
    #[command(subcommand)]
    User(UserCommand),
}

#[derive(Subcommand, Debug)]
pub enum UserCommand {
    /// 创建用户并输出其访问 token
    Add {
        username: String,
        /// 允许该用户读写全局配置
        #[arg(long)]
        admin: bool,
    },
}
