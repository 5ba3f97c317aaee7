//! 会话命名后台任务
//!
//! 新会话的第一条消息会提交一个命名任务，由独立的 worker 处理。
//! 任务与连接之间没有共享状态，结果只通过写回会话名称体现；失败只记录日志，不重试。

use anyhow::Result;
use sea_orm::DatabaseConnection;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::completion::{ChatCompletion, ChatMessage, CompletionProvider};
use crate::{config, store};

/// 短于该字符数的消息直接作为会话名称
pub const NAME_FROM_MESSAGE_THRESHOLD: usize = 20;
/// 会话名称的最大字符数
pub const MAX_NAME_CHARS: usize = 100;

const SYSTEM_NAMING_PROMPT: &str = "\
You are SummaryBot. When I give you an input, your job is to summarize the intent of that input.
Provide only the summary of the input and nothing else.
Summaries should be less than 100 characters long.";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamingJob {
    pub conversation_id: i32,
    pub message: String,
}

/// 命名任务的提交端，可以在连接之间共享
#[derive(Clone)]
pub struct NamingQueue {
    sender: mpsc::UnboundedSender<NamingJob>,
}

impl NamingQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<NamingJob>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// 提交后立即返回，不等待命名完成
    pub fn submit(&self, job: NamingJob) {
        let conversation_id = job.conversation_id;
        if self.sender.send(job).is_err() {
            warn!("命名任务队列已关闭，会话 {} 将保留默认名称", conversation_id);
        }
    }
}

fn summary_messages(message: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(SYSTEM_NAMING_PROMPT),
        ChatMessage::user(format!("Summarize the following text: '{}'", message)),
    ]
}

/// 截取前 MAX_NAME_CHARS 个字符并去掉首尾空白
fn clip_name(summary: &str) -> String {
    summary.chars().take(MAX_NAME_CHARS).collect::<String>().trim().to_string()
}

/// 为会话生成并保存名称
pub async fn set_conversation_name<P: ChatCompletion>(
    db: &DatabaseConnection,
    provider: &P,
    job: &NamingJob,
) -> Result<()> {
    if job.message.is_empty() {
        return Ok(());
    }

    let name = if job.message.chars().count() < NAME_FROM_MESSAGE_THRESHOLD {
        // 短消息直接作为名称，摘要没有意义
        job.message.clone()
    } else {
        let summary = provider.complete(&summary_messages(&job.message)).await?;
        let name = clip_name(&summary);
        if name.is_empty() {
            warn!("会话 {} 的摘要为空，保留默认名称", job.conversation_id);
            return Ok(());
        }
        name
    };

    store::set_conversation_name(db, job.conversation_id, &name).await?;
    debug!("会话 {} 命名为 {}", job.conversation_id, name);
    Ok(())
}

/// 命名 worker，队列关闭后退出
pub async fn run_naming_worker(db: DatabaseConnection, mut receiver: mpsc::UnboundedReceiver<NamingJob>) {
    info!("会话命名任务已启动");
    while let Some(job) = receiver.recv().await {
        let db = db.clone();
        // 每个任务单独运行，单个任务出错不影响后续任务
        tokio::spawn(async move {
            let provider = match CompletionProvider::from_config(&config::current().llm) {
                Ok(provider) => provider,
                Err(e) => {
                    error!("创建补全客户端失败，会话 {} 命名跳过: {}", job.conversation_id, e);
                    return;
                }
            };
            if let Err(e) = set_conversation_name(&db, &provider, &job).await {
                error!("会话 {} 命名失败: {:#}", job.conversation_id, e);
            }
        });
    }
    info!("会话命名任务已退出");
}
