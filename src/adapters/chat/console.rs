//! Chat sender that prints to stdout, for local operation.

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::domain::errors::DomainResult;
use crate::domain::ports::ChatSender;

/// Writes each message as `[topic] text`.
pub struct ConsoleChatSender {
    stdout: Mutex<tokio::io::Stdout>,
}

impl ConsoleChatSender {
    pub fn new() -> Self {
        Self {
            stdout: Mutex::new(tokio::io::stdout()),
        }
    }
}

impl Default for ConsoleChatSender {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn format_line(topic_id: &str, text: &str) -> String {
    let mut line = format!("[{topic_id}] {}", text.trim_end_matches('\n'));
    line.push('\n');
    line
}

#[async_trait]
impl ChatSender for ConsoleChatSender {
    async fn send(&self, topic_id: &str, text: &str) -> DomainResult<()> {
        let line = format_line(topic_id, text);
        let mut stdout = self.stdout.lock().await;
        stdout.write_all(line.as_bytes()).await?;
        stdout.flush().await?;
        Ok(())
    }
}
