//! Per-topic outbound message batching.
//!
//! Assistant text arrives in many small pieces. Each topic gets one flusher
//! task that accumulates text and sends it either when the flush interval
//! elapses or when the buffer reaches the maximum message size. Splits prefer
//! line boundaries and never cut a UTF-8 character.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::models::{RouterConfig, TopicId};
use crate::domain::ports::ChatSender;

/// Batching limits for one topic.
#[derive(Debug, Clone, Copy)]
pub struct OutboundConfig {
    pub flush_interval: Duration,
    pub max_message_len: usize,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(1500),
            max_message_len: 4000,
        }
    }
}

impl From<&RouterConfig> for OutboundConfig {
    fn from(config: &RouterConfig) -> Self {
        Self {
            flush_interval: config.flush_interval(),
            max_message_len: config.max_message_len,
        }
    }
}

enum Command {
    Push(String),
    Flush(oneshot::Sender<()>),
}

/// Handle to a topic's flusher task. Dropping every handle flushes and stops it.
#[derive(Clone)]
pub struct OutboundBuffer {
    topic_id: TopicId,
    tx: mpsc::UnboundedSender<Command>,
}

impl OutboundBuffer {
    /// Spawn the flusher for `topic_id`.
    pub fn spawn(
        topic_id: impl Into<TopicId>,
        sender: Arc<dyn ChatSender>,
        config: OutboundConfig,
    ) -> (Self, JoinHandle<()>) {
        let topic_id = topic_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_flusher(topic_id.clone(), sender, config, rx));
        (Self { topic_id, tx }, handle)
    }

    pub fn topic_id(&self) -> &str {
        &self.topic_id
    }

    /// Queue text for delivery. Returns false once the flusher has stopped.
    pub fn push(&self, text: impl Into<String>) -> bool {
        let text = text.into();
        if text.is_empty() {
            return true;
        }
        self.tx.send(Command::Push(text)).is_ok()
    }

    /// Send everything buffered so far and wait until it has been handed to the sender.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

async fn run_flusher(
    topic_id: TopicId,
    sender: Arc<dyn ChatSender>,
    config: OutboundConfig,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    let max_len = config.max_message_len.max(4);
    let mut buffer = String::new();
    let mut deadline: Option<Instant> = None;

    loop {
        let command = match deadline {
            Some(at) => tokio::select! {
                command = rx.recv() => command,
                () = tokio::time::sleep_until(at) => {
                    send_all(&topic_id, sender.as_ref(), std::mem::take(&mut buffer), max_len).await;
                    deadline = None;
                    continue;
                }
            },
            None => rx.recv().await,
        };

        match command {
            Some(Command::Push(text)) => {
                buffer.push_str(&text);
                if buffer.len() >= max_len {
                    // Send the full pieces now; keep the tail batching.
                    let mut pieces = split_message(&buffer, max_len);
                    let tail = if buffer.len() > max_len { pieces.pop() } else { None };
                    for piece in pieces {
                        send_one(&topic_id, sender.as_ref(), &piece).await;
                    }
                    buffer = tail.unwrap_or_default();
                    deadline = (!buffer.is_empty()).then(|| Instant::now() + config.flush_interval);
                } else if deadline.is_none() {
                    deadline = Some(Instant::now() + config.flush_interval);
                }
            }
            Some(Command::Flush(ack)) => {
                send_all(&topic_id, sender.as_ref(), std::mem::take(&mut buffer), max_len).await;
                deadline = None;
                let _ = ack.send(());
            }
            None => {
                send_all(&topic_id, sender.as_ref(), std::mem::take(&mut buffer), max_len).await;
                debug!(topic_id = %topic_id, "outbound flusher stopped");
                return;
            }
        }
    }
}

async fn send_all(topic_id: &str, sender: &dyn ChatSender, text: String, max_len: usize) {
    if text.is_empty() {
        return;
    }
    for piece in split_message(&text, max_len) {
        send_one(topic_id, sender, &piece).await;
    }
}

async fn send_one(topic_id: &str, sender: &dyn ChatSender, text: &str) {
    if let Err(e) = sender.send(topic_id, text).await {
        warn!(topic_id = %topic_id, error = %e, chars = text.chars().count(), "outbound message not delivered");
    }
}

/// Split `text` into pieces of at most `max_len` bytes.
///
/// Prefers cutting just after the last newline that fits. Concatenating the
/// pieces always reproduces `text` exactly.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(4);
    let mut pieces = Vec::new();
    let mut rest = text;

    while rest.len() > max_len {
        let mut cut = max_len;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if let Some(newline) = rest[..cut].rfind('\n') {
            if newline > 0 {
                cut = newline + 1;
            }
        }
        let (head, tail) = rest.split_at(cut);
        pieces.push(head.to_string());
        rest = tail;
    }

    if !rest.is_empty() {
        pieces.push(rest.to_string());
    }
    pieces
}
