//! Outbound chat delivery adapters.

pub mod console;
pub mod recording;
pub mod webhook;

pub use console::ConsoleChatSender;
pub use recording::{RecordedMessage, RecordingChatSender};
pub use webhook::WebhookChatSender;
