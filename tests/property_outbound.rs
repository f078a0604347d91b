use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

use taskwire::adapters::chat::RecordingChatSender;
use taskwire::services::{split_message, OutboundBuffer, OutboundConfig};

proptest! {
    /// Property: splitting is lossless and every piece fits
    #[test]
    fn prop_split_message_is_lossless(
        text in "(\\PC{0,30}\n?){0,40}",
        max_len in 4usize..200,
    ) {
        let pieces = split_message(&text, max_len);
        prop_assert_eq!(pieces.concat(), text.clone());
        for piece in &pieces {
            prop_assert!(piece.len() <= max_len, "piece of {} bytes over {}", piece.len(), max_len);
            prop_assert!(!piece.is_empty());
        }
    }

    /// Property: a piece ends at a newline whenever one was available
    #[test]
    fn prop_split_prefers_newlines(
        lines in prop::collection::vec("[a-z]{1,10}", 1..30),
        max_len in 12usize..80,
    ) {
        let text: String = lines.iter().map(|l| format!("{l}\n")).collect();
        let pieces = split_message(&text, max_len);
        // Lines are shorter than the limit, so no line is ever cut.
        for piece in &pieces {
            prop_assert!(piece.ends_with('\n'), "{:?}", piece);
        }
    }

    /// Property: outbound completeness
    ///
    /// Whatever pieces a session streams, the messages that reach the topic
    /// concatenate to exactly the streamed text and each fits the limit.
    #[test]
    fn prop_outbound_buffer_is_complete(
        pieces in prop::collection::vec("[a-zA-Z0-9 ✓\n]{0,50}", 0..40),
        max_len in 8usize..120,
    ) {
        let sent = tokio_test::block_on(async {
            let recorder = Arc::new(RecordingChatSender::new());
            let config = OutboundConfig {
                flush_interval: Duration::from_millis(5),
                max_message_len: max_len,
            };
            let (buffer, handle) = OutboundBuffer::spawn("prop", recorder.clone(), config);
            for piece in &pieces {
                buffer.push(piece.clone());
            }
            drop(buffer);
            handle.await.unwrap();
            recorder.texts_for("prop").await
        });

        prop_assert_eq!(sent.concat(), pieces.concat());
        for message in &sent {
            prop_assert!(message.len() <= max_len);
        }
    }
}
