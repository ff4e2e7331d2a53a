//! Send/fetch wrapper that keeps message content encoded at rest.

use async_trait::async_trait;
use courier_proto::{ApiEnvelope, ConversationId, Message, MessageDraft, MessageGateway};
use tracing::trace;

use crate::codec::CipherCodec;

/// Wraps a [`MessageGateway`] so that content leaving this process is always
/// ciphertext-shaped and content coming back is decoded for display.
pub struct SealedGateway<G> {
    inner: G,
    codec: CipherCodec,
}

impl<G: MessageGateway> SealedGateway<G> {
    /// Wraps `inner` using `codec`.
    pub fn new(inner: G, codec: CipherCodec) -> Self {
        Self { inner, codec }
    }

    /// The wrapped gateway.
    pub fn inner(&self) -> &G {
        &self.inner
    }

    fn open(&self, mut message: Message) -> Message {
        if !message.deleted {
            message.content = self
                .codec
                .process_for_display(&message.content, &message.conversation_id);
        }
        message
    }
}

#[async_trait]
impl<G: MessageGateway> MessageGateway for SealedGateway<G> {
    async fn send_message(&self, mut draft: MessageDraft) -> ApiEnvelope<Message> {
        draft.content = self
            .codec
            .process_for_storage(&draft.content, &draft.conversation_id);
        trace!(conversation = %draft.conversation_id, "sealed outgoing content");
        let reply = self.inner.send_message(draft).await;
        reply.map(|m| self.open(m))
    }

    async fn fetch_messages(&self, conversation: &ConversationId) -> ApiEnvelope<Vec<Message>> {
        let reply = self.inner.fetch_messages(conversation).await;
        reply.map(|messages| messages.into_iter().map(|m| self.open(m)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use courier_proto::SenderKind;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingGateway {
        stored: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl MessageGateway for RecordingGateway {
        async fn send_message(&self, draft: MessageDraft) -> ApiEnvelope<Message> {
            let mut stored = self.stored.lock().unwrap();
            let message = Message {
                id: format!("m{}", stored.len() + 1).into(),
                conversation_id: draft.conversation_id,
                sender_id: draft.sender_id,
                sender_kind: draft.sender_kind,
                content: draft.content,
                created_at: Utc::now(),
                read: false,
                deleted: false,
            };
            stored.push(message.clone());
            ApiEnvelope::ok(message)
        }

        async fn fetch_messages(&self, conversation: &ConversationId) -> ApiEnvelope<Vec<Message>> {
            let stored = self.stored.lock().unwrap();
            ApiEnvelope::ok(
                stored
                    .iter()
                    .filter(|m| &m.conversation_id == conversation)
                    .cloned()
                    .collect(),
            )
        }
    }

    fn draft(content: &str) -> MessageDraft {
        MessageDraft {
            conversation_id: "c1".into(),
            sender_id: "op".to_string(),
            sender_kind: SenderKind::Operator,
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn test_send_stores_ciphertext_and_returns_plaintext() {
        let gw = SealedGateway::new(RecordingGateway::default(), CipherCodec::new("s"));
        let sent = gw.send_message(draft("bom dia, tudo certo?")).await;
        assert_eq!(sent.into_result().unwrap().content, "bom dia, tudo certo?");

        let stored = gw.inner().stored.lock().unwrap()[0].content.clone();
        assert_ne!(stored, "bom dia, tudo certo?");
        assert!(crate::is_ciphertext_likely(&stored));
    }

    #[tokio::test]
    async fn test_fetch_decodes_every_message() {
        let gw = SealedGateway::new(RecordingGateway::default(), CipherCodec::new("s"));
        gw.send_message(draft("oi")).await;
        gw.send_message(draft("como vai você?")).await;

        let fetched = gw.fetch_messages(&"c1".into()).await.into_result().unwrap();
        let texts: Vec<_> = fetched.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, vec!["oi", "como vai você?"]);
    }

    #[tokio::test]
    async fn test_already_encoded_content_is_not_double_encoded() {
        let codec = CipherCodec::new("s");
        let pre = codec.encode("texto já codificado antes", &"c1".into());
        let gw = SealedGateway::new(RecordingGateway::default(), codec);
        gw.send_message(draft(&pre)).await;
        assert_eq!(gw.inner().stored.lock().unwrap()[0].content, pre);
    }
}
