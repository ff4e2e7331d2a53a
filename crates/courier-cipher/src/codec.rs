//! Per-conversation payload codec.
//!
//! Payloads are XORed against a repeating 32-byte key derived from
//! `SHA-256(conversation_id || shared_secret)` and base64-encoded. The codec
//! works on the UTF-8 bytes of the text, never per character, so multi-byte
//! text survives the round trip.
//!
//! This is obfuscation at rest, not confidentiality: every message of a
//! conversation reuses the same keystream. Changing the scheme changes the
//! stored format, so it stays as is until the system owner decides otherwise.

use std::sync::LazyLock;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use courier_proto::ConversationId;
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CipherError, Result};

/// Minimum length for a string to be considered already-encoded.
pub const CIPHERTEXT_MIN_LEN: usize = 16;

static BASE64_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9+/]+={0,2}$").expect("static base64 pattern is valid")
});

/// 256-bit per-conversation key
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ConversationKey(pub [u8; 32]);

impl std::fmt::Debug for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConversationKey([REDACTED])")
    }
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct SharedSecret(Vec<u8>);

/// Stateless encoder/decoder for message payloads.
///
/// The only state is the shared secret mixed into every derived key.
#[derive(Clone)]
pub struct CipherCodec {
    secret: SharedSecret,
}

impl std::fmt::Debug for CipherCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherCodec")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl CipherCodec {
    /// Creates a codec bound to `secret`.
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: SharedSecret(secret.as_ref().to_vec()),
        }
    }

    /// Derives the key for a conversation. Same input, same key.
    pub fn derive_key(&self, conversation: &ConversationId) -> ConversationKey {
        let mut hasher = Sha256::new();
        hasher.update(conversation.as_str().as_bytes());
        hasher.update(&self.secret.0);
        let digest = hasher.finalize();
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        ConversationKey(key)
    }

    /// Encodes plaintext for a conversation. The empty string encodes to itself.
    pub fn encode(&self, plaintext: &str, conversation: &ConversationId) -> String {
        if plaintext.is_empty() {
            return String::new();
        }
        let key = self.derive_key(conversation);
        let mut bytes = plaintext.as_bytes().to_vec();
        xor_in_place(&mut bytes, &key);
        STANDARD.encode(&bytes)
    }

    /// Decodes ciphertext produced by [`encode`](Self::encode) for the same conversation.
    pub fn decode(&self, ciphertext: &str, conversation: &ConversationId) -> Result<String> {
        if ciphertext.is_empty() {
            return Ok(String::new());
        }
        let mut bytes = STANDARD
            .decode(ciphertext)
            .map_err(|e| CipherError::InvalidBase64(e.to_string()))?;
        let key = self.derive_key(conversation);
        xor_in_place(&mut bytes, &key);
        String::from_utf8(bytes).map_err(|_| CipherError::InvalidUtf8)
    }

    /// Encodes `text` unless it already looks like ciphertext.
    ///
    /// Idempotent for inputs of at least [`CIPHERTEXT_MIN_LEN`] characters.
    /// Shorter ciphertext is not recognised and gets encoded again.
    pub fn process_for_storage(&self, text: &str, conversation: &ConversationId) -> String {
        if is_ciphertext_likely(text) {
            return text.to_string();
        }
        self.encode(text, conversation)
    }

    /// Returns displayable text. Always tries to decode first and falls back
    /// to `text` unchanged when that fails. Never errors.
    pub fn process_for_display(&self, text: &str, conversation: &ConversationId) -> String {
        match self.try_display(text, conversation) {
            Ok(plain) => plain,
            Err(e) => {
                debug!(conversation = %conversation, error = %e, "payload not decodable, showing as is");
                text.to_string()
            }
        }
    }

    fn try_display(&self, text: &str, conversation: &ConversationId) -> Result<String> {
        let plain = self.decode(text, conversation)?;
        if plain
            .chars()
            .any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
        {
            return Err(CipherError::Implausible);
        }
        Ok(plain)
    }
}

/// Heuristic: does `text` look like encoder output?
///
/// True only for strings of at least [`CIPHERTEXT_MIN_LEN`] characters drawn
/// from the base64 alphabet (so no spaces and no accented letters). Used to
/// avoid double encoding, never as a security check.
pub fn is_ciphertext_likely(text: &str) -> bool {
    text.chars().count() >= CIPHERTEXT_MIN_LEN && BASE64_SHAPE.is_match(text)
}

fn xor_in_place(bytes: &mut [u8], key: &ConversationKey) {
    for (i, b) in bytes.iter_mut().enumerate() {
        *b ^= key.0[i % key.0.len()];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn codec() -> CipherCodec {
        CipherCodec::new("test-secret")
    }

    fn conv(id: &str) -> ConversationId {
        ConversationId::from(id)
    }

    proptest! {
        #[test]
        fn prop_roundtrip_any_text(text in "\\PC{0,200}", id in "[a-z0-9-]{1,36}") {
            let c = codec();
            let enc = c.encode(&text, &conv(&id));
            prop_assert_eq!(c.decode(&enc, &conv(&id)).unwrap(), text);
        }

        #[test]
        fn prop_roundtrip_short_multibyte(text in "[a-zA-Zàéíóúãõçñüß日本語한국어]{1,5}") {
            let c = codec();
            let enc = c.encode(&text, &conv("c1"));
            prop_assert_eq!(c.decode(&enc, &conv("c1")).unwrap(), text);
        }

        #[test]
        fn prop_storage_is_idempotent_from_threshold(text in "\\PC{16,120}") {
            let c = codec();
            let once = c.process_for_storage(&text, &conv("c1"));
            let twice = c.process_for_storage(&once, &conv("c1"));
            prop_assert_eq!(&once, &twice);
        }
    }

    #[test]
    fn test_oi_roundtrip_and_not_ciphertext() {
        let c = codec();
        let enc = c.encode("oi", &conv("c1"));
        assert_eq!(c.decode(&enc, &conv("c1")).unwrap(), "oi");
        assert!(!is_ciphertext_likely("oi"));
    }

    #[test]
    fn test_empty_string_is_noop() {
        let c = codec();
        assert_eq!(c.encode("", &conv("c1")), "");
        assert_eq!(c.decode("", &conv("c1")).unwrap(), "");
        assert_eq!(c.process_for_display("", &conv("c1")), "");
    }

    #[test]
    fn test_single_multibyte_character() {
        let c = codec();
        for text in ["é", "ç", "日", "🙂"] {
            let enc = c.encode(text, &conv("c1"));
            assert_eq!(c.decode(&enc, &conv("c1")).unwrap(), text);
        }
    }

    #[test]
    fn test_key_is_deterministic_and_per_conversation() {
        let c = codec();
        assert_eq!(c.derive_key(&conv("c1")), c.derive_key(&conv("c1")));
        assert_ne!(c.derive_key(&conv("c1")), c.derive_key(&conv("c2")));
        let other = CipherCodec::new("another-secret");
        assert_ne!(c.derive_key(&conv("c1")), other.derive_key(&conv("c1")));
    }

    #[test]
    fn test_ciphertext_differs_across_conversations() {
        let c = codec();
        let text = "same text in two conversations";
        assert_ne!(c.encode(text, &conv("c1")), c.encode(text, &conv("c2")));
    }

    #[test]
    fn test_decode_rejects_non_base64() {
        let c = codec();
        assert!(matches!(
            c.decode("hello world", &conv("c1")),
            Err(CipherError::InvalidBase64(_))
        ));
    }

    #[test]
    fn test_heuristic_boundaries() {
        assert!(!is_ciphertext_likely(""));
        assert!(!is_ciphertext_likely("QUJDREVGR0hJSkt"));
        assert!(is_ciphertext_likely("QUJDREVGR0hJSktM"));
        assert!(is_ciphertext_likely("QUJDREVGR0hJSktMTQ=="));
        assert!(!is_ciphertext_likely("this has spaces in it"));
        assert!(!is_ciphertext_likely("coraçãoinformaçãoXYZ"));
        assert!(!is_ciphertext_likely("QUJD=REVGR0hJSktM"));
    }

    #[test]
    fn test_long_ciphertext_is_recognised() {
        let c = codec();
        let enc = c.encode("a perfectly ordinary sentence", &conv("c1"));
        assert!(enc.len() >= CIPHERTEXT_MIN_LEN);
        assert!(is_ciphertext_likely(&enc));
        assert_eq!(c.process_for_storage(&enc, &conv("c1")), enc);
    }

    #[test]
    fn test_short_ciphertext_still_displays() {
        // Four-character ciphertext is below the heuristic threshold but
        // display always tries to decode first.
        let c = codec();
        let enc = c.encode("oi", &conv("c1"));
        assert!(!is_ciphertext_likely(&enc));
        assert_eq!(c.process_for_display(&enc, &conv("c1")), "oi");
    }

    #[test]
    fn test_short_storage_is_a_fragile_boundary() {
        // Below the threshold the heuristic cannot tell ciphertext from text,
        // so storing twice encodes twice. Display of the single encoding is exact.
        let c = codec();
        let once = c.process_for_storage("oi", &conv("c1"));
        let twice = c.process_for_storage(&once, &conv("c1"));
        assert_ne!(once, twice);
        assert_eq!(c.process_for_display(&once, &conv("c1")), "oi");
    }

    #[test]
    fn test_display_falls_back_to_plaintext() {
        let c = codec();
        assert_eq!(
            c.process_for_display("olá, tudo bem?", &conv("c1")),
            "olá, tudo bem?"
        );
        assert_eq!(c.process_for_display("oi", &conv("c1")), "oi");
    }

    #[test]
    fn test_display_with_wrong_conversation_never_panics() {
        let c = codec();
        let enc = c.encode("mensagem secreta para c1", &conv("c1"));
        let shown = c.process_for_display(&enc, &conv("c2"));
        assert_ne!(shown, "mensagem secreta para c1");
    }

    #[test]
    fn test_debug_redacts_secret() {
        let c = codec();
        let dbg = format!("{:?} {:?}", c, c.derive_key(&conv("c1")));
        assert!(!dbg.contains("test-secret"));
        assert!(dbg.contains("REDACTED"));
    }
}
