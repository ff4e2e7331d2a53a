#![warn(missing_docs)]

//! Courier cipher subsystem: per-conversation payload codec and the sealed send/fetch path
//!
//! Send path:  plaintext → process_for_storage → data service
//! Fetch path: data service → process_for_display → plaintext

pub mod codec;
pub mod error;
pub mod gateway;

pub use codec::{is_ciphertext_likely, CipherCodec, ConversationKey, CIPHERTEXT_MIN_LEN};
pub use error::CipherError;
pub use gateway::SealedGateway;
