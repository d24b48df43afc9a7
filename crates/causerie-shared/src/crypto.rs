use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::constants::{KDF_CONTEXT_CONVERSATION_KEY, NONCE_SIZE};
use crate::error::CryptoError;
use crate::types::{ConversationId, UserId};

pub type SymmetricKey = [u8; 32];

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// BLAKE3 KDF over the conversation id and the *sorted* participant set.
///
/// Both sides compute the identical key without exchanging secrets; the key
/// is stable for the conversation's lifetime and never persisted.  The
/// scheme's confidentiality rests entirely on the secrecy of the
/// `(conversation_id, participant_ids)` tuple: anyone who learns all the
/// identifiers can recompute the key.  There is no rotation.
pub fn derive_conversation_key(
    conversation_id: ConversationId,
    participants: &[UserId],
) -> SymmetricKey {
    let mut sorted: Vec<UserId> = participants.to_vec();
    sorted.sort();
    sorted.dedup();

    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_CONVERSATION_KEY);
    hasher.update(conversation_id.0.as_bytes());
    for user in &sorted {
        hasher.update(user.0.as_bytes());
    }
    let hash = hasher.finalize();
    let mut key = [0u8; 32];
    key.copy_from_slice(&hash.as_bytes()[..32]);
    key
}

// Returns nonce || ciphertext (24 bytes nonce prepended)
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce_bytes = generate_nonce();
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

pub fn decrypt(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Encrypt a UTF-8 string and base64-encode the envelope for the row store,
/// which carries ciphertext as text.
pub fn seal_text(key: &SymmetricKey, plaintext: &str) -> Result<String, CryptoError> {
    let envelope = encrypt(key, plaintext.as_bytes())?;
    Ok(BASE64.encode(envelope))
}

/// Decode and decrypt a base64 envelope produced by [`seal_text`].
///
/// Any malformed input (bad base64, truncated envelope, wrong key, invalid
/// UTF-8) comes back as [`CryptoError::DecryptionFailed`], never a panic.
pub fn open_text(key: &SymmetricKey, sealed: &str) -> Result<String, CryptoError> {
    let envelope = BASE64
        .decode(sealed)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    let plaintext = decrypt(key, &envelope)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> SymmetricKey {
        derive_conversation_key(ConversationId::new(), &[UserId::new(), UserId::new()])
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = test_key();
        let plaintext = b"On cause, on cause...";

        let encrypted = encrypt(&key, plaintext).unwrap();
        let decrypted = decrypt(&key, &encrypted).unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = test_key();
        let key2 = test_key();
        let plaintext = b"Secret message";

        let encrypted = encrypt(&key1, plaintext).unwrap();
        assert!(decrypt(&key2, &encrypted).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = test_key();
        let plaintext = b"Important data";

        let mut encrypted = encrypt(&key, plaintext).unwrap();
        let len = encrypted.len();
        encrypted[len - 1] ^= 0xFF;

        assert!(decrypt(&key, &encrypted).is_err());
    }

    #[test]
    fn test_empty_data_fails() {
        let key = test_key();
        assert!(decrypt(&key, &[]).is_err());
    }

    #[test]
    fn test_key_symmetric_in_participant_order() {
        let conv = ConversationId::new();
        let a = UserId::new();
        let b = UserId::new();

        let key_ab = derive_conversation_key(conv, &[a, b]);
        let key_ba = derive_conversation_key(conv, &[b, a]);

        assert_eq!(key_ab, key_ba);
    }

    #[test]
    fn test_key_deterministic() {
        let conv = ConversationId::new();
        let a = UserId::new();
        let b = UserId::new();

        assert_eq!(
            derive_conversation_key(conv, &[a, b]),
            derive_conversation_key(conv, &[a, b])
        );
    }

    #[test]
    fn test_different_conversations_different_keys() {
        let a = UserId::new();
        let b = UserId::new();

        let key1 = derive_conversation_key(ConversationId::new(), &[a, b]);
        let key2 = derive_conversation_key(ConversationId::new(), &[a, b]);

        assert_ne!(key1, key2);
    }

    #[test]
    fn test_group_key_ignores_ordering() {
        let conv = ConversationId::new();
        let a = UserId::new();
        let b = UserId::new();
        let c = UserId::new();

        assert_eq!(
            derive_conversation_key(conv, &[a, b, c]),
            derive_conversation_key(conv, &[c, a, b])
        );
    }

    #[test]
    fn test_encryption_not_deterministic() {
        let key = test_key();
        let first = encrypt(&key, b"same plaintext").unwrap();
        let second = encrypt(&key, b"same plaintext").unwrap();

        // fresh nonce per call
        assert_ne!(first, second);
    }

    #[test]
    fn test_seal_open_text_roundtrip() {
        let key = test_key();
        let sealed = seal_text(&key, "héhé, ça va ?").unwrap();
        assert_eq!(open_text(&key, &sealed).unwrap(), "héhé, ça va ?");
    }

    #[test]
    fn test_open_text_rejects_garbage() {
        let key = test_key();
        assert!(open_text(&key, "not-base64!!!").is_err());
        assert!(open_text(&key, "AAAA").is_err());
    }
}
