//! Conversation key derivation and message encryption.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::PublicKey;
use zeroize::Zeroizing;

use crate::keys::IdentityKeyPair;
use crate::types::{
    Result, SealChatError, CONVERSATION_KEY_INFO_PREFIX, KEY_DERIVATION_SALT, KEY_SIZE,
    MAX_PLAINTEXT_SIZE, NONCE_SIZE, TAG_SIZE,
};

/// A 256-bit symmetric key.
pub type SymmetricKey = [u8; KEY_SIZE];

/// Ciphertext and nonce, both base64, as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedText {
    pub ciphertext: String,
    pub iv: String,
}

/// Derive the conversation key shared by `local` and the owner of `peer_public_key`.
///
/// Both public keys enter the HKDF info in sorted order, so the derivation
/// gives the same key from either side.
pub fn derive_conversation_key(
    local: &IdentityKeyPair,
    peer_public_key: &PublicKey,
) -> Result<Zeroizing<SymmetricKey>> {
    let shared_secret = local.diffie_hellman(peer_public_key);
    if !shared_secret.was_contributory() {
        return Err(SealChatError::KeyDerivationFailed(
            "peer public key is a low-order point".to_string(),
        ));
    }

    let local_bytes = local.public_key().as_bytes();
    let peer_bytes = peer_public_key.as_bytes();
    let (first, second) = if local_bytes <= peer_bytes {
        (local_bytes, peer_bytes)
    } else {
        (peer_bytes, local_bytes)
    };

    let mut info = Vec::with_capacity(CONVERSATION_KEY_INFO_PREFIX.len() + 2 * KEY_SIZE);
    info.extend_from_slice(CONVERSATION_KEY_INFO_PREFIX);
    info.extend_from_slice(first);
    info.extend_from_slice(second);

    let hkdf = Hkdf::<Sha256>::new(Some(KEY_DERIVATION_SALT), shared_secret.as_bytes());
    let mut symmetric_key = Zeroizing::new([0u8; KEY_SIZE]);
    hkdf.expand(&info, &mut symmetric_key[..])
        .map_err(|e| SealChatError::KeyDerivationFailed(format!("HKDF expand failed: {}", e)))?;

    Ok(symmetric_key)
}

/// Encrypt message text under a conversation key with a fresh nonce.
pub fn encrypt_text(key: &SymmetricKey, plaintext: &str) -> Result<EncryptedText> {
    let message_bytes = plaintext.as_bytes();
    if message_bytes.len() > MAX_PLAINTEXT_SIZE {
        return Err(SealChatError::MessageTooLarge(message_bytes.len()));
    }

    let nonce_bytes = generate_nonce();
    let ciphertext = seal(key, &nonce_bytes, message_bytes, &[])?;

    Ok(EncryptedText {
        ciphertext: STANDARD.encode(ciphertext),
        iv: STANDARD.encode(nonce_bytes),
    })
}

/// Decrypt message text produced by [`encrypt_text`].
pub fn decrypt_text(key: &SymmetricKey, ciphertext: &str, iv: &str) -> Result<String> {
    let ciphertext = STANDARD
        .decode(ciphertext)
        .map_err(|e| SealChatError::DecryptionError(format!("Ciphertext is not base64: {}", e)))?;
    if ciphertext.len() < TAG_SIZE {
        return Err(SealChatError::DecryptionError(format!(
            "Ciphertext shorter than the {}-byte tag",
            TAG_SIZE
        )));
    }
    let nonce_bytes = decode_nonce(iv)?;

    let plaintext = open(key, &nonce_bytes, &ciphertext, &[])?;

    String::from_utf8(plaintext)
        .map_err(|e| SealChatError::DecryptionError(format!("Invalid UTF-8: {}", e)))
}

/// Random 96-bit nonce.
pub(crate) fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    nonce_bytes
}

pub(crate) fn decode_nonce(iv: &str) -> Result<[u8; NONCE_SIZE]> {
    let bytes = STANDARD
        .decode(iv)
        .map_err(|e| SealChatError::DecryptionError(format!("IV is not base64: {}", e)))?;
    bytes.as_slice().try_into().map_err(|_| {
        SealChatError::DecryptionError(format!(
            "IV must be {} bytes, got {}",
            NONCE_SIZE,
            bytes.len()
        ))
    })
}

pub(crate) fn seal(
    key: &SymmetricKey,
    nonce_bytes: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| SealChatError::EncryptionError(format!("Cipher init failed: {}", e)))?;
    cipher
        .encrypt(
            Nonce::from_slice(nonce_bytes),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| SealChatError::EncryptionError(format!("Encryption failed: {}", e)))
}

pub(crate) fn open(
    key: &SymmetricKey,
    nonce_bytes: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| SealChatError::DecryptionError(format!("Cipher init failed: {}", e)))?;
    cipher
        .decrypt(
            Nonce::from_slice(nonce_bytes),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|e| SealChatError::DecryptionError(format!("Decryption failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_key() -> Zeroizing<SymmetricKey> {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        derive_conversation_key(&alice, bob.public_key()).unwrap()
    }

    fn flip_bit(encoded: &str, index: usize, bit: u8) -> String {
        let mut bytes = STANDARD.decode(encoded).unwrap();
        bytes[index] ^= 1 << bit;
        STANDARD.encode(bytes)
    }

    #[test]
    fn test_derivation_is_symmetric() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();

        let from_alice = derive_conversation_key(&alice, bob.public_key()).unwrap();
        let from_bob = derive_conversation_key(&bob, alice.public_key()).unwrap();

        assert_eq!(from_alice, from_bob);
    }

    #[test]
    fn test_different_peers_different_keys() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let carol = IdentityKeyPair::generate();

        let with_bob = derive_conversation_key(&alice, bob.public_key()).unwrap();
        let with_carol = derive_conversation_key(&alice, carol.public_key()).unwrap();

        assert_ne!(with_bob, with_carol);
    }

    #[test]
    fn test_low_order_point_rejected() {
        let alice = IdentityKeyPair::generate();
        let identity_point = PublicKey::from([0u8; 32]);
        assert!(matches!(
            derive_conversation_key(&alice, &identity_point),
            Err(SealChatError::KeyDerivationFailed(_))
        ));
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = shared_key();
        let long = "x".repeat(4096);
        for message in ["", "hi", "Café résumé 👋", long.as_str()] {
            let encrypted = encrypt_text(&key, message).unwrap();
            let decrypted = decrypt_text(&key, &encrypted.ciphertext, &encrypted.iv).unwrap();
            assert_eq!(decrypted, message);
        }
    }

    #[test]
    fn test_fresh_iv_per_call() {
        let key = shared_key();
        let first = encrypt_text(&key, "same").unwrap();
        let second = encrypt_text(&key, "same").unwrap();
        assert_ne!(first.iv, second.iv);
        assert_ne!(first.ciphertext, second.ciphertext);
    }

    #[test]
    fn test_ciphertext_length() {
        let key = shared_key();
        let encrypted = encrypt_text(&key, "test").unwrap();
        let raw = STANDARD.decode(&encrypted.ciphertext).unwrap();
        assert_eq!(raw.len(), 4 + TAG_SIZE);
    }

    #[test]
    fn test_truncated_ciphertext_rejected() {
        let key = shared_key();
        let encrypted = encrypt_text(&key, "test").unwrap();
        let raw = STANDARD.decode(&encrypted.ciphertext).unwrap();
        let short = STANDARD.encode(&raw[..TAG_SIZE - 1]);
        assert!(matches!(
            decrypt_text(&key, &short, &encrypted.iv),
            Err(SealChatError::DecryptionError(_))
        ));
    }

    #[test]
    fn test_any_ciphertext_bit_flip_detected() {
        let key = shared_key();
        let encrypted = encrypt_text(&key, "tamper with me").unwrap();
        let len = STANDARD.decode(&encrypted.ciphertext).unwrap().len();

        for index in 0..len {
            for bit in [0u8, 3, 7] {
                let tampered = flip_bit(&encrypted.ciphertext, index, bit);
                let result = decrypt_text(&key, &tampered, &encrypted.iv);
                assert!(matches!(result, Err(SealChatError::DecryptionError(_))));
            }
        }
    }

    #[test]
    fn test_any_iv_bit_flip_detected() {
        let key = shared_key();
        let encrypted = encrypt_text(&key, "tamper with me").unwrap();

        for index in 0..NONCE_SIZE {
            let tampered = flip_bit(&encrypted.iv, index, 5);
            let result = decrypt_text(&key, &encrypted.ciphertext, &tampered);
            assert!(matches!(result, Err(SealChatError::DecryptionError(_))));
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let encrypted = encrypt_text(&shared_key(), "secret").unwrap();
        let result = decrypt_text(&shared_key(), &encrypted.ciphertext, &encrypted.iv);
        assert!(matches!(result, Err(SealChatError::DecryptionError(_))));
    }

    #[test]
    fn test_malformed_iv_is_decryption_error() {
        let key = shared_key();
        let encrypted = encrypt_text(&key, "x").unwrap();
        let short_iv = STANDARD.encode([0u8; 8]);
        assert!(matches!(
            decrypt_text(&key, &encrypted.ciphertext, &short_iv),
            Err(SealChatError::DecryptionError(_))
        ));
        assert!(decrypt_text(&key, "%%%", &encrypted.iv).is_err());
    }

    #[test]
    fn test_message_too_large() {
        let key = shared_key();
        let message = "A".repeat(MAX_PLAINTEXT_SIZE + 1);
        assert!(matches!(
            encrypt_text(&key, &message),
            Err(SealChatError::MessageTooLarge(_))
        ));
    }

    #[test]
    fn test_aad_is_authenticated() {
        let key = shared_key();
        let nonce = generate_nonce();
        let sealed = seal(&key, &nonce, b"payload", b"context-a").unwrap();
        assert!(open(&key, &nonce, &sealed, b"context-b").is_err());
        assert_eq!(open(&key, &nonce, &sealed, b"context-a").unwrap(), b"payload");
    }
}
