//! NIP-44 v2 payload encryption.
//!
//! Used for the remote-signer RPC envelope and for the private portion of a
//! mute list. Conversation key is derived once per peer pair via secp256k1
//! ECDH + HKDF-SHA256; each payload gets a fresh nonce, ChaCha20 body, and
//! HMAC-SHA256 authentication over `nonce || ciphertext`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use secp256k1::{ecdh, Parity, PublicKey, SecretKey, XOnlyPublicKey};
use sha2::Sha256;

use crate::error::{Error, Result};

const VERSION: u8 = 2;
const MIN_PLAINTEXT: usize = 1;
const MAX_PLAINTEXT: usize = 65535;

/// Shared conversation key between `secret_key` and `peer_pubkey`
/// (hex x-only). Symmetric: both sides derive the same key.
pub fn conversation_key(secret_key: &SecretKey, peer_pubkey: &str) -> Result<[u8; 32]> {
    let peer = peer_point(peer_pubkey)?;
    // x coordinate of the shared point, unhashed, per NIP-44.
    let shared = ecdh::shared_secret_point(&peer, secret_key);
    let shared_x = &shared[..32];
    let (prk, _) = Hkdf::<Sha256>::extract(Some(b"nip44-v2"), shared_x);
    Ok(prk.into())
}

/// Encrypt `plaintext` for the peer, producing the base64 wire payload.
pub fn encrypt(secret_key: &SecretKey, peer_pubkey: &str, plaintext: &str) -> Result<String> {
    let key = conversation_key(secret_key, peer_pubkey)?;
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    encrypt_with_nonce(&key, &nonce, plaintext)
}

fn encrypt_with_nonce(key: &[u8; 32], nonce: &[u8; 32], plaintext: &str) -> Result<String> {
    let len = plaintext.len();
    if !(MIN_PLAINTEXT..=MAX_PLAINTEXT).contains(&len) {
        return Err(Error::Crypto(format!("invalid plaintext length {len}")));
    }
    let (chacha_key, chacha_nonce, hmac_key) = message_keys(key, nonce)?;

    let mut padded = vec![0u8; 2 + padded_len(len)];
    padded[0..2].copy_from_slice(&(len as u16).to_be_bytes());
    padded[2..2 + len].copy_from_slice(plaintext.as_bytes());

    let mut cipher = ChaCha20::new(&chacha_key.into(), &chacha_nonce.into());
    cipher.apply_keystream(&mut padded);

    let mac = hmac_aad(&hmac_key, nonce, &padded)?;

    let mut payload = Vec::with_capacity(1 + 32 + padded.len() + 32);
    payload.push(VERSION);
    payload.extend_from_slice(nonce);
    payload.extend_from_slice(&padded);
    payload.extend_from_slice(&mac);
    Ok(BASE64.encode(payload))
}

/// Decrypt a base64 wire payload from the peer.
pub fn decrypt(secret_key: &SecretKey, peer_pubkey: &str, payload: &str) -> Result<String> {
    let key = conversation_key(secret_key, peer_pubkey)?;
    let data = BASE64
        .decode(payload)
        .map_err(|e| Error::Crypto(format!("bad base64: {e}")))?;
    // version + nonce + at least one ciphertext block + mac
    if data.len() < 1 + 32 + 2 + 32 + 32 {
        return Err(Error::Crypto("payload too short".into()));
    }
    if data[0] != VERSION {
        return Err(Error::Crypto(format!("unsupported version {}", data[0])));
    }
    let nonce: [u8; 32] = data[1..33].try_into().unwrap();
    let mac_start = data.len() - 32;
    let ciphertext = &data[33..mac_start];
    let mac = &data[mac_start..];

    let (chacha_key, chacha_nonce, hmac_key) = message_keys(&key, &nonce)?;
    let expected = hmac_aad(&hmac_key, &nonce, ciphertext)?;
    if expected != mac {
        return Err(Error::Crypto("mac mismatch".into()));
    }

    let mut padded = ciphertext.to_vec();
    let mut cipher = ChaCha20::new(&chacha_key.into(), &chacha_nonce.into());
    cipher.apply_keystream(&mut padded);

    let len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if len < MIN_PLAINTEXT || 2 + len > padded.len() || padded.len() != 2 + padded_len(len) {
        return Err(Error::Crypto("invalid padding".into()));
    }
    String::from_utf8(padded[2..2 + len].to_vec())
        .map_err(|e| Error::Crypto(format!("invalid utf8: {e}")))
}

/// Expand per-message keys from the conversation key and nonce.
fn message_keys(key: &[u8; 32], nonce: &[u8; 32]) -> Result<([u8; 32], [u8; 12], [u8; 32])> {
    let hk = Hkdf::<Sha256>::from_prk(key).map_err(|e| Error::Crypto(e.to_string()))?;
    let mut okm = [0u8; 76];
    hk.expand(nonce, &mut okm)
        .map_err(|e| Error::Crypto(e.to_string()))?;
    let chacha_key: [u8; 32] = okm[0..32].try_into().unwrap();
    let chacha_nonce: [u8; 12] = okm[32..44].try_into().unwrap();
    let hmac_key: [u8; 32] = okm[44..76].try_into().unwrap();
    Ok((chacha_key, chacha_nonce, hmac_key))
}

fn hmac_aad(key: &[u8; 32], aad: &[u8; 32], message: &[u8]) -> Result<[u8; 32]> {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).map_err(|e| Error::Crypto(e.to_string()))?;
    mac.update(aad);
    mac.update(message);
    Ok(mac.finalize().into_bytes().into())
}

/// Padded plaintext length: 32-byte floor, then power-of-two derived chunks.
fn padded_len(unpadded: usize) -> usize {
    if unpadded <= 32 {
        return 32;
    }
    let next_power = 1usize << (usize::BITS - (unpadded - 1).leading_zeros());
    let chunk = if next_power <= 256 { 32 } else { next_power / 8 };
    chunk * ((unpadded - 1) / chunk + 1)
}

fn peer_point(peer_pubkey: &str) -> Result<PublicKey> {
    let bytes = hex::decode(peer_pubkey)
        .map_err(|e| Error::Crypto(format!("bad peer pubkey hex: {e}")))?;
    let xonly = XOnlyPublicKey::from_slice(&bytes)
        .map_err(|e| Error::Crypto(format!("bad peer pubkey: {e}")))?;
    Ok(PublicKey::from_x_only_public_key(xonly, Parity::Even))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::Secp256k1;

    fn keys(seed: u8) -> (SecretKey, String) {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[seed; 32]).unwrap();
        let (xonly, _) = sk.public_key(&secp).x_only_public_key();
        (sk, hex::encode(xonly.serialize()))
    }

    #[test]
    fn round_trip() {
        let (alice_sk, alice_pk) = keys(1);
        let (bob_sk, bob_pk) = keys(2);
        let payload = encrypt(&alice_sk, &bob_pk, "who mutes whom").unwrap();
        let open = decrypt(&bob_sk, &alice_pk, &payload).unwrap();
        assert_eq!(open, "who mutes whom");
    }

    #[test]
    fn conversation_key_is_symmetric() {
        let (alice_sk, alice_pk) = keys(1);
        let (bob_sk, bob_pk) = keys(2);
        assert_eq!(
            conversation_key(&alice_sk, &bob_pk).unwrap(),
            conversation_key(&bob_sk, &alice_pk).unwrap()
        );
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let (alice_sk, _) = keys(1);
        let (bob_sk, bob_pk) = keys(2);
        let payload = encrypt(&alice_sk, &bob_pk, "secret").unwrap();
        let mut raw = BASE64.decode(&payload).unwrap();
        let mid = raw.len() / 2;
        raw[mid] ^= 0xff;
        let (_, alice_pk) = keys(1);
        assert!(decrypt(&bob_sk, &alice_pk, &BASE64.encode(raw)).is_err());
    }

    #[test]
    fn wrong_peer_cannot_decrypt() {
        let (alice_sk, alice_pk) = keys(1);
        let (_, bob_pk) = keys(2);
        let (eve_sk, _) = keys(3);
        let payload = encrypt(&alice_sk, &bob_pk, "secret").unwrap();
        assert!(decrypt(&eve_sk, &alice_pk, &payload).is_err());
    }

    #[test]
    fn padding_lengths() {
        assert_eq!(padded_len(1), 32);
        assert_eq!(padded_len(32), 32);
        assert_eq!(padded_len(33), 64);
        assert_eq!(padded_len(100), 128);
        assert_eq!(padded_len(65), 96);
        assert_eq!(padded_len(320), 320);
    }

    #[test]
    fn rejects_empty_plaintext() {
        let (alice_sk, _) = keys(1);
        let (_, bob_pk) = keys(2);
        assert!(encrypt(&alice_sk, &bob_pk, "").is_err());
    }
}
