//! DNSCrypt v2 sealing and opening.
//!
//! A query on the wire is `client-magic || client-pk || client-nonce ||
//! box(query || padding)`, a response `resolver-magic || client-nonce ||
//! server-nonce || box(response)`. The box is the NaCl construction over
//! X25519, with XSalsa20-Poly1305 (es-version 1) or XChaCha20-Poly1305
//! (es-version 2) as negotiated through the server certificate.
//!
//! Both directions are implemented: the proxy only ever seals queries and
//! opens responses, while the server-side pair backs the mock resolvers
//! used by the integration tests.

use crate::{ProtoError, MAX_DNS_PACKET_SIZE};
use crypto_box::aead::{Aead, OsRng};
use crypto_box::{ChaChaBox, Nonce, PublicKey, SalsaBox, SecretKey};
use rand::RngCore;

pub const CLIENT_MAGIC_SIZE: usize = 8;
pub const PUBLIC_KEY_SIZE: usize = 32;
pub const HALF_NONCE_SIZE: usize = 12;
pub const NONCE_SIZE: usize = 24;
pub const TAG_SIZE: usize = 16;

/// `client-magic || client-pk || client-nonce || tag`
pub const QUERY_OVERHEAD: usize = CLIENT_MAGIC_SIZE + PUBLIC_KEY_SIZE + HALF_NONCE_SIZE + TAG_SIZE;
/// `resolver-magic || nonce || tag`
pub const RESPONSE_OVERHEAD: usize = RESOLVER_MAGIC.len() + NONCE_SIZE + TAG_SIZE;

pub const RESOLVER_MAGIC: [u8; 8] = *b"r6fnvWj8";

const PAD_BLOCK_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cipher {
    XSalsa20Poly1305,
    XChaCha20Poly1305,
}

/// Precomputed client/resolver box for one certificate.
pub enum SharedKey {
    Salsa(SalsaBox),
    ChaCha(ChaChaBox),
}

impl SharedKey {
    pub fn new(cipher: Cipher, own_secret: &SecretKey, peer_pk: &PublicKey) -> Self {
        match cipher {
            Cipher::XSalsa20Poly1305 => SharedKey::Salsa(SalsaBox::new(peer_pk, own_secret)),
            Cipher::XChaCha20Poly1305 => SharedKey::ChaCha(ChaChaBox::new(peer_pk, own_secret)),
        }
    }

    fn seal(&self, nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>, ProtoError> {
        match self {
            SharedKey::Salsa(key) => key.encrypt(nonce, plaintext),
            SharedKey::ChaCha(key) => key.encrypt(nonce, plaintext),
        }
        .map_err(|_| ProtoError::Decrypt)
    }

    fn open(&self, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>, ProtoError> {
        match self {
            SharedKey::Salsa(key) => key.decrypt(nonce, ciphertext),
            SharedKey::ChaCha(key) => key.decrypt(nonce, ciphertext),
        }
        .map_err(|_| ProtoError::Decrypt)
    }
}

/// Fresh X25519 keypair drawn from the OS entropy source.
pub fn generate_keypair() -> (SecretKey, PublicKey) {
    let secret = SecretKey::generate(&mut OsRng);
    let public = secret.public_key();
    (secret, public)
}

fn pad(mut packet: Vec<u8>, target: usize) -> Vec<u8> {
    packet.push(0x80);
    packet.resize(target.max(packet.len()), 0);
    packet
}

fn unpad(mut packet: Vec<u8>) -> Result<Vec<u8>, ProtoError> {
    loop {
        match packet.pop() {
            Some(0x00) => {}
            Some(0x80) => return Ok(packet),
            _ => return Err(ProtoError::Parse("invalid query padding")),
        }
    }
}

/// Seals `query` for a DNSCrypt server, returning the wire-format packet
/// and the client half-nonce needed to open the response.
///
/// `min_question_size` is the padding floor: the padded message grows to
/// the next 64-byte multiple of `max(min_question_size, overhead + len)`.
/// A fresh random half-nonce is drawn for every call, which is what keeps
/// nonces unique under a given key pair.
pub fn encrypt_query(
    shared_key: &SharedKey,
    client_pk: &PublicKey,
    client_magic: &[u8; CLIENT_MAGIC_SIZE],
    query: &[u8],
    min_question_size: usize,
) -> Result<(Vec<u8>, [u8; HALF_NONCE_SIZE]), ProtoError> {
    let unpadded_size = QUERY_OVERHEAD + query.len();
    let target = unpadded_size.max(min_question_size);
    let padded_size = MAX_DNS_PACKET_SIZE.min((target + PAD_BLOCK_SIZE - 1) & !(PAD_BLOCK_SIZE - 1));
    if unpadded_size + 1 > padded_size {
        return Err(ProtoError::Oversize(query.len()));
    }

    let mut client_nonce = [0u8; HALF_NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut client_nonce);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..HALF_NONCE_SIZE].copy_from_slice(&client_nonce);

    let padded = pad(query.to_vec(), padded_size - QUERY_OVERHEAD);
    let sealed = shared_key.seal(&Nonce::from(nonce), &padded)?;

    let mut wire = Vec::with_capacity(QUERY_OVERHEAD - TAG_SIZE + sealed.len());
    wire.extend_from_slice(client_magic);
    wire.extend_from_slice(client_pk.as_bytes());
    wire.extend_from_slice(&client_nonce);
    wire.extend_from_slice(&sealed);
    Ok((wire, client_nonce))
}

/// Opens a DNSCrypt response, verifying the resolver magic, the echoed
/// client nonce and the AEAD tag.
pub fn decrypt_response(
    shared_key: &SharedKey,
    client_nonce: &[u8; HALF_NONCE_SIZE],
    encrypted: &[u8],
) -> Result<Vec<u8>, ProtoError> {
    if encrypted.len() <= RESPONSE_OVERHEAD {
        return Err(ProtoError::Undersize(encrypted.len()));
    }
    if encrypted[..RESOLVER_MAGIC.len()] != RESOLVER_MAGIC {
        return Err(ProtoError::Decrypt);
    }
    let nonce_on_wire = &encrypted[RESOLVER_MAGIC.len()..RESOLVER_MAGIC.len() + NONCE_SIZE];
    if &nonce_on_wire[..HALF_NONCE_SIZE] != client_nonce {
        return Err(ProtoError::Decrypt);
    }
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(nonce_on_wire);
    let sealed = &encrypted[RESOLVER_MAGIC.len() + NONCE_SIZE..];
    shared_key.open(&Nonce::from(nonce), sealed)
}

/// Server side: opens a sealed query, returning the client public key,
/// the client half-nonce and the unpadded cleartext.
pub fn open_query(
    shared_key: &SharedKey,
    encrypted: &[u8],
) -> Result<(PublicKey, [u8; HALF_NONCE_SIZE], Vec<u8>), ProtoError> {
    if encrypted.len() <= QUERY_OVERHEAD {
        return Err(ProtoError::Undersize(encrypted.len()));
    }
    let mut pk = [0u8; PUBLIC_KEY_SIZE];
    pk.copy_from_slice(&encrypted[CLIENT_MAGIC_SIZE..CLIENT_MAGIC_SIZE + PUBLIC_KEY_SIZE]);
    let mut client_nonce = [0u8; HALF_NONCE_SIZE];
    client_nonce.copy_from_slice(
        &encrypted[CLIENT_MAGIC_SIZE + PUBLIC_KEY_SIZE..CLIENT_MAGIC_SIZE + PUBLIC_KEY_SIZE + HALF_NONCE_SIZE],
    );
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..HALF_NONCE_SIZE].copy_from_slice(&client_nonce);
    let padded = shared_key.open(&Nonce::from(nonce), &encrypted[QUERY_OVERHEAD - TAG_SIZE..])?;
    Ok((PublicKey::from(pk), client_nonce, unpad(padded)?))
}

/// Server side: seals a response, echoing the client half-nonce and
/// appending a fresh server half-nonce.
pub fn seal_response(
    shared_key: &SharedKey,
    client_nonce: &[u8; HALF_NONCE_SIZE],
    response: &[u8],
) -> Result<Vec<u8>, ProtoError> {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..HALF_NONCE_SIZE].copy_from_slice(client_nonce);
    rand::rngs::OsRng.fill_bytes(&mut nonce[HALF_NONCE_SIZE..]);
    let sealed = shared_key.seal(&Nonce::from(nonce), response)?;
    let mut wire = Vec::with_capacity(RESPONSE_OVERHEAD - TAG_SIZE + sealed.len());
    wire.extend_from_slice(&RESOLVER_MAGIC);
    wire.extend_from_slice(&nonce);
    wire.extend_from_slice(&sealed);
    Ok(wire)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypairs() -> (SecretKey, PublicKey, SecretKey, PublicKey) {
        let (client_sk, client_pk) = generate_keypair();
        let (server_sk, server_pk) = generate_keypair();
        (client_sk, client_pk, server_sk, server_pk)
    }

    #[test]
    fn query_roundtrip_both_ciphers() {
        for cipher in [Cipher::XSalsa20Poly1305, Cipher::XChaCha20Poly1305] {
            let (client_sk, client_pk, server_sk, server_pk) = keypairs();
            let client_key = SharedKey::new(cipher, &client_sk, &server_pk);
            let server_key = SharedKey::new(cipher, &server_sk, &client_pk);

            let query = crate::build_query("example.com", crate::QTYPE_A, 0xbeef).unwrap();
            let (wire, client_nonce) = encrypt_query(&client_key, &client_pk, b"magic!!\0", &query, 0).unwrap();

            let (seen_pk, seen_nonce, opened) = open_query(&server_key, &wire).unwrap();
            assert_eq!(seen_pk.as_bytes(), client_pk.as_bytes());
            assert_eq!(seen_nonce, client_nonce);
            assert_eq!(opened, query);
        }
    }

    #[test]
    fn response_roundtrip() {
        let (client_sk, client_pk, server_sk, server_pk) = keypairs();
        let client_key = SharedKey::new(Cipher::XSalsa20Poly1305, &client_sk, &server_pk);
        let server_key = SharedKey::new(Cipher::XSalsa20Poly1305, &server_sk, &client_pk);

        let client_nonce = [7u8; HALF_NONCE_SIZE];
        let wire = seal_response(&server_key, &client_nonce, b"the response").unwrap();
        let opened = decrypt_response(&client_key, &client_nonce, &wire).unwrap();
        assert_eq!(opened, b"the response");
    }

    #[test]
    fn padding_reaches_the_floor() {
        let (client_sk, client_pk, _, server_pk) = keypairs();
        let key = SharedKey::new(Cipher::XSalsa20Poly1305, &client_sk, &server_pk);
        let query = crate::build_query("example.com", crate::QTYPE_A, 1).unwrap();
        let (wire, _) = encrypt_query(&key, &client_pk, b"magic!!\0", &query, 512).unwrap();
        assert_eq!(wire.len(), 512);
    }

    #[test]
    fn padded_size_is_a_block_multiple() {
        let (client_sk, client_pk, _, server_pk) = keypairs();
        let key = SharedKey::new(Cipher::XSalsa20Poly1305, &client_sk, &server_pk);
        let query = crate::build_query("a-much-longer-name.example.com", crate::QTYPE_AAAA, 1).unwrap();
        let (wire, _) = encrypt_query(&key, &client_pk, b"magic!!\0", &query, 0).unwrap();
        assert_eq!(wire.len() % PAD_BLOCK_SIZE, 0);
    }

    #[test]
    fn oversize_query_is_rejected() {
        let (client_sk, client_pk, _, server_pk) = keypairs();
        let key = SharedKey::new(Cipher::XSalsa20Poly1305, &client_sk, &server_pk);
        let huge = vec![0u8; MAX_DNS_PACKET_SIZE];
        assert!(matches!(
            encrypt_query(&key, &client_pk, b"magic!!\0", &huge, 0),
            Err(ProtoError::Oversize(_))
        ));
    }

    #[test]
    fn client_nonces_do_not_repeat() {
        let (client_sk, client_pk, _, server_pk) = keypairs();
        let key = SharedKey::new(Cipher::XSalsa20Poly1305, &client_sk, &server_pk);
        let query = crate::build_query("example.com", crate::QTYPE_A, 1).unwrap();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..64 {
            let (_, nonce) = encrypt_query(&key, &client_pk, b"magic!!\0", &query, 0).unwrap();
            assert!(seen.insert(nonce));
        }
    }

    #[test]
    fn tampered_response_is_rejected() {
        let (client_sk, client_pk, server_sk, server_pk) = keypairs();
        let client_key = SharedKey::new(Cipher::XChaCha20Poly1305, &client_sk, &server_pk);
        let server_key = SharedKey::new(Cipher::XChaCha20Poly1305, &server_sk, &client_pk);

        let client_nonce = [3u8; HALF_NONCE_SIZE];
        let mut wire = seal_response(&server_key, &client_nonce, b"the response").unwrap();
        *wire.last_mut().unwrap() ^= 0x01;
        assert_eq!(decrypt_response(&client_key, &client_nonce, &wire), Err(ProtoError::Decrypt));

        // Wrong resolver magic
        let mut wire = seal_response(&server_key, &client_nonce, b"the response").unwrap();
        wire[0] ^= 0x01;
        assert_eq!(decrypt_response(&client_key, &client_nonce, &wire), Err(ProtoError::Decrypt));

        // Nonce echo mismatch
        let wire = seal_response(&server_key, &[9u8; HALF_NONCE_SIZE], b"the response").unwrap();
        assert_eq!(decrypt_response(&client_key, &client_nonce, &wire), Err(ProtoError::Decrypt));
    }

    #[test]
    fn unpad_rejects_missing_marker() {
        assert!(unpad(vec![1, 2, 3, 0, 0]).is_err());
        assert!(unpad(vec![]).is_err());
    }
}
