//! Signed short-term DNSCrypt certificates.
//!
//! Servers publish their current certificate as TXT records under
//! `2.dnscrypt-cert.<provider>`. Each record carries a blob signed with
//! the provider's long-term Ed25519 key (the one pinned in the stamp);
//! the blob announces the short-term resolver key, the client magic the
//! server expects, and a validity window.

use crate::dnscrypt::{Cipher, CLIENT_MAGIC_SIZE, PUBLIC_KEY_SIZE};
use crate::ProtoError;
use crypto_box::PublicKey;
use ed25519_dalek::{Signature, VerifyingKey};

pub const CERT_MAGIC: [u8; 4] = [0x44, 0x4e, 0x53, 0x43];
pub const ES_VERSION_XSALSA20: [u8; 2] = [0x00, 0x01];
pub const ES_VERSION_XCHACHA20: [u8; 2] = [0x00, 0x02];

const SIGNATURE_SIZE: usize = 64;
// magic || es-version || protocol-minor || signature || resolver-pk ||
// client-magic || serial || ts-start || ts-end
const CERT_MIN_SIZE: usize = 4 + 2 + 2 + SIGNATURE_SIZE + PUBLIC_KEY_SIZE + CLIENT_MAGIC_SIZE + 4 + 4 + 4;
const SIGNED_OFFSET: usize = 4 + 2 + 2 + SIGNATURE_SIZE;

/// A verified short-term certificate.
#[derive(Clone)]
pub struct Certificate {
    pub cipher: Cipher,
    pub serial: u32,
    pub resolver_pk: PublicKey,
    pub client_magic: [u8; CLIENT_MAGIC_SIZE],
    pub ts_start: u32,
    pub ts_end: u32,
}

impl Certificate {
    pub fn is_valid_at(&self, now: u32) -> bool {
        self.ts_start <= now && now <= self.ts_end
    }
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("cipher", &self.cipher)
            .field("serial", &self.serial)
            .field("ts_start", &self.ts_start)
            .field("ts_end", &self.ts_end)
            .finish()
    }
}

fn parse_certificate(blob: &[u8], provider_pk: &VerifyingKey) -> Result<Certificate, ProtoError> {
    if blob.len() < CERT_MIN_SIZE {
        return Err(ProtoError::BadCertificate("certificate is too short"));
    }
    if blob[..4] != CERT_MAGIC {
        return Err(ProtoError::BadCertificate("bad certificate magic"));
    }
    let cipher = match [blob[4], blob[5]] {
        ES_VERSION_XSALSA20 => Cipher::XSalsa20Poly1305,
        ES_VERSION_XCHACHA20 => Cipher::XChaCha20Poly1305,
        _ => return Err(ProtoError::BadCertificate("unsupported es-version")),
    };

    let signature = Signature::from_bytes(
        blob[8..8 + SIGNATURE_SIZE]
            .try_into()
            .expect("slice length is fixed"),
    );
    provider_pk
        .verify_strict(&blob[SIGNED_OFFSET..], &signature)
        .map_err(|_| ProtoError::BadCertificate("signature verification failed"))?;

    let mut resolver_pk = [0u8; PUBLIC_KEY_SIZE];
    resolver_pk.copy_from_slice(&blob[SIGNED_OFFSET..SIGNED_OFFSET + PUBLIC_KEY_SIZE]);
    let mut client_magic = [0u8; CLIENT_MAGIC_SIZE];
    client_magic.copy_from_slice(&blob[SIGNED_OFFSET + PUBLIC_KEY_SIZE..SIGNED_OFFSET + PUBLIC_KEY_SIZE + CLIENT_MAGIC_SIZE]);
    let tail = &blob[SIGNED_OFFSET + PUBLIC_KEY_SIZE + CLIENT_MAGIC_SIZE..];

    Ok(Certificate {
        cipher,
        serial: u32::from_be_bytes(tail[..4].try_into().expect("slice length is fixed")),
        resolver_pk: PublicKey::from(resolver_pk),
        client_magic,
        ts_start: u32::from_be_bytes(tail[4..8].try_into().expect("slice length is fixed")),
        ts_end: u32::from_be_bytes(tail[8..12].try_into().expect("slice length is fixed")),
    })
}

/// Verifies every advertised certificate and returns the preferred one:
/// highest serial among those whose validity window contains `now`, with
/// XChaCha20 winning serial ties. With `ignore_timestamps` the window
/// check is skipped (for servers with broken clocks).
pub fn select_certificate(
    blobs: &[Vec<u8>],
    provider_pk: &VerifyingKey,
    now: u32,
    ignore_timestamps: bool,
) -> Result<Certificate, ProtoError> {
    let mut best: Option<Certificate> = None;
    let mut last_err = ProtoError::BadCertificate("no certificate advertised");
    for blob in blobs {
        let cert = match parse_certificate(blob, provider_pk) {
            Ok(cert) => cert,
            Err(e) => {
                last_err = e;
                continue;
            }
        };
        if !ignore_timestamps && !cert.is_valid_at(now) {
            last_err = ProtoError::BadCertificate("certificate is outside its validity window");
            continue;
        }
        let better = match &best {
            None => true,
            Some(current) => {
                cert.serial > current.serial
                    || (cert.serial == current.serial && cert.cipher == Cipher::XChaCha20Poly1305)
            }
        };
        if better {
            best = Some(cert);
        }
    }
    best.ok_or(last_err)
}
