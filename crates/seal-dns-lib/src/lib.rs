mod cert;
mod dnscrypt;
mod error;
mod stamp;
mod wire;

pub use cert::{select_certificate, Certificate, CERT_MAGIC, ES_VERSION_XCHACHA20, ES_VERSION_XSALSA20};
pub use dnscrypt::{
    decrypt_response, encrypt_query, generate_keypair, open_query, seal_response, Cipher, SharedKey,
    CLIENT_MAGIC_SIZE, HALF_NONCE_SIZE, NONCE_SIZE, PUBLIC_KEY_SIZE, QUERY_OVERHEAD, RESOLVER_MAGIC,
    RESPONSE_OVERHEAD, TAG_SIZE,
};
pub use error::ProtoError;
pub use stamp::{DnsCryptStamp, DohStamp, Stamp};
pub use wire::{
    ancount, build_query, has_tc_flag, is_response, prefix_with_size, qdcount, qname, qtype, rcode, refused_response,
    set_tid, synthetic_answer, tid, truncated_response, txt_records, QTYPE_A, QTYPE_AAAA, QTYPE_TXT, RCODE_NOERROR,
    RCODE_NXDOMAIN, RCODE_REFUSED, RCODE_SERVFAIL,
};

// Key types used across the crate boundary
pub use crypto_box::{PublicKey, SecretKey};
pub use ed25519_dalek::VerifyingKey;

/// DNS header size per RFC 1035
pub const DNS_HEADER_SIZE: usize = 12;
/// Shortest well-formed DNS message: header plus a question for the root name
pub const MIN_DNS_PACKET_SIZE: usize = DNS_HEADER_SIZE + 5;
/// Upper bound on any packet handled by the proxy
pub const MAX_DNS_PACKET_SIZE: usize = 4096;
/// Largest cleartext response delivered to a UDP client before truncation kicks in
pub const MAX_DNS_UDP_PACKET_SIZE: usize = 1252;
