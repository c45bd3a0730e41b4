use thiserror::Error;

/// Protocol-level failures shared by the codec, the crypto box and the
/// certificate/stamp parsers. Per-query handling maps these onto server
/// health updates; none of them are ever fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("packet of {0} bytes exceeds the maximum DNS message size")]
    Oversize(usize),
    #[error("packet of {0} bytes is smaller than a minimal DNS message")]
    Undersize(usize),
    #[error("stream ended while reading a length-prefixed message")]
    ShortRead,
    #[error("encrypted payload could not be authenticated")]
    Decrypt,
    #[error("certificate rejected: {0}")]
    BadCertificate(&'static str),
    #[error("malformed DNS stamp: {0}")]
    BadStamp(&'static str),
    #[error("malformed DNS message: {0}")]
    Parse(&'static str),
}
