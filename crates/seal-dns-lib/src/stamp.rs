//! `sdns://` server stamps.
//!
//! A stamp is a base64url blob describing one upstream: protocol id,
//! informal properties, endpoint address and the material needed to
//! authenticate it (a pinned Ed25519 provider key for DNSCrypt, optional
//! certificate hashes for DoH).

use crate::ProtoError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

const SCHEME: &str = "sdns://";
const PROTO_DNSCRYPT: u8 = 0x01;
const PROTO_DOH: u8 = 0x02;
const DEFAULT_PORT: u16 = 443;

#[derive(Debug, Clone)]
pub struct DnsCryptStamp {
    pub props: u64,
    pub addr: SocketAddr,
    pub provider_pk: [u8; 32],
    pub provider_name: String,
}

#[derive(Debug, Clone)]
pub struct DohStamp {
    pub props: u64,
    pub addr: Option<SocketAddr>,
    pub hashes: Vec<Vec<u8>>,
    pub hostname: String,
    pub port: u16,
    pub path: String,
}

#[derive(Debug, Clone)]
pub enum Stamp {
    DnsCrypt(DnsCryptStamp),
    Doh(DohStamp),
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, ProtoError> {
        let byte = *self.buf.get(self.pos).ok_or(ProtoError::BadStamp("unexpected end of stamp"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_u64_le(&mut self) -> Result<u64, ProtoError> {
        let bytes = self
            .buf
            .get(self.pos..self.pos + 8)
            .ok_or(ProtoError::BadStamp("unexpected end of stamp"))?;
        self.pos += 8;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_lp(&mut self) -> Result<&'a [u8], ProtoError> {
        let len = self.read_u8()? as usize;
        let bytes = self
            .buf
            .get(self.pos..self.pos + len)
            .ok_or(ProtoError::BadStamp("length prefix runs past the end"))?;
        self.pos += len;
        Ok(bytes)
    }

    /// Sequence of length-prefixed items; the high bit of each length
    /// byte flags that more items follow.
    fn read_vlp(&mut self) -> Result<Vec<Vec<u8>>, ProtoError> {
        let mut items = Vec::new();
        loop {
            let len_byte = self.read_u8()?;
            let len = (len_byte & 0x7f) as usize;
            let bytes = self
                .buf
                .get(self.pos..self.pos + len)
                .ok_or(ProtoError::BadStamp("length prefix runs past the end"))?;
            self.pos += len;
            if !bytes.is_empty() {
                items.push(bytes.to_vec());
            }
            if len_byte & 0x80 == 0 {
                return Ok(items);
            }
        }
    }
}

fn lp_str(bytes: &[u8]) -> Result<String, ProtoError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtoError::BadStamp("string field is not UTF-8"))
}

/// Parses `host[:port]`, accepting bracketed IPv6 literals.
fn parse_addr(s: &str, default_port: u16) -> Result<SocketAddr, ProtoError> {
    if let Ok(addr) = SocketAddr::from_str(s) {
        return Ok(addr);
    }
    if let Some(stripped) = s.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        if let Ok(ip) = IpAddr::from_str(stripped) {
            return Ok(SocketAddr::new(ip, default_port));
        }
    }
    if let Ok(ip) = IpAddr::from_str(s) {
        return Ok(SocketAddr::new(ip, default_port));
    }
    Err(ProtoError::BadStamp("endpoint address is not an IP address"))
}

/// Splits a hostname field into name and optional port.
fn parse_hostname(s: &str, default_port: u16) -> Result<(String, u16), ProtoError> {
    if s.is_empty() {
        return Err(ProtoError::BadStamp("empty hostname"));
    }
    if let Some(stripped) = s.strip_prefix('[') {
        // Bracketed IPv6, possibly with a port after the bracket
        let (host, rest) = stripped
            .split_once(']')
            .ok_or(ProtoError::BadStamp("unterminated IPv6 literal"))?;
        let port = match rest.strip_prefix(':') {
            Some(port) => port.parse().map_err(|_| ProtoError::BadStamp("invalid port"))?,
            None => default_port,
        };
        return Ok((host.to_string(), port));
    }
    match s.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port.parse().map_err(|_| ProtoError::BadStamp("invalid port"))?;
            Ok((host.to_string(), port))
        }
        _ => Ok((s.to_string(), default_port)),
    }
}

impl FromStr for Stamp {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let encoded = s.strip_prefix(SCHEME).ok_or(ProtoError::BadStamp("missing sdns:// scheme"))?;
        let decoded = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| ProtoError::BadStamp("invalid base64"))?;
        let mut reader = Reader::new(&decoded);

        match reader.read_u8()? {
            PROTO_DNSCRYPT => {
                let props = reader.read_u64_le()?;
                let addr = parse_addr(&lp_str(reader.read_lp()?)?, DEFAULT_PORT)?;
                let pk = reader.read_lp()?;
                let provider_pk: [u8; 32] = pk
                    .try_into()
                    .map_err(|_| ProtoError::BadStamp("provider key must be 32 bytes"))?;
                let provider_name = lp_str(reader.read_lp()?)?;
                Ok(Stamp::DnsCrypt(DnsCryptStamp {
                    props,
                    addr,
                    provider_pk,
                    provider_name,
                }))
            }
            PROTO_DOH => {
                let props = reader.read_u64_le()?;
                let addr_field = lp_str(reader.read_lp()?)?;
                let hashes = reader.read_vlp()?;
                let (hostname, port) = parse_hostname(&lp_str(reader.read_lp()?)?, DEFAULT_PORT)?;
                let path = lp_str(reader.read_lp()?)?;
                let addr = if addr_field.is_empty() {
                    None
                } else {
                    Some(parse_addr(&addr_field, port)?)
                };
                Ok(Stamp::Doh(DohStamp {
                    props,
                    addr,
                    hashes,
                    hostname,
                    port,
                    path,
                }))
            }
            _ => Err(ProtoError::BadStamp("unsupported protocol id")),
        }
    }
}

impl Stamp {
    /// TXT bootstrap name for DNSCrypt providers, with the conventional
    /// prefix added when the stamp carries a bare provider name.
    pub fn provider_query_name(&self) -> Option<String> {
        match self {
            Stamp::DnsCrypt(stamp) => {
                let name = stamp.provider_name.trim_end_matches('.');
                if name.starts_with("2.dnscrypt-cert.") {
                    Some(name.to_string())
                } else {
                    Some(format!("2.dnscrypt-cert.{}", name))
                }
            }
            Stamp::Doh(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_lp(out: &mut Vec<u8>, bytes: &[u8]) {
        out.push(bytes.len() as u8);
        out.extend_from_slice(bytes);
    }

    fn encode(raw: &[u8]) -> String {
        format!("{}{}", SCHEME, URL_SAFE_NO_PAD.encode(raw))
    }

    fn dnscrypt_stamp(addr: &str, provider: &str) -> String {
        let mut raw = vec![PROTO_DNSCRYPT];
        raw.extend_from_slice(&1u64.to_le_bytes());
        push_lp(&mut raw, addr.as_bytes());
        push_lp(&mut raw, &[0xaa; 32]);
        push_lp(&mut raw, provider.as_bytes());
        encode(&raw)
    }

    #[test]
    fn dnscrypt_stamp_roundtrip() {
        let stamp: Stamp = dnscrypt_stamp("198.51.100.3:8443", "example-resolver").parse().unwrap();
        let Stamp::DnsCrypt(stamp) = &stamp else {
            panic!("expected a DNSCrypt stamp");
        };
        assert_eq!(stamp.addr, "198.51.100.3:8443".parse().unwrap());
        assert_eq!(stamp.provider_pk, [0xaa; 32]);
        assert_eq!(stamp.provider_name, "example-resolver");
    }

    #[test]
    fn provider_query_name_gets_prefixed() {
        let stamp: Stamp = dnscrypt_stamp("198.51.100.3:8443", "example-resolver").parse().unwrap();
        assert_eq!(
            stamp.provider_query_name().unwrap(),
            "2.dnscrypt-cert.example-resolver"
        );

        let stamp: Stamp = dnscrypt_stamp("198.51.100.3:8443", "2.dnscrypt-cert.example-resolver")
            .parse()
            .unwrap();
        assert_eq!(
            stamp.provider_query_name().unwrap(),
            "2.dnscrypt-cert.example-resolver"
        );
    }

    #[test]
    fn dnscrypt_addr_without_port_defaults_to_443() {
        let stamp: Stamp = dnscrypt_stamp("198.51.100.3", "example").parse().unwrap();
        let Stamp::DnsCrypt(stamp) = &stamp else {
            panic!("expected a DNSCrypt stamp");
        };
        assert_eq!(stamp.addr.port(), 443);
    }

    #[test]
    fn doh_stamp_roundtrip() {
        let mut raw = vec![PROTO_DOH];
        raw.extend_from_slice(&5u64.to_le_bytes());
        push_lp(&mut raw, b"203.0.113.7");
        // two pinned hashes
        raw.push(0x80 | 4);
        raw.extend_from_slice(&[1, 2, 3, 4]);
        raw.push(4);
        raw.extend_from_slice(&[5, 6, 7, 8]);
        push_lp(&mut raw, b"doh.example.com");
        push_lp(&mut raw, b"/dns-query");

        let stamp: Stamp = encode(&raw).parse().unwrap();
        let Stamp::Doh(doh) = &stamp else {
            panic!("expected a DoH stamp");
        };
        assert_eq!(doh.addr, Some("203.0.113.7:443".parse().unwrap()));
        assert_eq!(doh.hashes, vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8]]);
        assert_eq!(doh.hostname, "doh.example.com");
        assert_eq!(doh.port, 443);
        assert_eq!(doh.path, "/dns-query");
        assert!(stamp.provider_query_name().is_none());
    }

    #[test]
    fn doh_hostname_may_carry_a_port() {
        let mut raw = vec![PROTO_DOH];
        raw.extend_from_slice(&0u64.to_le_bytes());
        push_lp(&mut raw, b"");
        raw.push(0);
        push_lp(&mut raw, b"doh.example.com:8443");
        push_lp(&mut raw, b"/dns-query");

        let stamp: Stamp = encode(&raw).parse().unwrap();
        let Stamp::Doh(stamp) = &stamp else {
            panic!("expected a DoH stamp");
        };
        assert_eq!(stamp.addr, None);
        assert_eq!(stamp.hostname, "doh.example.com");
        assert_eq!(stamp.port, 8443);
    }

    #[test]
    fn malformed_stamps_are_rejected() {
        assert!(Stamp::from_str("https://not-a-stamp").is_err());
        assert!(Stamp::from_str("sdns://!!!").is_err());
        // Unknown protocol id
        let raw = vec![0x7f];
        assert_eq!(
            Stamp::from_str(&encode(&raw)).unwrap_err(),
            ProtoError::BadStamp("unsupported protocol id")
        );
        // Truncated key
        let mut raw = vec![PROTO_DNSCRYPT];
        raw.extend_from_slice(&0u64.to_le_bytes());
        push_lp(&mut raw, b"192.0.2.1:443");
        push_lp(&mut raw, &[0xaa; 16]);
        push_lp(&mut raw, b"example");
        assert_eq!(
            Stamp::from_str(&encode(&raw)).unwrap_err(),
            ProtoError::BadStamp("provider key must be 32 bytes")
        );
    }
}
