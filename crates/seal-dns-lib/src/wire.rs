//! Accessors and builders for raw DNS messages.
//!
//! The proxy never needs a full resource-record codec: queries and
//! responses travel through it as opaque byte strings, and only the
//! header, the question section and TXT RDATA (for certificate
//! bootstrap) are ever inspected.

use crate::{ProtoError, DNS_HEADER_SIZE, MAX_DNS_PACKET_SIZE, MIN_DNS_PACKET_SIZE};
use std::net::IpAddr;

pub const QTYPE_A: u16 = 1;
pub const QTYPE_AAAA: u16 = 28;
pub const QTYPE_TXT: u16 = 16;

pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_SERVFAIL: u8 = 2;
pub const RCODE_NXDOMAIN: u8 = 3;
pub const RCODE_REFUSED: u8 = 5;

const CLASS_IN: u16 = 1;
const MAX_LABELS: usize = 128;

/// Transaction ID of a DNS message. Callers must have checked the size.
pub fn tid(packet: &[u8]) -> u16 {
    u16::from_be_bytes([packet[0], packet[1]])
}

pub fn set_tid(packet: &mut [u8], tid: u16) {
    packet[..2].copy_from_slice(&tid.to_be_bytes());
}

pub fn rcode(packet: &[u8]) -> u8 {
    packet[3] & 0x0f
}

pub fn has_tc_flag(packet: &[u8]) -> bool {
    packet[2] & 0x02 != 0
}

pub fn is_response(packet: &[u8]) -> bool {
    packet[2] & 0x80 != 0
}

pub fn qdcount(packet: &[u8]) -> u16 {
    u16::from_be_bytes([packet[4], packet[5]])
}

pub fn ancount(packet: &[u8]) -> u16 {
    u16::from_be_bytes([packet[6], packet[7]])
}

/// Prepends the big-endian 16-bit length expected on DNS-over-TCP streams.
pub fn prefix_with_size(packet: Vec<u8>) -> Result<Vec<u8>, ProtoError> {
    if packet.len() > 0xffff {
        return Err(ProtoError::Oversize(packet.len()));
    }
    let mut framed = Vec::with_capacity(2 + packet.len());
    framed.extend_from_slice(&(packet.len() as u16).to_be_bytes());
    framed.extend_from_slice(&packet);
    Ok(framed)
}

fn check_bounds(packet: &[u8]) -> Result<(), ProtoError> {
    if packet.len() < MIN_DNS_PACKET_SIZE {
        return Err(ProtoError::Undersize(packet.len()));
    }
    if packet.len() > MAX_DNS_PACKET_SIZE {
        return Err(ProtoError::Oversize(packet.len()));
    }
    Ok(())
}

/// Advances past an encoded name starting at `pos`, following neither
/// side of a compression pointer (the pointer itself is two bytes).
fn skip_name(packet: &[u8], mut pos: usize) -> Result<usize, ProtoError> {
    let mut labels = 0;
    loop {
        let len = *packet.get(pos).ok_or(ProtoError::Parse("name runs past the end of the packet"))? as usize;
        if len & 0xc0 == 0xc0 {
            if pos + 2 > packet.len() {
                return Err(ProtoError::Parse("dangling compression pointer"));
            }
            return Ok(pos + 2);
        }
        if len > 0x3f {
            return Err(ProtoError::Parse("label length uses reserved bits"));
        }
        pos += 1 + len;
        if len == 0 {
            return Ok(pos);
        }
        labels += 1;
        if labels > MAX_LABELS {
            return Err(ProtoError::Parse("too many labels"));
        }
    }
}

/// Offset one past the last question record.
fn question_span(packet: &[u8]) -> Result<usize, ProtoError> {
    let mut pos = DNS_HEADER_SIZE;
    for _ in 0..qdcount(packet) {
        pos = skip_name(packet, pos)?;
        pos += 4; // QTYPE + QCLASS
        if pos > packet.len() {
            return Err(ProtoError::Parse("question runs past the end of the packet"));
        }
    }
    Ok(pos)
}

/// QNAME of the first question, normalized to lowercase.
pub fn qname(packet: &[u8]) -> Result<String, ProtoError> {
    check_bounds(packet)?;
    if qdcount(packet) == 0 {
        return Err(ProtoError::Parse("no question"));
    }
    let mut labels: Vec<String> = Vec::new();
    let mut pos = DNS_HEADER_SIZE;
    loop {
        let len = *packet.get(pos).ok_or(ProtoError::Parse("name runs past the end of the packet"))? as usize;
        if len & 0xc0 != 0 {
            return Err(ProtoError::Parse("compressed name in question"));
        }
        pos += 1;
        if len == 0 {
            break;
        }
        let label = packet
            .get(pos..pos + len)
            .ok_or(ProtoError::Parse("label runs past the end of the packet"))?;
        if !label.iter().all(u8::is_ascii) {
            return Err(ProtoError::Parse("label is not ASCII"));
        }
        labels.push(String::from_utf8_lossy(label).to_ascii_lowercase());
        pos += len;
        if labels.len() > MAX_LABELS {
            return Err(ProtoError::Parse("too many labels"));
        }
    }
    Ok(labels.join("."))
}

/// QTYPE of the first question.
pub fn qtype(packet: &[u8]) -> Result<u16, ProtoError> {
    check_bounds(packet)?;
    if qdcount(packet) == 0 {
        return Err(ProtoError::Parse("no question"));
    }
    let end = skip_name(packet, DNS_HEADER_SIZE)?;
    let bytes = packet
        .get(end..end + 2)
        .ok_or(ProtoError::Parse("question runs past the end of the packet"))?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Minimal response carrying only the original question, with QR and TC
/// set so the client retries over TCP.
pub fn truncated_response(query: &[u8]) -> Result<Vec<u8>, ProtoError> {
    check_bounds(query)?;
    let span = question_span(query)?;
    let mut response = query[..span].to_vec();
    // QR=1, TC=1; opcode and RD are kept from the query
    response[2] = 0x80 | (query[2] & 0x79) | 0x02;
    // RA=1, RCODE=NoError
    response[3] = 0x80;
    response[6..12].fill(0);
    Ok(response)
}

/// Response with the REFUSED code and no records.
pub fn refused_response(query: &[u8]) -> Result<Vec<u8>, ProtoError> {
    check_bounds(query)?;
    let span = question_span(query)?;
    let mut response = query[..span].to_vec();
    response[2] = 0x80 | (query[2] & 0x79);
    response[3] = 0x80 | RCODE_REFUSED;
    response[6..12].fill(0);
    Ok(response)
}

/// Synthesizes an authoritative one-answer response to `query`. The
/// answer name is a pointer to the question, so the query must carry
/// exactly one question whose QTYPE matches the address family.
pub fn synthetic_answer(query: &[u8], addr: IpAddr, ttl: u32) -> Result<Vec<u8>, ProtoError> {
    check_bounds(query)?;
    let span = question_span(query)?;
    let mut response = query[..span].to_vec();
    // QR=1, AA=1; opcode and RD kept
    response[2] = 0x80 | (query[2] & 0x79) | 0x04;
    response[3] = 0x80;
    response[6..12].fill(0);
    response[6..8].copy_from_slice(&1u16.to_be_bytes());
    // Pointer back to the question name at offset 12
    response.extend_from_slice(&[0xc0, 0x0c]);
    let (rr_type, rdata): (u16, &[u8]) = match &addr {
        IpAddr::V4(v4) => (QTYPE_A, &v4.octets()[..]),
        IpAddr::V6(v6) => (QTYPE_AAAA, &v6.octets()[..]),
    };
    response.extend_from_slice(&rr_type.to_be_bytes());
    response.extend_from_slice(&CLASS_IN.to_be_bytes());
    response.extend_from_slice(&ttl.to_be_bytes());
    response.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
    response.extend_from_slice(rdata);
    Ok(response)
}

/// Builds a plain one-question query, used for certificate bootstrap and
/// upstream probes.
pub fn build_query(name: &str, qtype: u16, tid: u16) -> Result<Vec<u8>, ProtoError> {
    let mut packet = Vec::with_capacity(DNS_HEADER_SIZE + name.len() + 6);
    packet.extend_from_slice(&tid.to_be_bytes());
    // RD=1
    packet.extend_from_slice(&[0x01, 0x00]);
    packet.extend_from_slice(&1u16.to_be_bytes());
    packet.extend_from_slice(&[0; 6]);
    for label in name.split('.').filter(|l| !l.is_empty()) {
        if label.len() > 0x3f {
            return Err(ProtoError::Parse("label is too long"));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);
    packet.extend_from_slice(&qtype.to_be_bytes());
    packet.extend_from_slice(&CLASS_IN.to_be_bytes());
    if packet.len() > MAX_DNS_PACKET_SIZE {
        return Err(ProtoError::Oversize(packet.len()));
    }
    Ok(packet)
}

/// Collects the RDATA of every TXT answer, with the character-strings of
/// each record concatenated. Certificate bootstrap responses carry one
/// signed certificate per TXT record.
pub fn txt_records(response: &[u8]) -> Result<Vec<Vec<u8>>, ProtoError> {
    check_bounds(response)?;
    let mut pos = question_span(response)?;
    let mut records = Vec::new();
    for _ in 0..ancount(response) {
        pos = skip_name(response, pos)?;
        let fixed = response
            .get(pos..pos + 10)
            .ok_or(ProtoError::Parse("answer runs past the end of the packet"))?;
        let rr_type = u16::from_be_bytes([fixed[0], fixed[1]]);
        let rdlength = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;
        pos += 10;
        let rdata = response
            .get(pos..pos + rdlength)
            .ok_or(ProtoError::Parse("RDATA runs past the end of the packet"))?;
        pos += rdlength;
        if rr_type != QTYPE_TXT {
            continue;
        }
        let mut blob = Vec::with_capacity(rdlength);
        let mut rd_pos = 0;
        while rd_pos < rdata.len() {
            let len = rdata[rd_pos] as usize;
            rd_pos += 1;
            let chunk = rdata
                .get(rd_pos..rd_pos + len)
                .ok_or(ProtoError::Parse("TXT character-string runs past RDATA"))?;
            blob.extend_from_slice(chunk);
            rd_pos += len;
        }
        records.push(blob);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn sample_query() -> Vec<u8> {
        build_query("example.com", QTYPE_A, 0xbeef).unwrap()
    }

    #[test]
    fn tid_accessors_roundtrip() {
        let mut query = sample_query();
        assert_eq!(tid(&query), 0xbeef);
        set_tid(&mut query, 0x1234);
        assert_eq!(tid(&query), 0x1234);
    }

    #[test]
    fn build_query_shape() {
        let query = sample_query();
        assert_eq!(qdcount(&query), 1);
        assert!(!is_response(&query));
        assert_eq!(qname(&query).unwrap(), "example.com");
        assert_eq!(qtype(&query).unwrap(), QTYPE_A);
    }

    #[test]
    fn qname_is_lowercased() {
        let query = build_query("ExAmPlE.COM", QTYPE_A, 1).unwrap();
        assert_eq!(qname(&query).unwrap(), "example.com");
    }

    #[test]
    fn truncated_response_shape() {
        let query = sample_query();
        let response = truncated_response(&query).unwrap();
        assert_eq!(tid(&response), tid(&query));
        assert!(is_response(&response));
        assert!(has_tc_flag(&response));
        assert_eq!(rcode(&response), RCODE_NOERROR);
        assert_eq!(qdcount(&response), 1);
        assert_eq!(ancount(&response), 0);
        assert_eq!(qname(&response).unwrap(), "example.com");
        assert!(response.len() <= crate::MAX_DNS_UDP_PACKET_SIZE);
    }

    #[test]
    fn refused_response_shape() {
        let response = refused_response(&sample_query()).unwrap();
        assert!(is_response(&response));
        assert_eq!(rcode(&response), RCODE_REFUSED);
        assert_eq!(ancount(&response), 0);
    }

    #[test]
    fn synthetic_a_answer() {
        let response = synthetic_answer(&sample_query(), Ipv4Addr::new(192, 0, 2, 1).into(), 600).unwrap();
        assert!(is_response(&response));
        assert_eq!(tid(&response), 0xbeef);
        assert_eq!(ancount(&response), 1);
        let rdata = &response[response.len() - 4..];
        assert_eq!(rdata, &[192, 0, 2, 1]);
    }

    #[test]
    fn synthetic_aaaa_answer() {
        let query = build_query("example.com", QTYPE_AAAA, 7).unwrap();
        let response = synthetic_answer(&query, Ipv6Addr::LOCALHOST.into(), 600).unwrap();
        assert_eq!(ancount(&response), 1);
        assert_eq!(&response[response.len() - 16..], &Ipv6Addr::LOCALHOST.octets()[..]);
    }

    #[test]
    fn undersized_packets_are_rejected() {
        assert_eq!(truncated_response(&[0; 5]), Err(ProtoError::Undersize(5)));
        assert_eq!(qname(&[0; 5]), Err(ProtoError::Undersize(5)));
    }

    #[test]
    fn txt_records_are_extracted() {
        // Response with one TXT answer split over two character-strings
        let mut response = build_query("2.dnscrypt-cert.example.com", QTYPE_TXT, 9).unwrap();
        response[2] |= 0x80;
        response[6..8].copy_from_slice(&1u16.to_be_bytes());
        response.extend_from_slice(&[0xc0, 0x0c]);
        response.extend_from_slice(&QTYPE_TXT.to_be_bytes());
        response.extend_from_slice(&1u16.to_be_bytes());
        response.extend_from_slice(&3600u32.to_be_bytes());
        response.extend_from_slice(&8u16.to_be_bytes());
        response.extend_from_slice(&[3, b'a', b'b', b'c', 2, b'd', b'e', 0]);
        let records = txt_records(&response).unwrap();
        assert_eq!(records, vec![b"abcde".to_vec()]);
    }

    #[test]
    fn oversize_tcp_frame_is_rejected() {
        assert!(matches!(prefix_with_size(vec![0; 0x10000]), Err(ProtoError::Oversize(_))));
    }

    proptest! {
        #[test]
        fn prefix_with_size_roundtrip(payload in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let framed = prefix_with_size(payload.clone()).unwrap();
            let length = u16::from_be_bytes([framed[0], framed[1]]) as usize;
            prop_assert_eq!(length, payload.len());
            prop_assert_eq!(&framed[2..], &payload[..]);
        }
    }
}
