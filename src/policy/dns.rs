//! Minimal DNS Message Codec
//!
//! Just enough of RFC 1035 to ask for A/AAAA records and read the answers.

use bytes::{BufMut, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::TunnelError;

/// Advertised EDNS0 UDP payload size
pub const EDNS_UDP_SIZE: u16 = 4096;

const FLAG_QR: u16 = 0x8000;
const FLAG_RD: u16 = 0x0100;
const CLASS_IN: u16 = 1;
const TYPE_OPT: u16 = 41;
const HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    A,
    Aaaa,
}

impl RecordType {
    fn code(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::Aaaa => 28,
        }
    }
}

/// The parts of a response the resolver cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsResponse {
    pub id: u16,
    pub rcode: u8,
    pub addrs: Vec<IpAddr>,
}

/// Encode a recursive query for `name` with an EDNS0 OPT record
pub fn encode_query(id: u16, name: &str, qtype: RecordType) -> Result<BytesMut, TunnelError> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + name.len() + 2 + 4 + 11);
    buf.put_u16(id);
    buf.put_u16(FLAG_RD);
    buf.put_u16(1); // QDCOUNT
    buf.put_u16(0); // ANCOUNT
    buf.put_u16(0); // NSCOUNT
    buf.put_u16(1); // ARCOUNT

    let name = name.trim_end_matches('.');
    if name.is_empty() || name.len() > 253 {
        return Err(TunnelError::protocol(format!("invalid DNS name: {:?}", name)));
    }
    for label in name.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(TunnelError::protocol(format!("invalid DNS label in {:?}", name)));
        }
        buf.put_u8(label.len() as u8);
        buf.put_slice(label.as_bytes());
    }
    buf.put_u8(0);
    buf.put_u16(qtype.code());
    buf.put_u16(CLASS_IN);

    // OPT pseudo-record: root name, type, UDP size in class, zero TTL and rdata
    buf.put_u8(0);
    buf.put_u16(TYPE_OPT);
    buf.put_u16(EDNS_UDP_SIZE);
    buf.put_u32(0);
    buf.put_u16(0);

    Ok(buf)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], TunnelError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| TunnelError::protocol("truncated DNS message"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, TunnelError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, TunnelError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Skip a possibly compressed name
    fn skip_name(&mut self) -> Result<(), TunnelError> {
        loop {
            let len = self.u8()?;
            if len == 0 {
                return Ok(());
            }
            if len & 0xC0 == 0xC0 {
                self.take(1)?;
                return Ok(());
            }
            self.take(len as usize)?;
        }
    }
}

/// Decode a response, keeping only address records of `qtype`
pub fn decode_response(buf: &[u8], qtype: RecordType) -> Result<DnsResponse, TunnelError> {
    let mut r = Reader { buf, pos: 0 };
    let id = r.u16()?;
    let flags = r.u16()?;
    if flags & FLAG_QR == 0 {
        return Err(TunnelError::protocol("DNS message is not a response"));
    }
    let rcode = (flags & 0x000F) as u8;
    let qdcount = r.u16()?;
    let ancount = r.u16()?;
    r.take(4)?; // NSCOUNT, ARCOUNT

    for _ in 0..qdcount {
        r.skip_name()?;
        r.take(4)?;
    }

    let mut addrs = Vec::new();
    for _ in 0..ancount {
        r.skip_name()?;
        let rtype = r.u16()?;
        let _class = r.u16()?;
        r.take(4)?; // TTL
        let rdlen = r.u16()? as usize;
        let rdata = r.take(rdlen)?;

        if rtype != qtype.code() {
            continue;
        }
        match (qtype, rdata.len()) {
            (RecordType::A, 4) => {
                addrs.push(IpAddr::V4(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3])));
            }
            (RecordType::Aaaa, 16) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                addrs.push(IpAddr::V6(Ipv6Addr::from(octets)));
            }
            _ => {}
        }
    }

    Ok(DnsResponse { id, rcode, addrs })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a response to `query` with the given rcode and answers
    pub(crate) fn build_response(query: &[u8], rcode: u8, answers: &[IpAddr]) -> Vec<u8> {
        // echo the header id and question, drop the OPT record
        let question_end = {
            let mut r = Reader { buf: query, pos: HEADER_LEN };
            r.skip_name().unwrap();
            r.take(4).unwrap();
            r.pos
        };
        let mut out = BytesMut::new();
        out.put_slice(&query[0..2]);
        out.put_u16(FLAG_QR | FLAG_RD | 0x0080 | rcode as u16);
        out.put_u16(1);
        out.put_u16(answers.len() as u16);
        out.put_u16(0);
        out.put_u16(0);
        out.put_slice(&query[HEADER_LEN..question_end]);
        for ip in answers {
            out.put_u16(0xC000 | HEADER_LEN as u16); // pointer to the question name
            match ip {
                IpAddr::V4(v4) => {
                    out.put_u16(1);
                    out.put_u16(CLASS_IN);
                    out.put_u32(60);
                    out.put_u16(4);
                    out.put_slice(&v4.octets());
                }
                IpAddr::V6(v6) => {
                    out.put_u16(28);
                    out.put_u16(CLASS_IN);
                    out.put_u32(60);
                    out.put_u16(16);
                    out.put_slice(&v6.octets());
                }
            }
        }
        out.to_vec()
    }

    /// Record type asked for by `query`
    pub(crate) fn query_type(query: &[u8]) -> RecordType {
        let mut r = Reader { buf: query, pos: HEADER_LEN };
        r.skip_name().unwrap();
        match r.u16().unwrap() {
            28 => RecordType::Aaaa,
            _ => RecordType::A,
        }
    }

    #[test]
    fn test_query_layout() {
        let query = encode_query(0xBEEF, "example.com.", RecordType::Aaaa).unwrap();
        assert_eq!(&query[0..2], &[0xBE, 0xEF]);
        assert_eq!(&query[2..4], &[0x01, 0x00]);
        assert_eq!(&query[12..25], b"\x07example\x03com\x00");
        assert_eq!(&query[25..27], &[0, 28]);
        assert_eq!(query_type(&query), RecordType::Aaaa);
        // OPT record advertising 4096 bytes
        assert_eq!(&query[query.len() - 11..query.len() - 6], &[0, 0, 41, 0x10, 0x00]);
    }

    #[test]
    fn test_rejects_bad_names() {
        assert!(encode_query(1, "", RecordType::A).is_err());
        assert!(encode_query(1, "a..b", RecordType::A).is_err());
        assert!(encode_query(1, &"x".repeat(64), RecordType::A).is_err());
    }

    #[test]
    fn test_decode_answers_of_requested_type() {
        let query = encode_query(7, "example.com", RecordType::A).unwrap();
        let v4: IpAddr = "93.184.216.34".parse().unwrap();
        let v6: IpAddr = "2606:2800:220:1::".parse().unwrap();
        let response = build_response(&query, 0, &[v6, v4]);

        let decoded = decode_response(&response, RecordType::A).unwrap();
        assert_eq!(decoded.id, 7);
        assert_eq!(decoded.rcode, 0);
        assert_eq!(decoded.addrs, vec![v4]);
    }

    #[test]
    fn test_decode_rcode() {
        let query = encode_query(9, "nope.invalid", RecordType::A).unwrap();
        let response = build_response(&query, 3, &[]);
        let decoded = decode_response(&response, RecordType::A).unwrap();
        assert_eq!(decoded.rcode, 3);
        assert!(decoded.addrs.is_empty());
    }

    #[test]
    fn test_decode_truncated() {
        let query = encode_query(9, "example.com", RecordType::A).unwrap();
        let response = build_response(&query, 0, &["1.2.3.4".parse().unwrap()]);
        assert!(decode_response(&response[..response.len() - 2], RecordType::A).is_err());
    }
}
