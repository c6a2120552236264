// DNS wire primitives used by the probes.
//
// Test cases deliberately combine opcodes, classes and flags that strict
// codecs refuse to build or parse (IQUERY, class 0, QR set on a query), so
// queries are encoded by hand and responses are decoded only as far as the
// header and the first answer's TTL.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{FingerprintError, Result};

pub const HEADER_SIZE: usize = 12;
const MAX_LABEL_LENGTH: usize = 63;
const MAX_NAME_LENGTH: usize = 255;

const FLAG_QR: u16 = 0x8000;
const FLAG_AA: u16 = 0x0400;
const FLAG_TC: u16 = 0x0200;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;
const FLAG_AD: u16 = 0x0020;
const FLAG_CD: u16 = 0x0010;

/// Single-bit header flags tracked in signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HeaderFlag {
    QR,
    AA,
    TC,
    RD,
    RA,
    AD,
    CD,
}

impl HeaderFlag {
    pub const ALL: [HeaderFlag; 7] = [
        HeaderFlag::QR,
        HeaderFlag::AA,
        HeaderFlag::TC,
        HeaderFlag::RD,
        HeaderFlag::RA,
        HeaderFlag::AD,
        HeaderFlag::CD,
    ];

    fn mask(self) -> u16 {
        match self {
            HeaderFlag::QR => FLAG_QR,
            HeaderFlag::AA => FLAG_AA,
            HeaderFlag::TC => FLAG_TC,
            HeaderFlag::RD => FLAG_RD,
            HeaderFlag::RA => FLAG_RA,
            HeaderFlag::AD => FLAG_AD,
            HeaderFlag::CD => FLAG_CD,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HeaderFlag::QR => "QR",
            HeaderFlag::AA => "AA",
            HeaderFlag::TC => "TC",
            HeaderFlag::RD => "RD",
            HeaderFlag::RA => "RA",
            HeaderFlag::AD => "AD",
            HeaderFlag::CD => "CD",
        }
    }
}

impl fmt::Display for HeaderFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HeaderFlag {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        HeaderFlag::ALL
            .iter()
            .copied()
            .find(|flag| flag.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown header flag: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum RecordType {
    A,
    NS,
    CNAME,
    SOA,
    PTR,
    MX,
    TXT,
    AAAA,
    SRV,
    DS,
    DNSKEY,
    AXFR,
    ANY,
    Other(u16),
}

const RECORD_TYPES: [(RecordType, &str, u16); 13] = [
    (RecordType::A, "A", 1),
    (RecordType::NS, "NS", 2),
    (RecordType::CNAME, "CNAME", 5),
    (RecordType::SOA, "SOA", 6),
    (RecordType::PTR, "PTR", 12),
    (RecordType::MX, "MX", 15),
    (RecordType::TXT, "TXT", 16),
    (RecordType::AAAA, "AAAA", 28),
    (RecordType::SRV, "SRV", 33),
    (RecordType::DS, "DS", 43),
    (RecordType::DNSKEY, "DNSKEY", 48),
    (RecordType::AXFR, "AXFR", 252),
    (RecordType::ANY, "ANY", 255),
];

impl RecordType {
    pub fn code(self) -> u16 {
        match self {
            RecordType::Other(code) => code,
            known => RECORD_TYPES
                .iter()
                .find(|(rtype, _, _)| *rtype == known)
                .map(|(_, _, code)| *code)
                .unwrap_or_default(),
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordType::Other(code) => write!(f, "TYPE{}", code),
            known => {
                let name = RECORD_TYPES
                    .iter()
                    .find(|(rtype, _, _)| rtype == known)
                    .map(|(_, name, _)| *name)
                    .unwrap_or("TYPE?");
                f.write_str(name)
            }
        }
    }
}

impl FromStr for RecordType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        if let Some((rtype, _, _)) = RECORD_TYPES.iter().find(|(_, name, _)| *name == upper) {
            return Ok(*rtype);
        }
        upper
            .strip_prefix("TYPE")
            .and_then(|code| code.parse::<u16>().ok())
            .map(RecordType::Other)
            .ok_or_else(|| format!("unknown record type: {}", s))
    }
}

impl From<RecordType> for String {
    fn from(value: RecordType) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for RecordType {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum DnsClass {
    Reserved0,
    IN,
    CH,
    HS,
    NONE,
    ANY,
    Other(u16),
}

const CLASSES: [(DnsClass, &str, u16); 6] = [
    (DnsClass::Reserved0, "RESERVED0", 0),
    (DnsClass::IN, "IN", 1),
    (DnsClass::CH, "CH", 3),
    (DnsClass::HS, "HS", 4),
    (DnsClass::NONE, "NONE", 254),
    (DnsClass::ANY, "ANY", 255),
];

impl DnsClass {
    pub fn code(self) -> u16 {
        match self {
            DnsClass::Other(code) => code,
            known => CLASSES
                .iter()
                .find(|(class, _, _)| *class == known)
                .map(|(_, _, code)| *code)
                .unwrap_or_default(),
        }
    }
}

impl fmt::Display for DnsClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DnsClass::Other(code) => write!(f, "CLASS{}", code),
            known => {
                let name = CLASSES
                    .iter()
                    .find(|(class, _, _)| class == known)
                    .map(|(_, name, _)| *name)
                    .unwrap_or("CLASS?");
                f.write_str(name)
            }
        }
    }
}

impl FromStr for DnsClass {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        if let Some((class, _, _)) = CLASSES.iter().find(|(_, name, _)| *name == upper) {
            return Ok(*class);
        }
        upper
            .strip_prefix("CLASS")
            .and_then(|code| code.parse::<u16>().ok())
            .map(DnsClass::Other)
            .ok_or_else(|| format!("unknown class: {}", s))
    }
}

impl From<DnsClass> for String {
    fn from(value: DnsClass) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for DnsClass {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Opcode {
    Query,
    IQuery,
    Status,
    Notify,
    Update,
    Other(u8),
}

impl Opcode {
    pub fn from_code(code: u8) -> Self {
        match code & 0x0F {
            0 => Opcode::Query,
            1 => Opcode::IQuery,
            2 => Opcode::Status,
            4 => Opcode::Notify,
            5 => Opcode::Update,
            other => Opcode::Other(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Opcode::Query => 0,
            Opcode::IQuery => 1,
            Opcode::Status => 2,
            Opcode::Notify => 4,
            Opcode::Update => 5,
            Opcode::Other(code) => code & 0x0F,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::Query => f.write_str("QUERY"),
            Opcode::IQuery => f.write_str("IQUERY"),
            Opcode::Status => f.write_str("STATUS"),
            Opcode::Notify => f.write_str("NOTIFY"),
            Opcode::Update => f.write_str("UPDATE"),
            Opcode::Other(code) => write!(f, "{}", code),
        }
    }
}

impl FromStr for Opcode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "QUERY" => Ok(Opcode::Query),
            "IQUERY" => Ok(Opcode::IQuery),
            "STATUS" => Ok(Opcode::Status),
            "NOTIFY" => Ok(Opcode::Notify),
            "UPDATE" => Ok(Opcode::Update),
            other => other
                .parse::<u8>()
                .ok()
                .filter(|code| *code < 16)
                .map(Opcode::from_code)
                .ok_or_else(|| format!("unknown opcode: {}", s)),
        }
    }
}

impl From<Opcode> for String {
    fn from(value: Opcode) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for Opcode {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

/// Mnemonic for the 4-bit header RCODE, numeric text for unassigned values.
pub fn rcode_text(rcode: u8) -> String {
    match rcode & 0x0F {
        0 => "NOERROR".to_string(),
        1 => "FORMERR".to_string(),
        2 => "SERVFAIL".to_string(),
        3 => "NXDOMAIN".to_string(),
        4 => "NOTIMP".to_string(),
        5 => "REFUSED".to_string(),
        6 => "YXDOMAIN".to_string(),
        7 => "YXRRSET".to_string(),
        8 => "NXRRSET".to_string(),
        9 => "NOTAUTH".to_string(),
        10 => "NOTZONE".to_string(),
        other => other.to_string(),
    }
}

/// Everything needed to put one query on the wire.
#[derive(Debug, Clone)]
pub struct QuerySpec<'a> {
    pub id: u16,
    pub qname: &'a str,
    pub record_type: RecordType,
    pub class: DnsClass,
    pub opcode: Opcode,
    pub flags: &'a [HeaderFlag],
}

/// Encode a single-question query. Only the listed flags are set.
pub fn build_query(spec: &QuerySpec<'_>) -> Result<Vec<u8>> {
    let mut flags: u16 = (spec.opcode.code() as u16) << 11;
    for flag in spec.flags {
        flags |= flag.mask();
    }

    let mut packet = Vec::with_capacity(HEADER_SIZE + spec.qname.len() + 6);
    packet.extend_from_slice(&spec.id.to_be_bytes());
    packet.extend_from_slice(&flags.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // ANCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT

    encode_name(spec.qname, &mut packet)?;
    packet.extend_from_slice(&spec.record_type.code().to_be_bytes());
    packet.extend_from_slice(&spec.class.code().to_be_bytes());

    Ok(packet)
}

fn encode_name(name: &str, packet: &mut Vec<u8>) -> Result<()> {
    let invalid = |reason: &str| FingerprintError::InvalidQueryName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = name.strip_suffix('.').unwrap_or(name);
    let mut encoded_len = 1;
    if !trimmed.is_empty() {
        for label in trimmed.split('.') {
            if label.is_empty() {
                return Err(invalid("empty label"));
            }
            if label.len() > MAX_LABEL_LENGTH {
                return Err(invalid("label longer than 63 octets"));
            }
            encoded_len += label.len() + 1;
            if encoded_len > MAX_NAME_LENGTH {
                return Err(invalid("name longer than 255 octets"));
            }
            packet.push(label.len() as u8);
            packet.extend_from_slice(label.as_bytes());
        }
    }
    packet.push(0);
    Ok(())
}

/// The parts of a response that signatures are built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeader {
    pub id: u16,
    pub flags: BTreeSet<HeaderFlag>,
    pub opcode: Opcode,
    pub rcode: u8,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
    pub first_answer_ttl: Option<u32>,
}

impl ResponseHeader {
    pub fn parse(packet: &[u8]) -> Result<Self> {
        if packet.len() < HEADER_SIZE {
            return Err(FingerprintError::MalformedResponse(format!(
                "response too short: {} bytes",
                packet.len()
            )));
        }

        let read_u16 = |offset: usize| u16::from_be_bytes([packet[offset], packet[offset + 1]]);
        let raw_flags = read_u16(2);
        let flags = HeaderFlag::ALL
            .iter()
            .copied()
            .filter(|flag| raw_flags & flag.mask() != 0)
            .collect();

        let qdcount = read_u16(4);
        let ancount = read_u16(6);
        let first_answer_ttl = if ancount > 0 {
            first_answer_ttl(packet, qdcount)
        } else {
            None
        };

        Ok(ResponseHeader {
            id: read_u16(0),
            flags,
            opcode: Opcode::from_code(((raw_flags >> 11) & 0x0F) as u8),
            rcode: (raw_flags & 0x000F) as u8,
            qdcount,
            ancount,
            nscount: read_u16(8),
            arcount: read_u16(10),
            first_answer_ttl,
        })
    }
}

// Walks past the question section; a truncated or odd body just yields None.
fn first_answer_ttl(packet: &[u8], qdcount: u16) -> Option<u32> {
    let mut pos = HEADER_SIZE;
    for _ in 0..qdcount {
        pos = skip_name(packet, pos)?;
        pos = pos.checked_add(4)?; // QTYPE + QCLASS
    }
    pos = skip_name(packet, pos)?;
    pos = pos.checked_add(4)?; // TYPE + CLASS
    let ttl = packet.get(pos..pos + 4)?;
    Some(u32::from_be_bytes([ttl[0], ttl[1], ttl[2], ttl[3]]))
}

fn skip_name(packet: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *packet.get(pos)? as usize;
        match len & 0xC0 {
            0x00 if len == 0 => return Some(pos + 1),
            0x00 => pos += len + 1,
            // A compression pointer always terminates the in-place name
            0xC0 => {
                packet.get(pos + 1)?;
                return Some(pos + 2);
            }
            _ => return None,
        }
    }
}
