#[macro_use]
extern crate lazy_static;

use crate::enums::*;
use crate::error::SableError;
use packed_struct::prelude::*;
use std::fmt::Display;

/// Request-level access control lists
pub mod acl;
/// Command line handling
pub mod cli;
/// Configuration handling for the server
pub mod config;
/// The SQL zone store the query engine reads from
pub mod db;
/// DNSSEC response assembly - we serve signatures, we never make them
pub mod dnssec;
/// The single-threaded cooperative query engine
pub mod engine;
pub mod enums;
pub mod error;
/// The recursive forwarder masters and upstream bookkeeping
pub mod forwarder;
/// Full-message parsing and reply encoding
pub mod message;
pub mod packet_dumper;
/// Sliding-window per-client rate limiting
pub mod ratelimit;
/// The encoded-reply cache
pub mod replycache;
/// Authoritative lookups: CNAME chasing, referrals, wildcards
pub mod resolver;
pub mod resourcerecord;
/// Task state machine and the kind-indexed priority queues
pub mod scheduler;
#[cfg(test)]
mod tests;
/// TSIG request verification and response signing
pub mod tsig;
pub mod utils;
/// IXFR/AXFR transfer engine
pub mod xfer;
pub mod zones;

/// The size of a DNS request header
pub const HEADER_BYTES: usize = 12;
/// Plain UDP replies truncate here unless EDNS0 negotiated more
pub const UDP_PAYLOAD_MIN: usize = 512;
/// The most we'll honour from an EDNS0 payload advertisement
pub const UDP_PAYLOAD_CAP: usize = 4096;
/// Stream replies are bounded by the two-byte length prefix
pub const TCP_PAYLOAD_MAX: usize = 65535;
/// Read buffer for inbound datagrams
pub const UDP_BUFFER_SIZE: usize = 4096;
/// Longest owner name on the wire, octets, RFC1035 2.3.4
pub const MAX_NAME_LEN: usize = 255;
/// Longest single label, octets
pub const MAX_LABEL_LEN: usize = 63;
/// How many compression pointers we'll chase before calling it a loop
pub const MAX_POINTER_HOPS: u32 = 127;
/// How many CNAME links the resolver will follow before SERVFAIL
pub const MAX_CNAME_CHAIN: usize = 8;
/// The default "cancel a client response" timeout
pub const REPLY_TIMEOUT_MS: u64 = 1000;

/// The header of a DNS transmission, either a Query or Reply. Ref [RFC1035](https://www.rfc-editor.org/rfc/rfc1035#section-4.1.1) section 4.1.1.
#[derive(Debug, PackedStruct, PartialEq, Eq, Clone)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "12")]
pub struct Header {
    /// The query ID
    #[packed_field(bits = "0..=15", endian = "msb")]
    pub id: u16,
    // Is it a query or response
    #[packed_field(bits = "16", ty = "enum")]
    pub qr: PacketType, // bit 16
    #[packed_field(bits = "17..=20", ty = "enum")]
    pub opcode: OpCode, // 17-20 actually 4 bits
    #[packed_field(bits = "21")]
    pub authoritative: bool, // 21
    #[packed_field(bits = "22")]
    pub truncated: bool, // 22
    // RD - this bit may be set in a query and is copied into the response. If RD is set, it directs the name server to pursue the query recursively.
    #[packed_field(bits = "23")]
    pub recursion_desired: bool, // 23
    #[packed_field(bits = "24")]
    pub recursion_available: bool, // 24
    /// reserved, must be all 0's
    #[packed_field(bits = "25")]
    pub z: bool,
    #[packed_field(bits = "26")]
    pub ad: bool,
    #[packed_field(bits = "27")]
    pub cd: bool,
    #[packed_field(bits = "28..=31", ty = "enum")]
    pub rcode: Rcode, // bits 28-31
    /// an unsigned 16 bit integer specifying the number of entries in the question section.
    #[packed_field(bits = "32..=47", endian = "msb")]
    pub qdcount: u16, // bits 32-47
    /// an unsigned 16 bit integer specifying the number of entries in the answer section.
    #[packed_field(bits = "48..=63", endian = "msb")]
    pub ancount: u16, // 48-63
    /// an unsigned 16 bit integer specifying the number of name server resource records in the authority records section.
    #[packed_field(bits = "64..=79", endian = "msb")]
    pub nscount: u16, // 64-79
    /// an unsigned 16 bit integer specifying the number of resource records in the additional records section.
    #[packed_field(bits = "80..=95", endian = "msb")]
    pub arcount: u16, // 80-95
}

impl Default for Header {
    fn default() -> Self {
        Header {
            id: 0,
            qr: PacketType::Query,
            opcode: OpCode::Query,
            authoritative: false,
            truncated: false,
            recursion_desired: false,
            recursion_available: false,
            z: false,
            ad: false,
            cd: false,
            rcode: Rcode::NoError,
            qdcount: 0,
            ancount: 0,
            nscount: 0,
            arcount: 0,
        }
    }
}

impl Display for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "id={} qr={:?} opcode={:?} aa={} tc={} rd={} ra={} rcode={:?} qd={} an={} ns={} ar={}",
            self.id,
            self.qr,
            self.opcode,
            self.authoritative,
            self.truncated,
            self.recursion_desired,
            self.recursion_available,
            self.rcode,
            self.qdcount,
            self.ancount,
            self.nscount,
            self.arcount
        ))
    }
}

impl Header {
    /// Flip a request header into the matching response header, keeping the
    /// id, opcode and RD bit the client sent.
    pub fn as_answer(&self) -> Header {
        Header {
            id: self.id,
            qr: PacketType::Answer,
            opcode: self.opcode,
            authoritative: false,
            truncated: false,
            recursion_desired: self.recursion_desired,
            recursion_available: false,
            z: false,
            ad: false,
            cd: self.cd,
            rcode: Rcode::NoError,
            qdcount: self.qdcount,
            ancount: 0,
            nscount: 0,
            arcount: 0,
        }
    }

    pub fn unpack_from(buf: &[u8]) -> Result<Header, SableError> {
        if buf.len() < HEADER_BYTES {
            return Err(SableError::InvalidHeader(format!(
                "message of {} bytes can't hold a header",
                buf.len()
            )));
        }
        let mut split_header: [u8; HEADER_BYTES] = [0; HEADER_BYTES];
        split_header.copy_from_slice(&buf[0..HEADER_BYTES]);
        Header::unpack(&split_header).map_err(|e| SableError::InvalidHeader(format!("{e:?}")))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// A DNS Question section, from Ref [RFC1035](https://www.rfc-editor.org/rfc/rfc1035#section-4.1.2) section 4.1.2 "Question section format".
pub struct Question {
    /// The name which is being queried, dotted and lowercased
    pub qname: String,
    /// The Record type that is being requested, eg A, NS, MX, TXT etc.
    pub qtype: RecordType,
    /// The class, (typically IN for "Internet")
    pub qclass: RecordClass,
}

impl Display for Question {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "QNAME={} QTYPE={} QCLASS={}",
            self.qname, self.qtype, self.qclass,
        ))
    }
}

impl Question {
    /// Pulls a question out of the full message buffer starting at `offset`,
    /// returning it with the number of bytes it occupied.
    pub fn from_wire(buf: &[u8], offset: usize) -> Result<(Self, usize), SableError> {
        let (qname, name_len) = crate::utils::read_name(buf, offset)?;
        let fixed = offset + name_len;
        let too_short =
            || SableError::InvalidName("message too short for QTYPE/QCLASS".to_string());
        let qtype = RecordType::from(&crate::utils::wire_u16(buf, fixed).ok_or_else(too_short)?);
        let qclass =
            RecordClass::from(&crate::utils::wire_u16(buf, fixed + 2).ok_or_else(too_short)?);
        Ok((
            Question {
                qname: qname.to_lowercase(),
                qtype,
                qclass,
            },
            name_len + 4,
        ))
    }

    /// turn a question into a vec of bytes to send back to the user
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut retval: Vec<u8> = vec![];
        let mut compressor = crate::utils::NameCompressor::default();
        // a question owner is always the first name in the message, nothing
        // to point at yet
        if let Err(err) = compressor.write_name(&mut retval, &self.qname, false) {
            log::error!("Failed to encode question name {:?}: {err}", self.qname);
        }
        retval.extend((self.qtype as u16).to_be_bytes());
        retval.extend((self.qclass as u16).to_be_bytes());
        retval
    }
}
