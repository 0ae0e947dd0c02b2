use crate::resourcerecord::InternalResourceRecord;
use enum_iterator::Sequence;
use packed_struct::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

#[derive(Debug, Eq, PartialEq, PrimitiveEnum_u8, Copy, Clone)]
/// A four bit field that specifies kind of query in this message.
/// This value is set by the originator of a query and copied into the response.
pub enum OpCode {
    /// A standard query (QUERY)
    Query = 0,
    /// Inverse query, obsolete per RFC 3425; answered NOTIMP
    IQuery = 1,
    /// Server status request (STATUS)
    Status = 2,
    /// Zone change notification, RFC 1996
    Notify = 4,
    /// Dynamic update, RFC 2136 - we answer these NOTIMP
    Update = 5,
    /// 3, 6-15 reserved for future use
    Reserved = 15,
}

impl From<u8> for OpCode {
    fn from(input: u8) -> Self {
        match input {
            0 => Self::Query,
            1 => Self::IQuery,
            2 => Self::Status,
            4 => Self::Notify,
            5 => Self::Update,
            _ => Self::Reserved,
        }
    }
}

#[derive(PrimitiveEnum_u8, Clone, Copy, Debug, Eq, PartialEq)]
/// Response code, things like NOERROR, FORMATERROR, SERVFAIL etc.
pub enum Rcode {
    // No error condition
    NoError = 0,
    // Format error - The name server was unable to interpret the query.
    FormatError = 1,
    // Server failure - The name server was unable to process this query due to a problem with the name server.
    ServFail = 2,
    /// Name Error - Meaningful only for responses from an authoritative name server, this code signifies that the domain name referenced in the query does not exist.
    NameError = 3,
    /// Not Implemented - The name server does not support the requested kind of query.
    NotImplemented = 4,
    /// Refused - The name server refuses to perform the specified operation for policy reasons.
    Refused = 5,
    /// Server Not Authoritative for zone / TSIG verification failure, RFC 8945
    NotAuth = 9,
}

impl From<u8> for Rcode {
    fn from(input: u8) -> Self {
        match input {
            0 => Self::NoError,
            1 => Self::FormatError,
            3 => Self::NameError,
            4 => Self::NotImplemented,
            5 => Self::Refused,
            9 => Self::NotAuth,
            _ => Self::ServFail,
        }
    }
}

#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Sequence)]
/// RRType, eg A, NS, MX, etc
pub enum RecordType {
    /// A host address
    A = 1,
    /// Authoritative name server
    NS = 2,
    CNAME = 5,  // 5 the canonical name for an alias
    SOA = 6,    // 6 marks the start of a zone of authority
    PTR = 12,   // 12 a domain name pointer
    HINFO = 13, // 13 host information
    MX = 15,    // 15 mail exchange
    /// Text strings
    TXT = 16,
    /// IPv6 Records <https://www.rfc-editor.org/rfc/rfc3596#section-2.1>
    AAAA = 28,
    /// For when you want to know the physical location of a thing! <https://www.rfc-editor.org/rfc/rfc1876>
    LOC = 29,
    /// Service location, RFC 2782
    SRV = 33,
    /// NAPTR <https://www.rfc-editor.org/rfc/rfc2915>
    NAPTR = 35,
    /// EDNS0 pseudo-record <https://www.rfc-editor.org/rfc/rfc6891>
    OPT = 41,
    /// RRset signature, RFC 4034
    RRSIG = 46,
    /// Zone public key, RFC 4034
    DNSKEY = 48,
    /// Hashed authenticated denial, RFC 5155
    NSEC3 = 50,
    /// Transaction signature pseudo-record, RFC 8945
    TSIG = 250,
    /// 251 A request for the changes since a given serial
    IXFR = 251,
    /// 252 A request for a transfer of an entire zone
    AXFR = 252,
    /// 255 A request for all records (*)
    ANY = 255,
    InvalidType = 0,
}

impl From<&u16> for RecordType {
    fn from(input: &u16) -> Self {
        match input {
            1 => Self::A,
            2 => Self::NS,
            5 => Self::CNAME,
            6 => Self::SOA,
            12 => Self::PTR,
            13 => Self::HINFO,
            15 => Self::MX,
            16 => Self::TXT,
            28 => Self::AAAA, // https://www.rfc-editor.org/rfc/rfc3596#section-2.1
            29 => Self::LOC,
            33 => Self::SRV,
            35 => Self::NAPTR,
            41 => Self::OPT,
            46 => Self::RRSIG,
            48 => Self::DNSKEY,
            50 => Self::NSEC3,
            250 => Self::TSIG,
            251 => Self::IXFR,
            252 => Self::AXFR,
            255 => Self::ANY,
            _ => Self::InvalidType,
        }
    }
}

impl From<String> for RecordType {
    fn from(input: String) -> Self {
        let input: RecordType = input.as_str().into();
        input
    }
}

impl From<&str> for RecordType {
    fn from(input: &str) -> Self {
        match input {
            "A" => Self::A,
            "AAAA" => Self::AAAA,
            "ANY" => Self::ANY,
            "AXFR" => Self::AXFR,
            "CNAME" => Self::CNAME,
            "DNSKEY" => Self::DNSKEY,
            "HINFO" => Self::HINFO,
            "IXFR" => Self::IXFR,
            "LOC" => Self::LOC,
            "MX" => Self::MX,
            "NAPTR" => Self::NAPTR,
            "NS" => Self::NS,
            "NSEC3" => Self::NSEC3,
            "OPT" => Self::OPT,
            "PTR" => Self::PTR,
            "RRSIG" => Self::RRSIG,
            "SOA" => Self::SOA,
            "SRV" => Self::SRV,
            "TSIG" => Self::TSIG,
            "TXT" => Self::TXT,
            _ => Self::InvalidType,
        }
    }
}

impl From<RecordType> for &'static str {
    fn from(input: RecordType) -> &'static str {
        match input {
            RecordType::A => "A",
            RecordType::AAAA => "AAAA",
            RecordType::ANY => "ANY",
            RecordType::AXFR => "AXFR",
            RecordType::CNAME => "CNAME",
            RecordType::DNSKEY => "DNSKEY",
            RecordType::HINFO => "HINFO",
            RecordType::IXFR => "IXFR",
            RecordType::LOC => "LOC",
            RecordType::MX => "MX",
            RecordType::NAPTR => "NAPTR",
            RecordType::NS => "NS",
            RecordType::NSEC3 => "NSEC3",
            RecordType::OPT => "OPT",
            RecordType::PTR => "PTR",
            RecordType::RRSIG => "RRSIG",
            RecordType::SOA => "SOA",
            RecordType::SRV => "SRV",
            RecordType::TSIG => "TSIG",
            RecordType::TXT => "TXT",
            RecordType::InvalidType => "",
        }
    }
}

impl Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let res: &'static str = self.to_owned().into();
        f.write_fmt(format_args!("{res}"))
    }
}

impl From<&InternalResourceRecord> for RecordType {
    fn from(input: &InternalResourceRecord) -> RecordType {
        match input {
            InternalResourceRecord::A { .. } => RecordType::A,
            InternalResourceRecord::AAAA { .. } => RecordType::AAAA,
            InternalResourceRecord::CNAME { .. } => RecordType::CNAME,
            InternalResourceRecord::DNSKEY { .. } => RecordType::DNSKEY,
            InternalResourceRecord::HINFO { .. } => RecordType::HINFO,
            InternalResourceRecord::LOC { .. } => RecordType::LOC,
            InternalResourceRecord::MX { .. } => RecordType::MX,
            InternalResourceRecord::NAPTR { .. } => RecordType::NAPTR,
            InternalResourceRecord::NS { .. } => RecordType::NS,
            InternalResourceRecord::NSEC3 { .. } => RecordType::NSEC3,
            InternalResourceRecord::PTR { .. } => RecordType::PTR,
            InternalResourceRecord::RRSIG { .. } => RecordType::RRSIG,
            InternalResourceRecord::SOA { .. } => RecordType::SOA,
            InternalResourceRecord::SRV { .. } => RecordType::SRV,
            InternalResourceRecord::TXT { .. } => RecordType::TXT,
        }
    }
}

impl RecordType {
    /// The set of types we'll serve from the zone store. Transfer and
    /// pseudo-types are handled on their own paths, not here.
    pub fn supported(self: RecordType) -> bool {
        #[allow(clippy::match_like_matches_macro)]
        match self {
            RecordType::A
            | RecordType::AAAA
            | RecordType::ANY
            | RecordType::CNAME
            | RecordType::DNSKEY
            | RecordType::HINFO
            | RecordType::LOC
            | RecordType::MX
            | RecordType::NAPTR
            | RecordType::NS
            | RecordType::PTR
            | RecordType::SOA
            | RecordType::SRV
            | RecordType::TXT => true,
            _ => false,
        }
    }

    /// IXFR and AXFR go through the transfer engine instead of the resolver.
    pub fn is_transfer(self: RecordType) -> bool {
        matches!(self, RecordType::IXFR | RecordType::AXFR)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, Sequence)]
/// CLASS fields appear in resource records, most entries should be IN, but CHAOS is typically used for management-layer things. Ref RFC1035 3.2.4.
pub enum RecordClass {
    /// IN - Internet
    Internet = 1,
    /// CS - CSNET class (Obsolete - used only for examples in some obsolete RFCs)
    CsNet = 2,
    /// CH - Chaos
    Chaos = 3,
    /// Hesiod [Dyer 87]
    Hesiod = 4,
    /// ANY - only valid in queries and TSIG records
    Any = 255,

    InvalidType = 0,
}

impl Display for RecordClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "{}",
            match self {
                RecordClass::Internet => "IN",
                RecordClass::CsNet => "CS",
                RecordClass::Chaos => "CHAOS",
                RecordClass::Hesiod => "HESIOD",
                RecordClass::Any => "ANY",
                RecordClass::InvalidType => "Invalid",
            }
        ))
    }
}

impl From<&u16> for RecordClass {
    fn from(input: &u16) -> Self {
        match input {
            1 => Self::Internet,
            2 => Self::CsNet,
            3 => Self::Chaos,
            4 => Self::Hesiod,
            255 => Self::Any,
            _ => Self::InvalidType,
        }
    }
}

#[derive(Debug, PrimitiveEnum_u8, Clone, Copy, Eq, PartialEq)]
pub enum PacketType {
    Query = 0,
    Answer = 1,
}

impl From<bool> for PacketType {
    fn from(input: bool) -> Self {
        match input {
            false => Self::Query,
            true => Self::Answer,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
/// Which transport a query arrived on. Transfers and big replies care.
pub enum Protocol {
    Udp,
    Tcp,
}

impl Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Tcp => write!(f, "TCP"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
/// Queue priority inside the engine loop. Forwarded queries hold resources
/// longer so they run below authoritative work.
pub enum TaskPriority {
    High = 0,
    Normal = 1,
    Low = 2,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
/// Which queue family a task lives on.
pub enum TaskKind {
    /// Ready to run on the next drain
    Normal,
    /// Parked on stream-socket readiness
    Io,
    /// Timer-driven (masters, garbage collection, sweeps)
    Periodic,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
/// Forwarder master connection lifecycle.
pub enum MasterState {
    #[default]
    Closed,
    Connecting,
    Connected,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
/// How upstream retry deadlines grow with each attempt.
pub enum TimeoutSchedule {
    Linear,
    Exponential,
    Progressive,
}

impl TimeoutSchedule {
    /// Deadline for the given (1-based) attempt number.
    pub fn delay(&self, base: std::time::Duration, attempt: u32) -> std::time::Duration {
        let attempt = attempt.max(1);
        match self {
            TimeoutSchedule::Linear => base,
            TimeoutSchedule::Exponential => base * 2u32.saturating_pow(attempt - 1),
            TimeoutSchedule::Progressive => base * attempt,
        }
    }
}

impl From<&str> for TimeoutSchedule {
    fn from(input: &str) -> Self {
        match input.to_ascii_lowercase().as_str() {
            "exponential" => Self::Exponential,
            "progressive" => Self::Progressive,
            _ => Self::Linear,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
/// The request surfaces an ACL rule can attach to.
pub enum AclSurface {
    Query,
    Axfr,
    Ixfr,
    Notify,
    Update,
    Doh,
    Recursion,
}

impl From<&str> for AclSurface {
    fn from(input: &str) -> Self {
        match input.to_ascii_lowercase().as_str() {
            "axfr" => Self::Axfr,
            "ixfr" => Self::Ixfr,
            "notify" => Self::Notify,
            "update" => Self::Update,
            "doh" => Self::Doh,
            "recursion" => Self::Recursion,
            _ => Self::Query,
        }
    }
}

impl AclSurface {
    /// No rules at all: the authoritative surfaces stay open, recursion
    /// stays shut.
    pub fn default_allow(&self) -> bool {
        !matches!(self, AclSurface::Recursion)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AclAction {
    Allow,
    Deny,
}

impl From<&str> for AclAction {
    fn from(input: &str) -> Self {
        match input.to_ascii_lowercase().as_str() {
            "deny" => Self::Deny,
            _ => Self::Allow,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rcode_values() {
        assert_eq!(Rcode::NoError as u8, 0);
        assert_eq!(Rcode::NameError as u8, 3);
        assert_eq!(Rcode::NotAuth as u8, 9);
    }

    #[test]
    fn test_recordtype_roundtrip() {
        for rt in enum_iterator::all::<RecordType>() {
            if rt == RecordType::InvalidType {
                continue;
            }
            let shown: &'static str = rt.into();
            assert_eq!(RecordType::from(shown), rt, "mnemonic {shown}");
        }
    }

    #[test]
    fn test_timeout_schedules() {
        let base = std::time::Duration::from_millis(100);
        assert_eq!(TimeoutSchedule::Linear.delay(base, 3), base);
        assert_eq!(TimeoutSchedule::Exponential.delay(base, 3), base * 4);
        assert_eq!(TimeoutSchedule::Progressive.delay(base, 3), base * 3);
    }
}
