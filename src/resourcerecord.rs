use crate::db::RrRow;
use crate::enums::RecordType;
use crate::error::SableError;
use crate::utils::{NameCompressor, dms_to_u32, loc_size_to_u8};

use log::*;
use packed_struct::prelude::*;
use std::str::FromStr;

const DEFAULT_LOC_HORIZ_PRE: f32 = 10000.0;
const DEFAULT_LOC_VERT_PRE: f32 = 10.0;
const DEFAULT_LOC_SIZE: f32 = 1.0;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DomainName {
    pub name: String,
}

impl DomainName {
    /// Appends the name through the reply's compression dictionary.
    pub fn write(
        &self,
        buf: &mut Vec<u8>,
        compressor: &mut NameCompressor,
        compress: bool,
    ) -> Result<(), SableError> {
        compressor.write_name(buf, &self.name, compress)
    }
}

impl From<&str> for DomainName {
    fn from(input: &str) -> Self {
        // mailbox-form names (dns@example.com) turn into dns.example.com
        let name = match input.contains('@') {
            false => String::from(input),
            true => input.replace('@', "."),
        };
        DomainName {
            name: name.trim_end_matches('.').to_lowercase(),
        }
    }
}

impl From<String> for DomainName {
    fn from(name: String) -> Self {
        DomainName::from(name.as_str())
    }
}

#[derive(Debug, PackedStruct, PartialEq, Eq, Clone)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "16")]
/// The 16-byte RFC 1876 LOC rdata layout.
pub struct LocRecord {
    #[packed_field(bits = "0..8", endian = "msb")]
    pub version: u8,
    #[packed_field(bits = "8..16", endian = "msb")]
    pub size: u8,
    #[packed_field(bits = "16..24", endian = "msb")]
    pub horiz_pre: u8,
    #[packed_field(bits = "24..32", endian = "msb")]
    pub vert_pre: u8,
    #[packed_field(bits = "32..64", endian = "msb")]
    pub latitude: u32,
    #[packed_field(bits = "64..96", endian = "msb")]
    pub longitude: u32,
    #[packed_field(bits = "96..128", endian = "msb")]
    pub altitude: u32,
}

/// <character-string> is a single length octet followed by that number of characters, RFC1035 3.3.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct DNSCharString {
    pub data: Vec<u8>,
}

impl From<&str> for DNSCharString {
    fn from(input: &str) -> Self {
        DNSCharString { data: input.into() }
    }
}

impl DNSCharString {
    /// The length octet and then the string, truncated to 255 data bytes.
    pub fn as_bytes(&self) -> Vec<u8> {
        let data = &self.data[..self.data.len().min(255)];
        let mut res: Vec<u8> = vec![data.len() as u8];
        res.extend(data);
        res
    }
}

#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, PartialEq, Eq, Clone)]
/// A record the resolver can hand to the encoder. One variant per RRTYPE we
/// serve, each carrying exactly the fields that type's rdata needs.
pub enum InternalResourceRecord {
    /// A single host address
    A { address: u32, ttl: u32 },
    /// RFC 3596
    AAAA { address: u128, ttl: u32 },
    CNAME {
        cname: DomainName,
        ttl: u32,
    },
    NS {
        nsdname: DomainName,
        ttl: u32,
    },
    PTR {
        ptrdname: DomainName,
        ttl: u32,
    },
    HINFO {
        cpu: DNSCharString,
        os: DNSCharString,
        ttl: u32,
    },
    MX {
        preference: u16,
        exchange: DomainName,
        ttl: u32,
    },
    TXT {
        txtdata: DNSCharString,
        ttl: u32,
    },
    /// RFC 2782. The target is never compressed on the wire.
    SRV {
        priority: u16,
        weight: u16,
        port: u16,
        target: DomainName,
        ttl: u32,
    },
    NAPTR {
        order: u16,
        preference: u16,
        flags: DNSCharString,
        services: DNSCharString,
        regexp: DNSCharString,
        replacement: DomainName,
        ttl: u32,
    },
    LOC {
        version: u8,
        size: u8,
        horiz_pre: u8,
        vert_pre: u8,
        latitude: u32,
        longitude: u32,
        altitude: u32,
        ttl: u32,
    },
    SOA {
        mname: DomainName,
        rname: DomainName,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
        ttl: u32,
    },
    /// RFC 4034 section 3. Served from the signature store, never computed.
    RRSIG {
        type_covered: u16,
        algorithm: u8,
        labels: u8,
        original_ttl: u32,
        expiration: u32,
        inception: u32,
        key_tag: u16,
        signer: DomainName,
        signature: Vec<u8>,
        ttl: u32,
    },
    /// RFC 4034 section 2
    DNSKEY {
        flags: u16,
        protocol: u8,
        algorithm: u8,
        public_key: Vec<u8>,
        ttl: u32,
    },
    /// RFC 5155 section 3
    NSEC3 {
        hash_algorithm: u8,
        flags: u8,
        iterations: u16,
        salt: Vec<u8>,
        next_hash: Vec<u8>,
        types: Vec<RecordType>,
        ttl: u32,
    },
}

impl InternalResourceRecord {
    pub fn ttl(&self) -> u32 {
        match self {
            InternalResourceRecord::A { ttl, .. }
            | InternalResourceRecord::AAAA { ttl, .. }
            | InternalResourceRecord::CNAME { ttl, .. }
            | InternalResourceRecord::NS { ttl, .. }
            | InternalResourceRecord::PTR { ttl, .. }
            | InternalResourceRecord::HINFO { ttl, .. }
            | InternalResourceRecord::MX { ttl, .. }
            | InternalResourceRecord::TXT { ttl, .. }
            | InternalResourceRecord::SRV { ttl, .. }
            | InternalResourceRecord::NAPTR { ttl, .. }
            | InternalResourceRecord::LOC { ttl, .. }
            | InternalResourceRecord::SOA { ttl, .. }
            | InternalResourceRecord::RRSIG { ttl, .. }
            | InternalResourceRecord::DNSKEY { ttl, .. }
            | InternalResourceRecord::NSEC3 { ttl, .. } => *ttl,
        }
    }

    pub fn is_type(&self, rtype: RecordType) -> bool {
        RecordType::from(self) == rtype
    }

    /// The target name, for the types whose rdata points at a host that
    /// should get ADDITIONAL glue.
    pub fn glue_target(&self) -> Option<&str> {
        match self {
            InternalResourceRecord::NS { nsdname, .. } => Some(&nsdname.name),
            InternalResourceRecord::MX { exchange, .. } => Some(&exchange.name),
            InternalResourceRecord::SRV { target, .. } => Some(&target.name),
            _ => None,
        }
    }

    /// Writes this record's rdata onto the end of the reply buffer. Embedded
    /// names run through the reply's compression dictionary except where the
    /// RFCs forbid it (SRV, NAPTR, RRSIG signer).
    pub fn write_rdata(
        &self,
        buf: &mut Vec<u8>,
        compressor: &mut NameCompressor,
    ) -> Result<(), SableError> {
        match self {
            InternalResourceRecord::A { address, .. } => buf.extend(address.to_be_bytes()),
            InternalResourceRecord::AAAA { address, .. } => buf.extend(address.to_be_bytes()),
            InternalResourceRecord::CNAME { cname, .. } => {
                cname.write(buf, compressor, true)?;
            }
            InternalResourceRecord::NS { nsdname, .. } => {
                nsdname.write(buf, compressor, true)?;
            }
            InternalResourceRecord::PTR { ptrdname, .. } => {
                ptrdname.write(buf, compressor, true)?;
            }
            InternalResourceRecord::HINFO { cpu, os, .. } => {
                buf.extend(cpu.as_bytes());
                buf.extend(os.as_bytes());
            }
            InternalResourceRecord::MX {
                preference,
                exchange,
                ..
            } => {
                buf.extend(preference.to_be_bytes());
                exchange.write(buf, compressor, true)?;
            }
            InternalResourceRecord::TXT { txtdata, .. } => buf.extend(txtdata.as_bytes()),
            InternalResourceRecord::SRV {
                priority,
                weight,
                port,
                target,
                ..
            } => {
                buf.extend(priority.to_be_bytes());
                buf.extend(weight.to_be_bytes());
                buf.extend(port.to_be_bytes());
                target.write(buf, compressor, false)?;
            }
            InternalResourceRecord::NAPTR {
                order,
                preference,
                flags,
                services,
                regexp,
                replacement,
                ..
            } => {
                buf.extend(order.to_be_bytes());
                buf.extend(preference.to_be_bytes());
                buf.extend(flags.as_bytes());
                buf.extend(services.as_bytes());
                buf.extend(regexp.as_bytes());
                replacement.write(buf, compressor, false)?;
            }
            InternalResourceRecord::LOC {
                version,
                size,
                horiz_pre,
                vert_pre,
                latitude,
                longitude,
                altitude,
                ..
            } => {
                let packed = LocRecord {
                    version: *version,
                    size: *size,
                    horiz_pre: *horiz_pre,
                    vert_pre: *vert_pre,
                    latitude: *latitude,
                    longitude: *longitude,
                    altitude: *altitude,
                }
                .pack()?;
                buf.extend(packed);
            }
            InternalResourceRecord::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
                ..
            } => {
                mname.write(buf, compressor, true)?;
                rname.write(buf, compressor, true)?;
                buf.extend(serial.to_be_bytes());
                buf.extend(refresh.to_be_bytes());
                buf.extend(retry.to_be_bytes());
                buf.extend(expire.to_be_bytes());
                buf.extend(minimum.to_be_bytes());
            }
            InternalResourceRecord::RRSIG {
                type_covered,
                algorithm,
                labels,
                original_ttl,
                expiration,
                inception,
                key_tag,
                signer,
                signature,
                ..
            } => {
                buf.extend(type_covered.to_be_bytes());
                buf.push(*algorithm);
                buf.push(*labels);
                buf.extend(original_ttl.to_be_bytes());
                buf.extend(expiration.to_be_bytes());
                buf.extend(inception.to_be_bytes());
                buf.extend(key_tag.to_be_bytes());
                // RFC 4034 3.1.7: signer name is never compressed
                signer.write(buf, compressor, false)?;
                buf.extend(signature);
            }
            InternalResourceRecord::DNSKEY {
                flags,
                protocol,
                algorithm,
                public_key,
                ..
            } => {
                buf.extend(flags.to_be_bytes());
                buf.push(*protocol);
                buf.push(*algorithm);
                buf.extend(public_key);
            }
            InternalResourceRecord::NSEC3 {
                hash_algorithm,
                flags,
                iterations,
                salt,
                next_hash,
                types,
                ..
            } => {
                buf.push(*hash_algorithm);
                buf.push(*flags);
                buf.extend(iterations.to_be_bytes());
                buf.push(salt.len() as u8);
                buf.extend(salt);
                buf.push(next_hash.len() as u8);
                buf.extend(next_hash);
                buf.extend(type_bitmap(types));
            }
        };
        Ok(())
    }

    /// Sort keys the encoder uses between records of the same type: MX by
    /// preference, SRV by priority then weight, everything else flat.
    pub fn sort_key(&self) -> (u16, u16) {
        match self {
            InternalResourceRecord::MX { preference, .. } => (*preference, 0),
            InternalResourceRecord::SRV {
                priority, weight, ..
            } => (*priority, *weight),
            _ => (0, 0),
        }
    }
}

/// The RFC 4034 4.1.2 window-block bitmap of the types present at a name.
pub fn type_bitmap(types: &[RecordType]) -> Vec<u8> {
    let mut windows: Vec<(u8, Vec<u8>)> = vec![];
    let mut values: Vec<u16> = types
        .iter()
        .filter(|t| !matches!(t, RecordType::InvalidType))
        .map(|t| *t as u16)
        .collect();
    values.sort_unstable();
    values.dedup();
    for value in values {
        let window = (value >> 8) as u8;
        let low = (value & 0xff) as u8;
        if windows.last().map(|w| w.0) != Some(window) {
            windows.push((window, vec![]));
        }
        if let Some((_, bits)) = windows.last_mut() {
            let byte = (low / 8) as usize;
            if bits.len() <= byte {
                bits.resize(byte + 1, 0);
            }
            bits[byte] |= 0x80 >> (low % 8);
        }
    }
    let mut out = vec![];
    for (window, bits) in windows {
        out.push(window);
        out.push(bits.len() as u8);
        out.extend(bits);
    }
    out
}

/// This is where the stringly-typed store row becomes a wire-typed record.
impl TryFrom<&RrRow> for InternalResourceRecord {
    type Error = SableError;

    fn try_from(row: &RrRow) -> Result<Self, SableError> {
        let ttl = row.ttl as u32;
        match RecordType::from(row.rrtype.as_str()) {
            RecordType::A => {
                let address: u32 = std::net::Ipv4Addr::from_str(row.data.trim())
                    .map_err(|e| {
                        SableError::InvalidAddress(format!(
                            "bad A rdata {:?}: {e:?}",
                            row.data
                        ))
                    })?
                    .into();
                Ok(InternalResourceRecord::A { address, ttl })
            }
            RecordType::AAAA => {
                let address: u128 = std::net::Ipv6Addr::from_str(row.data.trim())
                    .map_err(|e| {
                        SableError::InvalidAddress(format!(
                            "bad AAAA rdata {:?}: {e:?}",
                            row.data
                        ))
                    })?
                    .into();
                Ok(InternalResourceRecord::AAAA { address, ttl })
            }
            RecordType::CNAME => Ok(InternalResourceRecord::CNAME {
                cname: DomainName::from(row.data.as_str()),
                ttl,
            }),
            RecordType::NS => Ok(InternalResourceRecord::NS {
                nsdname: DomainName::from(row.data.as_str()),
                ttl,
            }),
            RecordType::PTR => Ok(InternalResourceRecord::PTR {
                ptrdname: DomainName::from(row.data.as_str()),
                ttl,
            }),
            RecordType::TXT => Ok(InternalResourceRecord::TXT {
                txtdata: DNSCharString {
                    data: row.data.clone().into_bytes(),
                },
                ttl,
            }),
            RecordType::HINFO => {
                let mut split_bit = row.data.split_whitespace();
                let cpu = DNSCharString::from(split_bit.next().unwrap_or("unknown"));
                let os = DNSCharString::from(split_bit.next().unwrap_or("unknown"));
                Ok(InternalResourceRecord::HINFO { cpu, os, ttl })
            }
            RecordType::MX => Ok(InternalResourceRecord::MX {
                // the store keeps the preference in the aux column
                preference: row.aux as u16,
                exchange: DomainName::from(row.data.as_str()),
                ttl,
            }),
            RecordType::SRV => {
                // aux is the priority; data is "weight port target"
                let split_bit: Vec<&str> = row.data.split_whitespace().collect();
                if split_bit.len() != 3 {
                    return Err(SableError::InvalidName(format!(
                        "SRV rdata should be 'weight port target', got {:?}",
                        row.data
                    )));
                }
                let weight = u16::from_str(split_bit[0]).map_err(|e| {
                    SableError::InvalidName(format!("bad SRV weight {}: {e:?}", split_bit[0]))
                })?;
                let port = u16::from_str(split_bit[1]).map_err(|e| {
                    SableError::InvalidName(format!("bad SRV port {}: {e:?}", split_bit[1]))
                })?;
                Ok(InternalResourceRecord::SRV {
                    priority: row.aux as u16,
                    weight,
                    port,
                    target: DomainName::from(split_bit[2]),
                    ttl,
                })
            }
            RecordType::NAPTR => {
                let split_bit: Vec<&str> = row.data.split_whitespace().collect();
                if split_bit.len() < 5 {
                    return Err(SableError::InvalidName(format!(
                        "NAPTR rdata should be 'pref flags services regexp replacement', got {:?}",
                        row.data
                    )));
                }
                let preference = u16::from_str(split_bit[0]).map_err(|e| {
                    SableError::InvalidName(format!("bad NAPTR preference: {e:?}"))
                })?;
                Ok(InternalResourceRecord::NAPTR {
                    order: row.aux as u16,
                    preference,
                    flags: DNSCharString::from(split_bit[1].trim_matches('"')),
                    services: DNSCharString::from(split_bit[2].trim_matches('"')),
                    regexp: DNSCharString::from(split_bit[3].trim_matches('"')),
                    replacement: DomainName::from(split_bit[4]),
                    ttl,
                })
            }
            RecordType::LOC => {
                let parsed = FileLocRecord::try_from(row.data.as_str())?;
                Ok(InternalResourceRecord::LOC {
                    version: 0,
                    size: parsed.size,
                    horiz_pre: parsed.horiz_pre,
                    vert_pre: parsed.vert_pre,
                    latitude: dms_to_u32(parsed.d1, parsed.m1, parsed.s1, parsed.lat_dir == 'N'),
                    longitude: dms_to_u32(parsed.d2, parsed.m2, parsed.s2, parsed.lon_dir == 'E'),
                    altitude: parsed.alt,
                    ttl,
                })
            }
            other => {
                warn!(
                    "Record id={} name={:?} has unservable type {other:?} ({}), skipping",
                    row.id, row.name, row.rrtype
                );
                Err(SableError::TypeNotImplemented)
            }
        }
    }
}

lazy_static! {
    // Canonical LOC text form per RFC 1876 appendix A:
    // d1 [m1 [s1]] {N|S} d2 [m2 [s2]] {E|W} alt[m] [size[m] [hp[m] [vp[m]]]]
    static ref LOC_REGEX: regex::Regex = regex::Regex::new(
        r"^(?P<d1>\d+)(?:[ ](?P<m1>\d+)(?:[ ](?P<s1>\d+(?:[.]\d+)?))?)?[ ](?P<lat_dir>[NS])[ ](?P<d2>\d+)(?:[ ](?P<m2>\d+)(?:[ ](?P<s2>\d+(?:[.]\d+)?))?)?[ ](?P<lon_dir>[EW])[ ](?P<alt>-?\d+(?:[.]\d+)?)m?(?:[ ](?P<size>\d+(?:[.]\d+)?)m?(?:[ ](?P<hp>\d+(?:[.]\d+)?)m?(?:[ ](?P<vp>\d+(?:[.]\d+)?)m?)?)?)?",
    ).expect("LOC_REGEX failed to compile");
}

#[derive(Debug, PartialEq)]
/// The parsed-but-not-yet-packed form of a LOC record's text rdata.
pub struct FileLocRecord {
    pub d1: u8,
    pub m1: u8,
    pub s1: f32,
    pub lat_dir: char,
    pub d2: u8,
    pub m2: u8,
    pub s2: f32,
    pub lon_dir: char,
    /// Wire form: centimetres above the -100km base
    pub alt: u32,
    pub size: u8,
    pub horiz_pre: u8,
    pub vert_pre: u8,
}

fn loc_field_f32(caps: &regex::Captures, field: &str, default: f32) -> f32 {
    caps.name(field)
        .and_then(|v| v.as_str().parse::<f32>().ok())
        .unwrap_or(default)
}

fn loc_field_u8(caps: &regex::Captures, field: &str) -> Result<u8, SableError> {
    match caps.name(field) {
        Some(value) => value
            .as_str()
            .parse::<u8>()
            .map_err(|e| SableError::InvalidName(format!("bad LOC field {field}: {e:?}"))),
        None => Ok(0),
    }
}

impl TryFrom<&str> for FileLocRecord {
    type Error = SableError;

    fn try_from(input_string: &str) -> Result<FileLocRecord, SableError> {
        let caps = LOC_REGEX.captures(input_string).ok_or_else(|| {
            SableError::InvalidName(format!("LOC rdata didn't match the text form: {input_string:?}"))
        })?;

        let lat_dir = caps
            .name("lat_dir")
            .and_then(|v| v.as_str().chars().next())
            .ok_or_else(|| SableError::InvalidName("LOC missing N/S".to_string()))?;
        let lon_dir = caps
            .name("lon_dir")
            .and_then(|v| v.as_str().chars().next())
            .ok_or_else(|| SableError::InvalidName("LOC missing E/W".to_string()))?;

        let alt_metres = caps
            .name("alt")
            .and_then(|v| v.as_str().parse::<f32>().ok())
            .ok_or_else(|| SableError::InvalidName("LOC missing altitude".to_string()))?;
        // wire altitude is centimetres from 100km below the WGS 84 ellipsoid
        let alt = (10_000_000.0 + alt_metres * 100.0).round() as u32;

        Ok(FileLocRecord {
            d1: loc_field_u8(&caps, "d1")?,
            m1: loc_field_u8(&caps, "m1")?,
            s1: loc_field_f32(&caps, "s1", 0.0),
            lat_dir,
            d2: loc_field_u8(&caps, "d2")?,
            m2: loc_field_u8(&caps, "m2")?,
            s2: loc_field_f32(&caps, "s2", 0.0),
            lon_dir,
            alt,
            size: loc_size_to_u8(loc_field_f32(&caps, "size", DEFAULT_LOC_SIZE)),
            horiz_pre: loc_size_to_u8(loc_field_f32(&caps, "hp", DEFAULT_LOC_HORIZ_PRE)),
            vert_pre: loc_size_to_u8(loc_field_f32(&caps, "vp", DEFAULT_LOC_VERT_PRE)),
        })
    }
}
