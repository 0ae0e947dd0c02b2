use crate::error::SableError;
use crate::{MAX_LABEL_LEN, MAX_NAME_LEN, MAX_POINTER_HOPS};
use log::trace;
use std::collections::HashMap;

/// The big-endian u16 at `offset`, the layout of every fixed field in an
/// RFC1035 4.1 message. None when the buffer ends first.
pub fn wire_u16(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Reads an owner name out of a message starting at `start`, following
/// compression pointers. Returns the dotted name (no trailing dot) and the
/// number of bytes the name occupies at `start` - a pointer costs two bytes
/// no matter how long the target is.
///
/// Pointer rules per RFC1035 4.1.4, hardened: at most [MAX_POINTER_HOPS]
/// hops, and a pointer must aim strictly backwards inside the message.
pub fn read_name(buf: &[u8], start: usize) -> Result<(String, usize), SableError> {
    let mut labels: Vec<String> = vec![];
    let mut pos = start;
    let mut consumed: Option<usize> = None;
    let mut hops: u32 = 0;
    let mut wire_len: usize = 1; // the terminating zero octet

    loop {
        let len_octet = *buf
            .get(pos)
            .ok_or_else(|| SableError::InvalidName("name ran off the end of the message".to_string()))?;

        if len_octet & 0xc0 == 0xc0 {
            // compression pointer
            let second = *buf.get(pos + 1).ok_or_else(|| {
                SableError::InvalidName("truncated compression pointer".to_string())
            })?;
            let target = ((len_octet as usize & 0x3f) << 8) | second as usize;
            if target >= pos {
                // forward (or self) pointers are how loops are built
                return Err(SableError::CompressionLoop);
            }
            hops += 1;
            if hops > MAX_POINTER_HOPS {
                return Err(SableError::CompressionLoop);
            }
            if consumed.is_none() {
                consumed = Some(pos + 2 - start);
            }
            pos = target;
            continue;
        }

        if len_octet & 0xc0 != 0 {
            return Err(SableError::InvalidName(format!(
                "reserved label type 0x{len_octet:02x}"
            )));
        }

        if len_octet == 0 {
            if consumed.is_none() {
                consumed = Some(pos + 1 - start);
            }
            break;
        }

        let label_len = len_octet as usize;
        if label_len > MAX_LABEL_LEN {
            return Err(SableError::InvalidName(format!(
                "label length {label_len} is over {MAX_LABEL_LEN}"
            )));
        }
        let label = buf.get(pos + 1..pos + 1 + label_len).ok_or_else(|| {
            SableError::InvalidName("label ran off the end of the message".to_string())
        })?;
        wire_len += label_len + 1;
        if wire_len > MAX_NAME_LEN {
            return Err(SableError::InvalidName(format!(
                "name longer than {MAX_NAME_LEN} octets"
            )));
        }
        labels.push(String::from_utf8_lossy(label).to_string());
        pos += label_len + 1;
    }

    let consumed =
        consumed.ok_or_else(|| SableError::InvalidName("empty name read".to_string()))?;
    Ok((labels.join("."), consumed))
}

/// The per-reply owner-name dictionary the encoder compresses against.
/// Keyed by lowercased label-suffix with the offset stored by value, so the
/// reply buffer is free to reallocate underneath it. Rebuilt for every
/// reply, never shared across replies.
#[derive(Debug, Default)]
pub struct NameCompressor {
    known: HashMap<String, u16>,
}

impl NameCompressor {
    /// Appends `name` to `buf`, emitting labels until a known suffix can be
    /// pointed at. With `compress` false (the SRV target, RFC 2782) the full
    /// label sequence is written; suffixes are still recorded for later
    /// names to point at.
    pub fn write_name(
        &mut self,
        buf: &mut Vec<u8>,
        name: &str,
        compress: bool,
    ) -> Result<(), SableError> {
        let name = name.trim_end_matches('.');
        if name.is_empty() {
            buf.push(0);
            return Ok(());
        }
        if name.len() + 2 > MAX_NAME_LEN {
            return Err(SableError::InvalidName(format!(
                "refusing to encode name over {MAX_NAME_LEN} octets: {name}"
            )));
        }

        let labels: Vec<&str> = name.split('.').collect();
        for (index, label) in labels.iter().enumerate() {
            let suffix = labels[index..].join(".").to_lowercase();
            if compress {
                if let Some(offset) = self.known.get(&suffix) {
                    buf.extend((0xc000u16 | offset).to_be_bytes());
                    trace!("compressed {suffix} to offset {offset}");
                    return Ok(());
                }
            }
            if label.is_empty() || label.len() > MAX_LABEL_LEN {
                return Err(SableError::InvalidName(format!(
                    "label {label:?} in {name} has a bad length"
                )));
            }
            // offsets above the 14-bit pointer range can't be referenced
            if buf.len() <= 0x3fff && !self.known.contains_key(&suffix) {
                self.known.insert(suffix, buf.len() as u16);
            }
            buf.push(label.len() as u8);
            buf.extend(label.as_bytes());
        }
        buf.push(0);
        Ok(())
    }
}

/// Lowercases, strips a single trailing dot, and bounds-checks a query name.
pub fn normalise_name(input: &str) -> Result<String, SableError> {
    let name = input.strip_suffix('.').unwrap_or(input).to_lowercase();
    if name.is_empty() {
        return Err(SableError::InvalidName("empty name".to_string()));
    }
    if name.len() + 2 > MAX_NAME_LEN {
        return Err(SableError::InvalidName(format!(
            "name over {MAX_NAME_LEN} octets: {name}"
        )));
    }
    if name.split('.').any(|l| l.is_empty() || l.len() > MAX_LABEL_LEN) {
        return Err(SableError::InvalidName(format!("bad label in {name}")));
    }
    Ok(name)
}

/// Is `child` equal to or below `parent`? Both sides lowercased dotted
/// names without trailing dots.
pub fn is_subdomain(child: &str, parent: &str) -> bool {
    child == parent || child.ends_with(&format!(".{parent}"))
}

/// Log a hexdump of the buffer, sixteen bytes per row.
pub fn hexdump(buf: &[u8]) {
    for (index, chunk) in buf.chunks(16).enumerate() {
        let hexes: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
        let printable: String = chunk
            .iter()
            .map(|b| {
                if b.is_ascii_graphic() || *b == b' ' {
                    *b as char
                } else {
                    '.'
                }
            })
            .collect();
        log::debug!("{:04x}  {:<48} {}", index * 16, hexes.join(" "), printable);
    }
}

/// Packs a LOC size/precision value (metres) into the RFC 1876
/// mantissa/exponent octet. Units on the wire are centimetres.
pub fn loc_size_to_u8(metres: f32) -> u8 {
    let mut cm = (metres * 100.0).round() as u64;
    if cm == 0 {
        return 0;
    }
    let mut exponent: u8 = 0;
    while cm >= 10 && exponent < 9 {
        cm /= 10;
        exponent += 1;
    }
    ((cm as u8) << 4) | exponent
}

/// Converts degrees/minutes/seconds into the RFC 1876 fixed-point form:
/// thousandths of an arcsecond offset from 2^31 (the equator/meridian).
pub fn dms_to_u32(degrees: u8, minutes: u8, seconds: f32, positive: bool) -> u32 {
    let arcsec_thousandths =
        (degrees as u64 * 3600 + minutes as u64 * 60) * 1000 + (seconds * 1000.0).round() as u64;
    let origin: u64 = 1 << 31;
    let result = match positive {
        true => origin + arcsec_thousandths,
        false => origin - arcsec_thousandths,
    };
    result as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_u16() {
        let buf = [0x12u8, 0x34, 0xab];
        assert_eq!(wire_u16(&buf, 0), Some(0x1234));
        assert_eq!(wire_u16(&buf, 1), Some(0x34ab));
        assert_eq!(wire_u16(&buf, 2), None, "short reads say so");
        assert_eq!(wire_u16(&[], 0), None);
    }

    #[test]
    fn test_read_name_plain() {
        let mut buf = vec![3, b'w', b'w', b'w', 7, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 3,
            b'c', b'o', b'm', 0];
        let (name, used) = read_name(&buf, 0).expect("parse failed");
        assert_eq!(name, "www.example.com");
        assert_eq!(used, buf.len());
        // bolt a pointer onto the end and read it back
        buf.extend([0xc0, 0x04]);
        let (name, used) = read_name(&buf, 17).expect("pointer parse failed");
        assert_eq!(name, "example.com");
        assert_eq!(used, 2);
    }

    #[test]
    fn test_read_name_rejects_forward_pointer() {
        let buf = vec![0xc0, 0x02, 3, b'f', b'o', b'o', 0];
        assert!(matches!(
            read_name(&buf, 0),
            Err(SableError::CompressionLoop)
        ));
    }

    #[test]
    fn test_read_name_rejects_long_label() {
        let mut buf = vec![70u8];
        buf.extend([b'a'; 70]);
        buf.push(0);
        assert!(read_name(&buf, 0).is_err());
    }

    #[test]
    fn test_compressor_points_at_suffix() {
        let mut buf: Vec<u8> = vec![];
        let mut compressor = NameCompressor::default();
        compressor
            .write_name(&mut buf, "www.example.com", true)
            .expect("write failed");
        let first_len = buf.len();
        compressor
            .write_name(&mut buf, "mail.example.com", true)
            .expect("write failed");
        // "mail" label (5 bytes) plus a two-byte pointer at "example.com"
        assert_eq!(buf.len(), first_len + 5 + 2);
        let (name, _) = read_name(&buf, first_len).expect("reparse failed");
        assert_eq!(name, "mail.example.com");
    }

    #[test]
    fn test_compressor_no_compress_still_records() {
        let mut buf: Vec<u8> = vec![];
        let mut compressor = NameCompressor::default();
        compressor
            .write_name(&mut buf, "sip.example.com", false)
            .expect("write failed");
        // uncompressed names contain no pointer bytes
        assert!(!buf.windows(1).any(|w| w[0] & 0xc0 == 0xc0));
        let before = buf.len();
        compressor
            .write_name(&mut buf, "example.com", true)
            .expect("write failed");
        assert_eq!(buf.len(), before + 2, "second name should be a pointer");
    }

    #[test]
    fn test_normalise_name() {
        assert_eq!(normalise_name("WWW.Example.COM.").expect("bad name"), "www.example.com");
        assert!(normalise_name("").is_err());
        assert!(normalise_name("a..b").is_err());
    }

    #[test]
    fn test_is_subdomain() {
        assert!(is_subdomain("www.example.com", "example.com"));
        assert!(is_subdomain("example.com", "example.com"));
        assert!(!is_subdomain("notexample.com", "example.com"));
        assert!(!is_subdomain("evil.attacker.tld", "example.net"));
    }

    #[test]
    fn test_loc_size_to_u8() {
        assert_eq!(loc_size_to_u8(1.0), 0x12); // 1e2 cm
        assert_eq!(loc_size_to_u8(10000.0), 0x16); // 1e6 cm
        assert_eq!(loc_size_to_u8(10.0), 0x13); // 1e3 cm
    }

    #[test]
    fn test_dms_to_u32_equator() {
        assert_eq!(dms_to_u32(0, 0, 0.0, true), 1 << 31);
        assert!(dms_to_u32(10, 0, 0.0, true) > 1 << 31);
        assert!(dms_to_u32(10, 0, 0.0, false) < 1 << 31);
    }
}
