//! TSIG request verification and response signing, RFC 8945. Keys come out
//! of the `tsig_keys` table as base64 secrets; the MAC work is `ring`'s.

use crate::db::TsigKeyRow;
use crate::error::SableError;
use crate::message::{Message, WireRecord};
use crate::utils::{NameCompressor, read_name};
use crate::{HEADER_BYTES, Header};
use base64::Engine;
use log::{debug, warn};
use packed_struct::prelude::*;
use ring::hmac;

/// Seconds of clock skew tolerated when we sign.
pub const DEFAULT_FUDGE: u16 = 300;

/// The fields of a parsed TSIG rdata blob.
#[derive(Clone, Debug)]
pub struct TsigRdata {
    pub algorithm: String,
    pub time_signed: u64,
    pub fudge: u16,
    pub mac: Vec<u8>,
    pub original_id: u16,
    pub error: u16,
    pub other: Vec<u8>,
}

/// Verification output the transfer engine holds onto so the reply can be
/// signed under the same key with the request MAC bound in.
#[derive(Clone, Debug)]
pub struct TsigContext {
    pub key_name: String,
    pub algorithm: String,
    pub secret: Vec<u8>,
    pub request_mac: Vec<u8>,
}

fn hmac_algorithm(name: &str) -> Result<hmac::Algorithm, SableError> {
    match name.trim_end_matches('.').to_ascii_lowercase().as_str() {
        "hmac-sha1" | "hmac-sha1.sig-alg.reg.int" => Ok(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY),
        "hmac-sha256" => Ok(hmac::HMAC_SHA256),
        "hmac-sha384" => Ok(hmac::HMAC_SHA384),
        "hmac-sha512" => Ok(hmac::HMAC_SHA512),
        other => Err(SableError::TsigBadKey(format!(
            "unsupported TSIG algorithm {other:?}"
        ))),
    }
}

pub fn decode_secret(row: &TsigKeyRow) -> Result<Vec<u8>, SableError> {
    base64::engine::general_purpose::STANDARD
        .decode(row.secret.trim())
        .map_err(|e| SableError::TsigBadKey(format!("secret for {:?} is not base64: {e:?}", row.name)))
}

pub fn parse_tsig_rdata(rdata: &[u8]) -> Result<TsigRdata, SableError> {
    let (algorithm, name_len) = read_name(rdata, 0)?;
    let mut pos = name_len;
    let need = |pos: usize, n: usize| -> Result<(), SableError> {
        match rdata.len() >= pos + n {
            true => Ok(()),
            false => Err(SableError::MalformedTransfer("short TSIG rdata".to_string())),
        }
    };
    need(pos, 10)?;
    let time_signed = u64::from_be_bytes([
        0, 0, rdata[pos], rdata[pos + 1], rdata[pos + 2], rdata[pos + 3], rdata[pos + 4],
        rdata[pos + 5],
    ]);
    let fudge = u16::from_be_bytes([rdata[pos + 6], rdata[pos + 7]]);
    let mac_size = u16::from_be_bytes([rdata[pos + 8], rdata[pos + 9]]) as usize;
    pos += 10;
    need(pos, mac_size)?;
    let mac = rdata[pos..pos + mac_size].to_vec();
    pos += mac_size;
    need(pos, 6)?;
    let original_id = u16::from_be_bytes([rdata[pos], rdata[pos + 1]]);
    let error = u16::from_be_bytes([rdata[pos + 2], rdata[pos + 3]]);
    let other_len = u16::from_be_bytes([rdata[pos + 4], rdata[pos + 5]]) as usize;
    pos += 6;
    need(pos, other_len)?;
    let other = rdata[pos..pos + other_len].to_vec();

    Ok(TsigRdata {
        algorithm: algorithm.to_lowercase(),
        time_signed,
        fudge,
        mac,
        original_id,
        error,
        other,
    })
}

/// The RFC 8945 4.3.3 "TSIG variables" block that joins the message bytes
/// in the MAC input.
fn tsig_variables(
    key_name: &str,
    algorithm: &str,
    time_signed: u64,
    fudge: u16,
    error: u16,
    other: &[u8],
) -> Result<Vec<u8>, SableError> {
    let mut out: Vec<u8> = vec![];
    let mut compressor = NameCompressor::default();
    compressor.write_name(&mut out, &key_name.to_lowercase(), false)?;
    out.extend(255u16.to_be_bytes()); // class ANY
    out.extend(0u32.to_be_bytes()); // ttl 0
    compressor.write_name(&mut out, &algorithm.to_lowercase(), false)?;
    out.extend(&time_signed.to_be_bytes()[2..8]);
    out.extend(fudge.to_be_bytes());
    out.extend(error.to_be_bytes());
    out.extend((other.len() as u16).to_be_bytes());
    out.extend(other);
    Ok(out)
}

/// The request as it was before the TSIG record: header id swapped back to
/// the original, ARCOUNT down one, buffer cut at the TSIG record.
fn unsigned_request(raw: &[u8], tsig: &WireRecord, original_id: u16) -> Result<Vec<u8>, SableError> {
    let mut message = raw[0..tsig.offset].to_vec();
    if message.len() < HEADER_BYTES {
        return Err(SableError::MalformedTransfer("TSIG offset inside header".to_string()));
    }
    let mut header = Header::unpack_from(&message)?;
    header.id = original_id;
    header.arcount = header.arcount.saturating_sub(1);
    let packed = header.pack()?;
    message[0..HEADER_BYTES].copy_from_slice(&packed);
    Ok(message)
}

/// Verifies the signature on a transfer request. On success returns the
/// context needed to sign the reply under the same key.
pub fn verify_request(
    raw: &[u8],
    msg: &Message,
    key_row: &TsigKeyRow,
    now: i64,
) -> Result<TsigContext, SableError> {
    let tsig = msg
        .tsig_record()
        .ok_or_else(|| SableError::MalformedTransfer("no TSIG record".to_string()))?;
    let rdata = parse_tsig_rdata(&tsig.rdata)?;

    let skew = (now - rdata.time_signed as i64).unsigned_abs();
    if skew > rdata.fudge as u64 {
        debug!(
            "TSIG time check failed for key {:?}: skew {skew}s > fudge {}s",
            key_row.name, rdata.fudge
        );
        return Err(SableError::TsigBadTime);
    }

    let algorithm = hmac_algorithm(&rdata.algorithm)?;
    let secret = decode_secret(key_row)?;
    let key = hmac::Key::new(algorithm, &secret);

    let mut signed: Vec<u8> = unsigned_request(raw, tsig, rdata.original_id)?;
    signed.extend(tsig_variables(
        &tsig.name,
        &rdata.algorithm,
        rdata.time_signed,
        rdata.fudge,
        rdata.error,
        &rdata.other,
    )?);

    hmac::verify(&key, &signed, &rdata.mac).map_err(|_| {
        warn!("TSIG MAC mismatch for key {:?}", key_row.name);
        SableError::TsigBadSignature
    })?;

    Ok(TsigContext {
        key_name: tsig.name.clone(),
        algorithm: rdata.algorithm,
        secret,
        request_mac: rdata.mac,
    })
}

/// Signs a reply under the request's key. The request MAC is prefixed into
/// the digest, binding the two messages together, then the TSIG record is
/// appended and ARCOUNT bumped.
pub fn sign_reply(
    mut reply: Vec<u8>,
    context: &TsigContext,
    now: i64,
) -> Result<Vec<u8>, SableError> {
    let algorithm = hmac_algorithm(&context.algorithm)?;
    let key = hmac::Key::new(algorithm, &context.secret);
    let time_signed = now as u64;

    let mut digest_input: Vec<u8> = vec![];
    digest_input.extend((context.request_mac.len() as u16).to_be_bytes());
    digest_input.extend(&context.request_mac);
    digest_input.extend(&reply);
    digest_input.extend(tsig_variables(
        &context.key_name,
        &context.algorithm,
        time_signed,
        DEFAULT_FUDGE,
        0,
        &[],
    )?);
    let mac = hmac::sign(&key, &digest_input);

    let original_id = u16::from_be_bytes([reply[0], reply[1]]);

    // the TSIG record itself
    let mut compressor = NameCompressor::default();
    let mut record: Vec<u8> = vec![];
    compressor.write_name(&mut record, &context.key_name.to_lowercase(), false)?;
    record.extend((crate::enums::RecordType::TSIG as u16).to_be_bytes());
    record.extend(255u16.to_be_bytes()); // class ANY
    record.extend(0u32.to_be_bytes()); // ttl
    let mut rdata: Vec<u8> = vec![];
    let mut rdata_compressor = NameCompressor::default();
    rdata_compressor.write_name(&mut rdata, &context.algorithm.to_lowercase(), false)?;
    rdata.extend(&time_signed.to_be_bytes()[2..8]);
    rdata.extend(DEFAULT_FUDGE.to_be_bytes());
    rdata.extend((mac.as_ref().len() as u16).to_be_bytes());
    rdata.extend(mac.as_ref());
    rdata.extend(original_id.to_be_bytes());
    rdata.extend(0u16.to_be_bytes()); // error
    rdata.extend(0u16.to_be_bytes()); // other-len
    record.extend((rdata.len() as u16).to_be_bytes());
    record.extend(rdata);

    // bump ARCOUNT in place
    let mut header = Header::unpack_from(&reply)?;
    header.arcount += 1;
    let packed = header.pack()?;
    reply[0..HEADER_BYTES].copy_from_slice(&packed);
    reply.extend(record);
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::{RecordClass, RecordType};
    use crate::message::{Message, Reply};
    use crate::{Header, Question};

    fn test_key() -> TsigKeyRow {
        TsigKeyRow {
            name: "transfer-key".to_string(),
            algorithm: "hmac-sha256".to_string(),
            secret: base64::engine::general_purpose::STANDARD.encode(b"a very secret key"),
            enabled: 1,
        }
    }

    /// Build a signed request the way a client would: message, then a TSIG
    /// record over message + variables.
    fn signed_request(now: i64, corrupt_mac: bool, skew: i64) -> Vec<u8> {
        let key_row = test_key();
        let question = Question {
            qname: "example.com".to_string(),
            qtype: RecordType::AXFR,
            qclass: RecordClass::Internet,
        };
        let header = Header {
            id: 0x4242,
            qdcount: 1,
            ..Default::default()
        };
        let reply = Reply::empty(&header, Some(question), crate::enums::Rcode::NoError);
        let mut unsigned = reply.as_bytes(65535).expect("encode");
        // queries keep QR=0
        unsigned[2] &= 0x7f;

        let time_signed = (now - skew) as u64;
        let secret = decode_secret(&key_row).expect("secret");
        let hmac_key = hmac::Key::new(hmac::HMAC_SHA256, &secret);
        let mut digest_input = unsigned.clone();
        digest_input.extend(
            tsig_variables("transfer-key", "hmac-sha256", time_signed, 300, 0, &[])
                .expect("variables"),
        );
        let mut mac = hmac::sign(&hmac_key, &digest_input).as_ref().to_vec();
        if corrupt_mac {
            mac[0] ^= 0xff;
        }

        // append the TSIG record and bump arcount
        let mut compressor = NameCompressor::default();
        let mut record: Vec<u8> = vec![];
        compressor
            .write_name(&mut record, "transfer-key", false)
            .expect("name");
        record.extend((RecordType::TSIG as u16).to_be_bytes());
        record.extend(255u16.to_be_bytes());
        record.extend(0u32.to_be_bytes());
        let mut rdata: Vec<u8> = vec![];
        let mut rdata_compressor = NameCompressor::default();
        rdata_compressor
            .write_name(&mut rdata, "hmac-sha256", false)
            .expect("alg");
        rdata.extend(&time_signed.to_be_bytes()[2..8]);
        rdata.extend(300u16.to_be_bytes());
        rdata.extend((mac.len() as u16).to_be_bytes());
        rdata.extend(&mac);
        rdata.extend(0x4242u16.to_be_bytes());
        rdata.extend(0u16.to_be_bytes());
        rdata.extend(0u16.to_be_bytes());
        record.extend((rdata.len() as u16).to_be_bytes());
        record.extend(rdata);

        let mut header = Header::unpack_from(&unsigned).expect("header");
        header.arcount += 1;
        let packed = header.pack().expect("pack");
        unsigned[0..HEADER_BYTES].copy_from_slice(&packed);
        unsigned.extend(record);
        unsigned
    }

    #[test]
    fn test_verify_then_sign_roundtrip() {
        let now = 1_700_000_000i64;
        let raw = signed_request(now, false, 0);
        let msg = Message::parse(&raw).expect("parse");
        let context = verify_request(&raw, &msg, &test_key(), now).expect("verify failed");
        assert_eq!(context.key_name, "transfer-key");

        // sign a little reply and make sure the TSIG parses back out
        let header = Header {
            id: 0x4242,
            ..Default::default()
        };
        let reply = Reply::empty(&header, None, crate::enums::Rcode::NoError);
        let unsigned = reply.as_bytes(65535).expect("encode");
        let signed = sign_reply(unsigned, &context, now).expect("sign failed");
        let parsed = Message::parse(&signed).expect("reparse");
        let tsig = parsed.tsig_record().expect("no TSIG on reply");
        let rdata = parse_tsig_rdata(&tsig.rdata).expect("rdata");
        assert_eq!(rdata.error, 0);
        assert_eq!(rdata.original_id, 0x4242);
        assert!(!rdata.mac.is_empty());
    }

    #[test]
    fn test_verify_rejects_bad_mac() {
        let now = 1_700_000_000i64;
        let raw = signed_request(now, true, 0);
        let msg = Message::parse(&raw).expect("parse");
        assert!(matches!(
            verify_request(&raw, &msg, &test_key(), now),
            Err(SableError::TsigBadSignature)
        ));
    }

    #[test]
    fn test_verify_rejects_stale_time() {
        let now = 1_700_000_000i64;
        let raw = signed_request(now, false, 4000);
        let msg = Message::parse(&raw).expect("parse");
        assert!(matches!(
            verify_request(&raw, &msg, &test_key(), now),
            Err(SableError::TsigBadTime)
        ));
    }
}
