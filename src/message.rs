//! Whole-message parsing and reply encoding.
//!
//! Parsing pulls the header, question and all three record sections out of a
//! raw buffer, chasing compression pointers as it goes. Encoding builds the
//! reply buffer through a fresh [NameCompressor], remembers where every
//! record landed, and applies the truncation policy afterwards.

use crate::enums::{PacketType, Rcode, RecordClass, RecordType};
use crate::error::SableError;
use crate::resourcerecord::InternalResourceRecord;
use crate::utils::{NameCompressor, read_name};
use crate::{HEADER_BYTES, Header, Question, UDP_PAYLOAD_CAP};
use log::trace;
use packed_struct::prelude::*;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Section {
    Answer,
    Authority,
    Additional,
}

/// EDNS0 OPT data pulled from a request's ADDITIONAL section, RFC 6891.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Edns {
    pub payload_size: u16,
    pub version: u8,
    /// DNSSEC-OK: the client wants signature records
    pub do_bit: bool,
}

/// A record as parsed off the wire. `target` carries the decoded rdata name
/// for the types that have one, so bailiwick checks and id correlation never
/// have to re-chase pointers.
#[derive(Clone, Debug)]
pub struct WireRecord {
    pub name: String,
    pub rrtype: RecordType,
    pub raw_type: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
    /// Where the record starts in the source message
    pub offset: usize,
    /// Where the rdata starts in the source message, for re-reading
    /// compressed names embedded in it
    pub rdata_offset: usize,
    pub target: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<WireRecord>,
    pub authorities: Vec<WireRecord>,
    pub additionals: Vec<WireRecord>,
    pub edns: Option<Edns>,
}

impl Message {
    /// Decode a whole message. Any malformation maps to a FORMERR-class
    /// [SableError]; the caller still has the raw id for the error reply.
    pub fn parse(buf: &[u8]) -> Result<Message, SableError> {
        let header = Header::unpack_from(buf)?;
        let mut pos = HEADER_BYTES;

        let mut questions = vec![];
        for _ in 0..header.qdcount {
            let (question, used) = Question::from_wire(buf, pos)?;
            pos += used;
            questions.push(question);
        }

        let mut answers = vec![];
        let mut authorities = vec![];
        let mut additionals = vec![];
        let mut edns = None;

        for (section, count) in [
            (Section::Answer, header.ancount),
            (Section::Authority, header.nscount),
            (Section::Additional, header.arcount),
        ] {
            for _ in 0..count {
                let (record, used) = parse_record(buf, pos)?;
                pos += used;
                if record.rrtype == RecordType::OPT && section == Section::Additional {
                    edns = Some(Edns {
                        payload_size: record.class,
                        version: ((record.ttl >> 16) & 0xff) as u8,
                        do_bit: record.ttl & 0x8000 != 0,
                    });
                }
                match section {
                    Section::Answer => answers.push(record),
                    Section::Authority => authorities.push(record),
                    Section::Additional => additionals.push(record),
                }
            }
        }

        if pos > buf.len() {
            return Err(SableError::CountMismatch);
        }

        Ok(Message {
            header,
            questions,
            answers,
            authorities,
            additionals,
            edns,
        })
    }

    pub fn question(&self) -> Option<&Question> {
        self.questions.first()
    }

    /// The TSIG record, if the request carries one. RFC 8945 requires it to
    /// be the last record of the ADDITIONAL section.
    pub fn tsig_record(&self) -> Option<&WireRecord> {
        self.additionals
            .last()
            .filter(|r| r.rrtype == RecordType::TSIG)
    }
}

fn parse_record(buf: &[u8], offset: usize) -> Result<(WireRecord, usize), SableError> {
    let (name, name_len) = read_name(buf, offset)?;
    let fixed = offset + name_len;
    if buf.len() < fixed + 10 {
        return Err(SableError::CountMismatch);
    }
    let raw_type = u16::from_be_bytes([buf[fixed], buf[fixed + 1]]);
    let rrtype = RecordType::from(&raw_type);
    let class = u16::from_be_bytes([buf[fixed + 2], buf[fixed + 3]]);
    let ttl = u32::from_be_bytes([buf[fixed + 4], buf[fixed + 5], buf[fixed + 6], buf[fixed + 7]]);
    let rdlength = u16::from_be_bytes([buf[fixed + 8], buf[fixed + 9]]) as usize;
    let rdata_offset = fixed + 10;
    if buf.len() < rdata_offset + rdlength {
        return Err(SableError::CountMismatch);
    }
    let rdata = buf[rdata_offset..rdata_offset + rdlength].to_vec();

    // decode the embedded name for the types that carry one; pointers may
    // aim anywhere earlier in the message
    let target = match rrtype {
        RecordType::CNAME | RecordType::NS | RecordType::PTR => {
            read_name(buf, rdata_offset).ok().map(|(n, _)| n.to_lowercase())
        }
        RecordType::MX => read_name(buf, rdata_offset + 2)
            .ok()
            .map(|(n, _)| n.to_lowercase()),
        RecordType::SRV => read_name(buf, rdata_offset + 6)
            .ok()
            .map(|(n, _)| n.to_lowercase()),
        _ => None,
    };

    Ok((
        WireRecord {
            name: name.to_lowercase(),
            rrtype,
            raw_type,
            class,
            ttl,
            rdata,
            offset,
            rdata_offset,
            target,
        },
        name_len + 10 + rdlength,
    ))
}

/// A record queued for the reply encoder.
#[derive(Clone, Debug)]
pub struct ReplyRecord {
    /// Absolute owner name
    pub name: String,
    pub class: RecordClass,
    pub record: InternalResourceRecord,
}

impl ReplyRecord {
    pub fn new(name: impl Into<String>, record: InternalResourceRecord) -> Self {
        ReplyRecord {
            name: name.into(),
            class: RecordClass::Internet,
            record,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Reply {
    pub header: Header,
    pub question: Option<Question>,
    pub answers: Vec<ReplyRecord>,
    pub authorities: Vec<ReplyRecord>,
    pub additionals: Vec<ReplyRecord>,
    /// Some(size) emits an OPT advertising our payload size in the reply
    pub edns_payload: Option<u16>,
    pub do_bit: bool,
    /// Cleared by anything that makes this reply unsafe to replay
    pub cacheable: bool,
}

impl Reply {
    /// An empty reply skeleton answering `header`, with the rcode set.
    pub fn empty(header: &Header, question: Option<Question>, rcode: Rcode) -> Reply {
        let mut reply_header = header.as_answer();
        reply_header.rcode = rcode;
        reply_header.qdcount = match question {
            Some(_) => 1,
            None => 0,
        };
        Reply {
            header: reply_header,
            question,
            answers: vec![],
            authorities: vec![],
            additionals: vec![],
            edns_payload: None,
            do_bit: false,
            cacheable: false,
        }
    }

    /// Errors still produce a valid DNS reply: id and question preserved,
    /// only the rcode and counts change.
    pub fn from_error(header: &Header, question: Option<Question>, err: &SableError) -> Reply {
        trace!("building error reply: {err}");
        Reply::empty(header, question, err.rcode())
    }

    /// Encode the reply, compressing owner names, and enforce the
    /// transport's size budget. Records whose end offset exceeds the budget
    /// are dropped from the tail; losing ANSWER or AUTHORITY records sets
    /// TC, losing ADDITIONAL never does.
    pub fn as_bytes(&self, max_len: usize) -> Result<Vec<u8>, SableError> {
        let mut buf: Vec<u8> = vec![0; HEADER_BYTES];
        let mut compressor = NameCompressor::default();

        if let Some(question) = &self.question {
            compressor.write_name(&mut buf, &question.qname, true)?;
            buf.extend((question.qtype as u16).to_be_bytes());
            buf.extend((question.qclass as u16).to_be_bytes());
        }

        // (section, start offset, end offset) for the truncation walk
        let mut slots: Vec<(Section, usize, usize)> = vec![];
        for (section, records) in [
            (Section::Answer, &self.answers),
            (Section::Authority, &self.authorities),
            (Section::Additional, &self.additionals),
        ] {
            for entry in records {
                let start = buf.len();
                write_record(&mut buf, &mut compressor, entry)?;
                slots.push((section, start, buf.len()));
            }
        }

        let mut arcount_extra = 0u16;
        if let Some(payload) = self.edns_payload {
            let start = buf.len();
            write_opt(&mut buf, payload, self.do_bit);
            slots.push((Section::Additional, start, buf.len()));
            arcount_extra = 1;
        }

        let mut header = self.header.clone();
        header.qr = PacketType::Answer;
        header.qdcount = match self.question {
            Some(_) => 1,
            None => 0,
        };
        header.ancount = self.answers.len() as u16;
        header.nscount = self.authorities.len() as u16;
        header.arcount = self.additionals.len() as u16 + arcount_extra;

        if buf.len() > max_len {
            // find the first record that doesn't fit and cut there
            let cut = slots.iter().position(|(_, _, end)| *end > max_len);
            if let Some(cut) = cut {
                buf.truncate(slots[cut].1);
                for (section, _, _) in &slots[cut..] {
                    match section {
                        Section::Answer => {
                            header.ancount -= 1;
                            header.truncated = true;
                        }
                        Section::Authority => {
                            header.nscount -= 1;
                            header.truncated = true;
                        }
                        Section::Additional => header.arcount -= 1,
                    }
                }
            }
        }

        let packed = header.pack()?;
        buf[0..HEADER_BYTES].copy_from_slice(&packed);
        Ok(buf)
    }
}

fn write_record(
    buf: &mut Vec<u8>,
    compressor: &mut NameCompressor,
    entry: &ReplyRecord,
) -> Result<(), SableError> {
    compressor.write_name(buf, &entry.name, true)?;
    let rrtype = RecordType::from(&entry.record);
    buf.extend((rrtype as u16).to_be_bytes());
    buf.extend((entry.class as u16).to_be_bytes());
    buf.extend(entry.record.ttl().to_be_bytes());
    let rdlen_pos = buf.len();
    buf.extend([0u8, 0]);
    entry.record.write_rdata(buf, compressor)?;
    let rdlen = (buf.len() - rdlen_pos - 2) as u16;
    buf[rdlen_pos..rdlen_pos + 2].copy_from_slice(&rdlen.to_be_bytes());
    Ok(())
}

/// The reply-side OPT pseudo-record: root owner, our payload size where the
/// class goes, DO mirrored back if the client asked for DNSSEC.
fn write_opt(buf: &mut Vec<u8>, payload: u16, do_bit: bool) {
    buf.push(0); // root owner name
    buf.extend((RecordType::OPT as u16).to_be_bytes());
    buf.extend(payload.to_be_bytes());
    let ttl: u32 = match do_bit {
        true => 0x8000,
        false => 0,
    };
    buf.extend(ttl.to_be_bytes());
    buf.extend(0u16.to_be_bytes()); // no options
}

/// The UDP reply budget for a request: 512 unless EDNS0 advertised more,
/// capped at our configured maximum.
pub fn udp_budget(edns: Option<&Edns>, cap: usize) -> usize {
    match edns {
        Some(edns) => (edns.payload_size as usize)
            .max(crate::UDP_PAYLOAD_MIN)
            .min(cap.min(UDP_PAYLOAD_CAP)),
        None => crate::UDP_PAYLOAD_MIN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::OpCode;

    fn query_header(id: u16) -> Header {
        Header {
            id,
            opcode: OpCode::Query,
            recursion_desired: true,
            qdcount: 1,
            ..Default::default()
        }
    }

    fn a_record(name: &str, address: u32, ttl: u32) -> ReplyRecord {
        ReplyRecord::new(name, InternalResourceRecord::A { address, ttl })
    }

    #[test]
    fn test_reply_roundtrip() {
        let question = Question {
            qname: "www.example.com".to_string(),
            qtype: RecordType::A,
            qclass: RecordClass::Internet,
        };
        let mut reply = Reply::empty(&query_header(0x1234), Some(question), Rcode::NoError);
        reply.header.authoritative = true;
        reply
            .answers
            .push(a_record("www.example.com", 0xcb007105, 300));
        let bytes = reply.as_bytes(512).expect("encode failed");

        let parsed = Message::parse(&bytes).expect("reparse failed");
        let header = parsed.header.clone();
        assert_eq!(header.id, 0x1234);
        assert_eq!(header.qr, PacketType::Answer);
        assert!(header.authoritative);
        assert!(!header.truncated);
        assert_eq!(header.ancount, 1);
        assert_eq!(parsed.answers[0].name, "www.example.com");
        assert_eq!(parsed.answers[0].rdata, vec![0xcb, 0x00, 0x71, 0x05]);
        assert_eq!(parsed.answers[0].ttl, 300);
    }

    #[test]
    fn test_truncation_sets_tc_and_stays_parseable() {
        let question = Question {
            qname: "big.example.com".to_string(),
            qtype: RecordType::A,
            qclass: RecordClass::Internet,
        };
        let mut reply = Reply::empty(&query_header(7), Some(question), Rcode::NoError);
        for n in 0..60 {
            reply.answers.push(a_record("big.example.com", n, 60));
        }
        let bytes = reply.as_bytes(512).expect("encode failed");
        assert!(bytes.len() <= 512);

        let parsed = Message::parse(&bytes).expect("truncated reply must parse");
        let header = parsed.header;
        assert!(header.truncated, "dropping answers must set TC");
        assert_eq!(parsed.answers.len() as u16, header.ancount);
        assert!(header.ancount < 60);
    }

    #[test]
    fn test_dropping_additional_does_not_set_tc() {
        let question = Question {
            qname: "ns.example.com".to_string(),
            qtype: RecordType::A,
            qclass: RecordClass::Internet,
        };
        let mut reply = Reply::empty(&query_header(9), Some(question), Rcode::NoError);
        reply.answers.push(a_record("ns.example.com", 1, 60));
        for n in 0..60 {
            reply.additionals.push(a_record("glue.example.com", n, 60));
        }
        let bytes = reply.as_bytes(512).expect("encode failed");
        let parsed = Message::parse(&bytes).expect("reparse failed");
        let header = parsed.header;
        assert!(!header.truncated, "losing ADDITIONAL never sets TC");
        assert_eq!(header.ancount, 1);
        assert!(header.arcount < 60);
    }

    #[test]
    fn test_edns_parse_and_budget() {
        let question = Question {
            qname: "www.example.com".to_string(),
            qtype: RecordType::A,
            qclass: RecordClass::Internet,
        };
        let mut reply = Reply::empty(&query_header(3), Some(question), Rcode::NoError);
        reply.edns_payload = Some(1232);
        reply.do_bit = true;
        let bytes = reply.as_bytes(512).expect("encode failed");
        let parsed = Message::parse(&bytes).expect("reparse failed");
        let edns = parsed.edns.expect("no OPT found");
        assert_eq!(edns.payload_size, 1232);
        assert!(edns.do_bit);

        assert_eq!(udp_budget(None, 4096), 512);
        assert_eq!(udp_budget(Some(&edns), 4096), 1232);
        assert_eq!(
            udp_budget(
                Some(&Edns {
                    payload_size: 9000,
                    version: 0,
                    do_bit: false
                }),
                4096
            ),
            4096
        );
        assert_eq!(
            udp_budget(
                Some(&Edns {
                    payload_size: 100,
                    version: 0,
                    do_bit: false
                }),
                4096
            ),
            512
        );
    }

    #[test]
    fn test_error_reply_preserves_id_and_question() {
        let question = Question {
            qname: "oops.example.com".to_string(),
            qtype: RecordType::A,
            qclass: RecordClass::Internet,
        };
        let reply = Reply::from_error(
            &query_header(0xbeef),
            Some(question.clone()),
            &SableError::RateLimited,
        );
        let bytes = reply.as_bytes(512).expect("encode failed");
        let parsed = Message::parse(&bytes).expect("reparse failed");
        let header = parsed.header;
        assert_eq!(header.id, 0xbeef);
        assert_eq!(header.rcode, Rcode::Refused);
        assert_eq!(parsed.questions[0], question);
        assert_eq!(header.ancount, 0);
    }
}
