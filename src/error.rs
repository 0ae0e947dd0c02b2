use crate::enums::Rcode;
use packed_struct::PackingError;
use thiserror::Error;

/// When things go awry. Every variant that can surface to a client maps onto
/// an RCODE through [SableError::rcode]; the reply keeps the client's id and
/// question and only the counts change.
#[derive(Debug, Error)]
pub enum SableError {
    // FORMERR family
    #[error("Invalid header: {0}")]
    InvalidHeader(String),
    #[error("Invalid name: {0}")]
    InvalidName(String),
    #[error("Compression pointer loop or bad pointer")]
    CompressionLoop,
    #[error("More than one question in query")]
    MultipleQuestions,
    #[error("Section count does not match message body")]
    CountMismatch,
    #[error("Malformed transfer request: {0}")]
    MalformedTransfer(String),

    // SERVFAIL family
    #[error("CNAME chain longer than the configured limit")]
    CnameLoop,
    #[error("Timed out waiting for upstream")]
    Timeout,
    #[error("Store error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Byte packing error: {0}")]
    BytePacking(String),
    #[error("Failed to send across a channel: {0}")]
    Send(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // REFUSED family
    #[error("Not authoritative for the queried name")]
    NoAuthority,
    #[error("Recursion not permitted for this client")]
    ForwardDenied,
    #[error("Client exceeded the query rate limit")]
    RateLimited,
    #[error("Access control denied the request")]
    AclDenied,

    // NOTIMP
    #[error("Opcode {0} is not implemented")]
    OpcodeNotImplemented(u8),
    #[error("Record type not implemented")]
    TypeNotImplemented,

    // NOTAUTH (TSIG)
    #[error("TSIG key {0} is not known here")]
    TsigBadKey(String),
    #[error("TSIG time outside the fudge window")]
    TsigBadTime,
    #[error("TSIG signature did not verify")]
    TsigBadSignature,

    // start-up / plumbing; these never turn into DNS replies
    #[error("Something failed during startup: {0}")]
    Startup(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SableError {
    /// The RCODE a client sees for this failure.
    pub fn rcode(&self) -> Rcode {
        match self {
            SableError::InvalidHeader(_)
            | SableError::InvalidName(_)
            | SableError::CompressionLoop
            | SableError::MultipleQuestions
            | SableError::CountMismatch
            | SableError::MalformedTransfer(_) => Rcode::FormatError,

            SableError::CnameLoop
            | SableError::Timeout
            | SableError::Sqlx(_)
            | SableError::BytePacking(_)
            | SableError::Send(_)
            | SableError::Io(_) => Rcode::ServFail,

            SableError::NoAuthority
            | SableError::ForwardDenied
            | SableError::RateLimited
            | SableError::AclDenied => Rcode::Refused,

            SableError::OpcodeNotImplemented(_) | SableError::TypeNotImplemented => {
                Rcode::NotImplemented
            }

            SableError::TsigBadKey(_) | SableError::TsigBadTime | SableError::TsigBadSignature => {
                Rcode::NotAuth
            }

            SableError::Startup(_) | SableError::InvalidAddress(_) | SableError::Config(_) => {
                Rcode::ServFail
            }
        }
    }
}

impl From<PackingError> for SableError {
    fn from(error: PackingError) -> Self {
        SableError::BytePacking(error.to_string())
    }
}

impl From<std::str::Utf8Error> for SableError {
    fn from(error: std::str::Utf8Error) -> Self {
        SableError::InvalidName(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rcode_mapping() {
        assert_eq!(SableError::MultipleQuestions.rcode(), Rcode::FormatError);
        assert_eq!(SableError::Timeout.rcode(), Rcode::ServFail);
        assert_eq!(SableError::RateLimited.rcode(), Rcode::Refused);
        assert_eq!(SableError::OpcodeNotImplemented(6).rcode(), Rcode::NotImplemented);
        assert_eq!(SableError::TsigBadTime.rcode(), Rcode::NotAuth);
    }
}
