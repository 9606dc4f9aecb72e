//! Fatal errors.
//!
//! Nothing in this layer is recoverable: every error here means either a broken build (the two
//! sides of the bridge disagree about an ABI detail), or generated code violating a contract. We
//! log and abort.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FatalError {
    #[error("metadata unavailable for {0}")]
    MetadataUnavailable(String),

    #[error("invalid metadata request {0:#x}")]
    InvalidRequest(usize),

    #[error("value witness table of {0} failed authentication")]
    WitnessAuth(String),

    #[error("{0} has no enum witnesses")]
    NotAnEnum(String),

    #[error("{ty} has no generic argument {index}")]
    MissingGenericArgument {
        ty: String,
        index: usize,
    },

    #[error("projected payload out of payload-less case `{case}` of {ty}")]
    ProjectWithoutPayload {
        ty: String,
        case: String,
    },

    #[error("invalid enum tag {tag} for {ty}")]
    InvalidTag {
        ty: String,
        tag: u32,
    },

    #[error("cell of {0} destroyed while not live")]
    DoubleDestroy(String),

    #[error("cell of {0} used while not live")]
    UseAfterConsume(String),

    #[error("unknown symbol {0}")]
    UnknownSymbol(String),

    #[error("symbol {0} registered twice")]
    DuplicateSymbol(String),

    #[error("signature mismatch calling {symbol}: {detail}")]
    SignatureMismatch {
        symbol: String,
        detail: String,
    },

    #[error("layout of {ty} disagrees with its metadata: expected {expected}, got {got}")]
    LayoutMismatch {
        ty: String,
        expected: String,
        got: String,
    },

    #[error("arithmetic overflow in {0}")]
    Overflow(&'static str),
}

/// Logs the error and aborts the process.
#[cold]
pub fn fatal(err: impl Into<FatalError>) -> ! {
    let err = err.into();
    log::error!("fatal: {}", err);
    eprintln!("fatal error: {}", err);
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        let err = FatalError::ProjectWithoutPayload { ty: "GenericOpt<u16>".into(), case: "none".into() };
        assert_eq!(err.to_string(),
                   "projected payload out of payload-less case `none` of GenericOpt<u16>");

        assert_eq!(FatalError::InvalidRequest(0x42).to_string(),
                   "invalid metadata request 0x42");
    }
}
