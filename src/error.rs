use thiserror::Error;

/// Failures surfaced at the codec boundary.
///
/// Tier-1 and the DWT cannot fail on valid inputs; when one of their
/// invariants breaks anyway (encoder/decoder divergence, out-of-range
/// context state) the violation is reported as [`Error::Internal`] with a
/// location tag rather than recovered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Configuration outside the permissible range or self-inconsistent.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// Invalid marker sequence, inconsistent length field, or a
    /// bit-stuffing violation inside packet data.
    #[error("malformed bytestream: {0}")]
    MalformedBytestream(&'static str),

    /// The codestream requires a capability this decoder does not provide.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(&'static str),

    /// End of stream reached before a required marker or payload completed.
    #[error("truncated input: {0}")]
    TruncatedInput(&'static str),

    /// The caller-configured memory budget would be exceeded.
    #[error("memory limit exceeded: need {needed} bytes, limit {limit}")]
    MemoryLimitExceeded { needed: usize, limit: usize },

    /// The caller's cancellation token was observed.
    #[error("operation cancelled")]
    OperationCancelled,

    /// An internal invariant was violated; not recoverable.
    #[error("internal error at {0}")]
    Internal(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
