use crate::AttributeKind;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("malformed attribute: {0}")]
    MalformedAttribute(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("attribute {0} cannot be used in a filter")]
    UnsupportedFilterAttribute(AttributeKind),

    #[error("invalid filter entry for {kind}: {reason}")]
    InvalidFilterEntry {
        kind: AttributeKind,
        reason: String,
    },

    #[error("attribute {kind} must be {expected} bytes, got {actual}")]
    InvalidAttributeLength {
        kind: AttributeKind,
        expected: usize,
        actual: usize,
    },

    #[error("reply is too short, want {want} bytes but got {got}")]
    TruncatedReply { want: usize, got: usize },

    #[error("kernel reported error {code}: {}", os_error(.code))]
    KernelReported { code: i32 },

    #[error("filter program has {0} instructions, the kernel accepts at most 4096")]
    ProgramTooLarge(usize),

    #[error("filter jump of {0} instructions does not fit in a conditional branch")]
    JumpOutOfRange(usize),

    #[error("{0}")]
    InvalidValue(String),
}

fn os_error(code: &i32) -> std::io::Error {
    std::io::Error::from_raw_os_error(code.saturating_neg())
}

impl Error {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedAttribute(msg.into())
    }

    /// The errno reported by the kernel, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::KernelReported { code } => Some(code.saturating_neg()),
            _ => None,
        }
    }
}
