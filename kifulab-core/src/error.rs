use std::fmt;

/// Errors from SFEN parsing and USI move application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SfenError {
    /// SFEN text did not parse
    Malformed(String),

    /// USI move text did not parse
    InvalidMove(String),

    /// Move text parsed but cannot be applied to the position
    IllegalMove(String),
}

impl fmt::Display for SfenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SfenError::Malformed(msg) => write!(f, "malformed SFEN: {}", msg),
            SfenError::InvalidMove(msg) => write!(f, "invalid USI move: {}", msg),
            SfenError::IllegalMove(msg) => write!(f, "illegal move: {}", msg),
        }
    }
}

impl std::error::Error for SfenError {}

/// Errors from game tree operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    /// Referenced node id does not exist in this game
    UnknownNode(String),

    /// reorder_children input is not a permutation of the current children
    BadPermutation(String),

    /// play_move was rejected by SFEN application
    InvalidMove(SfenError),

    /// parent chain does not terminate at the root
    CycleDetected(String),
}

impl fmt::Display for TreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TreeError::UnknownNode(id) => write!(f, "node not found: {}", id),
            TreeError::BadPermutation(msg) => write!(f, "bad permutation: {}", msg),
            TreeError::InvalidMove(err) => write!(f, "invalid move: {}", err),
            TreeError::CycleDetected(id) => write!(f, "cycle detected at node: {}", id),
        }
    }
}

impl std::error::Error for TreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TreeError::InvalidMove(err) => Some(err),
            _ => None,
        }
    }
}

impl From<SfenError> for TreeError {
    fn from(err: SfenError) -> Self {
        TreeError::InvalidMove(err)
    }
}

/// Errors from kifu text parsing and emission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Input text could not be parsed; `line` is 1-based where known
    Malformed {
        line: Option<usize>,
        message: String,
    },

    /// Requested format tag is not registered
    UnsupportedFormat(String),
}

impl CodecError {
    pub fn malformed(message: impl Into<String>) -> Self {
        CodecError::Malformed {
            line: None,
            message: message.into(),
        }
    }

    pub fn at_line(line: usize, message: impl Into<String>) -> Self {
        CodecError::Malformed {
            line: Some(line),
            message: message.into(),
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Malformed { line: Some(n), message } => {
                write!(f, "line {}: {}", n, message)
            }
            CodecError::Malformed { line: None, message } => write!(f, "{}", message),
            CodecError::UnsupportedFormat(tag) => write!(f, "unsupported format: {}", tag),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<SfenError> for CodecError {
    fn from(err: SfenError) -> Self {
        CodecError::malformed(err.to_string())
    }
}

impl From<TreeError> for CodecError {
    fn from(err: TreeError) -> Self {
        CodecError::malformed(err.to_string())
    }
}
