use thiserror::Error;

/// 统一错误类型
#[derive(Debug, Error)]
pub enum QhmmError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("dimension mismatch: expected {expected}, got {actual} ({context})")]
    DimensionMismatch {
        expected: usize,
        actual: usize,
        context: String,
    },

    #[error("row {row} of the {matrix} matrix is not a probability distribution (sum = {sum})")]
    NotStochastic {
        matrix: &'static str,
        row: usize,
        sum: f64,
    },

    #[error("parameter x[{index}] is unbound (only {available} values supplied)")]
    UnboundParameter { index: usize, available: usize },

    #[error("circuit is not unitary: {0}")]
    NonUnitary(String),

    #[error("qubit {index} out of range for a {width}-qubit register")]
    QubitOutOfRange { index: usize, width: usize },

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, QhmmError>;

impl QhmmError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        QhmmError::InvalidArgument(msg.into())
    }
}
