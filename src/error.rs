use std::fmt;

/// Failure of a single provider call or of a whole fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchError {
    /// Network/HTTP failure or an empty/missing payload. Retried.
    Transient(String),
    /// Retries exhausted; the asset is skipped by the caller.
    Exhausted { attempts: usize, last: String },
    /// The request could not be built. Never retried.
    InvalidRequest(String),
}

impl FetchError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Transient(msg) => write!(f, "transient fetch error: {msg}"),
            FetchError::Exhausted { attempts, last } => {
                write!(f, "fetch failed after {attempts} attempts: {last}")
            }
            FetchError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
        }
    }
}

impl std::error::Error for FetchError {}

/// Degenerate input to the beta regression.
#[derive(Debug, Clone, PartialEq)]
pub enum RegressionError {
    /// Benchmark returns are constant, slope is undefined.
    ZeroVariance,
    /// Fewer than two return observations after alignment.
    TooFewReturns(usize),
    /// A return or the fitted slope is NaN or infinite, e.g. after a zero price.
    NonFinite,
}

impl fmt::Display for RegressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegressionError::ZeroVariance => {
                write!(f, "benchmark returns have zero variance")
            }
            RegressionError::TooFewReturns(n) => {
                write!(f, "need at least 2 aligned returns, got {n}")
            }
            RegressionError::NonFinite => write!(f, "non-finite returns (zero or missing price)"),
        }
    }
}

impl std::error::Error for RegressionError {}
