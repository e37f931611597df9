use thiserror::Error;

/// Synchronous misuse errors surfaced directly to callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Timeframe string not recognised.
    #[error("unknown timeframe: {0}")]
    UnknownTimeframe(String),

    /// Tier string not recognised.
    #[error("unknown storage tier: {0}")]
    UnknownTier(String),

    /// Subscribe/unsubscribe called with no symbols.
    #[error("symbol list must not be empty")]
    EmptySymbols,

    /// Symbol is blank or contains the key separator.
    #[error("invalid symbol: {0:?}")]
    InvalidSymbol(String),

    /// Configuration value out of range.
    #[error("invalid configuration: {field} {reason}")]
    Config {
        /// Dotted path of the offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl ValidationError {
    pub fn config(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Config {
            field,
            reason: reason.into(),
        }
    }
}

/// Checks a symbol list for subscribe/unsubscribe calls.
///
/// # Errors
/// Returns an error if the list is empty or any symbol is blank or contains `:`.
pub fn validate_symbols(symbols: &[String]) -> Result<(), ValidationError> {
    if symbols.is_empty() {
        return Err(ValidationError::EmptySymbols);
    }
    for symbol in symbols {
        if symbol.trim().is_empty() || symbol.contains(':') {
            return Err(ValidationError::InvalidSymbol(symbol.clone()));
        }
    }
    Ok(())
}
