use std::io;

/// Errors surfaced to the caller of test generation.
///
/// Per-goal analysis failures are not errors: they are logged and recorded as
/// unsound runs. Broken graph invariants are panics.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid option '{key}': {message}")]
    InvalidOption { key: String, message: String },

    #[error("invalid automaton: {0}")]
    InvalidAutomaton(String),

    #[error("cannot compose analysis: {0}")]
    Composition(String),

    #[error("analysis engine failed: {0}")]
    Engine(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Format(#[from] std::fmt::Error),
}

impl Error {
    pub fn invalid_option(key: &str, message: impl Into<String>) -> Self {
        Error::InvalidOption {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e = Error::invalid_option("retryOrder", "unknown value 'sideways'");
        assert_eq!(e.to_string(), "invalid option 'retryOrder': unknown value 'sideways'");

        let e: Error = io::Error::new(io::ErrorKind::NotFound, "missing").into();
        assert_eq!(e.to_string(), "missing");
    }
}
