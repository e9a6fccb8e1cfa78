use std::path::PathBuf;
use thiserror::Error;

/// Builds an [`Error::MalformedBinary`] with no origin attached yet.
///
/// The origin (the `.smali` file or unit the problem was found in) is filled in
/// by [`Error::with_origin`] once the reader knows it.
macro_rules! malformed {
    ($msg:literal) => {
        $crate::error::Error::MalformedBinary {
            message: $msg.to_string(),
            origin: None,
        }
    };
    ($fmtstr:literal, $($args:tt)*) => {
        $crate::error::Error::MalformedBinary {
            message: format!($fmtstr, $($args)*),
            origin: None,
        }
    };
}

/// Early return with a [`Error::MalformedBinary`].
macro_rules! fail {
    ($($args:tt)*) => {
        return Err(malformed!($($args)*))
    };
}

/// Errors raised by the index, the locator and the resolver.
///
/// An argument value that cannot be traced is *not* an error: see
/// [`ResolvedValue::Unresolved`](crate::resolver::ResolvedValue::Unresolved).
#[derive(Error, Debug)]
pub enum Error {
    /// The disassembly is not a well-formed unit. Aborts the whole index build.
    #[error("malformed binary{}: {message}", origin_suffix(.origin))]
    MalformedBinary {
        message: String,
        origin: Option<String>,
    },

    /// A class or method pattern could not be compiled. Only the failing query is affected.
    #[error("invalid pattern `{pattern}`: {message}")]
    Pattern { pattern: String, message: String },

    /// A configuration document could not be read.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn origin_suffix(origin: &Option<String>) -> String {
    match origin {
        Some(o) => format!(" in {o}"),
        None => String::new(),
    }
}

impl Error {
    /// Attaches an origin to a `MalformedBinary` error that does not have one yet.
    pub(crate) fn with_origin(self, o: &str) -> Self {
        match self {
            Error::MalformedBinary {
                message,
                origin: None,
            } => Error::MalformedBinary {
                message,
                origin: Some(o.to_string()),
            },
            e => e,
        }
    }

    pub(crate) fn pattern(pattern: &str, message: impl ToString) -> Self {
        Error::Pattern {
            pattern: pattern.to_string(),
            message: message.to_string(),
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Error::MalformedBinary { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_display_carries_origin() {
        let e = malformed!("label :cond_0 is never defined").with_origin("Lcom/a/B;");
        assert_eq!(
            e.to_string(),
            "malformed binary in Lcom/a/B;: label :cond_0 is never defined"
        );

        // A second origin never overwrites the first one
        let e = e.with_origin("other");
        assert!(e.to_string().contains("Lcom/a/B;"));
        assert!(e.is_malformed());
    }

    #[test]
    fn pattern_display() {
        let e = Error::pattern("Lcom/(", "unclosed group");
        assert_eq!(e.to_string(), "invalid pattern `Lcom/(`: unclosed group");
        assert!(!e.is_malformed());
    }
}
