use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors are `Clone` so a single failure can be handed to every party
/// observing a closed pipe or a repeated join.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Pipe error: {0}")]
    Pipe(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Export error: {0}")]
    Export(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(Arc<serde_json::Error>),

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Generic error: {0}")]
    Generic(Arc<anyhow::Error>),

    #[error("{}", MultiDisplay(.0))]
    Multiple(Vec<Error>),
}

struct MultiDisplay<'a>(&'a [Error]);

impl fmt::Display for MultiDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl Error {
    /// Merge two errors into one, flattening nested `Multiple`s.
    pub fn combine(self, other: Error) -> Error {
        let mut errors = self.into_vec();
        errors.extend(other.into_vec());
        Error::Multiple(errors)
    }

    /// Merge an optional accumulated error with a new result.
    pub fn combine_opt(acc: Option<Error>, next: Result<()>) -> Option<Error> {
        match (acc, next) {
            (acc, Ok(())) => acc,
            (None, Err(e)) => Some(e),
            (Some(a), Err(e)) => Some(a.combine(e)),
        }
    }

    /// Combine every error, dropping repeats of the same message. A single
    /// survivor is returned as is.
    pub fn combine_all(errors: impl IntoIterator<Item = Error>) -> Option<Error> {
        let mut seen = Vec::<String>::new();
        let mut unique = Vec::new();
        for err in errors.into_iter().flat_map(Error::into_vec) {
            let msg = err.to_string();
            if !seen.contains(&msg) {
                seen.push(msg);
                unique.push(err);
            }
        }
        match unique.len() {
            0 => None,
            1 => unique.pop(),
            _ => Some(Error::Multiple(unique)),
        }
    }

    /// Flatten into the list of leaf errors.
    pub fn into_vec(self) -> Vec<Error> {
        match self {
            Error::Multiple(errors) => errors.into_iter().flat_map(Error::into_vec).collect(),
            other => vec![other],
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(Arc::new(e))
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Generic(Arc::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_flattens() {
        let a = Error::Export("export read failed".to_string());
        let b = Error::Pipe("pipe closed with error".to_string());
        let c = Error::Storage("upload failed".to_string());

        let combined = a.combine(b).combine(c);
        match &combined {
            Error::Multiple(errors) => assert_eq!(errors.len(), 3),
            other => panic!("expected Multiple, got {:?}", other),
        }

        let msg = combined.to_string();
        assert!(msg.contains("export read failed"));
        assert!(msg.contains("pipe closed with error"));
        assert!(msg.contains("upload failed"));
    }

    #[test]
    fn test_combine_all_deduplicates() {
        let upload = Error::Storage("upload failed".to_string());
        let combined = Error::combine_all(vec![
            upload.clone(),
            Error::Export("export read failed".to_string()).combine(upload.clone()),
        ])
        .unwrap();
        assert_eq!(combined.into_vec().len(), 2);

        let single = Error::combine_all(vec![upload.clone(), upload]).unwrap();
        assert!(matches!(single, Error::Storage(_)));

        assert!(Error::combine_all(Vec::new()).is_none());
    }

    #[test]
    fn test_combine_opt() {
        assert!(Error::combine_opt(None, Ok(())).is_none());

        let acc = Error::combine_opt(None, Err(Error::Cancelled));
        assert!(matches!(acc, Some(Error::Cancelled)));

        let acc = Error::combine_opt(acc, Err(Error::Pipe("closed".to_string())));
        assert_eq!(acc.map(|e| e.into_vec().len()), Some(2));
    }
}
