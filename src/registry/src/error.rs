use crate::catalog::CatalogError;

/// Errors returned by registry operations or reported to an [`ErrorSink`].
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Invalid event key: {0}")]
    InvalidEventKey(String),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Watch requires a Tokio runtime: {0}")]
    NoRuntime(String),
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Receives failures that happen after the call that caused them has returned,
/// such as a watch loop losing its catalog connection.
pub trait ErrorSink: Send + Sync {
    fn report(&self, error: RegistryError);
}

impl<F> ErrorSink for F
where
    F: Fn(RegistryError) + Send + Sync,
{
    fn report(&self, error: RegistryError) {
        self(error)
    }
}

/// Logs reported errors at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn report(&self, error: RegistryError) {
        log::error!("Service registry background failure: {error}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_closure_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            move |err: RegistryError| seen.lock().unwrap().push(err.to_string())
        };

        sink.report(RegistryError::InvalidEventKey("empty".into()));
        sink.report(CatalogError::Unavailable.into());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], "Invalid event key: empty");
        assert!(seen[1].starts_with("Catalog error:"));
    }
}
