use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static IDENTIFICATION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Portable handle for a server-side prepared statement.
///
/// A handle is only text plus a stable identifier; nothing is prepared until
/// the first `exec` on each driver, where the identifier keys a per-connection
/// prepared set. Handles are cheap to clone and can be stored as
/// program-lifetime constants.
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    query: Arc<str>,
    identification: Arc<str>,
}

impl PreparedQuery {
    /// Creates a handle with an auto-generated identifier
    /// (`asql_<hex>`, process-wide monotonic).
    pub fn new(query: impl Into<Arc<str>>) -> Self {
        let n = IDENTIFICATION_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
        Self {
            query: query.into(),
            identification: format!("asql_{n:x}").into(),
        }
    }

    /// Creates a handle with a caller-supplied identifier.
    pub fn with_identification(
        query: impl Into<Arc<str>>,
        identification: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            query: query.into(),
            identification: identification.into(),
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn identification(&self) -> &str {
        &self.identification
    }
}
