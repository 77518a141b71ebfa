use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::transport::Transport;

const STATUS_OK: u16 = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolResolution {
    Resolved(String),
    Unresolved,
}

impl SymbolResolution {
    pub fn url(&self) -> Option<&str> {
        match self {
            SymbolResolution::Resolved(url) => Some(url),
            SymbolResolution::Unresolved => None,
        }
    }
}

/// Finds a sprite for a category tag by probing candidate asset bases in order.
pub struct SymbolResolver {
    transport: Arc<dyn Transport>,
    sources: Vec<String>,
    cache: Mutex<HashMap<String, Arc<OnceCell<SymbolResolution>>>>,
}

impl SymbolResolver {
    pub fn new(transport: Arc<dyn Transport>, sources: Vec<String>) -> Self {
        Self {
            transport,
            sources,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn candidates(&self, object_value: &str) -> Vec<String> {
        self.sources
            .iter()
            .map(|base| format!("{}{}.svg", base, object_value))
            .collect()
    }

    /// First candidate answering HEAD with 200 wins. Errors on one
    /// candidate move on to the next. Concurrent calls for one tag share one lookup.
    pub async fn resolve(&self, object_value: &str) -> SymbolResolution {
        let cell = self.cache.lock().entry(object_value.to_string()).or_default().clone();
        cell.get_or_init(|| self.check_sources(object_value)).await.clone()
    }

    async fn check_sources(&self, object_value: &str) -> SymbolResolution {
        for url in self.candidates(object_value) {
            match self.transport.head(&url).await {
                Ok(STATUS_OK) => return SymbolResolution::Resolved(url),
                Ok(status) => debug!(%url, status, "symbol candidate missing"),
                Err(err) => debug!(%url, error = %err, "symbol lookup failed"),
            }
        }
        SymbolResolution::Unresolved
    }
}
