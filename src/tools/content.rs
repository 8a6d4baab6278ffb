//! Per-session store of fetched and rendered pages.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

/// How a stored page was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSource {
    Fetched,
    Rendered,
}

impl std::fmt::Display for PageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fetched => write!(f, "fetched"),
            Self::Rendered => write!(f, "rendered"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredPage {
    pub url: String,
    pub html: String,
    pub source: PageSource,
}

/// Raw HTML keyed by content id, so extraction can run on the full page while
/// the transcript only carries cleaned, truncated text.
#[derive(Debug, Clone, Default)]
pub struct ContentStore {
    pages: Arc<RwLock<HashMap<Uuid, StoredPage>>>,
}

impl ContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a page and return its content id.
    pub async fn insert(&self, page: StoredPage) -> Uuid {
        let id = Uuid::new_v4();
        self.pages.write().await.insert(id, page);
        id
    }

    /// Look up a page by the id string the model echoes back.
    pub async fn get(&self, id: &str) -> Option<StoredPage> {
        let id = Uuid::parse_str(id.trim()).ok()?;
        self.pages.read().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.pages.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pages.read().await.is_empty()
    }
}
