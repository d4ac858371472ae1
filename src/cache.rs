use crate::aggregate::AggregateView;
use crate::error::PortalError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument};

pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(5 * 60);

/// Anything that can produce a fresh view of meter usage.
#[async_trait]
pub trait UsageSource: Send + Sync {
    async fn fetch(&self) -> Result<AggregateView, PortalError>;
}

struct CacheEntry {
    view: Arc<AggregateView>,
    fetched_at: Instant,
}

/// Serves the last successful view until it is older than `freshness`.
///
/// The lock is held across the whole check-and-refresh, so at most one
/// refresh runs per cache and callers arriving meanwhile get its result.
/// A failed refresh empties the cache.
pub struct UsageCache<S> {
    source: S,
    freshness: Duration,
    entry: Mutex<Option<CacheEntry>>,
}

impl<S: UsageSource> UsageCache<S> {
    pub fn new(source: S) -> Self {
        Self::with_freshness(source, DEFAULT_FRESHNESS)
    }

    pub fn with_freshness(source: S, freshness: Duration) -> Self {
        Self {
            source,
            freshness,
            entry: Mutex::new(None),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn freshness(&self) -> Duration {
        self.freshness
    }

    #[instrument(skip(self))]
    pub async fn fetch(&self) -> Result<Arc<AggregateView>, PortalError> {
        let mut entry = self.entry.lock().await;

        if let Some(cached) = entry.as_ref() {
            if cached.fetched_at.elapsed() <= self.freshness {
                debug!("serving cached usage");
                return Ok(Arc::clone(&cached.view));
            }
        }

        match self.source.fetch().await {
            Ok(view) => {
                let view = Arc::new(view);
                *entry = Some(CacheEntry {
                    view: Arc::clone(&view),
                    fetched_at: Instant::now(),
                });
                info!(readings = view.len(), "usage cache refreshed");
                Ok(view)
            }
            Err(err) => {
                *entry = None;
                error!(error = %err, "error fetching usage");
                Err(err)
            }
        }
    }

    pub async fn invalidate(&self) {
        *self.entry.lock().await = None;
    }

    pub async fn fetched_at(&self) -> Option<Instant> {
        self.entry.lock().await.as_ref().map(|e| e.fetched_at)
    }
}
