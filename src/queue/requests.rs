//! Shared queue of pending matchmaking requests

use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{MatchmakingError, Result};
use crate::metrics::MetricsCollector;
use crate::store::StoreBackend;
use crate::types::{ClientOptions, MatchMethod, MatchRequest, RequestId};

/// Append-only request queue drained in full by the scheduler
pub struct RequestQueue {
    store: Arc<dyn StoreBackend>,
    queue_key: String,
    metrics: Option<Arc<MetricsCollector>>,
}

impl RequestQueue {
    pub fn new(store: Arc<dyn StoreBackend>, queue_key: impl Into<String>) -> Self {
        Self {
            store,
            queue_key: queue_key.into(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn queue_key(&self) -> &str {
        &self.queue_key
    }

    /// Append a request; returns as soon as it is stored
    pub async fn enqueue(&self, request: &MatchRequest) -> Result<RequestId> {
        let payload = serde_json::to_string(request).map_err(|e| MatchmakingError::Serialization {
            message: format!("failed to encode request {}: {}", request.request_id, e),
        })?;
        self.store.push(&self.queue_key, payload).await?;

        if let Some(metrics) = &self.metrics {
            metrics.record_enqueued(request.method.as_str());
        }
        debug!(
            "Enqueued {} request {} for '{}'",
            request.method, request.request_id, request.room_name_or_id
        );
        Ok(request.request_id.clone())
    }

    /// Build and enqueue a request with a fresh id
    pub async fn submit(
        &self,
        method: MatchMethod,
        room_name_or_id: &str,
        client_options: ClientOptions,
        auth_options: Option<serde_json::Value>,
    ) -> Result<RequestId> {
        let request = MatchRequest::new(method, room_name_or_id, client_options, auth_options);
        self.enqueue(&request).await
    }

    /// Atomically take every pending request in enqueue order
    ///
    /// Entries that cannot be decoded are logged and dropped.
    pub async fn drain(&self) -> Result<Vec<MatchRequest>> {
        let payloads = self.store.drain(&self.queue_key).await?;
        let mut requests = Vec::with_capacity(payloads.len());

        for payload in payloads {
            match serde_json::from_str::<MatchRequest>(&payload) {
                Ok(request) => requests.push(request),
                Err(e) => warn!("Dropping malformed queued request: {}", e),
            }
        }

        if !requests.is_empty() {
            debug!("Drained {} requests from {}", requests.len(), self.queue_key);
        }
        Ok(requests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_drain_is_fifo_and_clears() {
        let queue = RequestQueue::new(Arc::new(MemoryStore::new()), "q");

        let first = queue
            .submit(MatchMethod::Join, "arena", ClientOptions::new(), None)
            .await
            .unwrap();
        let second = queue
            .submit(MatchMethod::JoinOrCreate, "arena", ClientOptions::new(), None)
            .await
            .unwrap();

        let drained = queue.drain().await.unwrap();
        let ids: Vec<_> = drained.iter().map(|r| r.request_id.clone()).collect();
        assert_eq!(ids, vec![first, second]);
        assert!(queue.drain().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drain_skips_malformed_entries() {
        let store = Arc::new(MemoryStore::new());
        let queue = RequestQueue::new(store.clone(), "q");

        store.push("q", "not json".to_string()).await.unwrap();
        queue
            .submit(MatchMethod::Join, "arena", ClientOptions::new(), None)
            .await
            .unwrap();

        assert_eq!(queue.drain().await.unwrap().len(), 1);
    }
}
