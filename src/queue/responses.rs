//! Per-request response correlation
//!
//! One dispatcher task consumes every notification under the response
//! topic prefix and completes the pending entry keyed by request id. When
//! the subscription ends every waiter is failed and new registrations are
//! refused.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::error::{storage, ErrorKind, MatchmakingError, Result};
use crate::metrics::MetricsCollector;
use crate::store::StoreBackend;
use crate::types::{MatchOutcome, MatchResponse, RequestId};

/// Fixed deadline for a queued request to be answered
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(15);

type PendingTable = Arc<Mutex<HashMap<RequestId, oneshot::Sender<MatchOutcome>>>>;

fn lock_pending(
    pending: &PendingTable,
) -> Result<MutexGuard<'_, HashMap<RequestId, oneshot::Sender<MatchOutcome>>>> {
    pending.lock().map_err(|_| {
        MatchmakingError::InternalError {
            message: "Failed to acquire pending responses lock".to_string(),
        }
        .into()
    })
}

pub struct ResponseChannel {
    store: Arc<dyn StoreBackend>,
    topic_prefix: String,
    timeout: Duration,
    pending: PendingTable,
    /// Set under the pending lock once the dispatcher stops
    closed: Arc<AtomicBool>,
    dispatcher: JoinHandle<()>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl ResponseChannel {
    /// Subscribe to the response topics and start the dispatcher
    pub async fn new(store: Arc<dyn StoreBackend>, topic_prefix: impl Into<String>) -> Result<Self> {
        let topic_prefix = topic_prefix.into();
        let subscription = format!("{}:", topic_prefix);
        let mut notifications = store.subscribe_prefix(&subscription).await?;
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let table = pending.clone();
        let closed_flag = closed.clone();
        let dispatcher = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let Some(request_id) = notification.topic.strip_prefix(&subscription) else {
                    continue;
                };

                let outcome = serde_json::from_str::<MatchOutcome>(&notification.payload)
                    .unwrap_or_else(|e| MatchOutcome::Failure {
                        kind: ErrorKind::Serialization,
                        message: format!("unreadable response payload: {}", e),
                    });

                let sender = match lock_pending(&table) {
                    Ok(mut pending) => pending.remove(request_id),
                    Err(e) => {
                        warn!("Dropping response for {}: {}", request_id, e);
                        continue;
                    }
                };

                match sender {
                    Some(sender) => {
                        if sender.send(outcome).is_err() {
                            debug!("Waiter for {} went away before its response", request_id);
                        }
                    }
                    // answered by another node's waiter, or already timed out
                    None => debug!("No local waiter for response {}", request_id),
                }
            }
            fail_pending(&table, &closed_flag);
        });

        Ok(Self {
            store,
            topic_prefix,
            timeout: RESPONSE_TIMEOUT,
            pending,
            closed,
            dispatcher,
            metrics: None,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn topic_for(&self, request_id: &str) -> String {
        format!("{}:{}", self.topic_prefix, request_id)
    }

    /// Create the pending completion for a request
    ///
    /// Must be called before the request is enqueued so a fast response is
    /// never missed.
    pub fn register(&self, request_id: &str) -> Result<PendingResponse> {
        let (sender, receiver) = oneshot::channel();
        let pending_count = {
            let mut pending = lock_pending(&self.pending)?;
            if self.closed.load(Ordering::SeqCst) {
                return Err(storage(format!(
                    "response subscription for {} is closed",
                    self.topic_prefix
                )));
            }
            pending.insert(request_id.to_string(), sender);
            pending.len()
        };
        if let Some(metrics) = &self.metrics {
            metrics.set_pending_responses(pending_count);
        }

        Ok(PendingResponse {
            request_id: request_id.to_string(),
            receiver,
            pending: self.pending.clone(),
            timeout: self.timeout,
            metrics: self.metrics.clone(),
        })
    }

    /// Deliver the outcome of a request to whichever node awaits it
    pub async fn publish(&self, request_id: &str, outcome: &MatchOutcome) -> Result<()> {
        let payload = serde_json::to_string(outcome).map_err(|e| MatchmakingError::Serialization {
            message: format!("failed to encode response for {}: {}", request_id, e),
        })?;
        self.store.publish(&self.topic_for(request_id), payload).await
    }

    pub fn pending_count(&self) -> Result<usize> {
        Ok(lock_pending(&self.pending)?.len())
    }

    /// Whether responses are still being delivered
    pub fn is_active(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

/// Refuse further registrations and fail everyone still waiting
fn fail_pending(table: &PendingTable, closed: &AtomicBool) {
    let waiters: Vec<_> = match table.lock() {
        Ok(mut pending) => {
            closed.store(true, Ordering::SeqCst);
            pending.drain().collect()
        }
        Err(_) => {
            closed.store(true, Ordering::SeqCst);
            Vec::new()
        }
    };

    warn!(
        "Response subscription closed, failing {} waiting requests",
        waiters.len()
    );
    for (request_id, sender) in waiters {
        let outcome = MatchOutcome::Failure {
            kind: ErrorKind::Storage,
            message: format!("response subscription closed before {} was answered", request_id),
        };
        if sender.send(outcome).is_err() {
            debug!("Waiter for {} went away before its response", request_id);
        }
    }
}

impl Drop for ResponseChannel {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

/// A caller suspended on one request's outcome
pub struct PendingResponse {
    request_id: RequestId,
    receiver: oneshot::Receiver<MatchOutcome>,
    pending: PendingTable,
    timeout: Duration,
    metrics: Option<Arc<MetricsCollector>>,
}

impl PendingResponse {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the outcome; fails with `Timeout` once the deadline passes
    pub async fn wait(mut self) -> Result<MatchResponse> {
        match tokio::time::timeout(self.timeout, &mut self.receiver).await {
            Ok(Ok(outcome)) => outcome.into_result(),
            Ok(Err(_)) => Err(MatchmakingError::InternalError {
                message: format!("response channel for {} closed", self.request_id),
            }
            .into()),
            Err(_) => {
                warn!(
                    "Request {} unanswered after {}s",
                    self.request_id,
                    self.timeout.as_secs()
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_response_timeout();
                }
                Err(MatchmakingError::Timeout {
                    request_id: self.request_id.clone(),
                    seconds: self.timeout.as_secs(),
                }
                .into())
            }
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.request_id);
            if let Some(metrics) = &self.metrics {
                metrics.set_pending_responses(pending.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, MockStoreBackend, Notification, NotificationStream};
    use crate::types::{ConnectionSettings, ResolvedMethod};
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    fn response() -> MatchResponse {
        MatchResponse {
            method: ResolvedMethod::Join,
            room_name: "arena".to_string(),
            room_id: "r1".to_string(),
            process_id: "p1".to_string(),
            options: Default::default(),
            settings: ConnectionSettings {
                hostname: "localhost".to_string(),
                secure: false,
                pathname: String::new(),
                port: Some(2567),
            },
        }
    }

    #[tokio::test]
    async fn test_publish_completes_waiter() {
        let channel = ResponseChannel::new(Arc::new(MemoryStore::new()), "matches")
            .await
            .unwrap();

        let pending = channel.register("req1").unwrap();
        channel
            .publish("req1", &MatchOutcome::Success(response()))
            .await
            .unwrap();

        let resolved = pending.wait().await.unwrap();
        assert_eq!(resolved.room_id, "r1");
        assert_eq!(channel.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failure_payload_rebuilds_error() {
        let channel = ResponseChannel::new(Arc::new(MemoryStore::new()), "matches")
            .await
            .unwrap();

        let pending = channel.register("req2").unwrap();
        let outcome = MatchOutcome::Failure {
            kind: ErrorKind::NotFound,
            message: "no room".to_string(),
        };
        channel.publish("req2", &outcome).await.unwrap();

        let err = pending.wait().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MatchmakingError>(),
            Some(MatchmakingError::NotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_times_out() {
        let channel = ResponseChannel::new(Arc::new(MemoryStore::new()), "matches")
            .await
            .unwrap();

        let pending = channel.register("req3").unwrap();
        let err = pending.wait().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MatchmakingError>(),
            Some(MatchmakingError::Timeout { seconds: 15, .. })
        ));
        // the entry is released with the waiter
        assert_eq!(channel.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_closed_subscription_fails_waiters() {
        let (sender, receiver) = mpsc::unbounded_channel::<Notification>();
        let mut store = MockStoreBackend::new();
        store.expect_subscribe_prefix().return_once(move |_| {
            let stream: NotificationStream = Box::pin(UnboundedReceiverStream::new(receiver));
            Ok(stream)
        });
        let channel = ResponseChannel::new(Arc::new(store), "matches").await.unwrap();

        let pending = channel.register("req4").unwrap();
        drop(sender);

        let err = pending.wait().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MatchmakingError>(),
            Some(MatchmakingError::Storage { .. })
        ));
        assert!(!channel.is_active());
        assert_eq!(channel.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_register_after_close_is_refused() {
        let mut store = MockStoreBackend::new();
        store.expect_subscribe_prefix().returning(|_| {
            let stream: NotificationStream = Box::pin(tokio_stream::empty());
            Ok(stream)
        });
        let channel = ResponseChannel::new(Arc::new(store), "matches").await.unwrap();

        while channel.is_active() {
            tokio::task::yield_now().await;
        }

        let err = channel.register("req5").err().expect("closed channel must refuse");
        assert!(matches!(
            err.downcast_ref::<MatchmakingError>(),
            Some(MatchmakingError::Storage { .. })
        ));
    }
}
