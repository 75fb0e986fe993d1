//! Batch window aggregation.
//!
//! Compatible concurrent requests (same model and generation parameters)
//! coalesce into short-lived windows. A window flushes when it reaches its
//! maximum size or when its timer fires, whichever comes first, and exactly
//! one caller wins the removal of a window from the pending set. Each
//! member holds a oneshot completion channel, so no member can be resolved
//! twice.
//!
//! Batching is a process-local optimization: losing window state only
//! costs coalescing efficiency, never correctness, so windows live in a
//! plain in-process map guarded by a mutex.

use async_trait::async_trait;
use gateway_config::BatchSettings;
use gateway_core::{GatewayError, GatewayRequest, GatewayResponse};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// Upstream dispatch hook the aggregator flushes through.
///
/// Implemented by the request pipeline; tests substitute a mock.
#[async_trait]
pub trait BatchDispatch: Send + Sync {
    /// Dispatch one member request on its own
    async fn dispatch_member(
        &self,
        request: GatewayRequest,
    ) -> Result<GatewayResponse, GatewayError>;

    /// Dispatch all members merged into a single upstream call, returning
    /// one response per member in input order
    async fn dispatch_merged(
        &self,
        requests: Vec<GatewayRequest>,
    ) -> Result<Vec<GatewayResponse>, GatewayError>;
}

/// Grouping key: requests sharing a key join the same window
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BatchKey {
    model: String,
    /// Temperature bit pattern, so f32 can participate in Eq/Hash
    temperature_bits: Option<u32>,
    max_tokens: Option<u32>,
}

impl BatchKey {
    fn from_request(request: &GatewayRequest) -> Self {
        Self {
            model: request.model.clone(),
            temperature_bits: request.temperature.map(f32::to_bits),
            max_tokens: request.max_tokens,
        }
    }
}

/// One pending sub-request with its completion channel
struct PendingMember {
    request: GatewayRequest,
    completion: oneshot::Sender<Result<GatewayResponse, GatewayError>>,
}

/// An open coalescing window
struct BatchWindow {
    id: Uuid,
    members: Vec<PendingMember>,
    /// Whether the target model supports native multi-input batching
    merge_supported: bool,
    created_at: Instant,
}

/// Aggregates compatible requests into batched dispatches
pub struct BatchAggregator {
    settings: BatchSettings,
    windows: Mutex<HashMap<BatchKey, BatchWindow>>,
    dispatch: Arc<dyn BatchDispatch>,
}

impl BatchAggregator {
    /// Create an aggregator flushing through the given dispatcher
    #[must_use]
    pub fn new(settings: BatchSettings, dispatch: Arc<dyn BatchDispatch>) -> Self {
        Self {
            settings,
            windows: Mutex::new(HashMap::new()),
            dispatch,
        }
    }

    /// Whether batching applies to this request at all
    #[must_use]
    pub fn applies_to(&self, request: &GatewayRequest) -> bool {
        self.settings.enabled && request.is_embedding() && !request.stream
    }

    /// Submit a request to its coalescing window and await the response.
    ///
    /// `merge_supported` comes from the registry's per-model batchability
    /// flag and decides merged versus per-member dispatch at flush time.
    ///
    /// # Errors
    /// Propagates the dispatch error for this member, or `BatchTimeout`
    /// if the window was discarded by the stale sweep.
    pub async fn submit(
        self: &Arc<Self>,
        request: GatewayRequest,
        merge_supported: bool,
    ) -> Result<GatewayResponse, GatewayError> {
        let key = BatchKey::from_request(&request);
        let (tx, rx) = oneshot::channel();
        let member = PendingMember {
            request,
            completion: tx,
        };

        // Append under the map lock; at most one caller can observe the
        // window reaching capacity and take it for flushing.
        let full_window = {
            let mut windows = self.windows.lock();
            match windows.get_mut(&key) {
                Some(window) => {
                    window.members.push(member);
                    if window.members.len() >= self.settings.max_size {
                        windows.remove(&key)
                    } else {
                        None
                    }
                }
                None => {
                    let window = BatchWindow {
                        id: Uuid::new_v4(),
                        members: vec![member],
                        merge_supported,
                        created_at: Instant::now(),
                    };
                    let window_id = window.id;
                    windows.insert(key.clone(), window);
                    self.schedule_timer_flush(key.clone(), window_id);
                    None
                }
            }
        };

        if let Some(window) = full_window {
            debug!(
                members = window.members.len(),
                "batch window full, flushing immediately"
            );
            let aggregator = Arc::clone(self);
            tokio::spawn(async move { aggregator.flush(window).await });
        }

        rx.await
            .map_err(|_| GatewayError::internal("batch member completion dropped"))?
    }

    /// Arm the window's flush timer. The timer only flushes the window it
    /// armed for: if a size-based flush already removed it (or replaced it
    /// with a newer window under the same key), the timer is a no-op.
    fn schedule_timer_flush(self: &Arc<Self>, key: BatchKey, window_id: Uuid) {
        let aggregator = Arc::clone(self);
        let window_duration = self.settings.window;
        tokio::spawn(async move {
            tokio::time::sleep(window_duration).await;

            let window = {
                let mut windows = aggregator.windows.lock();
                match windows.get(&key) {
                    Some(window) if window.id == window_id => windows.remove(&key),
                    _ => None,
                }
            };

            if let Some(window) = window {
                aggregator.flush(window).await;
            }
        });
    }

    /// Dispatch a removed window and complete every member exactly once
    async fn flush(&self, window: BatchWindow) {
        let member_count = window.members.len();
        debug!(window = %window.id, members = member_count, "flushing batch window");

        if window.merge_supported && member_count > 1 {
            let requests: Vec<GatewayRequest> = window
                .members
                .iter()
                .map(|m| m.request.clone())
                .collect();

            match self.dispatch.dispatch_merged(requests).await {
                Ok(responses) if responses.len() == member_count => {
                    for (member, response) in window.members.into_iter().zip(responses) {
                        let _ = member.completion.send(Ok(response));
                    }
                    return;
                }
                Ok(responses) => {
                    warn!(
                        window = %window.id,
                        expected = member_count,
                        got = responses.len(),
                        "merged dispatch returned wrong arity, falling back to individual"
                    );
                }
                Err(e) => {
                    warn!(
                        window = %window.id,
                        error = %e,
                        "merged dispatch failed, falling back to individual"
                    );
                }
            }
            self.flush_individually(window.members).await;
        } else {
            self.flush_individually(window.members).await;
        }
    }

    /// Dispatch members concurrently, resolving each completion separately
    async fn flush_individually(&self, members: Vec<PendingMember>) {
        let futures = members.into_iter().map(|member| async move {
            let result = self.dispatch.dispatch_member(member.request).await;
            // A send failure only means the caller went away
            let _ = member.completion.send(result);
        });
        futures::future::join_all(futures).await;
    }

    /// Discard windows stuck open past twice the flush interval, rejecting
    /// their members with a timeout error. Returns the number of windows
    /// discarded. Guards against a lost flush timer.
    pub fn sweep_stale(&self) -> usize {
        let cutoff = self.settings.window * 2;
        let stale: Vec<BatchWindow> = {
            let mut windows = self.windows.lock();
            let stale_keys: Vec<BatchKey> = windows
                .iter()
                .filter(|(_, w)| w.created_at.elapsed() > cutoff)
                .map(|(k, _)| k.clone())
                .collect();
            stale_keys
                .into_iter()
                .filter_map(|k| windows.remove(&k))
                .collect()
        };

        let count = stale.len();
        for window in stale {
            warn!(window = %window.id, "discarding stale batch window");
            for member in window.members {
                let _ = member.completion.send(Err(GatewayError::BatchTimeout));
            }
        }
        count
    }

    /// Run the periodic stale-window sweep until the task is aborted
    pub async fn run_sweeper(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.settings.window * 2);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.sweep_stale();
        }
    }

    /// Number of currently open windows
    #[must_use]
    pub fn open_windows(&self) -> usize {
        self.windows.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::{EmbeddingInput, Usage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct MockDispatch {
        merged_calls: AtomicUsize,
        member_calls: AtomicUsize,
        fail_merged: bool,
    }

    impl MockDispatch {
        fn new(fail_merged: bool) -> Arc<Self> {
            Arc::new(Self {
                merged_calls: AtomicUsize::new(0),
                member_calls: AtomicUsize::new(0),
                fail_merged,
            })
        }

        fn response(model: &str) -> GatewayResponse {
            GatewayResponse::embeddings(model, vec![vec![0.1, 0.2]], Usage::new(5, 0))
        }
    }

    #[async_trait]
    impl BatchDispatch for MockDispatch {
        async fn dispatch_member(
            &self,
            request: GatewayRequest,
        ) -> Result<GatewayResponse, GatewayError> {
            self.member_calls.fetch_add(1, Ordering::SeqCst);
            Ok(Self::response(&request.model))
        }

        async fn dispatch_merged(
            &self,
            requests: Vec<GatewayRequest>,
        ) -> Result<Vec<GatewayResponse>, GatewayError> {
            self.merged_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_merged {
                return Err(GatewayError::provider(
                    "mock",
                    "merged dispatch unavailable",
                    Some(500),
                ));
            }
            Ok(requests
                .iter()
                .map(|r| Self::response(&r.model))
                .collect())
        }
    }

    fn settings(window: Duration, max_size: usize) -> BatchSettings {
        BatchSettings {
            enabled: true,
            window,
            max_size,
        }
    }

    fn embedding_request(model: &str, text: &str) -> GatewayRequest {
        GatewayRequest::builder()
            .model(model)
            .input(EmbeddingInput::Single(text.to_string()))
            .build()
            .expect("valid request")
    }

    #[tokio::test]
    async fn test_full_window_flushes_immediately() {
        let dispatch = MockDispatch::new(false);
        let aggregator = Arc::new(BatchAggregator::new(
            settings(Duration::from_secs(60), 3),
            dispatch.clone(),
        ));

        let mut handles = Vec::new();
        for i in 0..3 {
            let agg = Arc::clone(&aggregator);
            handles.push(tokio::spawn(async move {
                agg.submit(embedding_request("text-embedding-ada-002", &format!("t{i}")), true)
                    .await
            }));
        }

        // The window is size 3, so all members resolve long before the
        // 60 second timer could fire.
        for handle in handles {
            let response = handle.await.expect("join").expect("response");
            assert_eq!(response.model, "text-embedding-ada-002");
        }

        assert_eq!(dispatch.merged_calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatch.member_calls.load(Ordering::SeqCst), 0);
        assert_eq!(aggregator.open_windows(), 0);
    }

    #[tokio::test]
    async fn test_timer_flush() {
        let dispatch = MockDispatch::new(false);
        let aggregator = Arc::new(BatchAggregator::new(
            settings(Duration::from_millis(50), 10),
            dispatch.clone(),
        ));

        let response = aggregator
            .submit(embedding_request("text-embedding-ada-002", "solo"), true)
            .await
            .expect("response");
        assert_eq!(response.model, "text-embedding-ada-002");

        // A single-member window is dispatched individually, not merged
        assert_eq!(dispatch.member_calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatch.merged_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_merged_failure_falls_back_to_individual() {
        let dispatch = MockDispatch::new(true);
        let aggregator = Arc::new(BatchAggregator::new(
            settings(Duration::from_millis(50), 2),
            dispatch.clone(),
        ));

        let a = {
            let agg = Arc::clone(&aggregator);
            tokio::spawn(async move {
                agg.submit(embedding_request("text-embedding-ada-002", "a"), true)
                    .await
            })
        };
        let b = {
            let agg = Arc::clone(&aggregator);
            tokio::spawn(async move {
                agg.submit(embedding_request("text-embedding-ada-002", "b"), true)
                    .await
            })
        };

        assert!(a.await.expect("join").is_ok());
        assert!(b.await.expect("join").is_ok());

        assert_eq!(dispatch.merged_calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatch.member_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unmergeable_model_dispatches_individually() {
        let dispatch = MockDispatch::new(false);
        let aggregator = Arc::new(BatchAggregator::new(
            settings(Duration::from_millis(50), 2),
            dispatch.clone(),
        ));

        let a = {
            let agg = Arc::clone(&aggregator);
            tokio::spawn(async move {
                agg.submit(embedding_request("custom-embed", "a"), false).await
            })
        };
        let b = {
            let agg = Arc::clone(&aggregator);
            tokio::spawn(async move {
                agg.submit(embedding_request("custom-embed", "b"), false).await
            })
        };

        assert!(a.await.expect("join").is_ok());
        assert!(b.await.expect("join").is_ok());

        assert_eq!(dispatch.merged_calls.load(Ordering::SeqCst), 0);
        assert_eq!(dispatch.member_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_different_parameters_use_separate_windows() {
        let dispatch = MockDispatch::new(false);
        let aggregator = Arc::new(BatchAggregator::new(
            settings(Duration::from_secs(60), 10),
            dispatch.clone(),
        ));

        let mut a = embedding_request("text-embedding-ada-002", "a");
        a.max_tokens = Some(10);
        let mut b = embedding_request("text-embedding-ada-002", "b");
        b.max_tokens = Some(20);

        {
            let agg = Arc::clone(&aggregator);
            tokio::spawn(async move { agg.submit(a, true).await });
        }
        {
            let agg = Arc::clone(&aggregator);
            tokio::spawn(async move { agg.submit(b, true).await });
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(aggregator.open_windows(), 2);

        // Clean up without waiting for the 60 second timers
        aggregator.sweep_stale();
    }

    #[tokio::test]
    async fn test_sweep_rejects_stale_members_with_timeout() {
        let dispatch = MockDispatch::new(false);
        let aggregator = Arc::new(BatchAggregator::new(
            settings(Duration::from_millis(10), 10),
            dispatch.clone(),
        ));

        // Insert a window directly so no timer is armed for it, simulating
        // a lost flush timer.
        let (tx, rx) = oneshot::channel();
        {
            let mut windows = aggregator.windows.lock();
            windows.insert(
                BatchKey {
                    model: "text-embedding-ada-002".to_string(),
                    temperature_bits: None,
                    max_tokens: None,
                },
                BatchWindow {
                    id: Uuid::new_v4(),
                    members: vec![PendingMember {
                        request: embedding_request("text-embedding-ada-002", "stuck"),
                        completion: tx,
                    }],
                    merge_supported: true,
                    created_at: Instant::now() - Duration::from_millis(100),
                },
            );
        }

        assert_eq!(aggregator.sweep_stale(), 1);
        let result = rx.await.expect("completion sent");
        assert!(matches!(result, Err(GatewayError::BatchTimeout)));
        assert_eq!(aggregator.open_windows(), 0);
    }

    #[tokio::test]
    async fn test_applies_to_embeddings_only() {
        let dispatch = MockDispatch::new(false);
        let aggregator = BatchAggregator::new(
            settings(Duration::from_millis(50), 10),
            dispatch,
        );
        let aggregator = Arc::new(aggregator);

        assert!(aggregator.applies_to(&embedding_request("text-embedding-ada-002", "x")));

        let chat = GatewayRequest::builder()
            .model("gpt-4")
            .message(gateway_core::ChatMessage::user("hi"))
            .build()
            .expect("valid request");
        assert!(!aggregator.applies_to(&chat));
    }
}
