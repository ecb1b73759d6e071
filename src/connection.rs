//! Persistent broker connection
//!
//! Owns the single physical connection of a process and re-establishes it
//! with backoff after faults.
//!
//! ```text
//! Disconnected ──channel()──▶ Connecting ──ok──▶ Connected
//!      ▲                          │                 │
//!      └──────── retries exhausted┘                 │
//!      └──────────────── invalidate(gen) ───────────┘
//! ```
//!
//! Callers never share the underlying socket directly: each publish or
//! consume borrows a cheap handle through [`PersistentConnection::channel`].

use crate::error::{EventError, Result};
use crate::retry::{with_retry, AttemptOutcome, RetryPolicy};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{watch, Mutex};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Knows how to open one physical broker connection
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Cheap, cloneable handle to a live connection
    type Handle: Clone + Send + Sync + 'static;

    async fn connect(&self) -> Result<Self::Handle>;

    /// Whether a previously opened handle is still usable
    fn is_open(&self, _handle: &Self::Handle) -> bool {
        true
    }

    /// Human-readable broker address, for logs
    fn endpoint(&self) -> String;
}

/// Single, self-healing connection shared by a transport
pub struct PersistentConnection<C: Connector> {
    connector: C,
    retry: RetryPolicy,
    live: Mutex<Option<C::Handle>>,
    state: watch::Sender<ConnectionState>,
    generation: AtomicU64,
    closed: AtomicBool,
}

impl<C: Connector> PersistentConnection<C> {
    pub fn new(connector: C, retry: RetryPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            retry,
            live: Mutex::new(None),
            state,
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Open the connection eagerly, failing if it can't be established
    pub async fn connect(connector: C, retry: RetryPolicy) -> Result<Self> {
        let connection = Self::new(connector, retry);
        connection.channel().await?;
        Ok(connection)
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Number of successful connects so far
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Borrow a handle, connecting first if needed
    ///
    /// Concurrent callers queue on one lock, so at most one connect attempt
    /// is in flight and at most one connection is live.
    pub async fn channel(&self) -> Result<C::Handle> {
        self.lease().await.map(|(handle, _)| handle)
    }

    /// Borrow a handle together with the generation it belongs to
    ///
    /// Pass the generation back to [`invalidate`](Self::invalidate) when the
    /// handle faults.
    pub async fn lease(&self) -> Result<(C::Handle, u64)> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EventError::Shutdown("connection closed".to_string()));
        }

        let mut live = self.live.lock().await;

        if let Some(handle) = live.as_ref() {
            if self.connector.is_open(handle) {
                return Ok((handle.clone(), self.generation()));
            }
            tracing::warn!(endpoint = %self.connector.endpoint(), "Broker connection lost");
            *live = None;
        }

        self.state.send_replace(ConnectionState::Connecting);

        let result = with_retry(&self.retry, "connect", |attempt| async move {
            if self.closed.load(Ordering::SeqCst) {
                return AttemptOutcome::Fatal(EventError::Shutdown("connection closed".to_string()));
            }
            match self.connector.connect().await {
                Ok(handle) => AttemptOutcome::Success(handle),
                Err(e) => {
                    tracing::debug!(
                        endpoint = %self.connector.endpoint(),
                        attempt = attempt + 1,
                        error = %e,
                        "Connect attempt failed"
                    );
                    AttemptOutcome::from(Err(e))
                }
            }
        })
        .await;

        match result {
            Ok(handle) => {
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                *live = Some(handle.clone());
                self.state.send_replace(ConnectionState::Connected);
                tracing::info!(
                    endpoint = %self.connector.endpoint(),
                    generation,
                    "Broker connection established"
                );
                Ok((handle, generation))
            }
            Err(e @ EventError::Shutdown(_)) => {
                self.state.send_replace(ConnectionState::Disconnected);
                Err(e)
            }
            Err(e) => {
                self.state.send_replace(ConnectionState::Disconnected);
                tracing::error!(
                    endpoint = %self.connector.endpoint(),
                    error = %e,
                    "Unable to connect to broker"
                );
                Err(EventError::Connection(format!(
                    "{}: {}",
                    self.connector.endpoint(),
                    e
                )))
            }
        }
    }

    /// Report a fault on the handle leased at `generation`
    ///
    /// The next [`channel`](Self::channel) reconnects. A report for an older
    /// generation is ignored so a late failure can't tear down a connection
    /// that was already replaced. Returns whether the live handle was dropped.
    pub async fn invalidate(&self, generation: u64) -> bool {
        let mut live = self.live.lock().await;
        if self.generation() != generation {
            tracing::debug!(
                endpoint = %self.connector.endpoint(),
                stale = generation,
                current = self.generation(),
                "Ignoring fault for a replaced connection"
            );
            return false;
        }
        let dropped = live.take().is_some();
        if dropped {
            tracing::warn!(
                endpoint = %self.connector.endpoint(),
                generation,
                "Broker connection invalidated"
            );
        }
        self.state.send_replace(ConnectionState::Disconnected);
        dropped
    }

    /// Drop the connection and refuse further use
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut live = self.live.lock().await;
        *live = None;
        self.state.send_replace(ConnectionState::Disconnected);
        tracing::info!(endpoint = %self.connector.endpoint(), "Broker connection closed");
    }

    /// Whether [`close`](Self::close) was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[derive(Clone)]
    struct FlakyConnector {
        failures_left: Arc<AtomicU32>,
        connects: Arc<AtomicU32>,
        open: Arc<AtomicBool>,
    }

    impl FlakyConnector {
        fn new(failures: u32) -> Self {
            Self {
                failures_left: Arc::new(AtomicU32::new(failures)),
                connects: Arc::new(AtomicU32::new(0)),
                open: Arc::new(AtomicBool::new(true)),
            }
        }
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        type Handle = u32;

        async fn connect(&self) -> Result<u32> {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(EventError::Connection("refused".to_string()));
            }
            self.open.store(true, Ordering::SeqCst);
            Ok(self.connects.fetch_add(1, Ordering::SeqCst) + 1)
        }

        fn is_open(&self, _handle: &u32) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn endpoint(&self) -> String {
            "flaky://test".to_string()
        }
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    #[tokio::test]
    async fn test_connects_lazily_and_reuses_handle() {
        let connector = FlakyConnector::new(0);
        let conn = PersistentConnection::new(connector.clone(), fast_retry(0));
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        assert_eq!(conn.channel().await.unwrap(), 1);
        assert_eq!(conn.channel().await.unwrap(), 1);
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.generation(), 1);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_connect_with_backoff() {
        let conn = PersistentConnection::new(FlakyConnector::new(2), fast_retry(3));
        assert_eq!(conn.channel().await.unwrap(), 1);
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_fails_after_retry_budget() {
        let conn = PersistentConnection::new(FlakyConnector::new(10), fast_retry(2));
        let err = conn.channel().await.unwrap_err();
        assert!(matches!(err, EventError::Connection(_)));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.generation(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_triggers_reconnect() {
        let connector = FlakyConnector::new(0);
        let conn = PersistentConnection::new(connector.clone(), fast_retry(0));
        let (_, generation) = conn.lease().await.unwrap();

        assert!(conn.invalidate(generation).await);
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        assert_eq!(conn.channel().await.unwrap(), 2);
        assert_eq!(conn.generation(), 2);
    }

    #[tokio::test]
    async fn test_stale_invalidate_keeps_replacement_connection() {
        let connector = FlakyConnector::new(0);
        let conn = PersistentConnection::new(connector.clone(), fast_retry(0));
        let (first, first_generation) = conn.lease().await.unwrap();
        assert_eq!((first, first_generation), (1, 1));

        // Another caller notices the fault first and reconnects.
        assert!(conn.invalidate(first_generation).await);
        let (second, second_generation) = conn.lease().await.unwrap();
        assert_eq!((second, second_generation), (2, 2));

        // The late report about the first handle must not drop the second.
        assert!(!conn.invalidate(first_generation).await);
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.channel().await.unwrap(), 2);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dropped_socket_detected_on_next_channel() {
        let connector = FlakyConnector::new(0);
        let conn = PersistentConnection::new(connector.clone(), fast_retry(0));
        conn.channel().await.unwrap();

        connector.open.store(false, Ordering::SeqCst);
        assert_eq!(conn.channel().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_connect() {
        let connector = FlakyConnector::new(0);
        let conn = Arc::new(PersistentConnection::new(connector.clone(), fast_retry(0)));

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let conn = conn.clone();
            tasks.push(tokio::spawn(async move { conn.channel().await.unwrap() }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), 1);
        }
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_watch_state_transitions() {
        let conn = PersistentConnection::new(FlakyConnector::new(0), fast_retry(0));
        let mut rx = conn.watch_state();
        conn.channel().await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_close_refuses_channel() {
        let conn = PersistentConnection::new(FlakyConnector::new(0), fast_retry(0));
        conn.channel().await.unwrap();
        conn.close().await;

        assert!(conn.is_closed());
        assert!(matches!(conn.channel().await, Err(EventError::Shutdown(_))));
    }
}
