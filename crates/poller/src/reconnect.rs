//! Flat-interval reconnect state machine
//!
//! One instance per poller. Entered only from the poller's single ticking
//! task, so the `retrying` flag is an optimistic idempotence guard, not a
//! mutex: concurrent external callers are not a supported use case.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{error, info};

use crate::traits::BackendConnection;

pub struct Reconnector {
    service: String,
    interval: Duration,
    backend: Arc<dyn BackendConnection>,
    retrying: AtomicBool,
    attempts: AtomicU32,
    next_attempt_ms: AtomicI64,
    retry_task: Mutex<Option<JoinHandle<()>>>,
}

impl Reconnector {
    pub fn new(
        service: impl Into<String>,
        interval: Duration,
        backend: Arc<dyn BackendConnection>,
    ) -> Arc<Self> {
        Arc::new(Self {
            service: service.into(),
            interval,
            backend,
            retrying: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            next_attempt_ms: AtomicI64::new(0),
            retry_task: Mutex::new(None),
        })
    }

    /// Idempotent entry point: when not already retrying, attempt an
    /// immediate connect and, on failure, keep retrying on the flat interval
    /// until the backend reports connected. Non-blocking; the work runs on a
    /// spawned task.
    pub fn start_repeating_reconnect_once(self: &Arc<Self>) {
        if self.retrying.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(service = %self.service, "Start repeating reconnect once");
        self.attempts.store(0, Ordering::SeqCst);
        self.store_next_attempt();

        let reconnector = Arc::clone(self);
        let task = tokio::spawn(async move {
            if reconnector.backend.connect().await.is_ok() {
                info!(service = %reconnector.service, "Established backend connection");
                reconnector.retrying.store(false, Ordering::SeqCst);
                return;
            }
            error!(service = %reconnector.service, "Could not connect to backend, starting repeating reconnect");

            loop {
                if reconnector.backend.is_connected() {
                    reconnector.retrying.store(false, Ordering::SeqCst);
                    return;
                }
                reconnector.store_next_attempt();
                tokio::time::sleep(reconnector.interval).await;
                reconnector.attempts.fetch_add(1, Ordering::SeqCst);
                match reconnector.backend.connect().await {
                    Ok(()) => {
                        info!(service = %reconnector.service, "Established backend connection");
                        reconnector.retrying.store(false, Ordering::SeqCst);
                        return;
                    }
                    Err(e) => {
                        error!(service = %reconnector.service, error = %e, "Could not reconnect to backend");
                    }
                }
            }
        });
        *self.retry_task.lock().unwrap() = Some(task);
    }

    /// Cancel a pending retry and clear the retrying flag. No-op when not
    /// retrying.
    pub fn stop(&self) {
        if let Some(task) = self.retry_task.lock().unwrap().take() {
            info!(service = %self.service, "Stopping reconnector");
            task.abort();
            self.retrying.store(false, Ordering::SeqCst);
        }
    }

    pub fn is_retrying(&self) -> bool {
        self.retrying.load(Ordering::SeqCst)
    }

    /// Scheduled time of the next connect attempt, unix milliseconds.
    pub fn next_attempt_ms(&self) -> i64 {
        self.next_attempt_ms.load(Ordering::SeqCst)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn store_next_attempt(&self) {
        let next = Utc::now().timestamp_millis() + self.interval.as_millis() as i64;
        self.next_attempt_ms.store(next, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    /// Backend that fails the first `failures` connect attempts.
    struct FlakyBackend {
        failures: u32,
        calls: AtomicU32,
        connected: AtomicBool,
    }

    impl FlakyBackend {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
                connected: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl BackendConnection for FlakyBackend {
        async fn connect(&self) -> Result<(), BackendError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(BackendError::ConnectionFailed("refused".to_string()))
            } else {
                self.connected.store(true, Ordering::SeqCst);
                Ok(())
            }
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn is_connecting(&self) -> bool {
            false
        }

        fn set_connecting(&self, _connecting: bool) {}

        async fn ping(&self) -> Result<(), BackendError> {
            Ok(())
        }

        async fn close(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_success_does_not_retry() {
        let backend = FlakyBackend::new(0);
        let reconnector = Reconnector::new("test", Duration::from_secs(60), backend.clone());

        reconnector.start_repeating_reconnect_once();
        wait_until(|| backend.is_connected()).await;
        wait_until(|| !reconnector.is_retrying()).await;
        assert_eq!(reconnector.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_connected() {
        let backend = FlakyBackend::new(3);
        let reconnector = Reconnector::new("test", Duration::from_millis(50), backend.clone());

        reconnector.start_repeating_reconnect_once();
        wait_until(|| backend.is_connected()).await;
        wait_until(|| !reconnector.is_retrying()).await;
        // immediate attempt + 3 scheduled retries, the last one succeeding
        assert_eq!(backend.calls.load(Ordering::SeqCst), 4);
        assert_eq!(reconnector.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reentry_while_retrying_is_ignored() {
        let backend = FlakyBackend::new(u32::MAX);
        let reconnector = Reconnector::new("test", Duration::from_secs(60), backend.clone());

        reconnector.start_repeating_reconnect_once();
        wait_until(|| reconnector.is_retrying()).await;
        let attempts_before = reconnector.attempts();
        reconnector.start_repeating_reconnect_once();
        // the second call must not reset or duplicate the running loop
        assert!(reconnector.is_retrying());
        assert_eq!(reconnector.attempts(), attempts_before);
        reconnector.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_retry() {
        let backend = FlakyBackend::new(u32::MAX);
        let reconnector = Reconnector::new("test", Duration::from_secs(60), backend.clone());

        reconnector.start_repeating_reconnect_once();
        wait_until(|| reconnector.is_retrying()).await;
        reconnector.stop();
        assert!(!reconnector.is_retrying());

        let calls_at_stop = backend.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), calls_at_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_without_retry_is_noop() {
        let backend = FlakyBackend::new(0);
        let reconnector = Reconnector::new("test", Duration::from_secs(60), backend);
        reconnector.stop();
        reconnector.stop();
        assert!(!reconnector.is_retrying());
    }
}
