//! Keeps one shape open across transport failures.
//!
//! The current handle is published on a `watch` channel. When it disconnects
//! the supervisor waits out an exponential backoff and reopens from the
//! handle's resume cursor, then publishes the replacement.

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backend::ShapeSpec;
use crate::config::ReconnectConfig;
use crate::error::FeedError;
use crate::shape::{ShapeHandle, ShapeState, ShapeSubscription};
use crate::stats::SharedSyncStats;

pub struct ShapeSupervisor {
    handles: watch::Receiver<Option<ShapeHandle>>,
    shutdown: watch::Sender<bool>,
}

impl ShapeSupervisor {
    /// Open the shape and start supervising it. Fails if the first open fails.
    pub async fn start(
        subscription: ShapeSubscription,
        spec: ShapeSpec,
        policy: ReconnectConfig,
        stats: SharedSyncStats,
    ) -> Result<Self, FeedError> {
        let handle = subscription.open(spec.clone()).await?;
        let (publish, handles) = watch::channel(Some(handle));
        let (shutdown, mut stop) = watch::channel(false);

        tokio::spawn(async move {
            let stopped = tokio::select! {
                _ = reconnect_loop(&subscription, &spec, &policy, &stats, &publish) => false,
                _ = stop.wait_for(|stop| *stop) => true,
            };
            if stopped {
                // Releases the supervisor's reference to the current handle
                publish.send_replace(None);
                debug!(shape = %spec, "Shape supervisor stopped");
            }
        });

        Ok(Self { handles, shutdown })
    }

    /// The handle currently published (None after shutdown)
    pub fn current(&self) -> Option<ShapeHandle> {
        self.handles.borrow().clone()
    }

    pub fn handles(&self) -> watch::Receiver<Option<ShapeHandle>> {
        self.handles.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for ShapeSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Runs until reconnecting gives up
async fn reconnect_loop(
    subscription: &ShapeSubscription,
    spec: &ShapeSpec,
    policy: &ReconnectConfig,
    stats: &SharedSyncStats,
    publish: &watch::Sender<Option<ShapeHandle>>,
) {
    loop {
        let Some(mut state) = publish.borrow().as_ref().map(ShapeHandle::watch_state) else {
            return;
        };
        let ended = state.wait_for(ShapeState::is_ended).await.map(|s| s.clone());
        let reason = match ended {
            Ok(ShapeState::Disconnected { reason }) => reason,
            _ => return,
        };

        let cursor = publish.borrow().as_ref().and_then(ShapeHandle::resume_cursor);
        warn!(
            shape = %spec,
            reason = %reason,
            cursor = ?cursor,
            "Shape disconnected, reconnecting"
        );

        let mut attempts = 0u32;
        let reopened = loop {
            if policy.exhausted(attempts) {
                break None;
            }
            attempts += 1;
            tokio::time::sleep(policy.delay_for(attempts)).await;

            let result = match cursor {
                Some(cursor) => subscription.resume(spec.clone(), cursor).await,
                None => subscription.open(spec.clone()).await,
            };
            match result {
                Ok(handle) => break Some(handle),
                Err(err) => warn!(shape = %spec, attempt = attempts, error = %err, "Reopen failed"),
            }
        };

        let Some(handle) = reopened else {
            error!(shape = %spec, attempts, "Giving up on shape after repeated failures");
            return;
        };
        info!(shape = %spec, attempts, handle = handle.id(), "Shape reconnected");
        stats.record_reconnect();
        publish.send_replace(Some(handle));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::backend::MemoryBackend;
    use crate::models::{Entity, Table};

    async fn start(backend: &MemoryBackend, policy: ReconnectConfig) -> ShapeSupervisor {
        ShapeSupervisor::start(
            ShapeSubscription::new(Arc::new(backend.clone())),
            ShapeSpec::new(Table::Message, ["proj_1"]),
            policy,
            SharedSyncStats::new(),
        )
        .await
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_with_resume_cursor() {
        let backend = MemoryBackend::new();
        backend.insert_remote(Table::Message, Entity::new("m1", "proj_1"));
        let supervisor = start(&backend, ReconnectConfig::default()).await;
        let mut handles = supervisor.handles();

        let first = supervisor.current().unwrap();
        first.wait_until_live().await.unwrap();
        assert!(first.is_fresh());

        backend.disconnect_feeds("connection reset");
        handles.changed().await.unwrap();

        let second = supervisor.current().unwrap();
        assert_ne!(first.id(), second.id());
        assert!(!second.is_fresh());
        assert_eq!(second.resume_cursor(), Some(1));
        second.wait_until_live().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_between_failed_reopens() {
        let backend = MemoryBackend::new();
        let supervisor = start(&backend, ReconnectConfig::default()).await;
        let mut handles = supervisor.handles();
        supervisor.current().unwrap().wait_until_live().await.unwrap();

        backend.fail_next_opens(2);
        let started = tokio::time::Instant::now();
        backend.disconnect_feeds("connection reset");
        handles.changed().await.unwrap();

        // 250ms + 500ms + 1000ms
        assert!(started.elapsed() >= Duration::from_millis(1750));
        assert!(supervisor.current().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let backend = MemoryBackend::new();
        let policy = ReconnectConfig {
            max_attempts: Some(2),
            ..ReconnectConfig::default()
        };
        let supervisor = start(&backend, policy).await;
        let mut handles = supervisor.handles();
        supervisor.current().unwrap().wait_until_live().await.unwrap();

        backend.fail_next_opens(5);
        backend.disconnect_feeds("connection reset");

        // Publisher is dropped without a replacement
        assert!(handles.changed().await.is_err());
        let current = supervisor.current().unwrap();
        assert!(matches!(current.state(), ShapeState::Disconnected { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_releases_handle() {
        let backend = MemoryBackend::new();
        let supervisor = start(&backend, ReconnectConfig::default()).await;
        let state = supervisor.current().unwrap().watch_state();
        let mut handles = supervisor.handles();

        supervisor.shutdown();
        handles.changed().await.unwrap();

        assert!(supervisor.current().is_none());
        assert_eq!(*state.borrow(), ShapeState::Closed);
    }
}
