// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Failover across several collectors.
//!
//! Every call consults the [`Heartbeat`] first. Targets reported alive are tried in their
//! configured order, then the suspect ones, each at most once. A target that fails is marked
//! suspect until the heartbeat vouches for it again.

use crate::sender::heartbeat::Heartbeat;
use crate::sender::{Sender, SenderError};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Suspect,
}

#[derive(Debug, Clone)]
pub struct TargetHealth {
    pub target: String,
    pub liveness: Liveness,
    pub last_failure: Option<Instant>,
}

#[derive(Debug)]
pub struct MultiSender {
    senders: Vec<Arc<dyn Sender>>,
    heartbeat: Arc<dyn Heartbeat>,
    health: Mutex<Vec<TargetHealth>>,
    label: String,
}

impl MultiSender {
    #[must_use]
    pub fn new(senders: Vec<Arc<dyn Sender>>, heartbeat: Arc<dyn Heartbeat>) -> Self {
        let health = senders
            .iter()
            .map(|sender| TargetHealth {
                target: sender.target().to_string(),
                liveness: Liveness::Alive,
                last_failure: None,
            })
            .collect();
        let label = senders
            .iter()
            .map(|sender| sender.target())
            .collect::<Vec<_>>()
            .join(",");
        MultiSender {
            senders,
            heartbeat,
            health: Mutex::new(health),
            label,
        }
    }

    /// Snapshot of every target's state, in configured order.
    #[must_use]
    pub fn health(&self) -> Vec<TargetHealth> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<TargetHealth>> {
        #[allow(clippy::expect_used)]
        self.health.lock().expect("lock poisoned")
    }

    /// Refreshes liveness from the heartbeat and returns sender indexes in try order.
    fn attempt_order(&self) -> Vec<usize> {
        let mut health = self.lock();
        for target in health.iter_mut() {
            let liveness = if self.heartbeat.is_alive(&target.target) {
                Liveness::Alive
            } else {
                Liveness::Suspect
            };
            if liveness != target.liveness {
                debug!("Target {} is now {:?}", target.target, liveness);
                target.liveness = liveness;
            }
        }
        let (mut order, suspect): (Vec<usize>, Vec<usize>) =
            (0..health.len()).partition(|&i| health[i].liveness == Liveness::Alive);
        order.extend(suspect);
        order
    }

    fn mark_suspect(&self, index: usize) {
        let mut health = self.lock();
        if let Some(target) = health.get_mut(index) {
            target.liveness = Liveness::Suspect;
            target.last_failure = Some(Instant::now());
        }
    }

    async fn dispatch(
        &self,
        segments: &[&[u8]],
        ack_token: Option<&[u8]>,
    ) -> Result<(), SenderError> {
        let mut attempts = 0;
        let mut nothing_sent = true;
        let mut last = None;

        for index in self.attempt_order() {
            let sender = &self.senders[index];
            attempts += 1;
            let result = match ack_token {
                Some(token) => sender.send_with_ack(segments, token).await,
                None => sender.send(segments).await,
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    match &e {
                        SenderError::AckMismatch { .. } => {
                            warn!("Ack verification failed on {}: {}", sender.target(), e);
                        }
                        _ => warn!("Failed to send to {}: {}", sender.target(), e),
                    }
                    nothing_sent &= e.nothing_sent();
                    self.mark_suspect(index);
                    last = Some(e);
                }
            }
        }

        match last {
            Some(last) => Err(SenderError::AllTargetsFailed {
                attempts,
                nothing_sent,
                last: Box::new(last),
            }),
            None => Err(SenderError::NoTargets),
        }
    }
}

#[async_trait]
impl Sender for MultiSender {
    fn target(&self) -> &str {
        &self.label
    }

    async fn send(&self, segments: &[&[u8]]) -> Result<(), SenderError> {
        self.dispatch(segments, None).await
    }

    async fn send_with_ack(
        &self,
        segments: &[&[u8]],
        ack_token: &[u8],
    ) -> Result<(), SenderError> {
        self.dispatch(segments, Some(ack_token)).await
    }

    /// Closes every target, reporting the first failure after all have been attempted.
    async fn close(&self) -> Result<(), SenderError> {
        let mut first_error = None;
        for sender in &self.senders {
            if let Err(e) = sender.close().await {
                warn!("Failed to close {}: {}", sender.target(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::sender::heartbeat::{AlwaysAlive, LivenessBoard};
    use crate::sender::testing::RecordingSender;
    use std::sync::atomic::Ordering;
    use tracing_test::traced_test;

    fn multi(
        senders: &[Arc<RecordingSender>],
        heartbeat: Arc<dyn Heartbeat>,
    ) -> MultiSender {
        let senders = senders
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn Sender>)
            .collect();
        MultiSender::new(senders, heartbeat)
    }

    #[tokio::test]
    async fn test_sends_to_first_alive_target() {
        let primary = Arc::new(RecordingSender::named("primary:24224"));
        let secondary = Arc::new(RecordingSender::named("secondary:24224"));
        let sender = multi(&[primary.clone(), secondary.clone()], Arc::new(AlwaysAlive));

        sender.send(&[&b"frame"[..]]).await.unwrap();
        assert_eq!(primary.frames(), vec![b"frame".to_vec()]);
        assert!(secondary.frames().is_empty());
        assert_eq!(sender.target(), "primary:24224,secondary:24224");
    }

    #[tokio::test]
    async fn test_dead_first_target_is_skipped() {
        let primary = Arc::new(RecordingSender::named("primary:24224"));
        let secondary = Arc::new(RecordingSender::named("secondary:24224"));
        let board = LivenessBoard::new();
        board.report("primary:24224", false);
        let sender = multi(&[primary.clone(), secondary.clone()], Arc::new(board.clone()));

        sender.send(&[&b"one"[..]]).await.unwrap();
        sender.send_with_ack(&[&b"two"[..]], b"t").await.unwrap();
        assert!(primary.frames().is_empty());
        assert_eq!(secondary.frames().len(), 2);
        assert_eq!(sender.health()[0].liveness, Liveness::Suspect);

        // the heartbeat alone brings the target back
        board.report("primary:24224", true);
        sender.send(&[&b"three"[..]]).await.unwrap();
        assert_eq!(primary.frames(), vec![b"three".to_vec()]);
        assert_eq!(sender.health()[0].liveness, Liveness::Alive);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_fails_over_and_marks_target_suspect() {
        let primary = Arc::new(RecordingSender::named("primary:24224"));
        primary.refuse_connections.store(true, Ordering::SeqCst);
        let secondary = Arc::new(RecordingSender::named("secondary:24224"));
        let sender = multi(&[primary.clone(), secondary.clone()], Arc::new(AlwaysAlive));

        sender.send(&[&b"frame"[..]]).await.unwrap();
        assert_eq!(secondary.frames(), vec![b"frame".to_vec()]);

        let health = sender.health();
        assert_eq!(health[0].liveness, Liveness::Suspect);
        assert!(health[0].last_failure.is_some());
        assert_eq!(health[1].liveness, Liveness::Alive);
        assert!(logs_contain("Failed to send to primary:24224"));
    }

    #[tokio::test]
    async fn test_all_targets_failed() {
        let primary = Arc::new(RecordingSender::refusing());
        let secondary = Arc::new(RecordingSender::refusing());
        let sender = multi(&[primary, secondary], Arc::new(AlwaysAlive));

        let err = sender.send(&[&b"frame"[..]]).await.unwrap_err();
        match &err {
            SenderError::AllTargetsFailed {
                attempts,
                nothing_sent,
                last,
            } => {
                assert_eq!(*attempts, 2);
                assert!(*nothing_sent);
                assert!(matches!(**last, SenderError::Connect { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.nothing_sent());
    }

    #[tokio::test]
    async fn test_no_targets() {
        let sender = MultiSender::new(Vec::new(), Arc::new(AlwaysAlive));
        let err = sender.send(&[&b"frame"[..]]).await.unwrap_err();
        assert!(matches!(err, SenderError::NoTargets));
    }

    #[tokio::test]
    async fn test_close_reaches_every_target() {
        let primary = Arc::new(RecordingSender::named("primary:24224"));
        let secondary = Arc::new(RecordingSender::named("secondary:24224"));
        let sender = multi(&[primary.clone(), secondary.clone()], Arc::new(AlwaysAlive));

        sender.close().await.unwrap();
        assert!(primary.closed.load(Ordering::SeqCst));
        assert!(secondary.closed.load(Ordering::SeqCst));
    }
}
