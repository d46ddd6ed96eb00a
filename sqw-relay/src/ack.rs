//! Correlation of asynchronous acknowledgements.
//!
//! Each channel owns one [`PendingAcks`] table. Sending an event that expects
//! a reply registers a correlation token and yields an [`AckFuture`]; the
//! reader task resolves the token when the matching `ack` packet arrives.
//! Closing the channel discards the table, which completes every outstanding
//! future with [`AckError::OrphanedAcknowledgement`].

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{
    error::AckError,
    message::{AckId, Payload},
};

#[derive(Debug, Default)]
pub struct PendingAcks {
    next_id: AtomicU64,
    state: Mutex<PendingState>,
}

#[derive(Debug, Default)]
struct PendingState {
    waiting: HashMap<AckId, oneshot::Sender<Vec<Payload>>>,
    closed: bool,
}

impl PendingAcks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a fresh correlation token.
    ///
    /// On a closed table the returned future is already orphaned.
    pub fn register(&self) -> (AckId, AckFuture) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let mut state = self.lock();
        if !state.closed {
            state.waiting.insert(id, tx);
        }

        (id, AckFuture { id, rx })
    }

    /// Hands the reply to whoever awaits `id`. Each token resolves at most once.
    pub fn resolve(&self, id: AckId, args: Vec<Payload>) -> Result<(), AckError> {
        let sender = self
            .lock()
            .waiting
            .remove(&id)
            .ok_or(AckError::DuplicateAcknowledgement { id })?;

        if sender.send(args).is_err() {
            debug!(id, "acknowledgement arrived after the caller stopped waiting");
        }
        Ok(())
    }

    /// Drops a token whose event never made it onto the wire.
    pub fn forget(&self, id: AckId) {
        self.lock().waiting.remove(&id);
    }

    /// Closes the table and orphans everything still waiting.
    ///
    /// Returns how many acknowledgements were discarded.
    pub fn discard(&self) -> usize {
        let orphaned: Vec<_> = {
            let mut state = self.lock();
            state.closed = true;
            state.waiting.drain().collect()
        };

        if !orphaned.is_empty() {
            let ids: Vec<AckId> = orphaned.iter().map(|(id, _)| *id).collect();
            warn!(count = ids.len(), ?ids, "discarding orphaned acknowledgements");
        }
        orphaned.len()
    }

    pub fn len(&self) -> usize {
        self.lock().waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PendingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Resolves with the far side's acknowledgement arguments.
///
/// The protocol defines no timeout; use [`AckFuture::with_timeout`] when the
/// caller cannot wait forever. A late reply after a timeout is accepted by the
/// table and discarded.
#[derive(Debug)]
pub struct AckFuture {
    id: AckId,
    rx: oneshot::Receiver<Vec<Payload>>,
}

impl AckFuture {
    pub fn id(&self) -> AckId {
        self.id
    }

    pub async fn with_timeout(self, after: Duration) -> Result<Vec<Payload>, AckError> {
        let id = self.id;
        match tokio::time::timeout(after, self).await {
            Ok(result) => result,
            Err(_) => Err(AckError::TimedOut { id, after }),
        }
    }
}

impl Future for AckFuture {
    type Output = Result<Vec<Payload>, AckError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let id = self.id;
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| AckError::OrphanedAcknowledgement { id }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_exactly_once() {
        let pending = PendingAcks::new();
        let (id, future) = pending.register();

        pending
            .resolve(id, vec![Payload::text("Thanks!")])
            .expect("first resolution");
        assert_eq!(
            pending.resolve(id, vec![]),
            Err(AckError::DuplicateAcknowledgement { id })
        );

        let reply = future.await.expect("resolved");
        assert_eq!(reply, vec![Payload::text("Thanks!")]);
        assert!(pending.is_empty());
    }

    #[test]
    fn unknown_token_is_rejected() {
        let pending = PendingAcks::new();
        assert_eq!(
            pending.resolve(42, vec![]),
            Err(AckError::DuplicateAcknowledgement { id: 42 })
        );
    }

    #[tokio::test]
    async fn tokens_resolve_independently() {
        let pending = PendingAcks::new();
        let (first_id, first) = pending.register();
        let (second_id, second) = pending.register();
        assert_ne!(first_id, second_id);

        pending.resolve(second_id, vec![Payload::text("b")]).expect("second");
        pending.resolve(first_id, vec![Payload::text("a")]).expect("first");

        assert_eq!(second.await.expect("second"), vec![Payload::text("b")]);
        assert_eq!(first.await.expect("first"), vec![Payload::text("a")]);
    }

    #[tokio::test]
    async fn discard_orphans_waiters_and_later_registrations() {
        let pending = PendingAcks::new();
        let (id, future) = pending.register();

        assert_eq!(pending.discard(), 1);
        assert_eq!(future.await, Err(AckError::OrphanedAcknowledgement { id }));
        assert_eq!(
            pending.resolve(id, vec![]),
            Err(AckError::DuplicateAcknowledgement { id })
        );

        let (late_id, late) = pending.register();
        assert!(pending.is_closed());
        assert_eq!(
            late.await,
            Err(AckError::OrphanedAcknowledgement { id: late_id })
        );
    }

    #[tokio::test]
    async fn timeout_wrapper_reports_the_token() {
        let pending = PendingAcks::new();
        let (id, future) = pending.register();

        let after = Duration::from_millis(10);
        assert_eq!(
            future.with_timeout(after).await,
            Err(AckError::TimedOut { id, after })
        );

        // The late reply is still accepted exactly once.
        assert_eq!(pending.resolve(id, vec![]), Ok(()));
    }

    #[test]
    fn forget_removes_the_token() {
        let pending = PendingAcks::new();
        let (id, _future) = pending.register();
        pending.forget(id);
        assert!(pending.is_empty());
    }
}
