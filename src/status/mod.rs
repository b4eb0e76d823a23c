//! Status Aggregator (C7): a shared, diff-encoded snapshot of what the IMAP
//! and SMTP managers are doing, plus a redraw signal for the UI layer.
//! Modeled as a bitflags set the same way the cache's `ResponseStatus` and
//! `Flags` are, since the pack consistently reaches for `bitflags` at every
//! small-finite-set boundary rather than a struct of `bool`s.

use std::sync::Arc;
use tokio::sync::{watch, Mutex};

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct StatusFlags: u16 {
        const CONNECTING   = 0b0000000001;
        const CONNECTED    = 0b0000000010;
        const DISCONNECTING= 0b0000000100;
        const IDLE         = 0b0000001000;
        const FETCHING     = 0b0000010000;
        const SENDING      = 0b0000100000;
        const PREFETCHING  = 0b0001000000;
        const SEARCHING    = 0b0010000000;
        const INDEXING     = 0b0100000000;
        const EXITING      = 0b1000000000;
    }
}

#[derive(Clone, Debug, Default)]
pub struct Progress {
    pub current: u64,
    pub total: u64,
}

#[derive(Clone, Debug, Default)]
pub struct StatusSnapshot {
    pub flags: StatusFlags,
    pub progress: Option<Progress>,
}

struct Inner {
    snapshot: Mutex<StatusSnapshot>,
    redraw_tx: watch::Sender<()>,
}

/// Cloneable handle shared between the IMAP manager, SMTP manager, sleep
/// detector and controller. Every mutation enqueues a redraw signal; the
/// callback itself never runs UI work synchronously (spec §4.7, §5).
#[derive(Clone)]
pub struct StatusHandle(Arc<Inner>);

impl StatusHandle {
    pub fn new() -> (Self, watch::Receiver<()>) {
        let (redraw_tx, redraw_rx) = watch::channel(());
        (
            StatusHandle(Arc::new(Inner { snapshot: Mutex::new(StatusSnapshot::default()), redraw_tx })),
            redraw_rx,
        )
    }

    /// Sets `set` bits and clears `clear` bits, optionally updating progress.
    /// Applying a flag already set, or clearing one already clear, is a
    /// no-op on the bitset but still signals a redraw: progress may have
    /// changed even when the flag set didn't.
    ///
    /// Mutates the snapshot synchronously under the lock rather than
    /// spawning a detached task: callers rely on `apply` calls being
    /// visible in the order they were issued, since a later `clear` racing
    /// ahead of an earlier `set` could otherwise undo a transition the
    /// caller already considers final (e.g. `connected` going backwards).
    pub async fn apply(&self, set: StatusFlags, clear: StatusFlags, progress: Option<Progress>) {
        let mut snap = self.0.snapshot.lock().await;
        snap.flags.insert(set);
        snap.flags.remove(clear);
        if progress.is_some() {
            snap.progress = progress;
        }
        let _ = self.0.redraw_tx.send(());
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        self.0.snapshot.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn apply_sets_and_clears_flags() {
        let (status, _rx) = StatusHandle::new();
        status.apply(StatusFlags::CONNECTING, StatusFlags::empty(), None).await;
        assert!(status.snapshot().await.flags.contains(StatusFlags::CONNECTING));

        status.apply(StatusFlags::CONNECTED, StatusFlags::CONNECTING, None).await;
        let snap = status.snapshot().await;
        assert!(snap.flags.contains(StatusFlags::CONNECTED));
        assert!(!snap.flags.contains(StatusFlags::CONNECTING));
    }

    #[tokio::test]
    async fn apply_signals_redraw() {
        let (status, mut rx) = StatusHandle::new();
        rx.mark_unchanged();
        status.apply(StatusFlags::FETCHING, StatusFlags::empty(), None).await;
        rx.changed().await.unwrap();
    }

    #[tokio::test]
    async fn apply_is_ordered_under_concurrent_calls() {
        let (status, _rx) = StatusHandle::new();
        status.apply(StatusFlags::CONNECTING, StatusFlags::empty(), None).await;
        status.apply(StatusFlags::empty(), StatusFlags::CONNECTING, None).await;
        status.apply(StatusFlags::CONNECTED, StatusFlags::empty(), None).await;
        let snap = status.snapshot().await;
        assert!(snap.flags.contains(StatusFlags::CONNECTED));
        assert!(!snap.flags.contains(StatusFlags::CONNECTING));
    }
}
