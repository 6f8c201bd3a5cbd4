// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Cancellation handle for a live download task.
//!
//! The reason is recorded before the token fires, so the task never has to
//! guess who stopped it by looking at which token was cancelled.

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

use super::types::CancelReason;

/// Token plus the reason it was triggered. Clones share state.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
}

impl CancelHandle {
    /// A handle that also fires when `parent` is cancelled.
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            reason: Arc::new(OnceLock::new()),
        }
    }

    /// Record `reason` and cancel. The first recorded reason wins; the
    /// returned value is the reason that is in effect.
    pub fn trigger(&self, reason: CancelReason) -> CancelReason {
        let effective = *self.reason.get_or_init(|| reason);
        self.token.cancel();
        effective
    }

    /// Reason recorded so far, if any.
    pub fn reason(&self) -> Option<CancelReason> {
        self.reason.get().copied()
    }

    /// Reason to settle with once the token has fired. A parent token
    /// firing records nothing, which means shutdown.
    pub fn settled_reason(&self) -> CancelReason {
        self.reason().unwrap_or(CancelReason::ExternalShutdown)
    }

    /// Token handed to the source downloader.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reason_wins() {
        let root = CancellationToken::new();
        let handle = CancelHandle::child_of(&root);

        assert_eq!(handle.trigger(CancelReason::UserPause), CancelReason::UserPause);
        assert_eq!(handle.trigger(CancelReason::UserCancel), CancelReason::UserPause);
        assert_eq!(handle.settled_reason(), CancelReason::UserPause);
        assert!(handle.is_triggered());
        assert!(!root.is_cancelled());
    }

    #[test]
    fn test_parent_cancel_means_shutdown() {
        let root = CancellationToken::new();
        let handle = CancelHandle::child_of(&root);
        root.cancel();

        assert!(handle.is_triggered());
        assert_eq!(handle.reason(), None);
        assert_eq!(handle.settled_reason(), CancelReason::ExternalShutdown);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let root = CancellationToken::new();
        let handle = CancelHandle::child_of(&root);
        let task_side = handle.clone();

        let waiter = tokio::spawn(async move {
            task_side.cancelled().await;
            task_side.settled_reason()
        });

        handle.trigger(CancelReason::UserCancel);
        assert_eq!(waiter.await.unwrap(), CancelReason::UserCancel);
    }
}
