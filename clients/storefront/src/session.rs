//! Session-scoped application state
//!
//! One [`SessionController`] owns the user's wallet view for the lifetime
//! of a session. Readers take a [`SessionSnapshot`] or subscribe to changes.
//! Optimistic point changes are recorded as pending deltas under a token
//! and are later confirmed against server truth or rolled back, so the
//! displayed total never drifts from the ledger once calls settle.
//!
//! Responses can settle out of order. A wallet older (by `updated_at`) than
//! the one already confirmed only settles its token; it never replaces
//! newer balances.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

use storefront_rs::models::Wallet;
use storefront_rs::routes::wallet::{AddPointsRequest, PointsResponse};

use crate::client::StorefrontClient;
use crate::error::ClientError;

/// Identifies one optimistic delta until it is confirmed or rolled back
pub type DeltaToken = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingDelta {
    pub token: DeltaToken,
    pub delta: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub user_id: Option<String>,
    pub confirmed_points: i64,
    pub pending: Vec<PendingDelta>,
    pub balance_minor: i64,
    pub cart_count: i64,
    /// `updated_at` of the wallet the confirmed values came from
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl SessionSnapshot {
    /// Confirmed points plus every pending optimistic delta
    pub fn displayed_points(&self) -> i64 {
        self.confirmed_points + self.pending.iter().map(|p| p.delta).sum::<i64>()
    }

    fn accepts(&self, wallet: &Wallet) -> bool {
        self.user_id.as_deref() == Some(wallet.user_id.as_str())
    }

    /// Take the wallet's balances unless a newer wallet is already confirmed.
    /// Returns whether they were taken.
    fn adopt(&mut self, wallet: &Wallet) -> bool {
        if self.confirmed_at.is_some_and(|at| wallet.updated_at < at) {
            return false;
        }
        self.confirmed_points = wallet.points_balance;
        self.balance_minor = wallet.balance_minor;
        self.confirmed_at = Some(wallet.updated_at);
        true
    }
}

pub struct SessionController {
    state: watch::Sender<SessionSnapshot>,
    next_token: AtomicU64,
}

impl Default for SessionController {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionController {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SessionSnapshot::default());
        Self {
            state,
            next_token: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    pub fn displayed_points(&self) -> i64 {
        self.state.borrow().displayed_points()
    }

    /// Begin a session from the server's wallet; any previous session is discarded
    pub fn start(&self, user_id: &str, wallet: &Wallet) {
        self.state.send_replace(SessionSnapshot {
            user_id: Some(user_id.to_string()),
            confirmed_points: wallet.points_balance,
            pending: Vec::new(),
            balance_minor: wallet.balance_minor,
            cart_count: 0,
            confirmed_at: Some(wallet.updated_at),
        });
        tracing::debug!(user_id = %user_id, "Session started");
    }

    pub fn end(&self) {
        self.state.send_replace(SessionSnapshot::default());
        tracing::debug!("Session ended");
    }

    /// Record an optimistic point change; fails outside a session
    pub fn record(&self, delta: i64) -> Result<DeltaToken, ClientError> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut recorded = false;
        self.state.send_if_modified(|snapshot| {
            if snapshot.user_id.is_none() {
                return false;
            }
            snapshot.pending.push(PendingDelta { token, delta });
            recorded = true;
            true
        });

        if recorded {
            Ok(token)
        } else {
            Err(ClientError::NoSession)
        }
    }

    /// Settle a pending delta with the wallet the server returned.
    /// Returns false when the wallet belongs to another user or no session is active.
    pub fn confirm(&self, token: DeltaToken, wallet: &Wallet) -> bool {
        let mut accepted = false;
        self.state.send_if_modified(|snapshot| {
            if !snapshot.accepts(wallet) {
                return false;
            }
            accepted = true;
            let before = snapshot.pending.len();
            snapshot.pending.retain(|p| p.token != token);
            let adopted = snapshot.adopt(wallet);
            adopted || snapshot.pending.len() != before
        });
        accepted
    }

    /// Drop a pending delta whose server call failed
    pub fn rollback(&self, token: DeltaToken) -> bool {
        self.state.send_if_modified(|snapshot| {
            let before = snapshot.pending.len();
            snapshot.pending.retain(|p| p.token != token);
            snapshot.pending.len() != before
        })
    }

    /// Replace confirmed values with server truth and drop every pending delta.
    /// A wallet older than the confirmed one leaves the confirmed values alone.
    pub fn resync(&self, wallet: &Wallet) -> bool {
        let mut accepted = false;
        self.state.send_if_modified(|snapshot| {
            if !snapshot.accepts(wallet) {
                return false;
            }
            accepted = true;
            snapshot.pending.clear();
            snapshot.adopt(wallet);
            true
        });
        accepted
    }

    pub fn set_cart_count(&self, count: i64) {
        self.state.send_if_modified(|snapshot| {
            if snapshot.user_id.is_none() || snapshot.cart_count == count {
                return false;
            }
            snapshot.cart_count = count;
            true
        });
    }

    /// Show `delta` immediately, then post it to the ledger.
    ///
    /// The pending delta is confirmed with the returned wallet on success and
    /// rolled back on any error.
    pub async fn apply_points(
        &self,
        client: &StorefrontClient,
        delta: i64,
        reason: &str,
        idempotency_key: Option<&str>,
    ) -> Result<PointsResponse, ClientError> {
        let user_id = self.snapshot().user_id.ok_or(ClientError::NoSession)?;
        let token = self.record(delta)?;

        let request = AddPointsRequest {
            delta,
            reason: reason.to_string(),
            idempotency_key: None,
        };
        match client.add_points(&user_id, &request, idempotency_key).await {
            Ok(response) => {
                self.confirm(token, &response.wallet);
                Ok(response)
            }
            Err(e) => {
                tracing::warn!(user_id = %user_id, delta, error = %e, "Rolling back optimistic points");
                self.rollback(token);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    fn wallet(user_id: &str, points: i64, balance: i64) -> Wallet {
        wallet_at(user_id, points, balance, Utc::now())
    }

    fn wallet_at(user_id: &str, points: i64, balance: i64, updated_at: DateTime<Utc>) -> Wallet {
        Wallet {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            balance_minor: balance,
            points_balance: points,
            currency: "EGP".to_string(),
            created_at: updated_at,
            updated_at,
        }
    }

    #[test]
    fn test_record_requires_session() {
        let session = SessionController::new();
        assert!(matches!(session.record(10), Err(ClientError::NoSession)));
    }

    #[test]
    fn test_displayed_points_include_pending() {
        let session = SessionController::new();
        session.start("u1", &wallet("u1", 100, 0));

        let a = session.record(10).unwrap();
        let _b = session.record(5).unwrap();
        assert_eq!(session.displayed_points(), 115);

        assert!(session.confirm(a, &wallet("u1", 110, 0)));
        assert_eq!(session.snapshot().confirmed_points, 110);
        assert_eq!(session.displayed_points(), 115);
    }

    #[test]
    fn test_late_older_response_does_not_overwrite_newer_wallet() {
        let t0 = Utc.with_ymd_and_hms(2025, 3, 15, 10, 0, 0).unwrap();
        let session = SessionController::new();
        session.start("u1", &wallet_at("u1", 100, 0, t0));

        let a = session.record(10).unwrap();
        let b = session.record(5).unwrap();

        // The server applied `a` first (110) then `b` (115), but `b` answers first
        assert!(session.confirm(b, &wallet_at("u1", 115, 0, t0 + Duration::seconds(2))));
        assert!(session.confirm(a, &wallet_at("u1", 110, 0, t0 + Duration::seconds(1))));

        let snapshot = session.snapshot();
        assert!(snapshot.pending.is_empty());
        assert_eq!(snapshot.confirmed_points, 115);
        assert_eq!(snapshot.displayed_points(), 115);
        assert_eq!(snapshot.confirmed_at, Some(t0 + Duration::seconds(2)));

        // A stale resync clears pendings but keeps the newer values
        session.record(7).unwrap();
        assert!(session.resync(&wallet_at("u1", 100, 0, t0)));
        assert_eq!(session.displayed_points(), 115);
    }

    #[test]
    fn test_rollback_restores_display() {
        let session = SessionController::new();
        session.start("u1", &wallet("u1", 40, 0));

        let token = session.record(25).unwrap();
        assert_eq!(session.displayed_points(), 65);
        assert!(session.rollback(token));
        assert_eq!(session.displayed_points(), 40);
        assert!(!session.rollback(token));
    }

    #[test]
    fn test_resync_drops_pending_and_ignores_other_users() {
        let session = SessionController::new();
        session.start("u1", &wallet("u1", 0, 500));
        session.record(30).unwrap();

        assert!(!session.resync(&wallet("u2", 999, 999)));
        assert_eq!(session.displayed_points(), 30);

        assert!(session.resync(&wallet("u1", 12, 700)));
        let snapshot = session.snapshot();
        assert!(snapshot.pending.is_empty());
        assert_eq!(snapshot.displayed_points(), 12);
        assert_eq!(snapshot.balance_minor, 700);
    }

    #[tokio::test]
    async fn test_subscribers_see_changes_and_end_clears() {
        let session = SessionController::new();
        let mut rx = session.subscribe();

        session.start("u1", &wallet("u1", 5, 0));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().user_id.as_deref(), Some("u1"));

        session.set_cart_count(3);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().cart_count, 3);

        session.end();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), SessionSnapshot::default());
    }
}
