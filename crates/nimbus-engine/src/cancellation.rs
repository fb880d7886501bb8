//! Per-turn cooperative cancellation.
//!
//! `cancel` does two independent things: it fires the turn's local token
//! (the read loop stops at once) and it calls the server's cancel endpoint.
//! Neither waits for the other. Repeat calls for the same turn are absorbed
//! while the first is in flight and for a cool-down afterwards, so the
//! server sees at most one cancel request per burst.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nimbus_core::TurnId;
use nimbus_transport::{SseClient, TransportError};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Out-of-band server cancel call.
#[async_trait]
pub trait RemoteCancel: Send + Sync {
    /// Ask the server to stop `turn_id`; `Ok(true)` when it confirmed.
    async fn cancel_remote(&self, turn_id: &TurnId, reason: &str) -> Result<bool, TransportError>;
}

#[async_trait]
impl RemoteCancel for SseClient {
    async fn cancel_remote(&self, turn_id: &TurnId, reason: &str) -> Result<bool, TransportError> {
        let ack = self.cancel_query(turn_id.as_str(), reason).await?;
        Ok(ack.success)
    }
}

/// Result of one [`CancellationController::cancel`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    /// This call performed the cancellation.
    Cancelled {
        /// A local token was registered and fired.
        local_aborted: bool,
        /// The server confirmed the cancel.
        remote_acknowledged: bool,
    },
    /// Another call for the same turn is in flight or cooling down.
    Duplicate,
}

#[derive(Clone, Copy, Debug)]
enum CancelState {
    InFlight,
    CoolingDown(Instant),
}

#[derive(Default)]
struct Inner {
    tokens: HashMap<TurnId, CancellationToken>,
    requests: HashMap<TurnId, CancelState>,
}

/// Claim on one turn's cancel request.
///
/// Dropping it starts the cool-down, so an abandoned or hung server call
/// cannot pin the turn in flight.
struct CancelClaim {
    inner: Arc<Mutex<Inner>>,
    turn_id: TurnId,
}

impl Drop for CancelClaim {
    fn drop(&mut self) {
        let _ = self
            .inner
            .lock()
            .requests
            .insert(self.turn_id.clone(), CancelState::CoolingDown(Instant::now()));
    }
}

/// Idempotent cancellation for concurrently running turns.
pub struct CancellationController {
    remote: Arc<dyn RemoteCancel>,
    cooldown: Duration,
    inner: Arc<Mutex<Inner>>,
}

impl CancellationController {
    /// Create a controller using `remote` for server calls.
    pub fn new(remote: Arc<dyn RemoteCancel>, cooldown: Duration) -> Self {
        Self {
            remote,
            cooldown,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Register the local token of a running turn.
    pub fn register(&self, turn_id: TurnId, token: CancellationToken) {
        let _ = self.inner.lock().tokens.insert(turn_id, token);
    }

    /// Forget the token of a finished turn.
    pub fn unregister(&self, turn_id: &TurnId) {
        let _ = self.inner.lock().tokens.remove(turn_id);
    }

    /// Whether a token is registered for `turn_id`.
    pub fn is_registered(&self, turn_id: &TurnId) -> bool {
        self.inner.lock().tokens.contains_key(turn_id)
    }

    /// Cancel `turn_id`: abort locally, then await the server call.
    ///
    /// The turn may reach `cancelled` through its local token before this
    /// returns, and the server may still be generating when it does.
    pub async fn cancel(&self, turn_id: &TurnId, reason: &str) -> CancelOutcome {
        let Some((local_aborted, claim)) = self.begin(turn_id) else {
            return CancelOutcome::Duplicate;
        };
        let remote_acknowledged = self.call_remote(turn_id, reason).await;
        drop(claim);
        CancelOutcome::Cancelled {
            local_aborted,
            remote_acknowledged,
        }
    }

    /// Non-blocking variant for teardown.
    ///
    /// The local abort happens before this returns; the server call runs on
    /// a spawned task. Returns `None` for duplicates or outside a runtime.
    pub fn cancel_detached(
        self: &Arc<Self>,
        turn_id: TurnId,
        reason: String,
    ) -> Option<JoinHandle<CancelOutcome>> {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(%turn_id, "no runtime for detached cancel, aborting locally only");
            if let Some(token) = self.inner.lock().tokens.get(&turn_id) {
                token.cancel();
            }
            return None;
        };
        let (local_aborted, claim) = self.begin(&turn_id)?;
        let controller = Arc::clone(self);
        Some(handle.spawn(async move {
            let remote_acknowledged = controller.call_remote(&turn_id, &reason).await;
            drop(claim);
            CancelOutcome::Cancelled {
                local_aborted,
                remote_acknowledged,
            }
        }))
    }

    /// Claim the cancellation and fire the local token.
    ///
    /// Returns `None` when absorbed as a duplicate, otherwise whether a local
    /// token was fired plus the claim that ends the in-flight state.
    fn begin(&self, turn_id: &TurnId) -> Option<(bool, CancelClaim)> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let cooldown = self.cooldown;
        inner.requests.retain(|_, state| match state {
            CancelState::InFlight => true,
            CancelState::CoolingDown(since) => now.duration_since(*since) < cooldown,
        });

        if inner.requests.contains_key(turn_id) {
            debug!(%turn_id, "duplicate cancel absorbed");
            return None;
        }
        let _ = inner.requests.insert(turn_id.clone(), CancelState::InFlight);

        let token = inner.tokens.get(turn_id).cloned();
        drop(inner);
        let claim = CancelClaim {
            inner: Arc::clone(&self.inner),
            turn_id: turn_id.clone(),
        };

        if let Some(token) = &token {
            token.cancel();
        }
        info!(%turn_id, local = token.is_some(), "cancelling turn");
        Some((token.is_some(), claim))
    }

    async fn call_remote(&self, turn_id: &TurnId, reason: &str) -> bool {
        match self.remote.cancel_remote(turn_id, reason).await {
            Ok(acknowledged) => acknowledged,
            Err(e) => {
                warn!(%turn_id, error = %e, category = e.category(), "server cancel call failed");
                false
            }
        }
    }
}
