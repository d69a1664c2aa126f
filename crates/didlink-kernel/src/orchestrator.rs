//! Orchestrator: drives one inviter/invitee pair through a full handshake.
//!
//! The inviter issues an invitation, a [`CompletionListener`] is attached
//! to the inviter's bus for that invitation, and the invitee accepts the
//! invitation URL. The listener calls back exactly once, when the inviter's
//! record completes, and then unsubscribes itself. The callback runs on the
//! blocking pool, so it may take its time.

use crate::agent::Agent;
use crate::error::{KernelError, KernelResult};
use crate::event_bus::{EventBus, SubscriptionId};
use didlink_types::connection::{
    AbandonReason, ConnectionId, ConnectionRole, ConnectionState, InvitationId,
};
use didlink_types::error::DidLinkError;
use didlink_types::event::{Event, EventKind, StateChange};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// One-shot observer of a single invitation's outcome.
pub struct CompletionListener<F> {
    out_of_band_id: InvitationId,
    callback: Mutex<Option<F>>,
    outcome: Mutex<Option<oneshot::Sender<StateChange>>>,
    bus: Weak<EventBus>,
    subscription: OnceLock<SubscriptionId>,
}

impl<F> CompletionListener<F>
where
    F: FnOnce(&StateChange) + Send + 'static,
{
    /// Subscribe a listener for `out_of_band_id` on `bus`.
    ///
    /// `on_completed` runs once, on `spawn_blocking`, when the inviter's
    /// record for the invitation completes. The receiver yields that change
    /// after the callback returned, or the `Abandoned` change if the
    /// handshake failed first.
    pub fn attach(
        bus: &Arc<EventBus>,
        out_of_band_id: InvitationId,
        on_completed: F,
    ) -> (Arc<Self>, oneshot::Receiver<StateChange>) {
        let (tx, rx) = oneshot::channel();
        let listener = Arc::new(Self {
            out_of_band_id,
            callback: Mutex::new(Some(on_completed)),
            outcome: Mutex::new(Some(tx)),
            bus: Arc::downgrade(bus),
            subscription: OnceLock::new(),
        });
        let handler = listener.clone();
        let id = bus.subscribe(EventKind::ConnectionStateChanged, move |event: &Event| -> Result<(), String> {
            handler.observe(event);
            Ok(())
        });
        let _ = listener.subscription.set(id);
        (listener, rx)
    }

    fn observe(&self, event: &Event) {
        let Some(change) = event.as_state_change() else {
            return;
        };
        if change.out_of_band_id != self.out_of_band_id || change.role != ConnectionRole::Inviter {
            return;
        }
        match change.new_state {
            ConnectionState::Completed => {
                let callback = self.callback.lock().unwrap_or_else(|e| e.into_inner()).take();
                let Some(callback) = callback else {
                    return;
                };
                let outcome = self.outcome.lock().unwrap_or_else(|e| e.into_inner()).take();
                self.detach();
                let change = change.clone();
                let run = move || {
                    callback(&change);
                    if let Some(tx) = outcome {
                        let _ = tx.send(change);
                    }
                };
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn_blocking(run);
                    }
                    Err(_) => run(),
                }
            }
            ConnectionState::Abandoned => {
                self.callback.lock().unwrap_or_else(|e| e.into_inner()).take();
                let outcome = self.outcome.lock().unwrap_or_else(|e| e.into_inner()).take();
                if let Some(tx) = outcome {
                    let _ = tx.send(change.clone());
                }
                self.detach();
            }
            _ => {}
        }
    }

    /// Remove the subscription. Safe to call more than once.
    pub fn detach(&self) {
        if let (Some(bus), Some(id)) = (self.bus.upgrade(), self.subscription.get()) {
            if bus.unsubscribe(*id) {
                debug!(out_of_band_id = %self.out_of_band_id, "Completion listener detached");
            }
        }
    }

    /// Whether the callback was dispatched (or discarded).
    pub fn has_fired(&self) -> bool {
        self.callback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }
}

/// A handshake in flight, started by [`Orchestrator::connect`].
pub struct PendingConnection {
    pub out_of_band_id: InvitationId,
    pub invitation_url: String,
    /// The invitee's record.
    pub invitee_connection: ConnectionId,
    outcome: oneshot::Receiver<StateChange>,
}

impl PendingConnection {
    /// Wait for the inviter's record to complete.
    pub async fn wait(self, timeout: Duration) -> KernelResult<StateChange> {
        let change = match tokio::time::timeout(timeout, self.outcome).await {
            Ok(Ok(change)) => change,
            Ok(Err(_)) => return Err(KernelError::ListenerClosed),
            Err(_) => return Err(KernelError::WaitTimedOut(timeout)),
        };
        if change.new_state == ConnectionState::Completed {
            return Ok(change);
        }
        let err = match change.reason {
            Some(AbandonReason::Timeout { state }) => DidLinkError::HandshakeTimeout {
                connection_id: change.connection_id,
                state,
            },
            Some(AbandonReason::SignatureVerificationFailed { detail }) => {
                DidLinkError::SignatureVerificationFailed(detail)
            }
            _ => DidLinkError::InvalidState {
                current: ConnectionState::Abandoned,
                operation: "connect".to_string(),
            },
        };
        Err(err.into())
    }
}

/// Connects agents through out-of-band invitation URLs.
pub struct Orchestrator {
    domain: String,
}

impl Orchestrator {
    /// `domain` is the host invitation URLs are minted under.
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Start a handshake from `inviter` to `invitee`.
    ///
    /// `on_completed` fires once, when the inviter's record reaches
    /// `Completed`. If the invitee cannot accept the invitation the listener
    /// is detached and the error returned.
    pub async fn connect<F>(
        &self,
        inviter: &Agent,
        invitee: &Agent,
        on_completed: F,
    ) -> KernelResult<PendingConnection>
    where
        F: FnOnce(&StateChange) + Send + 'static,
    {
        let invitation = inviter.create_invitation().await?;
        let invitation_url = invitation.to_url(&self.domain)?;
        let out_of_band_id = invitation.id().clone();
        info!(
            inviter = %inviter.label(),
            invitee = %invitee.label(),
            %out_of_band_id,
            "Connecting agents"
        );

        let (listener, outcome) =
            CompletionListener::attach(inviter.events(), out_of_band_id.clone(), on_completed);

        let record = match invitee.receive_invitation_from_url(&invitation_url).await {
            Ok(record) => record,
            Err(e) => {
                listener.detach();
                return Err(e);
            }
        };

        Ok(PendingConnection {
            out_of_band_id,
            invitation_url,
            invitee_connection: record.id,
            outcome,
        })
    }
}
