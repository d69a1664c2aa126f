//! Connection manager: the per-agent handshake state machine.
//!
//! Every record has two locks. The *pipeline* (`tokio::sync::Mutex`, FIFO)
//! serializes everything that happens to one record, including the network
//! send of a step, in arrival order. The *data* lock guards the record
//! itself and is held only for the duration of a field update.
//!
//! Transitions queue their events on the record's outbox. Each operation
//! drains the outbox after releasing the pipeline, one drainer per record
//! at a time, so subscribers see a record's events in transition order and
//! never run inside the pipeline.
//!
//! All state changes go through [`ConnectionManager::transition`].

use crate::accept::{AcceptPolicy, PendingStep};
use crate::event_bus::EventBus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use didlink_types::config::TimeoutConfig;
use didlink_types::connection::{
    AbandonReason, ConnectionId, ConnectionRecord, ConnectionRole, ConnectionState,
    InvitationId,
};
use didlink_types::error::{DidLinkError, DidLinkResult};
use didlink_types::event::{Event, StateChange, TimeoutNotice};
use didlink_types::identity::IdentityRecord;
use didlink_types::keys::KeyService;
use didlink_wire::invitation::{Invitation, InvitationBuilder};
use didlink_wire::message::{
    ConnectionInfo, ConnectionRequest, ConnectionResponse, HandshakeMessage, HandshakeStep,
    ProblemReport, SignatureDecorator, Thread,
};
use didlink_wire::transport::{InboundHandler, TransportGateway};
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Proof that the caller holds a record's pipeline lock.
type Turn<'a> = MutexGuard<'a, ()>;

/// An invitation this agent issued or received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutOfBandRecord {
    pub invitation: Invitation,
    pub role: ConnectionRole,
    /// The connection record started from this invitation.
    pub connection_id: ConnectionId,
    pub created_at: DateTime<Utc>,
}

struct RecordSlot {
    pipeline: Mutex<()>,
    record: RwLock<ConnectionRecord>,
    /// Events queued by transitions, not yet published.
    outbox: std::sync::Mutex<VecDeque<Event>>,
    /// Held while draining the outbox.
    delivery: Mutex<()>,
}

impl RecordSlot {
    fn new(record: ConnectionRecord) -> Self {
        Self {
            pipeline: Mutex::new(()),
            record: RwLock::new(record),
            outbox: std::sync::Mutex::new(VecDeque::new()),
            delivery: Mutex::new(()),
        }
    }

    fn snapshot(&self) -> ConnectionRecord {
        self.record.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn enqueue(&self, event: Event) {
        self.outbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(event);
    }

    fn next_event(&self) -> Option<Event> {
        self.outbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }
}

type InvitationKey = (InvitationId, ConnectionRole);

/// Owns every connection record of one agent.
pub struct ConnectionManager {
    identity: IdentityRecord,
    /// Hex public key behind `identity.wallet_key`.
    public_key: String,
    keys: Arc<dyn KeyService>,
    gateway: Arc<dyn TransportGateway>,
    bus: Arc<EventBus>,
    policy: Arc<dyn AcceptPolicy>,
    timeouts: TimeoutConfig,
    records: DashMap<ConnectionId, Arc<RecordSlot>>,
    by_invitation: DashMap<InvitationKey, ConnectionId>,
    invitations: DashMap<InvitationKey, OutOfBandRecord>,
}

impl ConnectionManager {
    pub fn new(
        identity: IdentityRecord,
        public_key: String,
        keys: Arc<dyn KeyService>,
        gateway: Arc<dyn TransportGateway>,
        bus: Arc<EventBus>,
        policy: Arc<dyn AcceptPolicy>,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            identity,
            public_key,
            keys,
            gateway,
            bus,
            policy,
            timeouts,
            records: DashMap::new(),
            by_invitation: DashMap::new(),
            invitations: DashMap::new(),
        }
    }

    pub fn identity(&self) -> &IdentityRecord {
        &self.identity
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    // ---- Invitations ----

    /// Issue a standard out-of-band invitation and open an `Invited` record
    /// for it. The invitation carries this agent's public key so the
    /// invitee can check who signs the response.
    pub async fn create_invitation(&self, goal_code: Option<&str>) -> DidLinkResult<Invitation> {
        let mut builder = InvitationBuilder::new(&self.identity).recipient_key(&self.public_key);
        if let Some(goal_code) = goal_code {
            builder = builder.goal_code(goal_code);
        }
        self.issue(builder.build()?).await
    }

    /// Issue a legacy (connections 1.0) invitation.
    pub async fn create_legacy_invitation(&self) -> DidLinkResult<Invitation> {
        let invitation = InvitationBuilder::new(&self.identity)
            .recipient_key(&self.public_key)
            .build_legacy()?;
        self.issue(invitation).await
    }

    async fn issue(&self, invitation: Invitation) -> DidLinkResult<Invitation> {
        let record = ConnectionRecord::invited(
            invitation.id().clone(),
            ConnectionRole::Inviter,
            invitation.protocol(),
        );
        let slot = Arc::new(RecordSlot::new(record));
        {
            let _turn = slot.pipeline.lock().await;
            self.insert(&slot, &invitation)?;
            let record = slot.snapshot();
            info!(
                connection_id = %record.id,
                out_of_band_id = %record.out_of_band_id,
                protocol = %record.protocol,
                "Invitation created"
            );
            self.publish_created(&slot);
        }
        self.deliver(&slot).await;
        Ok(invitation)
    }

    /// Accept an invitation from a peer: open an `Invitee` record and, if
    /// the policy allows, send the connection request right away.
    ///
    /// A transport failure while sending the request is returned, but the
    /// record stays in `Invited`; [`approve`](Self::approve) retries the step.
    pub async fn receive_invitation(
        &self,
        invitation: Invitation,
    ) -> DidLinkResult<ConnectionRecord> {
        let endpoint = invitation.primary_endpoint().map(str::to_string).ok_or_else(|| {
            DidLinkError::MalformedInvitation("invitation has no service endpoint".to_string())
        })?;

        let mut record = ConnectionRecord::invited(
            invitation.id().clone(),
            ConnectionRole::Invitee,
            invitation.protocol(),
        );
        record.their_label = Some(invitation.label().to_string());
        record.their_endpoint = Some(endpoint);
        record.their_key = invitation.recipient_keys().first().map(|k| k.to_string());

        let slot = Arc::new(RecordSlot::new(record));
        let turn = slot.pipeline.lock().await;
        self.insert(&slot, &invitation)?;
        let record = slot.snapshot();
        info!(
            connection_id = %record.id,
            out_of_band_id = %record.out_of_band_id,
            their_label = %invitation.label(),
            "Invitation received"
        );
        self.publish_created(&slot);
        let advanced = self.advance(&slot, &turn).await;
        drop(turn);
        self.deliver(&slot).await;
        advanced?;
        Ok(slot.snapshot())
    }

    /// Register a new record and its invitation, enforcing one record per
    /// `(invitation, role)`. The caller holds the slot's pipeline so nothing
    /// can touch the record before its creation is published.
    fn insert(&self, slot: &Arc<RecordSlot>, invitation: &Invitation) -> DidLinkResult<()> {
        let record = slot.snapshot();
        let key = (record.out_of_band_id.clone(), record.role);
        match self.by_invitation.entry(key.clone()) {
            Entry::Occupied(_) => Err(DidLinkError::InvitationAlreadyReceived(
                record.out_of_band_id.to_string(),
            )),
            Entry::Vacant(vacant) => {
                self.records.insert(record.id, slot.clone());
                self.invitations.insert(
                    key,
                    OutOfBandRecord {
                        invitation: invitation.clone(),
                        role: record.role,
                        connection_id: record.id,
                        created_at: Utc::now(),
                    },
                );
                vacant.insert(record.id);
                Ok(())
            }
        }
    }

    // ---- Local operations ----

    /// Take the pending local step of a record held back by the policy.
    pub async fn approve(&self, id: ConnectionId) -> DidLinkResult<ConnectionRecord> {
        let slot = self.slot(id)?;
        let turn = slot.pipeline.lock().await;
        let record = slot.snapshot();
        let step = PendingStep::for_record(record.role, record.state).ok_or_else(|| {
            DidLinkError::InvalidState {
                current: record.state,
                operation: "approve".to_string(),
            }
        })?;
        info!(connection_id = %id, step = %step, "Step approved");
        let performed = self.perform(&slot, &turn, step).await;
        drop(turn);
        self.deliver(&slot).await;
        performed?;
        Ok(slot.snapshot())
    }

    /// Give up on a record. The peer is told with a problem report when its
    /// endpoint is known; failing to reach it does not fail the call.
    pub async fn abandon(
        &self,
        id: ConnectionId,
        detail: impl Into<String>,
    ) -> DidLinkResult<ConnectionRecord> {
        let slot = self.slot(id)?;
        let turn = slot.pipeline.lock().await;
        let current = slot.snapshot().state;
        if current.is_terminal() {
            return Err(DidLinkError::InvalidState {
                current,
                operation: "abandon".to_string(),
            });
        }
        let reason = AbandonReason::Cancelled {
            detail: detail.into(),
        };
        let record = self.abandon_locked(&slot, &turn, reason.clone())?;
        drop(turn);
        self.deliver(&slot).await;
        self.report_problem(&record, &reason).await;
        Ok(record)
    }

    // ---- Inbound ----

    /// Process one inbound handshake message.
    ///
    /// Returns the record as it stands after the message was applied.
    /// Rejected messages leave every record untouched, except a response
    /// that fails verification, which abandons the invitee's record.
    pub async fn handle_inbound(
        &self,
        bytes: &[u8],
        source: &str,
    ) -> DidLinkResult<ConnectionRecord> {
        let message = HandshakeMessage::decode(bytes)?;
        let slot = self.route(&message)?;
        let turn = slot.pipeline.lock().await;
        let applied = self.apply(&slot, &turn, message, source).await;
        drop(turn);
        self.deliver(&slot).await;
        applied?;
        Ok(slot.snapshot())
    }

    async fn apply(
        &self,
        slot: &RecordSlot,
        turn: &Turn<'_>,
        message: HandshakeMessage,
        source: &str,
    ) -> DidLinkResult<()> {
        let record = slot.snapshot();
        debug!(
            connection_id = %record.id,
            state = %record.state,
            step = %message.step(),
            %source,
            "Handling handshake message"
        );

        if let Some(got) = message.protocol() {
            if got != record.protocol {
                return Err(DidLinkError::ProtocolMismatch {
                    expected: record.protocol,
                    got,
                });
            }
        }

        match message {
            HandshakeMessage::ExchangeRequest(request) | HandshakeMessage::LegacyRequest(request) => {
                self.on_request(slot, turn, request, source).await
            }
            HandshakeMessage::ExchangeResponse(response)
            | HandshakeMessage::LegacyResponse(response) => {
                self.on_response(slot, turn, response).await
            }
            HandshakeMessage::ExchangeComplete(ack) | HandshakeMessage::LegacyAck(ack) => {
                expect_state(&record, ConnectionState::Responded, "receive acknowledgment")?;
                expect_thread(&record, &ack.thread, "acknowledgment")?;
                let record = self.transition(slot, turn, ConnectionState::Completed, |_| {})?;
                info!(connection_id = %record.id, "Connection completed");
                Ok(())
            }
            HandshakeMessage::ProblemReport(report) => self.on_problem_report(slot, turn, report),
        }
    }

    /// Find the record a message belongs to, from its parent thread id and
    /// the role its type implies.
    fn route(&self, message: &HandshakeMessage) -> DidLinkResult<Arc<RecordSlot>> {
        let unknown = || {
            DidLinkError::UnknownInvitation(
                message
                    .thread()
                    .pthid
                    .clone()
                    .unwrap_or_else(|| message.thread().thid.clone()),
            )
        };
        let invitation_id = message.invitation_id().ok_or_else(unknown)?;

        let id = match message.step() {
            HandshakeStep::Request | HandshakeStep::Complete => self
                .by_invitation
                .get(&(invitation_id, ConnectionRole::Inviter))
                .map(|e| *e.value()),
            HandshakeStep::Response => self
                .by_invitation
                .get(&(invitation_id, ConnectionRole::Invitee))
                .map(|e| *e.value()),
            HandshakeStep::ProblemReport => {
                // Either side may report, but only on the record's own
                // thread. A record without a thread yet has no peer to
                // impersonate.
                let thid = message.thread().thid.as_str();
                [ConnectionRole::Inviter, ConnectionRole::Invitee]
                    .into_iter()
                    .filter_map(|role| {
                        self.by_invitation
                            .get(&(invitation_id.clone(), role))
                            .map(|e| *e.value())
                    })
                    .find(|id| self.get(*id).is_some_and(|r| reports_on_thread(&r, thid)))
            }
        };

        let id = id.ok_or_else(unknown)?;
        self.slot(id)
    }

    async fn on_request(
        &self,
        slot: &RecordSlot,
        turn: &Turn<'_>,
        request: ConnectionRequest,
        source: &str,
    ) -> DidLinkResult<()> {
        expect_state(&slot.snapshot(), ConnectionState::Invited, "receive request")?;
        let reply_to = request
            .connection
            .endpoint
            .clone()
            .unwrap_or_else(|| source.to_string());
        let record = self.transition(slot, turn, ConnectionState::Requested, |r| {
            r.thread_id = Some(request.thread.thid.clone());
            r.their_label = Some(request.label.clone());
            r.their_key = Some(request.connection.verkey.clone());
            r.their_endpoint = Some(reply_to);
        })?;
        info!(
            connection_id = %record.id,
            their_label = %request.label,
            "Connection request accepted"
        );
        self.advance(slot, turn).await
    }

    async fn on_response(
        &self,
        slot: &RecordSlot,
        turn: &Turn<'_>,
        response: ConnectionResponse,
    ) -> DidLinkResult<()> {
        let record = slot.snapshot();
        expect_state(&record, ConnectionState::Requested, "receive response")?;
        expect_thread(&record, &response.thread, "response")?;

        let info = match self.verify_response(&record, &response.connection_sig).await {
            Ok(info) => info,
            Err(detail) => {
                warn!(connection_id = %record.id, "Response rejected: {detail}");
                let reason = AbandonReason::SignatureVerificationFailed {
                    detail: detail.clone(),
                };
                let record = self.abandon_locked(slot, turn, reason.clone())?;
                self.report_problem(&record, &reason).await;
                return Err(DidLinkError::SignatureVerificationFailed(detail));
            }
        };

        let record = self.transition(slot, turn, ConnectionState::Responded, |r| {
            r.their_key = Some(info.verkey.clone());
            if let Some(endpoint) = &info.endpoint {
                r.their_endpoint = Some(endpoint.clone());
            }
        })?;
        debug!(connection_id = %record.id, "Connection response verified");
        self.advance(slot, turn).await
    }

    /// Check the response signature and return the signed connection info.
    async fn verify_response(
        &self,
        record: &ConnectionRecord,
        sig: &SignatureDecorator,
    ) -> Result<ConnectionInfo, String> {
        let expected: Vec<String> = self
            .invitations
            .get(&(record.out_of_band_id.clone(), record.role))
            .map(|oob| {
                oob.invitation
                    .recipient_keys()
                    .into_iter()
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if !expected.is_empty() && !expected.contains(&sig.signer) {
            return Err(format!("signer {} is not an invitation key", sig.signer));
        }

        let data = sig.signed_data().map_err(|e| e.to_string())?;
        let signature = sig.signature_bytes().map_err(|e| e.to_string())?;
        if !self.keys.verify(&sig.signer, &data, &signature).await {
            return Err("signature does not verify".to_string());
        }

        let info: ConnectionInfo = serde_json::from_slice(&data)
            .map_err(|e| format!("signed data is not connection info: {e}"))?;
        if info.verkey != sig.signer {
            return Err("signed verkey differs from signer".to_string());
        }
        Ok(info)
    }

    fn on_problem_report(
        &self,
        slot: &RecordSlot,
        turn: &Turn<'_>,
        report: ProblemReport,
    ) -> DidLinkResult<()> {
        let current = slot.snapshot().state;
        if current.is_terminal() {
            return Err(DidLinkError::InvalidState {
                current,
                operation: "receive problem report".to_string(),
            });
        }
        let record = self.abandon_locked(
            slot,
            turn,
            AbandonReason::ProblemReport {
                code: report.code,
                explain: report.explain,
            },
        )?;
        info!(connection_id = %record.id, "Peer abandoned the handshake");
        Ok(())
    }

    // ---- Steps ----

    /// Consult the policy about the record's pending local step and take
    /// it if allowed.
    async fn advance(&self, slot: &RecordSlot, turn: &Turn<'_>) -> DidLinkResult<()> {
        let record = slot.snapshot();
        let Some(step) = PendingStep::for_record(record.role, record.state) else {
            return Ok(());
        };
        if !self.policy.may_proceed(&record, step) {
            debug!(connection_id = %record.id, step = %step, "Awaiting approval");
            return Ok(());
        }
        self.perform(slot, turn, step).await
    }

    /// Send the message for `step`, then move the record forward. A failed
    /// send leaves the state unchanged.
    async fn perform(
        &self,
        slot: &RecordSlot,
        turn: &Turn<'_>,
        step: PendingStep,
    ) -> DidLinkResult<()> {
        let record = slot.snapshot();
        match step {
            PendingStep::SendRequest => {
                let message = HandshakeMessage::request(
                    record.protocol,
                    &record.out_of_band_id,
                    &self.identity.label,
                    self.connection_info(),
                );
                let thid = message.thread().thid.clone();
                self.send(&record, &message).await?;
                self.transition(slot, turn, ConnectionState::Requested, |r| {
                    r.thread_id = Some(thid);
                })?;
            }
            PendingStep::SendResponse => {
                let data = serde_json::to_vec(&self.connection_info())?;
                let signature = self.keys.sign(&self.identity.wallet_key, &data).await?;
                let message = HandshakeMessage::response(
                    record.protocol,
                    thread_of(&record),
                    SignatureDecorator::new(&self.public_key, &data, &signature),
                );
                self.send(&record, &message).await?;
                self.transition(slot, turn, ConnectionState::Responded, |_| {})?;
            }
            PendingStep::SendAck => {
                let message = HandshakeMessage::complete(record.protocol, thread_of(&record));
                self.send(&record, &message).await?;
                let record = self.transition(slot, turn, ConnectionState::Completed, |_| {})?;
                info!(connection_id = %record.id, "Connection completed");
            }
        }
        Ok(())
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            verkey: self.public_key.clone(),
            endpoint: self.identity.primary_endpoint().map(str::to_string),
            routing_keys: self.identity.routing_keys.clone(),
        }
    }

    async fn send(&self, record: &ConnectionRecord, message: &HandshakeMessage) -> DidLinkResult<()> {
        let endpoint = record.their_endpoint.as_deref().ok_or_else(|| {
            DidLinkError::MissingServiceEndpoint(record.their_label.clone().unwrap_or_default())
        })?;
        let bytes = message.encode()?;
        debug!(
            connection_id = %record.id,
            endpoint,
            step = %message.step(),
            "Sending handshake message"
        );
        self.gateway.send(endpoint, bytes).await?;
        Ok(())
    }

    /// Best-effort problem report to the peer.
    async fn report_problem(&self, record: &ConnectionRecord, reason: &AbandonReason) {
        if record.their_endpoint.is_none() {
            return;
        }
        let message =
            HandshakeMessage::problem_report(thread_of(record), reason.code(), reason.to_string());
        if let Err(e) = self.send(record, &message).await {
            warn!(connection_id = %record.id, "Problem report not delivered: {e}");
        }
    }

    // ---- Transitions ----

    /// The only place a record changes state.
    fn transition<F>(
        &self,
        slot: &RecordSlot,
        _turn: &Turn<'_>,
        next: ConnectionState,
        update: F,
    ) -> DidLinkResult<ConnectionRecord>
    where
        F: FnOnce(&mut ConnectionRecord),
    {
        let (record, previous) = {
            let mut record = slot.record.write().unwrap_or_else(|e| e.into_inner());
            let previous = record.state;
            if !previous.can_transition_to(next) {
                return Err(DidLinkError::InvalidState {
                    current: previous,
                    operation: format!("transition to {next}"),
                });
            }
            update(&mut *record);
            record.state = next;
            record.updated_at = Utc::now();
            (record.clone(), previous)
        };

        debug!(
            connection_id = %record.id,
            out_of_band_id = %record.out_of_band_id,
            from = %previous,
            to = %next,
            "State transition"
        );
        slot.enqueue(Event::state_changed(StateChange {
            connection_id: record.id,
            out_of_band_id: record.out_of_band_id.clone(),
            role: record.role,
            previous_state: Some(previous),
            new_state: next,
            reason: record.abandon_reason.clone(),
        }));
        Ok(record)
    }

    fn abandon_locked(
        &self,
        slot: &RecordSlot,
        turn: &Turn<'_>,
        reason: AbandonReason,
    ) -> DidLinkResult<ConnectionRecord> {
        let record = self.transition(slot, turn, ConnectionState::Abandoned, |r| {
            r.abandon_reason = Some(reason);
        })?;
        info!(
            connection_id = %record.id,
            reason = record.abandon_reason.as_ref().map(|r| r.code()).unwrap_or_default(),
            "Connection abandoned"
        );
        Ok(record)
    }

    fn publish_created(&self, slot: &RecordSlot) {
        let record = slot.snapshot();
        slot.enqueue(Event::state_changed(StateChange {
            connection_id: record.id,
            out_of_band_id: record.out_of_band_id.clone(),
            role: record.role,
            previous_state: None,
            new_state: record.state,
            reason: None,
        }));
    }

    /// Publish the record's queued events in order. Called with the
    /// pipeline released; a concurrent drainer of the same record is waited
    /// for, so events never overtake each other.
    async fn deliver(&self, slot: &RecordSlot) {
        let _delivery = slot.delivery.lock().await;
        while let Some(event) = slot.next_event() {
            self.bus.publish(event);
        }
    }

    // ---- Timeouts ----

    /// Abandon every record that sat in its state longer than allowed.
    /// Returns the ids of the records that expired.
    pub async fn sweep_timeouts(&self) -> Vec<ConnectionId> {
        let slots: Vec<Arc<RecordSlot>> =
            self.records.iter().map(|e| e.value().clone()).collect();
        let mut expired = Vec::new();

        for slot in slots {
            if self.expired_dwell(&slot.snapshot()).is_none() {
                continue;
            }
            let turn = slot.pipeline.lock().await;
            // The record may have moved on while we waited for the pipeline.
            let record = slot.snapshot();
            let Some(dwell) = self.expired_dwell(&record) else {
                continue;
            };

            let reason = AbandonReason::Timeout {
                state: record.state,
            };
            let abandoned = match self.abandon_locked(&slot, &turn, reason.clone()) {
                Ok(r) => r,
                Err(e) => {
                    warn!(connection_id = %record.id, "Timeout not applied: {e}");
                    continue;
                }
            };
            warn!(
                connection_id = %record.id,
                state = %record.state,
                dwell_ms = dwell.as_millis() as u64,
                "Handshake timed out"
            );
            slot.enqueue(Event::timed_out(TimeoutNotice {
                connection_id: record.id,
                out_of_band_id: record.out_of_band_id.clone(),
                expired_state: record.state,
                dwell_ms: dwell.as_millis() as u64,
            }));
            drop(turn);
            self.deliver(&slot).await;
            self.report_problem(&abandoned, &reason).await;
            expired.push(record.id);
        }
        expired
    }

    fn expired_dwell(&self, record: &ConnectionRecord) -> Option<std::time::Duration> {
        let limit = self.timeouts.limit_for(record.state)?;
        let dwell = (Utc::now() - record.updated_at).to_std().unwrap_or_default();
        (dwell > limit).then_some(dwell)
    }

    // ---- Queries ----

    fn slot(&self, id: ConnectionId) -> DidLinkResult<Arc<RecordSlot>> {
        self.records
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| DidLinkError::ConnectionNotFound(id.to_string()))
    }

    pub fn get(&self, id: ConnectionId) -> Option<ConnectionRecord> {
        self.records.get(&id).map(|e| e.value().snapshot())
    }

    /// Records started from one invitation (at most one per role).
    pub fn find_by_out_of_band_id(&self, id: &InvitationId) -> Vec<ConnectionRecord> {
        [ConnectionRole::Inviter, ConnectionRole::Invitee]
            .into_iter()
            .filter_map(|role| self.find(id, role))
            .collect()
    }

    pub fn find(&self, id: &InvitationId, role: ConnectionRole) -> Option<ConnectionRecord> {
        let connection_id = *self.by_invitation.get(&(id.clone(), role))?.value();
        self.get(connection_id)
    }

    pub fn all(&self) -> Vec<ConnectionRecord> {
        let mut records: Vec<ConnectionRecord> =
            self.records.iter().map(|e| e.value().snapshot()).collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    pub fn out_of_band_record(
        &self,
        id: &InvitationId,
        role: ConnectionRole,
    ) -> Option<OutOfBandRecord> {
        self.invitations
            .get(&(id.clone(), role))
            .map(|e| e.value().clone())
    }
}

/// Accept a message only in `expected`; a record already past it has
/// seen the message before.
fn expect_state(
    record: &ConnectionRecord,
    expected: ConnectionState,
    operation: &str,
) -> DidLinkResult<()> {
    if record.state == expected {
        Ok(())
    } else if record.state.has_reached(expected) {
        Err(DidLinkError::DuplicateRequest {
            connection_id: record.id,
            state: record.state,
        })
    } else {
        Err(DidLinkError::InvalidState {
            current: record.state,
            operation: operation.to_string(),
        })
    }
}

/// Reject a message that answers a different thread than the record's.
fn expect_thread(record: &ConnectionRecord, thread: &Thread, what: &str) -> DidLinkResult<()> {
    if record.thread_id.as_deref() == Some(thread.thid.as_str()) {
        Ok(())
    } else {
        Err(DidLinkError::MalformedMessage(format!(
            "{what} thread {} does not match request",
            thread.thid
        )))
    }
}

fn reports_on_thread(record: &ConnectionRecord, thid: &str) -> bool {
    match record.thread_id.as_deref() {
        Some(thread_id) => thread_id == thid,
        None => record.state == ConnectionState::Invited,
    }
}

fn thread_of(record: &ConnectionRecord) -> Thread {
    Thread::new(
        record
            .thread_id
            .clone()
            .unwrap_or_else(|| record.out_of_band_id.to_string()),
        &record.out_of_band_id,
    )
}

#[async_trait]
impl InboundHandler for ConnectionManager {
    async fn on_message(&self, message: Vec<u8>, source: String) {
        match self.handle_inbound(&message, &source).await {
            Ok(record) => debug!(
                connection_id = %record.id,
                state = %record.state,
                "Inbound message applied"
            ),
            Err(e) => warn!(%source, "Inbound handshake message rejected: {e}"),
        }
    }
}
