//! Encounter Sync Engine
//!
//! The single supervising object: it owns the encounter registry, the
//! broadcast manager and the session supervisor, wires the listeners, and
//! turns validated client requests into authorized state machine calls.
//! Several independent engines can live in one process.
//!
//! Failures stay at the request boundary: validation and authorization
//! errors go back to the originating connection as `ERROR` messages with the
//! request's `requestId`, and never to other subscribers.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::core::broadcast::{BroadcastManager, ConnectionHandle, DeliveryPolicy, Outbound};
use crate::core::collaborators::{
    Authenticator, Authorization, AuthorizationService, ConditionCatalog, TacticalDecisionProvider, TokenDirectory,
};
use crate::core::encounter::{
    Combatant, EncounterMachine, EncounterRegistry, EncounterSnapshot, EncounterStatus, EventContext,
};
use crate::core::error::{EngineError, Result};
use crate::core::persistence::{
    EncounterStore, PersistenceSynchronizer, SessionStatus, SessionStatusStore, StoreResult, SyncListener,
};
use crate::core::protocol::{ActorSpec, ClientRequest, InboundEnvelope, OutboundType, ServerMessage};
use crate::core::supervisor::SessionSupervisor;

/// Collaborators the engine consumes
#[derive(Clone)]
pub struct EngineServices {
    pub encounters: Arc<dyn EncounterStore>,
    pub sessions: Arc<dyn SessionStatusStore>,
    pub authorization: Arc<dyn AuthorizationService>,
    pub authenticator: Arc<dyn Authenticator>,
    pub tokens: Arc<dyn TokenDirectory>,
    pub tactics: Arc<dyn TacticalDecisionProvider>,
    pub catalog: Arc<dyn ConditionCatalog>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub delivery: DeliveryPolicy,
    pub grace_period: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            delivery: DeliveryPolicy::default(),
            grace_period: Duration::from_secs(30),
        }
    }
}

pub struct Engine {
    registry: Arc<EncounterRegistry>,
    broadcaster: Arc<BroadcastManager>,
    supervisor: Arc<SessionSupervisor>,
    sync: SyncListener,
    services: EngineServices,
    settings: EngineSettings,
}

impl Engine {
    /// Build an engine. The returned synchronizer must be spawned
    /// (`tokio::spawn(sync.run())`) for write-back to happen.
    pub fn new(services: EngineServices, settings: EngineSettings) -> (Arc<Self>, PersistenceSynchronizer) {
        let registry = Arc::new(EncounterRegistry::new(services.catalog.clone()));
        let broadcaster = Arc::new(BroadcastManager::new());
        registry.add_listener(broadcaster.clone());

        let (sync, synchronizer) = PersistenceSynchronizer::new(services.encounters.clone(), &registry);
        registry.add_listener(Arc::new(sync.clone()));

        let supervisor = Arc::new(SessionSupervisor::new(
            broadcaster.clone(),
            registry.clone(),
            services.sessions.clone(),
            settings.grace_period,
        ));

        let engine = Arc::new(Self {
            registry,
            broadcaster,
            supervisor,
            sync,
            services,
            settings,
        });
        (engine, synchronizer)
    }

    pub fn registry(&self) -> &Arc<EncounterRegistry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Arc<BroadcastManager> {
        &self.broadcaster
    }

    pub fn supervisor(&self) -> &Arc<SessionSupervisor> {
        &self.supervisor
    }

    /// Wait until every event committed so far has been written back
    pub async fn flush_persistence(&self) {
        self.sync.flush().await;
    }

    // ========================================================================
    // Connection Lifecycle
    // ========================================================================

    /// Accept a new connection; the receiver feeds the transport writer
    pub fn connect(&self) -> (ConnectionHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (handle, rx) = ConnectionHandle::new(self.settings.delivery);
        self.broadcaster.register(handle.clone());
        tracing::info!(connection_id = %handle.id(), "Connection accepted");
        (handle, rx)
    }

    /// Tear down a connection: its subscriptions go, encounter state stays
    pub fn disconnect(&self, connection_id: &str) {
        if let Some(record) = self.broadcaster.remove_connection(connection_id) {
            record.handle.mark_closed();
            tracing::info!(
                connection_id,
                user_id = record.user_id.as_deref().unwrap_or("-"),
                session_id = record.session_id.as_deref().unwrap_or("-"),
                "Connection closed"
            );
        }
        self.supervisor.connection_closed(connection_id, Instant::now());
    }

    // ========================================================================
    // Request Handling
    // ========================================================================

    /// Handle one raw text frame. Every failure is answered on the same
    /// connection.
    pub async fn handle_text(&self, connection_id: &str, text: &str) {
        let envelope = match InboundEnvelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.reply_error(connection_id, &e, salvage_request_id(text));
                return;
            }
        };
        let request_id = envelope.request_id.clone();
        let outcome = match ClientRequest::parse(&envelope) {
            Ok(request) => self.handle(connection_id, request, request_id.clone()).await,
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            tracing::debug!(
                connection_id,
                message_type = %envelope.message_type,
                code = e.code(),
                error = %e,
                "Request rejected"
            );
            self.reply_error(connection_id, &e, request_id);
        }
    }

    /// Dispatch a validated request on behalf of a connection
    pub async fn handle(&self, connection_id: &str, request: ClientRequest, request_id: Option<String>) -> Result<()> {
        match request {
            ClientRequest::Ack { ack_id } => self.acknowledge(connection_id, ack_id, request_id),
            ClientRequest::Authenticate { token } => self.authenticate(connection_id, &token, request_id).await,
            request => {
                let user_id = self
                    .broadcaster
                    .user_of(connection_id)
                    .ok_or_else(|| EngineError::Unauthorized("Connection is not authenticated".into()))?;
                self.dispatch(connection_id, &user_id, request, request_id).await
            }
        }
    }

    async fn dispatch(
        &self,
        connection_id: &str,
        user_id: &str,
        request: ClientRequest,
        request_id: Option<String>,
    ) -> Result<()> {
        match request {
            ClientRequest::JoinSession { session_id } => {
                self.join_session(connection_id, user_id, &session_id).await?;
                self.reply(connection_id, ServerMessage::session_joined(&session_id), request_id);
                Ok(())
            }

            ClientRequest::Subscribe { encounter_id } => {
                let session_id = self.ensure_loaded(&encounter_id).await?;
                self.require(self.services.authorization.can_join_session(user_id, &session_id).await)?;
                match self.broadcaster.record(connection_id).and_then(|r| r.session_id) {
                    Some(bound) if bound != session_id => {
                        return Err(EngineError::InvalidState(format!(
                            "Connection belongs to session {}",
                            bound
                        )));
                    }
                    Some(_) => {}
                    None => self.join_session(connection_id, user_id, &session_id).await?,
                }
                self.broadcaster
                    .subscribe(&self.registry, connection_id, &encounter_id, request_id)?;
                Ok(())
            }

            ClientRequest::Unsubscribe { encounter_id } => {
                self.broadcaster.unsubscribe(connection_id, &encounter_id);
                self.reply(connection_id, ServerMessage::unsubscribed(&encounter_id), request_id);
                Ok(())
            }

            ClientRequest::CreateEncounter { session_id, name, combatants } => {
                self.create_encounter(connection_id, user_id, &session_id, name, combatants, request_id)
                    .await
            }

            ClientRequest::StartEncounter { encounter_id, combatants } => {
                let session_id = self.ensure_loaded(&encounter_id).await?;
                self.require_manager(user_id, &session_id).await?;
                let combatants = combatants
                    .into_iter()
                    .map(|spec| spec.into_combatant(None))
                    .collect::<Result<Vec<_>>>()?;
                self.mutate(connection_id, request_id, &encounter_id, |m, _| m.start(combatants))
            }

            ClientRequest::NextTurn { encounter_id } => {
                let session_id = self.ensure_loaded(&encounter_id).await?;
                self.require_turn_control(user_id, &encounter_id, &session_id).await?;
                self.mutate(connection_id, request_id, &encounter_id, |m, _| m.next_turn())
            }

            ClientRequest::PauseEncounter { encounter_id } => {
                let session_id = self.ensure_loaded(&encounter_id).await?;
                self.require_manager(user_id, &session_id).await?;
                self.mutate(connection_id, request_id, &encounter_id, |m, _| m.pause())
            }

            ClientRequest::ResumeEncounter { encounter_id } => {
                let session_id = self.ensure_loaded(&encounter_id).await?;
                self.require_manager(user_id, &session_id).await?;
                self.mutate(connection_id, request_id, &encounter_id, |m, _| m.resume())
            }

            ClientRequest::ResetEncounter { encounter_id } => {
                let session_id = self.ensure_loaded(&encounter_id).await?;
                self.require_manager(user_id, &session_id).await?;
                self.mutate(connection_id, request_id, &encounter_id, |m, _| m.reset())
            }

            ClientRequest::EndEncounter { encounter_id } => {
                let session_id = self.ensure_loaded(&encounter_id).await?;
                self.require_manager(user_id, &session_id).await?;
                self.mutate(connection_id, request_id, &encounter_id, |m, _| Ok(m.end()))
            }

            ClientRequest::UpdateActorHealth { encounter_id, actor_id, health } => {
                let session_id = self.ensure_loaded(&encounter_id).await?;
                self.require_combatant_control(user_id, &encounter_id, &session_id, &actor_id)
                    .await?;
                self.mutate(connection_id, request_id, &encounter_id, |m, _| {
                    m.set_hit_points(&actor_id, health)
                })
            }

            ClientRequest::ApplyDamage { encounter_id, actor_id, amount } => {
                let session_id = self.ensure_loaded(&encounter_id).await?;
                self.require_combatant_control(user_id, &encounter_id, &session_id, &actor_id)
                    .await?;
                self.mutate(connection_id, request_id, &encounter_id, |m, _| {
                    m.apply_damage(&actor_id, amount)
                })
            }

            ClientRequest::ApplyHealing { encounter_id, actor_id, amount } => {
                let session_id = self.ensure_loaded(&encounter_id).await?;
                self.require_combatant_control(user_id, &encounter_id, &session_id, &actor_id)
                    .await?;
                self.mutate(connection_id, request_id, &encounter_id, |m, _| {
                    m.apply_healing(&actor_id, amount)
                })
            }

            ClientRequest::ApplyCondition { encounter_id, actor_id, condition } => {
                let session_id = self.ensure_loaded(&encounter_id).await?;
                self.require_combatant_control(user_id, &encounter_id, &session_id, &actor_id)
                    .await?;
                self.mutate(connection_id, request_id, &encounter_id, |m, catalog| {
                    m.add_condition(&actor_id, condition, catalog)
                })
            }

            ClientRequest::RemoveCondition { encounter_id, actor_id, name } => {
                let session_id = self.ensure_loaded(&encounter_id).await?;
                self.require_combatant_control(user_id, &encounter_id, &session_id, &actor_id)
                    .await?;
                self.mutate(connection_id, request_id, &encounter_id, |m, _| {
                    m.remove_condition(&actor_id, &name)
                })
            }

            ClientRequest::AddActor { encounter_id, actor_id, actor, initiative } => {
                let session_id = self.ensure_loaded(&encounter_id).await?;
                self.require_manager(user_id, &session_id).await?;
                let combatant = self.resolve_actor(&session_id, &actor_id, actor, initiative).await?;
                self.mutate(connection_id, request_id, &encounter_id, |m, _| m.add_combatant(combatant))
            }

            ClientRequest::RemoveActor { encounter_id, actor_id } => {
                let session_id = self.ensure_loaded(&encounter_id).await?;
                self.require_manager(user_id, &session_id).await?;
                self.mutate(connection_id, request_id, &encounter_id, |m, _| {
                    m.remove_combatant(&actor_id)
                })
            }

            ClientRequest::RequestTacticalDecision { encounter_id, actor_id } => {
                let session_id = self.ensure_loaded(&encounter_id).await?;
                self.require(self.services.authorization.can_join_session(user_id, &session_id).await)?;
                let snapshot = self.registry.snapshot(&encounter_id)?;
                let decision = self.services.tactics.decide(&snapshot, &actor_id).await?;
                let message = ServerMessage::new(
                    OutboundType::TacticalDecision,
                    json!({ "encounterId": encounter_id, "decision": decision }),
                );
                self.reply(connection_id, message, request_id);
                Ok(())
            }

            ClientRequest::Authenticate { .. } | ClientRequest::Ack { .. } => Ok(()),
        }
    }

    // ========================================================================
    // Handshake & Membership
    // ========================================================================

    async fn authenticate(&self, connection_id: &str, token: &str, request_id: Option<String>) -> Result<()> {
        let user_id = self
            .services
            .authenticator
            .authenticate(token)
            .await
            .ok_or_else(|| EngineError::Unauthorized("Invalid authentication token".into()))?;
        self.broadcaster.authenticate(connection_id, &user_id)?;
        tracing::info!(connection_id, user_id = %user_id, "Connection authenticated");
        self.reply(connection_id, ServerMessage::authenticated(&user_id), request_id);
        Ok(())
    }

    async fn join_session(&self, connection_id: &str, user_id: &str, session_id: &str) -> Result<()> {
        self.require(self.services.authorization.can_join_session(user_id, session_id).await)?;

        let status = self
            .services
            .sessions
            .session_status(session_id)
            .await
            .map_err(|e| {
                tracing::warn!(session_id, error = %e, "Failed to read session status");
                EngineError::session_not_found(session_id)
            })?
            .ok_or_else(|| EngineError::session_not_found(session_id))?;

        if status.is_terminal() {
            return Err(EngineError::InvalidState(format!("Session {} is {}", session_id, status)));
        }

        self.broadcaster.bind_session(connection_id, session_id)?;

        if matches!(status, SessionStatus::Paused | SessionStatus::Planned) {
            if let Err(e) = self
                .services
                .sessions
                .set_session_status(session_id, SessionStatus::Active)
                .await
            {
                tracing::error!(session_id, operation = "activate_session", error = %e, "Failed to persist session status");
            }
        }

        self.supervisor.join(session_id, connection_id);
        tracing::info!(connection_id, user_id, session_id, "Joined session");
        Ok(())
    }

    // ========================================================================
    // Encounters
    // ========================================================================

    async fn create_encounter(
        &self,
        connection_id: &str,
        user_id: &str,
        session_id: &str,
        name: String,
        specs: Vec<ActorSpec>,
        request_id: Option<String>,
    ) -> Result<()> {
        self.require_manager(user_id, session_id).await?;
        match self.services.sessions.session_status(session_id).await {
            Ok(Some(status)) if status.is_terminal() => {
                return Err(EngineError::InvalidState(format!("Session {} is {}", session_id, status)));
            }
            Ok(Some(_)) => {}
            Ok(None) => return Err(EngineError::session_not_found(session_id)),
            Err(e) => {
                tracing::warn!(session_id, error = %e, "Failed to read session status");
                return Err(EngineError::session_not_found(session_id));
            }
        }

        let combatants = specs
            .into_iter()
            .map(|spec| spec.into_combatant(None))
            .collect::<Result<Vec<Combatant>>>()?;
        let mut seen = HashSet::new();
        if let Some(duplicate) = combatants.iter().find(|c| !seen.insert(c.id.as_str())) {
            return Err(EngineError::Validation(format!("Combatant {} listed twice", duplicate.id)));
        }

        let encounter_id = uuid::Uuid::new_v4().to_string();
        let machine = EncounterMachine::new(encounter_id.clone(), session_id, name, combatants);
        self.registry
            .create(machine, &EventContext::from_request(connection_id, request_id))?;
        tracing::info!(encounter_id = %encounter_id, session_id, user_id, "Encounter created");
        Ok(())
    }

    /// Make sure the encounter is live, hydrating it from storage if needed.
    /// Returns its session id.
    async fn ensure_loaded(&self, encounter_id: &str) -> Result<String> {
        if let Ok(session_id) = self.registry.inspect(encounter_id, |m| m.session_id().to_string()) {
            return Ok(session_id);
        }

        match self.services.encounters.load_encounter(encounter_id).await {
            Ok(Some(snapshot)) if snapshot.status != EncounterStatus::Completed => {
                if self.registry.insert_restored(EncounterMachine::restore(snapshot)) {
                    tracing::info!(encounter_id, "Hydrated encounter from storage");
                }
                self.registry.inspect(encounter_id, |m| m.session_id().to_string())
            }
            Ok(_) => Err(EngineError::encounter_not_found(encounter_id)),
            Err(e) => {
                tracing::warn!(encounter_id, error = %e, "Failed to load encounter");
                Err(EngineError::encounter_not_found(encounter_id))
            }
        }
    }

    async fn resolve_actor(
        &self,
        session_id: &str,
        actor_id: &str,
        inline: Option<ActorSpec>,
        initiative: Option<i32>,
    ) -> Result<Combatant> {
        if let Some(spec) = inline {
            let mut combatant = spec.into_combatant(Some(actor_id))?;
            if let Some(initiative) = initiative {
                combatant.initiative = initiative;
            }
            return Ok(combatant);
        }

        let profile = self
            .services
            .tokens
            .token(actor_id)
            .await
            .map_err(|e| {
                tracing::warn!(token_id = actor_id, error = %e, "Token lookup failed");
                EngineError::NotFound { entity: "Token", id: actor_id.to_string() }
            })?
            .ok_or_else(|| EngineError::NotFound { entity: "Token", id: actor_id.to_string() })?;

        if profile.session_id != session_id {
            return Err(EngineError::Validation(format!(
                "Token {} belongs to another session",
                actor_id
            )));
        }
        Ok(profile.into_combatant(initiative))
    }

    /// Run a state machine operation on behalf of a request. Requests that
    /// commit no event still get an `ENCOUNTER_STATE` reply.
    fn mutate(
        &self,
        connection_id: &str,
        request_id: Option<String>,
        encounter_id: &str,
        op: impl FnOnce(&mut EncounterMachine, &dyn ConditionCatalog) -> Result<EncounterSnapshot>,
    ) -> Result<()> {
        let context = EventContext::from_request(connection_id, request_id.clone());
        let mutation = self.registry.mutate(encounter_id, &context, op)?;
        if mutation.records.is_empty() {
            self.reply(connection_id, ServerMessage::state(&mutation.value), request_id);
        }
        Ok(())
    }

    // ========================================================================
    // Authorization
    // ========================================================================

    /// Storage failures during a check fail closed
    fn check(&self, result: StoreResult<Authorization>) -> Authorization {
        result.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Authorization check failed");
            Authorization::Denied("Authorization check failed".into())
        })
    }

    fn require(&self, result: StoreResult<Authorization>) -> Result<()> {
        self.check(result).into_result()
    }

    async fn require_manager(&self, user_id: &str, session_id: &str) -> Result<()> {
        self.require(self.services.authorization.can_manage_session(user_id, session_id).await)
    }

    /// Token controllers may change their own combatant; managers may change any
    async fn require_combatant_control(
        &self,
        user_id: &str,
        encounter_id: &str,
        session_id: &str,
        actor_id: &str,
    ) -> Result<()> {
        let token = self
            .registry
            .inspect(encounter_id, |m| m.combatant(actor_id).map(|c| c.token_id().map(str::to_string)))?
            .ok_or_else(|| EngineError::combatant_not_found(actor_id))?;

        if let Some(token_id) = token {
            let verdict = self.check(
                self.services
                    .authorization
                    .can_manipulate_token(user_id, &token_id)
                    .await,
            );
            if verdict.is_granted() {
                return Ok(());
            }
        }

        if self
            .check(self.services.authorization.can_manage_session(user_id, session_id).await)
            .is_granted()
        {
            return Ok(());
        }
        Err(EngineError::Unauthorized(format!(
            "User {} cannot modify combatant {}",
            user_id, actor_id
        )))
    }

    async fn require_turn_control(&self, user_id: &str, encounter_id: &str, session_id: &str) -> Result<()> {
        if self
            .check(self.services.authorization.can_manage_session(user_id, session_id).await)
            .is_granted()
        {
            return Ok(());
        }

        let token = self
            .registry
            .inspect(encounter_id, |m| m.current_combatant().and_then(|c| c.token_id().map(str::to_string)))?;
        if let Some(token_id) = token {
            let verdict = self.check(
                self.services
                    .authorization
                    .can_manipulate_token(user_id, &token_id)
                    .await,
            );
            if verdict.is_granted() {
                return Ok(());
            }
        }
        Err(EngineError::Unauthorized(
            "Only the session manager or the active combatant's controller can end the turn".into(),
        ))
    }

    // ========================================================================
    // Replies
    // ========================================================================

    /// Plain ACKs are fire-and-forget; one carrying a `requestId` gets a
    /// confirmation or `NOT_FOUND`.
    fn acknowledge(&self, connection_id: &str, ack_id: u64, request_id: Option<String>) -> Result<()> {
        let known = self
            .broadcaster
            .handle(connection_id)
            .is_some_and(|handle| handle.acknowledge(ack_id));
        if !known {
            tracing::debug!(connection_id, ack_id, "Acknowledgement for unknown message");
        }
        match (request_id, known) {
            (None, _) => Ok(()),
            (Some(request_id), true) => {
                self.reply(connection_id, ServerMessage::acknowledged(ack_id), Some(request_id));
                Ok(())
            }
            (Some(_), false) => Err(EngineError::ack_not_found(ack_id)),
        }
    }

    fn reply(&self, connection_id: &str, message: ServerMessage, request_id: Option<String>) {
        self.broadcaster
            .send_to(connection_id, message.with_request_id(request_id));
    }

    fn reply_error(&self, connection_id: &str, error: &EngineError, request_id: Option<String>) {
        if !error.is_client_visible() {
            tracing::error!(connection_id, error = %error, "Internal failure reached request boundary");
            return;
        }
        self.broadcaster
            .send_to(connection_id, ServerMessage::error(error, request_id));
    }
}

/// Best-effort `requestId` from a frame that failed envelope validation
fn salvage_request_id(text: &str) -> Option<String> {
    serde_json::from_str::<Value>(text)
        .ok()?
        .get("requestId")?
        .as_str()
        .map(str::to_string)
}
