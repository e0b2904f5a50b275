//! Wire Protocol
//!
//! Inbound messages arrive as `{ type, payload, requestId? }` and are turned
//! into a typed [`ClientRequest`] with one validated payload struct per
//! message type. Unknown types, unknown fields and malformed values are
//! rejected with a validation error instead of being defaulted.
//!
//! Outbound messages share the envelope shape and may carry an `ackId` when
//! the client is expected to acknowledge them.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::encounter::{
    Combatant, CombatantKind, Condition, EncounterEvent, EncounterSnapshot, EncounterStatus,
    EventRecord, HealthUpdate, HitPoints,
};
use crate::core::error::{EngineError, Result};

// ============================================================================
// Inbound
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InboundEnvelope {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub request_id: Option<String>,
}

impl InboundEnvelope {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| EngineError::Validation(format!("Malformed message: {}", e)))
    }
}

/// Inline combatant description used by `CREATE_ENCOUNTER`, `START_ENCOUNTER`
/// and `ADD_ACTOR`
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ActorSpec {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub kind: CombatantKind,
    pub hit_points: HitPointsPayload,
    #[serde(default)]
    pub armor_class: Option<i32>,
    #[serde(default)]
    pub initiative: i32,
    #[serde(default)]
    pub token_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HitPointsPayload {
    #[serde(default)]
    pub current: Option<u32>,
    pub max: u32,
    #[serde(default)]
    pub temporary: Option<u32>,
}

impl ActorSpec {
    /// Build a combatant; `fallback_id` is used when the payload carries no id
    pub fn into_combatant(self, fallback_id: Option<&str>) -> Result<Combatant> {
        let id = match (self.id, fallback_id) {
            (Some(id), _) => id,
            (None, Some(id)) => id.to_string(),
            (None, None) => uuid::Uuid::new_v4().to_string(),
        };
        require_non_empty("actor id", &id)?;
        require_non_empty("actor name", &self.name)?;
        if self.hit_points.max == 0 {
            return Err(EngineError::Validation("hitPoints.max must be greater than zero".into()));
        }

        let hp = self.hit_points;
        let mut combatant = Combatant::new(
            id,
            self.name,
            self.kind,
            self.initiative,
            HitPoints::new(hp.current.unwrap_or(hp.max), hp.max, hp.temporary.unwrap_or(0)),
        );
        if let Some(ac) = self.armor_class {
            combatant = combatant.with_armor_class(ac);
        }
        if let Some(token_id) = self.token_id {
            combatant = combatant.with_token(token_id);
        }
        Ok(combatant)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct TokenPayload {
    token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SessionPayload {
    session_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct EncounterPayload {
    encounter_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct StartPayload {
    encounter_id: String,
    #[serde(default)]
    combatants: Vec<ActorSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct CreatePayload {
    session_id: String,
    name: String,
    #[serde(default)]
    combatants: Vec<ActorSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ActorPayload {
    encounter_id: String,
    actor_id: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
struct HealthPayload {
    current: u32,
    #[serde(default)]
    max: Option<u32>,
    #[serde(default)]
    temporary: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct UpdateHealthPayload {
    encounter_id: String,
    actor_id: String,
    health: HealthPayload,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct AmountPayload {
    encounter_id: String,
    actor_id: String,
    amount: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConditionSpec {
    name: String,
    #[serde(default)]
    duration: Option<u32>,
    #[serde(default)]
    source: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ApplyConditionPayload {
    encounter_id: String,
    actor_id: String,
    condition: ConditionSpec,
}

/// `REMOVE_CONDITION` accepts either a bare name or `{ name }`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ConditionRef {
    Name(String),
    Named(NamedCondition),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct NamedCondition {
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RemoveConditionPayload {
    encounter_id: String,
    actor_id: String,
    condition: ConditionRef,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct AddActorPayload {
    encounter_id: String,
    actor_id: String,
    #[serde(default)]
    actor: Option<ActorSpec>,
    #[serde(default)]
    initiative: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct AckPayload {
    ack_id: u64,
}

/// A validated inbound request
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    Authenticate { token: String },
    JoinSession { session_id: String },
    Subscribe { encounter_id: String },
    Unsubscribe { encounter_id: String },
    CreateEncounter { session_id: String, name: String, combatants: Vec<ActorSpec> },
    StartEncounter { encounter_id: String, combatants: Vec<ActorSpec> },
    NextTurn { encounter_id: String },
    PauseEncounter { encounter_id: String },
    ResumeEncounter { encounter_id: String },
    ResetEncounter { encounter_id: String },
    EndEncounter { encounter_id: String },
    UpdateActorHealth { encounter_id: String, actor_id: String, health: HealthUpdate },
    ApplyDamage { encounter_id: String, actor_id: String, amount: u32 },
    ApplyHealing { encounter_id: String, actor_id: String, amount: u32 },
    ApplyCondition { encounter_id: String, actor_id: String, condition: Condition },
    RemoveCondition { encounter_id: String, actor_id: String, name: String },
    AddActor { encounter_id: String, actor_id: String, actor: Option<ActorSpec>, initiative: Option<i32> },
    RemoveActor { encounter_id: String, actor_id: String },
    RequestTacticalDecision { encounter_id: String, actor_id: String },
    Ack { ack_id: u64 },
}

impl ClientRequest {
    /// Validate an envelope into a typed request
    pub fn parse(envelope: &InboundEnvelope) -> Result<Self> {
        let payload = envelope.payload.clone();
        let kind = envelope.message_type.as_str();

        let request = match kind {
            "AUTHENTICATE" => {
                let p: TokenPayload = decode(kind, payload)?;
                require_non_empty("token", &p.token)?;
                ClientRequest::Authenticate { token: p.token }
            }
            "JOIN_SESSION" => {
                let p: SessionPayload = decode(kind, payload)?;
                require_non_empty("sessionId", &p.session_id)?;
                ClientRequest::JoinSession { session_id: p.session_id }
            }
            "SUBSCRIBE_ENCOUNTER" | "COMBAT_SUBSCRIBE" => {
                let p = encounter_payload(kind, payload)?;
                ClientRequest::Subscribe { encounter_id: p.encounter_id }
            }
            "UNSUBSCRIBE_ENCOUNTER" | "COMBAT_UNSUBSCRIBE" => {
                let p = encounter_payload(kind, payload)?;
                ClientRequest::Unsubscribe { encounter_id: p.encounter_id }
            }
            "CREATE_ENCOUNTER" => {
                let p: CreatePayload = decode(kind, payload)?;
                require_non_empty("sessionId", &p.session_id)?;
                require_non_empty("name", &p.name)?;
                ClientRequest::CreateEncounter {
                    session_id: p.session_id,
                    name: p.name,
                    combatants: p.combatants,
                }
            }
            "START_ENCOUNTER" => {
                let p: StartPayload = decode(kind, payload)?;
                require_non_empty("encounterId", &p.encounter_id)?;
                ClientRequest::StartEncounter { encounter_id: p.encounter_id, combatants: p.combatants }
            }
            "NEXT_TURN" => ClientRequest::NextTurn { encounter_id: encounter_payload(kind, payload)?.encounter_id },
            "PAUSE_ENCOUNTER" => ClientRequest::PauseEncounter {
                encounter_id: encounter_payload(kind, payload)?.encounter_id,
            },
            "RESUME_ENCOUNTER" => ClientRequest::ResumeEncounter {
                encounter_id: encounter_payload(kind, payload)?.encounter_id,
            },
            "RESET_ENCOUNTER" => ClientRequest::ResetEncounter {
                encounter_id: encounter_payload(kind, payload)?.encounter_id,
            },
            "END_ENCOUNTER" => ClientRequest::EndEncounter {
                encounter_id: encounter_payload(kind, payload)?.encounter_id,
            },
            "UPDATE_ACTOR_HEALTH" => {
                let p: UpdateHealthPayload = decode(kind, payload)?;
                require_ids(&p.encounter_id, &p.actor_id)?;
                if p.health.max == Some(0) {
                    return Err(EngineError::Validation("health.max must be greater than zero".into()));
                }
                ClientRequest::UpdateActorHealth {
                    encounter_id: p.encounter_id,
                    actor_id: p.actor_id,
                    health: HealthUpdate {
                        current: p.health.current,
                        max: p.health.max,
                        temporary: p.health.temporary,
                    },
                }
            }
            "APPLY_DAMAGE" | "APPLY_HEALING" => {
                let p: AmountPayload = decode(kind, payload)?;
                require_ids(&p.encounter_id, &p.actor_id)?;
                if kind == "APPLY_DAMAGE" {
                    ClientRequest::ApplyDamage { encounter_id: p.encounter_id, actor_id: p.actor_id, amount: p.amount }
                } else {
                    ClientRequest::ApplyHealing { encounter_id: p.encounter_id, actor_id: p.actor_id, amount: p.amount }
                }
            }
            "APPLY_CONDITION" => {
                let p: ApplyConditionPayload = decode(kind, payload)?;
                require_ids(&p.encounter_id, &p.actor_id)?;
                require_non_empty("condition.name", &p.condition.name)?;
                if p.condition.duration == Some(0) {
                    return Err(EngineError::Validation("condition.duration must be at least 1".into()));
                }
                let mut condition = Condition::new(p.condition.name, p.condition.duration);
                if let Some(source) = p.condition.source {
                    condition = condition.from_source(source);
                }
                ClientRequest::ApplyCondition { encounter_id: p.encounter_id, actor_id: p.actor_id, condition }
            }
            "REMOVE_CONDITION" => {
                let p: RemoveConditionPayload = decode(kind, payload)?;
                require_ids(&p.encounter_id, &p.actor_id)?;
                let name = match p.condition {
                    ConditionRef::Name(name) => name,
                    ConditionRef::Named(named) => named.name,
                };
                require_non_empty("condition", &name)?;
                ClientRequest::RemoveCondition { encounter_id: p.encounter_id, actor_id: p.actor_id, name }
            }
            "ADD_ACTOR" => {
                let p: AddActorPayload = decode(kind, payload)?;
                require_ids(&p.encounter_id, &p.actor_id)?;
                ClientRequest::AddActor {
                    encounter_id: p.encounter_id,
                    actor_id: p.actor_id,
                    actor: p.actor,
                    initiative: p.initiative,
                }
            }
            "REMOVE_ACTOR" => {
                let p: ActorPayload = decode(kind, payload)?;
                require_ids(&p.encounter_id, &p.actor_id)?;
                ClientRequest::RemoveActor { encounter_id: p.encounter_id, actor_id: p.actor_id }
            }
            "REQUEST_TACTICAL_DECISION" => {
                let p: ActorPayload = decode(kind, payload)?;
                require_ids(&p.encounter_id, &p.actor_id)?;
                ClientRequest::RequestTacticalDecision { encounter_id: p.encounter_id, actor_id: p.actor_id }
            }
            "ACK" => {
                let p: AckPayload = decode(kind, payload)?;
                ClientRequest::Ack { ack_id: p.ack_id }
            }
            other => {
                return Err(EngineError::Validation(format!("Unknown message type: {}", other)));
            }
        };
        Ok(request)
    }

    /// Encounter addressed by the request, if any
    pub fn encounter_id(&self) -> Option<&str> {
        match self {
            ClientRequest::Subscribe { encounter_id }
            | ClientRequest::Unsubscribe { encounter_id }
            | ClientRequest::StartEncounter { encounter_id, .. }
            | ClientRequest::NextTurn { encounter_id }
            | ClientRequest::PauseEncounter { encounter_id }
            | ClientRequest::ResumeEncounter { encounter_id }
            | ClientRequest::ResetEncounter { encounter_id }
            | ClientRequest::EndEncounter { encounter_id }
            | ClientRequest::UpdateActorHealth { encounter_id, .. }
            | ClientRequest::ApplyDamage { encounter_id, .. }
            | ClientRequest::ApplyHealing { encounter_id, .. }
            | ClientRequest::ApplyCondition { encounter_id, .. }
            | ClientRequest::RemoveCondition { encounter_id, .. }
            | ClientRequest::AddActor { encounter_id, .. }
            | ClientRequest::RemoveActor { encounter_id, .. }
            | ClientRequest::RequestTacticalDecision { encounter_id, .. } => Some(encounter_id),
            ClientRequest::Authenticate { .. }
            | ClientRequest::JoinSession { .. }
            | ClientRequest::CreateEncounter { .. }
            | ClientRequest::Ack { .. } => None,
        }
    }
}

fn decode<T: DeserializeOwned>(kind: &str, payload: Value) -> Result<T> {
    let payload = if payload.is_null() { json!({}) } else { payload };
    serde_json::from_value(payload)
        .map_err(|e| EngineError::Validation(format!("Invalid {} payload: {}", kind, e)))
}

fn encounter_payload(kind: &str, payload: Value) -> Result<EncounterPayload> {
    let p: EncounterPayload = decode(kind, payload)?;
    require_non_empty("encounterId", &p.encounter_id)?;
    Ok(p)
}

fn require_ids(encounter_id: &str, actor_id: &str) -> Result<()> {
    require_non_empty("encounterId", encounter_id)?;
    require_non_empty("actorId", actor_id)
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(EngineError::Validation(format!("{} must not be empty", field)))
    } else {
        Ok(())
    }
}

// ============================================================================
// Outbound
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundType {
    Authenticated,
    SessionJoined,
    EncounterCreated,
    EncounterSubscribed,
    EncounterUnsubscribed,
    EncounterState,
    EncounterStarted,
    EncounterWarning,
    TurnAdvanced,
    RoundStarted,
    ActorHealthUpdated,
    ActorDefeated,
    ActorRevived,
    ConditionApplied,
    ConditionRemoved,
    ActorAdded,
    ActorRemoved,
    EncounterPaused,
    EncounterResumed,
    EncounterReset,
    EncounterEnded,
    TacticalDecision,
    SessionTerminated,
    Acknowledged,
    Error,
}

impl OutboundType {
    /// Messages the client must acknowledge.
    ///
    /// Only terminal notices qualify: nothing follows them on the same
    /// encounter, so a resend can never overwrite newer state. Snapshots
    /// are superseded by the deltas that follow, and SESSION_TERMINATED is
    /// immediately followed by a close, which drops the tracker.
    pub fn requires_ack(&self) -> bool {
        matches!(self, OutboundType::EncounterEnded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub message_type: OutboundType,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<u64>,
}

impl ServerMessage {
    pub fn new(message_type: OutboundType, payload: Value) -> Self {
        Self { message_type, payload, request_id: None, ack_id: None }
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn error(error: &EngineError, request_id: Option<String>) -> Self {
        Self::new(
            OutboundType::Error,
            json!({ "error": error.to_string(), "code": error.code() }),
        )
        .with_request_id(request_id)
    }

    pub fn authenticated(user_id: &str) -> Self {
        Self::new(OutboundType::Authenticated, json!({ "userId": user_id }))
    }

    pub fn session_joined(session_id: &str) -> Self {
        Self::new(OutboundType::SessionJoined, json!({ "sessionId": session_id }))
    }

    pub fn subscribed(snapshot: &EncounterSnapshot) -> Self {
        Self::new(
            OutboundType::EncounterSubscribed,
            json!({ "encounterId": snapshot.id, "encounter": snapshot }),
        )
    }

    pub fn unsubscribed(encounter_id: &str) -> Self {
        Self::new(OutboundType::EncounterUnsubscribed, json!({ "encounterId": encounter_id }))
    }

    pub fn state(snapshot: &EncounterSnapshot) -> Self {
        Self::new(
            OutboundType::EncounterState,
            json!({ "encounterId": snapshot.id, "encounter": snapshot }),
        )
    }

    pub fn acknowledged(ack_id: u64) -> Self {
        Self::new(OutboundType::Acknowledged, json!({ "ackId": ack_id }))
    }

    pub fn session_terminated(session_id: &str, status: &str) -> Self {
        Self::new(
            OutboundType::SessionTerminated,
            json!({ "sessionId": session_id, "status": status }),
        )
    }

    /// Translate a committed encounter event into its broadcast message
    pub fn from_event(record: &EventRecord) -> Self {
        let encounter_id = &record.encounter_id;
        let sequence = record.sequence;

        let (message_type, payload) = match &record.event {
            EncounterEvent::EncounterCreated { snapshot } => (
                OutboundType::EncounterCreated,
                json!({ "encounterId": encounter_id, "encounter": snapshot }),
            ),
            EncounterEvent::EncounterStarted { snapshot } => (
                OutboundType::EncounterStarted,
                json!({ "encounterId": encounter_id, "encounter": snapshot }),
            ),
            EncounterEvent::EncounterWarning { message } => (
                OutboundType::EncounterWarning,
                json!({ "encounterId": encounter_id, "warning": message }),
            ),
            EncounterEvent::TurnAdvanced { turn_index, round, combatant } => (
                OutboundType::TurnAdvanced,
                json!({
                    "encounterId": encounter_id,
                    "currentTurn": turn_index,
                    "currentRound": round,
                    "currentCombatant": combatant,
                }),
            ),
            EncounterEvent::RoundStarted { round } => (
                OutboundType::RoundStarted,
                json!({ "encounterId": encounter_id, "round": round }),
            ),
            EncounterEvent::DamageApplied { combatant_id, amount, hit_points, combatant } => (
                OutboundType::ActorHealthUpdated,
                health_payload(encounter_id, combatant_id, hit_points, combatant.defeated, "damage", Some(*amount)),
            ),
            EncounterEvent::HealingApplied { combatant_id, amount, hit_points, combatant } => (
                OutboundType::ActorHealthUpdated,
                health_payload(encounter_id, combatant_id, hit_points, combatant.defeated, "healing", Some(*amount)),
            ),
            EncounterEvent::HitPointsSet { combatant_id, hit_points, combatant } => (
                OutboundType::ActorHealthUpdated,
                health_payload(encounter_id, combatant_id, hit_points, combatant.defeated, "set", None),
            ),
            EncounterEvent::CombatantDefeated { combatant_id } => (
                OutboundType::ActorDefeated,
                json!({ "encounterId": encounter_id, "actorId": combatant_id }),
            ),
            EncounterEvent::CombatantRevived { combatant_id } => (
                OutboundType::ActorRevived,
                json!({ "encounterId": encounter_id, "actorId": combatant_id }),
            ),
            EncounterEvent::ConditionAdded { combatant_id, condition, conditions } => (
                OutboundType::ConditionApplied,
                json!({
                    "encounterId": encounter_id,
                    "actorId": combatant_id,
                    "condition": condition,
                    "conditions": conditions,
                }),
            ),
            EncounterEvent::ConditionRemoved { combatant_id, name, reason, conditions } => (
                OutboundType::ConditionRemoved,
                json!({
                    "encounterId": encounter_id,
                    "actorId": combatant_id,
                    "condition": name,
                    "reason": reason,
                    "conditions": conditions,
                }),
            ),
            EncounterEvent::CombatantAdded { combatant, position, turn_index } => (
                OutboundType::ActorAdded,
                json!({
                    "encounterId": encounter_id,
                    "actor": combatant,
                    "position": position,
                    "currentTurn": turn_index,
                }),
            ),
            EncounterEvent::CombatantRemoved { combatant_id, turn_index } => (
                OutboundType::ActorRemoved,
                json!({ "encounterId": encounter_id, "actorId": combatant_id, "currentTurn": turn_index }),
            ),
            EncounterEvent::StatusChanged { status } => (
                if *status == EncounterStatus::Paused {
                    OutboundType::EncounterPaused
                } else {
                    OutboundType::EncounterResumed
                },
                json!({ "encounterId": encounter_id, "status": status }),
            ),
            EncounterEvent::EncounterReset { snapshot } => (
                OutboundType::EncounterReset,
                json!({ "encounterId": encounter_id, "encounter": snapshot }),
            ),
            EncounterEvent::CombatEnded { round } => (
                OutboundType::EncounterEnded,
                json!({ "encounterId": encounter_id, "round": round }),
            ),
        };

        let mut payload = payload;
        if let Value::Object(map) = &mut payload {
            map.insert("sequence".to_string(), json!(sequence));
        }
        Self::new(message_type, payload)
    }

    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn health_payload(
    encounter_id: &str,
    actor_id: &str,
    hit_points: &HitPoints,
    defeated: bool,
    change: &str,
    amount: Option<u32>,
) -> Value {
    json!({
        "encounterId": encounter_id,
        "actorId": actor_id,
        "health": hit_points,
        "defeated": defeated,
        "change": change,
        "amount": amount,
    })
}
