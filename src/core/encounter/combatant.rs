//! Combatant snapshot embedded in one encounter.

use serde::{Deserialize, Serialize};

use super::conditions::ConditionTracker;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CombatantKind {
    PlayerCharacter,
    NonPlayerCharacter,
    Monster,
}

impl CombatantKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CombatantKind::PlayerCharacter => "player_character",
            CombatantKind::NonPlayerCharacter => "non_player_character",
            CombatantKind::Monster => "monster",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "player_character" | "pc" | "player" => Some(CombatantKind::PlayerCharacter),
            "non_player_character" | "npc" => Some(CombatantKind::NonPlayerCharacter),
            "monster" => Some(CombatantKind::Monster),
            _ => None,
        }
    }

    /// Player characters fight on one side, everyone else on the other
    pub fn is_opposed_to(&self, other: CombatantKind) -> bool {
        (*self == CombatantKind::PlayerCharacter) != (other == CombatantKind::PlayerCharacter)
    }
}

/// Weak back-reference to the persisted token a combatant was created from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenRef {
    pub token_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct HitPoints {
    pub current: u32,
    pub max: u32,
    pub temporary: u32,
}

impl HitPoints {
    /// Full health; `max` is raised to at least 1
    pub fn full(max: u32) -> Self {
        let max = max.max(1);
        Self { current: max, max, temporary: 0 }
    }

    pub fn new(current: u32, max: u32, temporary: u32) -> Self {
        let max = max.max(1);
        Self { current: current.min(max), max, temporary }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Combatant {
    pub id: String,
    pub name: String,
    pub kind: CombatantKind,
    pub hit_points: HitPoints,
    pub armor_class: i32,
    pub initiative: i32,
    #[serde(default)]
    pub conditions: ConditionTracker,
    pub defeated: bool,
    pub token: Option<TokenRef>,
    /// Insertion order within the encounter, used to break initiative ties
    #[serde(default)]
    pub added_seq: u64,
}

impl Combatant {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        kind: CombatantKind,
        initiative: i32,
        hit_points: HitPoints,
    ) -> Self {
        let hit_points = HitPoints::new(hit_points.current, hit_points.max, hit_points.temporary);
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            defeated: hit_points.current == 0,
            hit_points,
            armor_class: 10,
            initiative,
            conditions: ConditionTracker::new(),
            token: None,
            added_seq: 0,
        }
    }

    /// Builder: set armor class
    pub fn with_armor_class(mut self, armor_class: i32) -> Self {
        self.armor_class = armor_class;
        self
    }

    /// Builder: link to a persisted token
    pub fn with_token(mut self, token_id: impl Into<String>) -> Self {
        self.token = Some(TokenRef { token_id: token_id.into() });
        self
    }

    pub fn token_id(&self) -> Option<&str> {
        self.token.as_ref().map(|t| t.token_id.as_str())
    }

    /// Apply damage to this combatant.
    /// Temporary hit points absorb damage first, then current hit points,
    /// which never drop below zero. Returns the new current hit points.
    pub fn apply_damage(&mut self, amount: u32) -> u32 {
        let absorbed = amount.min(self.hit_points.temporary);
        self.hit_points.temporary -= absorbed;
        let remaining = amount - absorbed;

        self.hit_points.current = self.hit_points.current.saturating_sub(remaining);
        self.sync_defeated();
        self.hit_points.current
    }

    /// Heal this combatant, never above max. Returns the new current hit points.
    pub fn heal(&mut self, amount: u32) -> u32 {
        self.hit_points.current = self
            .hit_points
            .current
            .saturating_add(amount)
            .min(self.hit_points.max);
        self.sync_defeated();
        self.hit_points.current
    }

    /// Overwrite hit points, clamping current to the (possibly new) maximum
    pub fn set_hit_points(&mut self, current: u32, max: Option<u32>, temporary: Option<u32>) {
        if let Some(max) = max {
            self.hit_points.max = max.max(1);
        }
        if let Some(temporary) = temporary {
            self.hit_points.temporary = temporary;
        }
        self.hit_points.current = current.min(self.hit_points.max);
        self.sync_defeated();
    }

    fn sync_defeated(&mut self) {
        self.defeated = self.hit_points.current == 0;
    }
}
