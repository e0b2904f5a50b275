//! Encounter persistence
//!
//! Stores encounters as a header row plus ordered combatant rows and, on
//! schemas that have it, per-combatant condition rows.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::{Sqlite, Transaction};

use super::models::{CombatantRecord, ConditionRecord, EncounterRecord};
use super::Database;
use crate::core::encounter::{Combatant, Condition, EncounterSnapshot, EncounterStatus};
use crate::core::persistence::{EncounterStore, StoreResult};

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

async fn insert_combatant_row(
    tx: &mut Transaction<'_, Sqlite>,
    record: &CombatantRecord,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO encounter_combatants (encounter_id, id, position, added_seq, name, kind,
            hp_current, hp_max, hp_temporary, armor_class, initiative, defeated, token_id)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.encounter_id)
    .bind(&record.id)
    .bind(record.position)
    .bind(record.added_seq)
    .bind(&record.name)
    .bind(&record.kind)
    .bind(record.hp_current)
    .bind(record.hp_max)
    .bind(record.hp_temporary)
    .bind(record.armor_class)
    .bind(record.initiative)
    .bind(record.defeated)
    .bind(&record.token_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_condition_rows(
    tx: &mut Transaction<'_, Sqlite>,
    encounter_id: &str,
    combatant_id: &str,
    conditions: &[Condition],
) -> Result<(), sqlx::Error> {
    for (ordinal, condition) in conditions.iter().enumerate() {
        let record = ConditionRecord::from_condition(encounter_id, combatant_id, ordinal, condition);
        sqlx::query(
            r#"
            INSERT INTO encounter_conditions (encounter_id, combatant_id, ordinal, name,
                remaining, source, applied_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.encounter_id)
        .bind(&record.combatant_id)
        .bind(record.ordinal)
        .bind(&record.name)
        .bind(record.remaining)
        .bind(&record.source)
        .bind(&record.applied_at)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn set_turn_index(
    tx: &mut Transaction<'_, Sqlite>,
    encounter_id: &str,
    turn_index: usize,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE encounters SET turn_index = ?, updated_at = ? WHERE id = ?")
        .bind(turn_index as i64)
        .bind(now())
        .bind(encounter_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

impl Database {
    async fn load_conditions(&self, encounter_id: &str) -> StoreResult<HashMap<String, Vec<Condition>>> {
        let mut by_combatant: HashMap<String, Vec<Condition>> = HashMap::new();
        if !self.conditions_supported {
            return Ok(by_combatant);
        }

        let rows = sqlx::query_as::<_, ConditionRecord>(
            "SELECT * FROM encounter_conditions WHERE encounter_id = ? ORDER BY combatant_id, ordinal",
        )
        .bind(encounter_id)
        .fetch_all(self.pool())
        .await?;

        for row in rows {
            let combatant_id = row.combatant_id.clone();
            by_combatant.entry(combatant_id).or_default().push(row.into_condition()?);
        }
        Ok(by_combatant)
    }
}

#[async_trait]
impl EncounterStore for Database {
    async fn save_encounter(&self, snapshot: &EncounterSnapshot) -> StoreResult<()> {
        let record = EncounterRecord::from_snapshot(snapshot);
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            r#"
            INSERT INTO encounters (id, session_id, name, status, round, turn_index, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                status = excluded.status,
                round = excluded.round,
                turn_index = excluded.turn_index,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.id)
        .bind(&record.session_id)
        .bind(&record.name)
        .bind(&record.status)
        .bind(record.round)
        .bind(record.turn_index)
        .bind(&record.created_at)
        .bind(&record.updated_at)
        .execute(&mut *tx)
        .await?;

        // Condition rows cascade with their combatants
        sqlx::query("DELETE FROM encounter_combatants WHERE encounter_id = ?")
            .bind(&snapshot.id)
            .execute(&mut *tx)
            .await?;

        for (position, combatant) in snapshot.combatants.iter().enumerate() {
            insert_combatant_row(&mut tx, &CombatantRecord::from_combatant(&snapshot.id, combatant, position)).await?;
            if self.conditions_supported {
                insert_condition_rows(&mut tx, &snapshot.id, &combatant.id, combatant.conditions.conditions()).await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load_encounter(&self, encounter_id: &str) -> StoreResult<Option<EncounterSnapshot>> {
        let Some(record) = sqlx::query_as::<_, EncounterRecord>("SELECT * FROM encounters WHERE id = ?")
            .bind(encounter_id)
            .fetch_optional(self.pool())
            .await?
        else {
            return Ok(None);
        };

        let rows = sqlx::query_as::<_, CombatantRecord>(
            "SELECT * FROM encounter_combatants WHERE encounter_id = ? ORDER BY position",
        )
        .bind(encounter_id)
        .fetch_all(self.pool())
        .await?;

        let mut conditions = self.load_conditions(encounter_id).await?;
        let combatants = rows
            .into_iter()
            .map(|row| {
                let owned = conditions.remove(&row.id).unwrap_or_default();
                row.into_combatant(owned)
            })
            .collect::<StoreResult<Vec<_>>>()?;

        record.into_snapshot(combatants).map(Some)
    }

    async fn delete_encounter(&self, encounter_id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM encounters WHERE id = ?")
            .bind(encounter_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn update_progress(&self, encounter_id: &str, round: u32, turn_index: usize) -> StoreResult<()> {
        sqlx::query("UPDATE encounters SET round = ?, turn_index = ?, updated_at = ? WHERE id = ?")
            .bind(i64::from(round))
            .bind(turn_index as i64)
            .bind(now())
            .bind(encounter_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn update_round(&self, encounter_id: &str, round: u32) -> StoreResult<()> {
        sqlx::query("UPDATE encounters SET round = ?, updated_at = ? WHERE id = ?")
            .bind(i64::from(round))
            .bind(now())
            .bind(encounter_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn update_status(&self, encounter_id: &str, status: EncounterStatus) -> StoreResult<()> {
        sqlx::query("UPDATE encounters SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now())
            .bind(encounter_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn update_hit_points(&self, encounter_id: &str, combatant: &Combatant) -> StoreResult<()> {
        let hp = combatant.hit_points;
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            r#"
            UPDATE encounter_combatants
            SET hp_current = ?, hp_max = ?, hp_temporary = ?, defeated = ?
            WHERE encounter_id = ? AND id = ?
            "#,
        )
        .bind(i64::from(hp.current))
        .bind(i64::from(hp.max))
        .bind(i64::from(hp.temporary))
        .bind(combatant.defeated)
        .bind(encounter_id)
        .bind(&combatant.id)
        .execute(&mut *tx)
        .await?;

        if let Some(token_id) = combatant.token_id() {
            sqlx::query(
                "UPDATE tokens SET hp_current = ?, hp_max = ?, hp_temporary = ?, updated_at = ? WHERE id = ?",
            )
            .bind(i64::from(hp.current))
            .bind(i64::from(hp.max))
            .bind(i64::from(hp.temporary))
            .bind(now())
            .bind(token_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn replace_conditions(
        &self,
        encounter_id: &str,
        combatant_id: &str,
        conditions: &[Condition],
    ) -> StoreResult<()> {
        if !self.conditions_supported {
            return Ok(());
        }

        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM encounter_conditions WHERE encounter_id = ? AND combatant_id = ?")
            .bind(encounter_id)
            .bind(combatant_id)
            .execute(&mut *tx)
            .await?;
        insert_condition_rows(&mut tx, encounter_id, combatant_id, conditions).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn insert_combatant(
        &self,
        encounter_id: &str,
        combatant: &Combatant,
        position: usize,
        turn_index: usize,
    ) -> StoreResult<()> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            "UPDATE encounter_combatants SET position = position + 1 WHERE encounter_id = ? AND position >= ?",
        )
        .bind(encounter_id)
        .bind(position as i64)
        .execute(&mut *tx)
        .await?;

        insert_combatant_row(&mut tx, &CombatantRecord::from_combatant(encounter_id, combatant, position)).await?;
        if self.conditions_supported {
            insert_condition_rows(&mut tx, encounter_id, &combatant.id, combatant.conditions.conditions()).await?;
        }
        set_turn_index(&mut tx, encounter_id, turn_index).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_combatant(&self, encounter_id: &str, combatant_id: &str, turn_index: usize) -> StoreResult<()> {
        let mut tx = self.pool().begin().await?;

        let position: Option<i64> = sqlx::query_scalar(
            "SELECT position FROM encounter_combatants WHERE encounter_id = ? AND id = ?",
        )
        .bind(encounter_id)
        .bind(combatant_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(position) = position {
            sqlx::query("DELETE FROM encounter_combatants WHERE encounter_id = ? AND id = ?")
                .bind(encounter_id)
                .bind(combatant_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "UPDATE encounter_combatants SET position = position - 1 WHERE encounter_id = ? AND position > ?",
            )
            .bind(encounter_id)
            .bind(position)
            .execute(&mut *tx)
            .await?;
        }
        set_turn_index(&mut tx, encounter_id, turn_index).await?;

        tx.commit().await?;
        Ok(())
    }

    fn supports_conditions(&self) -> bool {
        self.conditions_supported
    }
}
