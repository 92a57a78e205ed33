use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use strata_core::error::{Result, StateMachineError};
use strata_core::types::{EntityKind, StateHistory};

use crate::row::*;
use crate::store::{db_err, WorkflowStore};

/// One status change plus its audit row, applied atomically.
#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub run_id: String,
    /// Expected current status; the update is a compare-and-set on it.
    pub from: String,
    pub to: String,
    pub reason: Option<String>,
    pub actor: String,
    /// Stamp `started_at` if it is still empty.
    pub marks_start: bool,
    /// Stamp `completed_at`.
    pub marks_end: bool,
    /// Clear both timestamps (administrative resets).
    pub clears_times: bool,
}

fn table_for(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Run => "runs",
        EntityKind::Step => "steps",
        EntityKind::Node => "nodes",
    }
}

const HISTORY_COLUMNS: &str =
    "id, entity_type, entity_id, run_id, from_state, to_state, reason, actor, timestamp";

fn history_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StateHistory> {
    Ok(StateHistory {
        id: row.get(0)?,
        entity_type: enum_col(row, 1)?,
        entity_id: row.get(2)?,
        run_id: row.get(3)?,
        from_state: row.get(4)?,
        to_state: row.get(5)?,
        reason: row.get(6)?,
        actor: row.get(7)?,
        timestamp: parse_ts(&row.get::<_, String>(8)?),
    })
}

impl WorkflowStore {
    /// Update an entity's status and append the audit row in one transaction.
    ///
    /// Fails with `Conflict` when the stored status no longer equals
    /// `record.from`, and with `NotFound` when the entity is gone.
    pub fn apply_transition(&self, record: &TransitionRecord) -> Result<StateHistory> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        let table = table_for(record.entity_type);
        let now = Utc::now();
        let now_s = ts(&now);

        let sql = format!(
            "UPDATE {table} SET status = ?2,
                started_at = CASE WHEN ?4 THEN NULL
                                  WHEN ?5 AND started_at IS NULL THEN ?7
                                  ELSE started_at END,
                completed_at = CASE WHEN ?4 THEN NULL WHEN ?6 THEN ?7 ELSE completed_at END
             WHERE id = ?1 AND status = ?3"
        );
        let changed = tx
            .execute(
                &sql,
                params![
                    record.entity_id,
                    record.to,
                    record.from,
                    record.clears_times,
                    record.marks_start,
                    record.marks_end,
                    now_s,
                ],
            )
            .map_err(db_err)?;

        if changed == 0 {
            let found: Option<String> = tx
                .query_row(
                    &format!("SELECT status FROM {table} WHERE id = ?1"),
                    params![record.entity_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            let err = match found {
                None => StateMachineError::NotFound {
                    entity: record.entity_type.to_string(),
                    id: record.entity_id.clone(),
                },
                Some(found) => StateMachineError::Conflict {
                    entity: record.entity_type.to_string(),
                    id: record.entity_id.clone(),
                    expected: record.from.clone(),
                    found,
                },
            };
            return Err(err.into());
        }

        tx.execute(
            "INSERT INTO state_history (entity_type, entity_id, run_id, from_state, to_state,
                reason, actor, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.entity_type.as_str(),
                record.entity_id,
                record.run_id,
                record.from,
                record.to,
                record.reason,
                record.actor,
                now_s,
            ],
        )
        .map_err(db_err)?;
        let id = tx.last_insert_rowid();
        tx.commit().map_err(db_err)?;

        Ok(StateHistory {
            id,
            entity_type: record.entity_type,
            entity_id: record.entity_id.clone(),
            run_id: record.run_id.clone(),
            from_state: record.from.clone(),
            to_state: record.to.clone(),
            reason: record.reason.clone(),
            actor: record.actor.clone(),
            timestamp: now,
        })
    }

    /// Audit trail of one entity, oldest first.
    pub fn list_history(&self, entity_type: EntityKind, entity_id: &str) -> Result<Vec<StateHistory>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {HISTORY_COLUMNS} FROM state_history
                 WHERE entity_type = ?1 AND entity_id = ?2 ORDER BY id"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![entity_type.as_str(), entity_id], history_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Every transition recorded for a run and its steps and nodes.
    pub fn list_history_for_run(&self, run_id: &str) -> Result<Vec<StateHistory>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {HISTORY_COLUMNS} FROM state_history WHERE run_id = ?1 ORDER BY id"
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map(params![run_id], history_from_row).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }
}
