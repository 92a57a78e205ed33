use rusqlite::{params, Connection, OptionalExtension};

use strata_core::error::Result;
use strata_core::types::Checkpoint;

use crate::row::*;
use crate::store::{db_err, WorkflowStore};

const CHECKPOINT_COLUMNS: &str =
    "id, run_id, step_id, step_number, checkpoint_type, context_snapshot, created_at";

fn checkpoint_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Checkpoint> {
    Ok(Checkpoint {
        id: row.get(0)?,
        run_id: row.get(1)?,
        step_id: row.get(2)?,
        step_number: row.get(3)?,
        checkpoint_type: enum_col(row, 4)?,
        context_snapshot: json_col(row, 5)?,
        created_at: parse_ts(&row.get::<_, String>(6)?),
    })
}

pub(crate) fn insert_checkpoint_row(conn: &Connection, cp: &Checkpoint) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO checkpoints (id, run_id, step_id, step_number, checkpoint_type,
            context_snapshot, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            cp.id,
            cp.run_id,
            cp.step_id,
            cp.step_number,
            cp.checkpoint_type.as_str(),
            to_json(&cp.context_snapshot),
            ts(&cp.created_at),
        ],
    )?;
    Ok(())
}

impl WorkflowStore {
    pub fn insert_checkpoint(&self, cp: &Checkpoint) -> Result<()> {
        let conn = self.conn()?;
        insert_checkpoint_row(&conn, cp).map_err(db_err)
    }

    /// Most recent checkpoint of a run.
    ///
    /// With `at_or_before`, only checkpoints recorded at a step number no
    /// greater than it are considered, highest step number first.
    pub fn latest_checkpoint(
        &self,
        run_id: &str,
        at_or_before: Option<i64>,
    ) -> Result<Option<Checkpoint>> {
        let conn = self.conn()?;
        let result = match at_or_before {
            Some(limit) => conn.query_row(
                &format!(
                    "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints
                     WHERE run_id = ?1 AND step_number IS NOT NULL AND step_number <= ?2
                     ORDER BY step_number DESC, rowid DESC LIMIT 1"
                ),
                params![run_id, limit],
                checkpoint_from_row,
            ),
            None => conn.query_row(
                &format!(
                    "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE run_id = ?1
                     ORDER BY rowid DESC LIMIT 1"
                ),
                params![run_id],
                checkpoint_from_row,
            ),
        };
        result.optional().map_err(db_err)
    }

    pub fn list_checkpoints(&self, run_id: &str) -> Result<Vec<Checkpoint>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE run_id = ?1 ORDER BY rowid"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![run_id], checkpoint_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }
}
