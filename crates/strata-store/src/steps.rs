use rusqlite::{params, Connection, OptionalExtension};

use strata_core::error::{Result, StrataError};
use strata_core::types::{Step, StepMeta, StepStatus, StepUpdate};

use crate::row::*;
use crate::store::{db_err, WorkflowStore};

const STEP_COLUMNS: &str = "id, run_id, session_id, node_id, step_number, task, agent, status,
    inputs, outputs, meta, error, created_at, started_at, completed_at";

pub(crate) fn step_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Step> {
    Ok(Step {
        id: row.get(0)?,
        run_id: row.get(1)?,
        session_id: row.get(2)?,
        node_id: row.get(3)?,
        step_number: row.get(4)?,
        task: row.get(5)?,
        agent: row.get(6)?,
        status: enum_col(row, 7)?,
        inputs: json_col(row, 8)?,
        outputs: json_col(row, 9)?,
        meta: json_col(row, 10)?,
        error: row.get(11)?,
        created_at: parse_ts(&row.get::<_, String>(12)?),
        started_at: parse_opt_ts(row.get(13)?),
        completed_at: parse_opt_ts(row.get(14)?),
    })
}

pub(crate) fn insert_step_row(conn: &Connection, step: &Step) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO steps (id, run_id, session_id, node_id, step_number, task, agent, status,
            inputs, outputs, meta, error, created_at, started_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            step.id,
            step.run_id,
            step.session_id,
            step.node_id,
            step.step_number,
            step.task,
            step.agent,
            step.status.as_str(),
            to_json(&step.inputs),
            to_json(&step.outputs),
            to_json(&step.meta),
            step.error,
            ts(&step.created_at),
            opt_ts(&step.started_at),
            opt_ts(&step.completed_at),
        ],
    )?;
    Ok(())
}

impl WorkflowStore {
    pub fn insert_step(&self, step: &Step) -> Result<()> {
        let conn = self.conn()?;
        insert_step_row(&conn, step).map_err(db_err)
    }

    pub fn get_step(&self, id: &str) -> Result<Option<Step>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {STEP_COLUMNS} FROM steps WHERE id = ?1"),
            params![id],
            step_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    pub fn require_step(&self, id: &str) -> Result<Step> {
        self.get_step(id)?
            .ok_or_else(|| StrataError::not_found("step", id))
    }

    /// Steps of a run ordered by step number.
    pub fn list_steps(&self, run_id: &str) -> Result<Vec<Step>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {STEP_COLUMNS} FROM steps WHERE run_id = ?1 ORDER BY step_number, rowid"
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map(params![run_id], step_from_row).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    pub fn get_step_by_number(&self, run_id: &str, step_number: i64) -> Result<Option<Step>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {STEP_COLUMNS} FROM steps WHERE run_id = ?1 AND step_number = ?2
                 ORDER BY rowid LIMIT 1"
            ),
            params![run_id, step_number],
            step_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    /// The step attached to a DAG node, if one was created.
    pub fn find_step_for_node(&self, run_id: &str, node_id: &str) -> Result<Option<Step>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {STEP_COLUMNS} FROM steps WHERE run_id = ?1 AND node_id = ?2
                 ORDER BY rowid LIMIT 1"
            ),
            params![run_id, node_id],
            step_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    /// Steps across every run of a session, optionally filtered by status.
    pub fn list_steps_in_session(
        &self,
        session_id: &str,
        status: Option<StepStatus>,
    ) -> Result<Vec<Step>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {STEP_COLUMNS} FROM steps
                 WHERE session_id = ?1 AND (?2 IS NULL OR status = ?2)
                 ORDER BY created_at, rowid"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![session_id, status.map(|s| s.as_str())], step_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Apply a partial update to the step's non-status fields.
    pub fn update_step(&self, id: &str, update: StepUpdate) -> Result<Step> {
        let conn = self.conn()?;
        let mut step = conn
            .query_row(
                &format!("SELECT {STEP_COLUMNS} FROM steps WHERE id = ?1"),
                params![id],
                step_from_row,
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| StrataError::not_found("step", id))?;

        if let Some(task) = update.task {
            step.task = task;
        }
        if let Some(inputs) = update.inputs {
            step.inputs = inputs;
        }
        if let Some(outputs) = update.outputs {
            step.outputs = outputs;
        }
        if let Some(meta) = update.meta {
            step.meta = meta;
        }
        if let Some(error) = update.error {
            step.error = error;
        }

        conn.execute(
            "UPDATE steps SET task = ?2, inputs = ?3, outputs = ?4, meta = ?5, error = ?6
             WHERE id = ?1",
            params![
                id,
                step.task,
                to_json(&step.inputs),
                to_json(&step.outputs),
                to_json(&step.meta),
                step.error,
            ],
        )
        .map_err(db_err)?;
        Ok(step)
    }

    pub fn save_step_meta(&self, id: &str, meta: &StepMeta) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE steps SET meta = ?2 WHERE id = ?1",
                params![id, to_json(meta)],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(StrataError::not_found("step", id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::types::{RetryAttempt, Run};

    fn setup() -> (WorkflowStore, Run) {
        let store = WorkflowStore::in_memory().unwrap();
        let run = Run::new("sess", "task");
        store.insert_run(&run).unwrap();
        (store, run)
    }

    #[test]
    fn test_steps_ordered_by_number() {
        let (store, run) = setup();
        store.insert_step(&Step::new(&run, 2, "second")).unwrap();
        store.insert_step(&Step::new(&run, 1, "first")).unwrap();

        let steps = store.list_steps(&run.id).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].task, "first");
        assert_eq!(steps[1].step_number, 2);

        let by_number = store.get_step_by_number(&run.id, 2).unwrap().unwrap();
        assert_eq!(by_number.task, "second");
    }

    #[test]
    fn test_update_step_partial() {
        let (store, run) = setup();
        let step = Step::new(&run, 1, "work");
        store.insert_step(&step).unwrap();

        let updated = store
            .update_step(
                &step.id,
                StepUpdate {
                    outputs: Some(serde_json::json!({"answer": 42})),
                    error: Some(Some("boom".into())),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.task, "work");
        assert_eq!(updated.outputs["answer"], 42);

        let loaded = store.get_step(&step.id).unwrap().unwrap();
        assert_eq!(loaded.error.as_deref(), Some("boom"));

        assert!(store.update_step("missing", StepUpdate::default()).is_err());
    }

    #[test]
    fn test_meta_round_trips_attempts() {
        let (store, run) = setup();
        let step = Step::new(&run, 1, "work");
        store.insert_step(&step).unwrap();

        let mut meta = StepMeta::default();
        meta.retry_attempts.push(RetryAttempt::success(1));
        meta.extra.insert("tokens".into(), serde_json::json!(10));
        store.save_step_meta(&step.id, &meta).unwrap();

        let loaded = store.get_step(&step.id).unwrap().unwrap();
        assert_eq!(loaded.meta.retry_attempts.len(), 1);
        assert_eq!(loaded.meta.extra["tokens"], 10);
    }

    #[test]
    fn test_steps_in_session_filter() {
        let (store, run) = setup();
        store.insert_step(&Step::new(&run, 1, "a")).unwrap();
        assert_eq!(
            store.list_steps_in_session("sess", Some(StepStatus::Pending)).unwrap().len(),
            1
        );
        assert!(store
            .list_steps_in_session("sess", Some(StepStatus::Completed))
            .unwrap()
            .is_empty());
    }
}
