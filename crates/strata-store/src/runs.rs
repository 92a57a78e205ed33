use rusqlite::{params, Connection, OptionalExtension};

use strata_core::error::{Result, StrataError};
use strata_core::types::{Run, RunStatus};

use crate::row::*;
use crate::store::{db_err, WorkflowStore};

const RUN_COLUMNS: &str = "id, session_id, status, mode, primary_agent, model, task_description,
    is_branch, branch_parent_id, branch_depth, created_at, started_at, completed_at";

pub(crate) fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    Ok(Run {
        id: row.get(0)?,
        session_id: row.get(1)?,
        status: enum_col(row, 2)?,
        mode: row.get(3)?,
        primary_agent: row.get(4)?,
        model: row.get(5)?,
        task_description: row.get(6)?,
        is_branch: row.get::<_, i64>(7)? != 0,
        branch_parent_id: row.get(8)?,
        branch_depth: row.get::<_, i64>(9)? as u32,
        created_at: parse_ts(&row.get::<_, String>(10)?),
        started_at: parse_opt_ts(row.get(11)?),
        completed_at: parse_opt_ts(row.get(12)?),
    })
}

pub(crate) fn insert_run_row(conn: &Connection, run: &Run) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO runs (id, session_id, status, mode, primary_agent, model, task_description,
            is_branch, branch_parent_id, branch_depth, created_at, started_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            run.id,
            run.session_id,
            run.status.as_str(),
            run.mode,
            run.primary_agent,
            run.model,
            run.task_description,
            run.is_branch as i64,
            run.branch_parent_id,
            run.branch_depth as i64,
            ts(&run.created_at),
            opt_ts(&run.started_at),
            opt_ts(&run.completed_at),
        ],
    )?;
    Ok(())
}

impl WorkflowStore {
    pub fn insert_run(&self, run: &Run) -> Result<()> {
        let conn = self.conn()?;
        insert_run_row(&conn, run).map_err(db_err)
    }

    pub fn get_run(&self, id: &str) -> Result<Option<Run>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
            params![id],
            run_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    /// Like `get_run`, but a missing run is a `NotFound` error.
    pub fn require_run(&self, id: &str) -> Result<Run> {
        self.get_run(id)?
            .ok_or_else(|| StrataError::not_found("run", id))
    }

    /// List runs, newest first, optionally filtered by session and status.
    pub fn list_runs(&self, session_id: Option<&str>, status: Option<RunStatus>) -> Result<Vec<Run>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM runs
                 WHERE (?1 IS NULL OR session_id = ?1) AND (?2 IS NULL OR status = ?2)
                 ORDER BY created_at DESC, rowid DESC"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![session_id, status.map(|s| s.as_str())], run_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Runs forked directly from `parent_id`.
    pub fn list_child_runs(&self, parent_id: &str) -> Result<Vec<Run>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM runs WHERE branch_parent_id = ?1
                 ORDER BY created_at, rowid"
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map(params![parent_id], run_from_row).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get_run() {
        let store = WorkflowStore::in_memory().unwrap();
        let run = Run::new("sess", "analyze dataset").with_agent("analyst");
        store.insert_run(&run).unwrap();

        let loaded = store.get_run(&run.id).unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Draft);
        assert_eq!(loaded.task_description, "analyze dataset");
        assert_eq!(loaded.primary_agent.as_deref(), Some("analyst"));
        assert!(!loaded.is_branch);

        assert!(store.get_run("missing").unwrap().is_none());
        assert!(matches!(
            store.require_run("missing"),
            Err(StrataError::NotFound { .. })
        ));
    }

    #[test]
    fn test_list_runs_filters() {
        let store = WorkflowStore::in_memory().unwrap();
        store.insert_run(&Run::new("a", "one")).unwrap();
        store.insert_run(&Run::new("a", "two")).unwrap();
        store.insert_run(&Run::new("b", "three")).unwrap();

        assert_eq!(store.list_runs(None, None).unwrap().len(), 3);
        assert_eq!(store.list_runs(Some("a"), None).unwrap().len(), 2);
        assert_eq!(store.list_runs(Some("b"), Some(RunStatus::Draft)).unwrap().len(), 1);
        assert!(store.list_runs(None, Some(RunStatus::Executing)).unwrap().is_empty());
    }

    #[test]
    fn test_child_runs() {
        let store = WorkflowStore::in_memory().unwrap();
        let parent = Run::new("s", "root");
        store.insert_run(&parent).unwrap();
        let child = Run::branch_of(&parent);
        store.insert_run(&child).unwrap();

        let children = store.list_child_runs(&parent.id).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].branch_depth, 1);
        assert!(children[0].is_branch);
    }
}
