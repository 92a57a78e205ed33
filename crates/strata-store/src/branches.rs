use rusqlite::{params, OptionalExtension};

use strata_core::error::{Result, StrataError};
use strata_core::types::{Branch, BranchStatus, Checkpoint, Edge, Node, Run, Step};

use crate::checkpoints::insert_checkpoint_row;
use crate::dag::{insert_edge_row, insert_node_row};
use crate::row::*;
use crate::runs::insert_run_row;
use crate::steps::insert_step_row;
use crate::store::{db_err, WorkflowStore};

const BRANCH_COLUMNS: &str =
    "id, parent_run_id, parent_step_id, child_run_id, branch_name, hypothesis, status, created_at";

fn branch_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Branch> {
    Ok(Branch {
        id: row.get(0)?,
        parent_run_id: row.get(1)?,
        parent_step_id: row.get(2)?,
        child_run_id: row.get(3)?,
        branch_name: row.get(4)?,
        hypothesis: row.get(5)?,
        status: enum_col(row, 6)?,
        created_at: parse_ts(&row.get::<_, String>(7)?),
    })
}

/// Everything a fork writes, persisted in one transaction.
#[derive(Debug, Clone)]
pub struct BranchFork {
    pub run: Run,
    pub steps: Vec<Step>,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub checkpoint: Checkpoint,
    pub branch: Branch,
}

impl WorkflowStore {
    pub fn insert_branch_fork(&self, fork: &BranchFork) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        insert_run_row(&tx, &fork.run).map_err(db_err)?;
        for node in &fork.nodes {
            insert_node_row(&tx, node).map_err(db_err)?;
        }
        for edge in &fork.edges {
            insert_edge_row(&tx, edge).map_err(db_err)?;
        }
        for step in &fork.steps {
            insert_step_row(&tx, step).map_err(db_err)?;
        }
        insert_checkpoint_row(&tx, &fork.checkpoint).map_err(db_err)?;
        let b = &fork.branch;
        tx.execute(
            "INSERT INTO branches (id, parent_run_id, parent_step_id, child_run_id, branch_name,
                hypothesis, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                b.id,
                b.parent_run_id,
                b.parent_step_id,
                b.child_run_id,
                b.branch_name,
                b.hypothesis,
                b.status.as_str(),
                ts(&b.created_at),
            ],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)
    }

    /// Branches forked from `parent_run_id`, oldest first.
    pub fn list_child_branches(&self, parent_run_id: &str) -> Result<Vec<Branch>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {BRANCH_COLUMNS} FROM branches WHERE parent_run_id = ?1
                 ORDER BY created_at, rowid"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![parent_run_id], branch_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// The branch record that created `child_run_id`, if it is a branch.
    pub fn get_branch_for_child(&self, child_run_id: &str) -> Result<Option<Branch>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {BRANCH_COLUMNS} FROM branches WHERE child_run_id = ?1"),
            params![child_run_id],
            branch_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    pub fn update_branch_status(&self, id: &str, status: BranchStatus) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE branches SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(StrataError::not_found("branch", id));
        }
        Ok(())
    }
}
