use rusqlite::{params, Connection, OptionalExtension};

use strata_core::error::{Result, StrataError};
use strata_core::types::{Edge, Node, NodeStatus, NodeType};

use crate::row::*;
use crate::store::{db_err, WorkflowStore};

const NODE_COLUMNS: &str = "id, run_id, node_type, agent, status, order_index, depth,
    parent_node_id, meta, outputs, error, created_at, started_at, completed_at";

const EDGE_COLUMNS: &str = "id, run_id, from_node, to_node, dependency_type, condition";

pub(crate) fn node_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Node> {
    Ok(Node {
        id: row.get(0)?,
        run_id: row.get(1)?,
        node_type: enum_col(row, 2)?,
        agent: row.get(3)?,
        status: enum_col(row, 4)?,
        order_index: row.get(5)?,
        depth: row.get::<_, i64>(6)? as u32,
        parent_node_id: row.get(7)?,
        meta: json_col(row, 8)?,
        outputs: json_col(row, 9)?,
        error: row.get(10)?,
        created_at: parse_ts(&row.get::<_, String>(11)?),
        started_at: parse_opt_ts(row.get(12)?),
        completed_at: parse_opt_ts(row.get(13)?),
    })
}

fn edge_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Edge> {
    Ok(Edge {
        id: row.get(0)?,
        run_id: row.get(1)?,
        from_node: row.get(2)?,
        to_node: row.get(3)?,
        dependency_type: enum_col(row, 4)?,
        condition: row.get(5)?,
    })
}

pub(crate) fn insert_node_row(conn: &Connection, node: &Node) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO nodes (id, run_id, node_type, agent, status, order_index, depth,
            parent_node_id, meta, outputs, error, created_at, started_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            node.id,
            node.run_id,
            node.node_type.as_str(),
            node.agent,
            node.status.as_str(),
            node.order_index,
            node.depth as i64,
            node.parent_node_id,
            to_json(&node.meta),
            to_json(&node.outputs),
            node.error,
            ts(&node.created_at),
            opt_ts(&node.started_at),
            opt_ts(&node.completed_at),
        ],
    )?;
    Ok(())
}

pub(crate) fn insert_edge_row(conn: &Connection, edge: &Edge) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO edges (id, run_id, from_node, to_node, dependency_type, condition)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            edge.id,
            edge.run_id,
            edge.from_node,
            edge.to_node,
            edge.dependency_type.as_str(),
            edge.condition,
        ],
    )?;
    Ok(())
}

impl WorkflowStore {
    /// Persist a whole graph atomically: either every node and edge lands or none.
    pub fn insert_dag(&self, nodes: &[Node], edges: &[Edge]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        for node in nodes {
            insert_node_row(&tx, node).map_err(db_err)?;
        }
        for edge in edges {
            insert_edge_row(&tx, edge).map_err(db_err)?;
        }
        tx.commit().map_err(db_err)
    }

    pub fn get_node(&self, id: &str) -> Result<Option<Node>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1"),
            params![id],
            node_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    pub fn require_node(&self, id: &str) -> Result<Node> {
        self.get_node(id)?
            .ok_or_else(|| StrataError::not_found("node", id))
    }

    /// Nodes of a run ordered by `order_index`.
    pub fn list_nodes(&self, run_id: &str) -> Result<Vec<Node>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {NODE_COLUMNS} FROM nodes WHERE run_id = ?1 ORDER BY order_index, rowid"
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map(params![run_id], node_from_row).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Nodes of one type in one status, across runs.
    pub fn list_nodes_by_type_status(
        &self,
        node_type: NodeType,
        status: NodeStatus,
    ) -> Result<Vec<Node>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {NODE_COLUMNS} FROM nodes WHERE node_type = ?1 AND status = ?2
                 ORDER BY created_at, rowid"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![node_type.as_str(), status.as_str()], node_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    pub fn list_edges(&self, run_id: &str) -> Result<Vec<Edge>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {EDGE_COLUMNS} FROM edges WHERE run_id = ?1 ORDER BY rowid"
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map(params![run_id], edge_from_row).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Store a node's outputs and error message. Status is left to the state machine.
    pub fn update_node_result(
        &self,
        id: &str,
        outputs: &serde_json::Value,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE nodes SET outputs = ?2, error = ?3 WHERE id = ?1",
                params![id, to_json(outputs), error],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(StrataError::not_found("node", id));
        }
        Ok(())
    }

    /// Clear results of nodes (and their steps) about to be re-executed.
    pub fn clear_results(&self, node_ids: &[String]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        for id in node_ids {
            tx.execute(
                "UPDATE nodes SET outputs = 'null', error = NULL, started_at = NULL,
                    completed_at = NULL WHERE id = ?1",
                params![id],
            )
            .map_err(db_err)?;
            tx.execute(
                "UPDATE steps SET outputs = 'null', error = NULL, started_at = NULL,
                    completed_at = NULL WHERE node_id = ?1",
                params![id],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)
    }
}
