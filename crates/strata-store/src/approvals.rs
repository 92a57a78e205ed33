use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use strata_core::error::Result;
use strata_core::types::{ApprovalRequest, ApprovalResolution, ApprovalStatus};

use crate::row::*;
use crate::store::{db_err, WorkflowStore};

const APPROVAL_COLUMNS: &str = "id, run_id, step_id, node_id, approval_type, status, context,
    message, options, resolution, feedback, created_at, resolved_at, expires_at";

fn approval_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApprovalRequest> {
    Ok(ApprovalRequest {
        id: row.get(0)?,
        run_id: row.get(1)?,
        step_id: row.get(2)?,
        node_id: row.get(3)?,
        approval_type: row.get(4)?,
        status: enum_col(row, 5)?,
        context: json_col(row, 6)?,
        message: row.get(7)?,
        options: json_col(row, 8)?,
        resolution: opt_enum_col(row, 9)?,
        feedback: row.get(10)?,
        created_at: parse_ts(&row.get::<_, String>(11)?),
        resolved_at: parse_opt_ts(row.get(12)?),
        expires_at: parse_opt_ts(row.get(13)?),
    })
}

impl WorkflowStore {
    pub fn insert_approval(&self, req: &ApprovalRequest) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO approval_requests (id, run_id, step_id, node_id, approval_type, status,
                context, message, options, resolution, feedback, created_at, resolved_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                req.id,
                req.run_id,
                req.step_id,
                req.node_id,
                req.approval_type,
                req.status.as_str(),
                to_json(&req.context),
                req.message,
                to_json(&req.options),
                req.resolution.map(|r| r.as_str()),
                req.feedback,
                ts(&req.created_at),
                opt_ts(&req.resolved_at),
                opt_ts(&req.expires_at),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn get_approval(&self, id: &str) -> Result<Option<ApprovalRequest>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {APPROVAL_COLUMNS} FROM approval_requests WHERE id = ?1"),
            params![id],
            approval_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    /// Resolve a pending request. Returns false when it was no longer pending.
    pub fn resolve_approval_record(
        &self,
        id: &str,
        status: ApprovalStatus,
        resolution: ApprovalResolution,
        feedback: Option<&str>,
        resolved_at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE approval_requests
                 SET status = ?2, resolution = ?3, feedback = ?4, resolved_at = ?5
                 WHERE id = ?1 AND status = 'pending'",
                params![id, status.as_str(), resolution.as_str(), feedback, ts(&resolved_at)],
            )
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    /// Requests, newest first, optionally filtered by run and status.
    pub fn list_approvals(
        &self,
        run_id: Option<&str>,
        status: Option<ApprovalStatus>,
    ) -> Result<Vec<ApprovalRequest>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {APPROVAL_COLUMNS} FROM approval_requests
                 WHERE (?1 IS NULL OR run_id = ?1) AND (?2 IS NULL OR status = ?2)
                 ORDER BY created_at DESC, rowid DESC"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![run_id, status.map(|s| s.as_str())], approval_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// The most recently resolved request of a run.
    pub fn latest_resolved_approval(&self, run_id: &str) -> Result<Option<ApprovalRequest>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {APPROVAL_COLUMNS} FROM approval_requests
                 WHERE run_id = ?1 AND status != 'pending' AND resolved_at IS NOT NULL
                 ORDER BY resolved_at DESC, rowid DESC LIMIT 1"
            ),
            params![run_id],
            approval_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    /// Mark pending requests past their deadline as expired. Returns their ids.
    pub fn expire_pending(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        let now_s = ts(&now);
        let ids = {
            let mut stmt = tx
                .prepare(
                    "SELECT id FROM approval_requests
                     WHERE status = 'pending' AND expires_at IS NOT NULL AND expires_at <= ?1",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![now_s], |row| row.get::<_, String>(0))
                .map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)?
        };
        for id in &ids {
            tx.execute(
                "UPDATE approval_requests SET status = 'expired', resolved_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![id, now_s],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(ids)
    }

    /// Cancel every pending request of a run. Returns their ids.
    pub fn cancel_pending_approvals(&self, run_id: &str) -> Result<Vec<String>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        let ids = {
            let mut stmt = tx
                .prepare("SELECT id FROM approval_requests WHERE run_id = ?1 AND status = 'pending'")
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![run_id], |row| row.get::<_, String>(0))
                .map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)?
        };
        tx.execute(
            "UPDATE approval_requests SET status = 'cancelled', resolved_at = ?2
             WHERE run_id = ?1 AND status = 'pending'",
            params![run_id, ts(&Utc::now())],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use strata_core::types::{new_id, Run};

    fn request(run: &Run, expires_in: Duration) -> ApprovalRequest {
        let now = Utc::now();
        ApprovalRequest {
            id: new_id(),
            run_id: run.id.clone(),
            step_id: None,
            node_id: None,
            approval_type: "review".into(),
            status: ApprovalStatus::Pending,
            context: serde_json::json!({"diff": "+1"}),
            message: "Review the change".into(),
            options: vec!["approved".into(), "rejected".into()],
            resolution: None,
            feedback: None,
            created_at: now,
            resolved_at: None,
            expires_at: Some(now + expires_in),
        }
    }

    fn setup() -> (WorkflowStore, Run) {
        let store = WorkflowStore::in_memory().unwrap();
        let run = Run::new("s", "t");
        store.insert_run(&run).unwrap();
        (store, run)
    }

    #[test]
    fn test_resolve_only_once() {
        let (store, run) = setup();
        let req = request(&run, Duration::hours(1));
        store.insert_approval(&req).unwrap();

        let first = store
            .resolve_approval_record(&req.id, ApprovalStatus::Modified, ApprovalResolution::Modified, Some("tweak"), Utc::now())
            .unwrap();
        assert!(first);
        let second = store
            .resolve_approval_record(&req.id, ApprovalStatus::Rejected, ApprovalResolution::Rejected, None, Utc::now())
            .unwrap();
        assert!(!second);

        let loaded = store.get_approval(&req.id).unwrap().unwrap();
        assert_eq!(loaded.status, ApprovalStatus::Modified);
        assert_eq!(loaded.resolution, Some(ApprovalResolution::Modified));
        assert_eq!(loaded.feedback.as_deref(), Some("tweak"));
        assert_eq!(loaded.options.len(), 2);

        let latest = store.latest_resolved_approval(&run.id).unwrap().unwrap();
        assert_eq!(latest.id, req.id);
    }

    #[test]
    fn test_expire_pending() {
        let (store, run) = setup();
        let stale = request(&run, Duration::seconds(-5));
        let fresh = request(&run, Duration::hours(1));
        store.insert_approval(&stale).unwrap();
        store.insert_approval(&fresh).unwrap();

        let expired = store.expire_pending(Utc::now()).unwrap();
        assert_eq!(expired, vec![stale.id.clone()]);
        let pending = store
            .list_approvals(Some(&run.id), Some(ApprovalStatus::Pending))
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, fresh.id);
    }

    #[test]
    fn test_cancel_pending() {
        let (store, run) = setup();
        store.insert_approval(&request(&run, Duration::hours(1))).unwrap();
        store.insert_approval(&request(&run, Duration::hours(1))).unwrap();

        assert_eq!(store.cancel_pending_approvals(&run.id).unwrap().len(), 2);
        assert!(store
            .list_approvals(Some(&run.id), Some(ApprovalStatus::Pending))
            .unwrap()
            .is_empty());
        assert_eq!(
            store.list_approvals(None, Some(ApprovalStatus::Cancelled)).unwrap().len(),
            2
        );
    }
}
