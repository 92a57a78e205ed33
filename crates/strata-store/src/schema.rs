pub(crate) const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    status TEXT NOT NULL,
    mode TEXT NOT NULL,
    primary_agent TEXT,
    model TEXT,
    task_description TEXT NOT NULL,
    is_branch INTEGER NOT NULL DEFAULT 0,
    branch_parent_id TEXT,
    branch_depth INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_runs_session_status ON runs(session_id, status);

CREATE TABLE IF NOT EXISTS steps (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    session_id TEXT NOT NULL,
    node_id TEXT,
    step_number INTEGER NOT NULL,
    task TEXT NOT NULL,
    agent TEXT,
    status TEXT NOT NULL,
    inputs TEXT NOT NULL DEFAULT 'null',
    outputs TEXT NOT NULL DEFAULT 'null',
    meta TEXT NOT NULL DEFAULT '{}',
    error TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_steps_run_number ON steps(run_id, step_number);
CREATE INDEX IF NOT EXISTS idx_steps_session_status ON steps(session_id, status);

CREATE TABLE IF NOT EXISTS nodes (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    node_type TEXT NOT NULL,
    agent TEXT,
    status TEXT NOT NULL,
    order_index INTEGER NOT NULL,
    depth INTEGER NOT NULL DEFAULT 0,
    parent_node_id TEXT,
    meta TEXT NOT NULL DEFAULT '{}',
    outputs TEXT NOT NULL DEFAULT 'null',
    error TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_nodes_run_order ON nodes(run_id, order_index);
CREATE INDEX IF NOT EXISTS idx_nodes_type_status ON nodes(node_type, status);

CREATE TABLE IF NOT EXISTS edges (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    from_node TEXT NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
    to_node TEXT NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
    dependency_type TEXT NOT NULL,
    condition TEXT
);

CREATE INDEX IF NOT EXISTS idx_edges_from_to ON edges(from_node, to_node);

CREATE TABLE IF NOT EXISTS checkpoints (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    step_id TEXT,
    step_number INTEGER,
    checkpoint_type TEXT NOT NULL,
    context_snapshot TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_checkpoints_run_step ON checkpoints(run_id, step_number);

CREATE TABLE IF NOT EXISTS branches (
    id TEXT PRIMARY KEY,
    parent_run_id TEXT NOT NULL REFERENCES runs(id),
    parent_step_id TEXT,
    child_run_id TEXT NOT NULL REFERENCES runs(id),
    branch_name TEXT NOT NULL,
    hypothesis TEXT,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_branches_parent ON branches(parent_run_id);
CREATE INDEX IF NOT EXISTS idx_branches_child ON branches(child_run_id);

CREATE TABLE IF NOT EXISTS approval_requests (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    step_id TEXT,
    node_id TEXT,
    approval_type TEXT NOT NULL,
    status TEXT NOT NULL,
    context TEXT NOT NULL DEFAULT 'null',
    message TEXT NOT NULL,
    options TEXT NOT NULL DEFAULT '[]',
    resolution TEXT,
    feedback TEXT,
    created_at TEXT NOT NULL,
    resolved_at TEXT,
    expires_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_approvals_run_status ON approval_requests(run_id, status);
CREATE INDEX IF NOT EXISTS idx_approvals_expires ON approval_requests(expires_at);

CREATE TABLE IF NOT EXISTS state_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    run_id TEXT NOT NULL,
    from_state TEXT NOT NULL,
    to_state TEXT NOT NULL,
    reason TEXT,
    actor TEXT NOT NULL,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_history_entity ON state_history(entity_type, entity_id);
CREATE INDEX IF NOT EXISTS idx_history_timestamp ON state_history(timestamp);
";
