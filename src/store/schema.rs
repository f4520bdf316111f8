/// SQL DDL for the stratus state database.
///
/// Configurations are stored as JSON text; timestamps are RFC 3339 text.

pub const SCHEMA_VERSION: i32 = 1;

pub const CREATE_TABLES_SQL: &str = "
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL,
    description TEXT
);

-- One row per compute server
CREATE TABLE IF NOT EXISTS compute_servers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    title TEXT NOT NULL DEFAULT '',
    cloud TEXT NOT NULL,
    configuration TEXT NOT NULL,
    provisioned_configuration TEXT,
    state TEXT NOT NULL DEFAULT 'deprovisioned',
    error TEXT,
    cost_per_hour REAL NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Accounts sharing a project (read access to its servers)
CREATE TABLE IF NOT EXISTS project_collaborators (
    project_id TEXT NOT NULL,
    account_id TEXT NOT NULL,
    PRIMARY KEY (project_id, account_id)
);

-- Billing ledger: one open row per server while it accrues cost
CREATE TABLE IF NOT EXISTS purchases (
    id TEXT PRIMARY KEY,
    server_id INTEGER NOT NULL,
    account_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    state TEXT NOT NULL,
    cost_per_hour REAL NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    FOREIGN KEY (server_id) REFERENCES compute_servers(id) ON DELETE CASCADE
);

-- Project API keys issued to nodes (only the digest is kept)
CREATE TABLE IF NOT EXISTS project_api_keys (
    server_id INTEGER PRIMARY KEY,
    project_id TEXT NOT NULL,
    account_id TEXT NOT NULL,
    key_prefix TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (server_id) REFERENCES compute_servers(id) ON DELETE CASCADE
);

-- Local DNS records
CREATE TABLE IF NOT EXISTS dns_records (
    name TEXT PRIMARY KEY,
    server_id INTEGER NOT NULL,
    cloud TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Sub-resource progress markers
CREATE TABLE IF NOT EXISTS detailed_states (
    server_id INTEGER NOT NULL,
    project_id TEXT NOT NULL,
    name TEXT NOT NULL,
    state TEXT NOT NULL,
    progress INTEGER,
    expires_at TEXT,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (server_id, name)
);
";

pub const CREATE_INDEXES_SQL: &str = "
CREATE INDEX IF NOT EXISTS idx_servers_account ON compute_servers(account_id);
CREATE INDEX IF NOT EXISTS idx_servers_project ON compute_servers(project_id);
CREATE INDEX IF NOT EXISTS idx_collaborators_account ON project_collaborators(account_id);
CREATE INDEX IF NOT EXISTS idx_purchases_server ON purchases(server_id);
CREATE INDEX IF NOT EXISTS idx_dns_server ON dns_records(server_id);
";
