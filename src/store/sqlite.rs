use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::backend::ServerStore;
use super::schema;
use crate::server::{
    Cloud, ComputeServer, Configuration, NewComputeServer, ServerError, State,
};

/// SQLite-backed store for single-node deployments.
///
/// Besides the server records it also backs the billing ledger, API keys,
/// DNS records and detailed states (see `services.rs`).
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

const SERVER_COLUMNS: &str = "id, account_id, project_id, title, cloud, configuration,
    provisioned_configuration, state, error, cost_per_hour, created_at, updated_at";

impl SqliteBackend {
    /// Open or create the SQLite state database.
    pub fn open(db_path: &str) -> Result<Self> {
        let parent = Path::new(db_path).parent();
        if let Some(dir) = parent {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open state database at {}", db_path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("State database lock poisoned"))
    }

    pub(crate) fn now() -> String {
        chrono::Utc::now().to_rfc3339()
    }

    fn load(conn: &Connection, id: i64) -> Result<ComputeServer> {
        let sql = format!("SELECT {} FROM compute_servers WHERE id = ?1", SERVER_COLUMNS);
        let row = conn
            .query_row(&sql, params![id], ServerRow::from_row)
            .optional()?
            .ok_or(ServerError::NotFound(id))?;
        row.into_server()
    }

    fn is_collaborator(conn: &Connection, project_id: &str, account_id: &str) -> Result<bool> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM project_collaborators WHERE project_id = ?1 AND account_id = ?2",
            params![project_id, account_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn update(conn: &Connection, id: i64, column: &str, value: &dyn rusqlite::ToSql) -> Result<()> {
        let sql = format!(
            "UPDATE compute_servers SET {} = ?1, updated_at = ?2 WHERE id = ?3",
            column
        );
        let rows = conn.execute(&sql, params![value, Self::now(), id])?;
        if rows == 0 {
            return Err(ServerError::NotFound(id).into());
        }
        Ok(())
    }
}

/// Raw column values, converted outside the rusqlite row closure so parse
/// failures carry context.
struct ServerRow {
    id: i64,
    account_id: String,
    project_id: String,
    title: String,
    cloud: String,
    configuration: String,
    provisioned_configuration: Option<String>,
    state: String,
    error: Option<String>,
    cost_per_hour: f64,
    created_at: String,
    updated_at: String,
}

impl ServerRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            account_id: row.get(1)?,
            project_id: row.get(2)?,
            title: row.get(3)?,
            cloud: row.get(4)?,
            configuration: row.get(5)?,
            provisioned_configuration: row.get(6)?,
            state: row.get(7)?,
            error: row.get(8)?,
            cost_per_hour: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_server(self) -> Result<ComputeServer> {
        let configuration: Configuration = serde_json::from_str(&self.configuration)
            .with_context(|| format!("Corrupt configuration for compute server {}", self.id))?;
        let provisioned_configuration = self
            .provisioned_configuration
            .map(|json| serde_json::from_str::<Configuration>(&json))
            .transpose()
            .with_context(|| {
                format!("Corrupt provisioned configuration for compute server {}", self.id)
            })?;
        Ok(ComputeServer {
            id: self.id,
            account_id: self.account_id,
            project_id: self.project_id,
            title: self.title,
            cloud: self.cloud.parse::<Cloud>()?,
            configuration,
            provisioned_configuration,
            state: self.state.parse::<State>()?,
            error: self.error,
            cost_per_hour: self.cost_per_hour,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[async_trait]
impl ServerStore for SqliteBackend {
    // ─── Initialization ─────────────────────────────────────────────────────

    async fn initialize(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(schema::CREATE_TABLES_SQL)?;
        conn.execute_batch(schema::CREATE_INDEXES_SQL)?;

        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at, description) VALUES (?1, ?2, ?3)",
            params![schema::SCHEMA_VERSION, Self::now(), "Initial schema"],
        )?;
        Ok(())
    }

    // ─── Records ────────────────────────────────────────────────────────────

    async fn create(&self, server: &NewComputeServer) -> Result<i64> {
        let configuration = serde_json::to_string(&server.configuration)?;
        let now = Self::now();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO compute_servers (account_id, project_id, title, cloud, configuration,
                state, cost_per_hour, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8)",
            params![
                server.account_id,
                server.project_id,
                server.title,
                server.configuration.cloud().as_str(),
                configuration,
                State::Deprovisioned.as_str(),
                now,
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn get(&self, account_id: &str, id: i64) -> Result<ComputeServer> {
        let conn = self.conn()?;
        let server = Self::load(&conn, id)?;
        if server.account_id != account_id
            && !Self::is_collaborator(&conn, &server.project_id, account_id)?
        {
            return Err(ServerError::Unauthorized {
                account_id: account_id.to_string(),
                id,
                action: "access",
            }
            .into());
        }
        Ok(server)
    }

    async fn get_unchecked(&self, id: i64) -> Result<ComputeServer> {
        let conn = self.conn()?;
        Self::load(&conn, id)
    }

    async fn list(&self, account_id: &str) -> Result<Vec<ComputeServer>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM compute_servers
             WHERE account_id = ?1
                OR project_id IN (SELECT project_id FROM project_collaborators WHERE account_id = ?1)
             ORDER BY id",
            SERVER_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![account_id], ServerRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(ServerRow::into_server).collect()
    }

    async fn add_collaborator(&self, project_id: &str, account_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO project_collaborators (project_id, account_id) VALUES (?1, ?2)",
            params![project_id, account_id],
        )?;
        Ok(())
    }

    // ─── Field updates ──────────────────────────────────────────────────────

    async fn set_state(&self, id: i64, state: State) -> Result<State> {
        let conn = self.conn()?;
        let previous: String = conn
            .query_row(
                "SELECT state FROM compute_servers WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(ServerError::NotFound(id))?;
        Self::update(&conn, id, "state", &state.as_str())?;
        previous.parse::<State>()
    }

    async fn set_error(&self, id: i64, error: Option<&str>) -> Result<()> {
        let conn = self.conn()?;
        Self::update(&conn, id, "error", &error)
    }

    async fn set_cost_per_hour(&self, id: i64, cost_per_hour: f64) -> Result<()> {
        let conn = self.conn()?;
        Self::update(&conn, id, "cost_per_hour", &cost_per_hour)
    }

    async fn set_configuration(&self, id: i64, configuration: &Configuration) -> Result<()> {
        let json = serde_json::to_string(configuration)?;
        let conn = self.conn()?;
        Self::update(&conn, id, "configuration", &json)
    }

    async fn set_provisioned_configuration(
        &self,
        id: i64,
        configuration: &Configuration,
    ) -> Result<()> {
        let json = serde_json::to_string(configuration)?;
        let conn = self.conn()?;
        Self::update(&conn, id, "provisioned_configuration", &json)
    }
}
