use anyhow::Result;
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::sqlite::SqliteBackend;
use crate::billing::PurchaseLedger;
use crate::dns::{DnsChange, DnsProvider};
use crate::project::{ApiKeyIssuer, DetailedState, DetailedStateReporter};
use crate::server::{ComputeServer, State};

/// A billing ledger row; `ended_at` is unset while it accrues.
#[derive(Debug, Clone, PartialEq)]
pub struct Purchase {
    pub id: String,
    pub server_id: i64,
    pub state: State,
    pub cost_per_hour: f64,
    pub started_at: String,
    pub ended_at: Option<String>,
}

impl SqliteBackend {
    /// Purchases for a server, oldest first.
    pub fn list_purchases(&self, server_id: i64) -> Result<Vec<Purchase>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, server_id, state, cost_per_hour, started_at, ended_at
             FROM purchases WHERE server_id = ?1 ORDER BY started_at, rowid",
        )?;
        let rows = stmt
            .query_map(params![server_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(id, server_id, state, cost_per_hour, started_at, ended_at)| {
                Ok(Purchase {
                    id,
                    server_id,
                    state: state.parse()?,
                    cost_per_hour,
                    started_at,
                    ended_at,
                })
            })
            .collect()
    }

    /// Server a local DNS name currently points at.
    pub fn dns_record(&self, name: &str) -> Result<Option<i64>> {
        let conn = self.conn()?;
        let id = conn
            .query_row(
                "SELECT server_id FROM dns_records WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn has_api_key(&self, server_id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM project_api_keys WHERE server_id = ?1",
            params![server_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

// ─── Billing ────────────────────────────────────────────────────────────────

#[async_trait]
impl PurchaseLedger for SqliteBackend {
    /// Close the open purchase and, if the new state costs anything, open a
    /// new one at the new rate. Repeating an update is a no-op.
    async fn update_purchase(&self, server: &ComputeServer, new_state: State) -> Result<()> {
        let billed_state = new_state.stable_target();
        let conn = self.conn()?;
        let open: Option<(String, String, f64)> = conn
            .query_row(
                "SELECT id, state, cost_per_hour FROM purchases
                 WHERE server_id = ?1 AND ended_at IS NULL",
                params![server.id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        if let Some((_, state, cost)) = &open {
            if state == billed_state.as_str() && *cost == server.cost_per_hour {
                return Ok(());
            }
        }

        let now = Self::now();
        if let Some((id, _, _)) = &open {
            conn.execute(
                "UPDATE purchases SET ended_at = ?1 WHERE id = ?2",
                params![now, id],
            )?;
        }

        if new_state != State::Deprovisioned && server.cost_per_hour > 0.0 {
            let id = uuid::Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO purchases (id, server_id, account_id, project_id, state, cost_per_hour, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id,
                    server.id,
                    server.account_id,
                    server.project_id,
                    billed_state.as_str(),
                    server.cost_per_hour,
                    now,
                ],
            )?;
            debug!(id = server.id, purchase = %id, state = %billed_state, "Opened purchase");
        }
        Ok(())
    }
}

// ─── Project API keys ───────────────────────────────────────────────────────

#[async_trait]
impl ApiKeyIssuer for SqliteBackend {
    async fn set_project_api_key(&self, account_id: &str, server: &ComputeServer) -> Result<()> {
        let secret = format!("sk-{}", uuid::Uuid::new_v4().simple());
        let key_hash = hex::encode(Sha256::digest(secret.as_bytes()));
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO project_api_keys (server_id, project_id, account_id, key_prefix, key_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(server_id) DO UPDATE SET
                account_id = excluded.account_id,
                key_prefix = excluded.key_prefix,
                key_hash = excluded.key_hash,
                created_at = excluded.created_at",
            params![
                server.id,
                server.project_id,
                account_id,
                &secret[..9],
                key_hash,
                Self::now(),
            ],
        )?;
        Ok(())
    }

    async fn delete_project_api_key(
        &self,
        _account_id: &str,
        server: &ComputeServer,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM project_api_keys WHERE server_id = ?1",
            params![server.id],
        )?;
        Ok(())
    }
}

// ─── DNS ────────────────────────────────────────────────────────────────────

#[async_trait]
impl DnsProvider for SqliteBackend {
    async fn make_dns_change(&self, change: &DnsChange) -> Result<()> {
        let conn = self.conn()?;
        if let Some(previous) = &change.previous_name {
            conn.execute(
                "DELETE FROM dns_records WHERE name = ?1 AND server_id = ?2",
                params![previous, change.id],
            )?;
        }
        if let Some(name) = &change.name {
            conn.execute(
                "INSERT INTO dns_records (name, server_id, cloud, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(name) DO UPDATE SET
                    server_id = excluded.server_id,
                    cloud = excluded.cloud,
                    updated_at = excluded.updated_at",
                params![name, change.id, change.cloud.as_str(), Self::now()],
            )?;
        }
        Ok(())
    }
}

// ─── Detailed state ─────────────────────────────────────────────────────────

#[async_trait]
impl DetailedStateReporter for SqliteBackend {
    async fn set_detailed_state(&self, detail: &DetailedState) -> Result<()> {
        let expires_at = detail.timeout.map(|timeout| {
            (chrono::Utc::now() + chrono::Duration::milliseconds(timeout.as_millis() as i64))
                .to_rfc3339()
        });
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO detailed_states (server_id, project_id, name, state, progress, expires_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(server_id, name) DO UPDATE SET
                state = excluded.state,
                progress = excluded.progress,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at",
            params![
                detail.id,
                detail.project_id,
                detail.name,
                detail.state,
                detail.progress,
                expires_at,
                Self::now(),
            ],
        )?;
        Ok(())
    }
}
