use std::fs;
use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, TransactionBehavior};
use tracing::{debug, info};

use haxen_common::{
    AgentDIDRecord, AgentDIDStatus, AgentSummary, ComponentDIDRecord, ComponentType,
    HaxenServerIdentity, LocalStorageConfig, PublicKeyJwk,
};

use crate::{ComponentDIDRequest, StorageError, StorageProvider, StorageResult};

fn migrations() -> Vec<&'static str> {
    vec![
        "CREATE TABLE IF NOT EXISTS haxen_server_dids (
            haxen_server_id TEXT PRIMARY KEY,
            root_did TEXT NOT NULL,
            seed_ref TEXT NOT NULL,
            created_at TEXT NOT NULL,
            last_key_rotation TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS agent_dids (
            did TEXT PRIMARY KEY,
            agent_node_id TEXT NOT NULL,
            haxen_server_id TEXT NOT NULL,
            public_key_jwk TEXT NOT NULL,
            derivation_index INTEGER NOT NULL,
            status TEXT NOT NULL,
            UNIQUE (haxen_server_id, agent_node_id),
            FOREIGN KEY (haxen_server_id) REFERENCES haxen_server_dids(haxen_server_id)
        )",
        "CREATE TABLE IF NOT EXISTS component_dids (
            did TEXT PRIMARY KEY,
            agent_did TEXT NOT NULL,
            component_type TEXT NOT NULL,
            component_name TEXT NOT NULL,
            public_key_jwk TEXT NOT NULL,
            derivation_index INTEGER NOT NULL,
            FOREIGN KEY (agent_did) REFERENCES agent_dids(did) ON DELETE CASCADE
        )",
        "CREATE TABLE IF NOT EXISTS derivation_counters (
            haxen_server_id TEXT PRIMARY KEY,
            next_index INTEGER NOT NULL
        )",
    ]
}

/// SQLite-backed storage provider.
pub struct LocalStorage {
    conn: Mutex<Connection>,
}

impl LocalStorage {
    /// Open (or create) the database at the configured path and apply the
    /// schema migrations.
    pub fn open(config: &LocalStorageConfig) -> StorageResult<Self> {
        if let Some(parent) = config.database_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| StorageError::Database(format!("creating database directory: {}", e)))?;
        }
        let conn = Connection::open(&config.database_path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        for migration in migrations() {
            conn.execute(migration, [])?;
        }
        info!(path = %config.database_path.display(), "opened DID database");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// An in-memory database, for tests and throwaway tooling.
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        for migration in migrations() {
            conn.execute(migration, [])?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn parse_timestamp(raw: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::Serialization(format!("invalid timestamp {:?}: {}", raw, e)))
}

fn parse_jwk(raw: &str) -> StorageResult<PublicKeyJwk> {
    Ok(serde_json::from_str(raw)?)
}

fn parse_status(raw: &str) -> StorageResult<AgentDIDStatus> {
    AgentDIDStatus::from_str(raw).map_err(StorageError::Serialization)
}

fn parse_component_type(raw: &str) -> StorageResult<ComponentType> {
    ComponentType::from_str(raw).map_err(StorageError::Serialization)
}

#[async_trait]
impl StorageProvider for LocalStorage {
    async fn store_haxen_server_did(&self, identity: &HaxenServerIdentity) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO haxen_server_dids
             (haxen_server_id, root_did, seed_ref, created_at, last_key_rotation)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                identity.haxen_server_id,
                identity.root_did,
                identity.seed_ref,
                identity.created_at.to_rfc3339(),
                identity.last_key_rotation.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn load_haxen_server_dids(&self) -> StorageResult<Vec<HaxenServerIdentity>> {
        let rows: Vec<(String, String, String, String, String)> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT haxen_server_id, root_did, seed_ref, created_at, last_key_rotation
                 FROM haxen_server_dids
                 ORDER BY haxen_server_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        rows.into_iter()
            .map(|(haxen_server_id, root_did, seed_ref, created_at, last_key_rotation)| {
                Ok(HaxenServerIdentity {
                    haxen_server_id,
                    root_did,
                    seed_ref,
                    created_at: parse_timestamp(&created_at)?,
                    last_key_rotation: parse_timestamp(&last_key_rotation)?,
                })
            })
            .collect()
    }

    async fn store_agent_did_with_components(
        &self,
        agent_node_id: &str,
        agent_did: &str,
        haxen_server_id: &str,
        public_key_jwk: &PublicKeyJwk,
        derivation_index: u64,
        status: AgentDIDStatus,
        components: &[ComponentDIDRequest],
    ) -> StorageResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO agent_dids
             (did, agent_node_id, haxen_server_id, public_key_jwk, derivation_index, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                agent_did,
                agent_node_id,
                haxen_server_id,
                serde_json::to_string(public_key_jwk)?,
                derivation_index as i64,
                status.as_str(),
            ],
        )?;

        for component in components {
            tx.execute(
                "INSERT INTO component_dids
                 (did, agent_did, component_type, component_name, public_key_jwk, derivation_index)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    component.component_did,
                    agent_did,
                    component.component_type.as_str(),
                    component.component_name,
                    serde_json::to_string(&component.public_key_jwk)?,
                    component.derivation_index as i64,
                ],
            )?;
        }

        tx.commit()
            .map_err(|e| StorageError::TransactionFailed(e.to_string()))?;
        debug!(
            agent_node_id,
            haxen_server_id,
            components = components.len(),
            "persisted agent DID set"
        );
        Ok(())
    }

    async fn load_agent_dids(&self, haxen_server_id: &str) -> StorageResult<Vec<AgentDIDRecord>> {
        let (agent_rows, component_rows) = {
            let conn = self.conn.lock().unwrap();

            let mut stmt = conn.prepare(
                "SELECT did, agent_node_id, public_key_jwk, derivation_index, status
                 FROM agent_dids
                 WHERE haxen_server_id = ?1
                 ORDER BY derivation_index",
            )?;
            let agent_rows: Vec<(String, String, String, i64, String)> = stmt
                .query_map([haxen_server_id], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut stmt = conn.prepare(
                "SELECT c.did, c.agent_did, c.component_type, c.component_name,
                        c.public_key_jwk, c.derivation_index
                 FROM component_dids c
                 JOIN agent_dids a ON a.did = c.agent_did
                 WHERE a.haxen_server_id = ?1
                 ORDER BY c.derivation_index",
            )?;
            let component_rows: Vec<(String, String, String, String, String, i64)> = stmt
                .query_map([haxen_server_id], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            (agent_rows, component_rows)
        };

        let mut agents = Vec::with_capacity(agent_rows.len());
        for (did, agent_node_id, jwk, derivation_index, status) in agent_rows {
            let components = component_rows
                .iter()
                .filter(|(_, agent_did, ..)| *agent_did == did)
                .map(|(cdid, _, ctype, cname, cjwk, cindex)| {
                    Ok(ComponentDIDRecord {
                        did: cdid.clone(),
                        component_type: parse_component_type(ctype)?,
                        component_name: cname.clone(),
                        public_key_jwk: parse_jwk(cjwk)?,
                        derivation_index: *cindex as u64,
                    })
                })
                .collect::<StorageResult<Vec<_>>>()?;

            agents.push(AgentDIDRecord {
                agent_node_id,
                did,
                haxen_server_id: haxen_server_id.to_string(),
                public_key_jwk: parse_jwk(&jwk)?,
                derivation_index: derivation_index as u64,
                status: parse_status(&status)?,
                components,
            });
        }
        Ok(agents)
    }

    async fn list_agent_dids(&self) -> StorageResult<Vec<AgentSummary>> {
        let rows: Vec<(String, String, String, String, i64)> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT a.agent_node_id, a.did, a.haxen_server_id, a.status,
                        (SELECT COUNT(*) FROM component_dids c WHERE c.agent_did = a.did)
                 FROM agent_dids a
                 ORDER BY a.haxen_server_id, a.derivation_index",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        rows.into_iter()
            .map(|(agent_node_id, did, haxen_server_id, status, component_count)| {
                Ok(AgentSummary {
                    agent_node_id,
                    did,
                    haxen_server_id,
                    status: parse_status(&status)?,
                    component_count: component_count as usize,
                })
            })
            .collect()
    }

    async fn update_agent_did_status(
        &self,
        haxen_server_id: &str,
        agent_node_id: &str,
        status: AgentDIDStatus,
    ) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE agent_dids SET status = ?1
             WHERE haxen_server_id = ?2 AND agent_node_id = ?3",
            params![status.as_str(), haxen_server_id, agent_node_id],
        )?;
        if updated == 0 {
            return Err(StorageError::NotFound(format!(
                "agent {} on haxen server {}",
                agent_node_id, haxen_server_id
            )));
        }
        Ok(())
    }

    async fn allocate_derivation_indices(
        &self,
        haxen_server_id: &str,
        count: u64,
    ) -> StorageResult<u64> {
        let mut conn = self.conn.lock().unwrap();
        // Immediate transaction: the counter read and bump must not interleave
        // with another allocator on a shared database file.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT OR IGNORE INTO derivation_counters (haxen_server_id, next_index) VALUES (?1, 0)",
            [haxen_server_id],
        )?;
        let first: i64 = tx.query_row(
            "SELECT next_index FROM derivation_counters WHERE haxen_server_id = ?1",
            [haxen_server_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "UPDATE derivation_counters SET next_index = ?1 WHERE haxen_server_id = ?2",
            params![first + count as i64, haxen_server_id],
        )?;
        tx.commit()
            .map_err(|e| StorageError::TransactionFailed(e.to_string()))?;

        Ok(first as u64)
    }
}
