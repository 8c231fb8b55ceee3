//! Persistence for agents, skills and permission grants.

use crate::{lock_err, storage_err};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::sync::{Arc, Mutex};
use taia_types::agent::{Agent, AgentId};
use taia_types::error::TaiaResult;
use taia_types::skill::{Grant, GrantState, Skill, SkillId};

/// Registry store backed by SQLite.
#[derive(Clone)]
pub struct RegistryStore {
    conn: Arc<Mutex<Connection>>,
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn grant_state_str(state: GrantState) -> &'static str {
    match state {
        GrantState::Granted => "granted",
        GrantState::Revoked => "revoked",
        GrantState::NeverGranted => "never_granted",
    }
}

fn parse_grant_state(s: &str) -> GrantState {
    match s {
        "granted" => GrantState::Granted,
        "revoked" => GrantState::Revoked,
        _ => GrantState::NeverGranted,
    }
}

impl RegistryStore {
    /// Create a new registry store wrapping the given connection.
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Insert or update an agent. The token lives in its own column.
    pub fn save_agent(&self, agent: &Agent) -> TaiaResult<()> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let record = serde_json::to_string(agent)?;
        conn.execute(
            "INSERT INTO agents (id, token, record, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET record = ?3, updated_at = ?5",
            rusqlite::params![
                agent.id.as_str(),
                agent.token,
                record,
                agent.created_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    /// Load every persisted agent. Rows that fail to decode are skipped.
    pub fn load_agents(&self) -> TaiaResult<Vec<Agent>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let mut stmt = conn
            .prepare("SELECT id, token, record FROM agents ORDER BY created_at")
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(storage_err)?;

        let mut agents = Vec::new();
        for row in rows {
            let (id, token, record) = row.map_err(storage_err)?;
            match serde_json::from_str::<Agent>(&record) {
                Ok(mut agent) => {
                    agent.token = token;
                    agents.push(agent);
                }
                Err(e) => tracing::warn!(agent = %id, "Skipping agent with bad record: {e}"),
            }
        }
        Ok(agents)
    }

    /// Insert or update a skill definition.
    pub fn save_skill(&self, skill: &Skill) -> TaiaResult<()> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let record = serde_json::to_string(skill)?;
        conn.execute(
            "INSERT INTO skills (id, record, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET record = ?2",
            rusqlite::params![skill.id.as_str(), record, Utc::now().to_rfc3339()],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    /// Load every persisted skill.
    pub fn load_skills(&self) -> TaiaResult<Vec<Skill>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let mut stmt = conn
            .prepare("SELECT id, record FROM skills ORDER BY id")
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(storage_err)?;

        let mut skills = Vec::new();
        for row in rows {
            let (id, record) = row.map_err(storage_err)?;
            match serde_json::from_str::<Skill>(&record) {
                Ok(skill) => skills.push(skill),
                Err(e) => tracing::warn!(skill = %id, "Skipping skill with bad record: {e}"),
            }
        }
        Ok(skills)
    }

    /// Persist one grant fact.
    pub fn save_grant(&self, grant: &Grant) -> TaiaResult<()> {
        let conn = self.conn.lock().map_err(lock_err)?;
        conn.execute(
            "INSERT INTO skill_grants (agent_id, skill_id, state, critical, granted_at, revoked_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(agent_id, skill_id) DO UPDATE SET
                state = ?3, critical = ?4, granted_at = ?5, revoked_at = ?6",
            rusqlite::params![
                grant.agent_id.as_str(),
                grant.skill_id.as_str(),
                grant_state_str(grant.state),
                grant.critical as i64,
                grant.granted_at.to_rfc3339(),
                grant.revoked_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    /// Load all grant facts (granted and revoked).
    pub fn load_grants(&self) -> TaiaResult<Vec<Grant>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let mut stmt = conn
            .prepare(
                "SELECT agent_id, skill_id, state, critical, granted_at, revoked_at
                 FROM skill_grants ORDER BY agent_id, skill_id",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], |row| {
                let agent_id: String = row.get(0)?;
                let skill_id: String = row.get(1)?;
                let state: String = row.get(2)?;
                let critical: i64 = row.get(3)?;
                let granted_at: String = row.get(4)?;
                let revoked_at: Option<String> = row.get(5)?;
                Ok(Grant {
                    agent_id: AgentId(agent_id),
                    skill_id: SkillId(skill_id),
                    state: parse_grant_state(&state),
                    critical: critical != 0,
                    granted_at: parse_time(&granted_at),
                    revoked_at: revoked_at.as_deref().map(parse_time),
                })
            })
            .map_err(storage_err)?;

        let mut grants = Vec::new();
        for row in rows {
            grants.push(row.map_err(storage_err)?);
        }
        Ok(grants)
    }
}
