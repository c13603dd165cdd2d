//! Writers for the mirrored chat-platform tables (channel and team
//! memberships, bots). The host platform owns this data; the store only
//! reads it when computing visibility and participants.

use anyhow::{Context, Result};
use rusqlite::params;
use runbook_core::now_millis;

use crate::SqliteStore;

impl SqliteStore {
    pub fn add_channel_member(&self, channel_id: &str, user_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO channel_members(channel_id, user_id) VALUES (?1, ?2)",
            params![channel_id, user_id.to_lowercase()],
        )
        .with_context(|| format!("failed to add '{user_id}' to channel '{channel_id}'"))?;
        Ok(())
    }

    pub fn remove_channel_member(&self, channel_id: &str, user_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM channel_members WHERE channel_id = ?1 AND user_id = ?2",
            params![channel_id, user_id.to_lowercase()],
        )
        .with_context(|| format!("failed to remove '{user_id}' from channel '{channel_id}'"))?;
        Ok(())
    }

    pub fn add_team_member(&self, team_id: &str, user_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO team_members(team_id, user_id, delete_at) VALUES (?1, ?2, 0)
             ON CONFLICT(team_id, user_id) DO UPDATE SET delete_at = 0",
            params![team_id, user_id.to_lowercase()],
        )
        .with_context(|| format!("failed to add '{user_id}' to team '{team_id}'"))?;
        Ok(())
    }

    /// Marks the membership as left; the row is kept.
    pub fn remove_team_member(&self, team_id: &str, user_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE team_members SET delete_at = ?1 WHERE team_id = ?2 AND user_id = ?3",
            params![now_millis(), team_id, user_id.to_lowercase()],
        )
        .with_context(|| format!("failed to remove '{user_id}' from team '{team_id}'"))?;
        Ok(())
    }

    pub fn register_bot(&self, user_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO bots(user_id) VALUES (?1)",
            params![user_id.to_lowercase()],
        )
        .with_context(|| format!("failed to register bot '{user_id}'"))?;
        Ok(())
    }
}
