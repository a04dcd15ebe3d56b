//! SQLite-backed persistence
//!
//! Durable storage for games, nodes, analysis snapshots and app state.
//! Games are persisted whole (game row plus a full node rewrite) in one
//! transaction; targeted helpers exist for single-node upserts and sibling
//! reorders. The connection is shared behind a mutex — the synchronizer is
//! the only writer, the HTTP read path only reads.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

use kifulab_core::tree::{Game, JsonMap, Node};

use crate::supervisor::PvLine;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS games (
  game_id TEXT PRIMARY KEY,
  title TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  initial_sfen TEXT NOT NULL,
  root_node_id TEXT NOT NULL,
  current_node_id TEXT NOT NULL,
  meta_json TEXT NOT NULL DEFAULT '{}',
  ui_state_json TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS nodes (
  node_id TEXT PRIMARY KEY,
  game_id TEXT NOT NULL,
  parent_id TEXT NULL,
  order_index INTEGER NOT NULL,
  move_usi TEXT NULL,
  label TEXT NOT NULL,
  comment TEXT NOT NULL DEFAULT '',
  position_sfen TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (game_id) REFERENCES games(game_id),
  UNIQUE (parent_id, order_index)
);

CREATE INDEX IF NOT EXISTS idx_nodes_game_parent_order
  ON nodes(game_id, parent_id, order_index);

CREATE TABLE IF NOT EXISTS analysis_snapshots (
  snapshot_id TEXT PRIMARY KEY,
  node_id TEXT NOT NULL,
  elapsed_ms INTEGER NOT NULL DEFAULT 0,
  multipv INTEGER NOT NULL DEFAULT 1,
  lines_json TEXT NOT NULL DEFAULT '[]',
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_snapshots_node
  ON analysis_snapshots(node_id, created_at);

CREATE TABLE IF NOT EXISTS app_state (
  k TEXT PRIMARY KEY,
  v TEXT NOT NULL
);
"#;

/// Row shape for game listings
#[derive(Debug, Clone, Serialize)]
pub struct GameSummary {
    pub game_id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
    pub initial_sfen: String,
    pub current_node_id: String,
}

/// Shared SQLite store
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

fn loads_map(text: Option<String>) -> JsonMap {
    text.and_then(|t| serde_json::from_str::<serde_json::Value>(&t).ok())
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default()
}

fn dumps_map(map: &JsonMap) -> String {
    serde_json::Value::Object(map.clone()).to_string()
}

impl SqliteStore {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create data dir {}", parent.display()))?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory database (used by tests)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialize database schema")?;
        Ok(())
    }

    /// Persist a game and its full node set in one transaction
    pub fn put_game(&self, game: &Game) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO games (
              game_id, title, created_at, updated_at, initial_sfen,
              root_node_id, current_node_id, meta_json, ui_state_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(game_id) DO UPDATE SET
              title=excluded.title,
              updated_at=excluded.updated_at,
              initial_sfen=excluded.initial_sfen,
              root_node_id=excluded.root_node_id,
              current_node_id=excluded.current_node_id,
              meta_json=excluded.meta_json,
              ui_state_json=excluded.ui_state_json
            "#,
            params![
                game.game_id,
                game.title,
                game.created_at,
                game.updated_at,
                game.initial_sfen,
                game.root_node_id,
                game.current_node_id,
                dumps_map(&game.meta),
                dumps_map(&game.ui_state),
            ],
        )?;
        tx.execute("DELETE FROM nodes WHERE game_id = ?1", params![game.game_id])?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO nodes (
                  node_id, game_id, parent_id, order_index, move_usi, label,
                  comment, position_sfen, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
            )?;
            for node in game.nodes_sorted() {
                stmt.execute(params![
                    node.node_id,
                    node.game_id,
                    node.parent_id,
                    node.order_index,
                    node.move_usi,
                    node.label,
                    node.comment,
                    node.position_sfen,
                    node.created_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Load a game and its full tree
    pub fn get_game_with_tree(&self, game_id: &str) -> Result<Option<Game>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                r#"
                SELECT game_id, title, created_at, updated_at, initial_sfen,
                       root_node_id, current_node_id, meta_json, ui_state_json
                FROM games WHERE game_id = ?1
                "#,
                params![game_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, Option<String>>(8)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, title, created_at, updated_at, initial_sfen, root_id, current_id, meta, ui)) =
            row
        else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            r#"
            SELECT node_id, game_id, parent_id, order_index, move_usi, label,
                   comment, position_sfen, created_at
            FROM nodes
            WHERE game_id = ?1
            ORDER BY CASE WHEN parent_id IS NULL THEN 0 ELSE 1 END,
                     parent_id, order_index, created_at, node_id
            "#,
        )?;
        let nodes: Vec<Node> = stmt
            .query_map(params![game_id], |row| {
                Ok(Node {
                    node_id: row.get(0)?,
                    game_id: row.get(1)?,
                    parent_id: row.get(2)?,
                    order_index: row.get(3)?,
                    move_usi: row.get(4)?,
                    label: row.get(5)?,
                    comment: row.get(6)?,
                    position_sfen: row.get(7)?,
                    created_at: row.get(8)?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);
        drop(conn);

        let game = Game::from_rows(
            id,
            title,
            created_at,
            updated_at,
            initial_sfen,
            root_id,
            current_id,
            loads_map(meta),
            loads_map(ui),
            nodes,
        )
        .with_context(|| format!("corrupt tree for game {}", game_id))?;
        Ok(Some(game))
    }

    /// Newest-first page of games plus the total count
    pub fn list_games(&self, limit: u32, offset: u32) -> Result<(Vec<GameSummary>, u64)> {
        let conn = self.conn.lock().unwrap();
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM games", [], |row| row.get(0))?;
        let mut stmt = conn.prepare(
            r#"
            SELECT game_id, title, created_at, updated_at, initial_sfen, current_node_id
            FROM games
            ORDER BY updated_at DESC, created_at DESC
            LIMIT ?1 OFFSET ?2
            "#,
        )?;
        let items: Vec<GameSummary> = stmt
            .query_map(params![limit, offset], |row| {
                Ok(GameSummary {
                    game_id: row.get(0)?,
                    title: row.get(1)?,
                    created_at: row.get(2)?,
                    updated_at: row.get(3)?,
                    initial_sfen: row.get(4)?,
                    current_node_id: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok((items, total as u64))
    }

    pub fn delete_game(&self, game_id: &str) -> Result<bool> {
        let deleted = {
            let mut conn = self.conn.lock().unwrap();
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM nodes WHERE game_id = ?1", params![game_id])?;
            let deleted = tx.execute("DELETE FROM games WHERE game_id = ?1", params![game_id])?;
            tx.commit()?;
            deleted > 0
        };
        if deleted && self.last_game_id()?.as_deref() == Some(game_id) {
            self.set_last_game_id(None)?;
        }
        Ok(deleted)
    }

    /// Update only the games row (title, cursor, meta, ui_state). Used by
    /// mutations whose node set is unchanged or persisted separately.
    pub fn update_game_row(&self, game: &Game) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            UPDATE games SET
              title = ?2,
              updated_at = ?3,
              current_node_id = ?4,
              meta_json = ?5,
              ui_state_json = ?6
            WHERE game_id = ?1
            "#,
            params![
                game.game_id,
                game.title,
                game.updated_at,
                game.current_node_id,
                dumps_map(&game.meta),
                dumps_map(&game.ui_state),
            ],
        )?;
        Ok(())
    }

    /// Insert or update a single node
    pub fn upsert_node(&self, node: &Node) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO nodes (
              node_id, game_id, parent_id, order_index, move_usi, label,
              comment, position_sfen, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(node_id) DO UPDATE SET
              parent_id=excluded.parent_id,
              order_index=excluded.order_index,
              move_usi=excluded.move_usi,
              label=excluded.label,
              comment=excluded.comment,
              position_sfen=excluded.position_sfen
            "#,
            params![
                node.node_id,
                node.game_id,
                node.parent_id,
                node.order_index,
                node.move_usi,
                node.label,
                node.comment,
                node.position_sfen,
                node.created_at,
            ],
        )?;
        Ok(())
    }

    /// Atomically rewrite sibling order for one parent. Two-phase update so
    /// the UNIQUE(parent_id, order_index) constraint never trips mid-flight.
    pub fn rewrite_children_order(&self, parent_id: &str, ordered_ids: &[String]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for (index, node_id) in ordered_ids.iter().enumerate() {
            let changed = tx.execute(
                "UPDATE nodes SET order_index = ?1 WHERE node_id = ?2 AND parent_id = ?3",
                params![-(index as i64) - 1, node_id, parent_id],
            )?;
            if changed != 1 {
                anyhow::bail!("node {} is not a child of {}", node_id, parent_id);
            }
        }
        tx.execute(
            "UPDATE nodes SET order_index = -order_index - 1 WHERE parent_id = ?1 AND order_index < 0",
            params![parent_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Append one analysis snapshot, returning its id
    pub fn append_snapshot(
        &self,
        node_id: &str,
        elapsed_ms: u64,
        multipv: u8,
        lines: &[PvLine],
    ) -> Result<String> {
        let snapshot_id = Uuid::new_v4().to_string();
        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO analysis_snapshots (
              snapshot_id, node_id, elapsed_ms, multipv, lines_json, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                snapshot_id,
                node_id,
                elapsed_ms as i64,
                multipv as i64,
                serde_json::to_string(lines)?,
                created_at,
            ],
        )?;
        Ok(snapshot_id)
    }

    /// Count of snapshots stored for a node (diagnostics / tests)
    pub fn snapshot_count(&self, node_id: &str) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM analysis_snapshots WHERE node_id = ?1",
            params![node_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn put_app_state(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO app_state (k, v) VALUES (?1, ?2)
            ON CONFLICT(k) DO UPDATE SET v = excluded.v
            "#,
            params![key, value.to_string()],
        )?;
        Ok(())
    }

    pub fn get_app_state(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row("SELECT v FROM app_state WHERE k = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(raw.and_then(|t| serde_json::from_str(&t).ok()))
    }

    pub fn last_game_id(&self) -> Result<Option<String>> {
        Ok(self
            .get_app_state("current_game_id")?
            .and_then(|v| v.as_str().map(String::from))
            .filter(|s| !s.is_empty()))
    }

    pub fn set_last_game_id(&self, game_id: Option<&str>) -> Result<()> {
        let value = match game_id {
            Some(id) => serde_json::Value::from(id),
            None => serde_json::Value::Null,
        };
        self.put_app_state("current_game_id", &value)
    }
}
