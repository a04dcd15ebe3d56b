//! Branching game tree
//!
//! The tree is the authoritative in-memory model: nodes own their parent id
//! (never a live reference) and children are recovered by scanning, so
//! persistence stays a flat row dump. Every node caches the SFEN of its
//! position; the cache is regenerable by replaying `move_usi` down from the
//! root.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{SfenError, TreeError};
use crate::notation;
use crate::sfen::{apply_usi_move, normalize_sfen};

pub type JsonMap = serde_json::Map<String, serde_json::Value>;

pub fn utc_now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// One position in a game's variation tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub game_id: String,
    pub parent_id: Option<String>,
    pub order_index: u32,
    pub move_usi: Option<String>,
    pub label: String,
    pub comment: String,
    pub position_sfen: String,
    pub created_at: String,
}

/// A game and its full variation tree
#[derive(Debug, Clone)]
pub struct Game {
    pub game_id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
    pub initial_sfen: String,
    pub root_node_id: String,
    pub current_node_id: String,
    pub meta: JsonMap,
    pub ui_state: JsonMap,
    nodes: HashMap<String, Node>,
}

impl Game {
    pub fn new(title: Option<&str>, initial_sfen: Option<&str>) -> Result<Self, SfenError> {
        let game_id = new_id();
        let now = utc_now_iso();
        let initial = normalize_sfen(initial_sfen.unwrap_or(""))?;
        let root_node_id = new_id();
        let root = Node {
            node_id: root_node_id.clone(),
            game_id: game_id.clone(),
            parent_id: None,
            order_index: 0,
            move_usi: None,
            label: "開始局面".to_string(),
            comment: String::new(),
            position_sfen: initial.clone(),
            created_at: now.clone(),
        };
        let title = title.map(str::trim).filter(|t| !t.is_empty()).unwrap_or("Untitled game");
        let mut nodes = HashMap::new();
        nodes.insert(root_node_id.clone(), root);
        Ok(Self {
            game_id,
            title: title.to_string(),
            created_at: now.clone(),
            updated_at: now,
            initial_sfen: initial,
            root_node_id: root_node_id.clone(),
            current_node_id: root_node_id,
            meta: JsonMap::new(),
            ui_state: JsonMap::new(),
            nodes,
        })
    }

    /// Reassemble a game from persisted rows. The root must be present; a
    /// dangling cursor falls back to the root.
    pub fn from_rows(
        game_id: String,
        title: String,
        created_at: String,
        updated_at: String,
        initial_sfen: String,
        root_node_id: String,
        current_node_id: String,
        meta: JsonMap,
        ui_state: JsonMap,
        node_rows: Vec<Node>,
    ) -> Result<Self, TreeError> {
        let mut nodes = HashMap::with_capacity(node_rows.len());
        for node in node_rows {
            nodes.insert(node.node_id.clone(), node);
        }
        if !nodes.contains_key(&root_node_id) {
            return Err(TreeError::UnknownNode(root_node_id));
        }
        let current_node_id = if nodes.contains_key(&current_node_id) {
            current_node_id
        } else {
            root_node_id.clone()
        };
        Ok(Self {
            game_id,
            title,
            created_at,
            updated_at,
            initial_sfen,
            root_node_id,
            current_node_id,
            meta,
            ui_state,
            nodes,
        })
    }

    pub fn touch(&mut self) {
        self.updated_at = utc_now_iso();
    }

    pub fn node(&self, node_id: &str) -> Result<&Node, TreeError> {
        self.nodes
            .get(node_id)
            .ok_or_else(|| TreeError::UnknownNode(node_id.to_string()))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Children of a node, ordered by (order_index, created_at, id)
    pub fn children_of(&self, parent_id: &str) -> Vec<&Node> {
        let mut out: Vec<&Node> = self
            .nodes
            .values()
            .filter(|n| n.parent_id.as_deref() == Some(parent_id))
            .collect();
        out.sort_by(|a, b| {
            (a.order_index, &a.created_at, &a.node_id).cmp(&(b.order_index, &b.created_at, &b.node_id))
        });
        out
    }

    pub fn parent_of(&self, node_id: &str) -> Result<Option<&Node>, TreeError> {
        let node = self.node(node_id)?;
        match &node.parent_id {
            Some(pid) => Ok(Some(self.node(pid)?)),
            None => Ok(None),
        }
    }

    pub fn first_child_of(&self, node_id: &str) -> Option<&Node> {
        self.children_of(node_id).into_iter().next()
    }

    /// Set the cursor
    pub fn jump(&mut self, node_id: &str) -> Result<(), TreeError> {
        self.node(node_id)?;
        self.current_node_id = node_id.to_string();
        self.touch();
        Ok(())
    }

    /// Play a move from a node, reusing an existing child when the same move
    /// is already on the board. Returns the (existing or new) child id and
    /// moves the cursor there.
    pub fn play_move(&mut self, from_node_id: &str, move_usi: &str) -> Result<String, TreeError> {
        let trimmed = move_usi.trim();
        let normalized = trimmed.to_lowercase();
        let parent = self.node(from_node_id)?.clone();

        for child in self.children_of(from_node_id) {
            let existing = child.move_usi.as_deref().unwrap_or("").trim().to_lowercase();
            if existing == normalized {
                let child_id = child.node_id.clone();
                self.current_node_id = child_id.clone();
                self.touch();
                return Ok(child_id);
            }
        }

        let position_sfen = apply_usi_move(&parent.position_sfen, trimmed)?;
        let label = notation::kif2_label(&parent.position_sfen, trimmed, None)
            .unwrap_or_else(|_| trimmed.to_string());
        let order_index = self.children_of(from_node_id).len() as u32;
        let node = Node {
            node_id: new_id(),
            game_id: self.game_id.clone(),
            parent_id: Some(parent.node_id.clone()),
            order_index,
            move_usi: Some(trimmed.to_string()),
            label,
            comment: String::new(),
            position_sfen,
            created_at: utc_now_iso(),
        };
        let node_id = node.node_id.clone();
        self.nodes.insert(node_id.clone(), node);
        self.current_node_id = node_id.clone();
        self.touch();
        Ok(node_id)
    }

    pub fn set_comment(&mut self, node_id: &str, comment: &str) -> Result<(), TreeError> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| TreeError::UnknownNode(node_id.to_string()))?;
        node.comment = comment.to_string();
        self.touch();
        Ok(())
    }

    /// Append to a node's comment, newline-separated (used by KIF import)
    pub fn append_comment(&mut self, node_id: &str, line: &str) -> Result<(), TreeError> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| TreeError::UnknownNode(node_id.to_string()))?;
        if node.comment.is_empty() {
            node.comment = line.to_string();
        } else {
            node.comment.push('\n');
            node.comment.push_str(line);
        }
        Ok(())
    }

    /// Rewrite sibling order. `ordered_child_ids` must be a permutation of
    /// the node's current children; the whole call is all-or-nothing and
    /// never touches the cursor.
    pub fn reorder_children(
        &mut self,
        parent_id: &str,
        ordered_child_ids: &[String],
    ) -> Result<(), TreeError> {
        self.node(parent_id)?;
        let current: HashSet<String> = self
            .children_of(parent_id)
            .iter()
            .map(|n| n.node_id.clone())
            .collect();
        let proposed: HashSet<String> = ordered_child_ids.iter().cloned().collect();
        if current != proposed || proposed.len() != ordered_child_ids.len() {
            return Err(TreeError::BadPermutation(format!(
                "expected a permutation of {} children of {}",
                current.len(),
                parent_id
            )));
        }
        for (index, child_id) in ordered_child_ids.iter().enumerate() {
            if let Some(node) = self.nodes.get_mut(child_id) {
                node.order_index = index as u32;
            }
        }
        self.touch();
        Ok(())
    }

    /// Root-to-node chain. Detects corrupted parent links (cycles).
    pub fn path_to(&self, node_id: &str) -> Result<Vec<&Node>, TreeError> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = Some(node_id.to_string());
        while let Some(id) = cursor {
            if !seen.insert(id.clone()) {
                return Err(TreeError::CycleDetected(id));
            }
            let node = self.node(&id)?;
            chain.push(node);
            cursor = node.parent_id.clone();
        }
        chain.reverse();
        Ok(chain)
    }

    /// USI moves along the root -> current path
    pub fn current_path_moves(&self) -> Vec<String> {
        self.path_to(&self.current_node_id)
            .map(|path| path.iter().filter_map(|n| n.move_usi.clone()).collect())
            .unwrap_or_default()
    }

    pub fn current_position_sfen(&self) -> String {
        self.node(&self.current_node_id)
            .map(|n| n.position_sfen.clone())
            .unwrap_or_else(|_| self.initial_sfen.clone())
    }

    /// All nodes, root first, then grouped by parent in sibling order — the
    /// ordering used for both persistence and the wire.
    pub fn nodes_sorted(&self) -> Vec<&Node> {
        let mut out: Vec<&Node> = self.nodes.values().collect();
        out.sort_by(|a, b| {
            let ka = (
                a.parent_id.is_some(),
                a.parent_id.clone().unwrap_or_default(),
                a.order_index,
                a.created_at.clone(),
                a.node_id.clone(),
            );
            let kb = (
                b.parent_id.is_some(),
                b.parent_id.clone().unwrap_or_default(),
                b.order_index,
                b.created_at.clone(),
                b.node_id.clone(),
            );
            ka.cmp(&kb)
        });
        out
    }

    /// Full state snapshot for clients
    pub fn to_wire(&self) -> GameWire {
        let mut children_index: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for node in self.nodes.values() {
            if let Some(parent_id) = &node.parent_id {
                children_index.entry(parent_id.clone()).or_default().push(node.node_id.clone());
            }
        }
        for (parent_id, child_ids) in children_index.iter_mut() {
            let parent_id = parent_id.clone();
            child_ids.sort_by_key(|cid| {
                self.nodes
                    .get(cid)
                    .map(|n| (n.order_index, n.created_at.clone(), n.node_id.clone()))
                    .unwrap_or((u32::MAX, String::new(), parent_id.clone()))
            });
        }
        let current_path_node_ids = self
            .path_to(&self.current_node_id)
            .map(|path| path.iter().map(|n| n.node_id.clone()).collect())
            .unwrap_or_default();

        GameWire {
            game_id: self.game_id.clone(),
            title: self.title.clone(),
            created_at: self.created_at.clone(),
            updated_at: self.updated_at.clone(),
            initial_sfen: self.initial_sfen.clone(),
            root_node_id: self.root_node_id.clone(),
            current_node_id: self.current_node_id.clone(),
            current_position_sfen: self.current_position_sfen(),
            meta: self.meta.clone(),
            ui_state: self.ui_state.clone(),
            nodes: self.nodes_sorted().into_iter().cloned().collect(),
            children_index,
            current_path_node_ids,
            current_path_moves: self.current_path_moves(),
        }
    }

    // ---- ui_state helpers -------------------------------------------------

    pub fn analysis_enabled(&self) -> bool {
        self.ui_state
            .get("analysis_enabled")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn set_analysis_enabled(&mut self, enabled: bool) {
        self.ui_state
            .insert("analysis_enabled".to_string(), serde_json::Value::Bool(enabled));
        self.touch();
    }

    /// MultiPV from ui_state, clamped to the supported 1..=5 range
    pub fn analysis_multipv(&self) -> u8 {
        self.ui_state
            .get("analysis_multipv")
            .and_then(|v| v.as_u64())
            .map(|v| v.clamp(1, 5) as u8)
            .unwrap_or(1)
    }

    pub fn set_analysis_multipv(&mut self, multipv: u8) {
        self.ui_state.insert(
            "analysis_multipv".to_string(),
            serde_json::Value::from(multipv.clamp(1, 5)),
        );
        self.touch();
    }
}

/// Wire form of the full game state (`session:granted` / `game:state`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameWire {
    pub game_id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
    pub initial_sfen: String,
    pub root_node_id: String,
    pub current_node_id: String,
    pub current_position_sfen: String,
    pub meta: JsonMap,
    pub ui_state: JsonMap,
    pub nodes: Vec<Node>,
    pub children_index: BTreeMap<String, Vec<String>>,
    pub current_path_node_ids: Vec<String>,
    pub current_path_moves: Vec<String>,
}
