//! KIF codec
//!
//! KIF is the verbose kifu form: a `キー：値` header block, a numbered move
//! table after the `手数----指手` marker, `*` comment lines, and
//! `変化：N手` variation blocks re-anchored onto the main line by ply
//! number. Only even games (平手) are supported; handicap boards would
//! need their own initial SFEN table.

use crate::codec::{mainline_node_ids, EmitOptions, Format, FormatCodec, ParseOutcome};
use crate::error::CodecError;
use crate::notation::{kif_move_text, parse_kif_move_text};
use crate::sfen::{parse_usi_move, Square};
use crate::tree::{Game, JsonMap};

pub struct KifCodec;

const MOVE_TABLE_MARKER: &str = "手数----指手";

/// Parse a `変化：N手` marker, returning N
fn parse_variation_marker(line: &str) -> Option<usize> {
    let rest = line.trim().strip_prefix("変化")?;
    let rest = rest.trim_start_matches([':', '：', ' ', '　']);
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() || !rest[digits.len()..].starts_with('手') {
        return None;
    }
    digits.parse().ok()
}

/// Split a move-table line into its body, dropping the leading move number
fn move_line_body(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    let digits = trimmed.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    let rest = trimmed[digits..].trim_start();
    if rest.is_empty() {
        None
    } else {
        Some(rest)
    }
}

/// Destination square of a node's own move, for `同` continuation
fn move_destination(game: &Game, node_id: &str) -> Option<Square> {
    let node = game.node(node_id).ok()?;
    let usi = node.move_usi.as_deref()?;
    parse_usi_move(usi).ok().map(|mv| mv.destination())
}

fn header_meta(lines: &[&str]) -> JsonMap {
    let mut meta = JsonMap::new();
    for line in lines {
        if line.contains(MOVE_TABLE_MARKER) {
            break;
        }
        if let Some((key, value)) = line.split_once('：') {
            let key = key.trim();
            let value = value.trim();
            if !key.is_empty() && !value.is_empty() {
                meta.insert(key.to_string(), serde_json::Value::from(value));
            }
        }
    }
    meta
}

impl FormatCodec for KifCodec {
    fn format(&self) -> Format {
        Format::Kif
    }

    fn detect(&self, text: &str) -> bool {
        text.contains(MOVE_TABLE_MARKER) || text.contains("手合割")
    }

    fn parse(&self, text: &str, title: Option<&str>) -> Result<ParseOutcome, CodecError> {
        let normalized = text.replace('\r', "\n");
        let lines: Vec<&str> = normalized.split('\n').collect();
        let meta = header_meta(&lines);

        if let Some(handicap) = meta.get("手合割").and_then(|v| v.as_str()) {
            if handicap.trim() != "平手" {
                return Err(CodecError::malformed(format!(
                    "unsupported handicap: {}",
                    handicap
                )));
            }
        }

        let fallback_title = ["棋戦", "表題", "タイトル"]
            .iter()
            .find_map(|key| meta.get(*key).and_then(|v| v.as_str()));
        let title = title.or(fallback_title).unwrap_or("Imported KIF");

        let mut game = Game::new(Some(title), None)?;
        game.meta = meta;
        let mut warnings = Vec::new();

        let mut in_moves = false;
        let mut in_variation = false;
        // Skip move lines after a terminal word until the next variation block.
        let mut skipping = false;
        let mut mainline_ids = vec![game.root_node_id.clone()];
        let mut cursor = game.root_node_id.clone();
        let mut prev_to: Option<Square> = None;
        let mut last_node: Option<String> = None;

        for (index, line) in lines.iter().enumerate() {
            let line_no = index + 1;
            let trimmed = line.trim();

            if !in_moves {
                if trimmed.contains(MOVE_TABLE_MARKER) {
                    in_moves = true;
                }
                continue;
            }
            if trimmed.is_empty() {
                continue;
            }

            if let Some(comment) = trimmed.strip_prefix('*') {
                if let Some(node_id) = &last_node {
                    game.append_comment(node_id, comment.trim())?;
                }
                continue;
            }

            if let Some(start_ply) = parse_variation_marker(trimmed) {
                if start_ply < 1 {
                    warnings.push(format!("line {}: ignored variation at ply 0", line_no));
                    skipping = true;
                    continue;
                }
                let base_index = (start_ply - 1).min(mainline_ids.len() - 1);
                cursor = mainline_ids[base_index].clone();
                prev_to = move_destination(&game, &cursor);
                in_variation = true;
                skipping = false;
                last_node = None;
                continue;
            }

            if skipping {
                continue;
            }
            let Some(body) = move_line_body(trimmed) else {
                continue;
            };

            let parsed = parse_kif_move_text(body, prev_to)
                .map_err(|e| CodecError::at_line(line_no, e.to_string()))?;
            let Some((kif_move, destination)) = parsed else {
                // Terminal marker (投了 etc.): the line of play ends here.
                skipping = true;
                continue;
            };
            let usi = kif_move
                .to_usi()
                .map_err(|e| CodecError::at_line(line_no, e.to_string()))?;
            cursor = game
                .play_move(&cursor, &usi)
                .map_err(|e| CodecError::at_line(line_no, e.to_string()))?;
            prev_to = Some(destination);
            if !in_variation {
                mainline_ids.push(cursor.clone());
            }
            last_node = Some(cursor.clone());
        }

        if !in_moves {
            return Err(CodecError::malformed("KIF move table marker not found"));
        }

        // Leave the cursor on the root so a freshly imported game opens at
        // the start position.
        let root = game.root_node_id.clone();
        game.jump(&root)?;
        Ok(ParseOutcome { game, warnings })
    }

    fn emit(&self, game: &Game, _options: &EmitOptions) -> Result<String, CodecError> {
        let mut lines = Vec::new();
        let handicap = game
            .meta
            .get("手合割")
            .and_then(|v| v.as_str())
            .unwrap_or("平手");
        lines.push(format!("手合割：{}", handicap));
        for key in ["先手", "後手", "棋戦"] {
            if let Some(value) = game.meta.get(key).and_then(|v| v.as_str()) {
                lines.push(format!("{}：{}", key, value));
            }
        }
        lines.push(String::new());
        lines.push("手数----指手---------".to_string());

        let mainline = mainline_node_ids(game);
        let mut prev_to: Option<Square> = None;
        for ply in 1..mainline.len() {
            let parent = game.node(&mainline[ply - 1])?;
            let node = game.node(&mainline[ply])?;
            let usi = node.move_usi.as_deref().unwrap_or("");
            let body = kif_move_text(&parent.position_sfen, usi, prev_to)?;
            prev_to = parse_usi_move(usi).ok().map(|mv| mv.destination());
            lines.push(format!("{:>4} {}", ply, body));
            for comment in node.comment.lines() {
                lines.push(format!("*{}", comment));
            }
        }

        // Variation blocks for every non-first child of a mainline node.
        for (ply, parent_id) in mainline.iter().enumerate() {
            let children = game.children_of(parent_id);
            for alt in children.iter().skip(1) {
                lines.push(String::new());
                lines.push(format!("変化：{}手", ply + 1));
                let mut prev_to = move_destination(game, parent_id);
                let mut parent_id = parent_id.clone();
                let mut node_id = alt.node_id.clone();
                let mut move_no = ply + 1;
                loop {
                    let parent = game.node(&parent_id)?;
                    let node = game.node(&node_id)?;
                    let usi = node.move_usi.as_deref().unwrap_or("");
                    let body = kif_move_text(&parent.position_sfen, usi, prev_to)?;
                    prev_to = parse_usi_move(usi).ok().map(|mv| mv.destination());
                    lines.push(format!("{:>4} {}", move_no, body));
                    for comment in node.comment.lines() {
                        lines.push(format!("*{}", comment));
                    }
                    match game.first_child_of(&node_id) {
                        Some(next) => {
                            parent_id = node_id;
                            node_id = next.node_id.clone();
                            move_no += 1;
                        }
                        None => break,
                    }
                }
            }
        }

        let mut out = lines.join("\n");
        out = out.trim_end().to_string();
        out.push('\n');
        Ok(out)
    }
}
