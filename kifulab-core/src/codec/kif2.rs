//! KIF2 (KI2) codec
//!
//! KI2 is the terse side-marked form: `▲７六歩△３四歩…` with optional
//! `変化：N手` variation blocks. Tokens carry the piece name but not the
//! origin square, so parsing resolves origins against the board through the
//! candidate generator and the record's disambiguation marks.

use crate::codec::{mainline_node_ids, EmitOptions, Format, FormatCodec, ParseOutcome};
use crate::error::CodecError;
use crate::movegen::{candidates, filter_disambiguation};
use crate::notation::{kif2_label, parse_ki2_token};
use crate::sfen::{parse_sfen, parse_usi_move, Square};
use crate::tree::Game;

pub struct Kif2Codec;

/// Tokens start at a side mark and run until the next one.
fn tokenize_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in line.chars() {
        if ch == '▲' || ch == '△' {
            if !current.trim().is_empty() {
                tokens.push(current.trim().to_string());
            }
            current = String::new();
            current.push(ch);
        } else if !current.is_empty() {
            current.push(ch);
        }
    }
    if !current.trim().is_empty() {
        tokens.push(current.trim().to_string());
    }
    tokens
}

fn parse_variation_marker(line: &str) -> Option<usize> {
    let rest = line.trim().strip_prefix("変化")?;
    let rest = rest.trim_start_matches([':', '：', ' ', '　']);
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() || !rest[digits.len()..].starts_with('手') {
        return None;
    }
    digits.parse().ok()
}

fn move_destination(game: &Game, node_id: &str) -> Option<Square> {
    let node = game.node(node_id).ok()?;
    let usi = node.move_usi.as_deref()?;
    parse_usi_move(usi).ok().map(|mv| mv.destination())
}

/// Resolve one KI2 token against the current position into a USI move
fn resolve_token(
    game: &Game,
    cursor: &str,
    token: &str,
    prev_to: Option<Square>,
) -> Result<Option<(String, Square)>, CodecError> {
    let parsed = parse_ki2_token(token, prev_to)?;
    let Some((mv, destination)) = parsed else {
        return Ok(None);
    };

    let sfen = &game.node(cursor)?.position_sfen;
    let position = parse_sfen(sfen)?;
    // If the record's side mark disagrees with the position, the position
    // wins (some records repeat the mark sloppily after a 変化 anchor).
    let side = position.side;

    let usi = if mv.is_drop {
        format!("{}*{}", mv.piece.letter(), mv.to.to_usi())
    } else {
        let found = candidates(&position, side, mv.piece, mv.promoted, mv.to);
        let found = filter_disambiguation(side, mv.to, found, &mv.disambig);
        match found.as_slice() {
            [from] => format!(
                "{}{}{}",
                from.to_usi(),
                mv.to.to_usi(),
                if mv.promote { "+" } else { "" }
            ),
            [] => {
                return Err(CodecError::malformed(format!(
                    "no piece can make KI2 move '{}'",
                    token
                )))
            }
            many => {
                return Err(CodecError::malformed(format!(
                    "ambiguous KI2 move '{}': {} candidates",
                    token,
                    many.len()
                )))
            }
        }
    };
    Ok(Some((usi, destination)))
}

impl FormatCodec for Kif2Codec {
    fn format(&self) -> Format {
        Format::Kif2
    }

    fn detect(&self, text: &str) -> bool {
        text.contains('▲') || text.contains('△')
    }

    fn parse(&self, text: &str, title: Option<&str>) -> Result<ParseOutcome, CodecError> {
        let normalized = text.replace('\r', "\n");
        let mut game = Game::new(title.or(Some("Imported KI2")), None)?;
        let mut warnings = Vec::new();

        let mut mainline_ids = vec![game.root_node_id.clone()];
        let mut cursor = game.root_node_id.clone();
        let mut prev_to: Option<Square> = None;
        let mut in_variation = false;
        let mut skipping = false;

        for (index, line) in normalized.split('\n').enumerate() {
            let line_no = index + 1;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('*') {
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
                continue;
            }

            if skipping {
                continue;
            }

            for token in tokenize_line(trimmed) {
                let resolved = resolve_token(&game, &cursor, &token, prev_to).map_err(|e| {
                    match e {
                        CodecError::Malformed { message, .. } => {
                            CodecError::at_line(line_no, message)
                        }
                        other => other,
                    }
                })?;
                let Some((usi, destination)) = resolved else {
                    skipping = true;
                    break;
                };
                cursor = game
                    .play_move(&cursor, &usi)
                    .map_err(|e| CodecError::at_line(line_no, e.to_string()))?;
                prev_to = Some(destination);
                if !in_variation {
                    mainline_ids.push(cursor.clone());
                }
            }
        }

        if game.node_count() == 1 {
            warnings.push("no moves found in KI2 text".to_string());
        }

        let root = game.root_node_id.clone();
        game.jump(&root)?;
        Ok(ParseOutcome { game, warnings })
    }

    fn emit(&self, game: &Game, _options: &EmitOptions) -> Result<String, CodecError> {
        let mut lines = Vec::new();

        let mainline = mainline_node_ids(game);
        let mut prev_to: Option<Square> = None;
        for ply in 1..mainline.len() {
            let parent = game.node(&mainline[ply - 1])?;
            let node = game.node(&mainline[ply])?;
            let usi = node.move_usi.as_deref().unwrap_or("");
            lines.push(kif2_label(&parent.position_sfen, usi, prev_to)?);
            prev_to = parse_usi_move(usi).ok().map(|mv| mv.destination());
        }

        for (ply, parent_id) in mainline.iter().enumerate() {
            let children = game.children_of(parent_id);
            for alt in children.iter().skip(1) {
                lines.push(String::new());
                lines.push(format!("変化：{}手", ply + 1));
                let mut prev_to = move_destination(game, parent_id);
                let mut parent_id = parent_id.clone();
                let mut node_id = alt.node_id.clone();
                loop {
                    let parent = game.node(&parent_id)?;
                    let node = game.node(&node_id)?;
                    let usi = node.move_usi.as_deref().unwrap_or("");
                    lines.push(kif2_label(&parent.position_sfen, usi, prev_to)?);
                    prev_to = parse_usi_move(usi).ok().map(|mv| mv.destination());
                    match game.first_child_of(&node_id) {
                        Some(next) => {
                            parent_id = node_id;
                            node_id = next.node_id.clone();
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
