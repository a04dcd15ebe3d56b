//! USI position-command codec
//!
//! The source form is a single `position startpos|sfen … [moves …]` command
//! (a bare move list is also accepted); the parsed result is therefore
//! always a single line of play.

use crate::codec::{mainline_node_ids, EmitOptions, Format, FormatCodec, ParseOutcome};
use crate::error::CodecError;
use crate::sfen::{normalize_sfen, parse_usi_move, position_command};
use crate::tree::Game;

pub struct UsiCodec;

fn parse_position_text(text: &str) -> Result<(String, Vec<String>), CodecError> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.is_empty() {
        return Err(CodecError::malformed("empty text"));
    }

    if tokens[0] != "position" {
        // Bare move list: every token must be a USI move.
        let mut moves = Vec::with_capacity(tokens.len());
        for token in &tokens {
            parse_usi_move(token)?;
            moves.push(token.to_string());
        }
        return Ok((normalize_sfen("")?, moves));
    }

    let mut idx = 1;
    let initial_sfen = match tokens.get(idx) {
        Some(&"startpos") => {
            idx += 1;
            normalize_sfen("")?
        }
        Some(&"sfen") => {
            if tokens.len() < idx + 5 {
                return Err(CodecError::malformed("position sfen requires 4 SFEN fields"));
            }
            let sfen = tokens[idx + 1..idx + 5].join(" ");
            idx += 5;
            normalize_sfen(&sfen)?
        }
        _ => return Err(CodecError::malformed("position must use startpos or sfen")),
    };

    let mut moves = Vec::new();
    if idx < tokens.len() {
        if tokens[idx] != "moves" {
            return Err(CodecError::malformed("unexpected token after position base"));
        }
        for token in &tokens[idx + 1..] {
            parse_usi_move(token)?;
            moves.push(token.to_string());
        }
    }

    Ok((initial_sfen, moves))
}

impl FormatCodec for UsiCodec {
    fn format(&self) -> Format {
        Format::Usi
    }

    fn detect(&self, text: &str) -> bool {
        let s = text.trim_start();
        s.starts_with("position ") || s.trim_end() == "position"
    }

    fn parse(&self, text: &str, title: Option<&str>) -> Result<ParseOutcome, CodecError> {
        let (initial_sfen, moves) = parse_position_text(text.trim())?;
        let mut game = Game::new(title.or(Some("Imported USI")), Some(&initial_sfen))?;
        let mut cursor = game.root_node_id.clone();
        for usi in &moves {
            cursor = game.play_move(&cursor, usi)?;
        }
        Ok(ParseOutcome::clean(game))
    }

    fn emit(&self, game: &Game, options: &EmitOptions) -> Result<String, CodecError> {
        if !options.all_variations {
            let mainline = mainline_node_ids(game);
            let moves: Vec<String> = mainline
                .iter()
                .filter_map(|id| game.node(id).ok())
                .filter_map(|n| n.move_usi.clone())
                .collect();
            return Ok(position_command(&game.initial_sfen, &moves)?);
        }

        // One position command per leaf path, depth-first in sibling order,
        // so the main line comes out first.
        let mut lines = Vec::new();
        let mut stack = vec![(game.root_node_id.clone(), Vec::<String>::new())];
        while let Some((node_id, moves)) = stack.pop() {
            let children = game.children_of(&node_id);
            if children.is_empty() {
                lines.push(position_command(&game.initial_sfen, &moves)?);
                continue;
            }
            // Reverse push keeps pop order aligned with order_index.
            for child in children.into_iter().rev() {
                let mut extended = moves.clone();
                if let Some(usi) = &child.move_usi {
                    extended.push(usi.clone());
                }
                stack.push((child.node_id.clone(), extended));
            }
        }
        Ok(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sfen::DEFAULT_START_SFEN;

    #[test]
    fn parses_startpos_command() {
        let outcome = UsiCodec
            .parse("position startpos moves 7g7f 3c3d 8h2b+", None)
            .unwrap();
        assert!(outcome.warnings.is_empty());
        let game = outcome.game;
        assert_eq!(game.initial_sfen, DEFAULT_START_SFEN);
        assert_eq!(game.current_path_moves(), vec!["7g7f", "3c3d", "8h2b+"]);
    }

    #[test]
    fn parses_explicit_sfen() {
        let text = format!("position sfen {} moves 7g7f", DEFAULT_START_SFEN);
        let game = UsiCodec.parse(&text, Some("imported")).unwrap().game;
        assert_eq!(game.title, "imported");
        assert_eq!(game.node_count(), 2);
    }

    #[test]
    fn parses_bare_move_list() {
        let game = UsiCodec.parse("7g7f 3c3d", None).unwrap().game;
        assert_eq!(game.current_path_moves(), vec!["7g7f", "3c3d"]);
    }

    #[test]
    fn rejects_malformed_commands() {
        assert!(UsiCodec.parse("", None).is_err());
        assert!(UsiCodec.parse("position", None).is_err());
        assert!(UsiCodec.parse("position sfen lnsgk b", None).is_err());
        assert!(UsiCodec.parse("position startpos moves 7g", None).is_err());
        assert!(UsiCodec.parse("position startpos 7g7f", None).is_err());
    }

    #[test]
    fn emit_round_trips_the_main_line() {
        let text = "position startpos moves 7g7f 3c3d";
        let game = UsiCodec.parse(text, None).unwrap().game;
        let emitted = UsiCodec.emit(&game, &EmitOptions::default()).unwrap();
        assert_eq!(emitted, text);
    }

    #[test]
    fn emit_all_variations_lists_every_leaf() {
        let mut game = Game::new(None, None).unwrap();
        let root = game.root_node_id.clone();
        let a = game.play_move(&root, "7g7f").unwrap();
        game.play_move(&a, "3c3d").unwrap();
        game.jump(&root).unwrap();
        game.play_move(&root, "2g2f").unwrap();

        let emitted = UsiCodec
            .emit(
                &game,
                &EmitOptions {
                    all_variations: true,
                },
            )
            .unwrap();
        let lines: Vec<&str> = emitted.lines().collect();
        assert_eq!(
            lines,
            vec![
                "position startpos moves 7g7f 3c3d",
                "position startpos moves 2g2f",
            ]
        );
    }
}
