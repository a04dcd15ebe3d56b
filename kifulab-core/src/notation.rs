//! Japanese move notation: KIF move bodies and KIF2 labels
//!
//! Everything here converts between USI moves and the zenkaku/kanji move
//! text used by KIF and KI2 records. Board context comes from the parent
//! position's SFEN because the piece name is not part of a USI move.

use crate::error::SfenError;
use crate::sfen::{parse_sfen, parse_usi_move, ParsedMove, Piece, PieceKind, Side, Square};

const FILE_ZENKAKU: [char; 9] = ['１', '２', '３', '４', '５', '６', '７', '８', '９'];
const RANK_KANJI: [char; 9] = ['一', '二', '三', '四', '五', '六', '七', '八', '九'];

/// Words that end a game record instead of describing a move
const TERMINAL_WORDS: [&str; 5] = ["投了", "中断", "持将棋", "千日手", "詰み"];

/// Japanese piece names, longest first so that prefix matching is unambiguous
const PIECE_NAMES: [(&str, PieceKind, bool); 16] = [
    ("成香", PieceKind::Lance, true),
    ("成桂", PieceKind::Knight, true),
    ("成銀", PieceKind::Silver, true),
    ("龍", PieceKind::Rook, true),
    ("竜", PieceKind::Rook, true),
    ("馬", PieceKind::Bishop, true),
    ("と", PieceKind::Pawn, true),
    ("玉", PieceKind::King, false),
    ("王", PieceKind::King, false),
    ("飛", PieceKind::Rook, false),
    ("角", PieceKind::Bishop, false),
    ("金", PieceKind::Gold, false),
    ("銀", PieceKind::Silver, false),
    ("桂", PieceKind::Knight, false),
    ("香", PieceKind::Lance, false),
    ("歩", PieceKind::Pawn, false),
];

pub fn piece_name(kind: PieceKind, promoted: bool) -> &'static str {
    match (kind, promoted) {
        (PieceKind::Pawn, false) => "歩",
        (PieceKind::Lance, false) => "香",
        (PieceKind::Knight, false) => "桂",
        (PieceKind::Silver, false) => "銀",
        (PieceKind::Gold, _) => "金",
        (PieceKind::Bishop, false) => "角",
        (PieceKind::Rook, false) => "飛",
        (PieceKind::King, _) => "玉",
        (PieceKind::Pawn, true) => "と",
        (PieceKind::Lance, true) => "成香",
        (PieceKind::Knight, true) => "成桂",
        (PieceKind::Silver, true) => "成銀",
        (PieceKind::Bishop, true) => "馬",
        (PieceKind::Rook, true) => "龍",
    }
}

/// Longest-prefix match of a Japanese piece name; returns the remainder.
fn match_piece_name(text: &str) -> Option<(PieceKind, bool, &str)> {
    for (name, kind, promoted) in PIECE_NAMES {
        if let Some(rest) = text.strip_prefix(name) {
            return Some((kind, promoted, rest));
        }
    }
    None
}

pub fn contains_terminal_word(text: &str) -> bool {
    TERMINAL_WORDS.iter().any(|w| text.contains(w))
}

pub fn side_mark(side: Side) -> char {
    match side {
        Side::Black => '▲',
        Side::White => '△',
    }
}

/// Format a destination square as zenkaku file + kanji rank, e.g. `７六`
pub fn kif_square(sq: Square) -> String {
    let mut out = String::new();
    out.push(FILE_ZENKAKU[(sq.file() - 1) as usize]);
    out.push(RANK_KANJI[(sq.rank() - 1) as usize]);
    out
}

/// Parse a two-character square in zenkaku/ASCII file + kanji/ASCII rank form
pub fn parse_kif_square(text: &str) -> Result<Square, SfenError> {
    let mut chars = text.chars().filter(|c| *c != '　' && !c.is_whitespace());
    let file_ch = chars
        .next()
        .ok_or_else(|| SfenError::InvalidMove(format!("invalid square: {}", text)))?;
    let rank_ch = chars
        .next()
        .ok_or_else(|| SfenError::InvalidMove(format!("invalid square: {}", text)))?;

    let file = FILE_ZENKAKU
        .iter()
        .position(|c| *c == file_ch)
        .map(|i| i as u8 + 1)
        .or_else(|| file_ch.to_digit(10).map(|d| d as u8).filter(|d| (1..=9).contains(d)))
        .ok_or_else(|| SfenError::InvalidMove(format!("invalid file: {}", text)))?;
    let rank = RANK_KANJI
        .iter()
        .position(|c| *c == rank_ch)
        .map(|i| i as u8 + 1)
        .or_else(|| rank_ch.to_digit(10).map(|d| d as u8).filter(|d| (1..=9).contains(d)))
        .ok_or_else(|| SfenError::InvalidMove(format!("invalid rank: {}", text)))?;

    Square::from_file_rank(file, rank)
}

fn piece_at(parent_sfen: &str, sq: Square) -> Result<Option<Piece>, SfenError> {
    Ok(parse_sfen(parent_sfen)?.piece_at(sq))
}

fn destination_text(to: Square, prev_to: Option<Square>) -> String {
    if prev_to == Some(to) {
        "同　".to_string()
    } else {
        kif_square(to)
    }
}

/// KIF2 label for a move, e.g. `▲７六歩` / `△同　銀` / `▲５五角打`
pub fn kif2_label(
    parent_sfen: &str,
    move_usi: &str,
    prev_to: Option<Square>,
) -> Result<String, SfenError> {
    let position = parse_sfen(parent_sfen)?;
    let mv = parse_usi_move(move_usi)?;
    let mark = side_mark(position.side);
    let to_text = destination_text(mv.destination(), prev_to);

    match mv {
        ParsedMove::Drop { piece, .. } => {
            Ok(format!("{}{}{}打", mark, to_text, piece_name(piece, false)))
        }
        ParsedMove::Board { from, promote, .. } => {
            let piece = position
                .piece_at(from)
                .ok_or_else(|| SfenError::IllegalMove("source square empty".to_string()))?;
            let suffix = if promote { "成" } else { "" };
            Ok(format!(
                "{}{}{}{}",
                mark,
                to_text,
                piece_name(piece.kind, piece.promoted),
                suffix
            ))
        }
    }
}

/// KIF move body (no move number), e.g. `７六歩(77)` / `同　歩(33)` / `５五角打`
pub fn kif_move_text(
    parent_sfen: &str,
    move_usi: &str,
    prev_to: Option<Square>,
) -> Result<String, SfenError> {
    let mv = parse_usi_move(move_usi)?;
    let to_text = destination_text(mv.destination(), prev_to);

    match mv {
        ParsedMove::Drop { piece, .. } => Ok(format!("{}{}打", to_text, piece_name(piece, false))),
        ParsedMove::Board { from, promote, .. } => {
            let piece = piece_at(parent_sfen, from)?
                .ok_or_else(|| SfenError::IllegalMove("source square empty".to_string()))?;
            let suffix = if promote { "成" } else { "" };
            Ok(format!(
                "{}{}{}({}{})",
                to_text,
                piece_name(piece.kind, piece.promoted),
                suffix,
                from.file(),
                from.rank()
            ))
        }
    }
}

/// A KIF move body parsed down to coordinates; `from` is absent for drops
/// and for records that omit the origin parenthetical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KifMove {
    pub to: Square,
    pub from: Option<Square>,
    pub drop_piece: Option<PieceKind>,
    pub promote: bool,
}

impl KifMove {
    pub fn to_usi(&self) -> Result<String, SfenError> {
        if let Some(piece) = self.drop_piece {
            return Ok(format!("{}*{}", piece.letter(), self.to.to_usi()));
        }
        let from = self
            .from
            .ok_or_else(|| SfenError::InvalidMove("from square missing".to_string()))?;
        Ok(format!(
            "{}{}{}",
            from.to_usi(),
            self.to.to_usi(),
            if self.promote { "+" } else { "" }
        ))
    }
}

/// Strip a trailing clock annotation like `( 0:03/00:00:15)`
fn strip_clock(text: &str) -> &str {
    let trimmed = text.trim_end();
    if !trimmed.ends_with(')') {
        return trimmed;
    }
    if let Some(open) = trimmed.rfind('(') {
        let inner = &trimmed[open + 1..trimmed.len() - 1];
        if inner.contains('/') && inner.contains(':') {
            return trimmed[..open].trim_end();
        }
    }
    trimmed
}

/// Parse a KIF move body like `７六歩(77)`, `同　歩(33)` or `７六歩打`.
///
/// Returns `None` for terminal markers (投了 and friends). The returned
/// square is the destination, fed back in as `prev_to` for the next move.
pub fn parse_kif_move_text(
    move_text: &str,
    prev_to: Option<Square>,
) -> Result<Option<(KifMove, Square)>, SfenError> {
    let s = strip_clock(move_text).replace('　', " ");
    let s = s.trim();
    if s.is_empty() {
        return Err(SfenError::InvalidMove("empty move".to_string()));
    }
    if contains_terminal_word(s) {
        return Ok(None);
    }

    let (to, rest) = if let Some(rest) = s.strip_prefix('同') {
        let to = prev_to.ok_or_else(|| {
            SfenError::InvalidMove("'同' used but no previous destination".to_string())
        })?;
        (to, rest.trim_start())
    } else {
        let to = parse_kif_square(s)?;
        // Skip the two square characters (they may be multi-byte).
        let mut chars = s.char_indices();
        chars.next();
        chars.next();
        let rest = chars.next().map(|(i, _)| &s[i..]).unwrap_or("");
        (to, rest.trim_start())
    };

    // Origin parenthetical: (77)
    let mut from = None;
    let mut body = rest.to_string();
    if let Some(open) = body.find('(') {
        if let Some(close_rel) = body[open..].find(')') {
            let inner: String = body[open + 1..open + close_rel]
                .chars()
                .filter(|c| c.is_ascii_digit())
                .collect();
            if inner.len() == 2 {
                let digits: Vec<u8> = inner.bytes().map(|b| b - b'0').collect();
                from = Some(Square::from_file_rank(digits[0], digits[1])?);
            }
            body.replace_range(open..open + close_rel + 1, "");
        }
    }

    let is_drop = body.contains('打');
    let promote = body.contains('成') && !body.contains("不成");

    if is_drop {
        let (kind, promoted, _) = match_piece_name(body.trim())
            .ok_or_else(|| SfenError::InvalidMove(format!("cannot detect drop piece: {}", move_text)))?;
        if kind == PieceKind::King || promoted {
            return Err(SfenError::InvalidMove(format!("invalid drop piece: {}", move_text)));
        }
        return Ok(Some((
            KifMove {
                to,
                from: None,
                drop_piece: Some(kind),
                promote: false,
            },
            to,
        )));
    }

    Ok(Some((
        KifMove {
            to,
            from,
            drop_piece: None,
            promote,
        },
        to,
    )))
}

/// A KI2 token parsed down to coordinates plus the piece identity; the
/// origin square is resolved later against the board (see `movegen`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ki2Move {
    pub side: Side,
    pub to: Square,
    pub piece: PieceKind,
    pub promoted: bool,
    pub is_drop: bool,
    pub promote: bool,
    pub disambig: Vec<char>,
}

/// Parse one KI2 token like `▲７六歩` or `△同　銀右`.
///
/// Returns `None` for terminal markers.
pub fn parse_ki2_token(
    token: &str,
    prev_to: Option<Square>,
) -> Result<Option<(Ki2Move, Square)>, SfenError> {
    let t = token.trim();
    let mut chars = t.chars();
    let side = match chars.next() {
        Some('▲') => Side::Black,
        Some('△') => Side::White,
        _ => return Err(SfenError::InvalidMove(format!("missing side mark: {}", token))),
    };
    let rest: String = chars.collect::<String>().replace('　', " ");
    let rest = rest.trim();

    if contains_terminal_word(rest) {
        return Ok(None);
    }

    let (to, rest) = if let Some(r) = rest.strip_prefix('同') {
        let to = prev_to.ok_or_else(|| {
            SfenError::InvalidMove("'同' used but no previous destination".to_string())
        })?;
        (to, r.trim_start())
    } else {
        let to = parse_kif_square(rest)?;
        let mut idx = rest.char_indices();
        idx.next();
        idx.next();
        let r = idx.next().map(|(i, _)| &rest[i..]).unwrap_or("");
        (to, r.trim_start())
    };

    let (piece, promoted, rest) = match_piece_name(rest)
        .ok_or_else(|| SfenError::InvalidMove(format!("cannot detect piece name: {}", token)))?;

    let is_drop = rest.contains('打');
    let promote = rest.contains('成') && !rest.contains("不成");
    let disambig: Vec<char> = rest
        .chars()
        .filter(|c| matches!(c, '右' | '左' | '直' | '上' | '引' | '寄'))
        .collect();

    Ok(Some((
        Ki2Move {
            side,
            to,
            piece,
            promoted,
            is_drop,
            promote,
            disambig,
        },
        to,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sfen::DEFAULT_START_SFEN;

    fn sq(file: u8, rank: u8) -> Square {
        Square::from_file_rank(file, rank).unwrap()
    }

    #[test]
    fn kif_square_formats_zenkaku() {
        assert_eq!(kif_square(sq(7, 6)), "７六");
        assert_eq!(parse_kif_square("７六").unwrap(), sq(7, 6));
        assert_eq!(parse_kif_square("76").unwrap(), sq(7, 6));
    }

    #[test]
    fn labels_for_opening_moves() {
        assert_eq!(
            kif2_label(DEFAULT_START_SFEN, "7g7f", None).unwrap(),
            "▲７六歩"
        );
        assert_eq!(
            kif_move_text(DEFAULT_START_SFEN, "7g7f", None).unwrap(),
            "７六歩(77)"
        );
    }

    #[test]
    fn same_square_collapses_to_dou() {
        let text = kif_move_text(DEFAULT_START_SFEN, "7g7f", Some(sq(7, 6))).unwrap();
        assert_eq!(text, "同　歩(77)");
    }

    #[test]
    fn kif_move_text_round_trips() {
        let (parsed, dest) = parse_kif_move_text("７六歩(77)", None).unwrap().unwrap();
        assert_eq!(dest, sq(7, 6));
        assert_eq!(parsed.to_usi().unwrap(), "7g7f");

        let (parsed, _) = parse_kif_move_text("同　歩(33)", Some(sq(2, 2))).unwrap().unwrap();
        assert_eq!(parsed.to_usi().unwrap(), "3c2b");

        let (parsed, _) = parse_kif_move_text("５五角打", None).unwrap().unwrap();
        assert_eq!(parsed.to_usi().unwrap(), "B*5e");
    }

    #[test]
    fn clock_annotation_is_stripped() {
        let (parsed, _) = parse_kif_move_text("７六歩(77)   ( 0:03/00:00:15)", None)
            .unwrap()
            .unwrap();
        assert_eq!(parsed.to_usi().unwrap(), "7g7f");
    }

    #[test]
    fn terminal_words_end_the_record() {
        assert!(parse_kif_move_text("投了", None).unwrap().is_none());
        assert!(parse_ki2_token("▲投了", None).unwrap().is_none());
    }

    #[test]
    fn promotion_and_fusei() {
        let (parsed, _) = parse_kif_move_text("２二角成(88)", None).unwrap().unwrap();
        assert!(parsed.promote);
        let (parsed, _) = parse_kif_move_text("２二角不成(88)", None).unwrap().unwrap();
        assert!(!parsed.promote);
    }

    #[test]
    fn ki2_token_parses_marks_and_disambiguators() {
        let (mv, dest) = parse_ki2_token("▲７六歩", None).unwrap().unwrap();
        assert_eq!(mv.side, Side::Black);
        assert_eq!(dest, sq(7, 6));
        assert_eq!(mv.piece, PieceKind::Pawn);
        assert!(!mv.is_drop);

        let (mv, _) = parse_ki2_token("△同　銀右", Some(sq(5, 5))).unwrap().unwrap();
        assert_eq!(mv.side, Side::White);
        assert_eq!(mv.to, sq(5, 5));
        assert_eq!(mv.disambig, vec!['右']);

        let (mv, _) = parse_ki2_token("▲５五角打", None).unwrap().unwrap();
        assert!(mv.is_drop);
        assert_eq!(mv.piece, PieceKind::Bishop);
    }
}
