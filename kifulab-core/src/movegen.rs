//! Pseudo-legal origin-square candidates for KI2 parsing
//!
//! KI2 records name the piece and the destination; the origin square must
//! be reconstructed from the board. The generator ignores check — it only
//! has to narrow the origin down far enough for the record's
//! disambiguation marks to finish the job.

use crate::sfen::{PieceKind, Position, Side, Square};

fn in_bounds(r: i8, c: i8) -> bool {
    (0..=8).contains(&r) && (0..=8).contains(&c)
}

fn slide_clear(position: &Position, from: Square, to: Square, dr: i8, dc: i8) -> bool {
    let mut r = from.row as i8 + dr;
    let mut c = from.col as i8 + dc;
    while (r, c) != (to.row as i8, to.col as i8) {
        if !in_bounds(r, c) {
            return false;
        }
        if position.board[r as usize][c as usize].is_some() {
            return false;
        }
        r += dr;
        c += dc;
    }
    true
}

fn step_hits(from: Square, to: Square, dr: i8, dc: i8) -> bool {
    (from.row as i8 + dr, from.col as i8 + dc) == (to.row as i8, to.col as i8)
}

fn gold_steps(forward: i8) -> [(i8, i8); 6] {
    [(forward, 0), (forward, -1), (forward, 1), (0, -1), (0, 1), (-forward, 0)]
}

fn reaches(
    position: &Position,
    from: Square,
    to: Square,
    kind: PieceKind,
    promoted: bool,
    forward: i8,
) -> bool {
    // Promoted minor pieces move as gold.
    if promoted
        && matches!(
            kind,
            PieceKind::Pawn | PieceKind::Lance | PieceKind::Knight | PieceKind::Silver
        )
    {
        return gold_steps(forward).iter().any(|(dr, dc)| step_hits(from, to, *dr, *dc));
    }

    match kind {
        PieceKind::Pawn => step_hits(from, to, forward, 0),
        PieceKind::Lance => {
            from.col == to.col
                && (to.row as i8 - from.row as i8) * forward > 0
                && slide_clear(position, from, to, forward, 0)
        }
        PieceKind::Knight => {
            step_hits(from, to, 2 * forward, -1) || step_hits(from, to, 2 * forward, 1)
        }
        PieceKind::Silver => [(forward, 0), (forward, -1), (forward, 1), (-forward, -1), (-forward, 1)]
            .iter()
            .any(|(dr, dc)| step_hits(from, to, *dr, *dc)),
        PieceKind::Gold => gold_steps(forward).iter().any(|(dr, dc)| step_hits(from, to, *dr, *dc)),
        PieceKind::King => {
            let dr = (to.row as i8 - from.row as i8).abs();
            let dc = (to.col as i8 - from.col as i8).abs();
            (dr | dc) != 0 && dr <= 1 && dc <= 1
        }
        PieceKind::Bishop => {
            let dr = to.row as i8 - from.row as i8;
            let dc = to.col as i8 - from.col as i8;
            let diagonal = dr.abs() == dc.abs()
                && dr != 0
                && slide_clear(position, from, to, dr.signum(), dc.signum());
            let horse_step = promoted
                && [(-1, 0), (1, 0), (0, -1), (0, 1)]
                    .iter()
                    .any(|(sr, sc)| step_hits(from, to, *sr, *sc));
            diagonal || horse_step
        }
        PieceKind::Rook => {
            let dr = to.row as i8 - from.row as i8;
            let dc = to.col as i8 - from.col as i8;
            let orthogonal = ((dr == 0) != (dc == 0))
                && slide_clear(position, from, to, dr.signum(), dc.signum());
            let dragon_step = promoted
                && [(-1, -1), (-1, 1), (1, -1), (1, 1)]
                    .iter()
                    .any(|(sr, sc)| step_hits(from, to, *sr, *sc));
            orthogonal || dragon_step
        }
    }
}

/// Origin squares from which `side`'s `(kind, promoted)` piece could move to `to`
pub fn candidates(
    position: &Position,
    side: Side,
    kind: PieceKind,
    promoted: bool,
    to: Square,
) -> Vec<Square> {
    // Destination occupied by our own piece can never be a move.
    if position.piece_at(to).is_some_and(|p| p.side == side) {
        return Vec::new();
    }

    let forward: i8 = match side {
        Side::Black => -1,
        Side::White => 1,
    };

    let mut out = Vec::new();
    for row in 0..9u8 {
        for col in 0..9u8 {
            let from = Square { row, col };
            let Some(piece) = position.piece_at(from) else {
                continue;
            };
            if piece.side != side || piece.kind != kind || piece.promoted != promoted {
                continue;
            }
            if reaches(position, from, to, kind, promoted, forward) {
                out.push(from);
            }
        }
    }
    out
}

/// Apply KI2 disambiguation marks (右/左/直/上/引/寄) to a candidate set
pub fn filter_disambiguation(
    side: Side,
    to: Square,
    candidates: Vec<Square>,
    marks: &[char],
) -> Vec<Square> {
    if marks.is_empty() || candidates.is_empty() {
        return candidates;
    }

    let forward_is_up = side == Side::Black;
    let mut filtered = candidates;

    if marks.contains(&'直') {
        filtered.retain(|c| c.file() == to.file());
    }
    if marks.contains(&'寄') {
        filtered.retain(|c| c.rank() == to.rank());
    }
    if marks.contains(&'上') {
        if forward_is_up {
            filtered.retain(|c| c.rank() > to.rank());
        } else {
            filtered.retain(|c| c.rank() < to.rank());
        }
    }
    if marks.contains(&'引') {
        if forward_is_up {
            filtered.retain(|c| c.rank() < to.rank());
        } else {
            filtered.retain(|c| c.rank() > to.rank());
        }
    }
    if marks.contains(&'右') {
        // Sente's right is the smaller file number.
        let best = if forward_is_up {
            filtered.iter().map(|c| c.file()).min()
        } else {
            filtered.iter().map(|c| c.file()).max()
        };
        if let Some(best) = best {
            filtered.retain(|c| c.file() == best);
        }
    }
    if marks.contains(&'左') {
        let best = if forward_is_up {
            filtered.iter().map(|c| c.file()).max()
        } else {
            filtered.iter().map(|c| c.file()).min()
        };
        if let Some(best) = best {
            filtered.retain(|c| c.file() == best);
        }
    }

    filtered
}
