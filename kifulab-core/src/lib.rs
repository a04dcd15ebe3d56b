//! Shogi domain core for the kifulab analysis server
//!
//! This crate provides:
//! - **SFEN**: position parsing, USI move application, `position` commands
//! - **Tree**: the branching game model (`Game`, `Node`) and its operations
//! - **Notation**: KIF/KI2 move text in both directions
//! - **Codecs**: `FormatCodec` implementations for USI/KIF/KIF2 behind a
//!   detecting registry
//!
//! Everything here is synchronous and side-effect free; persistence, the
//! engine, and the protocol live in the server crate.

pub mod codec;
pub mod error;
pub mod movegen;
pub mod notation;
pub mod sfen;
pub mod tree;

pub use codec::{CodecRegistry, EmitOptions, Format, FormatCodec, ParseOutcome};
pub use error::{CodecError, SfenError, TreeError};
pub use sfen::{
    apply_usi_move, normalize_sfen, parse_sfen, parse_usi_move, position_command,
    DEFAULT_START_SFEN,
};
pub use tree::{Game, GameWire, JsonMap, Node};
