//! Kifu text format codecs
//!
//! Each supported format implements [`FormatCodec`]; the registry owns the
//! codec set and the autodetection order. The rest of the workspace only
//! talks to the registry.

pub mod kif;
pub mod kif2;
pub mod usi;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::tree::Game;

pub use kif::KifCodec;
pub use kif2::Kif2Codec;
pub use usi::UsiCodec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Usi,
    Kif,
    Kif2,
}

impl Format {
    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Usi => "usi",
            Format::Kif => "kif",
            Format::Kif2 => "kif2",
        }
    }

    /// File extension for text downloads
    pub fn extension(&self) -> &'static str {
        match self {
            Format::Usi => "usi.txt",
            Format::Kif => "kif",
            Format::Kif2 => "ki2",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Format {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "usi" => Ok(Format::Usi),
            "kif" => Ok(Format::Kif),
            "kif2" | "ki2" => Ok(Format::Kif2),
            other => Err(CodecError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Emission options; the default emits the main line / primary variation only
#[derive(Debug, Clone, Copy, Default)]
pub struct EmitOptions {
    /// USI: emit one `position` command per leaf path instead of the main line
    pub all_variations: bool,
}

/// A parsed game plus non-fatal parser notes
#[derive(Debug)]
pub struct ParseOutcome {
    pub game: Game,
    pub warnings: Vec<String>,
}

impl ParseOutcome {
    pub fn clean(game: Game) -> Self {
        Self {
            game,
            warnings: Vec::new(),
        }
    }
}

/// One kifu text format: detection heuristic, parser, emitter
pub trait FormatCodec: Send + Sync {
    fn format(&self) -> Format;

    /// Cheap heuristic on the raw text; the registry asks codecs in
    /// registration order and takes the first yes.
    fn detect(&self, text: &str) -> bool;

    fn parse(&self, text: &str, title: Option<&str>) -> Result<ParseOutcome, CodecError>;

    fn emit(&self, game: &Game, options: &EmitOptions) -> Result<String, CodecError>;
}

/// The codec set, in autodetection order
pub struct CodecRegistry {
    codecs: Vec<Box<dyn FormatCodec>>,
}

impl CodecRegistry {
    /// Registry with the three standard codecs. KIF is probed before KIF2 so
    /// that KIF records quoting side marks in comments stay KIF.
    pub fn standard() -> Self {
        Self {
            codecs: vec![
                Box::new(UsiCodec),
                Box::new(KifCodec),
                Box::new(Kif2Codec),
            ],
        }
    }

    pub fn register(&mut self, codec: Box<dyn FormatCodec>) {
        self.codecs.push(codec);
    }

    fn get(&self, format: Format) -> Result<&dyn FormatCodec, CodecError> {
        self.codecs
            .iter()
            .find(|c| c.format() == format)
            .map(|c| c.as_ref())
            .ok_or_else(|| CodecError::UnsupportedFormat(format.as_str().to_string()))
    }

    /// First codec whose heuristic accepts the text; `None` on ambiguity.
    pub fn detect(&self, text: &str) -> Option<Format> {
        self.codecs.iter().find(|c| c.detect(text)).map(|c| c.format())
    }

    pub fn parse(
        &self,
        format: Format,
        text: &str,
        title: Option<&str>,
    ) -> Result<ParseOutcome, CodecError> {
        self.get(format)?.parse(text, title)
    }

    pub fn emit(
        &self,
        format: Format,
        game: &Game,
        options: &EmitOptions,
    ) -> Result<String, CodecError> {
        self.get(format)?.emit(game, options)
    }

    /// Autodetect then parse
    pub fn parse_auto(
        &self,
        text: &str,
        title: Option<&str>,
    ) -> Result<(Format, ParseOutcome), CodecError> {
        let format = self
            .detect(text)
            .ok_or_else(|| CodecError::malformed("could not detect input format (USI/KIF/KIF2)"))?;
        Ok((format, self.parse(format, text, title)?))
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// Main line of a game: root id followed by the first-child chain
pub(crate) fn mainline_node_ids(game: &Game) -> Vec<String> {
    let mut out = vec![game.root_node_id.clone()];
    let mut cursor = game.root_node_id.clone();
    while let Some(child) = game.first_child_of(&cursor) {
        cursor = child.node_id.clone();
        out.push(cursor.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_tags_parse() {
        assert_eq!("usi".parse::<Format>().unwrap(), Format::Usi);
        assert_eq!("KIF".parse::<Format>().unwrap(), Format::Kif);
        assert_eq!("ki2".parse::<Format>().unwrap(), Format::Kif2);
        assert!("sgf".parse::<Format>().is_err());
    }

    #[test]
    fn detection_order_prefers_kif_over_kif2() {
        let registry = CodecRegistry::standard();
        let kif_text = "手合割：平手\n手数----指手---------\n   1 ７六歩(77)\n";
        assert_eq!(registry.detect(kif_text), Some(Format::Kif));
        assert_eq!(registry.detect("▲７六歩 △３四歩"), Some(Format::Kif2));
        assert_eq!(registry.detect("position startpos moves 7g7f"), Some(Format::Usi));
        assert_eq!(registry.detect("hello world"), None);
    }

    #[test]
    fn mainline_follows_first_children() {
        let mut game = Game::new(None, None).unwrap();
        let root = game.root_node_id.clone();
        let a = game.play_move(&root, "7g7f").unwrap();
        let b = game.play_move(&a, "3c3d").unwrap();
        game.jump(&root).unwrap();
        game.play_move(&root, "2g2f").unwrap();

        assert_eq!(mainline_node_ids(&game), vec![root, a, b]);
    }
}
