//! Position conversion between LSP coordinates and rope offsets.
//!
//! LSP positions are `(line, character)` where `character` counts UTF-16
//! code units within the line, not bytes and not grapheme clusters. The
//! rope stores UTF-8 and indexes by Unicode codepoint, so every conversion
//! goes through a per-line code-unit walk.
//!
//! All conversions clamp: a character past the end of its line resolves to
//! the end of that line, a line past the end of the document resolves to
//! the document end. Clamping is part of the contract and is tested.

use lsp_types::{Position, Range};
use ropey::{Rope, RopeSlice};

/// Character offset encoding negotiated with the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetEncoding {
	/// Character offsets count UTF-8 bytes.
	Utf8,
	/// Character offsets count UTF-16 code units (the LSP default).
	#[default]
	Utf16,
	/// Character offsets count Unicode codepoints.
	Utf32,
}

/// Convert an LSP position to a rope character index, clamping.
#[must_use]
pub fn position_to_char(text: &Rope, pos: Position, encoding: OffsetEncoding) -> usize {
	let line = pos.line as usize;
	if line >= text.len_lines() {
		return text.len_chars();
	}

	let line_start = text.line_to_char(line);
	let line_text = text.line(line);
	line_start + lsp_col_to_char_offset(line_text, pos.character, encoding)
}

/// Convert a rope character index to an LSP position, clamping.
#[must_use]
pub fn char_to_position(text: &Rope, char_idx: usize, encoding: OffsetEncoding) -> Position {
	let char_idx = char_idx.min(text.len_chars());
	let line = text.char_to_line(char_idx);
	let line_start = text.line_to_char(line);
	let char_offset = char_idx - line_start;
	let line_text = text.line(line);
	Position {
		line: line as u32,
		character: char_offset_to_lsp_col(line_text, char_offset, encoding),
	}
}

/// Convert an LSP position to a rope byte offset, clamping.
#[must_use]
pub fn position_to_byte(text: &Rope, pos: Position, encoding: OffsetEncoding) -> usize {
	text.char_to_byte(position_to_char(text, pos, encoding))
}

/// Convert a rope byte offset to an LSP position, clamping.
///
/// A byte offset inside a multi-byte character resolves to the position of
/// that character.
#[must_use]
pub fn byte_to_position(text: &Rope, byte_idx: usize, encoding: OffsetEncoding) -> Position {
	let byte_idx = byte_idx.min(text.len_bytes());
	char_to_position(text, text.byte_to_char(byte_idx), encoding)
}

/// Convert an LSP range to a rope character range, clamping both ends.
#[must_use]
pub fn range_to_char_range(text: &Rope, range: Range, encoding: OffsetEncoding) -> (usize, usize) {
	let start = position_to_char(text, range.start, encoding);
	let end = position_to_char(text, range.end, encoding);
	// A degenerate range is treated as empty at its start.
	(start, end.max(start))
}

/// Convert a rope character range to an LSP range.
#[must_use]
pub fn char_range_to_range(text: &Rope, start: usize, end: usize, encoding: OffsetEncoding) -> Range {
	Range {
		start: char_to_position(text, start, encoding),
		end: char_to_position(text, end, encoding),
	}
}

/// Convert an LSP character column to a character offset within a line.
fn lsp_col_to_char_offset(line: RopeSlice, lsp_col: u32, encoding: OffsetEncoding) -> usize {
	let line_len = line_char_len_without_eol(line);
	match encoding {
		OffsetEncoding::Utf32 => (lsp_col as usize).min(line_len),
		OffsetEncoding::Utf8 => {
			let target_bytes = lsp_col as usize;
			let mut byte_count = 0;
			for (char_idx, ch) in line.chars().take(line_len).enumerate() {
				if byte_count >= target_bytes {
					return char_idx;
				}
				byte_count += ch.len_utf8();
			}
			line_len
		}
		OffsetEncoding::Utf16 => {
			let target_units = lsp_col as usize;
			let mut unit_count = 0;
			for (char_idx, ch) in line.chars().take(line_len).enumerate() {
				if unit_count >= target_units {
					return char_idx;
				}
				unit_count += ch.len_utf16();
			}
			line_len
		}
	}
}

/// Convert a character offset within a line to an LSP character column.
fn char_offset_to_lsp_col(line: RopeSlice, char_offset: usize, encoding: OffsetEncoding) -> u32 {
	match encoding {
		OffsetEncoding::Utf32 => char_offset as u32,
		OffsetEncoding::Utf8 => line
			.chars()
			.take(char_offset)
			.map(char::len_utf8)
			.sum::<usize>() as u32,
		OffsetEncoding::Utf16 => line
			.chars()
			.take(char_offset)
			.map(char::len_utf16)
			.sum::<usize>() as u32,
	}
}

/// Character length of a line excluding its end-of-line sequence.
fn line_char_len_without_eol(line: RopeSlice) -> usize {
	let mut len = line.len_chars();
	if len > 0 && line.char(len - 1) == '\n' {
		len -= 1;
	}
	if len > 0 && line.char(len - 1) == '\r' {
		len -= 1;
	}
	len
}
