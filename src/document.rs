//! Live text-document model.
//!
//! The manager owns the authoritative text of every open file. Text lives
//! in a rope, so taking a snapshot is an O(1) clone and a writer publishing
//! a new revision never disturbs snapshots taken earlier. All position
//! arithmetic goes through [`crate::position`] with the negotiated
//! encoding (UTF-16 unless the client asked otherwise).

use std::collections::HashMap;

use lsp_types::{
	TextDocumentContentChangeEvent, TextDocumentIdentifier, TextDocumentItem, Url,
	VersionedTextDocumentIdentifier,
};
use parking_lot::RwLock;
use ropey::Rope;
use tracing::{debug, warn};

use crate::position::{self, OffsetEncoding};

/// End-of-line style of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EolKind {
	/// `\n`
	#[default]
	Lf,
	/// `\r\n`
	CrLf,
	/// `\r`
	Cr,
}

impl EolKind {
	/// The byte sequence of this style.
	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Lf => "\n",
			Self::CrLf => "\r\n",
			Self::Cr => "\r",
		}
	}

	/// Detects the style from the first line break in `text`.
	///
	/// Documents without any line break default to LF.
	#[must_use]
	pub fn detect(text: &str) -> Self {
		match text.find(['\r', '\n']) {
			Some(idx) if text.as_bytes()[idx] == b'\n' => Self::Lf,
			Some(idx) if text[idx + 1..].starts_with('\n') => Self::CrLf,
			Some(_) => Self::Cr,
			None => Self::Lf,
		}
	}
}

/// Rewrites every line break in `text` to `eol`.
fn normalize_eol(text: &str, eol: EolKind) -> String {
	let mut out = String::with_capacity(text.len());
	let mut chars = text.chars().peekable();
	while let Some(ch) = chars.next() {
		match ch {
			'\r' => {
				if chars.peek() == Some(&'\n') {
					chars.next();
				}
				out.push_str(eol.as_str());
			}
			'\n' => out.push_str(eol.as_str()),
			other => out.push(other),
		}
	}
	out
}

/// One open document.
#[derive(Debug, Clone)]
struct Document {
	language_id: String,
	version: i32,
	text: Rope,
	eol: EolKind,
}

/// An immutable view of a document at a specific version.
///
/// Cheap to clone and safe to hold across suspension points; later edits
/// publish new revisions and never mutate a snapshot in place. To observe
/// a newer version, reacquire a snapshot.
#[derive(Debug, Clone)]
pub struct DocumentSnapshot {
	uri: Url,
	language_id: String,
	version: i32,
	text: Rope,
	eol: EolKind,
	encoding: OffsetEncoding,
}

impl DocumentSnapshot {
	/// The document URI.
	#[must_use]
	pub fn uri(&self) -> &Url {
		&self.uri
	}

	/// The language identifier given at open.
	#[must_use]
	pub fn language_id(&self) -> &str {
		&self.language_id
	}

	/// The version this snapshot was taken at.
	#[must_use]
	pub fn version(&self) -> i32 {
		self.version
	}

	/// The snapshot text.
	#[must_use]
	pub fn text(&self) -> &Rope {
		&self.text
	}

	/// The detected end-of-line style.
	#[must_use]
	pub fn eol(&self) -> EolKind {
		self.eol
	}

	/// Resolves a position to a byte offset, clamping.
	#[must_use]
	pub fn offset_of(&self, pos: lsp_types::Position) -> usize {
		position::position_to_byte(&self.text, pos, self.encoding)
	}

	/// Resolves a byte offset to a position, clamping.
	#[must_use]
	pub fn position_of(&self, byte_offset: usize) -> lsp_types::Position {
		position::byte_to_position(&self.text, byte_offset, self.encoding)
	}
}

/// Owner of all open documents.
///
/// Mutations happen between suspension points on the dispatch thread; the
/// lock is held only for the duration of one map operation and never
/// across an await.
#[derive(Debug, Default)]
pub struct DocumentManager {
	documents: RwLock<HashMap<Url, Document>>,
	/// Rewrite inserted line breaks to the document's style.
	///
	/// Agreed at initialize; off by default.
	normalize_eol: RwLock<bool>,
	encoding: RwLock<OffsetEncoding>,
}

impl DocumentManager {
	/// Creates an empty manager with the default UTF-16 encoding.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Enables or disables line-ending normalization of inserted text.
	pub fn set_normalize_eol(&self, normalize: bool) {
		*self.normalize_eol.write() = normalize;
	}

	/// Sets the negotiated position encoding.
	pub fn set_encoding(&self, encoding: OffsetEncoding) {
		*self.encoding.write() = encoding;
	}

	/// The negotiated position encoding.
	#[must_use]
	pub fn encoding(&self) -> OffsetEncoding {
		*self.encoding.read()
	}

	/// Whether a document is open.
	#[must_use]
	pub fn contains(&self, uri: &Url) -> bool {
		self.documents.read().contains_key(uri)
	}

	/// URIs of all open documents.
	#[must_use]
	pub fn open_uris(&self) -> Vec<Url> {
		self.documents.read().keys().cloned().collect()
	}

	/// Opens a document, replacing any previous text under the same URI.
	///
	/// The end-of-line style is detected here and preserved for the
	/// document's lifetime.
	pub fn open(&self, item: TextDocumentItem) {
		let eol = EolKind::detect(&item.text);
		debug!(uri = %item.uri, version = item.version, eol = ?eol, "opening document");
		self.documents.write().insert(
			item.uri,
			Document {
				language_id: item.language_id,
				version: item.version,
				text: Rope::from_str(&item.text),
				eol,
			},
		);
	}

	/// Applies a change batch to a document.
	///
	/// Change events apply in array order, each against the text produced
	/// by its predecessors. The batch version must be strictly greater than
	/// the stored version; stale batches are dropped with a warning.
	/// Returns the new version, or `None` when the batch was dropped.
	pub fn change(
		&self,
		id: &VersionedTextDocumentIdentifier,
		changes: &[TextDocumentContentChangeEvent],
	) -> Option<i32> {
		let encoding = self.encoding();
		let normalize = *self.normalize_eol.read();
		let mut documents = self.documents.write();
		let Some(doc) = documents.get_mut(&id.uri) else {
			warn!(uri = %id.uri, "change for unknown document");
			return None;
		};
		if id.version <= doc.version {
			warn!(
				uri = %id.uri,
				stored = doc.version,
				received = id.version,
				"dropping stale change"
			);
			return None;
		}

		// Writers publish a new revision; snapshots taken earlier keep the
		// rope they cloned.
		let mut text = doc.text.clone();
		for change in changes {
			apply_change(&mut text, doc.eol, normalize, encoding, change);
		}
		doc.text = text;
		doc.version = id.version;
		Some(doc.version)
	}

	/// Records a save, optionally verifying the text the client persisted.
	pub fn save(&self, id: &TextDocumentIdentifier, text: Option<&str>) {
		let documents = self.documents.read();
		let Some(doc) = documents.get(&id.uri) else {
			warn!(uri = %id.uri, "save for unknown document");
			return;
		};
		if let Some(text) = text
			&& doc.text != text
		{
			warn!(uri = %id.uri, "saved text diverges from the live buffer");
		}
		debug!(uri = %id.uri, version = doc.version, "document saved");
	}

	/// Closes a document, dropping its live state.
	pub fn close(&self, id: &TextDocumentIdentifier) {
		if self.documents.write().remove(&id.uri).is_none() {
			warn!(uri = %id.uri, "close for unknown document");
		}
	}

	/// Takes an immutable snapshot of a document.
	#[must_use]
	pub fn snapshot(&self, uri: &Url) -> Option<DocumentSnapshot> {
		let documents = self.documents.read();
		let doc = documents.get(uri)?;
		Some(DocumentSnapshot {
			uri: uri.clone(),
			language_id: doc.language_id.clone(),
			version: doc.version,
			text: doc.text.clone(),
			eol: doc.eol,
			encoding: self.encoding(),
		})
	}

	/// The stored version of a document.
	#[must_use]
	pub fn version(&self, uri: &Url) -> Option<i32> {
		self.documents.read().get(uri).map(|doc| doc.version)
	}
}

/// Applies one change event in place.
fn apply_change(
	text: &mut Rope,
	eol: EolKind,
	normalize: bool,
	encoding: OffsetEncoding,
	change: &TextDocumentContentChangeEvent,
) {
	let inserted = if normalize {
		normalize_eol(&change.text, eol)
	} else {
		change.text.clone()
	};
	match change.range {
		Some(range) => {
			let (start, end) = position::range_to_char_range(text, range, encoding);
			text.remove(start..end);
			text.insert(start, &inserted);
		}
		// No range: the event replaces the whole document.
		None => *text = Rope::from_str(&inserted),
	}
}

#[cfg(test)]
mod tests;
