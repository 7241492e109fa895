use lsp_types::{Position, Range};

use super::*;

fn uri(s: &str) -> Url {
	Url::parse(s).unwrap()
}

fn open(manager: &DocumentManager, uri_str: &str, version: i32, text: &str) -> Url {
	let uri = uri(uri_str);
	manager.open(TextDocumentItem {
		uri: uri.clone(),
		language_id: "d".into(),
		version,
		text: text.into(),
	});
	uri
}

fn incremental(range: ((u32, u32), (u32, u32)), text: &str) -> TextDocumentContentChangeEvent {
	TextDocumentContentChangeEvent {
		range: Some(Range {
			start: Position {
				line: range.0.0,
				character: range.0.1,
			},
			end: Position {
				line: range.1.0,
				character: range.1.1,
			},
		}),
		range_length: None,
		text: text.into(),
	}
}

fn full(text: &str) -> TextDocumentContentChangeEvent {
	TextDocumentContentChangeEvent {
		range: None,
		range_length: None,
		text: text.into(),
	}
}

fn versioned(uri: &Url, version: i32) -> VersionedTextDocumentIdentifier {
	VersionedTextDocumentIdentifier {
		uri: uri.clone(),
		version,
	}
}

#[test]
fn eol_detection() {
	assert_eq!(EolKind::detect("plain"), EolKind::Lf);
	assert_eq!(EolKind::detect("a\nb"), EolKind::Lf);
	assert_eq!(EolKind::detect("a\r\nb"), EolKind::CrLf);
	assert_eq!(EolKind::detect("a\rb"), EolKind::Cr);
	assert_eq!(EolKind::detect("a\r"), EolKind::Cr);
}

#[test]
fn incremental_edit_applies_at_utf16_positions() {
	let manager = DocumentManager::new();
	let uri = open(&manager, "file:///a.d", 1, "hello\nworld");

	let version = manager.change(&versioned(&uri, 2), &[incremental(((0, 5), (0, 5)), "!")]);
	assert_eq!(version, Some(2));

	let snapshot = manager.snapshot(&uri).unwrap();
	assert_eq!(snapshot.text().to_string(), "hello!\nworld");
	assert_eq!(snapshot.position_of(7), Position {
		line: 1,
		character: 0,
	});
}

#[test]
fn changes_in_one_batch_apply_in_order() {
	let manager = DocumentManager::new();
	let uri = open(&manager, "file:///a.d", 1, "abc");

	// The second event's positions refer to the text after the first one.
	manager
		.change(
			&versioned(&uri, 2),
			&[
				incremental(((0, 0), (0, 1)), "X"),
				incremental(((0, 1), (0, 2)), "Y"),
			],
		)
		.unwrap();
	assert_eq!(manager.snapshot(&uri).unwrap().text().to_string(), "XYc");
}

#[test]
fn full_change_replaces_everything() {
	let manager = DocumentManager::new();
	let uri = open(&manager, "file:///a.d", 1, "old text");
	manager.change(&versioned(&uri, 2), &[full("new text")]).unwrap();
	assert_eq!(manager.snapshot(&uri).unwrap().text().to_string(), "new text");
}

#[test]
fn stale_and_equal_versions_are_dropped() {
	let manager = DocumentManager::new();
	let uri = open(&manager, "file:///a.d", 5, "text");

	assert_eq!(manager.change(&versioned(&uri, 5), &[full("nope")]), None);
	assert_eq!(manager.change(&versioned(&uri, 4), &[full("nope")]), None);
	assert_eq!(manager.snapshot(&uri).unwrap().text().to_string(), "text");
	assert_eq!(manager.version(&uri), Some(5));

	assert_eq!(manager.change(&versioned(&uri, 6), &[full("yes")]), Some(6));
	assert_eq!(manager.version(&uri), Some(6));
}

#[test]
fn change_for_unknown_document_is_dropped() {
	let manager = DocumentManager::new();
	assert_eq!(
		manager.change(&versioned(&uri("file:///nope.d"), 1), &[full("x")]),
		None
	);
}

#[test]
fn snapshots_survive_later_edits() {
	let manager = DocumentManager::new();
	let uri = open(&manager, "file:///a.d", 1, "before");
	let snapshot = manager.snapshot(&uri).unwrap();

	manager.change(&versioned(&uri, 2), &[full("after")]).unwrap();

	assert_eq!(snapshot.text().to_string(), "before");
	assert_eq!(snapshot.version(), 1);
	let newer = manager.snapshot(&uri).unwrap();
	assert_eq!(newer.text().to_string(), "after");
	assert_eq!(newer.version(), 2);
}

#[test]
fn inserted_text_is_normalized_when_agreed() {
	let manager = DocumentManager::new();
	manager.set_normalize_eol(true);
	let uri = open(&manager, "file:///a.d", 1, "one\r\ntwo");

	manager
		.change(&versioned(&uri, 2), &[incremental(((1, 3), (1, 3)), "\nthree\rfour")])
		.unwrap();
	assert_eq!(
		manager.snapshot(&uri).unwrap().text().to_string(),
		"one\r\ntwo\r\nthree\r\nfour"
	);
}

#[test]
fn inserted_text_is_verbatim_without_the_option() {
	let manager = DocumentManager::new();
	let uri = open(&manager, "file:///a.d", 1, "one\r\ntwo");

	manager
		.change(&versioned(&uri, 2), &[incremental(((1, 3), (1, 3)), "\nthree")])
		.unwrap();
	assert_eq!(
		manager.snapshot(&uri).unwrap().text().to_string(),
		"one\r\ntwo\nthree"
	);
}

#[test]
fn position_clamps_are_observable_through_snapshots() {
	let manager = DocumentManager::new();
	let uri = open(&manager, "file:///a.d", 1, "ab\ncd");
	let snapshot = manager.snapshot(&uri).unwrap();

	// Past end of line resolves to end of line.
	assert_eq!(
		snapshot.offset_of(Position {
			line: 0,
			character: 99,
		}),
		2
	);
	// Past end of document resolves to document end.
	assert_eq!(
		snapshot.offset_of(Position {
			line: 99,
			character: 0,
		}),
		5
	);
	assert_eq!(snapshot.position_of(9999), Position {
		line: 1,
		character: 2,
	});
}

#[test]
fn offset_round_trip_on_code_unit_boundaries() {
	let manager = DocumentManager::new();
	let uri = open(&manager, "file:///a.d", 1, "aä𐍈\nplain");
	let snapshot = manager.snapshot(&uri).unwrap();
	let text = snapshot.text().to_string();

	for byte in 0..=text.len() {
		if !text.is_char_boundary(byte) {
			continue;
		}
		let position = snapshot.position_of(byte);
		assert_eq!(snapshot.offset_of(position), byte, "at byte {byte}");
	}
}

#[test]
fn close_forgets_the_document() {
	let manager = DocumentManager::new();
	let uri = open(&manager, "file:///a.d", 1, "text");
	assert!(manager.contains(&uri));
	manager.close(&TextDocumentIdentifier { uri: uri.clone() });
	assert!(!manager.contains(&uri));
	assert!(manager.snapshot(&uri).is_none());
}

#[test]
fn reopen_resets_version_and_eol() {
	let manager = DocumentManager::new();
	let uri = open(&manager, "file:///a.d", 7, "a\r\nb");
	assert_eq!(manager.snapshot(&uri).unwrap().eol(), EolKind::CrLf);

	open(&manager, "file:///a.d", 1, "a\nb");
	let snapshot = manager.snapshot(&uri).unwrap();
	assert_eq!(snapshot.version(), 1);
	assert_eq!(snapshot.eol(), EolKind::Lf);
}
