//! Codec helpers on top of serde_json.
//!
//! Three concerns live here: pulling single fields out of a raw parameter
//! slice without a full parse, decoding handler parameters with the
//! absent-params defaulting rule, and discriminating record-shaped sum
//! types by required-key presence.

use std::borrow::Cow;
use std::collections::HashMap;

use lsp_types::{InsertReplaceEdit, TextEdit};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde_json::Value as JsonValue;
use serde_json::value::RawValue;

use crate::types::{ErrorCode, ResponseError};

/// Extracts one field of a raw JSON object without decoding the rest.
///
/// Returns `None` when the slice is not an object or the key is absent.
/// Sibling values stay untouched raw slices, so a router probing for
/// `partialResultToken` never parses a request's actual payload.
#[must_use]
pub fn raw_field<'a>(raw: &'a RawValue, key: &str) -> Option<&'a RawValue> {
	let fields: HashMap<Cow<'a, str>, &'a RawValue> = serde_json::from_str(raw.get()).ok()?;
	fields.get(key).copied()
}

/// Decodes one field of a raw JSON object into a typed value.
pub fn decode_field<T: DeserializeOwned>(raw: &RawValue, key: &str) -> Option<T> {
	serde_json::from_str(raw_field(raw, key)?.get()).ok()
}

/// Decodes handler parameters from an optional raw slice.
///
/// Absent params decode as the type's natural zero: `null` first, then an
/// empty object for record parameter types. Failures map to
/// [`ErrorCode::INVALID_PARAMS`].
pub fn decode_params<P: DeserializeOwned>(params: Option<&RawValue>) -> Result<P, ResponseError> {
	let decoded = match params {
		Some(raw) => serde_json::from_str(raw.get()),
		None => serde_json::from_value(JsonValue::Null)
			.or_else(|_| serde_json::from_value(JsonValue::Object(serde_json::Map::new()))),
	};
	decoded.map_err(|err| {
		ResponseError::new(
			ErrorCode::INVALID_PARAMS,
			format!("failed to deserialize parameters: {err}"),
		)
	})
}

/// One arm of a record-shaped sum type.
///
/// An arm matches a JSON object iff every key in `required` is present;
/// optional keys do not participate in discrimination.
pub struct VariantArm<T> {
	/// Name used in diagnostics.
	pub name: &'static str,
	/// Keys that must be present for this arm to match.
	pub required: &'static [&'static str],
	/// Decoder invoked once the arm is selected.
	pub decode: fn(&RawValue) -> serde_json::Result<T>,
}

/// Failure to decode a record-shaped sum type.
#[derive(Debug, thiserror::Error)]
pub enum VariantError {
	/// The value was not a JSON object.
	#[error("expected an object, got: {0}")]
	NotAnObject(String),
	/// No arm's required keys were all present.
	///
	/// The message lists the missing keys per arm.
	#[error("no variant matched: {0}")]
	NoMatch(String),
	/// The selected arm failed to decode.
	#[error("decoding variant failed: {0}")]
	Decode(#[from] serde_json::Error),
}

impl From<VariantError> for ResponseError {
	fn from(err: VariantError) -> Self {
		Self::new(ErrorCode::INVALID_PARAMS, err)
	}
}

/// Selects among record shapes by required-key presence.
///
/// Arms are tried in declaration order and the first one whose required
/// keys are all present wins. Unknown keys never disqualify an arm.
pub fn decode_variant<T>(arms: &[VariantArm<T>], raw: &RawValue) -> Result<T, VariantError> {
	let present: HashMap<Cow<'_, str>, IgnoredAny> = serde_json::from_str(raw.get())
		.map_err(|_| VariantError::NotAnObject(truncate_for_log(raw.get())))?;

	for arm in arms {
		if arm.required.iter().all(|key| present.contains_key(*key)) {
			return Ok((arm.decode)(raw)?);
		}
	}

	let mut report = String::new();
	for arm in arms {
		let missing: Vec<&str> = arm
			.required
			.iter()
			.filter(|key| !present.contains_key(**key))
			.copied()
			.collect();
		if !report.is_empty() {
			report.push_str("; ");
		}
		report.push_str(arm.name);
		report.push_str(" missing ");
		report.push_str(&missing.join(", "));
	}
	Err(VariantError::NoMatch(report))
}

fn truncate_for_log(text: &str) -> String {
	const LIMIT: usize = 128;
	if text.len() <= LIMIT {
		return text.into();
	}
	let cut = (0..=LIMIT).rev().find(|i| text.is_char_boundary(*i)).unwrap_or(0);
	format!("{}…", &text[..cut])
}

/// A completion edit: a plain edit or an insert/replace pair.
///
/// `InsertReplaceEdit` is a superset of `TextEdit` plus two required range
/// keys, so it is declared first and wins whenever both keys are present.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionEdit {
	/// An edit with distinct insert and replace ranges.
	InsertReplace(InsertReplaceEdit),
	/// A single-range edit.
	Text(TextEdit),
}

impl CompletionEdit {
	const ARMS: &'static [VariantArm<Self>] = &[
		VariantArm {
			name: "InsertReplaceEdit",
			required: &["newText", "insert", "replace"],
			decode: |raw| serde_json::from_str(raw.get()).map(Self::InsertReplace),
		},
		VariantArm {
			name: "TextEdit",
			required: &["range", "newText"],
			decode: |raw| serde_json::from_str(raw.get()).map(Self::Text),
		},
	];

	/// Decodes from a raw slice, discriminating by required-key presence.
	pub fn decode(raw: &RawValue) -> Result<Self, VariantError> {
		decode_variant(Self::ARMS, raw)
	}
}
