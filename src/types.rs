//! JSON-RPC envelope types shared by the transport, router, and sockets.
//!
//! Request and notification parameters ride as raw JSON slices
//! ([`serde_json::value::RawValue`]) and are only decoded when a handler
//! asks for them. Routing, cancellation, and method lookup therefore never
//! pay for a parse they do not need.

use std::fmt;

use lsp_types::NumberOrString;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value as JsonValue;
use serde_json::value::RawValue;

/// JSON-RPC protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum RpcVersion {
	/// JSON-RPC version 2.0.
	#[serde(rename = "2.0")]
	V2,
}

/// The version literal emitted on every outgoing message.
pub(crate) const JSONRPC_VERSION: &str = "2.0";

/// The client-visible identifier of a request.
///
/// Equality and hashing are value-typed over the two id shapes, so a
/// `$/cancelRequest` carrying `7` matches a request sent with id `7`
/// regardless of how either was produced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
	/// Integer id.
	Number(i64),
	/// String id.
	String(String),
}

impl From<i64> for RequestId {
	fn from(id: i64) -> Self {
		Self::Number(id)
	}
}

impl From<String> for RequestId {
	fn from(id: String) -> Self {
		Self::String(id)
	}
}

impl From<&str> for RequestId {
	fn from(id: &str) -> Self {
		Self::String(id.into())
	}
}

impl From<NumberOrString> for RequestId {
	fn from(id: NumberOrString) -> Self {
		match id {
			NumberOrString::Number(n) => Self::Number(i64::from(n)),
			NumberOrString::String(s) => Self::String(s),
		}
	}
}

impl fmt::Display for RequestId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Number(n) => n.fmt(f),
			Self::String(s) => write!(f, "{s:?}"),
		}
	}
}

/// An incoming or outgoing request with undecoded parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct AnyRequest {
	/// The request id.
	pub id: RequestId,
	/// The method name.
	pub method: String,
	/// Raw parameter slice, absent when the peer omitted `params`.
	#[serde(default)]
	pub params: Option<Box<RawValue>>,
}

impl AnyRequest {
	/// Builds a request for method `R`, serializing the typed parameters.
	///
	/// The id is a placeholder; the main loop assigns the real id when the
	/// request leaves through a socket.
	pub fn new<R: lsp_types::request::Request>(params: R::Params) -> Result<Self, serde_json::Error> {
		Ok(Self {
			id: RequestId::Number(0),
			method: R::METHOD.into(),
			params: Some(serde_json::value::to_raw_value(&params)?),
		})
	}

	/// The raw parameter slice, if any.
	#[must_use]
	pub fn params_raw(&self) -> Option<&RawValue> {
		self.params.as_deref()
	}
}

impl Serialize for AnyRequest {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		// `RawValue` cannot ride through `#[serde(flatten)]`, so the
		// `jsonrpc` field is emitted inline.
		let mut s = serializer.serialize_struct("AnyRequest", 4)?;
		s.serialize_field("jsonrpc", JSONRPC_VERSION)?;
		s.serialize_field("id", &self.id)?;
		s.serialize_field("method", &self.method)?;
		if let Some(params) = &self.params {
			s.serialize_field("params", params)?;
		}
		s.end()
	}
}

/// An incoming or outgoing notification with undecoded parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct AnyNotification {
	/// The method name.
	pub method: String,
	/// Raw parameter slice, absent when the peer omitted `params`.
	#[serde(default)]
	pub params: Option<Box<RawValue>>,
}

impl AnyNotification {
	/// Builds a notification for method `N`, serializing the typed parameters.
	pub fn new<N: lsp_types::notification::Notification>(params: N::Params) -> Result<Self, serde_json::Error> {
		Ok(Self {
			method: N::METHOD.into(),
			params: Some(serde_json::value::to_raw_value(&params)?),
		})
	}

	/// Builds a notification from a method name and an already-built value.
	pub fn from_value(method: impl Into<String>, params: JsonValue) -> Result<Self, serde_json::Error> {
		Ok(Self {
			method: method.into(),
			params: Some(serde_json::value::to_raw_value(&params)?),
		})
	}

	/// The raw parameter slice, if any.
	#[must_use]
	pub fn params_raw(&self) -> Option<&RawValue> {
		self.params.as_deref()
	}
}

impl Serialize for AnyNotification {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		let mut s = serializer.serialize_struct("AnyNotification", 3)?;
		s.serialize_field("jsonrpc", JSONRPC_VERSION)?;
		s.serialize_field("method", &self.method)?;
		if let Some(params) = &self.params {
			s.serialize_field("params", params)?;
		}
		s.end()
	}
}

/// A response to a request.
///
/// Responses always carry the concrete id of the request they answer; the
/// id is never serialized as `null`.
#[derive(Debug, Clone, Deserialize)]
pub struct AnyResponse {
	/// Id of the request this answers.
	pub id: RequestId,
	/// The result on success.
	#[serde(default)]
	pub result: Option<JsonValue>,
	/// The error on failure.
	#[serde(default)]
	pub error: Option<ResponseError>,
}

impl Serialize for AnyResponse {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		let mut s = serializer.serialize_struct("AnyResponse", 3)?;
		s.serialize_field("jsonrpc", JSONRPC_VERSION)?;
		s.serialize_field("id", &self.id)?;
		match &self.error {
			Some(error) => s.serialize_field("error", error)?,
			// Exactly one of `result`/`error` must be present; a success
			// without a value answers with an explicit `null`.
			None => s.serialize_field("result", &self.result)?,
		}
		s.end()
	}
}

/// A JSON-RPC error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
	/// Invalid JSON was received by the server.
	pub const PARSE_ERROR: Self = Self(-32700);
	/// The JSON sent is not a valid Request object.
	pub const INVALID_REQUEST: Self = Self(-32600);
	/// The method does not exist or is not available.
	pub const METHOD_NOT_FOUND: Self = Self(-32601);
	/// Invalid method parameters.
	pub const INVALID_PARAMS: Self = Self(-32602);
	/// Internal JSON-RPC error.
	pub const INTERNAL_ERROR: Self = Self(-32603);
	/// A request was sent before the server was initialized.
	pub const SERVER_NOT_INITIALIZED: Self = Self(-32002);
	/// Catch-all server error.
	pub const UNKNOWN_ERROR_CODE: Self = Self(-32001);
	/// The request failed but was syntactically valid.
	pub const REQUEST_FAILED: Self = Self(-32803);
	/// The server cancelled the request.
	pub const SERVER_CANCELLED: Self = Self(-32802);
	/// The document was modified since the request was issued.
	pub const CONTENT_MODIFIED: Self = Self(-32801);
	/// The client cancelled the request.
	pub const REQUEST_CANCELLED: Self = Self(-32800);
}

impl fmt::Display for ErrorCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

/// The error carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct ResponseError {
	/// Machine-readable error code.
	pub code: ErrorCode,
	/// Human-readable description.
	pub message: String,
	/// Optional structured payload.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub data: Option<JsonValue>,
}

impl ResponseError {
	/// Creates an error with no attached data.
	#[must_use]
	pub fn new(code: ErrorCode, message: impl fmt::Display) -> Self {
		Self {
			code,
			message: message.to_string(),
			data: None,
		}
	}

	/// Attaches a structured payload.
	#[must_use]
	pub fn with_data(mut self, data: JsonValue) -> Self {
		self.data = Some(data);
		self
	}
}

impl From<serde_json::Error> for ResponseError {
	fn from(err: serde_json::Error) -> Self {
		Self::new(ErrorCode::INVALID_PARAMS, err)
	}
}
