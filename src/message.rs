//! JSON-RPC message framing and I/O.
//!
//! Messages are framed by a header block terminated by `\r\n\r\n`, of which
//! `Content-Length` is mandatory. Reads are async and buffer until a full
//! message is available; a partial header never blocks the dispatch thread.

use futures::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use serde_json::value::RawValue;

use crate::types::{AnyNotification, AnyRequest, AnyResponse, RequestId, ResponseError, RpcVersion};
use crate::{Error, Result};

/// Hard cap on a single header line. Anything longer is a framing error.
const MAX_HEADER_LEN: usize = 64 * 1024;

/// A JSON-RPC message (request, response, or notification).
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Message {
	/// An incoming or outgoing request.
	Request(AnyRequest),
	/// A response to a request.
	Response(AnyResponse),
	/// A notification (no response expected).
	Notification(AnyNotification),
}

/// Flat view of a decoded message body.
///
/// The wire does not tag message kinds; they are discriminated by which of
/// the `id`/`method`/`result`/`error` keys are present. `params` stays a
/// raw slice here so classification never forces a parse.
#[derive(Debug, Deserialize)]
struct RawFrame {
	#[allow(dead_code, reason = "deserialized to validate the version literal")]
	jsonrpc: RpcVersion,
	#[serde(default)]
	id: Option<RequestId>,
	#[serde(default)]
	method: Option<String>,
	#[serde(default)]
	params: Option<Box<RawValue>>,
	// Kept raw so a present-but-`null` result is distinguishable from an
	// absent one; `{"id":1,"result":null}` is a legitimate success reply.
	#[serde(default)]
	result: Option<Box<RawValue>>,
	#[serde(default)]
	error: Option<ResponseError>,
}

impl TryFrom<RawFrame> for Message {
	type Error = Error;

	fn try_from(frame: RawFrame) -> Result<Self> {
		match (frame.method, frame.id) {
			(Some(method), Some(id)) => Ok(Self::Request(AnyRequest {
				id,
				method,
				params: frame.params,
			})),
			// An explicit `id: null` deserializes as absent and lands here;
			// there is no id to answer, so it can only be a notification.
			(Some(method), None) => Ok(Self::Notification(AnyNotification {
				method,
				params: frame.params,
			})),
			(None, Some(id)) => {
				if frame.result.is_none() && frame.error.is_none() {
					return Err(Error::Protocol(format!(
						"response {id} carries neither result nor error"
					)));
				}
				let result = frame
					.result
					.as_deref()
					.map(|raw| serde_json::from_str::<JsonValue>(raw.get()))
					.transpose()?;
				Ok(Self::Response(AnyResponse {
					id,
					result,
					error: frame.error,
				}))
			}
			(None, None) => Err(Error::Protocol("message has neither method nor id".into())),
		}
	}
}

impl Message {
	/// Header name for the mandatory body length.
	const CONTENT_LENGTH: &'static str = "Content-Length";
	/// Header name for the optional content type.
	const CONTENT_TYPE: &'static str = "Content-Type";

	/// Reads a complete JSON-RPC message from the input stream.
	pub async fn read(mut reader: impl futures::AsyncBufRead + Unpin) -> Result<Self> {
		let mut line = String::new();
		let mut content_len = None;
		loop {
			line.clear();
			reader.read_line(&mut line).await?;
			if line.is_empty() {
				return Err(Error::Eof);
			}
			if line == "\r\n" {
				break;
			}
			if line.len() > MAX_HEADER_LEN {
				return Err(Error::Transport(format!(
					"header line exceeds {MAX_HEADER_LEN} bytes"
				)));
			}
			// NB. LSP is stricter than HTTP here: the single space after the
			// colon is required and extra spaces are rejected.
			let (name, value) = line
				.strip_suffix("\r\n")
				.and_then(|line| line.split_once(": "))
				.ok_or_else(|| Error::Transport(format!("invalid header: {line:?}")))?;
			if name.eq_ignore_ascii_case(Self::CONTENT_LENGTH) {
				let value = value
					.parse::<usize>()
					.map_err(|_| Error::Transport(format!("invalid content-length: {value}")))?;
				content_len = Some(value);
			} else if name.eq_ignore_ascii_case(Self::CONTENT_TYPE) {
				check_content_type(value)?;
			}
		}
		let content_len =
			content_len.ok_or_else(|| Error::Transport("missing content-length".into()))?;
		let mut buf = vec![0u8; content_len];
		reader.read_exact(&mut buf).await.map_err(|err| {
			if err.kind() == std::io::ErrorKind::UnexpectedEof {
				Error::Transport(format!("stream ended inside a {content_len}-byte body"))
			} else {
				Error::Io(err)
			}
		})?;
		::tracing::trace!(msg = %String::from_utf8_lossy(&buf), "incoming");
		let frame = serde_json::from_slice::<RawFrame>(&buf)?;
		frame.try_into()
	}

	/// Serializes this message into one framed byte block, header included.
	pub fn to_wire(&self) -> Result<Vec<u8>> {
		let body = serde_json::to_string(self)?;
		::tracing::trace!(msg = %body, "outgoing");
		let mut wire = format!("{}: {}\r\n\r\n", Self::CONTENT_LENGTH, body.len()).into_bytes();
		wire.extend_from_slice(body.as_bytes());
		Ok(wire)
	}

	/// Writes this message to the output stream with framing headers.
	pub async fn write(&self, mut writer: impl futures::AsyncWrite + Unpin) -> Result<()> {
		let wire = self.to_wire()?;
		writer.write_all(&wire).await?;
		writer.flush().await?;
		Ok(())
	}
}

/// Accepts the default LSP content type with a UTF-8 charset.
fn check_content_type(value: &str) -> Result<()> {
	let Some(charset) = value.split(';').skip(1).find_map(|param| {
		let (key, value) = param.trim().split_once('=')?;
		key.eq_ignore_ascii_case("charset").then_some(value.trim())
	}) else {
		return Ok(());
	};
	if charset.eq_ignore_ascii_case("utf-8") || charset.eq_ignore_ascii_case("utf8") {
		Ok(())
	} else {
		Err(Error::Transport(format!("unsupported charset: {charset}")))
	}
}
