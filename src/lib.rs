//! Runtime core for a D language server.
//!
//! This crate owns everything between the editor's byte stream and the
//! language-analysis backends: `Content-Length`-framed JSON-RPC transport,
//! a request/notification router with multi-binding fan-in, a cooperative
//! single-threaded scheduler, cancellation and progress tracking, and the
//! live text-document model with UTF-16-correct position translation.
//!
//! The analysis backends themselves (completion, diagnostics, formatting,
//! symbol search) are opaque handler modules registered on the [`Router`];
//! external tools (`dub`, `dcd`, `dmd`, `dfmt`, `dscanner`) are reached
//! through the pooled transports in [`tools`].
//!
//! # Composition
//!
//! A server is a [`tower_service::Service`] stack driven by a [`MainLoop`]:
//!
//! ```no_run
//! use tower::ServiceBuilder;
//! use dls::concurrency::ConcurrencyLayer;
//! use dls::lifecycle::LifecycleLayer;
//! use dls::catch_unwind::CatchUnwindLayer;
//! use dls::server::Server;
//!
//! # async fn run() -> dls::Result<()> {
//! let (mainloop, _) = dls::MainLoop::new_server(|client| {
//! 	ServiceBuilder::new()
//! 		.layer(LifecycleLayer::default())
//! 		.layer(ConcurrencyLayer::default())
//! 		.layer(CatchUnwindLayer::default())
//! 		.service(Server::new_router(client))
//! });
//! let stdin = futures::io::Cursor::new(Vec::new());
//! let stdout = futures::io::sink();
//! mainloop.run_buffered(stdin, stdout).await
//! # }
//! ```
//!
//! `run` returning `Ok` corresponds to a clean `exit` after `shutdown`
//! (process exit code 0); any error, including [`Error::UncleanExit`], maps
//! to exit code 1.
#![warn(missing_docs)]

use std::ops::ControlFlow;

use serde_json::Value as JsonValue;
use tower_service::Service;

pub mod catch_unwind;
pub mod codec;
pub mod concurrency;
pub mod config;
pub mod document;
pub mod event;
mod forward;
pub mod lifecycle;
mod mainloop;
pub mod message;
pub mod position;
pub mod progress;
pub mod router;
pub mod server;
pub mod socket;
pub mod tools;
pub mod types;

pub use event::AnyEvent;
pub use mainloop::MainLoop;
pub use message::Message;
pub use router::Router;
pub use socket::{ClientSocket, ServerSocket};
pub use types::{AnyNotification, AnyRequest, AnyResponse, ErrorCode, RequestId, ResponseError};

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised by the transport and the main loop.
///
/// Per-request failures are [`ResponseError`]s and travel back to the peer;
/// this type is for conditions that concern the service as a whole.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
	/// The peer closed the channel or the main loop already returned.
	#[error("service stopped")]
	ServiceStopped,
	/// Message framing violated the wire format.
	#[error("transport error: {0}")]
	Transport(String),
	/// The input stream ended between messages.
	#[error("input stream ended")]
	Eof,
	/// Underlying stream failure.
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
	/// A message body failed to parse or serialize.
	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
	/// The peer violated the Language Server Protocol.
	#[error("protocol violation: {0}")]
	Protocol(String),
	/// The peer answered one of our requests with an error.
	#[error("{0}")]
	Response(#[from] ResponseError),
	/// A message had no usable route.
	#[error("routing error: {0}")]
	Routing(String),
	/// `exit` arrived before `shutdown` was acknowledged.
	#[error("exit received before shutdown")]
	UncleanExit,
}

/// The interface the [`MainLoop`] drives.
///
/// Requests go through [`Service::call`] and resolve concurrently on the
/// dispatch thread; notifications and internal events are dispatched
/// synchronously in wire order through [`LspService::notify`] and
/// [`LspService::emit`]. Returning [`ControlFlow::Break`] from either stops
/// the main loop with the carried result.
pub trait LspService: Service<AnyRequest, Response = JsonValue> {
	/// Handle an incoming notification, in wire order.
	fn notify(&mut self, notif: AnyNotification) -> ControlFlow<Result<()>>;

	/// Handle an internal event emitted through a socket handle.
	fn emit(&mut self, event: AnyEvent) -> ControlFlow<Result<()>>;
}

/// Macro to define getter methods for accessing inner service fields.
#[macro_export]
macro_rules! define_getters {
	(impl[$($generic:tt)*] $ty:ty, $field:ident : $field_ty:ty) => {
		impl<$($generic)*> $ty {
			/// Get a reference to the inner service.
			#[must_use]
			pub fn get_ref(&self) -> &$field_ty {
				&self.$field
			}

			/// Get a mutable reference to the inner service.
			#[must_use]
			pub fn get_mut(&mut self) -> &mut $field_ty {
				&mut self.$field
			}

			/// Consume self, returning the inner service.
			#[must_use]
			pub fn into_inner(self) -> $field_ty {
				self.$field
			}
		}
	};
}
