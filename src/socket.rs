//! Handles for talking to the peer from handler tasks.
//!
//! A socket is a cheap clonable sender into the main loop's event queue.
//! Handlers hold sockets instead of router references, so there is no cycle
//! between the registry and the code registered on it.

use futures::channel::{mpsc, oneshot};
use serde_json::Value as JsonValue;

use crate::event::AnyEvent;
use crate::message::Message;
use crate::types::{AnyNotification, AnyRequest, AnyResponse};
use crate::{Error, Result};

/// Events processed by the main loop between transport reads.
pub(crate) enum MainLoopEvent {
	/// Send a message to the peer.
	Outgoing(Message),
	/// Send a request to the peer and route the reply to the sender.
	///
	/// The main loop assigns the outgoing id.
	OutgoingRequest(AnyRequest, oneshot::Sender<AnyResponse>),
	/// Deliver an internal event to the service.
	Any(AnyEvent),
}

/// Inner shared sender for either socket direction.
#[derive(Debug, Clone)]
pub(crate) struct PeerSocket {
	pub(crate) tx: mpsc::UnboundedSender<MainLoopEvent>,
}

impl PeerSocket {
	/// Creates a socket whose main loop is already gone, for tests.
	pub(crate) fn new_closed() -> Self {
		let (tx, _rx) = mpsc::unbounded();
		Self { tx }
	}

	pub(crate) fn send(&self, event: MainLoopEvent) -> Result<()> {
		self.tx
			.unbounded_send(event)
			.map_err(|_| Error::ServiceStopped)
	}

	async fn request<R: lsp_types::request::Request>(&self, params: R::Params) -> Result<R::Result> {
		let req = AnyRequest::new::<R>(params)?;
		let (tx, rx) = oneshot::channel();
		self.send(MainLoopEvent::OutgoingRequest(req, tx))?;
		let resp = rx.await.map_err(|_| Error::ServiceStopped)?;
		match resp.error {
			None => Ok(serde_json::from_value(resp.result.unwrap_or(JsonValue::Null))?),
			Some(err) => Err(Error::Response(err)),
		}
	}

	fn notify<N: lsp_types::notification::Notification>(&self, params: N::Params) -> Result<()> {
		let notif = AnyNotification::new::<N>(params)?;
		self.send(MainLoopEvent::Outgoing(Message::Notification(notif)))
	}

	fn notify_any(&self, notif: AnyNotification) -> Result<()> {
		self.send(MainLoopEvent::Outgoing(Message::Notification(notif)))
	}

	fn emit<E: Send + 'static>(&self, event: E) -> Result<()> {
		self.send(MainLoopEvent::Any(AnyEvent::new(event)))
	}
}

macro_rules! define_socket {
	($(#[$doc:meta])* $name:ident) => {
		$(#[$doc])*
		#[derive(Debug, Clone)]
		pub struct $name(pub(crate) PeerSocket);

		impl $name {
			/// Creates a socket whose main loop is already gone.
			///
			/// Every operation fails with [`Error::ServiceStopped`]. Useful
			/// as a placeholder in tests.
			#[must_use]
			pub fn new_closed() -> Self {
				Self(PeerSocket::new_closed())
			}

			/// Sends a typed request to the peer and awaits the reply.
			pub async fn request<R: lsp_types::request::Request>(
				&self,
				params: R::Params,
			) -> Result<R::Result> {
				self.0.request::<R>(params).await
			}

			/// Sends a typed notification to the peer.
			pub fn notify<N: lsp_types::notification::Notification>(
				&self,
				params: N::Params,
			) -> Result<()> {
				self.0.notify::<N>(params)
			}

			/// Sends an already-assembled notification to the peer.
			///
			/// Used for payloads outside the typed schema, such as partial
			/// result `$/progress` chunks.
			pub fn notify_any(&self, notif: AnyNotification) -> Result<()> {
				self.0.notify_any(notif)
			}

			/// Emits an internal event back into the service.
			pub fn emit<E: Send + 'static>(&self, event: E) -> Result<()> {
				self.0.emit(event)
			}
		}
	};
}

define_socket! {
	/// Handle to the language client, held by server-side handlers.
	ClientSocket
}

define_socket! {
	/// Handle to the language server, held by client-side code.
	ServerSocket
}

#[cfg(test)]
mod tests;
