//! The dispatch loop that turns a service stack into a running peer.
//!
//! Everything happens on one task: frames come off the transport, handler
//! futures make progress, and outgoing traffic leaves, all interleaved at
//! await points. Shared state therefore only ever mutates between
//! suspension points, notifications run synchronously in wire order, and a
//! notification that arrived before a request is handled before that
//! request's task exists.
//!
//! Outgoing traffic is staged in an outbox with a single write in flight
//! at any time. The loop prefers finishing that write over everything
//! else, drains socket events (progress chunks, server-to-client traffic)
//! next, then collects finished handler tasks, and only then reads more
//! input. The write-first bias is what back-pressures a flooding client;
//! the events-before-tasks bias is what keeps a handler's streamed output
//! ahead of its own response on the wire.

use std::collections::{HashMap, VecDeque};
use std::future::{Future, poll_fn};
use std::ops::ControlFlow;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use futures::channel::{mpsc, oneshot};
use futures::future::{Fuse, FusedFuture};
use futures::io::BufReader;
use futures::stream::FuturesUnordered;
use futures::{
	AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, FutureExt, StreamExt, pin_mut, select_biased,
};
use pin_project_lite::pin_project;
use serde_json::Value as JsonValue;

use crate::message::Message;
use crate::socket::{MainLoopEvent, PeerSocket};
use crate::types::{AnyRequest, AnyResponse, RequestId, ResponseError};
use crate::{ClientSocket, LspService, Result, ServerSocket};

/// Drives an [`LspService`] against a byte-stream peer.
///
/// Works for both directions: a language server driven by an editor, or a
/// client stack driving a remote server.
pub struct MainLoop<S: LspService> {
	/// The service stack handling the peer's traffic.
	service: S,
	/// Traffic queued by socket handles: outgoing messages and events.
	events: mpsc::UnboundedReceiver<MainLoopEvent>,
	/// Requests in flight, in both directions.
	pending: PendingRequests<S::Future>,
}

crate::define_getters!(impl[S: LspService] MainLoop<S>, service: S);

/// Open requests: the replies we owe the peer and the ones it owes us.
struct PendingRequests<Fut> {
	/// Handler futures for requests the peer sent; each resolves to the
	/// response we owe.
	ours: FuturesUnordered<PendingReply<Fut>>,
	/// Reply channels for requests we sent, keyed by the id we assigned.
	theirs: HashMap<RequestId, oneshot::Sender<AnyResponse>>,
	/// Source of ids for outgoing requests.
	id_counter: i64,
}

impl<Fut> PendingRequests<Fut> {
	fn new() -> Self {
		Self {
			ours: FuturesUnordered::new(),
			theirs: HashMap::new(),
			id_counter: 0,
		}
	}

	/// Starts tracking a request we owe an answer for.
	fn begin_ours(&mut self, id: RequestId, work: Fut) {
		self.ours.push(PendingReply { id: Some(id), work });
	}

	/// Stamps an outgoing request with a fresh id and parks its reply
	/// channel until the peer answers.
	fn begin_theirs(&mut self, req: &mut AnyRequest, reply_to: oneshot::Sender<AnyResponse>) {
		req.id = RequestId::Number(self.id_counter);
		self.id_counter += 1;
		let stale = self.theirs.insert(req.id.clone(), reply_to);
		debug_assert!(stale.is_none(), "outgoing ids are never reused");
	}

	/// Routes the peer's response to whoever sent the request.
	fn settle_theirs(&mut self, resp: AnyResponse) {
		match self.theirs.remove(&resp.id) {
			// A dropped receiver just means the requester gave up waiting.
			Some(reply_to) => drop(reply_to.send(resp)),
			None => tracing::debug!(id = %resp.id, "response for an unknown request"),
		}
	}
}

impl<S> MainLoop<S>
where
	S: LspService<Response = JsonValue>,
	ResponseError: From<S::Error>,
{
	/// Creates a main loop for a language server.
	///
	/// The builder receives the [`ClientSocket`] handlers will talk through.
	#[must_use]
	pub fn new_server(build: impl FnOnce(ClientSocket) -> S) -> (Self, ClientSocket) {
		let (this, peer) = Self::bootstrap(|peer| build(ClientSocket(peer)));
		(this, ClientSocket(peer))
	}

	/// Creates a main loop for a language client.
	#[must_use]
	pub fn new_client(build: impl FnOnce(ServerSocket) -> S) -> (Self, ServerSocket) {
		let (this, peer) = Self::bootstrap(|peer| build(ServerSocket(peer)));
		(this, ServerSocket(peer))
	}

	fn bootstrap(build: impl FnOnce(PeerSocket) -> S) -> (Self, PeerSocket) {
		let (tx, events) = mpsc::unbounded();
		let peer = PeerSocket { tx };
		let this = Self {
			service: build(peer.clone()),
			events,
			pending: PendingRequests::new(),
		};
		(this, peer)
	}

	/// Like [`MainLoop::run`], wrapping a plain `AsyncRead` in a
	/// [`BufReader`] first.
	#[allow(clippy::missing_errors_doc, reason = "errors documented in Self::run")]
	pub async fn run_buffered(self, input: impl AsyncRead, output: impl AsyncWrite) -> Result<()> {
		self.run(BufReader::new(input), output).await
	}

	/// Runs the loop until the service stops it or the transport fails.
	///
	/// `Ok(())` means the service broke the loop cleanly, which for a
	/// server is `exit` after an acknowledged `shutdown`; the embedding
	/// binary maps that to exit code 0 and everything else, including
	/// [`Error::UncleanExit`](crate::Error::UncleanExit), to exit code 1.
	///
	/// # Errors
	///
	/// - `Error::Io`/`Error::Transport`/`Error::Eof` on stream failures and
	///   framing violations.
	/// - `Error::Json` on undecodable message bodies.
	/// - `Error::Protocol` on protocol violations.
	/// - Whatever the service breaks the loop with.
	pub async fn run(mut self, input: impl AsyncBufRead, output: impl AsyncWrite) -> Result<()> {
		pin_mut!(input, output);
		// The in-flight read lives inside this stream, so a frame arriving
		// in pieces keeps its progress across loop iterations.
		let frames = futures::stream::unfold(input, |mut reader| async {
			let frame = Message::read(&mut reader).await;
			Some((frame, reader))
		});
		pin_mut!(frames);

		let mut outbox: VecDeque<Message> = VecDeque::new();
		let mut write_fut = Fuse::terminated();
		// A request the service was not yet ready to accept. While one is
		// parked, no further frames are read, which is exactly what keeps
		// wire order intact.
		let mut parked: Option<AnyRequest> = None;

		let ret = loop {
			if write_fut.is_terminated()
				&& let Some(frame) = outbox.pop_front()
			{
				match frame.to_wire() {
					Ok(wire) => write_fut = transmit(&mut output, wire).fuse(),
					Err(err) => break Err(err),
				}
			}

			let step = if parked.is_some() {
				// Waiting for the service to accept the parked request.
				// Writes, socket events, and finishing handlers all keep
				// moving; a stalled write here could otherwise deadlock a
				// service that waits on a reply we have not sent yet.
				select_biased! {
					sent = write_fut => flatten_write(sent),
					event = self.events.next() => {
						self.on_event(event.expect("a socket handle outlives the loop"), &mut outbox)
					}
					reply = self.pending.ours.select_next_some() => {
						outbox.push_back(Message::Response(reply));
						ControlFlow::Continue(())
					}
					readiness = poll_fn(|cx| self.service.poll_ready(cx)).fuse() => {
						let req = parked.take().expect("checked above");
						self.admit(req, readiness, &mut outbox);
						ControlFlow::Continue(())
					}
				}
			} else {
				select_biased! {
					sent = write_fut => flatten_write(sent),
					event = self.events.next() => {
						self.on_event(event.expect("a socket handle outlives the loop"), &mut outbox)
					}
					reply = self.pending.ours.select_next_some() => {
						outbox.push_back(Message::Response(reply));
						ControlFlow::Continue(())
					}
					frame = frames.next() => {
						match frame.expect("the frame stream never ends") {
							Ok(frame) => match self.on_frame(frame) {
								ControlFlow::Continue(request) => {
									parked = request;
									ControlFlow::Continue(())
								}
								ControlFlow::Break(result) => ControlFlow::Break(result),
							},
							Err(err) => ControlFlow::Break(Err(err)),
						}
					}
				}
			};
			if let ControlFlow::Break(result) = step {
				break result;
			}
		};

		// Messages still queued past this point have nobody to read them.
		let closed = output.close().await.map_err(crate::Error::from);
		ret.and(closed)
	}

	/// Hands a frame to the service. Requests come back to be parked until
	/// the service admits them.
	fn on_frame(&mut self, frame: Message) -> ControlFlow<Result<()>, Option<AnyRequest>> {
		match frame {
			Message::Request(req) => ControlFlow::Continue(Some(req)),
			Message::Response(resp) => {
				self.pending.settle_theirs(resp);
				ControlFlow::Continue(None)
			}
			Message::Notification(notif) => {
				self.service.notify(notif)?;
				ControlFlow::Continue(None)
			}
		}
	}

	/// Dispatches a previously parked request once readiness is decided.
	fn admit(
		&mut self,
		req: AnyRequest,
		readiness: Result<(), S::Error>,
		outbox: &mut VecDeque<Message>,
	) {
		match readiness {
			Ok(()) => {
				let id = req.id.clone();
				let work = self.service.call(req);
				self.pending.begin_ours(id, work);
			}
			Err(err) => outbox.push_back(Message::Response(AnyResponse {
				id: req.id,
				result: None,
				error: Some(err.into()),
			})),
		}
	}

	/// Applies one socket event: queue outgoing traffic or surface an
	/// internal event to the service.
	fn on_event(&mut self, event: MainLoopEvent, outbox: &mut VecDeque<Message>) -> ControlFlow<Result<()>> {
		match event {
			MainLoopEvent::Outgoing(msg) => outbox.push_back(msg),
			MainLoopEvent::OutgoingRequest(mut req, reply_to) => {
				self.pending.begin_theirs(&mut req, reply_to);
				outbox.push_back(Message::Request(req));
			}
			MainLoopEvent::Any(event) => self.service.emit(event)?,
		}
		ControlFlow::Continue(())
	}
}

/// Maps a finished write into a loop step.
fn flatten_write(sent: Result<()>) -> ControlFlow<Result<()>> {
	match sent {
		Ok(()) => ControlFlow::Continue(()),
		Err(err) => ControlFlow::Break(Err(err)),
	}
}

/// Starts writing one framed message to the transport.
fn transmit<W: AsyncWrite + Unpin>(writer: &mut W, wire: Vec<u8>) -> Transmit<'_, W> {
	Transmit {
		writer,
		wire,
		sent: 0,
	}
}

/// Drains one frame's bytes into the writer, then flushes.
///
/// Written by hand instead of chaining `write_all`/`flush` so the future
/// stays `Unpin` and can persist across `select_biased!` rounds by name.
struct Transmit<'a, W: ?Sized> {
	writer: &'a mut W,
	wire: Vec<u8>,
	sent: usize,
}

impl<W: AsyncWrite + Unpin + ?Sized> Future for Transmit<'_, W> {
	type Output = Result<()>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let this = &mut *self;
		while this.sent < this.wire.len() {
			let n = ready!(Pin::new(&mut *this.writer).poll_write(cx, &this.wire[this.sent..]))?;
			if n == 0 {
				return Poll::Ready(Err(crate::Error::Io(
					std::io::ErrorKind::WriteZero.into(),
				)));
			}
			this.sent += n;
		}
		ready!(Pin::new(&mut *this.writer).poll_flush(cx))?;
		Poll::Ready(Ok(()))
	}
}

pin_project! {
	/// A handler future paired with the id its response must carry.
	struct PendingReply<Fut> {
		#[pin]
		work: Fut,
		id: Option<RequestId>,
	}
}

impl<Fut, Error> Future for PendingReply<Fut>
where
	Fut: Future<Output = Result<JsonValue, Error>>,
	ResponseError: From<Error>,
{
	type Output = AnyResponse;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let this = self.project();
		let outcome = ready!(this.work.poll(cx));
		let id = this.id.take().expect("a reply is produced exactly once");
		Poll::Ready(match outcome {
			Ok(value) => AnyResponse {
				id,
				result: Some(value),
				error: None,
			},
			Err(err) => AnyResponse {
				id,
				result: None,
				error: Some(err.into()),
			},
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::Error;

	fn _run_future_is_send<S>(
		mainloop: MainLoop<S>,
		input: impl AsyncBufRead + Send,
		output: impl AsyncWrite + Send,
	) -> impl Send
	where
		S: LspService<Response = JsonValue> + Send,
		S::Future: Send,
		S::Error: From<Error> + Send,
		ResponseError: From<S::Error>,
	{
		mainloop.run(input, output)
	}
}
