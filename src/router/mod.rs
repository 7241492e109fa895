//! Dispatch requests and notifications to individual handlers.
//!
//! A method name binds either to exactly one exclusive handler or to any
//! number of multi-bindings whose `Vec` results concatenate into one reply.
//! Multi-bound methods can stream each binding's chunk as a `$/progress`
//! notification when the request supplies a `partialResultToken`.
//!
//! The router never decodes parameters on its own: they stay raw slices
//! until the selected handler's wrapper decodes them, so unknown methods
//! and cancelled requests never pay for a parse.

use std::any::TypeId;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::{Future, ready};
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::StreamExt;
use futures::stream::FuturesOrdered;
use lsp_types::notification::Notification;
use lsp_types::request::Request;
use serde_json::Value as JsonValue;
use serde_json::value::RawValue;
use tower_service::Service;

use crate::progress::{ProgressRegistry, ProgressToken};
use crate::types::{AnyNotification, AnyRequest, ErrorCode, ResponseError};
use crate::{AnyEvent, ClientSocket, LspService, Result, codec};

/// Boxed future type for static dispatch.
pub type BoxFutureStatic<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Boxed future for request handlers.
type BoxReqFuture = BoxFutureStatic<Result<JsonValue, ResponseError>>;
/// Boxed async exclusive request handler.
type BoxReqHandler<St> = Box<dyn Fn(&mut St, AnyRequest) -> BoxReqFuture + Send>;
/// Boxed async multi-binding handler producing one chunk of elements.
type BoxMultiHandler<St> =
	Box<dyn Fn(&mut St, Option<&RawValue>) -> BoxFutureStatic<Result<Vec<JsonValue>, ResponseError>> + Send>;
/// Boxed sync notification handler.
type BoxNotifHandler<St> = Box<dyn Fn(&mut St, AnyNotification) -> ControlFlow<Result<()>> + Send>;
/// Boxed sync event subscriber.
type BoxEventHandler<St> = Box<dyn Fn(&mut St, &AnyEvent) -> Result<()> + Send>;
/// Hook fired on a request's result after the handler completes.
type PostHook = Arc<dyn Fn(&JsonValue) -> Result<()> + Send + Sync>;

/// Registration failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
	/// The method already has a binding that forbids another one.
	#[error("method `{0}` already has an exclusive binding")]
	Duplicate(&'static str),
	/// A multi-binding disagrees with the method's established element type.
	#[error("method `{method}` bindings disagree on element type: {existing} vs {new}")]
	IncompatibleElement {
		/// The method being registered.
		method: &'static str,
		/// Element type of the existing bindings.
		existing: &'static str,
		/// Element type of the rejected binding.
		new: &'static str,
	},
	/// A hook targeted a method with no binding.
	#[error("method `{0}` has no binding to hook")]
	NoSuchMethod(&'static str),
}

/// An exclusive request binding plus its post-hooks.
struct SingleEntry<St> {
	handler: BoxReqHandler<St>,
	hooks: Vec<PostHook>,
}

/// Concatenating request bindings plus their shared post-hooks.
struct MultiEntry<St> {
	bindings: Vec<BoxMultiHandler<St>>,
	/// Element type all bindings agreed on.
	element: TypeId,
	element_name: &'static str,
	hooks: Vec<PostHook>,
}

enum ReqEntry<St> {
	Single(SingleEntry<St>),
	Multi(MultiEntry<St>),
}

/// A router dispatching requests and notifications to individual handlers.
pub struct Router<St> {
	/// The router's state, passed to all handlers.
	state: St,
	/// Socket to the client, used for streaming partial results.
	client: ClientSocket,
	/// Live progress/partial token registry.
	progress: ProgressRegistry,
	/// Request bindings keyed by method name.
	req_handlers: HashMap<&'static str, ReqEntry<St>>,
	/// Notification handlers keyed by method name.
	notif_handlers: HashMap<&'static str, BoxNotifHandler<St>>,
	/// Event subscribers keyed by type, fired in registration order.
	event_handlers: HashMap<TypeId, Vec<BoxEventHandler<St>>>,
	/// Fallback handler for unhandled requests.
	unhandled_req: BoxReqHandler<St>,
}

impl<St> std::fmt::Debug for Router<St> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Router").finish_non_exhaustive()
	}
}

impl<St> Router<St> {
	/// Create a router around `state`.
	///
	/// The default fallback answers unknown methods with
	/// [`ErrorCode::METHOD_NOT_FOUND`].
	#[must_use]
	pub fn new(state: St, client: ClientSocket) -> Self {
		Self {
			state,
			client,
			progress: ProgressRegistry::new(),
			req_handlers: HashMap::new(),
			notif_handlers: HashMap::new(),
			event_handlers: HashMap::new(),
			unhandled_req: Box::new(|_, req| {
				Box::pin(ready(Err(ResponseError::new(
					ErrorCode::METHOD_NOT_FOUND,
					format!("no such method {}", req.method),
				))))
			}),
		}
	}

	/// The router's state.
	#[must_use]
	pub fn state(&self) -> &St {
		&self.state
	}

	/// The router's state, mutably.
	#[must_use]
	pub fn state_mut(&mut self) -> &mut St {
		&mut self.state
	}

	/// The socket to the client.
	#[must_use]
	pub fn client(&self) -> &ClientSocket {
		&self.client
	}

	/// The progress token registry shared with handlers.
	#[must_use]
	pub fn progress(&self) -> &ProgressRegistry {
		&self.progress
	}

	/// Names of all bound request methods.
	pub fn methods(&self) -> impl Iterator<Item = &'static str> + '_ {
		self.req_handlers.keys().copied()
	}

	/// Whether a request method has any binding.
	#[must_use]
	pub fn has_request(&self, method: &str) -> bool {
		self.req_handlers.contains_key(method)
	}

	/// Whether a notification method has a handler.
	#[must_use]
	pub fn has_notification(&self, method: &str) -> bool {
		self.notif_handlers.contains_key(method)
	}

	/// Add an asynchronous exclusive handler for request `R`.
	///
	/// Fails with [`RegisterError::Duplicate`] if the method is already
	/// bound in any way.
	pub fn request<R: Request, Fut>(
		&mut self,
		handler: impl Fn(&mut St, R::Params) -> Fut + Send + 'static,
	) -> Result<&mut Self, RegisterError>
	where
		Fut: Future<Output = Result<R::Result, ResponseError>> + Send + 'static,
	{
		match self.req_handlers.entry(R::METHOD) {
			Entry::Occupied(_) => Err(RegisterError::Duplicate(R::METHOD)),
			Entry::Vacant(slot) => {
				slot.insert(ReqEntry::Single(SingleEntry {
					handler: Box::new(move |state, req| {
						match codec::decode_params::<R::Params>(req.params.as_deref()) {
							Ok(params) => {
								let fut = handler(state, params);
								Box::pin(async move {
									serde_json::to_value(fut.await?).map_err(|err| {
										ResponseError::new(
											ErrorCode::INTERNAL_ERROR,
											format!("serializing result failed: {err}"),
										)
									})
								})
							}
							Err(err) => Box::pin(ready(Err(err))),
						}
					}),
					hooks: Vec::new(),
				}));
				Ok(self)
			}
		}
	}

	/// Add a concatenating handler for request `R` producing `Vec<T>`.
	///
	/// Any number of such bindings may share a method, as long as they agree
	/// on the element type `T`; their chunks concatenate in registration
	/// order. Fails with [`RegisterError::Duplicate`] when the method has an
	/// exclusive binding and [`RegisterError::IncompatibleElement`] when the
	/// element types disagree.
	pub fn request_many<R: Request, T, Fut>(
		&mut self,
		handler: impl Fn(&mut St, R::Params) -> Fut + Send + 'static,
	) -> Result<&mut Self, RegisterError>
	where
		T: serde::Serialize + Send + 'static,
		Fut: Future<Output = Result<Vec<T>, ResponseError>> + Send + 'static,
	{
		let binding: BoxMultiHandler<St> = Box::new(move |state, raw| {
			match codec::decode_params::<R::Params>(raw) {
				Ok(params) => {
					let fut = handler(state, params);
					Box::pin(async move {
						fut.await?
							.into_iter()
							.map(|item| {
								serde_json::to_value(item).map_err(|err| {
									ResponseError::new(
										ErrorCode::INTERNAL_ERROR,
										format!("serializing result element failed: {err}"),
									)
								})
							})
							.collect()
					})
				}
				Err(err) => Box::pin(ready(Err(err))),
			}
		});

		match self.req_handlers.entry(R::METHOD) {
			Entry::Occupied(mut slot) => match slot.get_mut() {
				ReqEntry::Single(_) => Err(RegisterError::Duplicate(R::METHOD)),
				ReqEntry::Multi(entry) => {
					if entry.element != TypeId::of::<T>() {
						return Err(RegisterError::IncompatibleElement {
							method: R::METHOD,
							existing: entry.element_name,
							new: std::any::type_name::<T>(),
						});
					}
					entry.bindings.push(binding);
					Ok(self)
				}
			},
			Entry::Vacant(slot) => {
				slot.insert(ReqEntry::Multi(MultiEntry {
					bindings: vec![binding],
					element: TypeId::of::<T>(),
					element_name: std::any::type_name::<T>(),
					hooks: Vec::new(),
				}));
				Ok(self)
			}
		}
	}

	/// Add a synchronous handler for notification `N`.
	///
	/// Notifications never produce responses; a parameter decode failure is
	/// logged and the notification dropped.
	pub fn notification<N: Notification>(
		&mut self,
		handler: impl Fn(&mut St, N::Params) -> ControlFlow<Result<()>> + Send + 'static,
	) -> Result<&mut Self, RegisterError>
	where
		N::Params: serde::de::DeserializeOwned,
	{
		match self.notif_handlers.entry(N::METHOD) {
			Entry::Occupied(_) => Err(RegisterError::Duplicate(N::METHOD)),
			Entry::Vacant(slot) => {
				slot.insert(Box::new(move |state, notif| {
					match codec::decode_params::<N::Params>(notif.params.as_deref()) {
						Ok(params) => handler(state, params),
						Err(err) => {
							tracing::warn!(method = %notif.method, error = %err, "dropping undecodable notification");
							ControlFlow::Continue(())
						}
					}
				}));
				Ok(self)
			}
		}
	}

	/// Attach a hook fired on `R`'s result after its handler completes.
	///
	/// Hook failures are logged and never alter the response.
	pub fn post_hook<R: Request>(
		&mut self,
		hook: impl Fn(&JsonValue) -> Result<()> + Send + Sync + 'static,
	) -> Result<&mut Self, RegisterError> {
		match self.req_handlers.get_mut(R::METHOD) {
			Some(ReqEntry::Single(entry)) => entry.hooks.push(Arc::new(hook)),
			Some(ReqEntry::Multi(entry)) => entry.hooks.push(Arc::new(hook)),
			None => return Err(RegisterError::NoSuchMethod(R::METHOD)),
		}
		Ok(self)
	}

	/// Subscribe to internal event `E`.
	///
	/// Subscribers fire in registration order; a failing subscriber is
	/// logged and does not stop the others.
	pub fn event<E: Send + 'static>(
		&mut self,
		handler: impl Fn(&mut St, &E) -> Result<()> + Send + 'static,
	) -> &mut Self {
		self.event_handlers
			.entry(TypeId::of::<E>())
			.or_default()
			.push(Box::new(move |state, event| {
				let event = event.downcast_ref::<E>().expect("checked TypeId");
				handler(state, event)
			}));
		self
	}

	/// Replace the catch-all handler for requests with no binding.
	///
	/// The default responds with [`ErrorCode::METHOD_NOT_FOUND`].
	pub fn unhandled_request<Fut>(
		&mut self,
		handler: impl Fn(&mut St, AnyRequest) -> Fut + Send + 'static,
	) -> &mut Self
	where
		Fut: Future<Output = Result<JsonValue, ResponseError>> + Send + 'static,
	{
		self.unhandled_req = Box::new(move |state, req| Box::pin(handler(state, req)));
		self
	}

	fn call_single(&mut self, req: AnyRequest) -> BoxReqFuture {
		let Some(ReqEntry::Single(entry)) = self.req_handlers.get(&*req.method) else {
			unreachable!("caller checked the entry kind");
		};
		let hooks = entry.hooks.clone();
		let method = req.method.clone();
		let fut = (entry.handler)(&mut self.state, req);
		if hooks.is_empty() {
			return fut;
		}
		Box::pin(async move {
			let value = fut.await?;
			run_hooks(&hooks, &method, &value);
			Ok(value)
		})
	}

	fn call_multi(&mut self, req: AnyRequest) -> BoxReqFuture {
		let Some(ReqEntry::Multi(entry)) = self.req_handlers.get(&*req.method) else {
			unreachable!("caller checked the entry kind");
		};
		let raw = req.params.as_deref();
		let token = raw.and_then(|raw| codec::decode_field::<ProgressToken>(raw, "partialResultToken"));
		let chunk_futs: Vec<_> = entry.bindings.iter().map(|binding| binding(&mut self.state, raw)).collect();
		let guard = token
			.clone()
			.map(|token| self.progress.register_partial(token, req.id.clone()));
		let hooks = entry.hooks.clone();
		let client = self.client.clone();
		let method = req.method;

		Box::pin(async move {
			// Dropped when this future is dropped or completes, after which
			// no chunk can be attributed to the token any more.
			let _guard = guard;
			let mut ordered: FuturesOrdered<_> = chunk_futs.into_iter().collect();
			let mut combined = Vec::new();
			let mut first_err: Option<ResponseError> = None;
			let mut any_ok = false;
			let mut index = 0usize;
			while let Some(chunk) = ordered.next().await {
				match chunk {
					Ok(items) => {
						any_ok = true;
						if let Some(token) = &token {
							stream_chunk(&client, token, &items);
						}
						combined.extend(items);
					}
					Err(err) => {
						// The first failure becomes the response only if no
						// binding succeeds; later failures are log-only.
						tracing::warn!(
							method = %method,
							binding = index,
							error = %err,
							"multi-binding handler failed"
						);
						if first_err.is_none() {
							first_err = Some(err);
						}
					}
				}
				index += 1;
			}
			if token.is_some() {
				// Suspend once so the streamed chunks reach the main loop
				// before the final response is assembled.
				drain_point().await;
			}
			if !any_ok && let Some(err) = first_err {
				return Err(err);
			}
			let value = JsonValue::Array(combined);
			run_hooks(&hooks, &method, &value);
			Ok(value)
		})
	}
}

/// Completes on the second poll, letting queued socket traffic drain first.
async fn drain_point() {
	let mut yielded = false;
	std::future::poll_fn(move |cx| {
		if yielded {
			Poll::Ready(())
		} else {
			yielded = true;
			cx.waker().wake_by_ref();
			Poll::Pending
		}
	})
	.await;
}

/// Streams one binding's chunk as a `$/progress` notification.
fn stream_chunk(client: &ClientSocket, token: &ProgressToken, items: &[JsonValue]) {
	let notif = match AnyNotification::from_value(
		"$/progress",
		serde_json::json!({ "token": token, "value": items }),
	) {
		Ok(notif) => notif,
		Err(err) => {
			tracing::warn!(error = %err, "failed to assemble partial result chunk");
			return;
		}
	};
	if client.notify_any(notif).is_err() {
		tracing::debug!("client socket closed while streaming partial results");
	}
}

fn run_hooks(hooks: &[PostHook], method: &str, value: &JsonValue) {
	for (index, hook) in hooks.iter().enumerate() {
		if let Err(err) = hook(value) {
			tracing::warn!(method = %method, hook = index, error = %err, "post-hook failed");
		}
	}
}

impl<St> Service<AnyRequest> for Router<St> {
	type Response = JsonValue;
	type Error = ResponseError;
	type Future = BoxReqFuture;

	fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		Poll::Ready(Ok(()))
	}

	fn call(&mut self, req: AnyRequest) -> Self::Future {
		enum Kind {
			Single,
			Multi,
			Unbound,
		}
		let kind = match self.req_handlers.get(&*req.method) {
			Some(ReqEntry::Single(_)) => Kind::Single,
			Some(ReqEntry::Multi(_)) => Kind::Multi,
			None => Kind::Unbound,
		};
		match kind {
			Kind::Single => self.call_single(req),
			Kind::Multi => self.call_multi(req),
			Kind::Unbound => (self.unhandled_req)(&mut self.state, req),
		}
	}
}

impl<St> LspService for Router<St> {
	fn notify(&mut self, notif: AnyNotification) -> ControlFlow<Result<()>> {
		match self.notif_handlers.get(&*notif.method) {
			Some(handler) => handler(&mut self.state, notif),
			None => {
				// Implementation-dependent `$/` traffic may be dropped
				// freely; anything else is worth a warning.
				if notif.method.starts_with("$/") {
					tracing::debug!(method = %notif.method, "ignoring optional notification");
				} else {
					tracing::warn!(method = %notif.method, "no handler for notification");
				}
				ControlFlow::Continue(())
			}
		}
	}

	fn emit(&mut self, event: AnyEvent) -> ControlFlow<Result<()>> {
		match self.event_handlers.get(&event.inner_type_id()) {
			Some(handlers) => {
				for (index, handler) in handlers.iter().enumerate() {
					if let Err(err) = handler(&mut self.state, &event) {
						tracing::warn!(
							event = event.type_name(),
							subscriber = index,
							error = %err,
							"event subscriber failed"
						);
					}
				}
			}
			None => tracing::debug!(event = event.type_name(), "event has no subscribers"),
		}
		ControlFlow::Continue(())
	}
}
