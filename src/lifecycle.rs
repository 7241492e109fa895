//! Server lifecycle gating: initialize, initialized, shutdown, exit.
//!
//! Sits outermost in the middleware stack so lifecycle violations are
//! rejected before any other layer spends work on them. The state machine:
//!
//! ```text
//! Uninitialized --initialize--> Initializing --initialized--> Ready
//! (any state)   --shutdown---> ShuttingDown --exit--> loop ends cleanly
//! ```
//!
//! `exit` outside `ShuttingDown` ends the main loop with
//! [`Error::UncleanExit`], which the embedding binary maps to exit code 1;
//! a clean exit maps to exit code 0.

use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::task::{Context, Poll};

use lsp_types::notification::{self, Notification};
use lsp_types::request::{self, Request};
use pin_project_lite::pin_project;
use tower_layer::Layer;
use tower_service::Service;

use crate::{
	AnyEvent, AnyNotification, AnyRequest, Error, ErrorCode, LspService, ResponseError, Result,
};

/// Lifecycle states of a language server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerState {
	/// No `initialize` request seen yet.
	#[default]
	Uninitialized,
	/// `initialize` dispatched, waiting for the `initialized` notification.
	Initializing,
	/// Normal operation.
	Ready,
	/// `shutdown` dispatched; only `exit` is honored.
	ShuttingDown,
}

/// The lifecycle gating middleware.
///
/// See [module level documentation](self) for details.
pub struct Lifecycle<S> {
	/// The wrapped inner service.
	service: S,
	/// Current lifecycle state.
	state: ServerState,
}

crate::define_getters!(impl[S] Lifecycle<S>, service: S);

impl<S> Lifecycle<S> {
	/// The current lifecycle state.
	#[must_use]
	pub fn state(&self) -> ServerState {
		self.state
	}
}

impl<S: LspService> Service<AnyRequest> for Lifecycle<S>
where
	S::Error: From<ResponseError>,
{
	type Response = S::Response;
	type Error = S::Error;
	type Future = ResponseFuture<S::Future>;

	fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		self.service.poll_ready(cx)
	}

	fn call(&mut self, req: AnyRequest) -> Self::Future {
		let reject = |code, message: &str| ResponseFuture::Reject {
			error: Some(ResponseError::new(code, message)),
		};
		// `shutdown` transitions from any state; everything else is gated.
		if req.method == request::Shutdown::METHOD {
			self.state = ServerState::ShuttingDown;
			return ResponseFuture::Inner {
				fut: self.service.call(req),
			};
		}
		match self.state {
			ServerState::Uninitialized => {
				if req.method == request::Initialize::METHOD {
					self.state = ServerState::Initializing;
					ResponseFuture::Inner {
						fut: self.service.call(req),
					}
				} else {
					reject(ErrorCode::SERVER_NOT_INITIALIZED, "server is not initialized")
				}
			}
			ServerState::Initializing => {
				if req.method == request::Initialize::METHOD {
					reject(ErrorCode::INVALID_REQUEST, "initialize may only be sent once")
				} else {
					reject(ErrorCode::SERVER_NOT_INITIALIZED, "server is still initializing")
				}
			}
			ServerState::Ready => {
				if req.method == request::Initialize::METHOD {
					reject(ErrorCode::INVALID_REQUEST, "initialize may only be sent once")
				} else {
					ResponseFuture::Inner {
						fut: self.service.call(req),
					}
				}
			}
			ServerState::ShuttingDown => {
				reject(ErrorCode::INVALID_REQUEST, "server is shutting down")
			}
		}
	}
}

impl<S: LspService> LspService for Lifecycle<S>
where
	S::Error: From<ResponseError>,
{
	fn notify(&mut self, notif: AnyNotification) -> ControlFlow<Result<()>> {
		match &*notif.method {
			method if method == notification::Initialized::METHOD => {
				if self.state == ServerState::Initializing {
					self.state = ServerState::Ready;
				} else {
					tracing::warn!(state = ?self.state, "unexpected initialized notification");
				}
				self.service.notify(notif)
			}
			method if method == notification::Exit::METHOD => {
				if self.state == ServerState::ShuttingDown {
					ControlFlow::Break(Ok(()))
				} else {
					ControlFlow::Break(Err(Error::UncleanExit))
				}
			}
			_ => {
				if self.state == ServerState::ShuttingDown {
					// Only `exit` is honored past shutdown.
					tracing::debug!(method = %notif.method, "dropping notification during shutdown");
					return ControlFlow::Continue(());
				}
				self.service.notify(notif)
			}
		}
	}

	fn emit(&mut self, event: AnyEvent) -> ControlFlow<Result<()>> {
		self.service.emit(event)
	}
}

pin_project! {
	/// The [`Future`] type used by the [`Lifecycle`] middleware.
	#[project = ResponseFutureProj]
	pub enum ResponseFuture<Fut> {
		/// The request passed the gate and runs on the inner service.
		Inner {
			#[pin]
			fut: Fut,
		},
		/// The request was rejected by the gate.
		Reject {
			error: Option<ResponseError>,
		},
	}
}

impl<Fut, Response, Error> Future for ResponseFuture<Fut>
where
	Fut: Future<Output = Result<Response, Error>>,
	Error: From<ResponseError>,
{
	type Output = Fut::Output;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		match self.project() {
			ResponseFutureProj::Inner { fut } => fut.poll(cx),
			ResponseFutureProj::Reject { error } => {
				Poll::Ready(Err(error.take().expect("future polled after completion").into()))
			}
		}
	}
}

/// The builder of [`Lifecycle`] middleware.
#[derive(Clone, Debug, Default)]
#[must_use]
pub struct LifecycleBuilder {
	_private: (),
}

impl LifecycleBuilder {
	/// Create the middleware builder.
	pub fn new() -> Self {
		Self::default()
	}
}

/// A type alias of [`LifecycleBuilder`] conforming to the naming convention
/// of [`tower_layer`].
pub type LifecycleLayer = LifecycleBuilder;

impl<S> Layer<S> for LifecycleBuilder {
	type Service = Lifecycle<S>;

	fn layer(&self, inner: S) -> Self::Service {
		Lifecycle {
			service: inner,
			state: ServerState::Uninitialized,
		}
	}
}

#[cfg(test)]
mod tests {
	use std::future::ready;

	use serde_json::Value as JsonValue;

	use super::*;

	/// Inner service answering every request with `true`.
	struct Echo;

	impl Service<AnyRequest> for Echo {
		type Response = JsonValue;
		type Error = ResponseError;
		type Future = std::future::Ready<Result<JsonValue, ResponseError>>;

		fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
			Poll::Ready(Ok(()))
		}

		fn call(&mut self, _req: AnyRequest) -> Self::Future {
			ready(Ok(JsonValue::Bool(true)))
		}
	}

	impl LspService for Echo {
		fn notify(&mut self, _notif: AnyNotification) -> ControlFlow<Result<()>> {
			ControlFlow::Continue(())
		}

		fn emit(&mut self, _event: AnyEvent) -> ControlFlow<Result<()>> {
			ControlFlow::Continue(())
		}
	}

	fn request(method: &str) -> AnyRequest {
		AnyRequest {
			id: crate::RequestId::Number(1),
			method: method.into(),
			params: None,
		}
	}

	fn notification(method: &str) -> AnyNotification {
		AnyNotification {
			method: method.into(),
			params: None,
		}
	}

	#[tokio::test]
	async fn requests_before_initialize_are_rejected() {
		let mut service = LifecycleLayer::default().layer(Echo);
		let err = service.call(request("textDocument/hover")).await.unwrap_err();
		assert_eq!(err.code, ErrorCode::SERVER_NOT_INITIALIZED);
		assert_eq!(service.state(), ServerState::Uninitialized);
	}

	#[tokio::test]
	async fn the_happy_path_reaches_ready() {
		let mut service = LifecycleLayer::default().layer(Echo);
		service.call(request("initialize")).await.unwrap();
		assert_eq!(service.state(), ServerState::Initializing);

		assert!(service.notify(notification("initialized")).is_continue());
		assert_eq!(service.state(), ServerState::Ready);

		service.call(request("textDocument/hover")).await.unwrap();
	}

	#[tokio::test]
	async fn initialize_twice_is_invalid() {
		let mut service = LifecycleLayer::default().layer(Echo);
		service.call(request("initialize")).await.unwrap();
		let err = service.call(request("initialize")).await.unwrap_err();
		assert_eq!(err.code, ErrorCode::INVALID_REQUEST);
	}

	#[tokio::test]
	async fn shutdown_gates_everything_but_exit() {
		let mut service = LifecycleLayer::default().layer(Echo);
		service.call(request("initialize")).await.unwrap();
		assert!(service.notify(notification("initialized")).is_continue());
		service.call(request("shutdown")).await.unwrap();
		assert_eq!(service.state(), ServerState::ShuttingDown);

		let err = service.call(request("textDocument/hover")).await.unwrap_err();
		assert_eq!(err.code, ErrorCode::INVALID_REQUEST);

		assert!(matches!(
			service.notify(notification("exit")),
			ControlFlow::Break(Ok(()))
		));
	}

	#[tokio::test]
	async fn exit_without_shutdown_is_unclean() {
		let mut service = LifecycleLayer::default().layer(Echo);
		assert!(matches!(
			service.notify(notification("exit")),
			ControlFlow::Break(Err(Error::UncleanExit))
		));
	}
}
