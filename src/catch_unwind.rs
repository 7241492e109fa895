//! Panic containment at the task boundary.
//!
//! A panicking handler is a logic bug, but it must not take the server
//! down: the panic is caught when the task's future is polled, logged, and
//! answered as [`ErrorCode::INTERNAL_ERROR`]. Panics in notification and
//! event handlers are caught the same way and dropped after logging.

use std::any::Any;
use std::future::Future;
use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::CatchUnwind;
use pin_project_lite::pin_project;
use tower_layer::Layer;
use tower_service::Service;

use crate::{AnyEvent, AnyNotification, AnyRequest, ErrorCode, LspService, ResponseError, Result};

/// The middleware catching panics in handlers.
///
/// See [module level documentation](self) for details.
pub struct CatchUnwindService<S> {
	/// The wrapped inner service.
	service: S,
}

crate::define_getters!(impl[S] CatchUnwindService<S>, service: S);

/// Renders a panic payload for logs and error messages.
fn panic_message(payload: &(dyn Any + Send)) -> &str {
	if let Some(msg) = payload.downcast_ref::<&'static str>() {
		msg
	} else if let Some(msg) = payload.downcast_ref::<String>() {
		msg
	} else {
		"unknown panic payload"
	}
}

impl<S: LspService> Service<AnyRequest> for CatchUnwindService<S>
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
		let method = req.method.clone();
		// The synchronous part of dispatch may panic too, not just the
		// returned future.
		match std::panic::catch_unwind(AssertUnwindSafe(|| self.service.call(req))) {
			Ok(fut) => ResponseFuture::Inner {
				fut: AssertUnwindSafe(fut).catch_unwind(),
				method,
			},
			Err(payload) => {
				tracing::error!(
					method = %method,
					panic = panic_message(payload.as_ref()),
					"handler dispatch panicked"
				);
				ResponseFuture::Panicked {
					error: Some(internal_error(payload.as_ref())),
				}
			}
		}
	}
}

fn internal_error(payload: &(dyn Any + Send)) -> ResponseError {
	ResponseError::new(
		ErrorCode::INTERNAL_ERROR,
		format!("handler panicked: {}", panic_message(payload)),
	)
}

pin_project! {
	/// The [`Future`] type used by the [`CatchUnwindService`] middleware.
	#[project = ResponseFutureProj]
	pub enum ResponseFuture<Fut> {
		/// The dispatch succeeded; panics inside the future are caught here.
		Inner {
			#[pin]
			fut: CatchUnwind<AssertUnwindSafe<Fut>>,
			method: String,
		},
		/// The dispatch itself panicked.
		Panicked {
			error: Option<ResponseError>,
		},
	}
}

impl<Fut, Response, Error> Future for ResponseFuture<Fut>
where
	Fut: Future<Output = Result<Response, Error>>,
	Error: From<ResponseError>,
{
	type Output = Result<Response, Error>;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		match self.project() {
			ResponseFutureProj::Inner { fut, method } => match std::task::ready!(fut.poll(cx)) {
				Ok(output) => Poll::Ready(output),
				Err(payload) => {
					tracing::error!(
						method = %method,
						panic = panic_message(payload.as_ref()),
						"handler panicked"
					);
					Poll::Ready(Err(internal_error(payload.as_ref()).into()))
				}
			},
			ResponseFutureProj::Panicked { error } => Poll::Ready(Err(error
				.take()
				.expect("future polled after completion")
				.into())),
		}
	}
}

impl<S: LspService> LspService for CatchUnwindService<S>
where
	S::Error: From<ResponseError>,
{
	fn notify(&mut self, notif: AnyNotification) -> ControlFlow<Result<()>> {
		let method = notif.method.clone();
		match std::panic::catch_unwind(AssertUnwindSafe(|| self.service.notify(notif))) {
			Ok(ctl) => ctl,
			Err(payload) => {
				tracing::error!(
					method = %method,
					panic = panic_message(payload.as_ref()),
					"notification handler panicked"
				);
				ControlFlow::Continue(())
			}
		}
	}

	fn emit(&mut self, event: AnyEvent) -> ControlFlow<Result<()>> {
		match std::panic::catch_unwind(AssertUnwindSafe(|| self.service.emit(event))) {
			Ok(ctl) => ctl,
			Err(payload) => {
				tracing::error!(
					panic = panic_message(payload.as_ref()),
					"event handler panicked"
				);
				ControlFlow::Continue(())
			}
		}
	}
}

/// The builder of [`CatchUnwindService`] middleware.
#[derive(Clone, Debug, Default)]
#[must_use]
pub struct CatchUnwindBuilder {
	_private: (),
}

impl CatchUnwindBuilder {
	/// Create the middleware builder.
	pub fn new() -> Self {
		Self::default()
	}
}

/// A type alias of [`CatchUnwindBuilder`] conforming to the naming
/// convention of [`tower_layer`].
pub type CatchUnwindLayer = CatchUnwindBuilder;

impl<S> Layer<S> for CatchUnwindBuilder {
	type Service = CatchUnwindService<S>;

	fn layer(&self, inner: S) -> Self::Service {
		CatchUnwindService { service: inner }
	}
}

#[cfg(test)]
mod tests {
	use serde_json::Value as JsonValue;

	use super::*;

	struct Panicky;

	impl Service<AnyRequest> for Panicky {
		type Response = JsonValue;
		type Error = ResponseError;
		type Future = crate::router::BoxFutureStatic<Result<JsonValue, ResponseError>>;

		fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
			Poll::Ready(Ok(()))
		}

		fn call(&mut self, _req: AnyRequest) -> Self::Future {
			Box::pin(async { panic!("boom in the future") })
		}
	}

	impl LspService for Panicky {
		fn notify(&mut self, _notif: AnyNotification) -> ControlFlow<Result<()>> {
			panic!("boom in notify")
		}

		fn emit(&mut self, _event: AnyEvent) -> ControlFlow<Result<()>> {
			ControlFlow::Continue(())
		}
	}

	#[tokio::test]
	async fn panicking_request_answers_internal_error() {
		let mut service = CatchUnwindLayer::default().layer(Panicky);
		let err = service
			.call(AnyRequest {
				id: crate::RequestId::Number(1),
				method: "test/panic".into(),
				params: None,
			})
			.await
			.unwrap_err();
		assert_eq!(err.code, ErrorCode::INTERNAL_ERROR);
		assert!(err.message.contains("boom in the future"), "{}", err.message);
	}

	#[tokio::test]
	async fn panicking_notification_is_swallowed() {
		let mut service = CatchUnwindLayer::default().layer(Panicky);
		let ctl = service.notify(AnyNotification {
			method: "test/panic".into(),
			params: None,
		});
		assert!(ctl.is_continue());
	}
}
