//! Incoming request multiplexing limits, cancellation, and soft deadlines.
//!
//! The [`crate::MainLoop`] already polls every in-flight request
//! concurrently; this middleware adds what the main loop cannot know:
//! 1. A cap on concurrent incoming requests (`max_concurrency`).
//! 2. Cancellation of in-flight requests via `$/cancelRequest`.
//! 3. Per-method soft deadlines that cancel a request and log a warning.
//!
//! Cancellation is cooperative: the flag is observed when the request's
//! future is next polled, i.e. at its next suspension point. A cancelled
//! or expired request answers with [`ErrorCode::REQUEST_CANCELLED`].

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::thread::available_parallelism;
use std::time::{Duration, Instant};

use lsp_types::notification::{self, Notification};
use pin_project_lite::pin_project;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tower_layer::Layer;
use tower_service::Service;

use crate::types::RequestId;
use crate::{AnyEvent, AnyNotification, AnyRequest, ErrorCode, LspService, ResponseError, Result};

/// Cancellation flag shared between the in-flight table and the future.
struct CancelState {
	notify: Notify,
	done: AtomicBool,
	cancelled: AtomicBool,
}

/// Marks the in-flight entry completed when the future finishes or drops.
struct DoneSignaller(Arc<CancelState>);

impl Drop for DoneSignaller {
	fn drop(&mut self) {
		self.0.done.store(true, Ordering::Relaxed);
	}
}

type PermitFuture =
	crate::router::BoxFutureStatic<Result<OwnedSemaphorePermit, tokio::sync::AcquireError>>;
type CancelFuture = crate::router::BoxFutureStatic<()>;

/// The middleware for request multiplexing limits, cancellation, and
/// deadlines.
///
/// See [module level documentation](self) for details.
pub struct Concurrency<S> {
	/// The wrapped inner service.
	service: S,
	/// Maximum number of concurrent requests allowed.
	max_concurrency: NonZeroUsize,
	/// Per-method soft deadlines.
	deadlines: Arc<HashMap<String, Duration>>,
	/// Semaphore for limiting concurrency.
	semaphore: Arc<Semaphore>,
	/// Pending permit acquisition.
	ready_fut: Option<PermitFuture>,
	/// Acquired permit for the next call.
	ready_permit: Option<OwnedSemaphorePermit>,
	/// In-flight requests keyed by id.
	ongoing: HashMap<RequestId, Arc<CancelState>>,
}

crate::define_getters!(impl[S] Concurrency<S>, service: S);

impl<S: LspService> Service<AnyRequest> for Concurrency<S>
where
	S::Error: From<ResponseError>,
{
	type Response = S::Response;
	type Error = S::Error;
	type Future = ResponseFuture<S::Future>;

	fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		if self.ready_permit.is_some() {
			return Poll::Ready(Ok(()));
		}

		if self.ready_fut.is_none() {
			let sema = self.semaphore.clone();
			self.ready_fut = Some(Box::pin(async move { sema.acquire_owned().await }));
		}

		let fut = self.ready_fut.as_mut().expect("set above");
		match fut.as_mut().poll(cx) {
			Poll::Pending => Poll::Pending,
			Poll::Ready(Ok(permit)) => {
				self.ready_fut = None;
				self.ready_permit = Some(permit);
				Poll::Ready(Ok(()))
			}
			Poll::Ready(Err(_)) => {
				// The semaphore never closes in a normal lifecycle.
				Poll::Ready(Err(ResponseError::new(
					ErrorCode::INTERNAL_ERROR,
					"concurrency semaphore closed",
				)
				.into()))
			}
		}
	}

	fn call(&mut self, req: AnyRequest) -> Self::Future {
		let permit = self
			.ready_permit
			.take()
			.expect("poll_ready not called before call");

		// Purge completed entries once the table grows past the cap.
		if self.ongoing.len() >= self.max_concurrency.get() * 2 {
			self.ongoing.retain(|_, st| !st.done.load(Ordering::Relaxed));
		}

		let st = Arc::new(CancelState {
			notify: Notify::new(),
			done: AtomicBool::new(false),
			cancelled: AtomicBool::new(false),
		});
		self.ongoing.insert(req.id.clone(), st.clone());

		// The waiter must survive across polls, otherwise a later
		// `notify_waiters` finds nobody to wake and the cancelled task
		// sleeps forever.
		let waiter = st.clone();
		let cancel_fut: CancelFuture = Box::pin(async move { waiter.notify.notified().await });

		let deadline = self
			.deadlines
			.get(&req.method)
			.map(|timeout| (Box::pin(tokio::time::sleep(*timeout)), *timeout));
		let method = req.method.clone();
		let started_at = Instant::now();

		let fut = self.service.call(req);
		ResponseFuture {
			fut,
			method,
			started_at,
			deadline,
			cancel_fut,
			_permit: permit,
			st: st.clone(),
			_signaller: DoneSignaller(st),
		}
	}
}

pin_project! {
	/// The [`Future`] type used by the [`Concurrency`] middleware.
	pub struct ResponseFuture<Fut> {
		#[pin]
		fut: Fut,
		method: String,
		started_at: Instant,
		deadline: Option<(Pin<Box<tokio::time::Sleep>>, Duration)>,
		cancel_fut: CancelFuture,
		_permit: OwnedSemaphorePermit,
		st: Arc<CancelState>,
		_signaller: DoneSignaller,
	}
}

impl<Fut, Response, Error> Future for ResponseFuture<Fut>
where
	Fut: Future<Output = Result<Response, Error>>,
	Error: From<ResponseError>,
{
	type Output = Fut::Output;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let this = self.project();

		// Fast path for cancellation.
		if this.st.cancelled.load(Ordering::Relaxed) {
			return Poll::Ready(Err(ResponseError::new(
				ErrorCode::REQUEST_CANCELLED,
				"client cancelled the request",
			)
			.into()));
		}

		// Poll the actual work.
		if let Poll::Ready(res) = this.fut.poll(cx) {
			return Poll::Ready(res);
		}

		// Check for a cancellation signal.
		if let Poll::Ready(()) = this.cancel_fut.as_mut().poll(cx) {
			this.st.cancelled.store(true, Ordering::Relaxed);
			return Poll::Ready(Err(ResponseError::new(
				ErrorCode::REQUEST_CANCELLED,
				"client cancelled the request",
			)
			.into()));
		}

		// Soft deadline: expiry cancels the request like the client would.
		if let Some((sleep, timeout)) = this.deadline
			&& let Poll::Ready(()) = sleep.as_mut().poll(cx)
		{
			this.st.cancelled.store(true, Ordering::Relaxed);
			tracing::warn!(
				method = %this.method,
				timeout_ms = timeout.as_millis() as u64,
				elapsed_ms = this.started_at.elapsed().as_millis() as u64,
				"request deadline expired"
			);
			return Poll::Ready(Err(ResponseError::new(
				ErrorCode::REQUEST_CANCELLED,
				format!("request timed out after {} ms", timeout.as_millis()),
			)
			.into()));
		}

		Poll::Pending
	}
}

impl<S: LspService> LspService for Concurrency<S>
where
	S::Error: From<ResponseError>,
{
	fn notify(&mut self, notif: AnyNotification) -> ControlFlow<Result<()>> {
		if notif.method == notification::Cancel::METHOD {
			if let Some(raw) = notif.params_raw()
				&& let Ok(params) = serde_json::from_str::<lsp_types::CancelParams>(raw.get())
				&& let Some(st) = self.ongoing.remove(&RequestId::from(params.id))
			{
				// Cancelling a completed or unknown id falls through as a
				// no-op: the entry is simply not there any more.
				st.cancelled.store(true, Ordering::Relaxed);
				st.notify.notify_waiters();
			}
			return ControlFlow::Continue(());
		}
		self.service.notify(notif)
	}

	fn emit(&mut self, event: AnyEvent) -> ControlFlow<Result<()>> {
		self.service.emit(event)
	}
}

/// The builder of [`Concurrency`] middleware.
///
/// Its [`Default`] configuration uses [`available_parallelism`] as the
/// concurrency limit (fallback 1) and no deadlines. Deadlines rely on the
/// tokio timer, so a stack with configured deadlines must run inside a
/// tokio runtime.
#[derive(Clone, Debug)]
#[must_use]
pub struct ConcurrencyBuilder {
	/// Maximum number of concurrent requests allowed.
	max_concurrency: NonZeroUsize,
	/// Per-method soft deadlines.
	deadlines: HashMap<String, Duration>,
}

impl Default for ConcurrencyBuilder {
	fn default() -> Self {
		Self::new(available_parallelism().unwrap_or(NonZeroUsize::new(1).expect("1 is non-zero")))
	}
}

impl ConcurrencyBuilder {
	/// Create the middleware with concurrency limit `max_concurrency`.
	pub fn new(max_concurrency: NonZeroUsize) -> Self {
		Self {
			max_concurrency,
			deadlines: HashMap::new(),
		}
	}

	/// Set a soft deadline for one method.
	pub fn with_deadline(mut self, method: impl Into<String>, timeout: Duration) -> Self {
		self.deadlines.insert(method.into(), timeout);
		self
	}
}

/// A type alias of [`ConcurrencyBuilder`] conforming to the naming
/// convention of [`tower_layer`].
pub type ConcurrencyLayer = ConcurrencyBuilder;

impl<S> Layer<S> for ConcurrencyBuilder {
	type Service = Concurrency<S>;

	fn layer(&self, inner: S) -> Self::Service {
		Concurrency {
			service: inner,
			max_concurrency: self.max_concurrency,
			deadlines: Arc::new(self.deadlines.clone()),
			semaphore: Arc::new(Semaphore::new(self.max_concurrency.get())),
			ready_fut: None,
			ready_permit: None,
			ongoing: HashMap::with_capacity(self.max_concurrency.get() * 2),
		}
	}
}

#[cfg(test)]
mod tests {
	use std::future::{pending, poll_fn};

	use super::*;

	fn cancel_notification(id: i64) -> AnyNotification {
		AnyNotification {
			method: notification::Cancel::METHOD.into(),
			params: Some(
				serde_json::value::to_raw_value(&serde_json::json!({ "id": id })).unwrap(),
			),
		}
	}

	fn request(id: i64, method: &str) -> AnyRequest {
		AnyRequest {
			id: RequestId::Number(id),
			method: method.into(),
			params: None,
		}
	}

	/// Inner service whose requests never complete on their own.
	struct Stuck;

	impl Service<AnyRequest> for Stuck {
		type Response = serde_json::Value;
		type Error = ResponseError;
		type Future = crate::router::BoxFutureStatic<Result<serde_json::Value, ResponseError>>;

		fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
			Poll::Ready(Ok(()))
		}

		fn call(&mut self, _req: AnyRequest) -> Self::Future {
			Box::pin(pending())
		}
	}

	impl LspService for Stuck {
		fn notify(&mut self, _notif: AnyNotification) -> ControlFlow<Result<()>> {
			ControlFlow::Continue(())
		}

		fn emit(&mut self, _event: AnyEvent) -> ControlFlow<Result<()>> {
			ControlFlow::Continue(())
		}
	}

	async fn ready_call(
		service: &mut Concurrency<Stuck>,
		req: AnyRequest,
	) -> ResponseFuture<<Stuck as Service<AnyRequest>>::Future> {
		poll_fn(|cx| service.poll_ready(cx)).await.unwrap();
		service.call(req)
	}

	#[tokio::test]
	async fn cancel_answers_with_request_cancelled() {
		let mut service = ConcurrencyLayer::new(NonZeroUsize::new(4).unwrap()).layer(Stuck);
		let fut = ready_call(&mut service, request(7, "slow/method")).await;
		tokio::pin!(fut);

		// Not resolved before the cancel arrives.
		assert!(futures::poll!(fut.as_mut()).is_pending());

		assert!(service.notify(cancel_notification(7)).is_continue());
		let err = fut.await.unwrap_err();
		assert_eq!(err.code, ErrorCode::REQUEST_CANCELLED);
	}

	#[tokio::test]
	async fn cancel_of_unknown_id_is_noop() {
		let mut service = ConcurrencyLayer::default().layer(Stuck);
		assert!(service.notify(cancel_notification(999)).is_continue());
	}

	#[tokio::test(start_paused = true)]
	async fn deadline_expiry_cancels() {
		let mut service = ConcurrencyLayer::new(NonZeroUsize::new(4).unwrap())
			.with_deadline("slow/method", Duration::from_millis(100))
			.layer(Stuck);
		let fut = ready_call(&mut service, request(1, "slow/method")).await;
		let err = fut.await.unwrap_err();
		assert_eq!(err.code, ErrorCode::REQUEST_CANCELLED);
	}

	#[tokio::test]
	async fn concurrency_cap_blocks_readiness() {
		let mut service = ConcurrencyLayer::new(NonZeroUsize::new(1).unwrap()).layer(Stuck);
		let first = ready_call(&mut service, request(1, "slow/method")).await;

		// The only permit is held by `first`, so readiness must now block.
		assert!(
			poll_fn(|cx| Poll::Ready(matches!(service.poll_ready(cx), Poll::Pending))).await
		);

		drop(first);
		poll_fn(|cx| service.poll_ready(cx)).await.unwrap();
	}
}
