//! Work-done and partial-result token tracking.
//!
//! Tokens are value-typed (`NumberOrString`): a client cancelling token `1`
//! matches a server-created token `1` however either was produced. Tokens
//! created through `window/workDoneProgress/create` outlive the request
//! that spawned them; tokens supplied on a request release when the request
//! completes.

use std::collections::HashMap;
use std::sync::Arc;

use lsp_types::notification::Progress;
use lsp_types::request::WorkDoneProgressCreate;
use lsp_types::{
	NumberOrString, ProgressParams, ProgressParamsValue, WorkDoneProgress, WorkDoneProgressBegin,
	WorkDoneProgressCreateParams, WorkDoneProgressEnd, WorkDoneProgressReport,
};
use parking_lot::Mutex;

use crate::types::RequestId;
use crate::{ClientSocket, Result};

/// A work-done or partial-result token.
pub type ProgressToken = NumberOrString;

/// Bookkeeping for one work-done token.
#[derive(Debug)]
struct WorkDoneEntry {
	/// The client asked to stop this operation.
	cancelled: bool,
	/// Created via `window/workDoneProgress/create`; survives request end.
	persistent: bool,
}

#[derive(Debug, Default)]
struct Inner {
	work_done: HashMap<ProgressToken, WorkDoneEntry>,
	partial: HashMap<ProgressToken, RequestId>,
}

/// Shared registry of live progress tokens.
#[derive(Debug, Clone, Default)]
pub struct ProgressRegistry {
	inner: Arc<Mutex<Inner>>,
}

impl ProgressRegistry {
	/// Creates an empty registry.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Creates a server-initiated work-done token on the client.
	///
	/// The token persists until [`WorkDoneReporter::end`] is called, even if
	/// the request that created it completes first.
	pub async fn create_work_done(
		&self,
		client: &ClientSocket,
		token: ProgressToken,
	) -> Result<WorkDoneReporter> {
		client
			.request::<WorkDoneProgressCreate>(WorkDoneProgressCreateParams {
				token: token.clone(),
			})
			.await?;
		self.inner.lock().work_done.insert(
			token.clone(),
			WorkDoneEntry {
				cancelled: false,
				persistent: true,
			},
		);
		Ok(WorkDoneReporter {
			registry: self.clone(),
			client: client.clone(),
			token,
		})
	}

	/// Adopts a request-supplied `workDoneToken`.
	///
	/// The token releases when the reporter drops, i.e. with the request.
	#[must_use]
	pub fn attach_work_done(&self, client: &ClientSocket, token: ProgressToken) -> WorkDoneReporter {
		self.inner.lock().work_done.entry(token.clone()).or_insert(WorkDoneEntry {
			cancelled: false,
			persistent: false,
		});
		WorkDoneReporter {
			registry: self.clone(),
			client: client.clone(),
			token,
		}
	}

	/// Marks a token cancelled (`window/workDoneProgress/cancel`).
	///
	/// Unknown tokens are a no-op.
	pub fn cancel(&self, token: &ProgressToken) {
		if let Some(entry) = self.inner.lock().work_done.get_mut(token) {
			entry.cancelled = true;
		}
	}

	/// Whether the client asked to stop the operation behind `token`.
	#[must_use]
	pub fn is_cancelled(&self, token: &ProgressToken) -> bool {
		self.inner
			.lock()
			.work_done
			.get(token)
			.is_some_and(|entry| entry.cancelled)
	}

	/// Number of live work-done tokens.
	#[must_use]
	pub fn live_work_done(&self) -> usize {
		self.inner.lock().work_done.len()
	}

	/// Associates a partial-result token with the request streaming into it.
	///
	/// The guard removes the association when dropped, which happens both on
	/// normal completion and when the request's task is cancelled. After
	/// that point no further chunk can be attributed to the token.
	#[must_use]
	pub(crate) fn register_partial(&self, token: ProgressToken, request: RequestId) -> PartialGuard {
		self.inner.lock().partial.insert(token.clone(), request);
		PartialGuard {
			registry: self.clone(),
			token,
		}
	}

	/// The request currently streaming into `token`, if any.
	#[must_use]
	pub fn partial_owner(&self, token: &ProgressToken) -> Option<RequestId> {
		self.inner.lock().partial.get(token).cloned()
	}
}

/// Sends work-done progress for one token.
///
/// All reporting goes quiet once the client cancelled the token.
#[derive(Debug)]
pub struct WorkDoneReporter {
	registry: ProgressRegistry,
	client: ClientSocket,
	token: ProgressToken,
}

impl WorkDoneReporter {
	/// The token this reporter feeds.
	#[must_use]
	pub fn token(&self) -> &ProgressToken {
		&self.token
	}

	/// Whether the client asked to stop this operation.
	#[must_use]
	pub fn is_cancelled(&self) -> bool {
		self.registry.is_cancelled(&self.token)
	}

	/// Reports the start of the operation.
	pub fn begin(&self, title: impl Into<String>, message: Option<String>) -> Result<()> {
		self.send(WorkDoneProgress::Begin(WorkDoneProgressBegin {
			title: title.into(),
			cancellable: Some(true),
			message,
			percentage: None,
		}))
	}

	/// Reports intermediate progress.
	pub fn report(&self, message: Option<String>, percentage: Option<u32>) -> Result<()> {
		self.send(WorkDoneProgress::Report(WorkDoneProgressReport {
			cancellable: None,
			message,
			percentage,
		}))
	}

	/// Reports the end of the operation and releases the token.
	pub fn end(self, message: Option<String>) -> Result<()> {
		let ret = self.send(WorkDoneProgress::End(WorkDoneProgressEnd { message }));
		self.registry.inner.lock().work_done.remove(&self.token);
		ret
	}

	fn send(&self, value: WorkDoneProgress) -> Result<()> {
		if self.is_cancelled() {
			return Ok(());
		}
		self.client.notify::<Progress>(ProgressParams {
			token: self.token.clone(),
			value: ProgressParamsValue::WorkDone(value),
		})
	}
}

impl Drop for WorkDoneReporter {
	fn drop(&mut self) {
		let mut inner = self.registry.inner.lock();
		let release = inner
			.work_done
			.get(&self.token)
			.is_some_and(|entry| !entry.persistent);
		if release {
			inner.work_done.remove(&self.token);
		}
	}
}

/// Removes a partial-result token association on drop.
#[derive(Debug)]
pub struct PartialGuard {
	registry: ProgressRegistry,
	token: ProgressToken,
}

impl Drop for PartialGuard {
	fn drop(&mut self) {
		self.registry.inner.lock().partial.remove(&self.token);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn request_scoped_token_releases_on_drop() {
		let registry = ProgressRegistry::new();
		let client = ClientSocket::new_closed();
		let reporter = registry.attach_work_done(&client, NumberOrString::Number(1));
		assert_eq!(registry.live_work_done(), 1);
		drop(reporter);
		assert_eq!(registry.live_work_done(), 0);
	}

	#[test]
	fn cancel_unknown_token_is_noop() {
		let registry = ProgressRegistry::new();
		registry.cancel(&NumberOrString::String("nope".into()));
		assert!(!registry.is_cancelled(&NumberOrString::String("nope".into())));
	}

	#[test]
	fn cancelled_reporter_goes_quiet() {
		let registry = ProgressRegistry::new();
		let client = ClientSocket::new_closed();
		let reporter = registry.attach_work_done(&client, NumberOrString::Number(2));
		registry.cancel(reporter.token());
		// The socket is closed, so a send attempt would fail; a cancelled
		// reporter must not even try.
		assert!(reporter.report(None, Some(50)).is_ok());
	}

	#[test]
	fn partial_guard_clears_association() {
		let registry = ProgressRegistry::new();
		let token = NumberOrString::String("t".into());
		let guard = registry.register_partial(token.clone(), RequestId::Number(7));
		assert_eq!(registry.partial_owner(&token), Some(RequestId::Number(7)));
		drop(guard);
		assert_eq!(registry.partial_owner(&token), None);
	}
}
