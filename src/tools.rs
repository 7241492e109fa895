//! Pooled access to external D tooling.
//!
//! The analysis backends talk to `dub`, `dcd`, `dmd`, `dfmt`, and
//! `dscanner` through handles pooled per workspace. A handle admits one
//! in-flight call; concurrent callers queue FIFO behind a fair async lock.
//! When the tool behind a handle dies or times out, the handle is marked
//! failed and drains its queue: every queued caller gets the same
//! [`ToolFailure`] instead of waiting on a corpse.
//!
//! How a tool is actually spawned and spoken to is behind the
//! [`ToolTransport`] trait; process management lives with the embedding
//! code.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tracing::{debug, warn};

use crate::types::{ErrorCode, ResponseError};

/// Failure of an external tool call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("tool `{tool}` failed: {message}")]
pub struct ToolFailure {
	/// Name of the tool, e.g. `dscanner`.
	pub tool: String,
	/// What went wrong.
	pub message: String,
	/// Tail of the tool's stderr, for diagnostics.
	pub stderr_tail: String,
}

impl ToolFailure {
	/// Maps the failure to the error a request handler should answer with.
	///
	/// The tool name and stderr tail ride in the error's `data`.
	#[must_use]
	pub fn to_response_error(&self) -> ResponseError {
		ResponseError::new(ErrorCode::INTERNAL_ERROR, self).with_data(json!({
			"tool": self.tool,
			"stderr": self.stderr_tail,
		}))
	}
}

/// One invocation of an external tool.
#[derive(Debug, Clone, Default)]
pub struct ToolRequest {
	/// Command-line arguments.
	pub args: Vec<String>,
	/// Bytes fed to the tool's stdin.
	pub input: Option<String>,
}

/// Captured output of a finished tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
	/// Captured stdout.
	pub stdout: String,
	/// Captured stderr.
	pub stderr: String,
	/// Process exit code.
	pub status: i32,
}

/// Pluggable backend that actually runs a tool.
#[async_trait]
pub trait ToolTransport: Send + Sync {
	/// Runs one invocation to completion.
	async fn invoke(&self, req: ToolRequest) -> Result<ToolOutput, ToolFailure>;
}

/// A pooled handle to one tool in one workspace.
///
/// At most one call is in flight; the rest queue FIFO. A failed handle
/// answers every call with the recorded failure until [`ToolHandle::reset`]
/// is called after the tool was restarted.
pub struct ToolHandle {
	name: String,
	transport: Arc<dyn ToolTransport>,
	timeout: Duration,
	/// Fair lock: waiters are released in FIFO order.
	gate: tokio::sync::Mutex<()>,
	failed: Mutex<Option<ToolFailure>>,
}

impl std::fmt::Debug for ToolHandle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ToolHandle")
			.field("name", &self.name)
			.field("timeout", &self.timeout)
			.field("failed", &self.failed.lock().is_some())
			.finish_non_exhaustive()
	}
}

impl ToolHandle {
	/// Creates a handle over `transport`.
	#[must_use]
	pub fn new(name: impl Into<String>, transport: Arc<dyn ToolTransport>, timeout: Duration) -> Self {
		Self {
			name: name.into(),
			transport,
			timeout,
			gate: tokio::sync::Mutex::new(()),
			failed: Mutex::new(None),
		}
	}

	/// The tool name.
	#[must_use]
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Whether the handle is drained because its tool failed.
	#[must_use]
	pub fn is_failed(&self) -> bool {
		self.failed.lock().is_some()
	}

	/// Clears a recorded failure after the tool was restarted.
	pub fn reset(&self) {
		*self.failed.lock() = None;
	}

	/// Runs one invocation, queueing FIFO behind in-flight calls.
	pub async fn call(&self, req: ToolRequest) -> Result<ToolOutput, ToolFailure> {
		let _in_flight = self.gate.lock().await;

		// A failure recorded while this caller was queued drains it too.
		if let Some(failure) = self.failed.lock().clone() {
			return Err(failure);
		}

		match tokio::time::timeout(self.timeout, self.transport.invoke(req)).await {
			Ok(Ok(output)) => Ok(output),
			Ok(Err(failure)) => {
				warn!(tool = %self.name, error = %failure, "tool call failed");
				*self.failed.lock() = Some(failure.clone());
				Err(failure)
			}
			Err(_elapsed) => {
				let failure = ToolFailure {
					tool: self.name.clone(),
					message: format!("timed out after {} ms", self.timeout.as_millis()),
					stderr_tail: String::new(),
				};
				warn!(tool = %self.name, timeout_ms = self.timeout.as_millis() as u64, "tool call timed out");
				*self.failed.lock() = Some(failure.clone());
				Err(failure)
			}
		}
	}
}

/// Pool of tool handles keyed by workspace root and tool name.
pub struct ToolPool {
	handles: RwLock<HashMap<(PathBuf, String), Arc<ToolHandle>>>,
	default_timeout: Duration,
}

impl Default for ToolPool {
	fn default() -> Self {
		Self::new(Duration::from_secs(30))
	}
}

impl std::fmt::Debug for ToolPool {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ToolPool")
			.field("handles", &self.handles.read().len())
			.field("default_timeout", &self.default_timeout)
			.finish()
	}
}

impl ToolPool {
	/// Creates a pool whose handles default to `timeout` per call.
	#[must_use]
	pub fn new(timeout: Duration) -> Self {
		Self {
			handles: RwLock::new(HashMap::new()),
			default_timeout: timeout,
		}
	}

	/// Gets the handle for `(workspace, tool)`, creating it on first use.
	///
	/// `make` supplies the transport only when a handle does not exist yet.
	pub fn acquire(
		&self,
		workspace: &Path,
		tool: &str,
		make: impl FnOnce() -> Arc<dyn ToolTransport>,
	) -> Arc<ToolHandle> {
		let key = (workspace.to_path_buf(), tool.to_owned());
		if let Some(handle) = self.handles.read().get(&key) {
			return handle.clone();
		}
		let mut handles = self.handles.write();
		handles
			.entry(key)
			.or_insert_with(|| {
				debug!(tool = %tool, workspace = %workspace.display(), "starting tool handle");
				Arc::new(ToolHandle::new(tool, make(), self.default_timeout))
			})
			.clone()
	}

	/// Drops the handle for `(workspace, tool)`, if any.
	pub fn remove(&self, workspace: &Path, tool: &str) {
		self.handles
			.write()
			.remove(&(workspace.to_path_buf(), tool.to_owned()));
	}

	/// Drops every handle under a workspace root.
	pub fn remove_workspace(&self, workspace: &Path) {
		self.handles
			.write()
			.retain(|(root, _), _| root != workspace);
	}

	/// Number of live handles.
	#[must_use]
	pub fn len(&self) -> usize {
		self.handles.read().len()
	}

	/// Whether the pool has no handles.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.handles.read().is_empty()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	/// Transport that records concurrency and can be told to fail.
	struct Probe {
		in_flight: AtomicUsize,
		max_in_flight: AtomicUsize,
		calls: AtomicUsize,
		fail: bool,
	}

	impl Probe {
		fn new(fail: bool) -> Self {
			Self {
				in_flight: AtomicUsize::new(0),
				max_in_flight: AtomicUsize::new(0),
				calls: AtomicUsize::new(0),
				fail,
			}
		}
	}

	#[async_trait]
	impl ToolTransport for Probe {
		async fn invoke(&self, _req: ToolRequest) -> Result<ToolOutput, ToolFailure> {
			let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
			self.max_in_flight.fetch_max(now, Ordering::SeqCst);
			tokio::time::sleep(Duration::from_millis(5)).await;
			self.in_flight.fetch_sub(1, Ordering::SeqCst);
			self.calls.fetch_add(1, Ordering::SeqCst);
			if self.fail {
				Err(ToolFailure {
					tool: "dcd".into(),
					message: "process exited".into(),
					stderr_tail: "segfault".into(),
				})
			} else {
				Ok(ToolOutput {
					stdout: "ok".into(),
					stderr: String::new(),
					status: 0,
				})
			}
		}
	}

	#[tokio::test]
	async fn calls_are_serialized_per_handle() {
		let probe = Arc::new(Probe::new(false));
		let handle = Arc::new(ToolHandle::new(
			"dscanner",
			probe.clone(),
			Duration::from_secs(1),
		));

		let tasks: Vec<_> = (0..4)
			.map(|_| {
				let handle = handle.clone();
				tokio::spawn(async move { handle.call(ToolRequest::default()).await })
			})
			.collect();
		for task in tasks {
			task.await.unwrap().unwrap();
		}

		assert_eq!(probe.calls.load(Ordering::SeqCst), 4);
		assert_eq!(probe.max_in_flight.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn failure_drains_queued_callers() {
		let probe = Arc::new(Probe::new(true));
		let handle = Arc::new(ToolHandle::new("dcd", probe.clone(), Duration::from_secs(1)));

		let tasks: Vec<_> = (0..3)
			.map(|_| {
				let handle = handle.clone();
				tokio::spawn(async move { handle.call(ToolRequest::default()).await })
			})
			.collect();
		let mut failures = 0;
		for task in tasks {
			if task.await.unwrap().is_err() {
				failures += 1;
			}
		}

		assert_eq!(failures, 3);
		// Only the first caller reached the tool; the rest were drained.
		assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
		assert!(handle.is_failed());

		handle.reset();
		assert!(!handle.is_failed());
	}

	#[tokio::test(start_paused = true)]
	async fn timeout_marks_the_handle_failed() {
		struct Hang;

		#[async_trait]
		impl ToolTransport for Hang {
			async fn invoke(&self, _req: ToolRequest) -> Result<ToolOutput, ToolFailure> {
				std::future::pending().await
			}
		}

		let handle = ToolHandle::new("dub", Arc::new(Hang), Duration::from_millis(50));
		let err = handle.call(ToolRequest::default()).await.unwrap_err();
		assert!(err.message.contains("timed out"), "{}", err.message);
		assert!(handle.is_failed());

		let response = err.to_response_error();
		assert_eq!(response.code, ErrorCode::INTERNAL_ERROR);
		assert_eq!(response.data.unwrap()["tool"], "dub");
	}

	#[tokio::test]
	async fn pool_reuses_handles_per_workspace() {
		let pool = ToolPool::new(Duration::from_secs(1));
		let make = || Arc::new(Probe::new(false)) as Arc<dyn ToolTransport>;

		let a1 = pool.acquire(Path::new("/w1"), "dub", make);
		let a2 = pool.acquire(Path::new("/w1"), "dub", make);
		let b = pool.acquire(Path::new("/w2"), "dub", make);
		assert!(Arc::ptr_eq(&a1, &a2));
		assert!(!Arc::ptr_eq(&a1, &b));
		assert_eq!(pool.len(), 2);

		pool.remove_workspace(Path::new("/w1"));
		assert_eq!(pool.len(), 1);
	}
}
