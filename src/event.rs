//! Internal events dispatched alongside protocol messages.
//!
//! Events are emitted through socket handles, travel through the main loop
//! like any other traffic, and fan out to the router's typed subscribers on
//! the dispatch thread.

use std::any::{Any, TypeId};
use std::fmt;
use std::path::PathBuf;

/// A type-erased internal event.
pub struct AnyEvent {
	inner: Box<dyn Any + Send>,
	type_name: &'static str,
}

impl fmt::Debug for AnyEvent {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("AnyEvent")
			.field("type_name", &self.type_name)
			.finish_non_exhaustive()
	}
}

impl AnyEvent {
	/// Wraps a concrete event.
	#[must_use]
	pub fn new<E: Send + 'static>(event: E) -> Self {
		Self {
			inner: Box::new(event),
			type_name: std::any::type_name::<E>(),
		}
	}

	/// The `TypeId` of the wrapped event.
	#[must_use]
	pub fn inner_type_id(&self) -> TypeId {
		// Call `type_id` on the inner value, not on the box itself.
		Any::type_id(&*self.inner)
	}

	/// Name of the wrapped type, for diagnostics.
	#[must_use]
	pub fn type_name(&self) -> &'static str {
		self.type_name
	}

	/// Borrows the wrapped event if it is an `E`.
	#[must_use]
	pub fn downcast_ref<E: 'static>(&self) -> Option<&E> {
		self.inner.downcast_ref::<E>()
	}

	/// Unwraps the event if it is an `E`, returning `self` otherwise.
	pub fn downcast<E: 'static>(self) -> Result<E, Self> {
		match self.inner.downcast::<E>() {
			Ok(inner) => Ok(*inner),
			Err(inner) => Err(Self {
				inner,
				type_name: self.type_name,
			}),
		}
	}
}

/// All handler modules finished registering on the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisteredComponents;

/// A workspace root became usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectAvailable {
	/// Workspace root path.
	pub root: PathBuf,
}

/// A project is about to be added to the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddingProject {
	/// Root path of the project being added.
	pub root: PathBuf,
}

/// A project finished being added to the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedProject {
	/// Root path of the added project.
	pub root: PathBuf,
}

/// The configuration changed through a push or a round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigurationChanged;

/// Section values fetched through a `workspace/configuration` round-trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationPulled {
	/// One value per requested section, in request order.
	pub settings: Vec<serde_json::Value>,
}
