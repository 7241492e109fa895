//! Server state and built-in protocol handlers.
//!
//! [`Server`] is the one explicit value threaded through every handler:
//! documents, configuration, progress tokens, tool handles, and dynamic
//! registrations all hang off it. There are no process-wide globals.
//!
//! [`Server::new_router`] wires the built-in lifecycle and synchronization
//! handlers onto a fresh router; analysis backends register their own
//! methods afterwards and the embedding code calls [`Server::finish`] so
//! the advertised capabilities reflect what is actually bound.

use std::collections::HashSet;
use std::future::{Future, ready};
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::time::Instant;

use lsp_types::notification::{
	DidChangeConfiguration, DidChangeTextDocument, DidCloseTextDocument, DidOpenTextDocument,
	DidSaveTextDocument, Initialized, Notification as _, WorkDoneProgressCancel,
};
use lsp_types::request::{
	CodeActionRequest, Completion, DocumentHighlightRequest, DocumentSymbolRequest, Formatting,
	GotoDefinition, HoverRequest, Initialize, RangeFormatting, References, RegisterCapability,
	Rename, Request as _, ResolveCompletionItem, Shutdown, SignatureHelpRequest,
	UnregisterCapability, WorkspaceConfiguration, WorkspaceSymbolRequest,
};
use lsp_types::{
	CodeActionProviderCapability, CompletionOptions, ConfigurationItem, ConfigurationParams,
	HoverProviderCapability, InitializeParams, InitializeResult, OneOf, Registration,
	RegistrationParams, ServerCapabilities, ServerInfo, SignatureHelpOptions,
	TextDocumentSyncCapability, TextDocumentSyncKind, Unregistration, UnregistrationParams, Url,
};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::config::Configuration;
use crate::document::DocumentManager;
use crate::event::{ConfigurationChanged, ConfigurationPulled, ProjectAvailable, RegisteredComponents};
use crate::progress::ProgressRegistry;
use crate::router::Router;
use crate::tools::ToolPool;
use crate::types::ResponseError;
use crate::{ClientSocket, Result};

/// The configuration sections fetched on a configuration round-trip.
const CONFIG_SECTIONS: [&str; 5] = ["d", "dfmt", "dscanner", "editor", "git"];

/// Shared state threaded through every handler.
pub struct Server {
	client: ClientSocket,
	/// Open documents.
	pub documents: std::sync::Arc<DocumentManager>,
	/// Recognized configuration tree.
	pub config: Configuration,
	/// Live progress and partial-result tokens.
	pub progress: ProgressRegistry,
	/// Pooled external tool handles.
	pub tools: ToolPool,
	/// Capabilities advertised at initialize; set by [`Server::finish`].
	capabilities: ServerCapabilities,
	/// Ids of live dynamic registrations.
	registrations: HashSet<String>,
	/// Workspace root resolved at initialize.
	root: Option<PathBuf>,
	/// Capabilities the client declared at initialize.
	client_capabilities: Option<lsp_types::ClientCapabilities>,
	started_at: Instant,
}

impl Server {
	/// Creates the server state around a client socket.
	#[must_use]
	pub fn new(client: ClientSocket) -> Self {
		Self {
			client,
			documents: std::sync::Arc::new(DocumentManager::new()),
			config: Configuration::default(),
			progress: ProgressRegistry::new(),
			tools: ToolPool::default(),
			capabilities: ServerCapabilities::default(),
			registrations: HashSet::new(),
			root: None,
			client_capabilities: None,
			started_at: Instant::now(),
		}
	}

	/// Builds a router with the built-in handlers installed.
	///
	/// Analysis backends register their methods on the returned router;
	/// call [`Server::finish`] afterwards.
	#[must_use]
	pub fn new_router(client: ClientSocket) -> Router<Self> {
		let mut router = Router::new(Self::new(client.clone()), client);
		let progress = router.progress().clone();
		router.state_mut().progress = progress;
		Self::register_builtin(&mut router);
		router
	}

	/// Computes capabilities from the bound method set and announces that
	/// registration is complete.
	pub fn finish(router: &mut Router<Self>) {
		let capabilities = Self::capabilities_of(router);
		router.state_mut().capabilities = capabilities;
		if router.client().emit(RegisteredComponents).is_err() {
			debug!("client socket closed before registration finished");
		}
	}

	/// The socket to the client.
	#[must_use]
	pub fn client(&self) -> &ClientSocket {
		&self.client
	}

	/// The workspace root resolved at initialize.
	#[must_use]
	pub fn root(&self) -> Option<&PathBuf> {
		self.root.as_ref()
	}

	/// Capabilities the client declared at initialize.
	#[must_use]
	pub fn client_capabilities(&self) -> Option<&lsp_types::ClientCapabilities> {
		self.client_capabilities.as_ref()
	}

	/// Time since this server value was created.
	#[must_use]
	pub fn uptime(&self) -> std::time::Duration {
		self.started_at.elapsed()
	}

	/// Derives the advertised capabilities from what is bound on `router`.
	#[must_use]
	pub fn capabilities_of(router: &Router<Self>) -> ServerCapabilities {
		let methods: HashSet<&str> = router.methods().collect();
		let sync = if router.has_notification(DidChangeTextDocument::METHOD) {
			TextDocumentSyncKind::INCREMENTAL
		} else {
			TextDocumentSyncKind::FULL
		};
		ServerCapabilities {
			text_document_sync: Some(TextDocumentSyncCapability::Kind(sync)),
			hover_provider: methods
				.contains(HoverRequest::METHOD)
				.then_some(HoverProviderCapability::Simple(true)),
			completion_provider: methods.contains(Completion::METHOD).then(|| CompletionOptions {
				resolve_provider: Some(methods.contains(ResolveCompletionItem::METHOD)),
				trigger_characters: Some(vec![".".into()]),
				..CompletionOptions::default()
			}),
			signature_help_provider: methods.contains(SignatureHelpRequest::METHOD).then(|| {
				SignatureHelpOptions {
					trigger_characters: Some(vec!["(".into(), ",".into()]),
					..SignatureHelpOptions::default()
				}
			}),
			definition_provider: methods
				.contains(GotoDefinition::METHOD)
				.then_some(OneOf::Left(true)),
			references_provider: methods
				.contains(References::METHOD)
				.then_some(OneOf::Left(true)),
			document_highlight_provider: methods
				.contains(DocumentHighlightRequest::METHOD)
				.then_some(OneOf::Left(true)),
			document_symbol_provider: methods
				.contains(DocumentSymbolRequest::METHOD)
				.then_some(OneOf::Left(true)),
			workspace_symbol_provider: methods
				.contains(WorkspaceSymbolRequest::METHOD)
				.then_some(OneOf::Left(true)),
			code_action_provider: methods
				.contains(CodeActionRequest::METHOD)
				.then_some(CodeActionProviderCapability::Simple(true)),
			document_formatting_provider: methods
				.contains(Formatting::METHOD)
				.then_some(OneOf::Left(true)),
			document_range_formatting_provider: methods
				.contains(RangeFormatting::METHOD)
				.then_some(OneOf::Left(true)),
			rename_provider: methods.contains(Rename::METHOD).then_some(OneOf::Left(true)),
			..ServerCapabilities::default()
		}
	}

	/// Registers features dynamically on the client, recording their ids.
	pub fn register_feature(
		&mut self,
		registrations: Vec<Registration>,
	) -> impl Future<Output = Result<()>> + use<> {
		for registration in &registrations {
			self.registrations.insert(registration.id.clone());
		}
		let client = self.client.clone();
		async move {
			client
				.request::<RegisterCapability>(RegistrationParams { registrations })
				.await
		}
	}

	/// Unregisters features previously registered dynamically.
	///
	/// Unknown ids are skipped, so unregistration is idempotent; when
	/// nothing is left to unregister no request is sent at all.
	pub fn unregister_feature(
		&mut self,
		unregisterations: Vec<Unregistration>,
	) -> impl Future<Output = Result<()>> + use<> {
		let known: Vec<Unregistration> = unregisterations
			.into_iter()
			.filter(|unregistration| self.registrations.remove(&unregistration.id))
			.collect();
		let client = self.client.clone();
		async move {
			if known.is_empty() {
				return Ok(());
			}
			client
				.request::<UnregisterCapability>(UnregistrationParams {
					unregisterations: known,
				})
				.await
		}
	}

	/// Fetches the recognized sections through `workspace/configuration`.
	///
	/// The fetched values come back through a [`ConfigurationPulled`] event
	/// so they are applied on the dispatch thread.
	pub fn pull_configuration(
		&self,
		scope_uri: Option<Url>,
	) -> impl Future<Output = Result<()>> + use<> {
		let client = self.client.clone();
		let items = CONFIG_SECTIONS
			.iter()
			.map(|section| ConfigurationItem {
				scope_uri: scope_uri.clone(),
				section: Some((*section).into()),
			})
			.collect();
		async move {
			let settings = client
				.request::<WorkspaceConfiguration>(ConfigurationParams { items })
				.await?;
			client.emit(ConfigurationPulled { settings })?;
			Ok(())
		}
	}

	fn handle_initialize(&mut self, params: InitializeParams) -> Result<InitializeResult, ResponseError> {
		self.root = params
			.root_uri
			.as_ref()
			.and_then(|uri| uri.to_file_path().ok())
			.or_else(|| {
				params
					.workspace_folders
					.as_deref()
					.and_then(<[_]>::first)
					.and_then(|folder| folder.uri.to_file_path().ok())
			});
		if let Some(options) = &params.initialization_options
			&& let Some(normalize) = options.get("normalizeLineEndings").and_then(JsonValue::as_bool)
		{
			self.documents.set_normalize_eol(normalize);
		}
		self.client_capabilities = Some(params.capabilities);
		debug!(root = ?self.root, "initialize");
		Ok(InitializeResult {
			capabilities: self.capabilities.clone(),
			server_info: Some(ServerInfo {
				name: env!("CARGO_PKG_NAME").into(),
				version: Some(env!("CARGO_PKG_VERSION").into()),
			}),
		})
	}

	fn register_builtin(router: &mut Router<Self>) {
		router
			.request::<Initialize, _>(|st, params| ready(st.handle_initialize(params)))
			.expect("fresh router has no bindings");
		router
			.request::<Shutdown, _>(|_, ()| ready(Ok(())))
			.expect("fresh router has no bindings");

		router
			.notification::<Initialized>(|st, _| {
				if st.client.emit(RegisteredComponents).is_err() {
					return ControlFlow::Continue(());
				}
				if let Some(root) = &st.root {
					let _ = st.client.emit(ProjectAvailable { root: root.clone() });
				}
				ControlFlow::Continue(())
			})
			.expect("fresh router has no bindings");

		router
			.notification::<DidOpenTextDocument>(|st, params| {
				st.documents.open(params.text_document);
				ControlFlow::Continue(())
			})
			.expect("fresh router has no bindings");
		router
			.notification::<DidChangeTextDocument>(|st, params| {
				// Stale batches are dropped inside with a warning.
				let _ = st
					.documents
					.change(&params.text_document, &params.content_changes);
				ControlFlow::Continue(())
			})
			.expect("fresh router has no bindings");
		router
			.notification::<DidSaveTextDocument>(|st, params| {
				st.documents
					.save(&params.text_document, params.text.as_deref());
				ControlFlow::Continue(())
			})
			.expect("fresh router has no bindings");
		router
			.notification::<DidCloseTextDocument>(|st, params| {
				st.documents.close(&params.text_document);
				ControlFlow::Continue(())
			})
			.expect("fresh router has no bindings");

		router
			.notification::<DidChangeConfiguration>(|st, params| {
				if st.config.update(&params.settings) > 0 {
					let _ = st.client.emit(ConfigurationChanged);
				}
				ControlFlow::Continue(())
			})
			.expect("fresh router has no bindings");
		router
			.notification::<WorkDoneProgressCancel>(|st, params| {
				st.progress.cancel(&params.token);
				ControlFlow::Continue(())
			})
			.expect("fresh router has no bindings");

		router.event::<ConfigurationPulled>(|st, event| {
			let applied: usize = event
				.settings
				.iter()
				.zip(CONFIG_SECTIONS)
				.map(|(value, section)| {
					let mut wrapped = serde_json::Map::new();
					wrapped.insert(section.to_owned(), value.clone());
					st.config.update(&JsonValue::Object(wrapped))
				})
				.sum();
			if applied > 0 {
				let _ = st.client.emit(ConfigurationChanged);
			}
			Ok(())
		});
	}
}

impl std::fmt::Debug for Server {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Server")
			.field("root", &self.root)
			.field("open_documents", &self.documents.open_uris().len())
			.field("registrations", &self.registrations.len())
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests;
