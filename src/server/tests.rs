use futures::StreamExt;
use futures::channel::mpsc;
use lsp_types::notification::Notification;
use lsp_types::request::Request;
use serde_json::json;
use tower_service::Service;

use super::*;
use crate::socket::{MainLoopEvent, PeerSocket};
use crate::types::{AnyRequest, AnyResponse, RequestId};

fn recording_client() -> (ClientSocket, mpsc::UnboundedReceiver<MainLoopEvent>) {
	let (tx, rx) = mpsc::unbounded();
	(ClientSocket(PeerSocket { tx }), rx)
}

fn request(method: &str, params: serde_json::Value) -> AnyRequest {
	AnyRequest {
		id: RequestId::Number(1),
		method: method.into(),
		params: Some(serde_json::value::to_raw_value(&params).unwrap()),
	}
}

#[test]
fn capabilities_reflect_bound_methods() {
	let mut router = Server::new_router(ClientSocket::new_closed());
	let capabilities = Server::capabilities_of(&router);

	// The built-in sync handlers make incremental sync the default.
	assert_eq!(
		capabilities.text_document_sync,
		Some(TextDocumentSyncCapability::Kind(TextDocumentSyncKind::INCREMENTAL))
	);
	assert!(capabilities.hover_provider.is_none());
	assert!(capabilities.completion_provider.is_none());

	router
		.request::<HoverRequest, _>(|_, _| ready(Ok(None)))
		.unwrap();
	router
		.request::<Completion, _>(|_, _| ready(Ok(None)))
		.unwrap();
	let capabilities = Server::capabilities_of(&router);
	assert_eq!(
		capabilities.hover_provider,
		Some(HoverProviderCapability::Simple(true))
	);
	let completion = capabilities.completion_provider.unwrap();
	assert_eq!(completion.resolve_provider, Some(false));
}

#[test]
fn full_sync_is_advertised_without_a_change_handler() {
	let router: Router<Server> = Router::new(
		Server::new(ClientSocket::new_closed()),
		ClientSocket::new_closed(),
	);
	let capabilities = Server::capabilities_of(&router);
	assert_eq!(
		capabilities.text_document_sync,
		Some(TextDocumentSyncCapability::Kind(TextDocumentSyncKind::FULL))
	);
}

#[tokio::test]
async fn initialize_resolves_root_and_options() {
	let mut router = Server::new_router(ClientSocket::new_closed());
	Server::finish(&mut router);

	let result = router
		.call(request(
			Initialize::METHOD,
			json!({
				"processId": 1,
				"rootUri": "file:///w",
				"capabilities": {},
				"initializationOptions": { "normalizeLineEndings": true },
			}),
		))
		.await
		.unwrap();

	let result: InitializeResult = serde_json::from_value(result).unwrap();
	assert_eq!(
		result.capabilities.text_document_sync,
		Some(TextDocumentSyncCapability::Kind(TextDocumentSyncKind::INCREMENTAL))
	);
	assert_eq!(result.server_info.unwrap().name, "dls");
	assert_eq!(router.state().root(), Some(&PathBuf::from("/w")));
}

#[tokio::test]
async fn dynamic_registration_round_trips_and_is_idempotent() {
	let (client, mut rx) = recording_client();
	let mut server = Server::new(client);

	let register = server.register_feature(vec![Registration {
		id: "fmt-1".into(),
		method: "textDocument/formatting".into(),
		register_options: None,
	}]);
	let respond = async {
		match rx.next().await.unwrap() {
			MainLoopEvent::OutgoingRequest(req, tx) => {
				assert_eq!(req.method, RegisterCapability::METHOD);
				tx.send(AnyResponse {
					id: req.id,
					result: Some(serde_json::Value::Null),
					error: None,
				})
				.unwrap();
			}
			_ => panic!("expected an outgoing request"),
		}
	};
	let (registered, ()) = tokio::join!(register, respond);
	registered.unwrap();

	let unregister = server.unregister_feature(vec![Unregistration {
		id: "fmt-1".into(),
		method: "textDocument/formatting".into(),
	}]);
	let respond = async {
		match rx.next().await.unwrap() {
			MainLoopEvent::OutgoingRequest(req, tx) => {
				assert_eq!(req.method, UnregisterCapability::METHOD);
				tx.send(AnyResponse {
					id: req.id,
					result: Some(serde_json::Value::Null),
					error: None,
				})
				.unwrap();
			}
			_ => panic!("expected an outgoing request"),
		}
	};
	let (unregistered, ()) = tokio::join!(unregister, respond);
	unregistered.unwrap();

	// A second unregistration of the same id sends nothing at all.
	server
		.unregister_feature(vec![Unregistration {
			id: "fmt-1".into(),
			method: "textDocument/formatting".into(),
		}])
		.await
		.unwrap();
	assert!(rx.try_next().is_err());
}

#[tokio::test]
async fn did_open_and_did_change_flow_into_documents() {
	use std::ops::ControlFlow;

	let mut router = Server::new_router(ClientSocket::new_closed());
	let notif = |method: &str, params: serde_json::Value| crate::AnyNotification {
		method: method.into(),
		params: Some(serde_json::value::to_raw_value(&params).unwrap()),
	};

	assert!(matches!(
		crate::LspService::notify(
			&mut router,
			notif(
				DidOpenTextDocument::METHOD,
				json!({
					"textDocument": {
						"uri": "file:///a.d",
						"languageId": "d",
						"version": 1,
						"text": "hello\nworld",
					}
				}),
			)
		),
		ControlFlow::Continue(())
	));
	assert!(matches!(
		crate::LspService::notify(
			&mut router,
			notif(
				DidChangeTextDocument::METHOD,
				json!({
					"textDocument": { "uri": "file:///a.d", "version": 2 },
					"contentChanges": [{
						"range": {
							"start": { "line": 0, "character": 5 },
							"end": { "line": 0, "character": 5 },
						},
						"text": "!",
					}],
				}),
			)
		),
		ControlFlow::Continue(())
	));

	let uri = Url::parse("file:///a.d").unwrap();
	let snapshot = router.state().documents.snapshot(&uri).unwrap();
	assert_eq!(snapshot.text().to_string(), "hello!\nworld");
	assert_eq!(snapshot.version(), 2);
}

#[test]
fn pulled_configuration_applies_per_section() {
	let mut router = Server::new_router(ClientSocket::new_closed());
	let ctl = crate::LspService::emit(
		&mut router,
		crate::AnyEvent::new(ConfigurationPulled {
			settings: vec![
				json!({ "dubPath": "/opt/dub" }),
				json!({ "braceStyle": "otbs" }),
				json!(null),
				json!({ "tabSize": 2 }),
				json!({ "path": "/usr/bin/git" }),
			],
		}),
	);
	assert!(ctl.is_continue());

	let config = &router.state().config;
	assert_eq!(config.d.dub_path, "/opt/dub");
	assert_eq!(config.dfmt.brace_style, "otbs");
	assert_eq!(config.editor.tab_size, 2);
	assert_eq!(config.git.path, "/usr/bin/git");
}
