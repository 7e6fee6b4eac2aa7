//! End-to-end client scenarios against the in-memory store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tagsync::{
    AuthState, ChannelEmitter, ClientConfig, ClientDispatcher, ClientEvent, ClientStatus,
    JwtTokenIssuer, JwtTokenVerifier, MemoryStore, RemoteStore, SyncClient, SyncClientBuilder,
    TokenIssuer, Value,
};
use tagsync_core::{NamespacePath, DEFAULT_ENDPOINT};
use tokio::sync::mpsc;

const LOCAL: &str = "mem://local/";
const SECRET: &str = "scenario-secret";

struct Scenario {
    client: SyncClient,
    dispatcher: ClientDispatcher,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    seen: Vec<ClientEvent>,
    /// Index into `seen` past the last event `wait_for` returned.
    cursor: usize,
}

impl Scenario {
    fn start(config: ClientConfig, store: &MemoryStore, issuer: Option<Arc<dyn TokenIssuer>>) -> Self {
        let (emitter, events) = ChannelEmitter::new();
        let mut builder = SyncClientBuilder::new(config)
            .with_store(Arc::new(store.session()))
            .with_emitter(Arc::new(emitter));
        if let Some(issuer) = issuer {
            builder = builder.with_token_issuer(issuer);
        }
        let (client, dispatcher) = builder.build().unwrap();
        Scenario {
            client,
            dispatcher,
            events,
            seen: Vec::new(),
            cursor: 0,
        }
    }

    fn custom(store: &MemoryStore, project: &str) -> Self {
        let mut config = ClientConfig::new();
        config.namespace.endpoint = LOCAL.into();
        config.namespace.project_bucket = project.into();
        Self::start(config, store, None)
    }

    /// Returns the next event matching `pred`, including events already
    /// collected by `settle`, pumping the dispatcher until one arrives.
    fn wait_for(&mut self, pred: impl Fn(&ClientEvent) -> bool) -> ClientEvent {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            self.dispatcher.drain();
            while let Ok(event) = self.events.try_recv() {
                self.seen.push(event);
            }
            if let Some(offset) = self.seen[self.cursor..].iter().position(|e| pred(e)) {
                let index = self.cursor + offset;
                self.cursor = index + 1;
                return self.seen[index].clone();
            }
            assert!(Instant::now() < deadline, "timed out; saw {:?}", self.seen);
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Pumps the dispatcher until the status satisfies `pred`.
    fn settle(&mut self, pred: impl Fn(&ClientStatus) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            self.dispatcher.drain();
            if pred(&self.client.status()) {
                break;
            }
            assert!(
                Instant::now() < deadline,
                "timed out; status {:?}",
                self.client.status()
            );
            std::thread::sleep(Duration::from_millis(5));
        }
        while let Ok(event) = self.events.try_recv() {
            self.seen.push(event);
        }
    }
}

fn retrieved(tag: &str, value: Value) -> impl Fn(&ClientEvent) -> bool {
    let tag = tag.to_string();
    move |e| *e == ClientEvent::ValueRetrieved { tag: tag.clone(), value: value.clone() }
}

fn changed(tag: &str, value: Value) -> impl Fn(&ClientEvent) -> bool {
    let tag = tag.to_string();
    move |e| *e == ClientEvent::DataChanged { tag: tag.clone(), value: value.clone() }
}

fn is_error(e: &ClientEvent) -> bool {
    matches!(e, ClientEvent::Error { .. })
}

#[test]
fn test_store_then_get() {
    let store = MemoryStore::new();
    let mut s = Scenario::custom(&store, "proj1");

    s.client.store_value("score", &Value::Integer(10)).unwrap();
    s.client.get_value("score", &Value::Integer(0)).unwrap();

    s.wait_for(retrieved("score", Value::Integer(10)));
    assert_eq!(store.peek("proj1", "score"), Some("10".into()));
}

#[test]
fn test_get_missing_returns_default_without_writing() {
    let store = MemoryStore::new();
    let mut s = Scenario::custom(&store, "proj1");

    s.client.get_value("missing-tag", &Value::Integer(42)).unwrap();

    s.wait_for(retrieved("missing-tag", Value::Integer(42)));
    assert_eq!(store.peek("proj1", "missing-tag"), None);
}

#[test]
fn test_initialize_value() {
    let store = MemoryStore::new();
    let mut s = Scenario::custom(&store, "proj1");

    s.client.initialize_value("level", &Value::Integer(1)).unwrap();
    s.wait_for(changed("level", Value::Integer(1)));
    assert_eq!(store.peek("proj1", "level"), Some("1".into()));

    // Present now, so it is read back rather than overwritten.
    s.client.initialize_value("level", &Value::Integer(7)).unwrap();
    s.wait_for(retrieved("level", Value::Integer(1)));
    assert_eq!(store.peek("proj1", "level"), Some("1".into()));
}

#[test]
fn test_remote_writes_notify() {
    let store = MemoryStore::new();
    let mut s = Scenario::custom(&store, "proj1");
    s.settle(|st| st.subscribed);

    let other = store.session();
    let path = NamespacePath::from_parts(LOCAL, "proj1");
    other.set(&path, "name", Some("\"ada\"".into()), Box::new(|_| {}));
    s.wait_for(changed("name", Value::from("ada")));

    other.set(&path, "name", None, Box::new(|_| {}));
    s.wait_for(changed("name", Value::Absent));
}

#[test]
fn test_switching_project_moves_subscription() {
    let store = MemoryStore::new();
    let mut s = Scenario::custom(&store, "proj1");
    s.settle(|st| st.subscribed);

    s.client.set_project_bucket("proj2");
    s.settle(|st| st.subscribed && st.path.node() == "proj2");
    assert_eq!(store.subscriber_count("proj1"), 0);
    assert_eq!(store.subscriber_count("proj2"), 1);

    let other = store.session();
    other.set(&NamespacePath::from_parts(LOCAL, "proj1"), "t", Some("1".into()), Box::new(|_| {}));
    other.set(&NamespacePath::from_parts(LOCAL, "proj2"), "t", Some("2".into()), Box::new(|_| {}));

    s.wait_for(changed("t", Value::Integer(2)));
    assert!(!s.seen.contains(&ClientEvent::DataChanged {
        tag: "t".into(),
        value: Value::Integer(1)
    }));
}

#[test]
fn test_shared_store_with_issued_token() {
    let store = MemoryStore::with_verifier(Arc::new(JwtTokenVerifier::new(SECRET)));
    let mut config = ClientConfig::new();
    config.namespace.developer_bucket = "alice/".into();
    config.namespace.project_bucket = "proj1".into();
    let mut s = Scenario::start(
        config,
        &store,
        Some(Arc::new(JwtTokenIssuer::new(SECRET, 3600))),
    );

    s.client.store_value("score", &Value::Integer(10)).unwrap();
    s.settle(|st| st.auth_state == AuthState::Authenticated && st.subscribed);
    s.wait_for(changed("score", Value::Integer(10)));

    assert_eq!(s.client.endpoint(), DEFAULT_ENDPOINT);
    assert!(!s.client.credential().is_empty());
    assert_eq!(store.peek("developers/alice/proj1", "score"), Some("10".into()));
    assert!(!s.seen.iter().any(is_error));
}

#[test]
fn test_setters_drive_shared_store() {
    let store = MemoryStore::with_verifier(Arc::new(JwtTokenVerifier::new(SECRET)));
    let mut s = Scenario::start(
        ClientConfig::new(),
        &store,
        Some(Arc::new(JwtTokenIssuer::new(SECRET, 3600))),
    );

    s.client.set_endpoint(DEFAULT_ENDPOINT);
    s.client.set_developer_bucket("alice/");
    s.client.set_project_bucket("proj1");
    s.client.store_value("score", &Value::Integer(10)).unwrap();
    s.client.get_value("score", &Value::Integer(0)).unwrap();

    s.wait_for(retrieved("score", Value::Integer(10)));
    s.settle(|st| st.auth_state == AuthState::Authenticated && st.subscribed);

    let status = s.client.status();
    assert_eq!(status.path.node(), "developers/alice/proj1");
    assert_eq!(store.peek("developers/alice/proj1", "score"), Some("10".into()));
    assert!(!s.client.credential().is_empty());
    assert!(!s.seen.iter().any(is_error), "errors: {:?}", s.seen);
}

#[test]
fn test_shared_store_rejects_foreign_token() {
    let store = MemoryStore::with_verifier(Arc::new(JwtTokenVerifier::new(SECRET)));
    let foreign = JwtTokenIssuer::new(SECRET, 3600).issue("bob/", "proj1").unwrap();
    let mut config = ClientConfig::new();
    config.namespace.developer_bucket = "alice/".into();
    config.namespace.project_bucket = "proj1".into();
    config.namespace.credential = foreign;
    let mut s = Scenario::start(config, &store, None);

    s.wait_for(is_error);
    s.settle(|st| st.auth_state == AuthState::AuthFailed);

    // Best effort: the write is still attempted and refused by the store.
    s.client.store_value("score", &Value::Integer(10)).unwrap();
    // The refused subscription reports as "Remote subscribe failed: ...".
    s.wait_for(|e| matches!(e, ClientEvent::Error { message } if message.starts_with("Permission denied")));
    assert_eq!(store.peek("developers/alice/proj1", "score"), None);
}

#[test]
fn test_shared_store_without_credential_reports_error() {
    let store = MemoryStore::new();
    let mut config = ClientConfig::new();
    config.namespace.developer_bucket = "alice/".into();
    config.namespace.project_bucket = "proj1".into();
    let mut s = Scenario::start(config, &store, None);

    let event = s.wait_for(is_error);
    assert!(matches!(event, ClientEvent::Error { message } if message.contains("No credential")));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_spawned_client() {
    let store = MemoryStore::new();
    let (emitter, mut events) = ChannelEmitter::new();
    let mut config = ClientConfig::new();
    config.namespace.endpoint = LOCAL.into();
    config.namespace.project_bucket = "proj1".into();

    let client = SyncClientBuilder::new(config)
        .with_store(Arc::new(store.session()))
        .with_emitter(Arc::new(emitter))
        .spawn()
        .unwrap();

    client.store_value("score", &Value::Integer(3)).unwrap();
    client.get_value("score", &Value::Integer(0)).unwrap();

    let wanted = ClientEvent::ValueRetrieved {
        tag: "score".into(),
        value: Value::Integer(3),
    };
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if event == wanted {
                return;
            }
        }
        panic!("event stream ended");
    })
    .await
    .unwrap();

    client.shutdown();
}
