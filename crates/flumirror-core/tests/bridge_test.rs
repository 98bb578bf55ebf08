// End-to-end tests for `Bridge` against the in-memory upstream and broker.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use flumirror_api::memory::detail_state;
use flumirror_api::{
    ConnectFailureKind, ListenerId, MemoryBroker, MemoryUpstream, NodeChange, RemoteNode, RemoteOp, RemoteValue,
};
use flumirror_core::{
    Bridge, BridgeConfig, CommandResult, ComponentCommand, ConnectionState, CoreError, RouteError,
};

const WAIT: Duration = Duration::from_secs(5);
const INITIAL: &str = "/flumotion/components/initial";
const CHANGES: &str = "/flumotion/components/changes";

// ── Helpers ─────────────────────────────────────────────────────────

struct Fixture {
    upstream: MemoryUpstream,
    broker: MemoryBroker,
    flow: RemoteNode,
    bridge: Bridge,
}

impl Fixture {
    fn new(config: BridgeConfig, components: &[(&str, i64)]) -> Self {
        let upstream = MemoryUpstream::new();
        let flow = upstream.add_flow("default");
        for (name, mood) in components {
            upstream.add_component(&flow, name, *mood);
        }
        let broker = MemoryBroker::new();
        let bridge = Bridge::start(config, Arc::new(upstream.clone()), Arc::new(broker.clone()));
        Self {
            upstream,
            broker,
            flow,
            bridge,
        }
    }

    async fn connected(components: &[(&str, i64)]) -> Self {
        let fixture = Self::new(BridgeConfig::default(), components);
        fixture.bridge.connect().await.unwrap();
        fixture
    }

    fn component(&self, name: &str) -> RemoteNode {
        self.flow
            .children("components")
            .into_iter()
            .find(|c| c.name().as_deref() == Some(name))
            .unwrap()
    }

    fn changes(&self) -> Vec<Value> {
        self.broker.published_to(CHANGES).iter().map(|p| p.json()).collect()
    }

    fn actions(&self) -> Vec<String> {
        self.changes()
            .iter()
            .map(|c| c["action"].as_str().unwrap_or_default().to_owned())
            .collect()
    }

    async fn wait_published(&self, destination: &str, count: usize) {
        let ok = self
            .broker
            .wait_for(WAIT, |log| log.iter().filter(|p| p.destination == destination).count() >= count)
            .await;
        assert!(ok, "expected {count} publishes to {destination}, got {:?}", self.broker.published());
    }

    async fn wait_state(&self, want: ConnectionState) {
        let mut rx = self.bridge.state_changes();
        tokio::time::timeout(WAIT, rx.wait_for(|state| *state == want))
            .await
            .unwrap()
            .unwrap();
    }

    /// Round-trip through the event loop so earlier messages are handled.
    async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = self.bridge.poll("__settle__").await;
    }

    fn uistate_publishes(&self) -> usize {
        self.broker
            .published()
            .iter()
            .filter(|p| p.destination.contains("/uistate/"))
            .count()
    }
}

fn names(bridge: &Bridge) -> Vec<String> {
    bridge.components().iter().map(|r| r.name.clone()).collect()
}

// ── Lifecycle ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_end_to_end_scenario() {
    let f = Fixture::connected(&[("producer", 0), ("encoder", 0)]).await;

    // Snapshot at connect time, then the lifecycle event.
    let initial = f.broker.published_to(INITIAL);
    assert_eq!(initial.len(), 1);
    let snapshot = initial[0].json();
    assert_eq!(snapshot.as_array().unwrap().len(), 2);
    assert_eq!(snapshot[0]["name"], "producer");
    assert!(snapshot[0].get("parent").is_none());
    assert_eq!(f.changes(), [json!({ "action": "connected", "component": null })]);

    // Upstream adds X.
    let x = f.upstream.add_component(&f.flow, "X", 2);
    let detail = detail_state([
        ("bitrate", RemoteValue::from(128_000_i64)),
        ("feeders", RemoteValue::List(vec![RemoteNode::from_pairs([("feederName", "video")]).into()])),
    ]);
    f.upstream.set_detail_state(&x, detail.clone());
    f.wait_published(CHANGES, 2).await;
    let add = &f.changes()[1];
    assert_eq!(add["action"], "add");
    assert_eq!(add["component"]["name"], "X");
    assert_eq!(add["component"]["mood"], 2);
    assert_eq!(add["component"]["workerName"], "localhost");

    // Poll for X over the broker.
    f.broker.inject("/flumotion/poll", "X");
    f.wait_published("/flumotion/components/uistate/X/feeders", 1).await;
    f.wait_published("/flumotion/components/uistate/X/bitrate", 1).await;
    assert_eq!(
        f.broker.published_to("/flumotion/components/uistate/X/feeders")[0].json(),
        json!([{ "feederName": "video" }])
    );
    assert_eq!(f.upstream.listeners_on(&detail), 1);
    assert_eq!(f.upstream.held_detail_states(), 1);

    // X goes sad: change event, detail subscription released.
    f.upstream.set(&x, "mood", 5_i64.into());
    f.wait_published(CHANGES, 3).await;
    let change = &f.changes()[2];
    assert_eq!(change["action"], "change");
    assert_eq!(change["component"]["mood"], 5);
    assert_eq!(f.upstream.listeners_on(&detail), 0);
    assert_eq!(f.upstream.held_detail_states(), 0);

    // Disconnect.
    f.upstream.drop_connection("manager went away");
    f.wait_state(ConnectionState::Disconnected).await;
    f.wait_published(CHANGES, 4).await;
    assert_eq!(f.changes()[3], json!({ "action": "disconnected", "component": null }));
    assert!(f.bridge.components().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_timer_runs_only_while_connected() {
    let f = Fixture::connected(&[("producer", 0)]).await;
    assert_eq!(f.broker.published_to(INITIAL).len(), 1);
    let first = f.bridge.last_snapshot().unwrap();

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(f.broker.published_to(INITIAL).len(), 3);
    assert!(f.bridge.last_snapshot().unwrap() >= first);

    f.upstream.drop_connection("gone");
    f.wait_state(ConnectionState::Disconnected).await;
    let after_disconnect = f.broker.published_to(INITIAL).len();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(f.broker.published_to(INITIAL).len(), after_disconnect);
}

#[tokio::test]
async fn test_connect_failure_is_classified_and_not_retried() {
    let f = Fixture::new(BridgeConfig::default(), &[("producer", 0)]);
    f.upstream
        .fail_next_connect(ConnectFailureKind::Refused, "bad credentials");

    let err = f.bridge.connect().await.unwrap_err();
    assert_eq!(err.connect_failure_kind(), ConnectFailureKind::Refused);
    assert_eq!(f.bridge.connection_state(), ConnectionState::Disconnected);
    assert_eq!(f.upstream.connect_count(), 1);
    assert!(f.broker.published().is_empty());

    // A later explicit attempt works.
    f.bridge.connect().await.unwrap();
    assert_eq!(names(&f.bridge), ["producer"]);
}

#[tokio::test]
async fn test_double_connect_is_rejected() {
    let f = Fixture::connected(&[]).await;
    assert!(matches!(f.bridge.connect().await, Err(CoreError::AlreadyConnected)));
}

#[tokio::test]
async fn test_explicit_disconnect_then_reconnect() {
    let f = Fixture::connected(&[("producer", 0)]).await;

    f.bridge.disconnect().await;
    assert_eq!(f.bridge.connection_state(), ConnectionState::Disconnected);
    assert!(f.bridge.components().is_empty());
    assert_eq!(f.upstream.active_listeners(), 0);

    f.bridge.connect().await.unwrap();
    assert_eq!(names(&f.bridge), ["producer"]);
    assert_eq!(f.upstream.connect_count(), 2);
    assert_eq!(f.actions(), ["connected", "disconnected", "connected"]);
}

#[tokio::test]
async fn test_shutdown_closes_upstream() {
    let f = Fixture::connected(&[("producer", 0)]).await;
    f.bridge.shutdown().await;

    assert!(!f.upstream.is_connected());
    assert_eq!(f.actions(), ["connected", "disconnected"]);
    assert!(matches!(f.bridge.poll("producer").await, Err(CoreError::Shutdown)));
}

// ── Mirror membership ───────────────────────────────────────────────

#[tokio::test]
async fn test_membership_follows_upstream() {
    let f = Fixture::connected(&[("a", 0), ("b", 0)]).await;
    let a = f.component("a");

    let c = f.upstream.add_component(&f.flow, "c", 0);
    f.upstream.remove_component(&f.flow, &a);
    f.upstream.add_component(&f.flow, "d", 0);
    f.upstream.remove_component(&f.flow, &c);
    f.upstream.add_component(&f.flow, "e", 0);
    f.wait_published(CHANGES, 6).await;

    assert_eq!(f.actions(), ["connected", "add", "remove", "add", "remove", "add"]);
    assert_eq!(f.changes()[2], json!({ "action": "remove", "component": "a" }));

    let upstream_names: Vec<String> = f
        .flow
        .children("components")
        .iter()
        .filter_map(RemoteNode::name)
        .collect();
    assert_eq!(names(&f.bridge), upstream_names);
    // planet + flow + one per component
    assert_eq!(f.upstream.active_listeners(), 2 + upstream_names.len());
}

#[tokio::test]
async fn test_rename_onto_a_taken_name_removes_the_other_component() {
    let f = Fixture::connected(&[("a", 0), ("b", 0)]).await;
    let a = f.component("a");

    f.upstream.set(&a, "name", "b".into());
    f.wait_published(CHANGES, 3).await;

    assert_eq!(f.actions(), ["connected", "remove", "change"]);
    assert_eq!(f.changes()[1], json!({ "action": "remove", "component": "b" }));
    assert_eq!(f.changes()[2]["component"]["name"], "b");
    assert_eq!(names(&f.bridge), ["b"]);
    assert_eq!(f.bridge.components().len(), 1);
}

#[tokio::test]
async fn test_component_stream_sees_changes() {
    let f = Fixture::connected(&[("a", 0)]).await;
    let mut stream = f.bridge.component_stream();
    assert_eq!(stream.current().len(), 1);

    f.upstream.add_component(&f.flow, "b", 0);
    let next = tokio::time::timeout(WAIT, stream.changed()).await.unwrap().unwrap();
    assert_eq!(next.len(), 2);
}

#[tokio::test]
async fn test_stale_epoch_notification_has_no_effect() {
    let f = Fixture::connected(&[("producer", 0)]).await;
    let producer = f.component("producer");

    f.bridge.disconnect().await;
    f.bridge.connect().await.unwrap();
    let before = f.changes().len();

    // A notification addressed to a listener from the first session.
    f.upstream.inject(ListenerId { epoch: 1, seq: 3 }, &producer, NodeChange::ValueSet {
        key: "mood".into(),
        value: 4_i64.into(),
    });
    f.settle().await;

    assert_eq!(f.changes().len(), before);
    assert_eq!(f.bridge.component("producer").unwrap().mood, Some(0));
}

// ── Detail polling ──────────────────────────────────────────────────

#[tokio::test]
async fn test_concurrent_polls_share_one_fetch() {
    let f = Fixture::connected(&[("enc1", 0)]).await;
    let enc1 = f.component("enc1");
    f.upstream.set_detail_state(&enc1, detail_state([("bitrate", 64_000_i64)]));
    f.upstream.hold_detail_fetches();

    let release = async {
        while f.upstream.detail_fetch_count() == 0 {
            tokio::task::yield_now().await;
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        f.upstream.release_detail_fetches();
    };
    let (first, second, ()) = tokio::join!(f.bridge.poll("enc1"), f.bridge.poll("enc1"), release);
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(f.upstream.detail_fetch_count(), 1);
    assert_eq!(first.snapshot, second.snapshot);
    assert_eq!(first.snapshot.fields["bitrate"], json!(64_000));
    assert!(first.subscribed_now ^ second.subscribed_now);
    assert_eq!(f.broker.published_to("/flumotion/components/uistate/enc1/bitrate").len(), 1);
}

#[tokio::test]
async fn test_repeated_poll_replays_snapshot() {
    let f = Fixture::connected(&[("enc1", 0)]).await;
    let enc1 = f.component("enc1");
    let detail = detail_state([("bitrate", 64_000_i64)]);
    f.upstream.set_detail_state(&enc1, detail.clone());

    assert!(f.bridge.poll("enc1").await.unwrap().subscribed_now);
    f.upstream.set(&detail, "bitrate", 96_000_i64.into());
    f.wait_published("/flumotion/components/uistate/enc1/bitrate", 2).await;

    let again = f.bridge.poll("enc1").await.unwrap();
    assert!(!again.subscribed_now);
    assert_eq!(again.snapshot.fields["bitrate"], json!(96_000));
    assert_eq!(f.upstream.detail_fetch_count(), 1);
    assert_eq!(f.upstream.listeners_on(&detail), 1);

    let values: Vec<Value> = f
        .broker
        .published_to("/flumotion/components/uistate/enc1/bitrate")
        .iter()
        .map(|p| p.json())
        .collect();
    assert_eq!(values, [json!(64_000), json!(96_000), json!(96_000)]);
}

#[tokio::test]
async fn test_stale_detail_fetch_is_discarded() {
    let f = Fixture::connected(&[("enc1", 0)]).await;
    let enc1 = f.component("enc1");
    let detail = detail_state([("bitrate", 64_000_i64)]);
    f.upstream.set_detail_state(&enc1, detail.clone());
    f.upstream.hold_detail_fetches();

    let bridge = f.bridge.clone();
    let poll = tokio::spawn(async move { bridge.poll("enc1").await });
    while f.upstream.detail_fetch_count() == 0 {
        tokio::task::yield_now().await;
    }

    f.upstream.drop_connection("blip");
    f.wait_state(ConnectionState::Disconnected).await;
    assert!(matches!(poll.await.unwrap(), Err(CoreError::UpstreamLost)));

    f.bridge.connect().await.unwrap();
    f.upstream.release_detail_fetches();
    f.settle().await;

    assert_eq!(f.uistate_publishes(), 0);
    assert_eq!(f.upstream.listeners_on(&detail), 0);
    assert_eq!(f.upstream.held_detail_states(), 0);
}

#[tokio::test]
async fn test_failed_detail_fetch_reports_and_keeps_going() {
    let f = Fixture::connected(&[("enc1", 0), ("enc2", 0)]).await;
    let enc1 = f.component("enc1");
    let enc2 = f.component("enc2");
    f.upstream.fail_detail_state(&enc1, "no ui state");
    f.upstream.set_detail_state(&enc2, detail_state([("bitrate", 1_i64)]));

    let err = f.bridge.poll("enc1").await.unwrap_err();
    assert!(matches!(err, CoreError::Remote { ref message, .. } if message == "no ui state"));

    assert!(f.bridge.poll("enc2").await.unwrap().subscribed_now);
    assert!(matches!(
        f.bridge.poll("ghost").await,
        Err(CoreError::ComponentNotFound { .. })
    ));
}

#[tokio::test]
async fn test_unpublishable_detail_field_is_dropped() {
    let f = Fixture::connected(&[("enc1", 0)]).await;
    let enc1 = f.component("enc1");
    f.upstream.set_detail_state(&enc1, detail_state([
        ("stats", RemoteValue::Node(RemoteNode::from_pairs([("x", 1_i64)]))),
        ("bitrate", RemoteValue::from(1_i64)),
    ]));

    let outcome = f.bridge.poll("enc1").await.unwrap();
    assert_eq!(outcome.snapshot.fields.keys().collect::<Vec<_>>(), ["bitrate"]);
    assert!(f.broker.published_to("/flumotion/components/uistate/enc1/stats").is_empty());
    assert_eq!(f.broker.published_to("/flumotion/components/uistate/enc1/bitrate").len(), 1);
}

// ── Commands ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_start_command_dispatches() {
    let f = Fixture::connected(&[("enc1", 0)]).await;

    let result = f
        .bridge
        .execute(ComponentCommand::Start { component: "enc1".into() })
        .await
        .unwrap();
    assert_eq!(result, CommandResult::Value(Value::Null));

    let calls = f.upstream.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].component, "enc1");
    assert_eq!(calls[0].op, RemoteOp::Start);
}

#[tokio::test]
async fn test_invalid_commands_make_no_remote_call() {
    let f = Fixture::connected(&[("enc1", 0)]).await;
    let mut outcomes = f.bridge.command_outcomes();

    f.broker
        .inject("/flumotion/command", r#"{"command":"componentStart","component":"enc2"}"#);
    let missing = tokio::time::timeout(WAIT, outcomes.recv()).await.unwrap().unwrap();
    assert_eq!(missing.result, Err(RouteError::ComponentNotFound("enc2".into()).to_string()));

    f.broker
        .inject("/flumotion/command", r#"{"command":"bogus","component":"enc1"}"#);
    let bogus = tokio::time::timeout(WAIT, outcomes.recv()).await.unwrap().unwrap();
    assert!(!bogus.is_success());
    assert_eq!(bogus.kind, None);

    let err = f
        .bridge
        .execute(ComponentCommand::Stop { component: "nope".into() })
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Rejected(RouteError::ComponentNotFound(_))));

    assert!(f.upstream.calls().is_empty());
}

#[tokio::test]
async fn test_broker_command_reaches_upstream() {
    let f = Fixture::connected(&[("enc1", 0), ("enc2", 5)]).await;
    let mut outcomes = f.bridge.command_outcomes();

    f.broker.inject(
        "/flumotion/command",
        r#"{"command":"componentCallRemote","component":"enc1","method":"setVolume","params":[0.5]}"#,
    );
    let outcome = tokio::time::timeout(WAIT, outcomes.recv()).await.unwrap().unwrap();
    assert!(outcome.is_success());
    assert_eq!(f.upstream.calls()[0].op, RemoteOp::Call {
        method: "setVolume".into(),
        params: vec![json!(0.5)],
    });

    f.broker.inject(
        "/flumotion/command",
        r#"{"command":"invokeOnComponents","component":{"mood":"sad"},"method":"restart"}"#,
    );
    let outcome = tokio::time::timeout(WAIT, outcomes.recv()).await.unwrap().unwrap();
    let Ok(CommandResult::Batch(items)) = outcome.result else {
        panic!("expected a batch result, got {outcome:?}");
    };
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].component, "enc2");
}

#[tokio::test]
async fn test_remote_command_failure_is_reported() {
    let f = Fixture::connected(&[("enc1", 0)]).await;
    f.upstream.fail_invocations("componentStop", "not running");

    let err = f
        .bridge
        .execute(ComponentCommand::Stop { component: "enc1".into() })
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Remote { ref method, .. } if method == "componentStop"));
    // The mirror is untouched.
    assert_eq!(names(&f.bridge), ["enc1"]);
}

#[tokio::test]
async fn test_command_outcome_from_an_old_epoch_is_dropped() {
    let f = Fixture::connected(&[("enc1", 0)]).await;
    let mut outcomes = f.bridge.command_outcomes();
    f.upstream.hold_invocations();

    let bridge = f.bridge.clone();
    let command = tokio::spawn(async move {
        bridge
            .execute(ComponentCommand::Start { component: "enc1".into() })
            .await
    });
    while f.upstream.calls().is_empty() {
        tokio::task::yield_now().await;
    }

    f.upstream.drop_connection("blip");
    f.wait_state(ConnectionState::Disconnected).await;
    f.bridge.connect().await.unwrap();
    f.upstream.release_invocations();

    let result = tokio::time::timeout(WAIT, command).await.unwrap().unwrap();
    assert!(matches!(result, Err(CoreError::UpstreamLost)));
    f.settle().await;
    assert!(outcomes.try_recv().is_err());
}

#[tokio::test]
async fn test_commands_rejected_while_disconnected() {
    let f = Fixture::new(BridgeConfig::default(), &[("enc1", 0)]);
    let err = f
        .bridge
        .execute(ComponentCommand::Start { component: "enc1".into() })
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Rejected(RouteError::NotConnected)));
    assert!(matches!(f.bridge.poll("enc1").await, Err(CoreError::NotConnected)));
}
