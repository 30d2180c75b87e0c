//! Integration tests for multi-participant sessions over the in-memory hub.
//!
//! Each participant gets its own `SharedDocument`, `SessionTransport` and
//! hub client, exactly as separate processes would over a real backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use proposal_collab::{
    decode_update, ChannelId, ConnectionStatus, CrdtDocument, Inbound, MemoryHub,
    MemoryTransport, PubSubTransport, SessionConfig, SessionError, SessionTransport,
    SharedDocument, TransportError, UPDATE_EVENT,
};
use serde_json::{json, Value};
use tokio::time::{sleep, timeout, Duration};

/// A publication seen by [`RecordingTransport`].
#[derive(Debug, Clone)]
struct Published {
    channel: String,
    event: String,
    payload: Value,
}

/// Memory client that records successful publications and can be told to
/// fail the next few.
struct RecordingTransport {
    inner: MemoryTransport,
    published: Mutex<Vec<Published>>,
    fail_next: AtomicUsize,
}

impl RecordingTransport {
    fn new(hub: &Arc<MemoryHub>) -> Arc<Self> {
        Arc::new(Self {
            inner: hub.client(),
            published: Mutex::new(Vec::new()),
            fail_next: AtomicUsize::new(0),
        })
    }

    fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    fn publish_count(&self) -> usize {
        self.published.lock().unwrap().len()
    }

    fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl PubSubTransport for RecordingTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.inner.connect().await
    }

    async fn subscribe(&self, channel: &ChannelId) -> Result<Inbound, TransportError> {
        self.inner.subscribe(channel).await
    }

    async fn publish(
        &self,
        channel: &ChannelId,
        event: &str,
        payload: Value,
    ) -> Result<(), TransportError> {
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Closed);
        }
        self.inner.publish(channel, event, payload.clone()).await?;
        self.published.lock().unwrap().push(Published {
            channel: channel.to_string(),
            event: event.to_string(),
            payload,
        });
        Ok(())
    }

    async fn unsubscribe(&self, channel: &ChannelId) -> Result<(), TransportError> {
        self.inner.unsubscribe(channel).await
    }
}

struct Participant {
    document: Arc<SharedDocument>,
    transport: Arc<RecordingTransport>,
    session: SessionTransport<SharedDocument>,
}

fn participant(hub: &Arc<MemoryHub>, project: &str) -> Participant {
    participant_with(hub, project, SessionConfig::default())
}

fn participant_with(hub: &Arc<MemoryHub>, project: &str, config: SessionConfig) -> Participant {
    let document = Arc::new(SharedDocument::new(ChannelId::for_project(project).unwrap()));
    let transport = RecordingTransport::new(hub);
    let session =
        SessionTransport::for_document(document.clone(), transport.clone(), config).unwrap();
    Participant {
        document,
        transport,
        session,
    }
}

/// Poll `check` for up to two seconds.
async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn test_local_edit_is_published_on_project_channel() {
    let hub = MemoryHub::new(64);
    let alice = participant(&hub, "42");
    alice.session.connect().await.unwrap();

    alice.document.push("Specific aims");
    assert!(eventually(|| alice.transport.publish_count() == 1).await);

    let published = alice.transport.published();
    assert_eq!(published[0].channel, "project:42");
    assert_eq!(published[0].event, UPDATE_EVENT);
    assert!(published[0].payload["update"].is_string());

    // The payload alone is enough to reproduce the edit elsewhere.
    let delta = decode_update(&published[0].payload).unwrap();
    let replica = SharedDocument::new(ChannelId::for_project("42").unwrap());
    replica
        .apply_update(&delta, proposal_collab::OriginTag::Remote)
        .unwrap();
    assert_eq!(replica.text(), "Specific aims");
}

#[tokio::test]
async fn test_edit_reaches_other_participant() {
    let hub = MemoryHub::new(64);
    let alice = participant(&hub, "42");
    let bob = participant(&hub, "42");
    alice.session.connect().await.unwrap();
    bob.session.connect().await.unwrap();

    alice.document.push("Hello");
    assert!(eventually(|| bob.document.text() == "Hello").await);
}

#[tokio::test]
async fn test_concurrent_edits_converge() {
    let hub = MemoryHub::new(64);
    let alice = participant(&hub, "42");
    let bob = participant(&hub, "42");
    alice.session.connect().await.unwrap();
    bob.session.connect().await.unwrap();

    alice.document.push("X");
    bob.document.push("Y");

    assert!(
        eventually(|| {
            let a = alice.document.text();
            a.len() == 2 && a == bob.document.text()
        })
        .await
    );
    let text = alice.document.text();
    assert!(text.contains('X') && text.contains('Y'));
}

#[tokio::test]
async fn test_applied_remote_update_is_not_echoed() {
    let hub = MemoryHub::new(64);
    let alice = participant(&hub, "42");
    let bob = participant(&hub, "42");
    alice.session.connect().await.unwrap();
    bob.session.connect().await.unwrap();

    alice.document.push("one edit");
    assert!(eventually(|| bob.document.text() == "one edit").await);

    sleep(Duration::from_millis(100)).await;
    assert_eq!(bob.transport.publish_count(), 0);
    assert_eq!(alice.transport.publish_count(), 1);
}

#[tokio::test]
async fn test_remote_update_handler_runs_once_per_message() {
    let hub = MemoryHub::new(64);
    let alice = participant(&hub, "42");
    let bob = participant(&hub, "42");

    let seen = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
    let sink = seen.clone();
    bob.session
        .on_remote_update(move |delta| sink.lock().unwrap().push(delta.to_vec()));

    alice.session.connect().await.unwrap();
    bob.session.connect().await.unwrap();

    alice.document.push("a");
    alice.document.push("b");
    assert!(eventually(|| seen.lock().unwrap().len() == 2).await);

    let first = alice.transport.published()[0].payload.clone();
    assert_eq!(seen.lock().unwrap()[0], decode_update(&first).unwrap());
}

#[tokio::test]
async fn test_channels_are_isolated_by_project() {
    let hub = MemoryHub::new(64);
    let alice = participant(&hub, "42");
    let carol = participant(&hub, "43");
    alice.session.connect().await.unwrap();
    carol.session.connect().await.unwrap();

    alice.document.push("private to 42");
    assert!(eventually(|| alice.transport.publish_count() == 1).await);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(carol.document.text(), "");
}

#[tokio::test]
async fn test_disconnect_is_idempotent_and_stops_traffic() {
    let hub = MemoryHub::new(64);
    let alice = participant(&hub, "42");
    let bob = participant(&hub, "42");
    alice.session.connect().await.unwrap();
    bob.session.connect().await.unwrap();

    alice.session.disconnect().await;
    alice.session.disconnect().await;
    assert_eq!(alice.session.status(), ConnectionStatus::Disconnected);

    // Outbound: nothing leaves a torn-down session.
    alice.document.push("after teardown");
    sleep(Duration::from_millis(50)).await;
    assert_eq!(alice.transport.publish_count(), 0);
    assert_eq!(bob.document.text(), "");

    // Inbound: nothing is applied to a torn-down session.
    bob.document.push("from bob");
    assert!(eventually(|| bob.transport.publish_count() == 1).await);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(alice.document.text(), "after teardown");
}

#[tokio::test]
async fn test_disconnect_without_connect() {
    let hub = MemoryHub::new(64);
    let alice = participant(&hub, "42");
    alice.session.disconnect().await;
    assert_eq!(alice.session.status(), ConnectionStatus::Disconnected);
    assert_eq!(alice.session.connect().await, Err(SessionError::Closed));
}

#[tokio::test]
async fn test_malformed_messages_do_not_break_the_session() {
    let hub = MemoryHub::new(64);
    let alice = participant(&hub, "42");
    let bob = participant(&hub, "42");
    alice.session.connect().await.unwrap();
    bob.session.connect().await.unwrap();

    let rogue = hub.client();
    rogue.connect().await.unwrap();
    let channel = ChannelId::for_project("42").unwrap();
    rogue
        .publish(&channel, UPDATE_EVENT, json!({ "update": "%%% not base64" }))
        .await
        .unwrap();
    rogue
        .publish(&channel, UPDATE_EVENT, json!({ "something": "else" }))
        .await
        .unwrap();
    rogue
        .publish(&channel, "cursor", json!({ "position": 4 }))
        .await
        .unwrap();

    alice.document.push("still works");
    assert!(eventually(|| bob.document.text() == "still works").await);
    assert_eq!(bob.session.status(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn test_edits_before_connect_are_flushed_in_order() {
    let hub = MemoryHub::new(64);
    let alice = participant(&hub, "42");
    let bob = participant(&hub, "42");
    bob.session.connect().await.unwrap();

    alice.document.push("first ");
    alice.document.push("second ");
    alice.document.push("third");
    assert_eq!(alice.transport.publish_count(), 0);

    alice.session.connect().await.unwrap();
    assert!(eventually(|| alice.transport.publish_count() == 3).await);
    assert!(eventually(|| bob.document.text() == "first second third").await);

    // Applying the recorded deltas in publication order reproduces the text.
    let replica = SharedDocument::new(ChannelId::for_project("42").unwrap());
    for published in alice.transport.published() {
        let delta = decode_update(&published.payload).unwrap();
        replica
            .apply_update(&delta, proposal_collab::OriginTag::Remote)
            .unwrap();
    }
    assert_eq!(replica.text(), "first second third");
}

#[tokio::test]
async fn test_failed_publish_is_retried_in_order() {
    let hub = MemoryHub::new(64);
    let alice = participant(&hub, "42");
    let bob = participant(&hub, "42");
    alice.session.connect().await.unwrap();
    bob.session.connect().await.unwrap();

    alice.transport.fail_next(1);
    alice.document.push("kept ");
    assert!(eventually(|| {
        alice.transport.fail_next.load(Ordering::SeqCst) == 0
    })
    .await);
    sleep(Duration::from_millis(20)).await;
    assert_eq!(alice.transport.publish_count(), 0);
    assert_eq!(alice.session.pending_len().await, 1);

    alice.document.push("then sent");
    assert!(eventually(|| alice.transport.publish_count() == 2).await);
    assert!(eventually(|| bob.document.text() == "kept then sent").await);
    assert_eq!(alice.session.pending_len().await, 0);
}

#[tokio::test]
async fn test_connect_failure_reports_error_and_can_retry() {
    let hub = MemoryHub::new(64);
    let alice = participant(&hub, "42");
    let mut statuses = alice.session.subscribe_status();

    hub.set_reachable(false);
    let err = alice.session.connect().await.unwrap_err();
    assert!(matches!(err, SessionError::Transport(TransportError::Unreachable(_))));
    assert_eq!(statuses.recv().await.unwrap(), ConnectionStatus::Connecting);
    assert_eq!(statuses.recv().await.unwrap(), ConnectionStatus::Error);

    hub.set_reachable(true);
    alice.session.connect().await.unwrap();
    assert_eq!(statuses.recv().await.unwrap(), ConnectionStatus::Connecting);
    assert_eq!(statuses.recv().await.unwrap(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn test_rejected_subscription_is_an_error() {
    let hub = MemoryHub::new(64);
    hub.reject_channel(&ChannelId::for_project("42").unwrap()).await;
    let alice = participant(&hub, "42");

    let err = alice.session.connect().await.unwrap_err();
    assert!(matches!(err, SessionError::Transport(TransportError::Rejected { .. })));
    assert_eq!(alice.session.status(), ConnectionStatus::Error);
}

#[tokio::test]
async fn test_reconnect_after_lost_subscription() {
    let hub = MemoryHub::new(64);
    let document = Arc::new(SharedDocument::new(ChannelId::for_project("42").unwrap()));
    let transport = Arc::new(hub.client());
    let alice = SessionTransport::for_document(
        document.clone(),
        transport.clone(),
        SessionConfig::default(),
    )
    .unwrap();
    let bob = participant(&hub, "42");
    alice.connect().await.unwrap();
    bob.session.connect().await.unwrap();

    transport.sever().await;
    assert!(eventually(|| alice.status() == ConnectionStatus::Disconnected).await);

    document.push("written while offline");
    sleep(Duration::from_millis(50)).await;
    assert_eq!(bob.document.text(), "");
    assert_eq!(alice.pending_len().await, 1);

    alice.connect().await.unwrap();
    assert!(eventually(|| bob.document.text() == "written while offline").await);

    // And inbound works again too.
    bob.document.push("!");
    assert!(eventually(|| document.text() == "written while offline!").await);
}

#[tokio::test]
async fn test_announce_state_on_connect() {
    let hub = MemoryHub::new(64);
    let bob = participant(&hub, "42");
    bob.session.connect().await.unwrap();

    let document = Arc::new(SharedDocument::new(ChannelId::for_project("42").unwrap()));
    document.push("drafted before the session existed");

    let config = SessionConfig {
        announce_state_on_connect: true,
        ..SessionConfig::default()
    };
    let alice = SessionTransport::for_document(document, Arc::new(hub.client()), config).unwrap();
    alice.connect().await.unwrap();

    assert!(
        eventually(|| bob.document.text() == "drafted before the session existed").await
    );
}

#[tokio::test]
async fn test_second_session_on_same_document_is_refused() {
    let hub = MemoryHub::new(64);
    let alice = participant(&hub, "42");

    let again = SessionTransport::for_document(
        alice.document.clone(),
        Arc::new(hub.client()),
        SessionConfig::default(),
    );
    assert!(matches!(again, Err(SessionError::AlreadyBound)));
}

#[tokio::test]
async fn test_many_participants_converge() {
    let hub = MemoryHub::new(256);
    let participants: Vec<Participant> = (0..5).map(|_| participant(&hub, "7")).collect();
    for p in &participants {
        p.session.connect().await.unwrap();
    }

    for (i, p) in participants.iter().enumerate() {
        p.document.push(&format!("[{i}]"));
    }

    let converged = timeout(Duration::from_secs(5), async {
        loop {
            let first = participants[0].document.text();
            if first.len() == 15 && participants.iter().all(|p| p.document.text() == first) {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(converged.is_ok(), "replicas did not converge");
}

#[tokio::test]
async fn test_lagging_sessions_report_disconnected_and_can_reconnect() {
    let hub = MemoryHub::new(4);
    let alice = participant(&hub, "42");
    let bob = participant(&hub, "42");
    alice.session.connect().await.unwrap();
    bob.session.connect().await.unwrap();

    // A burst on the channel that neither subscriber keeps up with.
    let flood = hub.client();
    flood.connect().await.unwrap();
    let channel = ChannelId::for_project("42").unwrap();
    for i in 0..1000 {
        flood.publish(&channel, "cursor", json!({ "n": i })).await.unwrap();
    }
    assert!(eventually(|| alice.session.status() == ConnectionStatus::Disconnected).await);
    assert!(eventually(|| bob.session.status() == ConnectionStatus::Disconnected).await);

    alice.session.connect().await.unwrap();
    bob.session.connect().await.unwrap();
    bob.document.push("after the burst");
    assert!(eventually(|| alice.document.text() == "after the burst").await);
}
