//! Property-based convergence tests.

use std::sync::Arc;

use proposal_collab::{
    ApplyOutcome, ChannelId, ChannelMessage, LocalChangeObserver, MemoryHub, RemoteUpdateApplier,
    SessionConfig, SessionTransport, SharedDocument,
};
use proptest::prelude::*;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

// =============================================================================
// Test helpers
// =============================================================================

#[derive(Clone, Debug)]
enum EditOp {
    Insert { pos_pct: f64, content: String },
    Delete { pos_pct: f64, len_pct: f64 },
}

fn arbitrary_edit_op() -> impl Strategy<Value = EditOp> {
    prop_oneof![
        3 => (0.0..=1.0f64, "[a-z ]{1,8}")
            .prop_map(|(pos_pct, content)| EditOp::Insert { pos_pct, content }),
        1 => (0.0..=1.0f64, 0.0..=0.5f64)
            .prop_map(|(pos_pct, len_pct)| EditOp::Delete { pos_pct, len_pct }),
    ]
}

fn apply_edit(document: &SharedDocument, op: &EditOp) {
    let len = document.len();
    match op {
        EditOp::Insert { pos_pct, content } => {
            let pos = ((*pos_pct * len as f64) as u32).min(len);
            document.insert(pos, content).unwrap();
        }
        EditOp::Delete { pos_pct, len_pct } => {
            if len == 0 {
                return;
            }
            let start = ((*pos_pct * len as f64) as u32).min(len - 1);
            let max_len = len - start;
            let count = ((*len_pct * max_len as f64) as u32).clamp(1, max_len);
            document.remove_range(start, count).unwrap();
        }
    }
}

fn document() -> SharedDocument {
    SharedDocument::new(ChannelId::for_project("prop").unwrap())
}

// =============================================================================
// Delivery-order properties
// =============================================================================

/// Record every delta a document publishes while `ops` run against it.
fn record_stream(source: &SharedDocument, ops: &[EditOp]) -> Vec<ChannelMessage> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut observer = LocalChangeObserver::install(source, tx).unwrap();
    for op in ops {
        apply_edit(source, op);
    }
    observer.detach();

    let mut messages = Vec::new();
    while let Ok(delta) = rx.try_recv() {
        messages.push(ChannelMessage::update(&delta));
    }
    messages
}

struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn below(&mut self, bound: usize) -> usize {
        (self.next() % bound as u64) as usize
    }
}

/// Merge two per-sender streams into one delivery schedule. Each sender's
/// messages keep their publish order; the senders interleave at random and
/// some already delivered messages are delivered again.
fn delivery_schedule(a: usize, b: usize, seed: u64) -> Vec<(usize, usize)> {
    let mut rng = XorShift(seed | 1);
    let (mut next_a, mut next_b) = (0, 0);
    let mut schedule: Vec<(usize, usize)> = Vec::with_capacity(a + b);
    while next_a < a || next_b < b {
        let take_a = next_b == b || (next_a < a && rng.next() % 2 == 0);
        if take_a {
            schedule.push((0, next_a));
            next_a += 1;
        } else {
            schedule.push((1, next_b));
            next_b += 1;
        }
        if rng.below(4) == 0 {
            let again = schedule[rng.below(schedule.len())];
            schedule.push(again);
        }
    }
    schedule
}

fn deliver(applier: &RemoteUpdateApplier<SharedDocument>, message: &ChannelMessage) -> bool {
    matches!(applier.apply(message), ApplyOutcome::Applied(_))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Two peers edit concurrently. A third replica receives both streams
    /// interleaved, in per-sender order, with redeliveries; each peer also
    /// receives the other's stream. All three end with the same text.
    #[test]
    fn interleaved_senders_with_redelivery_converge(
        ops_a in prop::collection::vec(arbitrary_edit_op(), 1..20),
        ops_b in prop::collection::vec(arbitrary_edit_op(), 1..20),
        seed in any::<u64>(),
    ) {
        let peer_a = Arc::new(document());
        let peer_b = Arc::new(document());
        let streams = [record_stream(&peer_a, &ops_a), record_stream(&peer_b, &ops_b)];

        let replica = Arc::new(document());
        let applier = RemoteUpdateApplier::new(replica.clone());
        for (sender, index) in delivery_schedule(streams[0].len(), streams[1].len(), seed) {
            prop_assert!(deliver(&applier, &streams[sender][index]));
        }

        let into_a = RemoteUpdateApplier::new(peer_a.clone());
        for message in &streams[1] {
            prop_assert!(deliver(&into_a, message));
        }
        let into_b = RemoteUpdateApplier::new(peer_b.clone());
        for message in &streams[0] {
            prop_assert!(deliver(&into_b, message));
        }

        prop_assert_eq!(peer_a.text(), peer_b.text());
        prop_assert_eq!(replica.text(), peer_a.text());
    }
}

// =============================================================================
// Live session properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Interleaved edits from several connected participants converge.
    #[test]
    fn interleaved_session_edits_converge(
        edits in prop::collection::vec((0usize..3, arbitrary_edit_op()), 1..20),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let texts = runtime.block_on(async {
            let hub = MemoryHub::new(1024);
            let mut participants = Vec::new();
            for _ in 0..3 {
                let doc = Arc::new(document());
                let session = SessionTransport::for_document(
                    doc.clone(),
                    Arc::new(hub.client()),
                    SessionConfig::default(),
                )
                .unwrap();
                session.connect().await.unwrap();
                participants.push((doc, session));
            }

            for (who, op) in &edits {
                apply_edit(&participants[*who].0, op);
                // Let some traffic through between edits.
                tokio::task::yield_now().await;
            }

            for _ in 0..300 {
                let first = participants[0].0.text();
                if participants.iter().all(|(doc, _)| doc.text() == first) {
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }

            let texts: Vec<String> = participants.iter().map(|(doc, _)| doc.text()).collect();
            for (_, session) in &participants {
                session.disconnect().await;
            }
            texts
        });

        prop_assert_eq!(&texts[0], &texts[1]);
        prop_assert_eq!(&texts[1], &texts[2]);
    }
}
