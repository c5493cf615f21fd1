//! Stage-Gated Dispatch Table
//!
//! Maps message-type tags to (required stage, priority, handler). Built
//! once at startup and immutable afterwards; no runtime reflection. The
//! core safety property of the subsystem lives here: a message tagged for
//! stage X is only ever processed by a connection currently in stage X.
//! Anything else terminates the connection.

use std::collections::HashMap;

use tracing::warn;

use crate::network::envelope::{Envelope, PriorityTable};
use crate::network::protocol::ProtocolCore;
use crate::network::stage::{Stage, StageKind};
use crate::network::transport::ConnId;

/// A registered tag handler. Receives the protocol core, the connection,
/// the payload after the tag, and the stage that matched the gate.
pub type TagHandler = Box<dyn Fn(&mut ProtocolCore, ConnId, &[u8], &Stage) + Send>;

struct Entry {
    required: StageKind,
    handler: TagHandler,
}

/// Outcome of routing one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Matched a registration and the handler ran.
    Handled,
    /// Connection is already being torn down; message dropped.
    Ignored,
    /// No registration for the tag; falls through to default handling.
    Unhandled,
    /// Stage mismatch; connection terminated, handler not invoked.
    Rejected,
}

/// The tag → (required stage, priority, handler) registry.
#[derive(Default)]
pub struct DispatchTable {
    entries: HashMap<String, Entry>,
    priorities: PriorityTable,
}

impl DispatchTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tag at process start. Later registrations for the same
    /// tag replace earlier ones; nothing is registered after startup.
    pub fn register(&mut self, tag: &str, required: StageKind, priority: i8, handler: TagHandler) {
        self.priorities.set(tag, priority);
        self.entries.insert(tag.to_string(), Entry { required, handler });
    }

    /// The per-tag priority overrides accumulated by registration.
    pub fn priorities(&self) -> &PriorityTable {
        &self.priorities
    }

    /// Route one inbound envelope through the stage gate.
    pub fn dispatch(&self, core: &mut ProtocolCore, conn: ConnId, env: &Envelope) -> Verdict {
        if core.is_kicked(conn) {
            return Verdict::Ignored;
        }

        let Some(tag) = env.tag.as_deref() else {
            return Verdict::Unhandled;
        };
        let Some(entry) = self.entries.get(tag) else {
            return Verdict::Unhandled;
        };

        // Exact variant match. A missing stage never matches: the gate is
        // being bypassed if a gated tag arrives before the connect event.
        let stage = core.stage_of(conn).cloned();
        match stage {
            Some(stage) if stage.kind() == entry.required => {
                (entry.handler)(core, conn, &env.body, &stage);
                Verdict::Handled
            }
            current => {
                warn!(%conn, tag, ?current, "message for wrong protocol stage");
                core.panic_kick(conn, "invalid protocol state");
                Verdict::Rejected
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::network::envelope::{tagged, Channel, PRIORITY_HIGH};
    use crate::network::protocol::testing::test_core;
    use crate::network::stage::Stage;

    fn env_for(tag: &str) -> Envelope {
        Envelope::parse(Channel::ReliableBinary, &tagged(tag, &[1, 2]))
    }

    #[test]
    fn test_gate_rejects_wrong_stage() {
        let (mut core, transport) = test_core();
        let conn = ConnId(1);
        core.insert_test_conn(conn, Stage::Begin);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();

        let mut table = DispatchTable::new();
        table.register(
            "t.verify",
            StageKind::VerificationPending,
            PRIORITY_HIGH,
            Box::new(move |_, _, _, _| {
                calls2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let verdict = table.dispatch(&mut core, conn, &env_for("t.verify"));

        // Handler never invoked; connection terminated; stage is Panic.
        assert_eq!(verdict, Verdict::Rejected);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(core.stage_of(conn), Some(&Stage::Panic));
        assert_eq!(
            transport.close_reason(conn).as_deref(),
            Some("invalid protocol state")
        );
    }

    #[test]
    fn test_gate_passes_matching_stage() {
        let (mut core, transport) = test_core();
        let conn = ConnId(1);
        core.insert_test_conn(conn, Stage::Begin);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();

        let mut table = DispatchTable::new();
        table.register(
            "t.begin",
            StageKind::Begin,
            PRIORITY_HIGH,
            Box::new(move |_, _, body, stage| {
                assert_eq!(body, &[1, 2]);
                assert_eq!(stage, &Stage::Begin);
                calls2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert_eq!(
            table.dispatch(&mut core, conn, &env_for("t.begin")),
            Verdict::Handled
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!transport.is_closed(conn));
    }

    #[test]
    fn test_unregistered_tag_falls_through() {
        let (mut core, transport) = test_core();
        let conn = ConnId(1);
        core.insert_test_conn(conn, Stage::Begin);

        let table = DispatchTable::new();
        assert_eq!(
            table.dispatch(&mut core, conn, &env_for("game.move")),
            Verdict::Unhandled
        );
        // Falls through without gating: no kick, stage untouched.
        assert!(!transport.is_closed(conn));
        assert_eq!(core.stage_of(conn), Some(&Stage::Begin));
    }

    #[test]
    fn test_untagged_envelope_falls_through() {
        let (mut core, _transport) = test_core();
        let conn = ConnId(1);
        core.insert_test_conn(conn, Stage::Begin);

        let table = DispatchTable::new();
        let env = Envelope::parse(Channel::ReliableBinary, &[0xff, 0xff]);
        assert_eq!(table.dispatch(&mut core, conn, &env), Verdict::Unhandled);
    }

    #[test]
    fn test_kicked_connection_ignored() {
        let (mut core, _transport) = test_core();
        let conn = ConnId(1);
        core.insert_test_conn(conn, Stage::Begin);
        core.kick(conn, "test kick");

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();

        let mut table = DispatchTable::new();
        table.register(
            "t.begin",
            StageKind::Begin,
            PRIORITY_HIGH,
            Box::new(move |_, _, _, _| {
                calls2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert_eq!(
            table.dispatch(&mut core, conn, &env_for("t.begin")),
            Verdict::Ignored
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_missing_stage_fails_gate() {
        let (mut core, transport) = test_core();
        let conn = ConnId(7);
        // No connect event: no recorded stage at all.

        let mut table = DispatchTable::new();
        table.register(
            "t.begin",
            StageKind::Begin,
            PRIORITY_HIGH,
            Box::new(|_, _, _, _| {}),
        );

        assert_eq!(
            table.dispatch(&mut core, conn, &env_for("t.begin")),
            Verdict::Rejected
        );
        assert!(transport.is_closed(conn));
    }
}
