//! Protocol Context & Event Loop
//!
//! A single `Protocol` object constructed at process start owns every
//! mutable registry: connection stages, live-connection metadata, the DoS
//! guard, bound sessions. All of it is touched from one serial event loop
//! fed by the host transport, so there is no locking anywhere in the core.
//! Steps that must not run inline (handoff, timers) post continuation
//! events back into the same loop and revalidate the connection on
//! re-entry.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace};

use crate::network::dispatch::{DispatchTable, Verdict};
use crate::network::envelope::{tagged, Channel, Envelope, PriorityTable};
use crate::network::guard::DosGuard;
use crate::network::handshake::{self, LegacyJoin};
use crate::network::session::{GameHooks, LifecycleEvent, PlayerSession};
use crate::network::stage::{ConnectionStates, Stage};
use crate::network::transport::{ConnId, OutboundFrame, Transport};
use crate::{MIN_COMPAT_VERSION, NONCE_LEN};

/// Configuration supplied by the surrounding process.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// The server's address as clients dial it; bound into every proof.
    pub advertised_addr: String,
    /// Minimum accepted enhanced-protocol version.
    pub min_compat_version: u32,
    /// Blacklist duration after a duplicate-connection event.
    pub dos_cooldown: Duration,
    /// How long a connection may sit in verification before being reset.
    pub verify_timeout: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            advertised_addr: "127.0.0.1:8080".to_string(),
            min_compat_version: MIN_COMPAT_VERSION,
            dos_cooldown: Duration::from_secs(60 * 60 * 24),
            verify_timeout: Duration::from_secs(10),
        }
    }
}

/// Events delivered to the protocol loop.
#[derive(Debug)]
pub enum ProtocolEvent {
    /// Transport accepted a connection.
    Connected {
        /// The new handle.
        conn: ConnId,
        /// Source address.
        addr: IpAddr,
    },
    /// Transport dropped a connection.
    Disconnected {
        /// The dropped handle.
        conn: ConnId,
    },
    /// A raw frame arrived on one of the four wire shapes.
    Frame {
        /// Receiving connection.
        conn: ConnId,
        /// Wire shape.
        channel: Channel,
        /// Raw frame bytes, tag not yet extracted.
        raw: Vec<u8>,
    },
    /// The host transport's own legacy join packet.
    LegacyJoin {
        /// Joining connection.
        conn: ConnId,
        /// Parsed join fields.
        join: LegacyJoin,
    },
    /// Continuation: finalize handoff for a promoted connection.
    CompleteHandoff {
        /// The promoted connection.
        conn: ConnId,
    },
    /// Timer: the verification window for a challenge elapsed.
    VerifyTimeout {
        /// Connection the challenge was issued to.
        conn: ConnId,
        /// Nonce of that challenge, for revalidation.
        nonce: [u8; NONCE_LEN],
    },
    /// Timer: a blacklist entry's cooldown elapsed.
    BlacklistExpired {
        /// Address to unban.
        addr: IpAddr,
    },
}

/// Per-connection metadata tracked while the handle is live.
#[derive(Debug)]
struct ConnMeta {
    addr: IpAddr,
    kicked: bool,
}

/// The mutable half of the protocol: every registry, plus the narrow
/// channels back out (transport, game hooks, lifecycle, self-post).
pub struct ProtocolCore {
    /// Process-level configuration.
    pub(crate) config: ProtocolConfig,
    /// Stage registry (authoritative).
    states: ConnectionStates,
    /// Duplicate-connection / DoS guard.
    pub(crate) guard: DosGuard,
    /// Live-connection metadata.
    conns: HashMap<ConnId, ConnMeta>,
    /// Sessions bound at handoff.
    sessions: HashMap<ConnId, PlayerSession>,
    /// Per-tag priority overrides (snapshot of the dispatch table's).
    priorities: PriorityTable,
    /// Game-layer collaborator.
    pub(crate) hooks: Arc<dyn GameHooks>,
    transport: Arc<dyn Transport>,
    tx: mpsc::UnboundedSender<ProtocolEvent>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
}

impl ProtocolCore {
    /// Current stage of a connection.
    pub fn stage_of(&self, conn: ConnId) -> Option<&Stage> {
        self.states.get(conn)
    }

    /// Record a connection's stage.
    pub(crate) fn set_stage(&mut self, conn: ConnId, stage: Stage) {
        self.states.set(conn, stage);
    }

    /// Track a freshly accepted connection.
    pub(crate) fn register_conn(&mut self, conn: ConnId, addr: IpAddr) {
        self.conns.insert(conn, ConnMeta { addr, kicked: false });
    }

    /// Whether the connection is still tracked as live.
    pub(crate) fn is_live(&self, conn: ConnId) -> bool {
        self.conns.contains_key(&conn)
    }

    /// Whether the connection is already being torn down.
    pub fn is_kicked(&self, conn: ConnId) -> bool {
        self.conns.get(&conn).map(|m| m.kicked).unwrap_or(false)
    }

    /// Terminate a connection, delivering the reason to the peer. The
    /// kicked flag drops any buffered or future frames from the handle.
    pub fn kick(&mut self, conn: ConnId, reason: &str) {
        let addr = match self.conns.get_mut(&conn) {
            Some(meta) => {
                if meta.kicked {
                    return;
                }
                meta.kicked = true;
                Some(meta.addr)
            }
            None => None,
        };
        debug!(%conn, ?addr, reason, "closing connection");
        self.transport.close(conn, reason);
    }

    /// Protocol violation: absorb into `Panic` and terminate. Entering
    /// `Panic` always actively closes the transport connection.
    pub fn panic_kick(&mut self, conn: ConnId, reason: &str) {
        self.states.set(conn, Stage::Panic);
        self.kick(conn, reason);
    }

    /// Send a tagged payload, applying the tag's priority override.
    pub fn send_tagged(&self, conn: ConnId, tag: &str, body: &[u8], channel: Channel) {
        let priority = self.priorities.priority_for(Some(tag), channel);
        self.transport.send(
            conn,
            OutboundFrame {
                channel,
                priority,
                bytes: tagged(tag, body),
            },
        );
    }

    /// Bind a session to a connection.
    pub(crate) fn bind_session(&mut self, conn: ConnId, session: PlayerSession) {
        self.sessions.insert(conn, session);
    }

    /// Detach a connection's session, if bound.
    pub(crate) fn take_session(&mut self, conn: ConnId) -> Option<PlayerSession> {
        self.sessions.remove(&conn)
    }

    /// The session bound to a connection, if any.
    pub fn session_of(&self, conn: ConnId) -> Option<&PlayerSession> {
        self.sessions.get(&conn)
    }

    /// Post an event back into the loop (continuations).
    pub(crate) fn post(&self, ev: ProtocolEvent) {
        let _ = self.tx.send(ev);
    }

    /// Post an event after a delay (timers). The firing re-enters the
    /// serial loop like any other event.
    pub(crate) fn schedule(&self, delay: Duration, ev: ProtocolEvent) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(ev);
        });
    }

    /// Emit a lifecycle event to subscribers.
    pub(crate) fn emit(&self, ev: LifecycleEvent) {
        let _ = self.lifecycle.send(ev);
    }

    fn drop_conn(&mut self, conn: ConnId) {
        self.states.remove(conn);
        self.guard.untrack(conn);
        self.conns.remove(&conn);
        self.sessions.remove(&conn);
    }

    /// Live connections currently tracked.
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }
}

/// The protocol subsystem: dispatch table plus mutable core plus the
/// event inbox.
pub struct Protocol {
    core: ProtocolCore,
    table: DispatchTable,
    rx: mpsc::UnboundedReceiver<ProtocolEvent>,
}

impl Protocol {
    /// Build the protocol context. The dispatch table is populated here,
    /// once, and never mutated again.
    pub fn new(
        config: ProtocolConfig,
        transport: Arc<dyn Transport>,
        hooks: Arc<dyn GameHooks>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (lifecycle, _) = broadcast::channel(64);

        let mut table = DispatchTable::new();
        handshake::register(&mut table);

        let core = ProtocolCore {
            config,
            states: ConnectionStates::new(),
            guard: DosGuard::new(),
            conns: HashMap::new(),
            sessions: HashMap::new(),
            priorities: table.priorities().clone(),
            hooks,
            transport,
            tx,
            lifecycle,
        };

        Self { core, table, rx }
    }

    /// Sender half for the host transport to deliver events.
    pub fn sender(&self) -> mpsc::UnboundedSender<ProtocolEvent> {
        self.core.tx.clone()
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.core.lifecycle.subscribe()
    }

    /// Drive the serial event loop until every sender is gone.
    pub async fn run(mut self) {
        info!(addr = %self.core.config.advertised_addr, "protocol loop running");
        while let Some(ev) = self.rx.recv().await {
            self.handle_event(ev);
        }
        debug!("protocol loop stopped");
    }

    /// Process one event. All stage transitions happen inside this call,
    /// atomically with respect to the connection.
    pub fn handle_event(&mut self, ev: ProtocolEvent) {
        match ev {
            ProtocolEvent::Connected { conn, addr } => {
                handshake::handle_connect(&mut self.core, conn, addr);
            }
            ProtocolEvent::Disconnected { conn } => {
                debug!(%conn, "connection dropped");
                self.core.drop_conn(conn);
            }
            ProtocolEvent::Frame { conn, channel, raw } => {
                let env = Envelope::parse(channel, &raw);
                match self.table.dispatch(&mut self.core, conn, &env) {
                    Verdict::Unhandled => {
                        trace!(%conn, tag = ?env.tag, "frame fell through to default handling");
                    }
                    verdict => {
                        trace!(%conn, tag = ?env.tag, ?verdict, "frame dispatched");
                    }
                }
            }
            ProtocolEvent::LegacyJoin { conn, join } => {
                handshake::handle_legacy_join(&mut self.core, conn, join);
            }
            ProtocolEvent::CompleteHandoff { conn } => {
                handshake::complete_handoff(&mut self.core, conn);
            }
            ProtocolEvent::VerifyTimeout { conn, nonce } => {
                handshake::handle_verify_timeout(&mut self.core, conn, nonce);
            }
            ProtocolEvent::BlacklistExpired { addr } => {
                debug!(%addr, "blacklist entry expired");
                self.core.guard.unblacklist(addr);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use super::*;
    use crate::network::session::DefaultHooks;
    use crate::network::transport::testing::RecordingTransport;

    impl ProtocolCore {
        /// Insert a live connection with a preset stage, bypassing the
        /// connect flow.
        pub(crate) fn insert_test_conn(&mut self, conn: ConnId, stage: Stage) {
            self.register_conn(conn, std::net::IpAddr::from([127, 0, 0, 1]));
            self.set_stage(conn, stage);
        }
    }

    impl Protocol {
        /// The core, for state assertions.
        pub(crate) fn core(&self) -> &ProtocolCore {
            &self.core
        }

        /// Mutable core access, for direct state manipulation.
        pub(crate) fn core_mut(&mut self) -> &mut ProtocolCore {
            &mut self.core
        }

        /// Synchronously process every event already posted to the inbox
        /// (continuations and fired timers).
        pub(crate) fn drain_posted(&mut self) {
            while let Ok(ev) = self.rx.try_recv() {
                self.handle_event(ev);
            }
        }
    }

    fn config(advertised: &str) -> ProtocolConfig {
        ProtocolConfig {
            advertised_addr: advertised.to_string(),
            ..ProtocolConfig::default()
        }
    }

    /// A standalone core for table-level tests.
    pub(crate) fn test_core() -> (ProtocolCore, Arc<RecordingTransport>) {
        let (p, transport) = test_protocol("127.0.0.1:8080");
        (p.core, transport)
    }

    /// A full protocol with recording transport and default hooks.
    pub(crate) fn test_protocol(advertised: &str) -> (Protocol, Arc<RecordingTransport>) {
        test_protocol_with_hooks(advertised, DefaultHooks)
    }

    /// A full protocol with recording transport and custom hooks.
    pub(crate) fn test_protocol_with_hooks<H: GameHooks + 'static>(
        advertised: &str,
        hooks: H,
    ) -> (Protocol, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::new());
        let protocol = Protocol::new(config(advertised), transport.clone(), Arc::new(hooks));
        (protocol, transport)
    }
}
