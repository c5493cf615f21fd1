//! Handshake Engine
//!
//! The challenge-response state machine layered over the host transport:
//! key submission, nonce/timestamp challenge issuance, proof verification,
//! and promotion into a terminal stage - alongside the legacy join path
//! that bypasses the cryptographic steps. All handlers run on the protocol
//! event loop; the only suspension point is the handoff continuation, which
//! re-enters the loop and revalidates the connection before finalizing.

use std::net::IpAddr;
use std::time::Instant;

use chrono::Utc;
use rsa::pkcs8::EncodePublicKey;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::network::crypto::{generate_nonce, key_fingerprint, parse_public_key, recover_proof};
use crate::network::dispatch::DispatchTable;
use crate::network::envelope::{Channel, PRIORITY_HIGH};
use crate::network::protocol::{ProtocolCore, ProtocolEvent};
use crate::network::session::{validate_name, LifecycleEvent, PlayerSession, SessionAuth};
use crate::network::stage::{Stage, StageKind};
use crate::network::transport::ConnId;
use crate::network::wire::{WireError, WireReader, WireWriter};
use crate::{AUTH_MAGIC, NONCE_LEN};

/// Tag for the client's public-key submission.
pub const TAG_CONNECT: &str = "warden.connect";
/// Tag for the server's nonce/timestamp challenge.
pub const TAG_CHALLENGE: &str = "warden.challenge";
/// Tag for the client's signed proof.
pub const TAG_PROVE: &str = "warden.prove";
/// Tag for the world snapshot pushed after handoff.
pub const TAG_SNAPSHOT: &str = "warden.snapshot";

/// Register the handshake's tag handlers. Called once at process start.
pub(crate) fn register(table: &mut DispatchTable) {
    table.register(
        TAG_CONNECT,
        StageKind::Begin,
        PRIORITY_HIGH,
        Box::new(on_key_submission),
    );
    table.register(
        TAG_PROVE,
        StageKind::VerificationPending,
        PRIORITY_HIGH,
        Box::new(on_proof),
    );
}

/// Transport-level connect event.
///
/// A handle that already carries a stage is a duplicate/replay attempt and
/// is closed outright. Fresh handles start at `Begin`, then the DoS guard
/// gets its say: two or more live connections from one address close all
/// of them and blacklist the address for the configured cooldown.
pub(crate) fn handle_connect(core: &mut ProtocolCore, conn: ConnId, addr: IpAddr) {
    if core.stage_of(conn).is_some() {
        warn!(%conn, %addr, "connect event for a handle with recorded state");
        core.kick(conn, "duplicate connection");
        return;
    }

    if core.guard.is_blacklisted(addr) {
        debug!(%conn, %addr, "connect from blacklisted address");
        core.kick(conn, "address temporarily blocked");
        return;
    }

    core.register_conn(conn, addr);
    core.set_stage(conn, Stage::Begin);
    core.guard.track(conn, addr);

    let peers = core.guard.peers_of(addr);
    if peers.len() >= 2 {
        let cooldown = core.config.dos_cooldown;
        core.guard.blacklist(addr, Instant::now() + cooldown);
        core.schedule(cooldown, ProtocolEvent::BlacklistExpired { addr });
        warn!(%addr, count = peers.len(), "simultaneous connections from one address, blacklisting");
        for peer in peers {
            core.panic_kick(peer, "too many connections");
        }
    }

    core.emit(LifecycleEvent::ConnectionOpened { conn });
}

/// `Begin → VerificationPending`: parse the submitted key, issue a fresh
/// challenge.
fn on_key_submission(core: &mut ProtocolCore, conn: ConnId, payload: &[u8], _stage: &Stage) {
    let mut reader = WireReader::new(payload);
    let der = match reader.read_block() {
        Ok(der) => der,
        Err(e) => {
            error!(%conn, error = %e, "malformed key submission");
            core.panic_kick(conn, "protocol error");
            return;
        }
    };
    let key = match parse_public_key(der) {
        Ok(key) => key,
        Err(e) => {
            error!(%conn, error = %e, "rejecting key submission");
            core.panic_kick(conn, "protocol error");
            return;
        }
    };

    // A momentarily unavailable random source fails this connection, not
    // the process.
    let nonce = match generate_nonce() {
        Ok(nonce) => nonce,
        Err(e) => {
            error!(%conn, error = %e, "nonce generation failed");
            core.panic_kick(conn, "protocol error");
            return;
        }
    };
    let issued_at = Utc::now().timestamp_millis();

    let mut challenge = WireWriter::new();
    challenge.put_bytes(&nonce).put_i64(issued_at);
    core.send_tagged(conn, TAG_CHALLENGE, &challenge.into_bytes(), Channel::ReliableBinary);

    core.set_stage(
        conn,
        Stage::VerificationPending {
            key,
            nonce,
            issued_at,
        },
    );
    core.schedule(
        core.config.verify_timeout,
        ProtocolEvent::VerifyTimeout { conn, nonce },
    );
    debug!(%conn, nonce = %hex::encode(nonce), "challenge issued");
}

/// Identity and capability fields sent alongside the proof ciphertext.
#[derive(Debug)]
struct ClientHello {
    compat_version: u32,
    name: String,
    mods: Vec<String>,
    mobile: bool,
    client_flavor: String,
    color: u32,
    usid: String,
    uuid: String,
    locale: String,
}

fn read_client_hello(reader: &mut WireReader<'_>) -> Result<ClientHello, WireError> {
    let compat_version = reader.read_u32()?;
    let name = reader.read_string()?;
    let mod_count = reader.read_u16()?;
    let mut mods = Vec::with_capacity(mod_count as usize);
    for _ in 0..mod_count {
        mods.push(reader.read_string()?);
    }
    let mobile = reader.read_bool()?;
    let client_flavor = reader.read_string()?;
    let color = reader.read_u32()?;
    let usid = reader.read_string()?;
    let uuid = reader.read_string()?;
    let locale = reader.read_string()?;

    Ok(ClientHello {
        compat_version,
        name,
        mods,
        mobile,
        client_flavor,
        color,
        usid,
        uuid,
        locale,
    })
}

/// `VerificationPending → Authenticated` or `Panic`: recover the proof
/// plaintext and compare byte-exact against the server's own construction.
fn on_proof(core: &mut ProtocolCore, conn: ConnId, payload: &[u8], stage: &Stage) {
    let Stage::VerificationPending {
        key,
        nonce,
        issued_at,
    } = stage
    else {
        // The gate only routes matching stages here.
        return;
    };

    let mut reader = WireReader::new(payload);
    let cipher = match reader.read_block() {
        Ok(cipher) => cipher,
        Err(e) => {
            error!(%conn, error = %e, "malformed proof payload");
            core.panic_kick(conn, "protocol error");
            return;
        }
    };

    let recovered = match recover_proof(key, cipher) {
        Ok(data) => data,
        Err(e) => {
            error!(%conn, error = %e, "proof recovery failed");
            core.panic_kick(conn, "protocol error");
            return;
        }
    };

    let expected = expected_proof(&core.config.advertised_addr, nonce, *issued_at);
    if recovered != expected {
        // Field-by-field breakdown for the operator log only; the
        // accept/reject decision was already made by the byte compare.
        let diagnosis = diagnose_proof(&recovered, &core.config.advertised_addr, nonce, *issued_at);
        error!(%conn, %diagnosis, "key validation error");
        core.panic_kick(conn, "key validation failure");
        return;
    }

    let hello = match read_client_hello(&mut reader) {
        Ok(hello) => hello,
        Err(e) => {
            error!(%conn, error = %e, "malformed client hello");
            core.panic_kick(conn, "protocol error");
            return;
        }
    };

    if hello.compat_version < core.config.min_compat_version {
        warn!(%conn, version = hello.compat_version, "client protocol version too low");
        core.panic_kick(conn, "unsupported protocol version");
        return;
    }

    let name = match validate_name(&hello.name) {
        Ok(name) => name,
        Err(e) => {
            core.panic_kick(conn, &e.to_string());
            return;
        }
    };

    let fingerprint = match key.to_public_key_der() {
        Ok(der) => key_fingerprint(der.as_bytes()),
        Err(e) => {
            error!(%conn, error = %e, "key re-encoding failed");
            core.panic_kick(conn, "protocol error");
            return;
        }
    };

    let session = PlayerSession {
        id: Uuid::new_v4(),
        conn,
        name,
        uuid: hello.uuid,
        usid: hello.usid,
        locale: hello.locale,
        color: hello.color,
        mobile: hello.mobile,
        mods: hello.mods,
        client_flavor: hello.client_flavor,
        team: 0,
        auth: SessionAuth::Enhanced {
            key_fingerprint: fingerprint,
            compat_version: hello.compat_version,
        },
    };

    info!(%conn, name = %session.name, version = hello.compat_version, "handshake complete");
    core.set_stage(
        conn,
        Stage::Authenticated {
            key: key.clone(),
            compat_version: hello.compat_version,
        },
    );
    core.bind_session(conn, session);
    core.post(ProtocolEvent::CompleteHandoff { conn });
}

/// Legacy join packet fields, parsed by the front end from the host
/// transport's own connect handshake.
#[derive(Debug, Clone)]
pub struct LegacyJoin {
    /// Requested display name.
    pub name: String,
    /// Client-reported persistent id.
    pub uuid: String,
    /// Client-reported per-server id.
    pub usid: String,
    /// Mobile client flag.
    pub mobile: bool,
    /// Player color as packed RGBA.
    pub color: u32,
    /// Client locale.
    pub locale: String,
}

impl LegacyJoin {
    /// Decode a legacy join payload.
    pub fn read(payload: &[u8]) -> Result<Self, WireError> {
        let mut reader = WireReader::new(payload);
        Ok(Self {
            name: reader.read_string()?,
            uuid: reader.read_string()?,
            usid: reader.read_string()?,
            mobile: reader.read_bool()?,
            color: reader.read_u32()?,
            locale: reader.read_string()?,
        })
    }
}

/// The legacy (unauthenticated) join path. Only accepted while the
/// connection is still in `Begin`; a repeat join is a protocol violation
/// and any other stage ignores it (the enhanced path has taken over).
pub(crate) fn handle_legacy_join(core: &mut ProtocolCore, conn: ConnId, join: LegacyJoin) {
    core.emit(LifecycleEvent::LegacyJoin { conn });

    match core.stage_of(conn) {
        Some(Stage::LegacyClient) => {
            core.panic_kick(conn, "invalid protocol state");
            return;
        }
        Some(Stage::Begin) => {}
        _ => return,
    }
    core.set_stage(conn, Stage::LegacyClient);

    let name = match validate_name(&join.name) {
        Ok(name) => name,
        Err(e) => {
            core.panic_kick(conn, &e.to_string());
            return;
        }
    };

    if !core.hooks.identity_allowed(&join.uuid, &join.usid) {
        info!(%conn, uuid = %join.uuid, "identity rejected on legacy join");
        core.panic_kick(conn, "you are banned from this server");
        return;
    }

    let session = PlayerSession {
        id: Uuid::new_v4(),
        conn,
        name,
        uuid: join.uuid,
        usid: join.usid,
        locale: join.locale,
        color: join.color,
        mobile: join.mobile,
        mods: Vec::new(),
        client_flavor: String::new(),
        team: 0,
        auth: SessionAuth::Legacy,
    };

    info!(%conn, name = %session.name, "legacy client joined");
    core.bind_session(conn, session);
    core.post(ProtocolEvent::CompleteHandoff { conn });
}

/// Verification-window timer. The nonce comparison revalidates identity:
/// a connection that completed (or restarted the handshake) carries a
/// different nonce and is untouched.
pub(crate) fn handle_verify_timeout(core: &mut ProtocolCore, conn: ConnId, nonce: [u8; NONCE_LEN]) {
    if let Some(Stage::VerificationPending { nonce: current, .. }) = core.stage_of(conn) {
        if *current == nonce {
            warn!(%conn, "verification window expired");
            core.panic_kick(conn, "handshake timed out");
        }
    }
}

/// Handoff continuation, re-entering the serial loop after promotion.
///
/// Revalidates before finalizing: the connection may have dropped or been
/// kicked while the continuation was queued. The announce write gates the
/// snapshot and the lifecycle event; its failure kicks with a generic
/// reason and discards the session.
pub(crate) fn complete_handoff(core: &mut ProtocolCore, conn: ConnId) {
    if core.is_kicked(conn) || !core.is_live(conn) {
        return;
    }
    if !core.stage_of(conn).is_some_and(Stage::is_terminal_success) {
        return;
    }
    let Some(mut session) = core.take_session(conn) else {
        return;
    };

    session.team = core.hooks.assign_team(&session);

    match core.hooks.write_announce(&session) {
        Ok(bytes) => debug!(%conn, len = bytes.len(), "announce written"),
        Err(e) => {
            warn!(%conn, error = %e, "handoff failed, dropping session");
            core.kick(conn, "failed to join");
            return;
        }
    }

    let snapshot = core.hooks.world_snapshot(&session);
    core.send_tagged(conn, TAG_SNAPSHOT, &snapshot, Channel::ReliableBinary);

    core.emit(LifecycleEvent::PlayerConnected {
        conn,
        session: session.id,
        name: session.name.clone(),
        enhanced: session.auth.is_enhanced(),
    });
    info!(%conn, name = %session.name, team = session.team, "player connected");
    core.bind_session(conn, session);
}

/// The exact plaintext the client must produce: magic header, the server's
/// advertised address as the client dialed it, the challenge nonce, and
/// the challenge timestamp.
pub fn expected_proof(server_addr: &str, nonce: &[u8; NONCE_LEN], issued_at: i64) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.put_bytes(&AUTH_MAGIC)
        .put_string(server_addr)
        .put_bytes(nonce)
        .put_i64(issued_at);
    w.into_bytes()
}

/// Best-effort field-by-field breakdown of a mismatched proof, for the
/// operator log. Never consulted for the accept/reject decision.
fn diagnose_proof(data: &[u8], server_addr: &str, nonce: &[u8; NONCE_LEN], issued_at: i64) -> String {
    let mut reader = WireReader::new(data);

    let magic: [u8; 4] = match reader.read_array() {
        Ok(m) => m,
        Err(_) => return format!("not enough data (length: {})", data.len()),
    };
    if magic != AUTH_MAGIC {
        return "invalid proof header".to_string();
    }

    match reader.read_string() {
        Ok(addr) if addr != server_addr => {
            return format!("server address mismatch ({addr} vs {server_addr})");
        }
        Ok(_) => {}
        Err(_) => return format!("not enough data (length: {})", data.len()),
    }

    match reader.read_array::<NONCE_LEN>() {
        Ok(got) if got != *nonce => return "nonce mismatch".to_string(),
        Ok(_) => {}
        Err(_) => return format!("not enough data (length: {})", data.len()),
    }

    match reader.read_i64() {
        Ok(got) if got != issued_at => {
            return format!("timestamp mismatch ({got} vs {issued_at})");
        }
        Ok(_) => {}
        Err(_) => return format!("not enough data (length: {})", data.len()),
    }

    if reader.remaining() > 0 {
        return format!("{} bytes of trailing data", reader.remaining());
    }
    "no field-level difference".to_string()
}
