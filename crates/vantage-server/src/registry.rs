//! In-memory registry of live agent and viewer connections.
//!
//! One reader-writer lock guards both maps. Lookups during message relay
//! clone the `Arc` entry and release the lock before any socket I/O; each
//! connection serializes its own writes behind a private mutex.
//!
//! At most one live agent per id and one viewer per agent: a newer
//! registration displaces its predecessor, which is told to shut down via
//! a watch signal. Removal is identity-checked so a displaced session's
//! cleanup can never unregister its replacement.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWrite;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{info, warn};
use vantage_proto::{write_server_frame, DisplayInfo, Envelope, Opcode, ProtocolError, Registration};

use crate::storage::AgentRecord;

/// Write half of a session's WebSocket stream.
pub type ConnWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An active agent connection plus its cached registration payload.
pub struct LiveAgent {
    pub id: String,
    pub session: u64,
    pub remote_addr: String,
    pub enrolled_at: DateTime<Utc>,
    pub registration: Registration,
    pub display_count: u32,
    last_seen: AtomicI64,
    writer: Mutex<ConnWriter>,
    closed: watch::Sender<bool>,
}

impl LiveAgent {
    fn new(
        record: &AgentRecord,
        mut registration: Registration,
        remote_addr: String,
        session: u64,
        writer: ConnWriter,
    ) -> Self {
        // The credential authenticated the session; it has no business
        // lingering in memory or API responses.
        registration.credential = String::new();

        let display_count = registration.display_count.max(1);
        let (closed, _) = watch::channel(false);

        Self {
            id: record.id.clone(),
            session,
            remote_addr,
            enrolled_at: record.enrolled_at,
            registration,
            display_count,
            last_seen: AtomicI64::new(Utc::now().timestamp()),
            writer: Mutex::new(writer),
            closed,
        }
    }

    /// Refresh the liveness timestamp.
    pub fn touch(&self) {
        self.last_seen.store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.last_seen.load(Ordering::Relaxed), 0)
            .unwrap_or(DateTime::UNIX_EPOCH)
    }

    /// Write a frame to the agent, serialized by the per-connection lock.
    pub async fn write_frame(&self, opcode: Opcode, payload: &[u8]) -> Result<(), ProtocolError> {
        let mut writer = self.writer.lock().await;
        write_server_frame(&mut *writer, opcode, payload).await
    }

    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<(), ProtocolError> {
        let data = serde_json::to_vec(envelope)?;
        self.write_frame(Opcode::Text, &data).await
    }

    /// Tell the owning session task to shut down.
    pub fn evict(&self) {
        self.closed.send_replace(true);
    }

    pub fn close_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Snapshot for `GET /api/agents`.
    pub fn summary(&self) -> LiveAgentInfo {
        let reg = &self.registration;
        LiveAgentInfo {
            id: self.id.clone(),
            name: reg.name.clone(),
            hostname: reg.hostname.clone(),
            os: reg.os.clone(),
            os_version: reg.os_version.clone(),
            arch: reg.arch.clone(),
            ip: self.remote_addr.clone(),
            status: "online",
            last_seen: self.last_seen(),
            cpu_count: reg.cpu_count,
            memory_total: reg.memory_total,
            memory_free: reg.memory_free,
            disk_total: reg.disk_total,
            disk_free: reg.disk_free,
            displays: reg.displays.clone(),
            display_count: self.display_count,
            local_ips: reg.local_ips.clone(),
            username: reg.username.clone(),
            uptime_seconds: reg.uptime_seconds,
            agent_version: reg.agent_version.clone(),
            enrolled_at: self.enrolled_at,
        }
    }
}

/// JSON shape of a live agent in API responses.
#[derive(Debug, Clone, Serialize)]
pub struct LiveAgentInfo {
    pub id: String,
    pub name: String,
    pub hostname: String,
    pub os: String,
    pub os_version: String,
    pub arch: String,
    pub ip: String,
    pub status: &'static str,
    pub last_seen: DateTime<Utc>,
    pub cpu_count: u32,
    pub memory_total: u64,
    pub memory_free: u64,
    pub disk_total: u64,
    pub disk_free: u64,
    pub displays: Vec<DisplayInfo>,
    pub display_count: u32,
    pub local_ips: Vec<String>,
    pub username: String,
    pub uptime_seconds: i64,
    pub agent_version: String,
    pub enrolled_at: DateTime<Utc>,
}

/// An attached viewer connection.
pub struct ViewerConn {
    pub session: u64,
    writer: Mutex<ConnWriter>,
    closed: watch::Sender<bool>,
}

impl ViewerConn {
    fn new(session: u64, writer: ConnWriter) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            session,
            writer: Mutex::new(writer),
            closed,
        }
    }

    pub async fn write_frame(&self, opcode: Opcode, payload: &[u8]) -> Result<(), ProtocolError> {
        let mut writer = self.writer.lock().await;
        write_server_frame(&mut *writer, opcode, payload).await
    }

    pub fn evict(&self) {
        self.closed.send_replace(true);
    }

    pub fn close_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

#[derive(Default)]
struct Maps {
    agents: HashMap<String, Arc<LiveAgent>>,
    viewers: HashMap<String, Arc<ViewerConn>>,
}

/// Thread-safe registry of live agents and attached viewers.
pub struct Registry {
    inner: RwLock<Maps>,
    next_session: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Maps::default()),
            next_session: AtomicU64::new(1),
        }
    }

    fn session_id(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }

    /// Install a freshly authenticated agent session, returning it and any
    /// displaced predecessor (the caller signals the old session).
    pub async fn register_agent(
        &self,
        record: &AgentRecord,
        registration: Registration,
        remote_addr: String,
        writer: ConnWriter,
    ) -> (Arc<LiveAgent>, Option<Arc<LiveAgent>>) {
        let agent = Arc::new(LiveAgent::new(
            record,
            registration,
            remote_addr,
            self.session_id(),
            writer,
        ));

        let displaced = {
            let mut maps = self.inner.write().await;
            maps.agents.insert(agent.id.clone(), Arc::clone(&agent))
        };

        info!(agent_id = %agent.id, replaced = displaced.is_some(), "agent session registered");
        (agent, displaced)
    }

    /// Remove an agent entry, but only if it still belongs to `session`.
    pub async fn remove_agent_if(&self, id: &str, session: u64) -> bool {
        let mut maps = self.inner.write().await;
        match maps.agents.get(id) {
            Some(current) if current.session == session => {
                maps.agents.remove(id);
                true
            }
            _ => false,
        }
    }

    pub async fn get_agent(&self, id: &str) -> Option<Arc<LiveAgent>> {
        self.inner.read().await.agents.get(id).cloned()
    }

    pub async fn agent_count(&self) -> usize {
        self.inner.read().await.agents.len()
    }

    pub async fn agent_summaries(&self) -> Vec<LiveAgentInfo> {
        self.inner
            .read()
            .await
            .agents
            .values()
            .map(|agent| agent.summary())
            .collect()
    }

    /// Attach a viewer to an agent, displacing any predecessor.
    pub async fn attach_viewer(
        &self,
        agent_id: &str,
        writer: ConnWriter,
    ) -> (Arc<ViewerConn>, Option<Arc<ViewerConn>>) {
        let viewer = Arc::new(ViewerConn::new(self.session_id(), writer));

        let displaced = {
            let mut maps = self.inner.write().await;
            maps.viewers
                .insert(agent_id.to_string(), Arc::clone(&viewer))
        };

        if displaced.is_some() {
            warn!(agent_id = %agent_id, "displacing existing viewer");
        }
        (viewer, displaced)
    }

    /// Remove a viewer mapping, but only if it still belongs to `session`.
    pub async fn detach_viewer_if(&self, agent_id: &str, session: u64) -> bool {
        let mut maps = self.inner.write().await;
        match maps.viewers.get(agent_id) {
            Some(current) if current.session == session => {
                maps.viewers.remove(agent_id);
                true
            }
            _ => false,
        }
    }

    /// The viewer currently attached to an agent, if any. The read lock is
    /// released before the returned handle is written to.
    pub async fn viewer_for(&self, agent_id: &str) -> Option<Arc<ViewerConn>> {
        self.inner.read().await.viewers.get(agent_id).cloned()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use vantage_crypto::token::now_utc;
    use vantage_proto::read_frame;

    fn sample_record(id: &str) -> AgentRecord {
        let now = now_utc();
        AgentRecord {
            id: id.into(),
            name: "ws".into(),
            hostname: "h".into(),
            os: "linux".into(),
            arch: "x86_64".into(),
            credential_hash: format!("hash-{id}"),
            enrolled_at: now,
            last_seen: now,
        }
    }

    fn sample_registration() -> Registration {
        Registration {
            credential: "v1.secret.ff".into(),
            name: "ws".into(),
            display_count: 2,
            ..Default::default()
        }
    }

    /// A boxed write half plus the peer end to read what was written.
    fn writer_pair() -> (ConnWriter, tokio::io::DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (_read, write) = tokio::io::split(ours);
        (Box::new(write), theirs)
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let registry = Registry::new();
        let (writer, _peer) = writer_pair();

        let (agent, displaced) = registry
            .register_agent(&sample_record("a1"), sample_registration(), "1.2.3.4:9".into(), writer)
            .await;
        assert!(displaced.is_none());
        assert_eq!(agent.display_count, 2);
        assert!(agent.registration.credential.is_empty());

        assert!(registry.get_agent("a1").await.is_some());
        assert!(registry.get_agent("a2").await.is_none());
        assert_eq!(registry.agent_count().await, 1);
    }

    #[tokio::test]
    async fn second_registration_displaces_and_signals_the_first() {
        let registry = Registry::new();
        let (w1, _p1) = writer_pair();
        let (w2, _p2) = writer_pair();

        let (first, _) = registry
            .register_agent(&sample_record("a1"), sample_registration(), "ip1".into(), w1)
            .await;
        let mut first_closed = first.close_signal();

        let (second, displaced) = registry
            .register_agent(&sample_record("a1"), sample_registration(), "ip2".into(), w2)
            .await;
        let displaced = displaced.unwrap();
        assert_eq!(displaced.session, first.session);
        displaced.evict();

        first_closed.changed().await.unwrap();
        assert!(*first_closed.borrow());

        // The first session's cleanup must not remove the second entry.
        assert!(!registry.remove_agent_if("a1", first.session).await);
        assert_eq!(
            registry.get_agent("a1").await.unwrap().session,
            second.session
        );
        assert!(registry.remove_agent_if("a1", second.session).await);
        assert_eq!(registry.agent_count().await, 0);
    }

    #[tokio::test]
    async fn viewer_attach_displace_detach() {
        let registry = Registry::new();
        let (w1, _p1) = writer_pair();
        let (w2, _p2) = writer_pair();

        let (first, none) = registry.attach_viewer("a1", w1).await;
        assert!(none.is_none());
        assert!(registry.viewer_for("a1").await.is_some());

        let (second, displaced) = registry.attach_viewer("a1", w2).await;
        assert_eq!(displaced.unwrap().session, first.session);

        assert!(!registry.detach_viewer_if("a1", first.session).await);
        assert!(registry.detach_viewer_if("a1", second.session).await);
        assert!(registry.viewer_for("a1").await.is_none());
    }

    #[tokio::test]
    async fn agent_writes_reach_the_socket() {
        let registry = Registry::new();
        let (writer, mut peer) = writer_pair();
        let (agent, _) = registry
            .register_agent(&sample_record("a1"), sample_registration(), "ip".into(), writer)
            .await;

        agent
            .send_envelope(&Envelope::StartCapture)
            .await
            .unwrap();

        let (opcode, data) = read_frame(&mut peer).await.unwrap();
        assert_eq!(opcode, Opcode::Text);
        assert_eq!(data, br#"{"type":"start_capture"}"#);
    }

    #[tokio::test]
    async fn viewer_relay_preserves_binary_bytes() {
        let registry = Registry::new();
        let (writer, mut peer) = writer_pair();
        let (viewer, _) = registry.attach_viewer("a1", writer).await;

        viewer
            .write_frame(Opcode::Binary, &[0x01, 0xAA, 0xBB])
            .await
            .unwrap();

        let (opcode, data) = read_frame(&mut peer).await.unwrap();
        assert_eq!(opcode, Opcode::Binary);
        assert_eq!(data, vec![0x01, 0xAA, 0xBB]);
    }

    #[tokio::test]
    async fn summary_exposes_registration_without_credential() {
        let registry = Registry::new();
        let (writer, _peer) = writer_pair();
        let (agent, _) = registry
            .register_agent(&sample_record("a1"), sample_registration(), "ip:1".into(), writer)
            .await;

        let info = agent.summary();
        assert_eq!(info.id, "a1");
        assert_eq!(info.status, "online");
        assert_eq!(info.ip, "ip:1");

        let json = serde_json::to_string(&registry.agent_summaries().await).unwrap();
        assert!(!json.contains("credential"));
        assert!(!json.contains("v1.secret"));
    }
}
