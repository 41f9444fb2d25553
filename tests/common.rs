#![allow(unused)]
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Duration;

use icecheck::error::NetError;
use icecheck::net::{Protocol, StunMessage};
use icecheck::{Candidate, IceAgent, IceAgentEvent, IceConfig, Session, SessionProvider};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::Instrument;

pub fn init_log() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    static START: Once = Once::new();

    START.call_once(|| {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(env_filter)
            .init();
    });
}

pub fn sock(s: impl Into<String>) -> SocketAddr {
    let s: String = s.into();
    s.parse().unwrap()
}

pub fn host(s: impl Into<String>) -> Candidate {
    Candidate::host(sock(s), "udp").unwrap()
}

/// Owned datagram in flight.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub proto: Protocol,
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub contents: Vec<u8>,
}

/// In-memory network connecting agents by address.
///
/// Every address belongs to one agent. Datagrams are delivered by a task per
/// agent, never from within the sending call.
#[derive(Default)]
pub struct Network {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    endpoints: HashMap<SocketAddr, mpsc::UnboundedSender<Datagram>>,
    dropped: HashSet<(SocketAddr, SocketAddr)>,
    sent: usize,
}

impl Network {
    pub fn new() -> Arc<Self> {
        Arc::new(Network::default())
    }

    /// Deliver everything sent to `addrs` to the agent.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach(&self, agent: &IceAgent, addrs: &[SocketAddr], name: &'static str) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Datagram>();

        {
            let mut inner = self.inner.lock();
            for addr in addrs {
                inner.endpoints.insert(*addr, tx.clone());
            }
        }

        let agent = agent.clone();
        tokio::spawn(
            async move {
                while let Some(d) = rx.recv().await {
                    if let Err(e) =
                        agent.handle_receive(d.proto, d.source, d.destination, &d.contents)
                    {
                        tracing::debug!("Receive failed: {}", e);
                    }
                }
            }
            .instrument(tracing::info_span!("agent", name)),
        );
    }

    /// Silently drop everything between `a` and `b`, both directions.
    pub fn drop_path(&self, a: SocketAddr, b: SocketAddr) {
        let mut inner = self.inner.lock();
        inner.dropped.insert((a, b));
        inner.dropped.insert((b, a));
    }

    /// Number of datagrams sent so far, including dropped ones.
    pub fn sent(&self) -> usize {
        self.inner.lock().sent
    }

    fn send(&self, d: Datagram) {
        let mut inner = self.inner.lock();
        inner.sent += 1;

        if inner.dropped.contains(&(d.source, d.destination)) {
            tracing::trace!("Drop {} -> {}", d.source, d.destination);
            return;
        }

        if let Some(tx) = inner.endpoints.get(&d.destination) {
            let _ = tx.send(d);
        }
    }
}

pub struct MemSession {
    network: Arc<Network>,
    proto: Protocol,
    local: SocketAddr,
    remote: SocketAddr,
}

impl Session for MemSession {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn is_closing(&self) -> bool {
        false
    }

    fn write(&self, message: &StunMessage, password: &str) -> Result<(), NetError> {
        let contents = message.to_vec(password)?;
        self.network.send(Datagram {
            proto: self.proto,
            source: self.local,
            destination: self.remote,
            contents,
        });
        Ok(())
    }
}

/// Hands out sessions on a shared [`Network`].
pub struct MemSessions(pub Arc<Network>);

impl SessionProvider for MemSessions {
    fn session(&self, local: &Candidate, remote: &Candidate) -> Option<Arc<dyn Session>> {
        Some(Arc::new(MemSession {
            network: self.0.clone(),
            proto: local.proto(),
            local: local.base(),
            remote: remote.addr(),
        }))
    }
}

/// Config with quick retransmits, so failing pairs give up fast.
pub fn quick_config(controlling: bool) -> IceConfig {
    IceConfig::new()
        .set_controlling(controlling)
        .set_timing_advance(Duration::from_millis(20))
        .set_initial_stun_rto(Duration::from_millis(50))
        .set_max_stun_rto(Duration::from_millis(200))
        .set_max_stun_retransmits(2)
}

pub fn agent(network: &Arc<Network>, config: IceConfig) -> (IceAgent, mpsc::UnboundedReceiver<IceAgentEvent>) {
    IceAgent::new(config, Arc::new(MemSessions(network.clone())))
}

/// Hand the credentials of each agent to the other.
pub fn exchange_credentials(a: &IceAgent, b: &IceAgent) {
    a.set_remote_credentials(b.local_credentials().clone());
    b.set_remote_credentials(a.local_credentials().clone());
}

/// Candidates as the peer sees them, through the candidate attribute.
pub fn signal(candidates: &[Arc<Candidate>]) -> Vec<Candidate> {
    let lines = icecheck::format_candidates(candidates.iter().map(|c| &**c));
    icecheck::parse_candidates(&lines).unwrap()
}

/// Wait for the first event matching `f`, or panic after a (virtual) minute.
pub async fn wait_for(
    events: &mut mpsc::UnboundedReceiver<IceAgentEvent>,
    mut f: impl FnMut(&IceAgentEvent) -> bool,
) -> IceAgentEvent {
    let fut = async {
        while let Some(e) = events.recv().await {
            if f(&e) {
                return Some(e);
            }
        }
        None
    };

    tokio::time::timeout(Duration::from_secs(60), fut)
        .await
        .expect("event before timeout")
        .expect("event channel open")
}
