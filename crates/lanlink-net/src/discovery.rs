//! Multi-tier UDP discovery: probe chain on the client side, responder on
//! the server side.
//!
//! A client with no configured address resolves a server in three strictly
//! sequential tiers, each tried only if the previous one found nothing:
//!
//! 1. **Localhost probe** – unicast `DISCOVER_SERVER` to `127.0.0.1:44444`
//!    and wait about a second for any reply.
//! 2. **Broadcast probe** – send the same payload to the subnet broadcast
//!    address and collect *all* replies arriving within the window.
//! 3. **Subnet scan** – derive the local /24 from the machine's LAN address
//!    and probe every other host concurrently, each with a short timeout.
//!
//! A responder on the server side binds the well-known port on all
//! interfaces (loopback-only when the port is taken) and answers every probe
//! datagram with this server's [`PeerRecord`] as JSON.
//!
//! Replies that are not valid `PeerRecord` JSON are treated as a plain
//! server name, with the datagram's source address standing in for the
//! advertised endpoint.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use chrono::Utc;
use lanlink_core::PeerRecord;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

/// Well-known UDP port servers answer discovery probes on.
pub const DISCOVERY_PORT: u16 = 44444;

/// Literal probe payload a client sends.
pub const PROBE_MESSAGE: &str = "DISCOVER_SERVER";

/// Errors surfaced by the discovery subsystem.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The responder (or a probe socket) could not be bound.
    #[error("failed to bind discovery socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The responder's advertisement could not be encoded.
    #[error("failed to encode discovery response: {0}")]
    Encode(#[from] serde_json::Error),

    /// All three tiers came back empty.
    #[error("no peers found after localhost, broadcast, and subnet scan tiers")]
    NoPeersFound,
}

/// Timing and port knobs for the probe chain and responder.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// UDP port probes are sent to and the responder binds.
    pub port: u16,
    /// How long the localhost tier waits for a reply.
    pub localhost_timeout: Duration,
    /// Collection window of the broadcast tier.
    pub broadcast_timeout: Duration,
    /// Per-host timeout of the subnet scan tier.
    pub scan_probe_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: DISCOVERY_PORT,
            localhost_timeout: Duration::from_secs(1),
            broadcast_timeout: Duration::from_secs(3),
            scan_probe_timeout: Duration::from_millis(500),
        }
    }
}

// ── Probe chain ───────────────────────────────────────────────────────────────

/// The three probe tiers, as a seam so the fallback chain can be tested
/// with instrumented doubles.
pub(crate) trait DiscoveryTiers {
    async fn probe_localhost(&self, config: &DiscoveryConfig) -> Vec<PeerRecord>;
    async fn probe_broadcast(&self, config: &DiscoveryConfig) -> Vec<PeerRecord>;
    async fn scan_subnet(&self, config: &DiscoveryConfig) -> Vec<PeerRecord>;
}

/// Resolves reachable servers without prior configuration.
///
/// Tiers run strictly in order; the first tier to return at least one
/// [`PeerRecord`] short-circuits the rest.  Total wall time is bounded by
/// the sum of the tier timeouts.
///
/// # Errors
///
/// Returns [`DiscoveryError::NoPeersFound`] when every tier comes back
/// empty.  Discovery never retries on its own; that decision belongs to the
/// caller.
pub async fn discover(config: &DiscoveryConfig) -> Result<Vec<PeerRecord>, DiscoveryError> {
    discover_with(&UdpProber, config).await
}

pub(crate) async fn discover_with<T: DiscoveryTiers>(
    tiers: &T,
    config: &DiscoveryConfig,
) -> Result<Vec<PeerRecord>, DiscoveryError> {
    let peers = tiers.probe_localhost(config).await;
    if !peers.is_empty() {
        debug!(count = peers.len(), "localhost tier found peers");
        return Ok(peers);
    }

    let peers = tiers.probe_broadcast(config).await;
    if !peers.is_empty() {
        debug!(count = peers.len(), "broadcast tier found peers");
        return Ok(peers);
    }

    let peers = tiers.scan_subnet(config).await;
    if !peers.is_empty() {
        debug!(count = peers.len(), "subnet scan tier found peers");
        return Ok(peers);
    }

    Err(DiscoveryError::NoPeersFound)
}

/// Real UDP implementation of the probe tiers.
pub(crate) struct UdpProber;

impl DiscoveryTiers for UdpProber {
    async fn probe_localhost(&self, config: &DiscoveryConfig) -> Vec<PeerRecord> {
        let target = SocketAddr::from((Ipv4Addr::LOCALHOST, config.port));
        match probe_unicast(target, config.localhost_timeout).await {
            Ok(peers) => peers,
            Err(e) => {
                debug!(error = %e, "localhost probe failed");
                Vec::new()
            }
        }
    }

    async fn probe_broadcast(&self, config: &DiscoveryConfig) -> Vec<PeerRecord> {
        match probe_broadcast_inner(config.port, config.broadcast_timeout).await {
            Ok(peers) => peers,
            Err(e) => {
                // Broadcast may be administratively blocked; the scan tier
                // still runs after this.
                debug!(error = %e, "broadcast probe failed");
                Vec::new()
            }
        }
    }

    async fn scan_subnet(&self, config: &DiscoveryConfig) -> Vec<PeerRecord> {
        let Some(local) = local_lan_addr() else {
            warn!("no usable LAN address; skipping subnet scan");
            return Vec::new();
        };
        scan_subnet_inner(local, config.port, config.scan_probe_timeout).await
    }
}

/// Sends one probe to `target` and waits up to `window` for the first reply.
async fn probe_unicast(
    target: SocketAddr,
    window: Duration,
) -> std::io::Result<Vec<PeerRecord>> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.send_to(PROBE_MESSAGE.as_bytes(), target).await?;
    debug!(%target, "probe sent");
    Ok(collect_responses(&socket, window, true).await)
}

/// Broadcasts one probe and collects every reply within the window.
async fn probe_broadcast_inner(port: u16, window: Duration) -> std::io::Result<Vec<PeerRecord>> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;
    socket
        .send_to(PROBE_MESSAGE.as_bytes(), (Ipv4Addr::BROADCAST, port))
        .await?;
    info!(port, "broadcast probe sent");
    Ok(collect_responses(&socket, window, false).await)
}

/// Probes every other host of the local /24 concurrently.
async fn scan_subnet_inner(local: Ipv4Addr, port: u16, probe_timeout: Duration) -> Vec<PeerRecord> {
    let octets = local.octets();
    info!(subnet = %format!("{}.{}.{}.0/24", octets[0], octets[1], octets[2]), "scanning subnet");

    let mut probes = JoinSet::new();
    for host in 1..=254u8 {
        if host == octets[3] {
            continue; // skip self
        }
        let target = SocketAddr::from((
            Ipv4Addr::new(octets[0], octets[1], octets[2], host),
            port,
        ));
        probes.spawn(async move {
            probe_unicast(target, probe_timeout)
                .await
                .unwrap_or_default()
        });
    }

    let mut peers = Vec::new();
    while let Some(result) = probes.join_next().await {
        if let Ok(mut found) = result {
            peers.append(&mut found);
        }
    }
    peers
}

/// Reads replies from `socket` until the window closes.  With
/// `stop_after_first` the first parseable reply ends the collection early.
async fn collect_responses(
    socket: &UdpSocket,
    window: Duration,
    stop_after_first: bool,
) -> Vec<PeerRecord> {
    let deadline = Instant::now() + window;
    let mut peers = Vec::new();
    let mut buf = [0u8; 2048];

    loop {
        match time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, src))) => {
                if let Some(peer) = parse_response(&buf[..len], src) {
                    info!(peer = %peer, "server discovered");
                    peers.push(peer);
                    if stop_after_first {
                        break;
                    }
                }
            }
            Ok(Err(e)) => {
                debug!(error = %e, "probe receive failed");
                break;
            }
            Err(_) => break, // window elapsed
        }
    }
    peers
}

/// Parses a reply datagram into a [`PeerRecord`].
///
/// Structured JSON wins; otherwise the payload is taken as a plain server
/// name and the sender's address fills in the endpoint.  Non-UTF-8 and
/// empty payloads are ignored.
pub(crate) fn parse_response(payload: &[u8], src: SocketAddr) -> Option<PeerRecord> {
    let text = match std::str::from_utf8(payload) {
        Ok(text) => text,
        Err(_) => {
            debug!(%src, "ignoring non-UTF-8 reply");
            return None;
        }
    };

    match serde_json::from_str::<PeerRecord>(text) {
        Ok(peer) => Some(peer),
        Err(_) => {
            let name = text.trim();
            if name.is_empty() {
                return None;
            }
            Some(PeerRecord {
                name: name.to_string(),
                ip: src.ip(),
                port: src.port(),
                version: None,
                discovered_at: Utc::now(),
            })
        }
    }
}

// ── Local address helpers ─────────────────────────────────────────────────────

/// The machine's LAN IPv4 address, excluding loopback and public addresses.
///
/// Connecting a UDP socket sends no packets; it only asks the routing table
/// which local address would be used, which is exactly the address other
/// LAN hosts can reach us on.
pub fn local_lan_addr() -> Option<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() && is_private_ipv4(ip) => Some(ip),
        _ => None,
    }
}

/// `true` for RFC 1918 private ranges and 169.254/16 link-local.
pub fn is_private_ipv4(ip: Ipv4Addr) -> bool {
    let o = ip.octets();
    o[0] == 10
        || (o[0] == 172 && (16..=31).contains(&o[1]))
        || (o[0] == 192 && o[1] == 168)
        || (o[0] == 169 && o[1] == 254)
}

// ── Responder ─────────────────────────────────────────────────────────────────

/// Server-side UDP responder answering discovery probes with this server's
/// advertised [`PeerRecord`].
pub struct DiscoveryResponder {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl DiscoveryResponder {
    /// Binds the discovery port on all interfaces — loopback-only when the
    /// port is already claimed — and starts answering probes until
    /// `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Bind`] when neither bind succeeds, or
    /// [`DiscoveryError::Encode`] when the advertisement is not
    /// serializable.
    pub async fn start(
        advert: PeerRecord,
        port: u16,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, DiscoveryError> {
        let any = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let socket = match UdpSocket::bind(any).await {
            Ok(socket) => socket,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                warn!(port, "discovery port in use; falling back to loopback only");
                let loopback = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
                UdpSocket::bind(loopback)
                    .await
                    .map_err(|source| DiscoveryError::Bind {
                        addr: loopback,
                        source,
                    })?
            }
            Err(source) => return Err(DiscoveryError::Bind { addr: any, source }),
        };

        let local_addr = socket.local_addr().map_err(|source| DiscoveryError::Bind {
            addr: any,
            source,
        })?;
        let reply = serde_json::to_string(&advert)?;

        info!(%local_addr, advert = %advert, "discovery responder listening");
        let task = tokio::spawn(responder_loop(socket, reply, shutdown));

        Ok(Self { local_addr, task })
    }

    /// The address the responder actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the responder task to finish after its shutdown signal
    /// fired.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

async fn responder_loop(socket: UdpSocket, reply: String, mut shutdown: watch::Receiver<bool>) {
    let mut buf = [0u8; 1024];
    loop {
        tokio::select! {
            // The wait_for guard must not outlive its branch, or the whole
            // future stops being Send.
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, src)) => {
                    let is_probe = std::str::from_utf8(&buf[..len])
                        .map(|text| text.trim() == PROBE_MESSAGE)
                        .unwrap_or(false);
                    if is_probe {
                        debug!(%src, "discovery probe received");
                        if let Err(e) = socket.send_to(reply.as_bytes(), src).await {
                            warn!(%src, error = %e, "failed to answer probe");
                        }
                    } else {
                        debug!(%src, "ignoring unrecognised datagram");
                    }
                }
                Err(e) => warn!(error = %e, "discovery receive failed"),
            }
        }
    }
    debug!("discovery responder stopped");
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_private_ranges_are_recognised() {
        for ip in ["10.1.2.3", "172.16.0.1", "172.31.255.254", "192.168.0.1", "169.254.10.10"] {
            assert!(is_private_ipv4(ip.parse().unwrap()), "{ip} must be private");
        }
    }

    #[test]
    fn test_public_and_edge_addresses_are_not_private() {
        for ip in ["8.8.8.8", "172.15.0.1", "172.32.0.1", "192.169.0.1", "11.0.0.1"] {
            assert!(!is_private_ipv4(ip.parse().unwrap()), "{ip} must not be private");
        }
    }

    #[test]
    fn test_parse_response_prefers_structured_record() {
        let src: SocketAddr = "192.168.1.9:44444".parse().unwrap();
        let payload = br#"{"Name":"srv","Ip":"192.168.1.42","Port":5000}"#;

        let peer = parse_response(payload, src).unwrap();

        // The advertised endpoint wins over the datagram source.
        assert_eq!(peer.addr(), "192.168.1.42:5000".parse().unwrap());
        assert_eq!(peer.name, "srv");
    }

    #[test]
    fn test_parse_response_falls_back_to_plain_name() {
        let src: SocketAddr = "192.168.1.9:44444".parse().unwrap();

        let peer = parse_response(b"  garage-server \n", src).unwrap();

        assert_eq!(peer.name, "garage-server");
        assert_eq!(peer.addr(), src);
        assert_eq!(peer.version, None);
    }

    #[test]
    fn test_parse_response_ignores_empty_and_binary_payloads() {
        let src: SocketAddr = "192.168.1.9:44444".parse().unwrap();

        assert!(parse_response(b"   ", src).is_none());
        assert!(parse_response(&[0xFF, 0xFE, 0x00], src).is_none());
    }

    /// Instrumented tier double: returns canned peers and counts calls.
    struct StubTiers {
        localhost: Vec<PeerRecord>,
        broadcast: Vec<PeerRecord>,
        scan: Vec<PeerRecord>,
        localhost_calls: AtomicUsize,
        broadcast_calls: AtomicUsize,
        scan_calls: AtomicUsize,
    }

    impl StubTiers {
        fn new(
            localhost: Vec<PeerRecord>,
            broadcast: Vec<PeerRecord>,
            scan: Vec<PeerRecord>,
        ) -> Self {
            Self {
                localhost,
                broadcast,
                scan,
                localhost_calls: AtomicUsize::new(0),
                broadcast_calls: AtomicUsize::new(0),
                scan_calls: AtomicUsize::new(0),
            }
        }
    }

    impl DiscoveryTiers for StubTiers {
        async fn probe_localhost(&self, _config: &DiscoveryConfig) -> Vec<PeerRecord> {
            self.localhost_calls.fetch_add(1, Ordering::SeqCst);
            self.localhost.clone()
        }

        async fn probe_broadcast(&self, _config: &DiscoveryConfig) -> Vec<PeerRecord> {
            self.broadcast_calls.fetch_add(1, Ordering::SeqCst);
            self.broadcast.clone()
        }

        async fn scan_subnet(&self, _config: &DiscoveryConfig) -> Vec<PeerRecord> {
            self.scan_calls.fetch_add(1, Ordering::SeqCst);
            self.scan.clone()
        }
    }

    fn peer(name: &str) -> PeerRecord {
        PeerRecord {
            name: name.to_string(),
            ip: "127.0.0.1".parse().unwrap(),
            port: 5000,
            version: None,
            discovered_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_localhost_success_short_circuits_later_tiers() {
        let tiers = StubTiers::new(vec![peer("local")], vec![peer("bcast")], vec![peer("scan")]);

        let peers = discover_with(&tiers, &DiscoveryConfig::default())
            .await
            .unwrap();

        assert_eq!(peers[0].name, "local");
        assert_eq!(tiers.localhost_calls.load(Ordering::SeqCst), 1);
        assert_eq!(tiers.broadcast_calls.load(Ordering::SeqCst), 0);
        assert_eq!(tiers.scan_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_broadcast_runs_only_after_empty_localhost() {
        let tiers = StubTiers::new(vec![], vec![peer("bcast")], vec![peer("scan")]);

        let peers = discover_with(&tiers, &DiscoveryConfig::default())
            .await
            .unwrap();

        assert_eq!(peers[0].name, "bcast");
        assert_eq!(tiers.localhost_calls.load(Ordering::SeqCst), 1);
        assert_eq!(tiers.broadcast_calls.load(Ordering::SeqCst), 1);
        assert_eq!(tiers.scan_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_scan_is_the_last_resort() {
        let tiers = StubTiers::new(vec![], vec![], vec![peer("scan")]);

        let peers = discover_with(&tiers, &DiscoveryConfig::default())
            .await
            .unwrap();

        assert_eq!(peers[0].name, "scan");
        assert_eq!(tiers.scan_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_tiers_empty_is_a_discovery_error() {
        let tiers = StubTiers::new(vec![], vec![], vec![]);

        let result = discover_with(&tiers, &DiscoveryConfig::default()).await;

        assert!(matches!(result, Err(DiscoveryError::NoPeersFound)));
        assert_eq!(tiers.localhost_calls.load(Ordering::SeqCst), 1);
        assert_eq!(tiers.broadcast_calls.load(Ordering::SeqCst), 1);
        assert_eq!(tiers.scan_calls.load(Ordering::SeqCst), 1);
    }
}
