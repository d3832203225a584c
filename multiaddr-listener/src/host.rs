//! libp2p host construction
//!
//! A host is a libp2p swarm bound to one listen address, with a fixed
//! transport stack and, when asked for, a client-mode Amino DHT. The swarm is
//! moved into a background task as soon as it is bound; [`Host`] is the
//! handle the rest of the crate works with.

use futures_util::StreamExt;

/// Amino DHT bootstrap nodes, used when routing is enabled without an explicit list
pub const DEFAULT_BOOTSTRAP_PEERS: [&str; 4] = [
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmQCU2EcMqAqQPR2i9bChDtGNJchTbq5TbXJJ16u19uLTa",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmbLHAnMoJPWSCR5Zhtx6BHJX9KiKNN6tpvbUcqanj75Nb",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmcZf59bWwK5XFi76CZX8cbJ4BhTzzA3gU1ZjYZcYW3dwt",
];

const IDENTIFY_PROTOCOL: &str = "/ipfs/id/1.0.0";

const IDLE_CONNECTION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

#[derive(libp2p::swarm::NetworkBehaviour)]
pub(crate) struct Behaviour {
    stream: libp2p_stream::Behaviour,
    identify: libp2p::identify::Behaviour,
    ping: libp2p::ping::Behaviour,
    kad: libp2p::swarm::behaviour::toggle::Toggle<
        libp2p::kad::Behaviour<libp2p::kad::store::MemoryStore>,
    >,
}

impl Behaviour {
    fn new(
        keypair: &libp2p::identity::Keypair,
        bootstrap: Option<Vec<(libp2p::PeerId, libp2p::Multiaddr)>>,
    ) -> Self {
        let peer_id = keypair.public().to_peer_id();

        let kad = bootstrap.map(|peers| {
            let mut kad = libp2p::kad::Behaviour::with_config(
                peer_id,
                libp2p::kad::store::MemoryStore::new(peer_id),
                libp2p::kad::Config::new(libp2p::kad::PROTOCOL_NAME),
            );
            kad.set_mode(Some(libp2p::kad::Mode::Client));
            for (peer, addr) in peers {
                kad.add_address(&peer, addr);
            }
            kad
        });

        Self {
            stream: libp2p_stream::Behaviour::new(),
            identify: libp2p::identify::Behaviour::new(libp2p::identify::Config::new(
                IDENTIFY_PROTOCOL.to_string(),
                keypair.public(),
            )),
            ping: libp2p::ping::Behaviour::default(),
            kad: kad.into(),
        }
    }
}

/// Client-mode DHT settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingConfig {
    /// Multiaddrs ending in `/p2p/<peer id>`
    pub bootstrap_peers: Vec<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            bootstrap_peers: DEFAULT_BOOTSTRAP_PEERS
                .iter()
                .map(|addr| addr.to_string())
                .collect(),
        }
    }
}

/// Everything [`build`] needs, assembled once and consumed by it
#[derive(Debug)]
pub struct HostConfig {
    pub listen: libp2p::Multiaddr,
    /// Long-term identity; a fresh Ed25519 key is generated when absent
    pub identity: Option<libp2p::identity::Keypair>,
    /// Attach a DHT client when present
    pub routing: Option<RoutingConfig>,
}

impl HostConfig {
    pub fn new(listen: libp2p::Multiaddr) -> Self {
        Self {
            listen,
            identity: None,
            routing: None,
        }
    }

    pub fn with_identity(mut self, keypair: libp2p::identity::Keypair) -> Self {
        self.identity = Some(keypair);
        self
    }

    pub fn with_routing(mut self, routing: RoutingConfig) -> Self {
        self.routing = Some(routing);
        self
    }
}

enum Command {
    Dial {
        addr: libp2p::Multiaddr,
        reply: tokio::sync::oneshot::Sender<Result<libp2p::PeerId, crate::HostError>>,
    },
}

/// Handle to a running libp2p host
///
/// Clones share the same swarm. The swarm keeps running until [`Host::shutdown`]
/// is called or every handle has been dropped.
#[derive(Clone)]
pub struct Host {
    peer_id: libp2p::PeerId,
    addrs: std::sync::Arc<std::sync::RwLock<Vec<libp2p::Multiaddr>>>,
    control: libp2p_stream::Control,
    commands: tokio::sync::mpsc::UnboundedSender<Command>,
    well_known: std::sync::Arc<crate::WellKnownResponder>,
    routing: bool,
    shutdown: tokio_util::sync::CancellationToken,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("peer_id", &self.peer_id)
            .field("addrs", &self.addrs())
            .field("routing", &self.routing)
            .finish()
    }
}

impl Host {
    pub fn peer_id(&self) -> libp2p::PeerId {
        self.peer_id
    }

    /// Listen addresses plus any external addresses confirmed so far
    pub fn addrs(&self) -> Vec<libp2p::Multiaddr> {
        self.addrs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn has_routing(&self) -> bool {
        self.routing
    }

    /// Discovery responder shared by everything serving this host
    pub fn well_known(&self) -> &std::sync::Arc<crate::WellKnownResponder> {
        &self.well_known
    }

    /// Control for opening and accepting protocol streams on this host
    pub fn stream_control(&self) -> libp2p_stream::Control {
        self.control.clone()
    }

    /// Dial `addr` and wait until the connection is established
    pub async fn dial(&self, addr: libp2p::Multiaddr) -> Result<libp2p::PeerId, crate::HostError> {
        let (reply, response) = tokio::sync::oneshot::channel();
        self.commands
            .send(Command::Dial { addr, reply })
            .map_err(|_| crate::HostError::Closed)?;
        response.await.map_err(|_| crate::HostError::Closed)?
    }

    /// Stop the swarm, closing every connection and listener of this host
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Construct a host and bind it to `config.listen`.
///
/// Returns once the first listen address has been reported, so a host that
/// cannot bind never escapes this function.
pub async fn build(config: HostConfig) -> Result<Host, crate::HostError> {
    let HostConfig {
        listen,
        identity,
        routing,
    } = config;

    let bootstrap = match &routing {
        Some(routing) => Some(parse_bootstrap_peers(&routing.bootstrap_peers)?),
        None => None,
    };
    let has_routing = bootstrap.is_some();

    let keypair = identity.unwrap_or_else(libp2p::identity::Keypair::generate_ed25519);

    let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            libp2p::tcp::Config::default(),
            libp2p::noise::Config::new,
            libp2p::yamux::Config::default,
        )
        .map_err(transport_error)?
        .with_quic()
        .with_other_transport(|keypair| {
            let certificate =
                libp2p_webrtc::tokio::Certificate::generate(&mut rand::thread_rng())
                    .map_err(|e| std::io::Error::other(e.to_string()))?;
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(libp2p_webrtc::tokio::Transport::new(
                keypair.clone(),
                certificate,
            ))
        })
        .map_err(transport_error)?
        .with_dns()
        .map_err(transport_error)?
        .with_websocket(libp2p::noise::Config::new, libp2p::yamux::Config::default)
        .await
        .map_err(transport_error)?
        .with_behaviour(move |keypair| Behaviour::new(keypair, bootstrap))
        .map_err(transport_error)?
        .with_swarm_config(|c| c.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
        .build();

    let peer_id = *swarm.local_peer_id();

    let listener_id = swarm
        .listen_on(listen.clone())
        .map_err(|e| crate::HostError::Listen {
            addr: listen.clone(),
            source: eyre::eyre!("{e}"),
        })?;

    if let Some(kad) = swarm.behaviour_mut().kad.as_mut() {
        kad.bootstrap()
            .map_err(|e| crate::HostError::Routing(e.to_string()))?;
    }

    let first_addr = loop {
        match swarm.select_next_some().await {
            libp2p::swarm::SwarmEvent::NewListenAddr {
                listener_id: id,
                address,
            } if id == listener_id => break address,
            libp2p::swarm::SwarmEvent::ListenerClosed {
                listener_id: id,
                reason,
                ..
            } if id == listener_id => {
                let source = match reason {
                    Err(e) => eyre::Error::new(e),
                    Ok(()) => eyre::eyre!("listener closed before binding"),
                };
                return Err(crate::HostError::Listen {
                    addr: listen,
                    source,
                });
            }
            libp2p::swarm::SwarmEvent::ListenerError {
                listener_id: id,
                error,
            } if id == listener_id => {
                return Err(crate::HostError::Listen {
                    addr: listen,
                    source: eyre::Error::new(error),
                });
            }
            other => tracing::debug!("Swarm event while binding {listen}: {other:?}"),
        }
    };

    tracing::info!("Host {peer_id} listening on {first_addr}");

    let addrs = std::sync::Arc::new(std::sync::RwLock::new(vec![first_addr]));
    let control = swarm.behaviour().stream.new_control();
    let (commands, command_rx) = tokio::sync::mpsc::unbounded_channel();
    let shutdown = tokio_util::sync::CancellationToken::new();

    tokio::spawn(drive(swarm, command_rx, addrs.clone(), shutdown.clone()));

    Ok(Host {
        peer_id,
        addrs,
        control,
        commands,
        well_known: std::sync::Arc::new(crate::WellKnownResponder::default()),
        routing: has_routing,
        shutdown,
    })
}

fn transport_error(e: impl std::fmt::Display) -> crate::HostError {
    crate::HostError::Transport {
        source: eyre::eyre!("{e}"),
    }
}

fn parse_bootstrap_peers(
    peers: &[String],
) -> Result<Vec<(libp2p::PeerId, libp2p::Multiaddr)>, crate::HostError> {
    peers
        .iter()
        .map(|peer| {
            let addr: libp2p::Multiaddr = peer.parse().map_err(|e| {
                crate::HostError::Routing(format!("bootstrap peer {peer:?}: {e}"))
            })?;
            match addr.iter().last() {
                Some(libp2p::multiaddr::Protocol::P2p(peer_id)) => Ok((peer_id, addr)),
                _ => Err(crate::HostError::Routing(format!(
                    "bootstrap peer {peer:?} does not end in /p2p/<peer id>"
                ))),
            }
        })
        .collect()
}

type PendingDials = std::collections::HashMap<
    libp2p::swarm::ConnectionId,
    (
        libp2p::Multiaddr,
        tokio::sync::oneshot::Sender<Result<libp2p::PeerId, crate::HostError>>,
    ),
>;

async fn drive(
    mut swarm: libp2p::Swarm<Behaviour>,
    mut commands: tokio::sync::mpsc::UnboundedReceiver<Command>,
    addrs: std::sync::Arc<std::sync::RwLock<Vec<libp2p::Multiaddr>>>,
    shutdown: tokio_util::sync::CancellationToken,
) {
    let peer_id = *swarm.local_peer_id();
    let mut pending_dials = PendingDials::new();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                tracing::info!("Host {peer_id} shutting down");
                break;
            }
            command = commands.recv() => match command {
                Some(Command::Dial { addr, reply }) => {
                    let opts = libp2p::swarm::dial_opts::DialOpts::from(addr.clone());
                    let connection_id = opts.connection_id();
                    match swarm.dial(opts) {
                        Ok(()) => {
                            pending_dials.insert(connection_id, (addr, reply));
                        }
                        Err(e) => {
                            let _ = reply.send(Err(crate::HostError::Dial {
                                addr,
                                message: e.to_string(),
                            }));
                        }
                    }
                }
                None => {
                    tracing::debug!("All handles to host {peer_id} dropped");
                    break;
                }
            },
            event = swarm.select_next_some() => {
                handle_event(&mut swarm, event, &addrs, &mut pending_dials);
            }
        }
    }
}

fn handle_event(
    swarm: &mut libp2p::Swarm<Behaviour>,
    event: libp2p::swarm::SwarmEvent<BehaviourEvent>,
    addrs: &std::sync::RwLock<Vec<libp2p::Multiaddr>>,
    pending_dials: &mut PendingDials,
) {
    match event {
        libp2p::swarm::SwarmEvent::NewListenAddr { address, .. }
        | libp2p::swarm::SwarmEvent::ExternalAddrConfirmed { address } => {
            tracing::info!("Host {} reachable on {address}", swarm.local_peer_id());
            let mut addrs = addrs.write().unwrap_or_else(std::sync::PoisonError::into_inner);
            if !addrs.contains(&address) {
                addrs.push(address);
            }
        }
        libp2p::swarm::SwarmEvent::ExpiredListenAddr { address, .. }
        | libp2p::swarm::SwarmEvent::ExternalAddrExpired { address } => {
            tracing::debug!("Address expired: {address}");
            addrs
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .retain(|a| a != &address);
        }
        libp2p::swarm::SwarmEvent::ConnectionEstablished {
            peer_id,
            connection_id,
            ..
        } => {
            tracing::debug!("Connection established with {peer_id}");
            if let Some((_, reply)) = pending_dials.remove(&connection_id) {
                let _ = reply.send(Ok(peer_id));
            }
        }
        libp2p::swarm::SwarmEvent::OutgoingConnectionError {
            connection_id,
            error,
            ..
        } => {
            if let Some((addr, reply)) = pending_dials.remove(&connection_id) {
                let _ = reply.send(Err(crate::HostError::Dial {
                    addr,
                    message: error.to_string(),
                }));
            } else {
                tracing::debug!("Outgoing connection failed: {error}");
            }
        }
        libp2p::swarm::SwarmEvent::Behaviour(BehaviourEvent::Identify(
            libp2p::identify::Event::Received { peer_id, info, .. },
        )) => {
            if let Some(kad) = swarm.behaviour_mut().kad.as_mut() {
                for addr in info.listen_addrs {
                    kad.add_address(&peer_id, addr);
                }
            }
        }
        libp2p::swarm::SwarmEvent::Behaviour(BehaviourEvent::Kad(event)) => {
            tracing::debug!("DHT: {event:?}");
        }
        other => tracing::trace!("Swarm event: {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> libp2p::Multiaddr {
        "/ip4/127.0.0.1/tcp/0".parse().unwrap()
    }

    fn bootstrap_addr(host: &Host) -> String {
        format!("{}/p2p/{}", host.addrs()[0], host.peer_id())
    }

    #[tokio::test]
    async fn test_build_without_routing() {
        let host = build(HostConfig::new(loopback())).await.unwrap();

        assert!(!host.has_routing());
        let addrs = host.addrs();
        assert!(!addrs.is_empty());
        assert!(addrs[0].iter().any(|p| matches!(
            p,
            libp2p::multiaddr::Protocol::Tcp(port) if port != 0
        )));
        host.shutdown();
    }

    #[tokio::test]
    async fn test_identity_is_used() {
        let keypair = libp2p::identity::Keypair::generate_ed25519();
        let expected = keypair.public().to_peer_id();

        let host = build(HostConfig::new(loopback()).with_identity(keypair))
            .await
            .unwrap();
        assert_eq!(host.peer_id(), expected);
        host.shutdown();
    }

    #[tokio::test]
    async fn test_routing_without_bootstrap_peers_fails() {
        let config = HostConfig::new(loopback()).with_routing(RoutingConfig {
            bootstrap_peers: vec![],
        });
        let err = build(config).await.unwrap_err();
        assert!(matches!(err, crate::HostError::Routing(_)));
    }

    #[tokio::test]
    async fn test_routing_rejects_bad_bootstrap_peer() {
        let config = HostConfig::new(loopback()).with_routing(RoutingConfig {
            bootstrap_peers: vec!["/ip4/127.0.0.1/tcp/4001".to_string()],
        });
        let err = build(config).await.unwrap_err();
        assert!(err.to_string().contains("/p2p/"));
    }

    #[tokio::test]
    async fn test_routing_attached() {
        let seed = build(HostConfig::new(loopback())).await.unwrap();

        let config = HostConfig::new(loopback()).with_routing(RoutingConfig {
            bootstrap_peers: vec![bootstrap_addr(&seed)],
        });
        let host = build(config).await.unwrap();
        assert!(host.has_routing());

        host.shutdown();
        seed.shutdown();
    }

    #[tokio::test]
    async fn test_unsupported_listen_address() {
        let addr: libp2p::Multiaddr = "/ip4/127.0.0.1/udp/0".parse().unwrap();
        let err = build(HostConfig::new(addr)).await.unwrap_err();
        assert!(matches!(err, crate::HostError::Listen { .. }));
    }

    #[test]
    fn test_default_bootstrap_peers_parse() {
        let peers = parse_bootstrap_peers(&RoutingConfig::default().bootstrap_peers).unwrap();
        assert_eq!(peers.len(), DEFAULT_BOOTSTRAP_PEERS.len());
    }

    #[tokio::test]
    async fn test_dial_between_hosts() {
        let server = build(HostConfig::new(loopback())).await.unwrap();
        let client = build(HostConfig::new(loopback())).await.unwrap();

        let peer = client.dial(server.addrs()[0].clone()).await.unwrap();
        assert_eq!(peer, server.peer_id());

        client.shutdown();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_dial_after_shutdown() {
        let host = build(HostConfig::new(loopback())).await.unwrap();
        host.shutdown();
        assert!(host.is_shut_down());

        let err = host.dial(loopback()).await.unwrap_err();
        assert!(matches!(err, crate::HostError::Closed));
    }
}
