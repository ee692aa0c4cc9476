use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::StreamExt;
use libp2p::gossipsub::{
    self, AllowAllSubscriptionFilter, IdentTopic, IdentityTransform, MessageAuthenticity,
    ValidationMode,
};
use libp2p::kad::{self, store::MemoryStore};
use libp2p::multiaddr::Protocol;
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::{ConnectionId, NetworkBehaviour, SwarmEvent};
use libp2p::{dns, identity, noise, tcp, yamux, Multiaddr, PeerId, Swarm, Transport};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::MessengerConfig;
use crate::error::{MessengerError, Result as MessengerResult, SUBSCRIPTION_LOST_MARKER};
use crate::interfaces::transport::{
    Capability, InboundMessage, MessageCallback, NodeConfig, NodeFactory, NodeMode, PubSubNode,
    SubscriptionHandle,
};

pub const DEFAULT_LISTEN_ADDR: &str = "/ip4/0.0.0.0/tcp/0";
pub const DEFAULT_KEY_PATH: &str = "./data/messenger.key";
pub const DEFAULT_BOOTSTRAP_PEERS: [&str; 2] = [
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmQCU2EcMqAqQPR2i9bChDtGNJchTbq5TbXJJ16u19uLTa",
];

/// Peers are dialed before any topic is joined, so connections must outlive
/// the period where no protocol keeps them busy.
pub const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(300);

type Reply<T> = oneshot::Sender<MessengerResult<T>>;

enum NodeCommand {
    Dial {
        address: Multiaddr,
        respond_to: Reply<()>,
    },
    Start {
        respond_to: Reply<()>,
    },
    Subscribe {
        topic: String,
        id: u64,
        respond_to: Reply<()>,
    },
    Listen {
        topic: String,
        id: u64,
        callback: MessageCallback,
        respond_to: Reply<()>,
    },
    Ping {
        topic: String,
        id: u64,
        respond_to: Reply<()>,
    },
    Unsubscribe {
        topic: String,
        id: u64,
        respond_to: Reply<()>,
    },
    Publish {
        topic: String,
        payload: Vec<u8>,
        respond_to: Reply<()>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "NodeBehaviourEvent")]
struct NodeBehaviour {
    gossipsub: gossipsub::Behaviour<IdentityTransform, AllowAllSubscriptionFilter>,
    kademlia: kad::Behaviour<MemoryStore>,
}

enum NodeBehaviourEvent {
    Gossipsub(gossipsub::Event),
    Kademlia(kad::Event),
}

impl From<gossipsub::Event> for NodeBehaviourEvent {
    fn from(event: gossipsub::Event) -> Self {
        Self::Gossipsub(event)
    }
}

impl From<kad::Event> for NodeBehaviourEvent {
    fn from(event: kad::Event) -> Self {
        Self::Kademlia(event)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PeerStatus {
    connected: usize,
    pubsub_peers: usize,
}

async fn request<T>(
    cmd_tx: &mpsc::Sender<NodeCommand>,
    build: impl FnOnce(Reply<T>) -> NodeCommand,
) -> MessengerResult<T> {
    let (tx, rx) = oneshot::channel();
    cmd_tx
        .send(build(tx))
        .await
        .map_err(|_| MessengerError::Transport("node is stopped".to_string()))?;
    rx.await
        .map_err(|e| MessengerError::Transport(e.to_string()))?
}

fn peer_id_of(address: &Multiaddr) -> Option<PeerId> {
    address.iter().find_map(|protocol| match protocol {
        Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}

fn parse_addrs(raw: &[String]) -> MessengerResult<Vec<Multiaddr>> {
    raw.iter()
        .map(|addr| {
            addr.parse::<Multiaddr>()
                .map_err(|e| MessengerError::Config(format!("invalid multiaddr {addr}: {e}")))
        })
        .collect()
}

/// Builds libp2p gossipsub nodes.
pub struct GossipNodeFactory {
    listen_addrs: Vec<Multiaddr>,
    bootstrap_peers: Vec<Multiaddr>,
    key_path: String,
}

impl GossipNodeFactory {
    pub fn new(
        listen_addrs: Vec<Multiaddr>,
        bootstrap_peers: Vec<Multiaddr>,
        key_path: &str,
    ) -> Self {
        Self {
            listen_addrs,
            bootstrap_peers,
            key_path: key_path.to_string(),
        }
    }

    pub fn from_config(config: &MessengerConfig) -> MessengerResult<Self> {
        let mut listen_addrs = parse_addrs(&config.listen_addrs)?;
        if listen_addrs.is_empty() {
            listen_addrs.push(
                DEFAULT_LISTEN_ADDR
                    .parse()
                    .map_err(|e| MessengerError::Config(format!("{e}")))?,
            );
        }
        let bootstrap_peers = if config.bootstrap_peers.is_empty() {
            let defaults: Vec<String> = DEFAULT_BOOTSTRAP_PEERS
                .iter()
                .map(|addr| addr.to_string())
                .collect();
            parse_addrs(&defaults)?
        } else {
            parse_addrs(&config.bootstrap_peers)?
        };
        let key_path = config
            .key_path
            .clone()
            .or_else(|| std::env::var("TOPIC_MESSENGER_KEY_PATH").ok())
            .unwrap_or_else(|| DEFAULT_KEY_PATH.to_string());
        Ok(Self::new(listen_addrs, bootstrap_peers, &key_path))
    }
}

#[async_trait]
impl NodeFactory for GossipNodeFactory {
    async fn create_node(&self, config: NodeConfig) -> MessengerResult<Arc<dyn PubSubNode>> {
        let node = GossipNode::spawn(
            config.mode,
            self.listen_addrs.clone(),
            self.bootstrap_peers.clone(),
            &self.key_path,
        )?;
        Ok(Arc::new(node))
    }
}

pub struct GossipNode {
    cmd_tx: mpsc::Sender<NodeCommand>,
    status: watch::Receiver<PeerStatus>,
    next_id: AtomicU64,
    pub peer_id: PeerId,
}

impl GossipNode {
    pub fn spawn(
        mode: NodeMode,
        listen_addrs: Vec<Multiaddr>,
        bootstrap_peers: Vec<Multiaddr>,
        key_path: &str,
    ) -> MessengerResult<Self> {
        let local_key = load_or_create_keypair(key_path)?;
        let peer_id = PeerId::from(local_key.public());

        let tcp_transport = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true));
        let transport = dns::tokio::Transport::system(tcp_transport)
            .map_err(|e| MessengerError::Transport(e.to_string()))?
            .upgrade(libp2p::core::upgrade::Version::V1Lazy)
            .authenticate(
                noise::Config::new(&local_key)
                    .map_err(|e| MessengerError::Transport(e.to_string()))?,
            )
            .multiplex(yamux::Config::default())
            .boxed();

        let gossipsub_config = gossipsub::ConfigBuilder::default()
            .validation_mode(ValidationMode::Strict)
            .heartbeat_interval(Duration::from_secs(10))
            .build()
            .map_err(|e| MessengerError::Transport(e.to_string()))?;

        let gossipsub = gossipsub::Behaviour::<IdentityTransform, AllowAllSubscriptionFilter>::new(
            MessageAuthenticity::Signed(local_key.clone()),
            gossipsub_config,
        )
        .map_err(|e| MessengerError::Transport(e.to_string()))?;

        let mut kademlia = kad::Behaviour::new(peer_id, MemoryStore::new(peer_id));
        kademlia.set_mode(Some(kad::Mode::Server));

        let swarm = Swarm::new(
            transport,
            NodeBehaviour {
                gossipsub,
                kademlia,
            },
            peer_id,
            libp2p::swarm::Config::with_tokio_executor()
                .with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT),
        );

        let (cmd_tx, cmd_rx) = mpsc::channel::<NodeCommand>(64);
        let (status_tx, status) = watch::channel(PeerStatus::default());
        let task = NodeTask {
            swarm,
            mode,
            listen_addrs,
            bootstrap_peers,
            listeners: HashMap::new(),
            pending_dials: HashMap::new(),
            status: status_tx,
        };
        tokio::spawn(task.run(cmd_rx));
        info!(%peer_id, ?mode, "pub/sub node created");

        Ok(Self {
            cmd_tx,
            status,
            next_id: AtomicU64::new(1),
            peer_id,
        })
    }
}

#[async_trait]
impl PubSubNode for GossipNode {
    async fn dial(&self, address: &str) -> MessengerResult<()> {
        let address: Multiaddr = address
            .parse()
            .map_err(|e| MessengerError::Transport(format!("invalid address {address}: {e}")))?;
        request(&self.cmd_tx, |respond_to| NodeCommand::Dial {
            address,
            respond_to,
        })
        .await
    }

    async fn start(&self) -> MessengerResult<()> {
        request(&self.cmd_tx, |respond_to| NodeCommand::Start { respond_to }).await
    }

    async fn stop(&self) -> MessengerResult<()> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(NodeCommand::Shutdown { respond_to: tx })
            .await
            .is_err()
        {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    /// Every capability is served by gossipsub, so any connected peer that
    /// speaks it satisfies the wait.
    async fn wait_for_peers(
        &self,
        _capabilities: &[Capability],
        timeout: Duration,
    ) -> MessengerResult<()> {
        let mut status = self.status.clone();
        tokio::time::timeout(timeout, status.wait_for(|s| s.pubsub_peers > 0))
            .await
            .map_err(|_| MessengerError::Transport("timed out waiting for peers".to_string()))?
            .map_err(|_| MessengerError::Transport("node is stopped".to_string()))?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.status.borrow().connected > 0
    }

    async fn subscribe(
        &self,
        content_topic: &str,
    ) -> MessengerResult<Box<dyn SubscriptionHandle>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let topic = content_topic.to_string();
        request(&self.cmd_tx, |respond_to| NodeCommand::Subscribe {
            topic: topic.clone(),
            id,
            respond_to,
        })
        .await?;
        Ok(Box::new(GossipSubscription {
            topic,
            id,
            cmd_tx: self.cmd_tx.clone(),
        }))
    }

    async fn publish(&self, content_topic: &str, payload: Vec<u8>) -> MessengerResult<()> {
        request(&self.cmd_tx, |respond_to| NodeCommand::Publish {
            topic: content_topic.to_string(),
            payload,
            respond_to,
        })
        .await
    }
}

pub struct GossipSubscription {
    topic: String,
    id: u64,
    cmd_tx: mpsc::Sender<NodeCommand>,
}

#[async_trait]
impl SubscriptionHandle for GossipSubscription {
    fn content_topic(&self) -> &str {
        &self.topic
    }

    async fn on_message(&self, callback: MessageCallback) -> MessengerResult<()> {
        request(&self.cmd_tx, |respond_to| NodeCommand::Listen {
            topic: self.topic.clone(),
            id: self.id,
            callback,
            respond_to,
        })
        .await
    }

    async fn ping(&self) -> MessengerResult<()> {
        request(&self.cmd_tx, |respond_to| NodeCommand::Ping {
            topic: self.topic.clone(),
            id: self.id,
            respond_to,
        })
        .await
    }

    async fn unsubscribe(&self) -> MessengerResult<()> {
        request(&self.cmd_tx, |respond_to| NodeCommand::Unsubscribe {
            topic: self.topic.clone(),
            id: self.id,
            respond_to,
        })
        .await
    }
}

struct NodeTask {
    swarm: Swarm<NodeBehaviour>,
    mode: NodeMode,
    listen_addrs: Vec<Multiaddr>,
    bootstrap_peers: Vec<Multiaddr>,
    /// topic -> subscription id -> callback (None until `on_message`)
    listeners: HashMap<String, HashMap<u64, Option<MessageCallback>>>,
    pending_dials: HashMap<ConnectionId, Reply<()>>,
    status: watch::Sender<PeerStatus>,
}

impl NodeTask {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<NodeCommand>) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(NodeCommand::Shutdown { respond_to }) => {
                        let _ = respond_to.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                event = self.swarm.select_next_some() => self.handle_event(event),
            }
            self.refresh_status();
        }
        debug!("pub/sub node task exited");
    }

    fn refresh_status(&self) {
        let next = PeerStatus {
            connected: self.swarm.connected_peers().count(),
            pubsub_peers: self.swarm.behaviour().gossipsub.all_peers().count(),
        };
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn handle_command(&mut self, cmd: NodeCommand) {
        match cmd {
            NodeCommand::Dial {
                address,
                respond_to,
            } => {
                let opts = DialOpts::unknown_peer_id().address(address).build();
                let connection_id = opts.connection_id();
                match self.swarm.dial(opts) {
                    Ok(()) => {
                        self.pending_dials.insert(connection_id, respond_to);
                    }
                    Err(err) => {
                        let _ = respond_to.send(Err(MessengerError::Transport(err.to_string())));
                    }
                }
            }
            NodeCommand::Start { respond_to } => {
                let _ = respond_to.send(self.start());
            }
            NodeCommand::Subscribe {
                topic,
                id,
                respond_to,
            } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .subscribe(&IdentTopic::new(topic.clone()))
                    .map(|_| ())
                    .map_err(|e| MessengerError::Subscription(e.to_string()));
                if result.is_ok() {
                    self.listeners.entry(topic).or_default().insert(id, None);
                }
                let _ = respond_to.send(result);
            }
            NodeCommand::Listen {
                topic,
                id,
                callback,
                respond_to,
            } => {
                let slot = self
                    .listeners
                    .get_mut(&topic)
                    .and_then(|subscriptions| subscriptions.get_mut(&id));
                let result = match slot {
                    Some(slot) => {
                        *slot = Some(callback);
                        Ok(())
                    }
                    None => Err(MessengerError::Transport(SUBSCRIPTION_LOST_MARKER.to_string())),
                };
                let _ = respond_to.send(result);
            }
            NodeCommand::Ping {
                topic,
                id,
                respond_to,
            } => {
                let _ = respond_to.send(self.ping(&topic, id));
            }
            NodeCommand::Unsubscribe {
                topic,
                id,
                respond_to,
            } => {
                if let Some(subscriptions) = self.listeners.get_mut(&topic) {
                    subscriptions.remove(&id);
                    if subscriptions.is_empty() {
                        self.listeners.remove(&topic);
                        let _ = self
                            .swarm
                            .behaviour_mut()
                            .gossipsub
                            .unsubscribe(&IdentTopic::new(topic));
                    }
                }
                let _ = respond_to.send(Ok(()));
            }
            NodeCommand::Publish {
                topic,
                payload,
                respond_to,
            } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .publish(IdentTopic::new(topic), payload)
                    .map(|_| ())
                    .map_err(|e| MessengerError::Publish(e.to_string()));
                let _ = respond_to.send(result);
            }
            NodeCommand::Shutdown { respond_to } => {
                let _ = respond_to.send(());
            }
        }
    }

    fn start(&mut self) -> MessengerResult<()> {
        for addr in self.listen_addrs.clone() {
            self.swarm
                .listen_on(addr)
                .map_err(|e| MessengerError::Transport(e.to_string()))?;
        }
        if self.mode == NodeMode::Bootstrap {
            for addr in self.bootstrap_peers.clone() {
                if let Some(peer_id) = peer_id_of(&addr) {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr.clone());
                }
                if let Err(err) = self.swarm.dial(addr.clone()) {
                    warn!(%addr, error = %err, "bootstrap dial failed");
                }
            }
            if let Err(err) = self.swarm.behaviour_mut().kademlia.bootstrap() {
                warn!(error = ?err, "kademlia bootstrap not started");
            }
        }
        Ok(())
    }

    fn ping(&self, topic: &str, id: u64) -> MessengerResult<()> {
        let registered = self
            .listeners
            .get(topic)
            .is_some_and(|subscriptions| subscriptions.contains_key(&id));
        let hash = IdentTopic::new(topic).hash();
        let joined = self
            .swarm
            .behaviour()
            .gossipsub
            .topics()
            .any(|subscribed| *subscribed == hash);
        if !registered || !joined {
            return Err(MessengerError::Transport(SUBSCRIPTION_LOST_MARKER.to_string()));
        }
        if self.swarm.behaviour().gossipsub.all_peers().next().is_none() {
            return Err(MessengerError::Transport(
                "no pub/sub peer connected".to_string(),
            ));
        }
        Ok(())
    }

    fn handle_event(&mut self, event: SwarmEvent<NodeBehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(NodeBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                message,
                ..
            })) => {
                let Some(subscriptions) = self.listeners.get(message.topic.as_str()) else {
                    return;
                };
                let inbound = InboundMessage {
                    content_topic: message.topic.to_string(),
                    payload: (!message.data.is_empty()).then_some(message.data),
                };
                for callback in subscriptions.values().flatten() {
                    callback(inbound.clone());
                }
            }
            SwarmEvent::Behaviour(NodeBehaviourEvent::Kademlia(kad::Event::RoutingUpdated {
                peer,
                ..
            })) => {
                debug!(%peer, "routing table updated");
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                ..
            } => {
                if self.mode == NodeMode::Bootstrap {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, endpoint.get_remote_address().clone());
                }
                if let Some(reply) = self.pending_dials.remove(&connection_id) {
                    let _ = reply.send(Ok(()));
                }
            }
            SwarmEvent::OutgoingConnectionError {
                connection_id,
                error,
                ..
            } => {
                if let Some(reply) = self.pending_dials.remove(&connection_id) {
                    let _ = reply.send(Err(MessengerError::Transport(error.to_string())));
                }
            }
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "listening");
            }
            _ => {}
        }
    }
}

fn load_or_create_keypair(path: &str) -> MessengerResult<identity::Keypair> {
    if let Some(parent) = Path::new(path).parent() {
        let _ = fs::create_dir_all(parent);
    }

    if let Ok(encoded) = fs::read_to_string(path) {
        if let Ok(raw) = BASE64.decode(encoded.trim()) {
            if let Ok(keypair) = identity::Keypair::from_protobuf_encoding(&raw) {
                return Ok(keypair);
            }
        }
        warn!(path, "unreadable node key, generating a new one");
    }

    let keypair = identity::Keypair::generate_ed25519();
    let encoded = keypair
        .to_protobuf_encoding()
        .map(|raw| BASE64.encode(raw))
        .map_err(|e| MessengerError::Transport(e.to_string()))?;
    if let Err(err) = fs::write(path, encoded) {
        warn!(path, error = %err, "could not persist node key");
    }
    Ok(keypair)
}
