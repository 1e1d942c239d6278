//! Transport & Multi-Path Join (§4.7).
//!
//! Two transport layers coexist, split between swarm-wide gossipsub
//! topics and point-to-point session logic: once a node is an
//! established mesh member, it
//! exchanges announcements over gossipsub topics; before that, a
//! prospective member completes a three-message handshake directly
//! against the founder/admitting node over whichever endpoint answers
//! first.

use std::error::Error;
use std::time::Duration;

use atmosphere_core::{JoinEndpoints, Token};
use futures::{SinkExt, StreamExt};
use libp2p::{gossipsub, identity, noise, swarm::NetworkBehaviour, tcp, yamux, Multiaddr, Swarm};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{info, warn};

use crate::error::{AtmosphereError, Result};

/// Per-endpoint connect timeout (§4.7 "Join flow").
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
/// Session heartbeat cadence and dead-session threshold (§4.7 "Heartbeats").
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const MISSED_HEARTBEATS_BEFORE_DEAD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetProfile {
    /// TCP + Noise + Yamux
    #[default]
    Tcp,
    /// TCP + Noise + Yamux, plus QUIC (UDP-based).
    TcpQuic,
    /// Low-power / intermittent-connectivity profile: prefers QUIC + relay.
    Mobile,
}

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "AtmosphereSwarmEvent")]
pub struct AtmosphereBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub identify: libp2p::identify::Behaviour,
    pub relay_client: libp2p::relay::client::Behaviour,
    pub dcutr: libp2p::dcutr::Behaviour,
}

#[derive(Debug)]
pub enum AtmosphereSwarmEvent {
    Gossipsub(gossipsub::Event),
    Identify(Box<libp2p::identify::Event>),
    RelayClient(libp2p::relay::client::Event),
    Dcutr(libp2p::dcutr::Event),
}

impl From<gossipsub::Event> for AtmosphereSwarmEvent {
    fn from(event: gossipsub::Event) -> Self {
        AtmosphereSwarmEvent::Gossipsub(event)
    }
}

impl From<libp2p::identify::Event> for AtmosphereSwarmEvent {
    fn from(event: libp2p::identify::Event) -> Self {
        AtmosphereSwarmEvent::Identify(Box::new(event))
    }
}

impl From<libp2p::relay::client::Event> for AtmosphereSwarmEvent {
    fn from(event: libp2p::relay::client::Event) -> Self {
        AtmosphereSwarmEvent::RelayClient(event)
    }
}

impl From<libp2p::dcutr::Event> for AtmosphereSwarmEvent {
    fn from(event: libp2p::dcutr::Event) -> Self {
        AtmosphereSwarmEvent::Dcutr(event)
    }
}

/// Established-mesh gossipsub transport: one topic per announcement
/// stream plus one for the CRDT topology cache (SPEC_FULL §B).
pub struct MeshTransport {
    pub swarm: Swarm<AtmosphereBehaviour>,
    pub announcements_topic: gossipsub::IdentTopic,
    pub mesh_control_topic: gossipsub::IdentTopic,
    pub invoke_topic: gossipsub::IdentTopic,
    pub topology_topic: gossipsub::IdentTopic,
}

impl MeshTransport {
    pub fn new(keypair: identity::Keypair) -> Result<Self> {
        Self::new_with_profile(keypair, NetProfile::default())
    }

    pub fn new_with_profile(
        keypair: identity::Keypair,
        profile: NetProfile,
    ) -> Result<Self> {
        let build = |key: &identity::Keypair| -> std::result::Result<Swarm<AtmosphereBehaviour>, Box<dyn Error>> {
            let swarm = match profile {
                NetProfile::Tcp => libp2p::SwarmBuilder::with_existing_identity(key.clone())
                    .with_tokio()
                    .with_tcp(tcp::Config::default(), noise::Config::new, yamux::Config::default)?
                    .with_relay_client(noise::Config::new, yamux::Config::default)?
                    .with_behaviour(|k, relay_client| {
                        let gossipsub_config = gossipsub::ConfigBuilder::default()
                            .validation_mode(gossipsub::ValidationMode::Strict)
                            .build()?;
                        Ok(AtmosphereBehaviour {
                            gossipsub: gossipsub::Behaviour::new(
                                gossipsub::MessageAuthenticity::Signed(k.clone()),
                                gossipsub_config,
                            )?,
                            identify: libp2p::identify::Behaviour::new(libp2p::identify::Config::new(
                                "/atmosphere/1.0.0".to_string(),
                                k.public(),
                            )),
                            relay_client,
                            dcutr: libp2p::dcutr::Behaviour::new(k.public().to_peer_id()),
                        })
                    })?
                    .build(),
                NetProfile::TcpQuic | NetProfile::Mobile => {
                    libp2p::SwarmBuilder::with_existing_identity(key.clone())
                        .with_tokio()
                        .with_tcp(tcp::Config::default(), noise::Config::new, yamux::Config::default)?
                        .with_quic()
                        .with_relay_client(noise::Config::new, yamux::Config::default)?
                        .with_behaviour(|k, relay_client| {
                            let gossipsub_config = gossipsub::ConfigBuilder::default()
                                .validation_mode(gossipsub::ValidationMode::Strict)
                                .build()?;
                            Ok(AtmosphereBehaviour {
                                gossipsub: gossipsub::Behaviour::new(
                                    gossipsub::MessageAuthenticity::Signed(k.clone()),
                                    gossipsub_config,
                                )?,
                                identify: libp2p::identify::Behaviour::new(
                                    libp2p::identify::Config::new(
                                        "/atmosphere/1.0.0".to_string(),
                                        k.public(),
                                    ),
                                ),
                                relay_client,
                                dcutr: libp2p::dcutr::Behaviour::new(k.public().to_peer_id()),
                            })
                        })?
                        .build()
                }
            };
            Ok(swarm)
        };

        let swarm = build(&keypair)
            .map_err(|e| AtmosphereError::TransportFailure(e.to_string()))?;

        Ok(Self {
            swarm,
            announcements_topic: gossipsub::IdentTopic::new("atmosphere_announcements"),
            mesh_control_topic: gossipsub::IdentTopic::new("atmosphere_mesh_control"),
            invoke_topic: gossipsub::IdentTopic::new("atmosphere_invoke"),
            topology_topic: gossipsub::IdentTopic::new("atmosphere_topology"),
        })
    }

    pub fn subscribe_all(&mut self) -> Result<()> {
        let topics = [
            &self.announcements_topic,
            &self.mesh_control_topic,
            &self.invoke_topic,
            &self.topology_topic,
        ];
        for topic in topics {
            self.swarm
                .behaviour_mut()
                .gossipsub
                .subscribe(topic)
                .map_err(|e| AtmosphereError::TransportFailure(e.to_string()))?;
        }
        Ok(())
    }

    pub fn listen_on(&mut self, addr: Multiaddr) -> Result<()> {
        self.swarm
            .listen_on(addr)
            .map_err(|e| AtmosphereError::TransportFailure(e.to_string()))?;
        Ok(())
    }

    pub fn dial(&mut self, addr: Multiaddr) -> Result<()> {
        self.swarm
            .dial(addr)
            .map_err(|e| AtmosphereError::TransportFailure(e.to_string()))?;
        Ok(())
    }
}

// --- Join handshake (§4.7 "Join flow") ---------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HandshakeMessage {
    Hello {
        token: Token,
        proposed_caps: Vec<String>,
    },
    Welcome {
        mesh_id: String,
        mesh_name: String,
        session_id: String,
    },
    Reject {
        reason: String,
    },
    SessionEstablished {
        node_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Dialing,
    Handshaking,
    Established,
    Dead,
}

pub struct Session {
    pub peer_node_id: String,
    pub session_id: String,
    pub state: SessionState,
    pub missed_heartbeats: u32,
}

async fn send_message<S>(framed: &mut Framed<S, LengthDelimitedCodec>, msg: &HandshakeMessage) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let bytes = serde_json::to_vec(msg)?;
    framed
        .send(bytes.into())
        .await
        .map_err(|e| AtmosphereError::TransportFailure(e.to_string()))
}

async fn recv_message<S>(framed: &mut Framed<S, LengthDelimitedCodec>) -> Result<HandshakeMessage>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = framed
        .next()
        .await
        .ok_or_else(|| AtmosphereError::TransportFailure("connection closed during handshake".into()))?
        .map_err(|e| AtmosphereError::TransportFailure(e.to_string()))?;
    let msg: HandshakeMessage = serde_json::from_slice(&frame)?;
    Ok(msg)
}

/// Peer side of the handshake (§4.7 steps 1 and 3): connects, sends
/// `hello`, awaits `welcome`/`reject`, and on welcome sends
/// `session_established`.
pub async fn join_over_stream<S>(
    stream: S,
    token: Token,
    proposed_caps: Vec<String>,
    local_node_id: &str,
) -> Result<Session>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    send_message(
        &mut framed,
        &HandshakeMessage::Hello {
            token,
            proposed_caps,
        },
    )
    .await?;

    match recv_message(&mut framed).await? {
        HandshakeMessage::Welcome {
            mesh_id: _,
            mesh_name: _,
            session_id,
        } => {
            send_message(
                &mut framed,
                &HandshakeMessage::SessionEstablished {
                    node_id: local_node_id.to_string(),
                },
            )
            .await?;
            Ok(Session {
                peer_node_id: String::new(),
                session_id,
                state: SessionState::Established,
                missed_heartbeats: 0,
            })
        }
        HandshakeMessage::Reject { reason } => Err(AtmosphereError::NotAuthorized(reason)),
        other => Err(AtmosphereError::TransportFailure(format!(
            "unexpected handshake message: {other:?}"
        ))),
    }
}

/// Admitting side of the handshake (§4.7 step 2): receives `hello`,
/// hands the token to `verify` (identity verification plus mesh
/// allowlist/denylist per §4.8), and replies accordingly.
pub async fn admit_over_stream<S, F>(
    stream: S,
    mesh_id: &str,
    mesh_name: &str,
    verify: F,
) -> Result<Session>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(&Token, &[String]) -> std::result::Result<String, String>,
{
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    let hello = recv_message(&mut framed).await?;
    let (token, proposed_caps) = match hello {
        HandshakeMessage::Hello {
            token,
            proposed_caps,
        } => (token, proposed_caps),
        other => {
            return Err(AtmosphereError::TransportFailure(format!(
                "expected hello, got {other:?}"
            )))
        }
    };

    match verify(&token, &proposed_caps) {
        Ok(session_id) => {
            send_message(
                &mut framed,
                &HandshakeMessage::Welcome {
                    mesh_id: mesh_id.to_string(),
                    mesh_name: mesh_name.to_string(),
                    session_id: session_id.clone(),
                },
            )
            .await?;

            match recv_message(&mut framed).await? {
                HandshakeMessage::SessionEstablished { node_id } => Ok(Session {
                    peer_node_id: node_id,
                    session_id,
                    state: SessionState::Established,
                    missed_heartbeats: 0,
                }),
                other => Err(AtmosphereError::TransportFailure(format!(
                    "expected session_established, got {other:?}"
                ))),
            }
        }
        Err(reason) => {
            send_message(&mut framed, &HandshakeMessage::Reject { reason: reason.clone() }).await?;
            Err(AtmosphereError::NotAuthorized(reason))
        }
    }
}

/// Attempts endpoints in preference order (local, public, relay) with
/// a per-endpoint connect timeout, returning the first established
/// session (§4.7 "Join flow").
pub async fn dial_with_preference(
    endpoints: &JoinEndpoints,
    token: Token,
    proposed_caps: Vec<String>,
    local_node_id: &str,
) -> Result<Session> {
    let mut last_err = None;
    for (kind, addr) in endpoints.in_preference_order() {
        if kind == "relay" {
            // Relay endpoints are WebSocket URLs (§4.7 "Relay
            // semantics"); establishing that connection is the
            // responsibility of the relay client module, which hands
            // this function an already-connected stream in production.
            // Plain dialing here only covers local/public TCP.
            continue;
        }
        info!(endpoint_kind = kind, addr, "attempting join over endpoint");
        let connect = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr));
        match connect.await {
            Ok(Ok(stream)) => {
                match join_over_stream(stream, token.clone(), proposed_caps.clone(), local_node_id)
                    .await
                {
                    Ok(session) => return Ok(session),
                    Err(e) => {
                        warn!(endpoint_kind = kind, error = %e, "handshake failed");
                        last_err = Some(e);
                    }
                }
            }
            Ok(Err(e)) => {
                warn!(endpoint_kind = kind, error = %e, "connect failed");
                last_err = Some(AtmosphereError::TransportFailure(e.to_string()));
            }
            Err(_) => {
                warn!(endpoint_kind = kind, "connect timed out");
                last_err = Some(AtmosphereError::Timeout(CONNECT_TIMEOUT));
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        AtmosphereError::TransportFailure("no usable endpoints".into())
    }))
}
