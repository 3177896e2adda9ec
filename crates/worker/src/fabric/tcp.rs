//! Peer fabric over gRPC with a rank-0 rendezvous
//!
//! Every rank serves a `FabricService` endpoint. Rank 0 serves it on the
//! group address and answers `Register` calls until all ranks have
//! registered, then every pending call returns the group id and the peer
//! table. The other ranks serve on an ephemeral port, which they announce
//! when registering.
//!
//! Messages travel as unary `Deliver` calls into per-sender inboxes. A send
//! returns once the receiver has queued the frame, so frames between a pair
//! of ranks arrive in send order. The transport drives its links on a small
//! tokio runtime of its own behind the blocking [`Transport`] trait, and
//! must not be called from inside an async task.

use super::{FabricError, Transport};
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use shardline_common::{Result, ShardlineError, DEFAULT_MAX_MESSAGE_BYTES};
use shardline_proto::fabric::{Delivered, Frame, PeerEntry, Registration, Welcome};
use shardline_proto::{FabricService, FabricServiceClient, FabricServiceServer};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Channel, Endpoint, Server};
use tonic::{Code, Request, Response, Status};
use tracing::{debug, info, warn};
use uuid::Uuid;

const DIAL_RETRY: Duration = Duration::from_millis(50);

type PeerClient = FabricServiceClient<Channel>;

/// Settings for joining a group
#[derive(Debug, Clone)]
pub struct LinkOptions {
    /// How long to wait for the whole group to form
    pub join_timeout: Duration,
    /// Largest message a link encodes or accepts, in bytes
    pub max_frame_bytes: usize,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(60),
            max_frame_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

/// Registration book kept by rank 0 while the group forms
struct Rendezvous {
    world_size: usize,
    peers: Mutex<Vec<Option<PeerEntry>>>,
    welcome: watch::Sender<Option<Welcome>>,
}

impl Rendezvous {
    fn new(world_size: usize, host: PeerEntry) -> Self {
        let mut peers = vec![None; world_size];
        peers[0] = Some(host);
        let rendezvous = Self {
            world_size,
            peers: Mutex::new(peers),
            welcome: watch::channel(None).0,
        };
        rendezvous.publish_if_complete(&rendezvous.peers.lock());
        rendezvous
    }

    fn register(&self, registration: &Registration, host: IpAddr) -> std::result::Result<(), Status> {
        let rank = registration.rank as usize;
        if registration.world_size as usize != self.world_size {
            return Err(Status::invalid_argument(format!(
                "rank {} registered for a world of {}, group has {}",
                rank, registration.world_size, self.world_size
            )));
        }
        if rank == 0 || rank >= self.world_size {
            return Err(Status::invalid_argument(format!(
                "rank {} is outside a group of {}",
                rank, self.world_size
            )));
        }

        let mut peers = self.peers.lock();
        if peers[rank].is_some() {
            return Err(Status::already_exists(format!("rank {} registered twice", rank)));
        }
        peers[rank] = Some(PeerEntry {
            rank: registration.rank,
            host: host.to_string(),
            port: registration.peer_port,
        });
        self.publish_if_complete(&peers);
        Ok(())
    }

    fn publish_if_complete(&self, peers: &[Option<PeerEntry>]) {
        if peers.iter().all(Option::is_some) {
            self.welcome.send_replace(Some(Welcome {
                group_id: Uuid::new_v4().to_string(),
                peers: peers.iter().flatten().cloned().collect(),
            }));
        }
    }

    async fn wait(&self) -> std::result::Result<Welcome, Status> {
        let mut welcome = self.welcome.subscribe();
        let published = welcome
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Status::unavailable("rendezvous closed"))?;
        published
            .clone()
            .ok_or_else(|| Status::internal("rendezvous published no peer table"))
    }
}

/// Server side of one rank's fabric endpoint
struct FabricNode {
    rank: usize,
    inboxes: Vec<Sender<Vec<f32>>>,
    rendezvous: Option<Arc<Rendezvous>>,
}

#[tonic::async_trait]
impl FabricService for FabricNode {
    async fn register(
        &self,
        request: Request<Registration>,
    ) -> std::result::Result<Response<Welcome>, Status> {
        let rendezvous = self.rendezvous.as_ref().ok_or_else(|| {
            Status::failed_precondition(format!("rank {} does not host the rendezvous", self.rank))
        })?;
        let host = request
            .remote_addr()
            .map(|addr| addr.ip())
            .ok_or_else(|| Status::internal("registration has no remote address"))?;

        let registration = request.into_inner();
        rendezvous.register(&registration, host)?;
        debug!("rank {} registered from {}", registration.rank, host);

        Ok(Response::new(rendezvous.wait().await?))
    }

    async fn deliver(&self, request: Request<Frame>) -> std::result::Result<Response<Delivered>, Status> {
        let frame = request.into_inner();
        let src = frame.src_rank as usize;
        let inbox = self
            .inboxes
            .get(src)
            .filter(|_| src != self.rank)
            .ok_or_else(|| Status::invalid_argument(format!("frame from unknown rank {}", src)))?;

        inbox
            .send(frame.data)
            .map_err(|_| Status::unavailable(format!("rank {} stopped receiving", self.rank)))?;
        Ok(Response::new(Delivered {}))
    }
}

/// Full-mesh transport over gRPC peer links
pub struct TcpTransport {
    rank: usize,
    world_size: usize,
    group_id: Uuid,
    peers: Vec<Option<PeerClient>>,
    inboxes: Vec<Receiver<Vec<f32>>>,
    runtime: Option<Runtime>,
}

impl TcpTransport {
    /// Join the group whose rendezvous is hosted by rank 0 at `address:port`
    ///
    /// Fails with a connection error when the group is not complete within
    /// the join timeout. There is no retry.
    pub fn connect(
        rank: usize,
        world_size: usize,
        address: &str,
        port: u16,
        options: &LinkOptions,
    ) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(ShardlineError::invalid_input(format!(
                "rank {} is outside a group of {}",
                rank, world_size
            )));
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("shardline-fabric")
            .enable_all()
            .build()?;
        info!("init process group for rank {} (world size {})", rank, world_size);

        let (senders, inboxes): (Vec<_>, Vec<_>) = (0..world_size).map(|_| unbounded()).unzip();
        let formed = runtime.block_on(async {
            timeout(
                options.join_timeout,
                form_group(rank, world_size, address, port, senders, options.max_frame_bytes),
            )
            .await
            .unwrap_or_else(|_| {
                Err(ShardlineError::connection(format!(
                    "rank {} timed out after {:?} waiting for the group to form",
                    rank, options.join_timeout
                )))
            })
        });

        let (group_id, peers) = match formed {
            Ok(formed) => formed,
            Err(e) => {
                runtime.shutdown_background();
                return Err(e);
            }
        };

        info!("init process group for rank {} done, group {}", rank, group_id);
        Ok(Self {
            rank,
            world_size,
            group_id,
            peers,
            inboxes,
            runtime: Some(runtime),
        })
    }

    /// Group id issued by rank 0
    pub fn group_id(&self) -> Uuid {
        self.group_id
    }

    fn check_peer(&self, peer: usize) -> Result<()> {
        if peer >= self.world_size {
            return Err(FabricError::RankOutOfRange {
                rank: peer,
                world_size: self.world_size,
            }
            .into());
        }
        if peer == self.rank {
            return Err(FabricError::SelfLink(peer).into());
        }
        Ok(())
    }
}

impl Transport for TcpTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn send(&self, peer: usize, data: &[f32]) -> Result<()> {
        self.check_peer(peer)?;
        let (Some(runtime), Some(client)) = (&self.runtime, &self.peers[peer]) else {
            return Err(FabricError::Disconnected(peer).into());
        };

        let frame = Frame {
            src_rank: self.rank as u32,
            data: data.to_vec(),
        };
        let mut client = client.clone();
        runtime
            .block_on(client.deliver(frame))
            .map(|_| ())
            .map_err(|status| match status.code() {
                Code::Unavailable => FabricError::Disconnected(peer).into(),
                _ => FabricError::Link { peer, status }.into(),
            })
    }

    fn recv(&self, peer: usize) -> Result<Vec<f32>> {
        self.check_peer(peer)?;
        self.inboxes[peer]
            .recv()
            .map_err(|_| FabricError::Disconnected(peer).into())
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Start this rank's endpoint, register, and dial every other rank
async fn form_group(
    rank: usize,
    world_size: usize,
    address: &str,
    port: u16,
    inboxes: Vec<Sender<Vec<f32>>>,
    max_frame_bytes: usize,
) -> Result<(Uuid, Vec<Option<PeerClient>>)> {
    let rendezvous_addr = tokio::net::lookup_host((address, port))
        .await?
        .next()
        .ok_or_else(|| ShardlineError::connection(format!("{}:{} did not resolve", address, port)))?;

    let bind_addr = if rank == 0 {
        rendezvous_addr
    } else {
        SocketAddr::new(unspecified(rendezvous_addr.ip()), 0)
    };
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| ShardlineError::connection(format!("bind {}: {}", bind_addr, e)))?;
    let local_addr = listener.local_addr()?;
    debug!("rank {} fabric endpoint on {}", rank, local_addr);

    let rendezvous = (rank == 0).then(|| {
        Arc::new(Rendezvous::new(
            world_size,
            PeerEntry {
                rank: 0,
                host: rendezvous_addr.ip().to_string(),
                port: local_addr.port() as u32,
            },
        ))
    });

    let node = FabricNode {
        rank,
        inboxes,
        rendezvous: rendezvous.clone(),
    };
    let service = FabricServiceServer::new(node)
        .max_decoding_message_size(max_frame_bytes)
        .max_encoding_message_size(max_frame_bytes);
    tokio::spawn(async move {
        let served = Server::builder()
            .add_service(service)
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await;
        if let Err(e) = served {
            warn!("rank {} fabric endpoint stopped: {}", rank, e);
        }
    });

    let mut peers: Vec<Option<PeerClient>> = vec![None; world_size];
    let welcome = match rendezvous {
        Some(rendezvous) => rendezvous
            .wait()
            .await
            .map_err(|status| ShardlineError::connection(status.message().to_string()))?,
        None => {
            let mut client = dial(rendezvous_addr, max_frame_bytes).await?;
            let registration = Registration {
                rank: rank as u32,
                world_size: world_size as u32,
                peer_port: local_addr.port() as u32,
            };
            let welcome = client
                .register(registration)
                .await
                .map_err(|status| {
                    ShardlineError::connection(format!(
                        "rendezvous rejected rank {}: {}",
                        rank,
                        status.message()
                    ))
                })?
                .into_inner();
            peers[0] = Some(client);
            welcome
        }
    };

    if welcome.peers.len() != world_size {
        return Err(ShardlineError::connection(format!(
            "peer table has {} entries, expected {}",
            welcome.peers.len(),
            world_size
        )));
    }
    let group_id = welcome
        .group_id
        .parse::<Uuid>()
        .map_err(|e| ShardlineError::connection(format!("bad group id: {}", e)))?;

    for entry in &welcome.peers {
        let peer = entry.rank as usize;
        if peer == rank || peers.get(peer).map_or(true, Option::is_some) {
            continue;
        }
        let host: IpAddr = entry
            .host
            .parse()
            .map_err(|e| ShardlineError::connection(format!("bad host for rank {}: {}", peer, e)))?;
        peers[peer] = Some(dial(SocketAddr::new(host, entry.port as u16), max_frame_bytes).await?);
    }

    if let Some(missing) = (0..world_size).find(|&peer| peer != rank && peers[peer].is_none()) {
        return Err(ShardlineError::connection(format!("no link to rank {}", missing)));
    }
    Ok((group_id, peers))
}

/// Connect to a rank's endpoint, retrying until it listens
///
/// Bounded by the caller's join timeout.
async fn dial(addr: SocketAddr, max_frame_bytes: usize) -> Result<PeerClient> {
    let endpoint = Endpoint::from_shared(format!("http://{}", addr))?.tcp_nodelay(true);
    let channel = loop {
        match endpoint.connect().await {
            Ok(channel) => break channel,
            Err(e) => {
                debug!("{} not reachable yet: {}", addr, e);
                sleep(DIAL_RETRY).await;
            }
        }
    };

    Ok(FabricServiceClient::new(channel)
        .max_decoding_message_size(max_frame_bytes)
        .max_encoding_message_size(max_frame_bytes))
}

fn unspecified(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}
