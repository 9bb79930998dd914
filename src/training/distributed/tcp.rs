//! Multi-process worker group over TCP
//!
//! Rank 0 listens on `master_addr:master_port` and every other rank connects
//! to it, forming a star. Collectives are relayed through rank 0: peers send
//! their contribution, rank 0 combines them in rank order and replies to all.
//! Messages are bincode-encoded [`Frame`]s prefixed by their length as a
//! little-endian `u64`.

use std::time::Duration;

use async_trait::async_trait;
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::DistributedContext;
use crate::error::{Error, Result};
use crate::training::checkpoints::TensorState;
use crate::training::config::DistributedConfig;

/// Largest frame accepted from a peer
const MAX_FRAME_BYTES: u64 = 1 << 32;

/// Frame bodies are read in pieces of this size, so buffers grow with the
/// bytes actually received rather than the announced length
const READ_CHUNK_BYTES: u64 = 1 << 20;

#[derive(Debug, Serialize, Deserialize)]
enum Frame {
    Hello { rank: usize, world_size: usize },
    Gather(TensorState),
    Gathered(TensorState),
    Barrier,
}

impl Frame {
    fn kind(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::Gather(_) => "gather",
            Frame::Gathered(_) => "gathered",
            Frame::Barrier => "barrier",
        }
    }
}

async fn write_frame(stream: &mut TcpStream, frame: &Frame) -> Result<()> {
    let bytes = bincode::serialize(frame)?;
    stream.write_all(&(bytes.len() as u64).to_le_bytes()).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Frame> {
    let mut len = [0u8; 8];
    stream.read_exact(&mut len).await?;
    let len = u64::from_le_bytes(len);
    if len > MAX_FRAME_BYTES {
        return Err(Error::distributed(format!("peer sent oversized frame of {} bytes", len)));
    }
    let mut bytes = Vec::with_capacity(len.min(READ_CHUNK_BYTES) as usize);
    while (bytes.len() as u64) < len {
        let chunk = (len - bytes.len() as u64).min(READ_CHUNK_BYTES);
        let read = (&mut *stream).take(chunk).read_to_end(&mut bytes).await?;
        if read == 0 {
            return Err(Error::distributed(format!(
                "peer closed the connection after {} of {} frame bytes",
                bytes.len(),
                len
            )));
        }
    }
    Ok(bincode::deserialize(&bytes)?)
}

fn unexpected(expected: &str, got: &Frame) -> Error {
    Error::distributed(format!("expected {} frame, received {}", expected, got.kind()))
}

enum Role {
    /// Rank 0 with one stream per peer, index `r - 1` for rank `r`
    Hub(Mutex<Vec<TcpStream>>),
    /// Any other rank with its stream to rank 0
    Peer(Mutex<TcpStream>),
}

/// Worker group spanning several processes
pub struct TcpGroup {
    rank: usize,
    world_size: usize,
    role: Role,
}

impl TcpGroup {
    /// Join the group described by `config`, waiting for all peers
    pub async fn connect(config: &DistributedConfig) -> Result<Self> {
        let addr = format!("{}:{}", config.master_addr, config.master_port);
        let timeout = Duration::from_secs(config.connect_timeout_secs.max(1));

        let role = if config.rank == 0 {
            Role::Hub(Mutex::new(Self::accept_peers(&addr, config.world_size, timeout).await?))
        } else {
            Role::Peer(Mutex::new(
                Self::connect_to_hub(&addr, config.rank, config.world_size, timeout).await?,
            ))
        };

        info!(rank = config.rank, world_size = config.world_size, "Process group ready");
        Ok(Self {
            rank: config.rank,
            world_size: config.world_size,
            role,
        })
    }

    async fn accept_peers(addr: &str, world_size: usize, timeout: Duration) -> Result<Vec<TcpStream>> {
        let listener = TcpListener::bind(addr).await?;
        let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
        let mut joined = 0;

        while joined < world_size - 1 {
            let (mut stream, peer) = tokio::time::timeout(timeout, listener.accept())
                .await
                .map_err(|_| {
                    Error::distributed(format!(
                        "only {} of {} peers joined within {:?}",
                        joined,
                        world_size - 1,
                        timeout
                    ))
                })??;
            stream.set_nodelay(true)?;

            match read_frame(&mut stream).await? {
                Frame::Hello { rank, world_size: peer_world } => {
                    if peer_world != world_size || rank == 0 || rank >= world_size {
                        return Err(Error::distributed(format!(
                            "peer {} announced rank {} of {}, expected a rank below {}",
                            peer, rank, peer_world, world_size
                        )));
                    }
                    if slots[rank - 1].is_some() {
                        return Err(Error::distributed(format!("rank {} joined twice", rank)));
                    }
                    debug!(rank, %peer, "Peer joined");
                    slots[rank - 1] = Some(stream);
                    joined += 1;
                }
                other => return Err(unexpected("hello", &other)),
            }
        }

        slots
            .into_iter()
            .map(|slot| slot.ok_or_else(|| Error::distributed("peer slot left empty")))
            .collect()
    }

    async fn connect_to_hub(
        addr: &str,
        rank: usize,
        world_size: usize,
        timeout: Duration,
    ) -> Result<TcpStream> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut stream = loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(err) if tokio::time::Instant::now() < deadline => {
                    debug!(rank, "Rendezvous at {} not ready: {}", addr, err);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                Err(err) => {
                    warn!(rank, "Giving up on rendezvous at {}", addr);
                    return Err(Error::distributed(format!("cannot reach rank 0 at {}: {}", addr, err)));
                }
            }
        };
        stream.set_nodelay(true)?;
        write_frame(&mut stream, &Frame::Hello { rank, world_size }).await?;
        Ok(stream)
    }
}

#[async_trait]
impl DistributedContext for TcpGroup {
    fn world_size(&self) -> usize {
        self.world_size
    }

    fn rank(&self) -> usize {
        self.rank
    }

    async fn all_gather(&self, tensor: &Tensor) -> Result<Tensor> {
        let device = tensor.device().clone();
        let gathered = match &self.role {
            Role::Hub(peers) => {
                let mut peers = peers.lock().await;
                let mut parts = vec![tensor.to_device(&Device::Cpu)?];
                for stream in peers.iter_mut() {
                    match read_frame(stream).await? {
                        Frame::Gather(state) => parts.push(state.to_tensor(&Device::Cpu)?),
                        other => return Err(unexpected("gather", &other)),
                    }
                }
                let combined = Tensor::cat(&parts, 0)?;
                let reply = Frame::Gathered(TensorState::from_tensor(&combined)?);
                for stream in peers.iter_mut() {
                    write_frame(stream, &reply).await?;
                }
                combined
            }
            Role::Peer(hub) => {
                let mut hub = hub.lock().await;
                write_frame(&mut hub, &Frame::Gather(TensorState::from_tensor(tensor)?)).await?;
                match read_frame(&mut *hub).await? {
                    Frame::Gathered(state) => state.to_tensor(&Device::Cpu)?,
                    other => return Err(unexpected("gathered", &other)),
                }
            }
        };
        Ok(gathered.to_device(&device)?)
    }

    async fn synchronize(&self) -> Result<()> {
        match &self.role {
            Role::Hub(peers) => {
                let mut peers = peers.lock().await;
                for stream in peers.iter_mut() {
                    match read_frame(stream).await? {
                        Frame::Barrier => {}
                        other => return Err(unexpected("barrier", &other)),
                    }
                }
                for stream in peers.iter_mut() {
                    write_frame(stream, &Frame::Barrier).await?;
                }
            }
            Role::Peer(hub) => {
                let mut hub = hub.lock().await;
                write_frame(&mut hub, &Frame::Barrier).await?;
                match read_frame(&mut *hub).await? {
                    Frame::Barrier => {}
                    other => return Err(unexpected("barrier", &other)),
                }
            }
        }
        Ok(())
    }
}
