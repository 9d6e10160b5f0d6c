use std::collections::HashMap;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::fabric::{Fabric, FabricError};
use crate::message::Message;

/// Everything that travels over a fabric TCP stream. The first packet of a
/// connection identifies the dialer; all further packets are `Msg`.
#[derive(Debug, Serialize, Deserialize)]
enum Packet {
    /// Worker → root on the rendezvous connection: where the worker's own
    /// listener accepts peer connections.
    Join { listen: SocketAddr },
    /// Root → worker: assigned rank and the full peer directory.
    Welcome {
        rank: u32,
        world: u32,
        directory: Vec<(u32, SocketAddr)>,
    },
    /// Worker → worker: identifies the dialer on a peer connection.
    Hello { rank: u32 },
    Msg(Message),
}

type Reader = FramedRead<OwnedReadHalf, LengthDelimitedCodec>;
type Writer = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;
type Inbox = mpsc::UnboundedReceiver<Result<(usize, Message), FabricError>>;
type InboxTx = mpsc::UnboundedSender<Result<(usize, Message), FabricError>>;

/// Point-to-point fabric over TCP with the root as rendezvous point.
///
/// Workers dial the root, announce their own listen address, and receive the
/// directory of every peer. Worker-to-worker connections are dialed lazily
/// on first send; each connection carries frames in one direction, so FIFO
/// per ordered pair follows from TCP ordering.
pub struct TcpFabric {
    rank: usize,
    world: usize,
    inbox: Inbox,
    inbox_tx: InboxTx,
    directory: HashMap<usize, SocketAddr>,
    writers: HashMap<usize, Writer>,
    listener: Option<JoinHandle<()>>,
}

/// Root side of the rendezvous, split from `accept_workers` so callers can
/// learn the bound address before spawning any worker process.
pub struct TcpRoot {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpRoot {
    pub async fn bind(addr: SocketAddr) -> Result<Self, FabricError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "fabric rendezvous listening");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts exactly `world` workers, assigns ranks in join order, sends
    /// each the peer directory and returns the root endpoint.
    pub async fn accept_workers(self, world: usize) -> Result<TcpFabric, FabricError> {
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let mut writers = HashMap::new();
        let mut listen_addrs = Vec::with_capacity(world);

        for rank in 0..world {
            let (stream, remote) = self.listener.accept().await?;
            stream.set_nodelay(true)?;
            let (read, write) = stream.into_split();
            let mut reader = FramedRead::new(read, LengthDelimitedCodec::new());
            match read_packet(&mut reader).await? {
                Packet::Join { listen } => {
                    debug!(rank, %remote, %listen, "worker joined");
                    listen_addrs.push((rank as u32, listen));
                    writers.insert(rank, FramedWrite::new(write, LengthDelimitedCodec::new()));
                    spawn_reader(rank, reader, inbox_tx.clone());
                }
                other => {
                    return Err(FabricError::Protocol(format!(
                        "expected a join packet, got {other:?}"
                    )))
                }
            }
        }

        for (rank, writer) in writers.iter_mut() {
            write_packet(
                writer,
                &Packet::Welcome {
                    rank: *rank as u32,
                    world: world as u32,
                    directory: listen_addrs.clone(),
                },
            )
            .await?;
        }
        info!(world, "all workers joined the fabric");

        Ok(TcpFabric {
            rank: world,
            world,
            inbox,
            inbox_tx,
            directory: HashMap::new(),
            writers,
            listener: None,
        })
    }
}

impl TcpFabric {
    /// Worker side: dial the root, learn our rank and the peer directory,
    /// and start accepting peer connections.
    pub async fn connect(root: SocketAddr) -> Result<Self, FabricError> {
        let listener = TcpListener::bind((std::net::Ipv4Addr::UNSPECIFIED, 0)).await?;
        let listen_addr = listener.local_addr()?;

        let stream = TcpStream::connect(root).await?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        let mut reader = FramedRead::new(read, LengthDelimitedCodec::new());
        let mut writer = FramedWrite::new(write, LengthDelimitedCodec::new());
        write_packet(
            &mut writer,
            &Packet::Join {
                listen: listen_addr,
            },
        )
        .await?;

        let (rank, world, directory) = match read_packet(&mut reader).await? {
            Packet::Welcome {
                rank,
                world,
                directory,
            } => (
                rank as usize,
                world as usize,
                directory
                    .into_iter()
                    .map(|(r, a)| (r as usize, a))
                    .collect::<HashMap<_, _>>(),
            ),
            other => {
                return Err(FabricError::Protocol(format!(
                    "expected a welcome packet, got {other:?}"
                )))
            }
        };
        info!(rank, world, %listen_addr, "joined fabric");

        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        spawn_reader(world, reader, inbox_tx.clone());

        let accept_tx = inbox_tx.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("peer accept failed: {err}");
                        continue;
                    }
                };
                if stream.set_nodelay(true).is_err() {
                    continue;
                }
                let (read, _write) = stream.into_split();
                let mut reader = FramedRead::new(read, LengthDelimitedCodec::new());
                let tx = accept_tx.clone();
                tokio::spawn(async move {
                    match read_packet(&mut reader).await {
                        Ok(Packet::Hello { rank }) => {
                            debug!(peer = rank, %remote, "peer connected");
                            pump(rank as usize, reader, tx).await;
                        }
                        Ok(other) => {
                            let _ = tx.send(Err(FabricError::Protocol(format!(
                                "expected a hello packet, got {other:?}"
                            ))));
                        }
                        Err(err) => {
                            let _ = tx.send(Err(err));
                        }
                    }
                });
            }
        });

        let mut writers = HashMap::new();
        writers.insert(world, writer);
        Ok(Self {
            rank,
            world,
            inbox,
            inbox_tx,
            directory,
            writers,
            listener: Some(accept_task),
        })
    }

    async fn writer_for(&mut self, dst: usize) -> Result<&mut Writer, FabricError> {
        if !self.writers.contains_key(&dst) {
            let addr = *self
                .directory
                .get(&dst)
                .ok_or(FabricError::Unreachable(dst))?;
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            let (read, write) = stream.into_split();
            // the peer only reads on this connection
            drop(read);
            let mut writer = FramedWrite::new(write, LengthDelimitedCodec::new());
            write_packet(
                &mut writer,
                &Packet::Hello {
                    rank: self.rank as u32,
                },
            )
            .await?;
            self.writers.insert(dst, writer);
        }
        Ok(self.writers.get_mut(&dst).expect("inserted above"))
    }
}

#[async_trait]
impl Fabric for TcpFabric {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world(&self) -> usize {
        self.world
    }

    async fn send(&mut self, dst: usize, message: Message) -> Result<(), FabricError> {
        let writer = self.writer_for(dst).await?;
        write_packet(writer, &Packet::Msg(message)).await
    }

    async fn recv(&mut self) -> Result<(usize, Message), FabricError> {
        match self.inbox.recv().await {
            Some(item) => item,
            None => Err(FabricError::Closed),
        }
    }

    fn try_recv(&mut self) -> Result<Option<(usize, Message)>, FabricError> {
        match self.inbox.try_recv() {
            Ok(item) => item.map(Some),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(FabricError::Closed),
        }
    }
}

impl Drop for TcpFabric {
    fn drop(&mut self) {
        if let Some(task) = self.listener.take() {
            task.abort();
        }
    }
}

fn spawn_reader(peer: usize, reader: Reader, tx: InboxTx) {
    tokio::spawn(async move {
        pump(peer, reader, tx).await;
    });
}

/// Forwards decoded frames from one connection into the shared inbox until
/// the peer hangs up.
async fn pump(peer: usize, mut reader: Reader, tx: InboxTx) {
    while let Some(frame) = reader.next().await {
        let item = frame
            .map_err(FabricError::from)
            .and_then(|bytes| postcard::from_bytes::<Packet>(&bytes).map_err(FabricError::from))
            .and_then(|packet| match packet {
                Packet::Msg(message) => Ok((peer, message)),
                other => Err(FabricError::Protocol(format!(
                    "unexpected mid-stream packet {other:?}"
                ))),
            });
        let failed = item.is_err();
        if tx.send(item).is_err() || failed {
            return;
        }
    }
    debug!(peer, "fabric connection closed");
}

async fn read_packet(reader: &mut Reader) -> Result<Packet, FabricError> {
    let frame = reader.next().await.ok_or(FabricError::Closed)??;
    Ok(postcard::from_bytes(&frame)?)
}

async fn write_packet(writer: &mut Writer, packet: &Packet) -> Result<(), FabricError> {
    let bytes = postcard::to_stdvec(packet)?;
    writer.send(Bytes::from(bytes)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::WorkerStatus;

    #[test_log::test(tokio::test)]
    async fn test_rendezvous_and_peer_traffic() {
        let root = TcpRoot::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = root.local_addr();

        let w0 = tokio::spawn(async move {
            let mut fabric = TcpFabric::connect(addr).await.unwrap();
            // worker 0 → root, then worker 0 → worker 1
            fabric
                .send(
                    fabric.root(),
                    Message::Status(WorkerStatus {
                        paused: true,
                        sent: 1,
                        received: 0,
                        iterations: 7,
                    }),
                )
                .await
                .unwrap();
            let peer = 1 - fabric.rank();
            fabric
                .send(peer, Message::BarrierReady(42))
                .await
                .unwrap();
            let (src, msg) = fabric.recv().await.unwrap();
            assert_eq!(src, peer);
            assert!(matches!(msg, Message::BarrierReady(43)));
        });
        let w1 = tokio::spawn(async move {
            let mut fabric = TcpFabric::connect(addr).await.unwrap();
            fabric
                .send(
                    fabric.root(),
                    Message::Status(WorkerStatus {
                        paused: true,
                        sent: 1,
                        received: 0,
                        iterations: 7,
                    }),
                )
                .await
                .unwrap();
            let peer = 1 - fabric.rank();
            let (src, msg) = fabric.recv().await.unwrap();
            assert_eq!(src, peer);
            assert!(matches!(msg, Message::BarrierReady(42)));
            fabric
                .send(peer, Message::BarrierReady(43))
                .await
                .unwrap();
        });

        let mut root = root.accept_workers(2).await.unwrap();
        for _ in 0..2 {
            let (_, msg) = root.recv().await.unwrap();
            assert!(matches!(msg, Message::Status(_)));
        }
        w0.await.unwrap();
        w1.await.unwrap();
    }
}
