//! Per-connection relay engine.
//!
//! A [`Connection`] owns the accepted client socket, the upstream socket,
//! one fixed buffer and one [`HandlerArena`] per direction, and the atomic
//! loop counter that serializes shutdown. After the upstream connect
//! succeeds it runs two independent pipelines — client→server and
//! server→client — each a self-perpetuating read-then-write loop on the
//! owned halves of the two sockets. Either pipeline's termination routes
//! through [`Connection::shutdown`]; only the invocation that brings the
//! loop counter to zero releases the connection.
//!
//! The connection lives inside a slab slot (see [`crate::slab`]) and holds
//! a share to itself while running, so every scheduled continuation keeps
//! the slot — and with it the buffers and arenas — alive until both
//! pipelines have quiesced.

use std::cell::UnsafeCell;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context as _};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use crate::arena::{HandlerArena, TaskBox};
use crate::origin;
use crate::shield;
use crate::slab::SlabShare;

/// Size of each direction's relay buffer.
pub const BUFFER_SIZE: usize = 16 * 1024;

/// One relay direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::ClientToServer => "client->server",
            Direction::ServerToClient => "server->client",
        })
    }
}

/// One mapped connection: client socket, upstream socket, and the two
/// relay pipelines between them.
pub struct Connection {
    /// Executor pool that runs this connection's continuations.
    executors: Handle,
    /// Accepted inbound socket, held until the upstream connect succeeds.
    client_stream: Mutex<Option<TcpStream>>,
    /// Live pipelines plus the slab-share self-reference. Starts at 1 for
    /// the self-reference and reaches 2 once both pipelines are running.
    /// Signed so redundant shutdowns go negative instead of re-triggering
    /// the release.
    loop_count: AtomicIsize,
    /// Share to our own slab slot; cleared only by the final shutdown.
    self_share: Mutex<Option<SlabShare<Connection>>>,
    client_buffer: UnsafeCell<[u8; BUFFER_SIZE]>,
    server_buffer: UnsafeCell<[u8; BUFFER_SIZE]>,
    client_arena: HandlerArena,
    server_arena: HandlerArena,
    /// Remote address of the accepted client, for diagnostics.
    peer: SocketAddr,
}

// SAFETY: all fields are individually thread-safe except the two buffer
// cells, which are direction-partitioned: each is turned into a reference
// only by the single pipeline owning that direction, with at most one
// operation in flight. See `buffer`.
unsafe impl Send for Connection {}
unsafe impl Sync for Connection {}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, executors: Handle) -> Self {
        trace!(%peer, "connection constructed");
        Self {
            executors,
            client_stream: Mutex::new(Some(stream)),
            loop_count: AtomicIsize::new(1),
            self_share: Mutex::new(None),
            client_buffer: UnsafeCell::new([0; BUFFER_SIZE]),
            server_buffer: UnsafeCell::new([0; BUFFER_SIZE]),
            client_arena: HandlerArena::new(),
            server_arena: HandlerArena::new(),
            peer,
        }
    }

    /// Arena that backs this connection's accept/run continuation.
    pub(crate) fn server_arena(&self) -> &HandlerArena {
        &self.server_arena
    }

    /// Drives the whole connection: upstream connect with ordered
    /// fail-over, then both relay pipelines. The accept loop spawns this
    /// on the executor pool as a server-arena continuation; it spawns the
    /// client→server pipeline from the client arena and then continues
    /// inline as the server→client pipeline, so each arena carries exactly
    /// one continuation for the connection's lifetime.
    pub async fn run(share: SlabShare<Connection>, endpoints: Arc<[SocketAddr]>) {
        let mut split = None;
        shield::guard(origin!("connection::run"), async {
            *share.lock_self_share() = Some(share.clone());
            let client = share
                .lock_stream()
                .take()
                .context("client stream already consumed")?;
            let upstream = share.connect_upstream(&endpoints).await?;
            // No instruction below is ordered before this increment: the
            // pipelines must observe a fully initialized connection.
            share.loop_count.fetch_add(1, Ordering::Acquire);
            split = Some((client.into_split(), upstream.into_split()));
            Ok(())
        })
        .await;

        let Some(((client_rd, client_wr), (server_rd, server_wr))) = split else {
            // Endpoint list exhausted, or the connect body faulted.
            share.shutdown();
            return;
        };

        let forward = pipeline(
            share.clone(),
            Direction::ClientToServer,
            client_rd,
            server_wr,
        );
        // SAFETY: the share cloned into the box keeps the connection — and
        // with it the arena — alive for the box's whole lifetime.
        let task = unsafe { TaskBox::new(&share.client_arena, share.clone(), forward) };
        share.executors.spawn(task);

        pipeline(share, Direction::ServerToClient, server_rd, client_wr).await;
    }

    /// Tries each resolved endpoint in order; the first successful connect
    /// wins, per-endpoint failures are recovered locally.
    async fn connect_upstream(&self, endpoints: &[SocketAddr]) -> anyhow::Result<TcpStream> {
        for endpoint in endpoints {
            match TcpStream::connect(endpoint).await {
                Ok(stream) => {
                    debug!(peer = %self.peer, upstream = %endpoint, "upstream connected");
                    return Ok(stream);
                }
                Err(err) => {
                    warn!(
                        upstream = %endpoint,
                        error = %err,
                        "upstream connect failed; trying next endpoint"
                    );
                }
            }
        }
        Err(anyhow!(
            "upstream endpoint list exhausted ({} endpoints)",
            endpoints.len()
        ))
    }

    /// Joins the pipelines and the initial self-reference: every
    /// terminating party decrements once, and only the decrement that
    /// reaches zero performs the release. Extra invocations go negative
    /// and release nothing, so shutdown is idempotent.
    ///
    /// Must be called through a live share: the caller's own share keeps
    /// the connection alive while the stored self-reference is dropped.
    pub(crate) fn shutdown(&self) {
        shield::guard_sync(origin!("connection::shutdown"), || {
            if self.loop_count.fetch_sub(1, Ordering::AcqRel) == 1 {
                trace!(peer = %self.peer, "connection released");
                self.lock_stream().take();
                // The connection may be destroyed as soon as the caller's
                // share goes away; nothing below may touch `self`.
                self.lock_self_share().take();
            }
            Ok(())
        });
    }

    /// Raw pointer to one direction's buffer. Only the pipeline owning
    /// `direction` may turn this into a reference, and only while it holds
    /// a live share.
    fn buffer(&self, direction: Direction) -> *mut [u8; BUFFER_SIZE] {
        match direction {
            Direction::ClientToServer => self.client_buffer.get(),
            Direction::ServerToClient => self.server_buffer.get(),
        }
    }

    fn lock_stream(&self) -> MutexGuard<'_, Option<TcpStream>> {
        self.client_stream
            .lock()
            .unwrap_or_else(|err| err.into_inner())
    }

    fn lock_self_share(&self) -> MutexGuard<'_, Option<SlabShare<Connection>>> {
        self.self_share
            .lock()
            .unwrap_or_else(|err| err.into_inner())
    }

    #[cfg(test)]
    pub(crate) fn loops(&self) -> isize {
        self.loop_count.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn is_released(&self) -> bool {
        self.lock_self_share().is_none() && self.lock_stream().is_none()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        trace!(peer = %self.peer, "connection destructed");
    }
}

/// One direction of the relay: read into this direction's buffer, write
/// the bytes to the opposite socket, repeat until EOF or error.
///
/// Dropping the write half on the way out propagates the FIN to the
/// still-open peer, so a half-close on one side is forwarded to the other.
async fn pipeline(
    share: SlabShare<Connection>,
    direction: Direction,
    mut rd: OwnedReadHalf,
    mut wr: OwnedWriteHalf,
) {
    let origin = match direction {
        Direction::ClientToServer => origin!("connection::client_to_server"),
        Direction::ServerToClient => origin!("connection::server_to_client"),
    };
    let mut relayed: u64 = 0;
    shield::guard(origin, async {
        // SAFETY: each direction's buffer is touched by exactly one
        // pipeline, with at most one operation in flight; the share keeps
        // the backing slot alive.
        let buffer = unsafe { &mut *share.buffer(direction) };
        loop {
            let len = rd.read(&mut buffer[..]).await?;
            if len == 0 {
                debug!(%direction, relayed, "eof");
                return Ok(());
            }
            wr.write_all(&buffer[..len]).await?;
            relayed += len as u64;
        }
    })
    .await;
    trace!(%direction, relayed, "pipeline finished");
    share.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slab::SlabPool;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::sleep;

    /// Accepted stream + the external client end connected to it.
    async fn accepted_pair() -> (TcpStream, SocketAddr, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) =
            tokio::join!(TcpStream::connect(addr), listener.accept());
        let (accepted, peer) = accepted.unwrap();
        (accepted, peer, client.unwrap())
    }

    /// Port that refuses connections: bound, then immediately released.
    async fn refused_endpoint() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    async fn echo_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut rd, mut wr) = sock.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        addr
    }

    async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn endpoint_exhaustion_releases_the_connection() {
        let (accepted, peer, _client) = accepted_pair().await;
        let refused = vec![refused_endpoint().await, refused_endpoint().await];

        let mut pool = SlabPool::new(2);
        let share = pool.emplace(Connection::new(accepted, peer, Handle::current()));
        Connection::run(share.clone(), Arc::from(refused)).await;

        assert_eq!(share.loops(), 0);
        assert!(share.is_released());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failover_reaches_the_live_endpoint() {
        let (accepted, peer, mut client) = accepted_pair().await;
        let endpoints = vec![
            refused_endpoint().await,
            refused_endpoint().await,
            echo_upstream().await,
        ];

        let mut pool = SlabPool::new(2);
        let share = pool.emplace(Connection::new(accepted, peer, Handle::current()));
        tokio::spawn(Connection::run(share.clone(), Arc::from(endpoints)));

        client.write_all(b"failover").await.unwrap();
        let mut buf = [0u8; 8];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"failover");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn relay_round_trip_then_clean_release() {
        let (accepted, peer, mut client) = accepted_pair().await;
        let endpoints = vec![echo_upstream().await];

        let mut pool = SlabPool::new(2);
        let share = pool.emplace(Connection::new(accepted, peer, Handle::current()));
        let run = Connection::run(share.clone(), Arc::from(endpoints));
        // Spawn the way the accept loop does: run backed by the server
        // arena, so both arenas are observable below.
        // SAFETY: the cloned share keeps the connection alive for the box.
        let task = unsafe { TaskBox::new(share.server_arena(), share.clone(), run) };
        tokio::spawn(task);

        client.write_all(b"hello\n").await.unwrap();
        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello\n");

        // Both arenas carry exactly one in-flight continuation.
        assert!(share.client_arena.is_busy());
        assert!(share.server_arena.is_busy());

        drop(client);
        wait_until("connection release", || share.loops() == 0).await;
        assert!(share.is_released());
        wait_until("arena recycle", || {
            !share.client_arena.is_busy() && !share.server_arena.is_busy()
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_is_idempotent() {
        let (accepted, peer, _client) = accepted_pair().await;
        let mut pool = SlabPool::new(2);
        let share = pool.emplace(Connection::new(accepted, peer, Handle::current()));

        share.shutdown();
        assert_eq!(share.loops(), 0);
        assert!(share.is_released());

        // Redundant invocations go negative and never re-release.
        share.shutdown();
        share.shutdown();
        assert_eq!(share.loops(), -2);
        assert!(share.is_released());
    }
}
