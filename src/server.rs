//! Acceptor/Server: the listening socket, the two worker pools, and the
//! parallel accept loops.
//!
//! The server owns two OS thread pools realized as tokio runtimes: a small
//! acceptor pool that only dispatches accept completions, and an executor
//! pool that runs connect, read, and write work for established
//! connections. All accept loops share one listening socket; each loop
//! owns its own slab cursor, so a freshly accepted connection is placed
//! into that loop's current slab slot and handed to the executor pool.
//!
//! The upstream is resolved exactly once at startup; the resolved,
//! ordered endpoint sequence is shared immutably by every connection and
//! walked in order on connect (startup DNS fail-over).

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use anyhow::{bail, ensure, Context as _};
use tokio::net::{TcpListener, TcpSocket};
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, info};

use crate::arena::TaskBox;
use crate::conn::Connection;
use crate::origin;
use crate::shield;
use crate::slab::SlabPool;

/// Connection slots per slab block. A block is released once the last
/// connection it hosted has shut down, so larger blocks amortize
/// allocation at the cost of a longer tail until release.
pub const CONNECTIONS_PER_SLAB: usize = 8;

/// Listen backlog for the local endpoint.
const LISTEN_BACKLOG: u32 = 1024;

/// Effective relay configuration, mirroring the CLI surface.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Upstream hostname or IP address.
    pub remote_address: String,
    /// Upstream port.
    pub remote_port: u16,
    /// Local interface address; empty means all interfaces.
    pub local_address: String,
    /// Local port to listen on.
    pub local_port: u16,
    /// Worker threads in the acceptor pool (and parallel accept loops).
    pub acceptor_threads: usize,
    /// Worker threads in the executor pool.
    pub executor_threads: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            remote_address: "google.com".to_string(),
            remote_port: 80,
            local_address: "0.0.0.0".to_string(),
            local_port: 10001,
            acceptor_threads: 2,
            executor_threads: num_cpus::get(),
        }
    }
}

/// A running relay: listener bound, both pools live, accept loops armed.
pub struct Server {
    acceptors: Option<Runtime>,
    executors: Option<Runtime>,
    local_addr: SocketAddr,
}

impl Server {
    /// Resolves the upstream, binds the local endpoint with address reuse,
    /// and starts both pools. Resolution and bind failures are startup
    /// errors and abort construction.
    pub fn start(config: &ServerConfig) -> anyhow::Result<Self> {
        let endpoints = resolve_upstream(&config.remote_address, config.remote_port)?;
        Self::start_resolved(config, endpoints)
    }

    /// Like [`start`](Self::start), but with an already-resolved endpoint
    /// sequence. This is also the seam fail-over tests use in place of a
    /// live resolver.
    pub fn start_resolved(
        config: &ServerConfig,
        endpoints: Arc<[SocketAddr]>,
    ) -> anyhow::Result<Self> {
        ensure!(!endpoints.is_empty(), "endpoint sequence is empty");
        ensure!(config.acceptor_threads > 0, "acceptor pool needs a thread");
        ensure!(config.executor_threads > 0, "executor pool needs a thread");

        let acceptors = Builder::new_multi_thread()
            .worker_threads(config.acceptor_threads)
            .thread_name("portmap-acceptor")
            .enable_all()
            .build()
            .context("building acceptor pool")?;
        let executors = Builder::new_multi_thread()
            .worker_threads(config.executor_threads)
            .thread_name("portmap-executor")
            .enable_all()
            .build()
            .context("building executor pool")?;

        let bind_addr = local_endpoint(&config.local_address, config.local_port)?;
        let listener = {
            // Register the listener with the acceptor pool's reactor.
            let _guard = acceptors.enter();
            bind_listener(bind_addr)?
        };
        let local_addr = listener.local_addr().context("reading bound address")?;
        info!(
            listen = %local_addr,
            endpoints = endpoints.len(),
            acceptors = config.acceptor_threads,
            executors = config.executor_threads,
            "relay listening"
        );

        let listener = Arc::new(listener);
        for id in 0..config.acceptor_threads {
            acceptors.spawn(accept_loop(
                id,
                listener.clone(),
                executors.handle().clone(),
                endpoints.clone(),
            ));
        }

        Ok(Self {
            acceptors: Some(acceptors),
            executors: Some(executors),
            local_addr,
        })
    }

    /// Address the listener actually bound (port 0 resolves here).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Parks the calling thread until Ctrl-C, then shuts down.
    pub fn run_until_interrupted(mut self) -> anyhow::Result<()> {
        let acceptors = self.acceptors.take().context("server already stopped")?;
        acceptors.block_on(async {
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")
        })?;
        info!("received shutdown signal, exiting");
        acceptors.shutdown_background();
        self.stop();
        Ok(())
    }

    /// Stops both pools. Pending operations are cancelled; no new work is
    /// accepted afterwards.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(pool) = self.acceptors.take() {
            pool.shutdown_background();
        }
        if let Some(pool) = self.executors.take() {
            pool.shutdown_background();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Resolves the upstream exactly once, at startup. The returned order is
/// the fail-over order.
fn resolve_upstream(host: &str, port: u16) -> anyhow::Result<Arc<[SocketAddr]>> {
    let endpoints: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolving upstream {host}:{port}"))?
        .collect();
    if endpoints.is_empty() {
        bail!("no endpoints resolved for {host}:{port}");
    }
    for (index, endpoint) in endpoints.iter().enumerate() {
        info!(index, %endpoint, "resolved upstream endpoint");
    }
    Ok(Arc::from(endpoints))
}

fn local_endpoint(address: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let ip = if address.is_empty() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        address
            .parse()
            .with_context(|| format!("invalid local address {address:?}"))?
    };
    Ok(SocketAddr::new(ip, port))
}

/// Binds and listens with `SO_REUSEADDR`, the relay's one wire-affecting
/// socket option.
fn bind_listener(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .context("creating listening socket")?;
    socket.set_reuseaddr(true).context("setting SO_REUSEADDR")?;
    socket
        .bind(addr)
        .with_context(|| format!("binding {addr}"))?;
    socket
        .listen(LISTEN_BACKLOG)
        .with_context(|| format!("listening on {addr}"))
}

/// One parallel accept loop. The listening socket is shared between the
/// loops; concurrent accepts on it are the runtime's responsibility. Each
/// loop owns its own slab cursor.
///
/// On an accept error the loop terminates without re-arming: in practice
/// the error is server teardown, and a terminated loop simply drains.
async fn accept_loop(
    id: usize,
    listener: Arc<TcpListener>,
    executors: Handle,
    endpoints: Arc<[SocketAddr]>,
) {
    let mut pool = SlabPool::new(CONNECTIONS_PER_SLAB);
    loop {
        let accepted = listener.accept().await;
        let ok = shield::guard(origin!("server::handle_accept"), async {
            let (stream, peer) = accepted.context("accept")?;
            debug!(loop_id = id, %peer, "accepted connection");

            let share = pool.emplace(Connection::new(stream, peer, executors.clone()));
            let run = Connection::run(share.clone(), endpoints.clone());
            // SAFETY: the share cloned into the box keeps the connection —
            // and with it its server arena — alive for the box's lifetime.
            let task = unsafe { TaskBox::new(share.server_arena(), share.clone(), run) };
            executors.spawn(task);
            Ok(())
        })
        .await;
        if !ok {
            debug!(loop_id = id, "accept loop terminated");
            return;
        }
    }
}
