//! # Portmap - Bounded-Pool TCP Port-Mapping Relay
//!
//! Portmap is a byte-transparent TCP relay: it listens on a local
//! endpoint, opens a matching connection to a fixed upstream for every
//! accepted client, and forwards bytes in both directions until either
//! side closes. It is built to hold a large number of simultaneous mapped
//! connections on a bounded number of OS threads:
//!
//! - **Dual thread pools**: a small acceptor pool dispatches accept
//!   completions; a separate executor pool runs all established-connection
//!   I/O. Both share one listening socket.
//! - **Per-connection pipelines**: each connection drives two independent
//!   read/write loops (client→server and server→client) that join through
//!   an atomic loop counter, so release happens exactly once, after both
//!   directions have quiesced.
//! - **Slab-allocated connections**: connection records are batch-allocated
//!   in jointly-owned slabs that are freed only when the last hosted
//!   connection finishes, and each direction's I/O continuation is backed
//!   by a recycled single-slot arena instead of the heap.
//! - **Startup DNS fail-over**: the upstream is resolved once; connects
//!   walk the resolved endpoint list in order.
//!
//! ## Module Overview
//!
//! | Module   | Purpose |
//! |----------|---------|
//! | `server` | Listener, thread pools, parallel accept loops |
//! | `conn`   | Per-connection state, fail-over connect, relay pipelines |
//! | `slab`   | Batch-allocated connection slots with joint ownership |
//! | `arena`  | Single-slot scratch allocator for I/O continuations |
//! | `shield` | Failure containment and located diagnostics for callbacks |

mod arena;
mod conn;
mod server;
pub mod shield;
mod slab;

pub use conn::{Connection, Direction, BUFFER_SIZE};
pub use server::{Server, ServerConfig, CONNECTIONS_PER_SLAB};
