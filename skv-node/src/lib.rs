//! # skv-node
//!
//! A small in-memory cache node speaking RESP. It backs the integration
//! tests of the cache crates and can run standalone through the `skv-node`
//! binary.
//!
//! [`spawn`] starts a node on an ephemeral loopback port in a background
//! thread and returns a [`NodeHandle`] that exposes the node's command log.

pub mod protocol;
pub mod server;
pub mod store;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use tokio::sync::oneshot;
use tracing::debug;

pub use store::{Store, DEFAULT_DATABASES};

/// Options for a spawned node.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub password: Option<String>,
    pub databases: usize,
}

impl Default for NodeOptions {
    fn default() -> Self {
        NodeOptions {
            password: None,
            databases: DEFAULT_DATABASES,
        }
    }
}

/// A running node. Dropping the handle stops accepting new connections.
pub struct NodeHandle {
    addr: SocketAddr,
    store: Arc<Store>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl NodeHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `host:port` form accepted by the client's address parser.
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Command names received so far, upper-cased, in arrival order.
    pub fn commands(&self) -> Vec<String> {
        self.store.commands()
    }

    /// How many times each command name was received.
    pub fn command_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for command in self.store.commands() {
            *counts.entry(command).or_insert(0) += 1;
        }
        counts
    }

    pub fn count(&self, command: &str) -> usize {
        let command = command.to_ascii_uppercase();
        self.store.commands().iter().filter(|seen| **seen == command).count()
    }

    pub fn clear_commands(&self) {
        self.store.clear_log();
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// Spawns a node with default options.
pub fn spawn() -> std::io::Result<NodeHandle> {
    spawn_with(NodeOptions::default())
}

/// Spawns a node on `127.0.0.1:0` served by a dedicated runtime thread.
pub fn spawn_with(options: NodeOptions) -> std::io::Result<NodeHandle> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;
    let store = Arc::new(Store::new(options.databases, options.password));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let served = Arc::clone(&store);

    thread::Builder::new().name(format!("skv-node-{}", addr.port())).spawn(move || {
        runtime.block_on(async move {
            let listener = match tokio::net::TcpListener::from_std(listener) {
                Ok(listener) => listener,
                Err(err) => {
                    debug!(error = %err, "failed to register listener");
                    return;
                }
            };
            tokio::select! {
                result = server::serve(listener, served) => {
                    if let Err(err) = result {
                        debug!(error = %err, "node stopped");
                    }
                }
                _ = shutdown_rx => debug!(%addr, "node shut down"),
            }
        });
    })?;

    debug!(%addr, "spawned node");
    Ok(NodeHandle {
        addr,
        store,
        shutdown: Some(shutdown_tx),
    })
}
