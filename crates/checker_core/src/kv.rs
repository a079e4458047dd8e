//! Shared key-value store client.
//!
//! Wraps a single-node connection manager and a cluster connection behind one
//! handle so the engine can talk to either deployment through the same
//! `ConnectionLike` surface.

use redis::aio::{ConnectionLike, ConnectionManager};
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::{Cmd, Pipeline, RedisFuture, Value};
use tracing::info;

use crate::{CheckerError, Result};

/// Cloneable handle over a standalone or clustered store.
#[derive(Clone)]
pub enum KvClient {
    Single(ConnectionManager),
    Cluster(ClusterConnection),
}

impl KvClient {
    /// Connect to the addresses given as `host:port` strings. A single
    /// address yields a managed standalone connection; several addresses
    /// yield a cluster connection (where `db` is ignored).
    pub async fn connect(addrs: &[String], password: &str, db: i64) -> Result<Self> {
        if addrs.is_empty() {
            return Err(CheckerError::Config("no key-value store address".into()));
        }

        let auth = if password.is_empty() {
            String::new()
        } else {
            format!(":{password}@")
        };

        if addrs.len() == 1 {
            let url = format!("redis://{}{}/{}", auth, addrs[0], db);
            let client = redis::Client::open(url)?;
            let manager = ConnectionManager::new(client).await?;
            info!(addr = %addrs[0], db, "connected to key-value store");
            Ok(Self::Single(manager))
        } else {
            let urls: Vec<String> = addrs
                .iter()
                .map(|a| format!("redis://{auth}{a}"))
                .collect();
            let client = ClusterClient::new(urls)?;
            let conn = client.get_async_connection().await?;
            info!(nodes = addrs.len(), "connected to key-value store cluster");
            Ok(Self::Cluster(conn))
        }
    }
}

impl ConnectionLike for KvClient {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        match self {
            Self::Single(conn) => conn.req_packed_command(cmd),
            Self::Cluster(conn) => conn.req_packed_command(cmd),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        match self {
            Self::Single(conn) => conn.req_packed_commands(cmd, offset, count),
            Self::Cluster(conn) => conn.req_packed_commands(cmd, offset, count),
        }
    }

    fn get_db(&self) -> i64 {
        match self {
            Self::Single(conn) => conn.get_db(),
            Self::Cluster(conn) => conn.get_db(),
        }
    }
}
