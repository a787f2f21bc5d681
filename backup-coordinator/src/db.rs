//! Database connection pool for the coordinator.
//!
//! The pool holds N long-lived sessions against the coordinator node. Each
//! data-mover worker is pinned to one connection for the whole run, so the
//! pool never multiplexes a connection between workers.

use async_trait::async_trait;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, warn};

use crate::error::{CoordinatorError, Result};

/// Dispatch seam between the data mover and the database. The mover only ever
/// needs "run this COPY on connection i and tell me the row count".
#[async_trait]
pub trait CopyDispatch: Send + Sync {
    async fn execute(&self, conn_num: usize, query: &str) -> Result<u64>;
    fn num_conns(&self) -> usize;
}

pub struct ConnectionPool {
    clients: Vec<Client>,
    app_name: String,
}

impl ConnectionPool {
    /// Open `num_conns` sessions using the given connection string. Every
    /// session sets the same application name so hung COPY sessions can be
    /// found and terminated fleet-side.
    pub async fn connect(conninfo: &str, num_conns: usize, app_name: &str) -> Result<Self> {
        if num_conns == 0 {
            return Err(CoordinatorError::Config(
                "connection pool requires at least one connection".to_string(),
            ));
        }
        let mut config: tokio_postgres::Config = conninfo
            .parse()
            .map_err(|e| CoordinatorError::Config(format!("invalid connection string: {e}")))?;
        config.application_name(app_name);

        let mut clients = Vec::with_capacity(num_conns);
        for conn_num in 0..num_conns {
            let (client, connection) = config.connect(NoTls).await?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    warn!("connection {conn_num} closed with error: {e}");
                }
            });
            clients.push(client);
        }
        debug!("opened {num_conns} coordinator connections");
        Ok(ConnectionPool {
            clients,
            app_name: app_name.to_string(),
        })
    }

    pub fn client(&self, conn_num: usize) -> &Client {
        &self.clients[conn_num]
    }

    /// Run a batch of SQL statements on one connection.
    pub async fn batch_execute(&self, conn_num: usize, sql: &str) -> Result<()> {
        self.clients[conn_num].batch_execute(sql).await?;
        Ok(())
    }

    /// Terminate COPY sessions belonging to this run that are still executing.
    ///
    /// Workers only observe cancellation at task boundaries; a COPY already
    /// in flight blocks inside the database until this out-of-band step kills
    /// its session on the fleet.
    pub async fn terminate_hanging_copy_sessions(&self) -> Result<()> {
        let query = "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
                     WHERE application_name = $1 AND query LIKE 'COPY %' \
                     AND pid <> pg_backend_pid()";
        let rows = self.clients[0].query(query, &[&self.app_name]).await?;
        if !rows.is_empty() {
            warn!("terminated {} hanging COPY sessions", rows.len());
        }
        Ok(())
    }
}

#[async_trait]
impl CopyDispatch for ConnectionPool {
    async fn execute(&self, conn_num: usize, query: &str) -> Result<u64> {
        Ok(self.clients[conn_num].execute(query, &[]).await?)
    }

    fn num_conns(&self) -> usize {
        self.clients.len()
    }
}
