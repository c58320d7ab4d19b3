use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_postgres::binary_copy::BinaryCopyInWriter;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, Config, NoTls};
use tracing::{debug, warn};

use super::{Store, TrafficRow};
use crate::config::DatabaseConfig;

const CREATE_TRAFFIC_SQL: &str = include_str!("sql/create_traffic.sql");

/// Column types for the binary COPY, in insert order.
const COPY_TYPES: &[Type] = &[
    Type::TIMESTAMPTZ,
    Type::FLOAT4,
    Type::TEXT,
    Type::BOOL,
    Type::INT8,
    Type::INT8,
];

/// PostgreSQL destination. Each window is streamed with binary COPY inside
/// a single transaction.
pub struct PostgresStore {
    cfg: DatabaseConfig,
    client: Option<Client>,
    driver: Option<JoinHandle<()>>,
}

impl PostgresStore {
    pub fn new(cfg: DatabaseConfig) -> Self {
        Self {
            cfg,
            client: None,
            driver: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client.as_ref().is_some_and(|c| !c.is_closed())
    }

    /// Connection parameters derived from the database section.
    pub fn pg_config(&self) -> Config {
        let mut pg = Config::new();
        pg.host(&self.cfg.host)
            .port(self.cfg.port)
            .dbname(&self.cfg.name)
            .user(&self.cfg.user)
            .connect_timeout(self.cfg.connect_timeout)
            .application_name(env!("CARGO_PKG_NAME"));
        if !self.cfg.pass.is_empty() {
            pg.password(&self.cfg.pass);
        }
        pg
    }

    pub fn schema_sql(&self) -> String {
        CREATE_TRAFFIC_SQL.replace("{table}", &self.cfg.table)
    }

    pub fn copy_sql(&self) -> String {
        format!(
            "COPY {} (time, bandwidth, iface, ingress, remote_asn, local_asn) FROM STDIN BINARY",
            self.cfg.table,
        )
    }

    fn client(&mut self) -> Result<&mut Client> {
        self.client
            .as_mut()
            .context("postgres store is not connected")
    }
}

impl Store for PostgresStore {
    async fn connect(&mut self) -> Result<()> {
        self.disconnect();

        let (client, connection) = self
            .pg_config()
            .connect(NoTls)
            .await
            .with_context(|| {
                format!(
                    "connecting to postgres at {}:{}/{}",
                    self.cfg.host, self.cfg.port, self.cfg.name
                )
            })?;

        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "postgres connection closed");
            }
        });

        if let Err(e) = client.simple_query("SELECT 1").await {
            driver.abort();
            return Err(e).context("pinging postgres");
        }

        debug!(host = %self.cfg.host, port = self.cfg.port, "postgres connection established");
        self.client = Some(client);
        self.driver = Some(driver);
        Ok(())
    }

    async fn ensure_schema(&mut self) -> Result<()> {
        let sql = self.schema_sql();
        let table = self.cfg.table.clone();
        self.client()?
            .batch_execute(&sql)
            .await
            .with_context(|| format!("creating table {table}"))
    }

    async fn write_window(&mut self, rows: &[TrafficRow]) -> Result<()> {
        let copy_sql = self.copy_sql();
        let client = self.client()?;

        let tx = client
            .transaction()
            .await
            .context("beginning transaction")?;
        let sink = tx
            .copy_in(copy_sql.as_str())
            .await
            .context("starting COPY")?;

        let mut writer = std::pin::pin!(BinaryCopyInWriter::new(sink, COPY_TYPES));
        for row in rows {
            let values: [&(dyn ToSql + Sync); 6] = [
                &row.time,
                &row.bandwidth,
                &row.iface,
                &row.ingress,
                &row.remote_asn,
                &row.local_asn,
            ];
            writer
                .as_mut()
                .write(&values)
                .await
                .context("streaming row")?;
        }
        writer.as_mut().finish().await.context("finishing COPY")?;

        // Dropping an uncommitted transaction rolls it back.
        tx.commit().await.context("committing transaction")?;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.client = None;
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

impl Drop for PostgresStore {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_postgres::config::Host;

    fn cfg() -> DatabaseConfig {
        DatabaseConfig {
            host: "db.internal".to_string(),
            port: 5433,
            name: "netflow".to_string(),
            user: "collector".to_string(),
            pass: "hunter2".to_string(),
            table: "traffic".to_string(),
            connect_timeout: Duration::from_secs(3),
            retry_interval: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_pg_config_from_settings() {
        let store = PostgresStore::new(cfg());
        let pg = store.pg_config();

        assert_eq!(pg.get_hosts(), &[Host::Tcp("db.internal".to_string())]);
        assert_eq!(pg.get_ports(), &[5433]);
        assert_eq!(pg.get_dbname(), Some("netflow"));
        assert_eq!(pg.get_user(), Some("collector"));
        assert_eq!(pg.get_password(), Some(&b"hunter2"[..]));
        assert_eq!(pg.get_connect_timeout(), Some(&Duration::from_secs(3)));
    }

    #[test]
    fn test_empty_password_not_sent() {
        let mut c = cfg();
        c.pass.clear();
        let pg = PostgresStore::new(c).pg_config();
        assert_eq!(pg.get_password(), None);
    }

    #[test]
    fn test_schema_sql_uses_table_name() {
        let mut c = cfg();
        c.table = "bandwidth_by_asn".to_string();
        let store = PostgresStore::new(c);

        let sql = store.schema_sql();
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS bandwidth_by_asn ("));
        assert!(sql.contains("time TIMESTAMPTZ NOT NULL"));
        assert!(sql.contains("bandwidth REAL NOT NULL"));
        assert!(sql.contains("PRIMARY KEY (id, time)"));
        assert!(!sql.contains("{table}"));

        assert_eq!(
            store.copy_sql(),
            "COPY bandwidth_by_asn (time, bandwidth, iface, ingress, remote_asn, local_asn) FROM STDIN BINARY"
        );
    }

    #[tokio::test]
    async fn test_write_without_connection_fails() {
        let mut store = PostgresStore::new(cfg());
        assert!(!store.is_connected());
        let err = store.write_window(&[]).await.unwrap_err();
        assert!(err.to_string().contains("not connected"));
        assert!(store.ensure_schema().await.is_err());
    }

    #[tokio::test]
    async fn test_connect_refused_is_error() {
        let mut c = cfg();
        c.host = "127.0.0.1".to_string();
        c.port = 1;
        c.connect_timeout = Duration::from_millis(500);
        let mut store = PostgresStore::new(c);

        let err = store.connect().await.unwrap_err();
        assert!(format!("{err:#}").contains("connecting to postgres at 127.0.0.1:1"));
        assert!(!store.is_connected());
    }
}
