use anyhow::{Context, Result};
use sqlx::{Connection, PgConnection, PgPool, postgres::PgPoolOptions};
use testcontainers::{
    ContainerAsync, GenericImage, ImageExt,
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
};
use tokio::time::{Duration, sleep};

use crate::unique_name;

const POSTGRES_PORT: u16 = 5432;
const READY_ATTEMPTS: u32 = 20;

/// Shiftgate schema, applied to every fresh test database.
pub const SCHEMA_SQL: &str = include_str!("../../../db/sql/01_shiftgate.sql");

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    tag: String,
    user: String,
    password: String,
    db_name: String,
    max_connections: u32,
}

impl PostgresConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tag: "17".to_string(),
            user: "shiftgate".to_string(),
            password: "shiftgate".to_string(),
            db_name: "shiftgate".to_string(),
            max_connections: 10,
        }
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    #[must_use]
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// A running Postgres container with the schema applied and a pool ready.
///
/// The container is removed when this value is dropped, so keep it alive for
/// the whole test.
pub struct TestDatabase {
    _container: ContainerAsync<GenericImage>,
    dsn: String,
    pool: PgPool,
}

impl TestDatabase {
    /// Start Postgres, wait for it and apply [`SCHEMA_SQL`].
    ///
    /// # Errors
    /// Returns an error if no container runtime is reachable, the container
    /// fails to start, or the schema cannot be applied.
    pub async fn start() -> Result<Self> {
        Self::start_with_config(PostgresConfig::new()).await
    }

    /// # Errors
    /// See [`TestDatabase::start`].
    pub async fn start_with_config(config: PostgresConfig) -> Result<Self> {
        crate::runtime::ensure_container_runtime()?;

        let container = GenericImage::new("postgres", &config.tag)
            .with_exposed_port(POSTGRES_PORT.tcp())
            .with_wait_for(WaitFor::message_on_stdout(
                "database system is ready to accept connections",
            ))
            .with_env_var("POSTGRES_USER", &config.user)
            .with_env_var("POSTGRES_PASSWORD", &config.password)
            .with_env_var("POSTGRES_DB", &config.db_name)
            .with_container_name(unique_name("shiftgate-pg"))
            .start()
            .await
            .context("Failed to start Postgres container")?;
        let host_port = container
            .get_host_port_ipv4(POSTGRES_PORT.tcp())
            .await
            .context("Failed to resolve Postgres host port")?;

        let dsn = format!(
            "postgres://{}:{}@127.0.0.1:{host_port}/{}?sslmode=disable",
            config.user, config.password, config.db_name
        );
        wait_until_ready(&dsn).await?;
        apply_schema(&dsn).await?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&dsn)
            .await
            .context("Failed to connect test pool")?;

        Ok(Self {
            _container: container,
            dsn,
            pool,
        })
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[must_use]
    pub fn dsn(&self) -> &str {
        &self.dsn
    }
}

// The image logs "ready" once during init and again after the restart, so
// connect until it sticks.
async fn wait_until_ready(dsn: &str) -> Result<()> {
    let mut attempts = 0;
    loop {
        match PgConnection::connect(dsn).await {
            Ok(connection) => {
                drop(connection);
                return Ok(());
            }
            Err(err) => {
                attempts += 1;
                if attempts >= READY_ATTEMPTS {
                    return Err(err).context("Postgres did not become ready");
                }
                sleep(Duration::from_millis(250)).await;
            }
        }
    }
}

/// The schema has plpgsql bodies, so it goes through the simple query protocol in one call.
async fn apply_schema(dsn: &str) -> Result<()> {
    let mut connection = PgConnection::connect(dsn)
        .await
        .context("Failed to connect for schema setup")?;
    sqlx::raw_sql(SCHEMA_SQL)
        .execute(&mut connection)
        .await
        .context("Failed to apply schema")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postgres_config_defaults_are_expected() {
        let config = PostgresConfig::new();
        assert_eq!(config.tag, "17");
        assert_eq!(config.user, "shiftgate");
        assert_eq!(config.db_name, "shiftgate");
        assert_eq!(config.max_connections, 10);
    }

    #[test]
    fn postgres_config_overrides_fields() {
        let config = PostgresConfig::new()
            .with_tag("16")
            .with_max_connections(0);
        assert_eq!(config.tag, "16");
        assert_eq!(config.max_connections, 1);
    }

    #[test]
    fn schema_is_embedded() {
        assert!(SCHEMA_SQL.contains("CREATE TABLE IF NOT EXISTS face_profiles"));
        assert!(SCHEMA_SQL.contains("audit_entries_append_only"));
    }
}
