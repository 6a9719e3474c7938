use super::super::SHARED_RUNTIME;
use crate::error::PgPollError;

use postgresql_embedded::PostgreSQL;

/// A running embedded `PostgreSQL` instance.
pub struct EmbeddedPostgres {
    pub postgresql: PostgreSQL,
    pub port: u16,
    /// key=value connection string accepted by `DriverConfig::conninfo`
    pub conninfo: String,
}

impl std::fmt::Debug for EmbeddedPostgres {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedPostgres")
            .field("port", &self.port)
            .field("conninfo", &self.conninfo)
            .finish_non_exhaustive()
    }
}

/// Set up an embedded `PostgreSQL` instance with a fresh database `db_name`.
///
/// # Errors
/// Returns an error if the embedded server cannot be set up or started, if
/// the database cannot be created, or if the post-start connectivity check
/// fails.
pub fn setup_postgres_embedded(
    db_name: &str,
) -> Result<EmbeddedPostgres, Box<dyn std::error::Error>> {
    SHARED_RUNTIME.block_on(async {
        let mut postgresql = PostgreSQL::default();

        // bundled binaries, nothing to download
        postgresql.setup().await?;
        postgresql.start().await?;

        let settings = postgresql.settings();
        let port = settings.port;
        let conninfo = format!(
            "host={} port={} user={} password={} dbname={}",
            settings.host, port, settings.username, settings.password, db_name
        );

        postgresql.create_database(db_name).await?;

        check_connectivity(&conninfo).await?;

        tracing::info!(port, "embedded postgres started");

        Ok(EmbeddedPostgres {
            postgresql,
            port,
            conninfo,
        })
    })
}

async fn check_connectivity(conninfo: &str) -> Result<(), PgPollError> {
    let (client, connection) = tokio_postgres::connect(conninfo, tokio_postgres::NoTls).await?;
    let io = tokio::spawn(connection);
    client.simple_query("SELECT 1").await?;
    drop(client);
    let _ = io.await;
    Ok(())
}

/// Stop a previously started embedded `PostgreSQL` instance.
pub fn stop_postgres_embedded(postgres: EmbeddedPostgres) {
    let EmbeddedPostgres { postgresql, .. } = postgres;
    SHARED_RUNTIME.block_on(async move {
        let _ = postgresql.stop().await;
    });
}
