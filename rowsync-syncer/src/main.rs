use anyhow::Context;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use rowsync_core::ident::SchemaMap;
use rowsync_storage::postgres::{connect, PgCvrStore};
use rowsync_syncer::{
    replica::PgReplica,
    service::{ServicesBuilder, SyncerRegistry},
};
use std::{net::SocketAddr, sync::Arc};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let metrics_addr: SocketAddr = ([0, 0, 0, 0], args.metrics_port).into();
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .context("failed to install prometheus exporter")?;

    let cvr_pool = connect(&args.database_url)
        .await
        .context("failed to connect to the cvr database")?;
    let replica_pool = match &args.replica_url {
        Some(url) => connect(url)
            .await
            .context("failed to connect to the replica database")?,
        None => cvr_pool.clone(),
    };

    let mut schema = SchemaMap::new();
    for spec in &args.tables {
        let columns: Vec<&str> = spec
            .primary_key
            .iter()
            .map(String::as_str)
            .collect();
        schema = schema.with_table(&spec.table, &columns);
    }

    let task_id = args
        .task_id
        .clone()
        .unwrap_or_else(|| format!("syncer-{}", uuid::Uuid::new_v4()));
    info!(task_id, port = args.port, "starting syncer");

    let (mutation_log, row_source) = PgReplica::new(replica_pool).into_collaborators();
    let registry = Arc::new(SyncerRegistry::new(
        Arc::new(PgCvrStore::new(cvr_pool)),
        mutation_log,
        row_source,
        schema,
        &task_id,
    ));

    // Losing a CVR lease to a peer means this process must stop serving; a
    // supervisor restarts it and clients reconnect wherever the fleet routes
    // them next.
    let (fence_tx, mut fence_rx) = tokio::sync::mpsc::unbounded_channel();
    registry
        .on_ownership_lost(Arc::new(move |group| {
            let _ = fence_tx.send(group.clone());
        }))
        .await;

    let (server_handle, server_task) = ServicesBuilder::new(registry)
        .bind(&args.bind)
        .port(args.port)
        .prefix(&args.prefix)
        .run()?;

    tokio::select! {
        res = server_task => {
            res.context("server task panicked")??;
        }
        Some(group) = fence_rx.recv() => {
            tracing::error!(client_group = %group, "cvr ownership lost, terminating");
            server_handle.stop(true).await;
            std::process::exit(1);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            server_handle.stop(true).await;
        }
    }
    Ok(())
}
