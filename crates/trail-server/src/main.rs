mod error;
mod handlers;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::middleware;
use axum::routing::{delete, get, post, put};
use axum::Router;
use clap::Parser;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::handlers::*;
use crate::state::{
    backend_name, close_trail, create_default_config, default_config_template, load_config,
    open_trail, spawn_background_jobs, AppState,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[arg(long, default_value = "system.toml")]
    config: PathBuf,
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,
    /// Print the default config and exit.
    #[arg(long)]
    dump_config: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    if args.dump_config {
        print!("{}", default_config_template());
        return Ok(());
    }
    if !args.config.exists() {
        warn!("config file missing, creating default config");
        if let Err(err) = create_default_config(&args.config) {
            warn!(path = %args.config.display(), error = %err, "could not write default config");
        }
    }

    let (raw, config) = load_config(&args.config)?;
    let (backend_kind, trail) = open_trail(config.clone()).await?;
    info!(backend = backend_name(&backend_kind), "changelog backend ready");
    let trail = Arc::new(trail);
    let state = Arc::new(AppState::new(
        args.config.clone(),
        raw,
        config,
        backend_kind,
        trail.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let jobs = spawn_background_jobs(&trail, shutdown_rx);

    let read_routes = Router::new()
        .route("/health", get(health))
        .route("/history/:entity/:row_id", get(get_history))
        .route("/state/:entity/:row_id", get(get_state_at))
        .route("/actors/:actor_id/activity", get(get_actor_activity))
        .route("/tenants/:tenant_id/activity", get(get_tenant_activity))
        .route("/transactions/:transaction_id", get(get_transaction))
        .route("/summary", get(get_change_summary))
        .route("/alerts/active", get(get_active_alerts))
        .route("/queue/depth", get(get_queue_depth));

    let admin_routes = Router::new()
        .route("/capture", get(list_captured))
        .route("/capture/:entity", put(enable_capture).delete(disable_capture))
        .route("/exclusions", get(list_exclusions).post(add_exclusion))
        .route("/exclusions/:entity/:field", delete(remove_exclusion))
        .route("/partitions", get(list_partitions).post(create_partition))
        .route("/partitions/archive", post(archive_partitions))
        .route("/partitions/maintenance", post(run_partition_maintenance))
        .route("/partitions/:name/archived", get(read_archived))
        .route("/alert-rules", get(list_alert_rules).post(register_alert_rule))
        .route("/alert-rules/:name/enabled", put(set_alert_rule_enabled))
        .route("/alerts/evaluate", post(evaluate_alerts))
        .route("/alerts/:event_id/acknowledge", post(acknowledge_alert))
        .route("/system-config", get(get_system_config).put(update_system_config_handler))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth));

    let app = Router::new()
        .nest("/api", read_routes)
        .nest("/api/admin", admin_routes)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("trail-server listening on {}", args.listen);
    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "ctrl-c handler failed, shutting down");
            }
        })
        .await?;

    info!("shutting down background jobs");
    if shutdown_tx.send(true).is_err() {
        debug!("background jobs already stopped");
    }
    for job in jobs {
        if let Err(err) = job.await {
            warn!(error = %err, "background job ended abnormally");
        }
    }
    close_trail(trail).await;
    Ok(())
}
