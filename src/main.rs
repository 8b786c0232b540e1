use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use axum::{
    Router,
    extract::{ConnectInfo, Request},
    middleware,
    routing::any,
};
use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use notify::{RecursiveMode, Watcher};
use portcullis::{
    adapters::{BearerTokenAuthenticator, HttpClientAdapter, TracingSink},
    config::{loader::load_config, validation::GatewayConfigValidator},
    core::{Dispatcher, RouteTable},
    diagnostics,
    middleware::{create_recovery_middleware, request_id_middleware},
    ports::{auth::Authenticator, http_client::HttpClient, trace_sink::TraceSink},
    tracing_setup,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "config.yaml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Start the gateway server (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "config.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config),
        Some(Commands::Serve { config }) => serve(config).await,
        None => serve(args.config).await,
    }
}

async fn serve(config_path: String) -> Result<()> {
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {config_path}"))?;
    GatewayConfigValidator::validate(&config)
        .map_err(|e| eyre!("Invalid configuration: {e}"))?;

    tracing_setup::init_tracing(&config.logging)?;

    // The panic hook must be in place before the first request is served so
    // the recovery layer always has a stack to report.
    diagnostics::install_panic_capture();

    let table = RouteTable::from_config(&config).map_err(|e| eyre!(e))?;
    tracing::info!(
        endpoints = table.endpoint_count(),
        routes = table.route_count(),
        "route table built"
    );
    let table_holder = Arc::new(ArcSwap::from_pointee(table));

    let http_client: Arc<dyn HttpClient> =
        Arc::new(HttpClientAdapter::new().context("Failed to create HTTP client adapter")?);
    let authenticator: Arc<dyn Authenticator> = Arc::new(BearerTokenAuthenticator::new(
        config.auth.clone().unwrap_or_default(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        table_holder.clone(),
        http_client,
        authenticator,
    ));

    let sink: Option<Arc<dyn TraceSink>> = Some(Arc::new(TracingSink));

    let make_dispatch_route = |dispatcher: Arc<Dispatcher>| {
        any(
            move |ConnectInfo(client_addr): ConnectInfo<SocketAddr>, req: Request| {
                let dispatcher = dispatcher.clone();
                async move { dispatcher.dispatch(req, Some(client_addr.ip())).await }
            },
        )
    };

    let app = Router::new()
        .route("/{*path}", make_dispatch_route(dispatcher.clone()))
        .route("/", make_dispatch_route(dispatcher.clone()))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware))
        .layer(middleware::from_fn(create_recovery_middleware(sink)));

    // Keep the watcher handle alive for the lifetime of the server.
    let _watcher = spawn_config_watcher(config_path.clone(), table_holder.clone())?;

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .context("Failed to parse listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    tracing::info!("Portcullis gateway listening on {addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    tracing::info!("Graceful shutdown completed");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to install shutdown signal handler: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// Watch the configuration file and swap the route table atomically on
/// change. A reload that fails to parse, validate, or build keeps the old
/// table; requests already holding the previous table finish on it.
fn spawn_config_watcher(
    config_path: String,
    table_holder: Arc<ArcSwap<RouteTable>>,
) -> Result<notify::RecommendedWatcher> {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(16);

    let mut watcher =
        notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                if event.kind.is_modify() || event.kind.is_create() {
                    let _ = tx.blocking_send(());
                }
            }
            Err(e) => tracing::warn!("Config watch error: {e}"),
        })
        .context("Failed to create config watcher")?;
    watcher
        .watch(Path::new(&config_path), RecursiveMode::NonRecursive)
        .with_context(|| format!("Failed to watch {config_path}"))?;

    let debounce = Duration::from_secs(2);
    tokio::spawn(async move {
        tracing::info!("Config watcher task started.");
        let mut last_reload = tokio::time::Instant::now()
            .checked_sub(debounce)
            .unwrap_or_else(tokio::time::Instant::now);

        while rx.recv().await.is_some() {
            if last_reload.elapsed() < debounce {
                while rx.try_recv().is_ok() {}
                continue;
            }
            last_reload = tokio::time::Instant::now();

            tracing::info!("Attempting to reload configuration from {config_path}");
            match reload_table(&config_path) {
                Ok(new_table) => {
                    tracing::info!(
                        endpoints = new_table.endpoint_count(),
                        routes = new_table.route_count(),
                        "configuration reloaded"
                    );
                    table_holder.store(Arc::new(new_table));
                }
                Err(e) => {
                    tracing::error!("Failed to reload configuration: {e}. Keeping old configuration.");
                }
            }
            while rx.try_recv().is_ok() {}
        }
        tracing::info!("Config watcher task is shutting down.");
    });

    Ok(watcher)
}

fn reload_table(config_path: &str) -> Result<RouteTable> {
    let config = load_config(config_path)?;
    GatewayConfigValidator::validate(&config).map_err(|e| eyre!("{e}"))?;
    RouteTable::from_config(&config).map_err(|e| eyre!(e))
}

/// Validate configuration file and exit
fn validate_config_command(config_path: &str) -> Result<()> {
    println!("Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path) {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e}");
            std::process::exit(1);
        }
    };

    match GatewayConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr);
            println!("   • Endpoints: {}", config.endpoints.len());
            println!(
                "   • Routes: {}",
                config.endpoints.iter().map(|e| e.routes.len()).sum::<usize>()
            );
            println!(
                "   • Auth tokens: {}",
                config.auth.as_ref().map_or(0, |a| a.tokens.len())
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("Common fixes:");
            println!("   • Ensure endpoint addresses start with http:// or https://");
            println!("   • Verify listen address format (e.g., '127.0.0.1:3000')");
            println!("   • Ensure rate limit periods use valid units (s, m, h)");
            println!("   • Route paths must start with '/' and may only end in '/*'");
            std::process::exit(1);
        }
    }
}
