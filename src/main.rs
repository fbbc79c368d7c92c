use clap::Parser;
use std::net::SocketAddr;
use tokio::net::TcpListener;

use presence_server::auth::admin::{generate_admin_secret, AdminSecret};
use presence_server::auth::session;
use presence_server::config::{generate_config_template, Cli, Config};
use presence_server::routes;
use presence_server::state::AppState;
use presence_server::store;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Handle --generate-config: print template and exit
    if cli.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load(&cli)?;

    // Initialize tracing/logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("presence_server=info"));
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(env_filter).init();
    }

    // Load or generate the session signing key (256-bit random, stored in data_dir)
    let session_secret = session::load_or_generate_session_secret(&config.data_dir)?;

    // Handle --issue-token: print a session token and exit
    if let Some(identity) = &cli.issue_token {
        let token = session::issue_session_token(&session_secret, identity, config.session_ttl_secs)?;
        println!("{}", token);
        return Ok(());
    }

    tracing::info!(
        "Presence server v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let admin_secret = if config.admin_secret.is_empty() {
        let generated = generate_admin_secret();
        tracing::info!("==========================================================");
        tracing::info!("  No admin_secret configured. Generated one for this run:");
        tracing::info!("  {}", generated);
        tracing::info!("==========================================================");
        generated
    } else {
        config.admin_secret.clone()
    };

    let identity_store = store::open_store(config.store, &config.data_dir)?;
    tracing::info!(backend = ?config.store, "Identity store ready");

    let app_state = AppState::new(
        identity_store,
        session_secret,
        AdminSecret::new(&admin_secret),
    );

    let app = routes::build_router(app_state);

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
