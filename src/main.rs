//! Courier - deploy application files over a realtime channel

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use courier::{
    auth::{Authenticator, HttpAuthBackend},
    config::Args,
    deploy::{Deployer, DirectorySource},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("courier={},info", log_level).into()),
        )
        .with(args.log_json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!args.log_json).then(tracing_subscriber::fmt::layer))
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let source = DirectorySource::new(&args.dir);
    let version = args.app_version.clone().unwrap_or_default();
    let manifest = source.build_manifest(&version, &args.files).await?;
    let request = args.deploy_request(manifest)?;

    info!(
        app_id = %request.app_id,
        env = %request.env,
        version = %version,
        files = request.manifest.files.len(),
        "Starting deploy"
    );

    let backend = HttpAuthBackend::new(args.request_timeout())?;
    let authenticator = Authenticator::new(Arc::new(backend), args.token_cache_path());
    let deployer = Deployer::new(
        Arc::new(authenticator),
        Arc::new(source),
        args.deploy_options(),
    );

    match deployer.deploy(&request).await {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(e) => {
            error!("Deploy failed: {}", e);
            std::process::exit(1);
        }
    }
}
