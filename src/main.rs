use reply_server::config::Config;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,reply_server=debug".into()),
        )
        .init();

    let config = Config::from_env();
    if let Err(err) = reply_server::run(config).await {
        tracing::error!(error = %err, "server exited with error");
        std::process::exit(1);
    }
}
