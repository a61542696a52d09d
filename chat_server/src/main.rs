use anyhow::Result;
use chat_server::{api, auth, config};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = config::Cli::parse();
    let cfg = config::Config::load(&cli)?;
    let fallback = if cfg.logging_enabled { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Some(config::Command::MintToken {
            user_id,
            name,
            hours,
        }) => {
            let token = auth::issue_jwt(
                cfg.jwt_secret.expose().as_bytes(),
                &user_id,
                name.as_deref(),
                time::Duration::hours(hours),
            )?;
            if cfg.jwt_secret_generated {
                tracing::warn!("no jwt secret configured; this token only works with the same secret");
            }
            println!("{token}");
            Ok(())
        }
        None => api::run_http_server(cfg).await,
    }
}
