mod cli;
mod controller;
mod diagnostics;
mod executor;
mod monitor;
mod orchestrator;
mod providers;
mod remediate;
mod server;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,steward_app=debug".to_string()),
        )
        .with_target(false)
        .compact()
        .init();

    cli::run().await
}
