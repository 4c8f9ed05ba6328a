use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use gigwatch_bot::{DiscordGateway, InteractionState, InteractionVerifier};
use gigwatch_eval::{OpenAiClient, OpenAiEvaluator};
use gigwatch_scraper::HeadlessBrowser;
use gigwatch_sync::{Config, Pipeline};
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gigwatch")]
#[command(about = "Scrape freelance postings, score them and surface matches in Discord")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one scrape -> score -> announce cycle and exit.
    Run,
    /// Run the watch loop together with the operator interaction endpoint.
    Watch,
    /// Register the guild slash commands and exit.
    Register,
}

fn build_pipeline(config: &Config) -> Result<(Arc<Pipeline>, Arc<DiscordGateway>)> {
    let gateway = Arc::new(DiscordGateway::new(
        config.discord_bot_token.clone(),
        config.discord_application_id.clone(),
        config.discord_guild_id.clone(),
        config.discord_channel_id.clone(),
    )?);
    let evaluator = Arc::new(OpenAiEvaluator::new(
        OpenAiClient::new(config.openai_api_key.clone())?,
        config.scoring_model.clone(),
        config.letter_model.clone(),
    ));
    let pipeline = Arc::new(Pipeline::new(
        config,
        Arc::new(HeadlessBrowser),
        evaluator,
        gateway.clone(),
    ));
    Ok((pipeline, gateway))
}

async fn watch_forever(config: Config) -> Result<()> {
    let (pipeline, gateway) = build_pipeline(&config)?;
    gateway.register_commands().await?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let (event_tx, event_rx) = mpsc::channel(64);

    let state = InteractionState {
        verifier: Arc::new(InteractionVerifier::from_hex(&config.discord_public_key)?),
        events: event_tx,
    };
    let mut shutdown_rx = stop_rx.clone();
    let endpoint = tokio::spawn(gigwatch_bot::serve_interactions(
        config.bind_addr.clone(),
        state,
        async move {
            let _ = shutdown_rx.changed().await;
        },
    ));

    let events = tokio::spawn(gigwatch_sync::run_event_service(
        pipeline.clone(),
        event_rx,
        stop_rx.clone(),
    ));
    let looper = tokio::spawn(gigwatch_sync::watch(
        pipeline,
        config.watch_interval,
        stop_rx,
    ));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = stop_tx.send(true);

    let _ = looper.await;
    let _ = events.await;
    match endpoint.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(error = %err, "interaction endpoint failed"),
        Err(err) => error!(error = %err, "interaction endpoint panicked"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let (pipeline, _gateway) = build_pipeline(&config)?;
            let summary = pipeline.run_cycle().await?;
            println!(
                "cycle complete: run_id={} raw={} evaluated={} dispatched={}",
                summary.run_id, summary.raw_appended, summary.evaluated, summary.dispatched
            );
        }
        Commands::Watch => watch_forever(config).await?,
        Commands::Register => {
            let (_pipeline, gateway) = build_pipeline(&config)?;
            gateway.register_commands().await?;
            println!("operator commands registered");
        }
    }

    Ok(())
}
