//! eb - event bus command line
//!
//! Publish events, inspect history and groups, and run a consumer.

use std::fs;
use std::sync::Arc;

use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use logstore::StartPosition;
use serde_json::Value;
use tracing::{debug, info, warn};

use eventbus::cli::{Cli, Command, GroupCommand, OutputFormat, get_log_path};
use eventbus::config::Config;
use eventbus::consumer::{EventHandler, consumer_name};
use eventbus::{Broker, Event};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level).map(|s| s.to_uppercase()) {
        Some(s) => match s.as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .context("Failed to open log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let broker = Broker::open(&config).context("Failed to open event store")?;

    debug!(command = ?cli.command, "main: dispatching command");
    let result = match cli.command {
        Command::Publish {
            source,
            event_type,
            payload,
            correlation_id,
        } => cmd_publish(&broker, &source, &event_type, payload.as_deref(), correlation_id.as_deref()).await,
        Command::History { limit, format } => cmd_history(&broker, limit, format).await,
        Command::Groups => cmd_groups(&broker).await,
        Command::Group {
            command: GroupCommand::Create { name, from_start },
        } => cmd_group_create(&broker, &name, from_start).await,
        Command::Pending { group, limit } => cmd_pending(&broker, &group, limit).await,
        Command::Consume { group, consumer } => cmd_consume(&broker, &group, consumer).await,
    };

    let closed = broker.close().await.context("Failed to close event store");
    result.and(closed.map(|_| ()))
}

async fn cmd_publish(
    broker: &Broker,
    source: &str,
    event_type: &str,
    payload: Option<&str>,
    correlation_id: Option<&str>,
) -> Result<()> {
    debug!(%source, %event_type, "cmd_publish: called");
    let payload: Value = match payload {
        Some(raw) => serde_json::from_str(raw).context("--payload must be valid JSON")?,
        None => Value::Object(Default::default()),
    };
    let event_id = broker
        .publish(source, event_type, &payload, correlation_id)
        .await
        .context("Failed to publish event")?;
    println!("{} Published {}", "✓".green(), event_id.cyan());
    Ok(())
}

async fn cmd_history(broker: &Broker, limit: usize, format: OutputFormat) -> Result<()> {
    debug!(limit, ?format, "cmd_history: called");
    let events = broker.history(limit).await.context("Failed to read history")?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&events)?),
        OutputFormat::Text => {
            if events.is_empty() {
                println!("No events found");
            }
            for event in &events {
                print_event(event);
            }
        }
    }
    Ok(())
}

async fn cmd_groups(broker: &Broker) -> Result<()> {
    debug!("cmd_groups: called");
    let groups = broker.groups().await.context("Failed to list groups")?;
    if groups.is_empty() {
        println!("No consumer groups");
        return Ok(());
    }
    println!(
        "{:<28} {:<24} {:>8} {:>10}",
        "GROUP".bold(),
        "LAST DELIVERED".bold(),
        "PENDING".bold(),
        "CONSUMERS".bold()
    );
    for group in groups {
        let pending = if group.pending > 0 {
            group.pending.to_string().yellow()
        } else {
            group.pending.to_string().normal()
        };
        println!(
            "{:<28} {:<24} {:>8} {:>10}",
            group.name.cyan(),
            group.last_delivered.to_string(),
            pending,
            group.consumers
        );
    }
    Ok(())
}

async fn cmd_group_create(broker: &Broker, name: &str, from_start: bool) -> Result<()> {
    debug!(%name, from_start, "cmd_group_create: called");
    let start = if from_start {
        StartPosition::Beginning
    } else {
        StartPosition::Latest
    };
    broker
        .ensure_group_at(name, start)
        .await
        .context(format!("Failed to create group {}", name))?;
    println!("{} Group ready: {}", "✓".green(), name.cyan());
    Ok(())
}

async fn cmd_pending(broker: &Broker, group: &str, limit: usize) -> Result<()> {
    debug!(%group, limit, "cmd_pending: called");
    let summary = broker
        .pending(group)
        .await
        .context(format!("Failed to read pending entries for {}", group))?;
    println!("Group: {}", group.cyan());
    println!("  Pending: {}", summary.count);
    if let (Some(min), Some(max)) = (summary.min, summary.max) {
        println!("  Range: {} .. {}", min, max);
    }
    for (consumer, count) in &summary.consumers {
        println!("  {} {}", consumer.yellow(), count);
    }

    let entries = broker.pending_entries(group, limit).await?;
    if !entries.is_empty() {
        println!();
        println!(
            "{:<24} {:<40} {:>10} {:>10}",
            "ENTRY".bold(),
            "CONSUMER".bold(),
            "IDLE MS".bold(),
            "DELIVERIES".bold()
        );
        for entry in entries {
            println!(
                "{:<24} {:<40} {:>10} {:>10}",
                entry.id.to_string(),
                entry.consumer,
                entry.idle.as_millis(),
                entry.delivery_count
            );
        }
    }
    Ok(())
}

async fn cmd_consume(broker: &Broker, group: &str, consumer: Option<String>) -> Result<()> {
    debug!(%group, ?consumer, "cmd_consume: called");
    let consumer = consumer.unwrap_or_else(|| consumer_name(group));
    let handler: Arc<dyn EventHandler> = Arc::new(|event: Event| async move {
        print_event(&event);
        Ok::<(), eyre::Report>(())
    });

    let subscription = broker
        .subscribe_as(group, &consumer, handler)
        .await
        .context(format!("Failed to subscribe to {}", group))?;
    println!(
        "{} Consuming {} as {} (Ctrl+C to stop)",
        "▶".green(),
        group.cyan(),
        consumer.yellow()
    );

    wait_for_shutdown_signal().await?;
    info!("Shutting down consumer");

    let stats = subscription.stop().await.context("Consumer loop failed")?;
    println!(
        "{} Stopped: {} delivered, {} acked, {} failed, {} dead-lettered",
        "■".yellow(),
        stats.delivered,
        stats.acked,
        stats.failed,
        stats.dead_lettered
    );
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigint.recv() => warn!("SIGINT received"),
            _ = sigterm.recv() => warn!("SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        warn!("Ctrl+C received");
    }

    Ok(())
}

fn print_event(event: &Event) {
    let correlation = event
        .correlation()
        .map(|c| format!(" corr={}", c))
        .unwrap_or_default();
    println!(
        "{} {} {} {}{}",
        event.timestamp.dimmed(),
        event.event_type.green(),
        event.source.cyan(),
        event.event_id,
        correlation.dimmed()
    );
    println!("    {}", event.payload);
}
