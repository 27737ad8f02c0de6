//! CLI command implementations
//!
//! Watch commands connect, subscribe, and print every observed event as a
//! JSON line until interrupted or until the server closes the connection.
//! Every command loads and validates configuration first.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::observability::{log_event_with_fields, Event, Logger};
use crate::realtime::{
    CallbackResult, ChangeFilter, ChannelKey, EmptySnapshotStore, PresenceMeta, Realtime,
    RealtimeConfig, WebSocketTransport,
};

use super::args::{Command, Common};
use super::errors::{CliError, CliResult};
use super::io::{read_payload, write_event, write_response};

/// Time given to the writer task to flush queued frames before exit
const FLUSH_GRACE: Duration = Duration::from_millis(200);

/// Main CLI entry point
///
/// Parses arguments and dispatches to the appropriate command.
/// This is the only function that main.rs should call.
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();
    run_command(cli.command)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::WatchEntity {
            common,
            entity,
            filter,
        } => watch_entity(&common, &entity, filter.as_deref()),
        Command::WatchPresence { common, room, name } => {
            watch_presence(&common, &room, name.as_deref())
        }
        Command::WatchBroadcast { common, topic } => watch_broadcast(&common, &topic),
        Command::Send {
            common,
            topic,
            event,
            payload,
        } => send(&common, &topic, &event, payload.as_deref()),
        Command::CheckConfig { common } => check_config(&common),
    }
}

/// Load, override and validate configuration; applies the log level
pub fn load_config(common: &Common) -> CliResult<RealtimeConfig> {
    let mut config = match &common.config {
        Some(path) => RealtimeConfig::load(path)?,
        None => RealtimeConfig::default(),
    };
    if let Some(url) = &common.url {
        config.websocket.url = url.clone();
    }
    config.validate()?;

    Logger::set_min_severity(config.severity()?);
    let source = common
        .config
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "defaults".to_string());
    log_event_with_fields(Event::ConfigLoaded, &[("source", &source)]);

    Ok(config)
}

/// Validate configuration and print the effective values
pub fn check_config(common: &Common) -> CliResult<()> {
    let config = load_config(common)?;
    write_response(serde_json::to_value(&config)?)
}

/// Print row changes of `entity`
pub fn watch_entity(common: &Common, entity: &str, filter: Option<&str>) -> CliResult<()> {
    let filter = filter
        .map(ChangeFilter::parse)
        .transpose()
        .map_err(|e| CliError::invalid_argument(e.to_string()))?;
    let key = ChannelKey::entity(entity, filter.as_ref())
        .map_err(|e| CliError::invalid_argument(e.to_string()))?;
    let config = load_config(common)?;

    runtime()?.block_on(async {
        let (realtime, pump) = start_session(config).await?;

        let channel = key.to_string();
        let subscription = realtime
            .subscribe_to_entity(entity, filter, move |change| {
                write_event(&channel, change)?;
                Ok(())
            })
            .await?;

        if let Some(records) = realtime.records(&key) {
            write_response(json!({
                "channel": key,
                "records": records,
                "degraded": subscription.is_degraded(),
            }))?;
        }

        wait_for_exit(&realtime, pump).await
    })
}

/// Print presence changes of `room`, optionally tracking own presence
pub fn watch_presence(common: &Common, room: &str, name: Option<&str>) -> CliResult<()> {
    let key = ChannelKey::presence(room).map_err(|e| CliError::invalid_argument(e.to_string()))?;
    let config = load_config(common)?;

    runtime()?.block_on(async {
        let (realtime, pump) = start_session(config).await?;

        let join_channel = key.to_string();
        let leave_channel = key.to_string();
        let on_join = move |participant: &str, meta: &PresenceMeta| -> CallbackResult {
            write_event(
                &join_channel,
                &json!({"event": "join", "key": participant, "meta": meta}),
            )?;
            Ok(())
        };
        let on_leave = move |participant: &str, meta: Option<&PresenceMeta>| -> CallbackResult {
            write_event(
                &leave_channel,
                &json!({"event": "leave", "key": participant, "meta": meta}),
            )?;
            Ok(())
        };

        let _subscription = match name {
            Some(name) => {
                realtime
                    .subscribe_to_presence(room, PresenceMeta::new(name), on_join, on_leave)
                    .await?
            }
            None => realtime.watch_presence(room, on_join, on_leave).await?,
        };

        wait_for_exit(&realtime, pump).await
    })
}

/// Print messages broadcast on `topic`
pub fn watch_broadcast(common: &Common, topic: &str) -> CliResult<()> {
    let key = ChannelKey::broadcast(topic).map_err(|e| CliError::invalid_argument(e.to_string()))?;
    let config = load_config(common)?;

    runtime()?.block_on(async {
        let (realtime, pump) = start_session(config).await?;

        let channel = key.to_string();
        let _subscription = realtime
            .subscribe_to_broadcast(topic, move |message| {
                write_event(&channel, message)?;
                Ok(())
            })
            .await?;

        wait_for_exit(&realtime, pump).await
    })
}

/// Broadcast one message on `topic`
pub fn send(common: &Common, topic: &str, event: &str, payload: Option<&str>) -> CliResult<()> {
    ChannelKey::broadcast(topic).map_err(|e| CliError::invalid_argument(e.to_string()))?;
    let payload = parse_payload(payload)?;
    let config = load_config(common)?;

    runtime()?.block_on(async {
        let (realtime, pump) = start_session(config).await?;

        let subscription = realtime.subscribe_to_broadcast(topic, |_| Ok(())).await?;
        realtime.broadcast(topic, event, payload)?;
        write_response(json!({"topic": topic, "event": event}))?;

        realtime.unsubscribe(subscription);
        pump.abort();
        drop(realtime);
        tokio::time::sleep(FLUSH_GRACE).await;
        Ok::<(), CliError>(())
    })
}

fn parse_payload(payload: Option<&str>) -> CliResult<Value> {
    match payload {
        Some(text) => serde_json::from_str(text)
            .map_err(|e| CliError::invalid_argument(format!("Invalid payload JSON: {}", e))),
        None => read_payload(),
    }
}

fn runtime() -> CliResult<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new()
        .map_err(|e| CliError::io_error(format!("Failed to create tokio runtime: {}", e)))
}

/// Connect and start delivering inbound events
async fn start_session(config: RealtimeConfig) -> CliResult<(Realtime, JoinHandle<()>)> {
    let (transport, inbound) = WebSocketTransport::connect(&config.websocket).await?;
    let realtime = Realtime::new(config, Arc::new(transport), Arc::new(EmptySnapshotStore))?;

    let delivering = realtime.clone();
    let pump = tokio::spawn(async move { delivering.run(inbound).await });
    Ok((realtime, pump))
}

async fn wait_for_exit(realtime: &Realtime, mut pump: JoinHandle<()>) -> CliResult<()> {
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            pump.abort();
        }
        _ = &mut pump => {}
    }

    realtime.shutdown_all();
    write_response(serde_json::to_value(realtime.metrics())?)
}
