use std::{path::PathBuf, process::ExitCode, time::Duration};

use clap::{Parser, Subcommand};
use devopin_proto::{
    ServiceStatus,
    msg::{Command, EndReason, Frame, Reply, StreamEvent, StreamId},
};
use time::{UtcOffset, macros::format_description};
use tracing::{debug, trace};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::client::ControlClient;

mod client;

#[derive(Debug, Parser)]
#[command(name = "devopin-ctl", about = "Talk to a running devopin agent")]
struct Cli {
    #[arg(
        short,
        long,
        value_name = "PATH",
        env = "DEVOPIN_SOCKET_PATH",
        default_value = "/run/devopin-agent.sock",
        help = "Control socket of the agent"
    )]
    socket: PathBuf,
    #[arg(long, default_value_t = 35, help = "Seconds to wait for an answer")]
    timeout: u64,
    #[arg(long, help = "Print raw JSON frames")]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Agent status, or the status of one service
    #[clap(visible_alias("st"))]
    Status { service: Option<String> },
    /// Start a service
    Start { service: String },
    /// Stop a service
    Stop { service: String },
    /// Restart a service
    Restart { service: String },
    /// Enable a service at boot
    Enable { service: String },
    /// Disable a service at boot
    Disable { service: String },
    /// Follow the journal of a service until interrupted
    #[clap(visible_alias("follow"))]
    Logs { service: String },
    /// Stop a log stream by id
    LogsStop { stream_id: StreamId },
}

impl From<Commands> for Command {
    fn from(command: Commands) -> Self {
        match command {
            Commands::Status { service } => Command::Status { service },
            Commands::Start { service } => Command::Start { service },
            Commands::Stop { service } => Command::Stop { service },
            Commands::Restart { service } => Command::Restart { service },
            Commands::Enable { service } => Command::Enable { service },
            Commands::Disable { service } => Command::Disable { service },
            Commands::Logs { service } => Command::LogsStream { service },
            Commands::LogsStop { stream_id } => Command::LogsStop {
                stream_id: Some(stream_id),
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    init_tracing();

    let cli = Cli::parse();
    trace!("using command line arguments {:?}", cli);

    let limit = Duration::from_secs(cli.timeout);
    let command = Command::from(cli.command);
    let streaming = matches!(command, Command::LogsStream { .. });

    let mut client = ControlClient::connect(&cli.socket).await?;
    client.send(&command.into()).await?;

    if streaming {
        return follow(&mut client, cli.json).await;
    }

    let mut ok = true;
    while let Some(frame) = client.next_frame_within(limit).await? {
        if let Frame::Reply(reply) = &frame {
            ok &= reply.is_ok();
        }
        println!("{}", render(&frame, cli.json));
    }
    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

/// Prints stream frames until the stream ends or Ctrl-C stops it.
async fn follow(client: &mut ControlClient, json: bool) -> anyhow::Result<ExitCode> {
    let mut stream_id = None;
    let mut interrupted = false;
    loop {
        let frame = tokio::select! {
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                debug!("interrupted, stopping stream {stream_id:?}");
                let Some(id) = stream_id.clone() else {
                    return Ok(ExitCode::FAILURE);
                };
                client.send(&Command::LogsStop { stream_id: Some(id) }.into()).await?;
                continue;
            }
            frame = client.next_frame() => frame?,
        };
        let Some(frame) = frame else {
            return Ok(ExitCode::SUCCESS);
        };
        println!("{}", render(&frame, json));
        match frame {
            Frame::Event(StreamEvent::LogsStreamStarted { stream_id: id, .. }) => {
                stream_id = Some(id)
            }
            Frame::Event(StreamEvent::LogsStreamEnded { .. }) => return Ok(ExitCode::SUCCESS),
            Frame::Reply(reply) if !reply.is_ok() => return Ok(ExitCode::FAILURE),
            _ => {}
        }
    }
}

fn render(frame: &Frame, json: bool) -> String {
    if json {
        return serde_json::to_string(frame).unwrap_or_else(|e| format!("<unprintable frame: {e}>"));
    }
    match frame {
        Frame::Reply(reply) => render_reply(reply),
        Frame::Event(StreamEvent::LogsStreamStarted { stream_id, service }) => {
            format!("streaming {service} (stream {stream_id}), Ctrl-C to stop")
        }
        Frame::Event(StreamEvent::LogsData { data, .. }) => render_log(data),
        Frame::Event(StreamEvent::LogsStreamEnded { stream_id, reason }) => {
            let reason = match reason {
                EndReason::Stopped => "stopped",
                EndReason::ProcessExited => "log follower exited",
                EndReason::AlreadyStopped => "was already stopped",
                EndReason::NoActiveStreams => "no active streams",
                EndReason::Shutdown => "agent shutting down",
            };
            match stream_id {
                Some(id) => format!("stream {id}: {reason}"),
                None => reason.to_owned(),
            }
        }
    }
}

fn render_reply(reply: &Reply) -> String {
    let mut out = Vec::new();
    if let Some(code) = reply.error {
        out.push(format!(
            "error ({code}): {}",
            reply.message.as_deref().unwrap_or("no details")
        ));
    } else if let Some(message) = &reply.message {
        out.push(message.clone());
    }
    if let Some(status) = &reply.status {
        out.push(render_status(status));
    }
    for status in reply.services.iter().flatten() {
        out.push(render_status(status));
    }
    out.join("\n")
}

fn render_status(status: &ServiceStatus) -> String {
    let mut line = format!(
        "{:<24} {:<20} {}",
        status.name,
        status.status_text,
        if status.enabled { "enabled" } else { "disabled" }
    );
    if let Some(since) = status.since {
        let local = since.to_offset(UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC));
        if let Ok(since) = local.format(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second]"
        )) {
            line.push_str(&format!("  since {since}"));
        }
    }
    if let Some(uptime) = status.uptime {
        line.push_str(&format!(" ({})", human_duration(uptime)));
    }
    line
}

fn render_log(data: &serde_json::Value) -> String {
    if let Some(raw) = data.get("raw").and_then(|v| v.as_str()) {
        return raw.to_owned();
    }
    match data.get("message").and_then(|v| v.as_str()) {
        Some(message) => {
            let field = |name: &str| data.get(name).and_then(|v| v.as_str()).unwrap_or("-");
            format!("{} {:<8} {message}", field("timestamp"), field("level"))
        }
        None => data.to_string(),
    }
}

fn human_duration(secs: u64) -> String {
    let (days, hours, minutes) = (secs / 86_400, secs / 3_600 % 24, secs / 60 % 60);
    match (days, hours, minutes) {
        (0, 0, 0) => format!("{secs}s"),
        (0, 0, m) => format!("{m}m"),
        (0, h, m) => format!("{h}h {m}m"),
        (d, h, _) => format!("{d}d {h}h"),
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                #[cfg(debug_assertions)]
                let default_log_level = format!("{}=debug", env!("CARGO_CRATE_NAME")).into();

                #[cfg(not(debug_assertions))]
                let default_log_level = format!("{}=warn", env!("CARGO_CRATE_NAME")).into();

                default_log_level
            }),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .without_time()
                .with_writer(std::io::stderr),
        )
        .init();
}
