use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use relay_server::{router, run_cleanup, ServerOptions, ServerState};

#[derive(Parser)]
#[command(name = "relay-server")]
#[command(about = "Rendezvous and relay server for relay transfers")]
#[command(version)]
struct Args {
    /// Listen address
    #[arg(long, default_value = "0.0.0.0:8080")]
    addr: String,

    /// Maximum concurrent sessions
    #[arg(long, default_value_t = 1000)]
    max_sessions: usize,

    /// Session time-to-live, e.g. "10m", "600s" or plain seconds
    #[arg(long, default_value = "10m", value_parser = parse_duration)]
    session_ttl: Duration,

    /// Relay bandwidth budget per session, bytes per second
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    relay_rate_limit: u64,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (number, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration: {s:?}"))?;
    match unit {
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(format!("invalid duration unit: {unit:?}")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "relay_server=info".into()),
        )
        .init();

    let args = Args::parse();
    let opts = ServerOptions {
        max_sessions: args.max_sessions,
        session_ttl: args.session_ttl,
        relay_rate_limit: args.relay_rate_limit,
    };

    let state = Arc::new(ServerState::new(opts));
    tokio::spawn(run_cleanup(state.clone()));

    let listener = tokio::net::TcpListener::bind(&args.addr)
        .await
        .with_context(|| format!("failed to bind {}", args.addr))?;

    tracing::info!(
        "relay server listening on {} (max-sessions={}, session-ttl={:?})",
        args.addr,
        args.max_sessions,
        args.session_ttl
    );

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_parse_with_and_without_units() {
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("abc").is_err());
    }
}
