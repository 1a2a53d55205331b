use std::sync::Arc;
use std::time::Duration;

use braid_core::clock::SystemClock;
use braid_core::netif::StaticProvider;
use braid_core::session::{Session, SessionConfig};
use braid_log::BraidLogger;
use log::{Level, error, info, logger, warn};
use tokio::sync::mpsc;

mod config;

const LOG_CHANNEL_CAPACITY: usize = 1024;
const STATUS_REPORT_INTERVAL: Duration = Duration::from_secs(10);

fn fail(message: impl std::fmt::Display) -> ! {
    error!("{}", message);
    logger().flush();
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    BraidLogger::init(Level::Info, LOG_CHANNEL_CAPACITY).expect("Failed to install logger");

    let cfg = match config::handle() {
        Ok(cfg) => cfg,
        Err(e) => fail(e),
    };

    let handles = cfg.handles();
    if handles.is_empty() {
        warn!("no links configured; the uplink stays down until an interface is added");
    }

    let session_cfg = SessionConfig {
        server_host: cfg.server.host.clone(),
        server_port: cfg.server.port,
        local_port: cfg.source.listen_port,
        selector: cfg.selector(),
    };

    let provider = Arc::new(StaticProvider::new(handles));
    let clock = Arc::new(SystemClock::new());
    // Seam for a platform network-change observer; the static provider
    // never emits events, so the sender just stays parked here.
    let (_net_tx, net_rx) = mpsc::channel(16);

    let session = match Session::start(session_cfg, provider, clock, net_rx).await {
        Ok(session) => session,
        Err(e) => fail(e),
    };
    info!(
        "braid up: source {} -> {}:{}",
        session.local_addr(),
        cfg.server.host,
        cfg.server.port
    );

    let reporter = tokio::spawn(report_status(session.status(), session.stats()));

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    reporter.abort();
    session.stop().await;
    logger().flush();
}

/// One INFO line per link every report interval, plus the relay totals.
async fn report_status(
    status: braid_core::status::StatusBoard,
    stats: Arc<braid_core::status::SessionStats>,
) {
    let mut tick = tokio::time::interval(STATUS_REPORT_INTERVAL);
    tick.tick().await; // skip the immediate first fire

    loop {
        tick.tick().await;
        for entry in status.iter() {
            let s = entry.value();
            let rtt = s
                .rtt_ms
                .map(|v| format!("{:.1}ms", v))
                .unwrap_or_else(|| "-".to_string());
            info!(
                "{} [{}] {}: window={} in_flight={} rtt={} naks={} score={} sent={}p/{}B idle={}ms",
                s.name,
                s.kind,
                s.state,
                s.window,
                s.in_flight,
                rtt,
                s.nak_count,
                s.score,
                s.packets_sent,
                s.bytes_sent,
                s.last_activity_age_ms
            );
        }
        let accuracy = stats
            .attribution_accuracy()
            .map(|v| format!("{:.0}%", v * 100.0))
            .unwrap_or_else(|| "-".to_string());
        info!(
            "relay: {} forwarded, {} dropped (no link), {} dropped (send failed), NAK attribution {}",
            stats.forwarded(),
            stats.dropped_no_link(),
            stats.dropped_send_failed(),
            accuracy
        );
        logger().flush();
    }
}
