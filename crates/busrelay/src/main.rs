// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! busrelay Broker
//!
//! Runs the relay broker over the in-memory loopback bus. Useful for wiring
//! up nodes without a real local middleware: whatever one node publishes on
//! a topic reaches every node subscribed to it.
//!
//! # Usage
//!
//! ```bash
//! # Default ports (control 5555, notify 5556)
//! busrelay-broker
//!
//! # Config file, with addresses reported as the LAN IP
//! busrelay-broker --config broker.json --advertise-host 192.168.1.10
//! ```

use busrelay::{Broker, BrokerConfig, MemoryBus};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// busrelay Broker - bridges a local pub/sub bus with remote nodes
#[derive(Parser, Debug)]
#[command(name = "busrelay-broker")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (JSON format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind host for control and notify channels (* for all interfaces)
    #[arg(short, long)]
    bind: Option<String>,

    /// Control channel port
    #[arg(long)]
    control_port: Option<u16>,

    /// Notify channel port
    #[arg(long)]
    notify_port: Option<u16>,

    /// Host reported in relay addresses when bound to a wildcard
    #[arg(long)]
    advertise_host: Option<String>,

    /// Log filter (trace, debug, info, warn, error, or directives like busrelay=debug)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let mut config = if let Some(config_path) = &args.config {
        info!("Loading config from {:?}", config_path);
        BrokerConfig::from_file(config_path)?
    } else {
        BrokerConfig::default()
    };

    // Command line overrides the file.
    if let Some(bind) = args.bind {
        config.bind_host = bind.clone();
        config.data_bind_host = bind;
    }
    if let Some(port) = args.control_port {
        config.control_port = port;
    }
    if let Some(port) = args.notify_port {
        config.notify_port = port;
    }
    if let Some(host) = args.advertise_host {
        config.transport.advertise_host = host;
    }

    let bus = MemoryBus::with_params(config.params.clone());
    let mut broker = Broker::bind(config, Arc::new(bus))?;

    info!("+----------------------------------------------------+");
    info!(
        "|         busrelay broker v{:<26}|",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!("|  Control: {:40} |", broker.control_addr().to_string());
    info!("|  Notify:  {:40} |", broker.notify_addr().to_string());
    info!(
        "|  Schema:  {:40} |",
        format!("{:?}", broker.config().schema_policy).to_lowercase()
    );
    info!(
        "|  Idle GC: {:40} |",
        broker
            .config()
            .relay_idle_timeout_secs
            .map(|s| format!("{}s", s))
            .unwrap_or_else(|| "disabled".to_string())
    );
    info!("+----------------------------------------------------+");

    let running = Arc::new(AtomicBool::new(true));
    let running_loop = running.clone();
    let broker_task = tokio::task::spawn_blocking(move || {
        broker.run(&running_loop);
        broker.stats()
    });

    tokio::signal::ctrl_c().await.ok();
    info!("Shutdown signal received, stopping broker...");
    running.store(false, Ordering::SeqCst);

    let stats = broker_task.await?;
    info!(
        "Relayed {} message(s) in, {} out ({} empty, {} oversized dropped)",
        stats.messages_in, stats.messages_out, stats.dropped_empty, stats.dropped_oversized
    );
    info!("Broker stopped");
    Ok(())
}
