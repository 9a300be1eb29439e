#![forbid(unsafe_code)]

//! Portal relay - always-reachable entry point for private backends.
//!
//! The relay:
//! 1. Accepts backend control connections (Noise XX secure channels)
//! 2. Tracks leases registered over those channels
//! 3. Routes SNI TCP ingress to the matching lease and relays bytes

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use portal_crypto::identity::Credential;
use portal_relay::config::RelayConfig;
use portal_relay::forward::relay_streams;
use portal_relay::session::{handle_backend, RelayState};
use portal_relay::sni;

#[derive(Parser, Debug)]
#[command(name = "portal-relay")]
#[command(about = "Portal relay node - exposes private backends through leases")]
struct Args {
    /// Control listen address for backend channels
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// SNI TCP ingress listen address
    #[arg(long)]
    sni_listen: Option<SocketAddr>,

    /// Base domain for implicit `<lease>.<domain>` SNI routes
    #[arg(long)]
    sni_domain: Option<String>,

    /// Relay credential seed file (created when missing)
    #[arg(long, default_value = "portal-relay.key")]
    credential: String,

    /// Approval mode: auto or manual
    #[arg(long)]
    approval_mode: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_or_create_credential(path: &str) -> Result<Credential> {
    if std::path::Path::new(path).exists() {
        let cred = Credential::load(path)?;
        info!(id = %cred.id(), "loaded relay credential");
        return Ok(cred);
    }
    let cred = Credential::generate();
    cred.save(path)
        .with_context(|| format!("failed to persist credential to {path}"))?;
    info!(id = %cred.id(), path, "generated new relay credential");
    Ok(cred)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    let mut config = RelayConfig::from_env();
    if let Some(listen) = args.listen {
        config.control_listen = listen;
    }
    if args.sni_listen.is_some() {
        config.sni_listen = args.sni_listen;
    }
    if args.sni_domain.is_some() {
        config.sni_domain = args.sni_domain.clone();
    }
    if let Some(mode) = args
        .approval_mode
        .as_deref()
        .and_then(portal_relay::approval::ApprovalMode::parse)
    {
        config.approval_mode = mode;
    }

    let credential = load_or_create_credential(&args.credential)?;
    let state = RelayState::new(credential, config.clone());

    let (stop_tx, stop_rx) = watch::channel(false);

    // Backend control listener.
    let control_listener = TcpListener::bind(config.control_listen)
        .await
        .with_context(|| format!("failed to bind control listener {}", config.control_listen))?;
    info!(addr = %config.control_listen, "control listener up");
    {
        let state = state.clone();
        let mut stop = stop_rx.clone();
        tokio::spawn(async move {
            loop {
                let (stream, peer) = tokio::select! {
                    accepted = control_listener.accept() => match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("control accept failed: {e}");
                            continue;
                        }
                    },
                    _ = stop.changed() => return,
                };
                tokio::spawn(handle_backend(state.clone(), stream, peer));
            }
        });
    }

    // SNI ingress.
    if let Some(sni_listen) = config.sni_listen {
        let listener = TcpListener::bind(sni_listen)
            .await
            .with_context(|| format!("failed to bind sni listener {sni_listen}"))?;
        info!(addr = %sni_listen, "sni listener up");

        let router = state.sni_router.clone();
        let dispatch_state = state.clone();
        let on_connection = move |conn, lease_id, peer: SocketAddr| {
            let state = dispatch_state.clone();
            async move {
                if state.ip_tracker.is_banned(&peer.ip()) {
                    debug!(%peer, "dropping banned client");
                    return;
                }
                let Some(entry) = state.registry.lookup_by_id(&lease_id) else {
                    debug!(%peer, %lease_id, "route points at a vanished lease");
                    return;
                };
                let alpn = entry
                    .lease()
                    .alpns
                    .first()
                    .cloned()
                    .unwrap_or_default();

                match state
                    .registry
                    .open_stream(&entry, &peer.to_string(), &alpn)
                    .await
                {
                    Ok(lease_stream) => {
                        let bucket = state.bandwidth.get_bucket(entry.id());
                        let (up, down) = relay_streams(conn, lease_stream, bucket).await;
                        debug!(%peer, lease = %entry.id(), up, down, "client relay done");
                    }
                    // Clients get a plain TCP close on any failure.
                    Err(e) => debug!(%peer, lease = %entry.id(), "dispatch failed: {e}"),
                }
            }
        };
        tokio::spawn(sni::accept_loop(
            listener,
            router,
            on_connection,
            stop_rx.clone(),
        ));
    }

    // Lease TTL sweeper.
    {
        let state = state.clone();
        let mut stop = stop_rx.clone();
        let cadence = (config.lease_ttl / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cadence);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let swept = state.registry.sweep_expired();
                        if swept > 0 {
                            debug!(swept, "lease sweep");
                        }
                    }
                    _ = stop.changed() => return,
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    let _ = stop_tx.send(true);
    Ok(())
}
