use std::sync::Arc;

use clap::Parser;

use common::cache::Cache;
use common::clock::system_clock;
use secretfs_daemon::cli::Args;
use secretfs_daemon::fuse;
use secretfs_daemon::process;
use secretfs_daemon::{ClientError, SecretClient, SecretFs};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    process::init_logging(args.debug);

    if let Err(err) = process::lock_memory() {
        tracing::error!(error = %err, "could not lock memory to keep secrets out of swap");
        std::process::exit(1);
    }

    let client = match build_client(&args) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            tracing::error!(error = %err, "failed to build server client");
            std::process::exit(1);
        }
    };
    client.clone().spawn_refresh();

    let cache = Arc::new(Cache::new(client.clone(), args.timeouts(), system_clock()));
    if cache.warmup().await.is_err() && args.ping {
        tracing::error!(url = %args.server_url, "startup ping to server failed");
        std::process::exit(1);
    }

    let ownership = secretfs_daemon::Ownership::new(&args.asuser, &args.asgroup);
    let fs = SecretFs::new(
        tokio::runtime::Handle::current(),
        cache,
        client,
        ownership,
    );

    let options = fuse::mount_options(args.allow_other);
    let session = match fuser::spawn_mount2(fs, &args.mountpoint, &options) {
        Ok(session) => session,
        Err(err) => {
            tracing::error!(
                mountpoint = %args.mountpoint.display(),
                error = %err,
                "mount failed"
            );
            std::process::exit(1);
        }
    };
    tracing::info!(mountpoint = %args.mountpoint.display(), "mounted");

    wait_for_shutdown().await;
    tracing::info!("unmounting");
    drop(session);
}

/// Mutual TLS for https servers; a bare client otherwise (local testing).
fn build_client(args: &Args) -> Result<SecretClient, ClientError> {
    if args.server_url.scheme() == "https" {
        SecretClient::new(
            args.server_url.clone(),
            args.cert_file(),
            &args.key,
            &args.ca,
            args.transport_timeout(),
        )
    } else {
        tracing::warn!(url = %args.server_url, "server url is not https, mutual TLS disabled");
        SecretClient::new_plain(args.server_url.clone(), args.transport_timeout())
    }
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            tracing::error!(error = %err, "failed to install SIGTERM handler");
            // SIGINT alone still allows a clean unmount.
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::warn!("got SIGINT, shutting down"),
        _ = term.recv() => tracing::warn!("got SIGTERM, shutting down"),
    }
}
