//! Process bootstrap: logging, memory locking, panic reporting.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber. `RUST_LOG` overrides the default
/// level.
pub fn init_logging(debug: bool) {
    let default_level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let fmt_layer = tracing_subscriber::fmt::layer().compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    // Panics go through tracing too; a FUSE callback thread dying silently
    // would otherwise leave nothing in the logs.
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        tracing::error!(%location, "panic: {info}");
    }));
}

/// Locks current and future memory pages resident so secret bytes cannot be
/// written to swap. Missing kernel support or insufficient lockable memory
/// is survivable; anything else is not.
pub fn lock_memory() -> anyhow::Result<()> {
    let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ENOSYS) => {
            tracing::warn!("mlockall() not implemented on this system");
            Ok(())
        }
        Some(libc::ENOMEM) => {
            tracing::warn!("mlockall() failed with ENOMEM");
            Ok(())
        }
        _ => Err(anyhow::anyhow!("mlockall() failed: {err}")),
    }
}
