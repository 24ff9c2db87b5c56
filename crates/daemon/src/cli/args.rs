pub use clap::Parser;

use std::path::PathBuf;
use std::time::Duration;

use common::cache::Timeouts;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "secretfs")]
#[command(about = "Mount a secret server as a read-only filesystem", version)]
pub struct Args {
    /// Base URL of the secret server, e.g. https://secrets.example.com:4444
    pub server_url: Url,

    /// Directory to mount the filesystem at
    pub mountpoint: PathBuf,

    /// PEM-encoded client certificate file (defaults to the key file)
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// PEM-encoded client private key file
    #[arg(long, default_value = "client.key")]
    pub key: PathBuf,

    /// PEM-encoded CA certificates file
    #[arg(long, default_value = "cacert.crt")]
    pub ca: PathBuf,

    /// Default user to own files
    #[arg(long, default_value = "keywhiz")]
    pub asuser: String,

    /// Default group to own files
    #[arg(long, default_value = "keywhiz")]
    pub asgroup: String,

    /// Fail startup unless the server answers the initial listing
    #[arg(long)]
    pub ping: bool,

    /// Enable debug output
    #[arg(long)]
    pub debug: bool,

    /// Transport timeout for server requests, in seconds
    #[arg(long, default_value_t = 20)]
    pub timeout_secs: u64,

    /// Window during which a cached secret is served without asking the
    /// server, in milliseconds
    #[arg(long, default_value_t = 200)]
    pub fresh_ms: u64,

    /// Optimistic wait on a server request before falling back to cached
    /// data, in milliseconds
    #[arg(long, default_value_t = 500)]
    pub backend_deadline_ms: u64,

    /// Grace period before a secret deleted on the server disappears from
    /// the mount, in seconds
    #[arg(long, default_value_t = 3600)]
    pub deletion_delay_secs: u64,

    /// Let users other than the mounting one access the filesystem
    #[arg(long)]
    pub allow_other: bool,
}

impl Args {
    pub fn transport_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Timeout tiers for the cache. The hard ceiling sits above the
    /// transport timeout so a slow-but-answering server is never cut off
    /// before the transport gives up.
    pub fn timeouts(&self) -> Timeouts {
        let backend_deadline = Duration::from_millis(self.backend_deadline_ms);
        Timeouts {
            fresh: Duration::from_millis(self.fresh_ms),
            backend_deadline,
            max_wait: self.transport_timeout() + backend_deadline,
            deletion_delay: Duration::from_secs(self.deletion_delay_secs),
        }
    }

    /// Certificate file, falling back to the key file when both live in one
    /// PEM.
    pub fn cert_file(&self) -> &PathBuf {
        self.cert.as_ref().unwrap_or(&self.key)
    }
}
