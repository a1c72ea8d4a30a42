pub mod ca;
pub mod cert;
pub mod serve;

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{self, Config};
use crate::events::{SecurityEventSink, TracingEventSink};
use crate::pki::CertificateAuthority;

/// Load layered config and apply the `--data-dir` override.
pub fn load_config(config_path: Option<&str>, data_dir: Option<String>) -> Result<Config> {
    let mut cfg = config::load(config_path.map(std::path::Path::new))?;
    if let Some(dir) = data_dir {
        cfg.data_dir = PathBuf::from(dir);
    }
    Ok(cfg)
}

/// Human-facing commands log warnings to stderr; `RUST_LOG` wins.
fn init_cli_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn authority(cfg: &Config) -> CertificateAuthority {
    init_cli_logging();
    let events: Arc<dyn SecurityEventSink> = Arc::new(TracingEventSink);
    CertificateAuthority::new(cfg.ssl_dir(), events)
}
