use anyhow::Result;

pub fn run(
    config_path: Option<String>,
    log_level: Option<String>,
    data_dir: Option<String>,
) -> Result<()> {
    let mut config = super::load_config(config_path.as_deref(), data_dir)?;

    // CLI flags override config values
    if let Some(level) = log_level {
        config.log_level = level;
    }

    // Build tokio runtime explicitly (no #[tokio::main] on fn main)
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(crate::server::run(config))
}
