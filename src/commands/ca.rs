//! `tether ca init` / `tether ca bundle`

use anyhow::{Context, Result};
use colored::Colorize;

use crate::config::Config;
use crate::pki;

pub fn init(cfg: &Config, force: bool) -> Result<()> {
    let ca = super::authority(cfg);
    let identity = ca
        .get_or_create_ca(force)
        .context("creating certificate authority")?;
    let report = pki::validate_certificate(&identity.cert_pem)?;

    let action = if force { "regenerated" } else { "ready" };
    println!("{} {}", "Certificate authority".bold(), action.green().bold());
    println!("  {} {}", "ssl dir:".bold(), ca.ssl_dir().display());
    super::cert::print_report(&report);
    if force {
        println!();
        println!(
            "{} every node certificate must be reissued against the new CA.",
            "::".yellow().bold()
        );
    }
    Ok(())
}

pub fn bundle(cfg: &Config) -> Result<()> {
    let ca = super::authority(cfg);
    let pem = ca.ca_bundle().context("loading certificate authority")?;
    print!("{}", pem);
    Ok(())
}
