//! `tether cert issue|panel-client|inspect`

use anyhow::{bail, Context, Result};
use colored::Colorize;
use std::path::PathBuf;

use crate::config::Config;
use crate::pki::{self, CertificateReport};
use crate::store::NodeId;

pub fn issue(
    cfg: &Config,
    node_id: NodeId,
    hostname: &str,
    ip: Option<&str>,
    out_dir: Option<String>,
) -> Result<()> {
    let ca = super::authority(cfg);
    let issued = ca
        .issue_node_certificate(node_id, hostname, ip)
        .with_context(|| format!("issuing certificate for node {}", node_id))?;

    let out_dir = out_dir.map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("creating {}", out_dir.display()))?;
    let cert_path = out_dir.join(format!("node-{}.cert", node_id));
    let key_path = out_dir.join(format!("node-{}.key", node_id));
    pki::export_pem(&cert_path, &issued.cert_pem, 0o644)
        .with_context(|| format!("writing {}", cert_path.display()))?;
    pki::export_pem(&key_path, &issued.key_pem, 0o600)
        .with_context(|| format!("writing {}", key_path.display()))?;

    println!(
        "{} {}",
        "Issued certificate for node".bold(),
        node_id.to_string().green().bold()
    );
    println!("  {} {}", "cert:".bold(), cert_path.display());
    println!("  {} {}", "key:".bold(), key_path.display());
    println!("  {} {}", "expires:".bold(), issued.expires_at);
    println!("  {} {}", "names:".bold(), issued.subject_alt_names.join(", "));
    Ok(())
}

pub fn panel_client(cfg: &Config, renew: bool) -> Result<()> {
    let ca = super::authority(cfg);
    let issued = if renew {
        ca.renew_panel_client_certificate()
            .context("renewing panel client certificate")?
    } else {
        ca.issue_panel_client_certificate()
            .context("loading panel client certificate")?
    };
    let report = pki::validate_certificate(&issued.cert_pem)?;

    println!("{}", "Panel client certificate".bold());
    println!("  {} {}", "ssl dir:".bold(), ca.ssl_dir().display());
    print_report(&report);
    Ok(())
}

pub fn inspect(file: &str, format: &str) -> Result<()> {
    let pem = std::fs::read_to_string(file).with_context(|| format!("reading {}", file))?;
    let report = pki::validate_certificate(&pem).with_context(|| format!("parsing {}", file))?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        "table" => print_report(&report),
        other => bail!("unknown format '{}', expected table or json", other),
    }
    Ok(())
}

pub(super) fn print_report(report: &CertificateReport) {
    let validity = if report.is_expired {
        "expired".red().bold()
    } else if report.days_until_expiry < 30 {
        format!("{} days left", report.days_until_expiry).yellow()
    } else {
        format!("{} days left", report.days_until_expiry).green()
    };

    println!("  {} {}", "subject:".bold(), report.subject);
    println!("  {} {}", "issuer:".bold(), report.issuer);
    println!("  {} {}", "serial:".bold(), report.serial);
    println!("  {} {}", "not before:".bold(), report.not_before);
    println!("  {} {} ({})", "not after:".bold(), report.not_after, validity);
    if !report.subject_alt_names.is_empty() {
        println!("  {} {}", "names:".bold(), report.subject_alt_names.join(", "));
    }
}
