use clap::{Parser, Subcommand};

use pleme_tether::commands;

#[derive(Parser)]
#[command(name = "tether", version, about = "Control plane for a fleet of proxy nodes over mutual TLS")]
struct Cli {
    /// Path to config file (default: ~/.config/tether/config.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Data directory (overrides config); TLS material lives in <data-dir>/ssl
    #[arg(long, global = true)]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control plane: supervise every enabled node until SIGINT/SIGTERM
    Serve {
        /// Log level (overrides config)
        #[arg(long)]
        log_level: Option<String>,
    },

    /// Manage the certificate authority
    Ca {
        #[command(subcommand)]
        command: CaCommands,
    },

    /// Issue and inspect certificates
    Cert {
        #[command(subcommand)]
        command: CertCommands,
    },
}

#[derive(Subcommand)]
enum CaCommands {
    /// Create the CA, or load the existing one
    Init {
        /// Regenerate the CA even if one exists; invalidates every issued certificate
        #[arg(long)]
        force: bool,
    },
    /// Print the CA public certificate
    Bundle,
}

#[derive(Subcommand)]
enum CertCommands {
    /// Issue a node certificate and write node-<id>.cert / node-<id>.key
    Issue {
        #[arg(long)]
        node_id: i64,

        #[arg(long)]
        hostname: String,

        /// Node IP address added as a subject alternative name
        #[arg(long)]
        ip: Option<String>,

        /// Output directory (default: current directory)
        #[arg(long)]
        out_dir: Option<String>,
    },
    /// Ensure the panel client certificate exists and summarise it
    PanelClient {
        /// Replace the cached certificate, e.g. after it expired
        #[arg(long)]
        renew: bool,
    },
    /// Print the validation report for a PEM certificate
    Inspect {
        file: String,

        /// Output format (table or json)
        #[arg(long, default_value = "table")]
        format: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { log_level } => commands::serve::run(cli.config, log_level, cli.data_dir),
        Commands::Ca { command } => {
            let cfg = commands::load_config(cli.config.as_deref(), cli.data_dir)?;
            match command {
                CaCommands::Init { force } => commands::ca::init(&cfg, force),
                CaCommands::Bundle => commands::ca::bundle(&cfg),
            }
        }
        Commands::Cert { command } => match command {
            CertCommands::Issue {
                node_id,
                hostname,
                ip,
                out_dir,
            } => {
                let cfg = commands::load_config(cli.config.as_deref(), cli.data_dir)?;
                commands::cert::issue(&cfg, node_id, &hostname, ip.as_deref(), out_dir)
            }
            CertCommands::PanelClient { renew } => {
                let cfg = commands::load_config(cli.config.as_deref(), cli.data_dir)?;
                commands::cert::panel_client(&cfg, renew)
            }
            CertCommands::Inspect { file, format } => commands::cert::inspect(&file, &format),
        },
    }
}
