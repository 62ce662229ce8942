use clap::{parser::ValueSource, ArgMatches, CommandFactory, FromArgMatches, Parser};
use compass::experiments::service::Bucketing;
use compass::{ServiceConfig, TrackPolicy};
use compass_http::{serve, ServerConfig};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "compass", version, about = "Experiment assignment and metrics server")]
struct Cli {
    /// Persist experiments and events under this directory (in-memory when omitted)
    #[arg(long, env = "COMPASS_DATA_DIR")]
    data_dir: Option<PathBuf>,
    #[arg(long, env = "COMPASS_BIND_ADDR")]
    bind_addr: Option<String>,
    #[arg(long, env = "COMPASS_PORT")]
    port: Option<u16>,

    /// Bind to 127.0.0.1:0 (OS-assigned ephemeral port). Prints resolved address at startup.
    #[arg(long)]
    auto_port: bool,

    /// Do not seed the default experiment into an empty store
    #[arg(long, env = "COMPASS_NO_SEED")]
    no_seed: bool,

    /// random, hash, or seeded:<u64>
    #[arg(long, env = "COMPASS_BUCKETING", default_value = "random")]
    bucketing: Bucketing,

    /// Reject tracked events whose variant contradicts a server-side assignment
    #[arg(long, env = "COMPASS_REJECT_VARIANT_MISMATCH")]
    reject_variant_mismatch: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cmd = Cli::command();
    let matches = cmd.get_matches();
    let cli = Cli::from_arg_matches(&matches)?;

    let config = resolve_runtime_config(&cli, &matches)
        .map_err(|msg| std::io::Error::new(std::io::ErrorKind::InvalidInput, msg))?;
    serve(config).await
}

fn resolve_runtime_config(cli: &Cli, matches: &ArgMatches) -> Result<ServerConfig, String> {
    let bind_addr = resolve_bind_addr(cli, matches)?;
    let track_policy = if cli.reject_variant_mismatch {
        TrackPolicy::RejectMismatch
    } else {
        TrackPolicy::TrustCaller
    };
    Ok(ServerConfig {
        bind_addr,
        data_dir: cli.data_dir.clone(),
        service: ServiceConfig {
            seed_default: !cli.no_seed,
            bucketing: cli.bucketing,
            track_policy,
        },
    })
}

fn resolve_bind_addr(cli: &Cli, matches: &ArgMatches) -> Result<String, String> {
    if cli.auto_port && is_set_on_command_line(matches, "bind_addr") {
        return Err("--auto-port cannot be used with --bind-addr".to_string());
    }

    if cli.auto_port && is_set_on_command_line(matches, "port") {
        return Err("--auto-port cannot be used with --port".to_string());
    }

    if cli.auto_port {
        return Ok("127.0.0.1:0".to_string());
    }

    // An explicit port keeps the host of bind-addr.
    let host = match &cli.bind_addr {
        Some(addr) => addr
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .ok_or_else(|| format!("--bind-addr must be host:port, got '{addr}'"))?,
        None => "127.0.0.1".to_string(),
    };

    match (cli.port, &cli.bind_addr) {
        (Some(port), _) => Ok(format!("{host}:{port}")),
        (None, Some(addr)) => Ok(addr.clone()),
        (None, None) => Ok("127.0.0.1:7700".to_string()),
    }
}

fn is_set_on_command_line(matches: &ArgMatches, arg: &str) -> bool {
    matches.value_source(arg) == Some(ValueSource::CommandLine)
}
