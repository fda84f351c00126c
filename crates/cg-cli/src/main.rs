//! campusgo: CampusGo session command line client
//!
//! Run `campusgo --help` for the list of commands.

mod cli;

use cg_core::Config;
use tracing_subscriber::EnvFilter;

/// Subcommand selected on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login { username: String, password: Option<String> },
    Logout,
    Whoami,
    Status,
    Refresh,
    Get { path: String },
    Post { path: String, body: String },
    Help,
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let command = parse_args(std::env::args().skip(1))?;

    match command {
        Command::Help => {
            print_help();
            return Ok(());
        }
        Command::Version => {
            println!("campusgo {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    // Logs go to stderr so command output stays pipeable
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    // Load .env file
    dotenvy::dotenv().ok();

    let config = Config::load().map_err(|e| anyhow::anyhow!("Config error: {}", e))?;
    tracing::debug!("API base URL: {}", config.api.base_url);

    let cli = cli::Cli::open(config).await?;
    cli.run(command).await
}

/// Parse command line arguments (program name already skipped)
fn parse_args<I>(args: I) -> anyhow::Result<Command>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();

    let Some(first) = args.next() else {
        return Ok(Command::Help);
    };

    let command = match first.as_str() {
        "--help" | "-h" | "help" => Command::Help,
        "--version" | "-v" => Command::Version,
        "login" => {
            let username = args
                .next()
                .ok_or_else(|| anyhow::anyhow!("Usage: campusgo login <username> [password]"))?;
            Command::Login {
                username,
                password: args.next(),
            }
        }
        "logout" => Command::Logout,
        "whoami" => Command::Whoami,
        "status" => Command::Status,
        "refresh" => Command::Refresh,
        "get" => Command::Get {
            path: args.next().ok_or_else(|| anyhow::anyhow!("Usage: campusgo get <path>"))?,
        },
        "post" => {
            let usage = || anyhow::anyhow!("Usage: campusgo post <path> <json>");
            let path = args.next().ok_or_else(usage)?;
            let body = args.next().ok_or_else(usage)?;
            Command::Post { path, body }
        }
        other => anyhow::bail!("Unknown command: {} (see campusgo --help)", other),
    };

    if let Some(extra) = args.next() {
        anyhow::bail!("Unexpected argument: {}", extra);
    }

    Ok(command)
}

/// Print help message
fn print_help() {
    println!("campusgo - CampusGo session client");
    println!();
    println!("Usage:");
    println!("  campusgo login <username> [password]  Log in and store the session");
    println!("  campusgo logout                       Clear the stored session");
    println!("  campusgo whoami                       Reload and print the user profile");
    println!("  campusgo status                       Show token state");
    println!("  campusgo refresh                      Refresh the access token now");
    println!("  campusgo get <path>                   Authenticated GET request");
    println!("  campusgo post <path> <json>           Authenticated POST request");
    println!("  campusgo --help                       Show this help message");
    println!("  campusgo --version                    Show version");
    println!();
    println!("Configuration is read from campusgo.toml when present.");
    println!();
    println!("Environment Variables:");
    println!("  CAMPUSGO_API_BASE_URL        Backend URL (default: http://localhost:8001)");
    println!("  CAMPUSGO_PASSWORD            Password for login when not given as an argument");
    println!("  CAMPUSGO_STORE_PATH          Session database (default: data/campusgo-session.db)");
    println!("  CAMPUSGO_KEY_PREFIX          Storage key prefix, e.g. admin_");
    println!("  CAMPUSGO_REFRESH_MARGIN_SECS Refresh this long before expiry (default: 300)");
    println!("  CAMPUSGO_RETRY_POLICY        return_response or expire_session");
}
