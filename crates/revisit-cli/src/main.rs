use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;

#[zbus::proxy(
    interface = "org.revisit.Resolver1",
    default_service = "org.revisit.Resolver1",
    default_path = "/org/revisit/Resolver1"
)]
trait Resolver {
    fn resolve(&self, observation: &str) -> zbus::Result<String>;
    fn stats(&self, window_secs: u64) -> zbus::Result<String>;
    fn list_visitors(&self) -> zbus::Result<String>;
    fn get_visitor(&self, id: u64) -> zbus::Result<String>;
    fn list_visits(&self, from: &str, to: &str, limit: u32, offset: u32) -> zbus::Result<String>;
    fn top_visitors(&self, count: u32) -> zbus::Result<String>;
    fn rename_visitor(&self, id: u64, name: &str) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;

    #[zbus(signal)]
    fn visitor_resolved(&self, event: &str) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "revisit", about = "Revisit visitor identity CLI")]
struct Cli {
    /// Connect to the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve an observation read from a JSON file ("-" for stdin)
    Resolve {
        path: PathBuf,
    },
    /// Show visitor statistics
    Stats {
        /// Look-back window in seconds (default: daemon setting)
        #[arg(long, default_value_t = 0)]
        window_secs: u64,
    },
    /// List all visitors
    List,
    /// List visitors by most recent sighting
    Visits {
        /// Range start (YYYY-MM-DD or RFC 3339)
        #[arg(long, default_value = "")]
        from: String,
        /// Range end (YYYY-MM-DD or RFC 3339)
        #[arg(long, default_value = "")]
        to: String,
        #[arg(long, default_value_t = 50)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
    /// Show one visitor
    Show {
        id: u64,
    },
    /// Set a visitor's display name
    Rename {
        id: u64,
        name: String,
    },
    /// Most frequent visitors
    Top {
        #[arg(short, default_value_t = 10)]
        n: u32,
    },
    /// Print resolution events as they happen
    Watch,
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let connection = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    let proxy = ResolverProxy::new(&connection)
        .await
        .context("revisitd not reachable")?;

    match cli.command {
        Commands::Resolve { path } => {
            let observation = read_input(&path)?;
            print_json(&proxy.resolve(&observation).await?)?;
        }
        Commands::Stats { window_secs } => {
            print_json(&proxy.stats(window_secs).await?)?;
        }
        Commands::List => {
            print_json(&proxy.list_visitors().await?)?;
        }
        Commands::Visits {
            from,
            to,
            limit,
            offset,
        } => {
            print_json(&proxy.list_visits(&from, &to, limit, offset).await?)?;
        }
        Commands::Show { id } => {
            print_json(&proxy.get_visitor(id).await?)?;
        }
        Commands::Rename { id, name } => {
            print_json(&proxy.rename_visitor(id, &name).await?)?;
        }
        Commands::Top { n } => {
            print_json(&proxy.top_visitors(n).await?)?;
        }
        Commands::Watch => {
            let mut stream = proxy.receive_visitor_resolved().await?;
            tracing::debug!("subscribed to VisitorResolved");
            while let Some(signal) = stream.next().await {
                let args = signal.args()?;
                println!("{}", args.event());
            }
        }
        Commands::Status => {
            print_json(&proxy.status().await?)?;
        }
    }

    Ok(())
}

fn read_input(path: &PathBuf) -> Result<String> {
    if path.as_os_str() == "-" {
        return std::io::read_to_string(std::io::stdin()).context("reading stdin");
    }
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

/// Pretty-print a JSON reply from the daemon.
fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
