use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

// Enrollment runs face analysis in the daemon, so allow for slow models.
const METHOD_TIMEOUT: Duration = Duration::from_secs(60);

#[zbus::proxy(
    interface = "org.lookout.Lookout1",
    default_service = "org.lookout.Lookout1",
    default_path = "/org/lookout/Lookout1"
)]
trait Lookout {
    async fn add_face(&self, name: &str, image_path: &str) -> zbus::Result<String>;
    async fn remove_face(&self, name: &str) -> zbus::Result<bool>;
    async fn list_known(&self) -> zbus::Result<String>;
    async fn list_pending(&self) -> zbus::Result<String>;
    async fn promote(&self, capture_id: &str, name: &str) -> zbus::Result<String>;
    async fn clean(&self, days: u32) -> zbus::Result<u32>;
    async fn backup(&self) -> zbus::Result<String>;
    async fn reload(&self) -> zbus::Result<u32>;
    async fn set_notifications(&self, enabled: bool) -> zbus::Result<bool>;
    async fn set_capture_unknown(&self, enabled: bool) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "lookout", about = "Lookout face gallery CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    /// Print raw JSON responses
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

impl Toggle {
    fn enabled(self) -> bool {
        matches!(self, Toggle::On)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a known face from an image file
    Add {
        /// Name to greet this person by
        name: String,
        /// Image containing exactly one face (.jpg, .jpeg or .png)
        image: PathBuf,
    },
    /// Remove a known face
    Remove { name: String },
    /// List known faces
    ListKnown,
    /// List captured unknown faces awaiting review
    ListPending,
    /// Enroll a pending capture as a known face
    Promote {
        /// Capture id as shown by list-pending
        capture_id: String,
        name: String,
    },
    /// Delete unpromoted captures older than the given age
    Clean {
        #[arg(long, default_value_t = 30)]
        days: u32,
    },
    /// Snapshot known and pending faces into a read-only backup
    Backup,
    /// Re-read known faces from disk
    Reload,
    /// Enable or disable greetings
    Notifications { state: Toggle },
    /// Enable or disable saving unknown faces
    Capture { state: Toggle },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let bus = if cli.session { "session" } else { "system" };
    tracing::debug!(bus, "connecting to lookoutd");
    let builder = if cli.session {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let conn = builder
        .method_timeout(METHOD_TIMEOUT)
        .build()
        .await
        .context("failed to connect to D-Bus")?;
    let proxy = LookoutProxy::new(&conn)
        .await
        .context("lookoutd is not reachable")?;

    match cli.command {
        Commands::Add { name, image } => {
            // The daemon resolves paths from its own working directory.
            let image = image
                .canonicalize()
                .with_context(|| format!("cannot read {}", image.display()))?;
            tracing::debug!(name = %name, image = %image.display(), "requesting enrollment");
            let reply = proxy.add_face(&name, &image.to_string_lossy()).await?;
            print_entry(cli.json, "added", &reply)?;
        }
        Commands::Remove { name } => {
            proxy.remove_face(&name).await?;
            println!("removed {name}");
        }
        Commands::ListKnown => {
            let reply = proxy.list_known().await?;
            if cli.json {
                print_pretty(&reply)?;
            } else {
                print_known(&reply)?;
            }
        }
        Commands::ListPending => {
            let reply = proxy.list_pending().await?;
            if cli.json {
                print_pretty(&reply)?;
            } else {
                print_pending(&reply)?;
            }
        }
        Commands::Promote { capture_id, name } => {
            let reply = proxy.promote(&capture_id, &name).await?;
            print_entry(cli.json, "promoted to", &reply)?;
        }
        Commands::Clean { days } => {
            let removed = proxy.clean(days).await?;
            println!("removed {removed} pending capture(s) older than {days} day(s)");
        }
        Commands::Backup => {
            let reply = proxy.backup().await?;
            if cli.json {
                print_pretty(&reply)?;
            } else {
                let manifest: serde_json::Value = serde_json::from_str(&reply)?;
                println!(
                    "backup {}: {} known, {} pending",
                    text(&manifest["snapshot_id"]),
                    manifest["known"],
                    manifest["pending"]
                );
            }
        }
        Commands::Reload => {
            let count = proxy.reload().await?;
            println!("gallery reloaded: {count} known face(s)");
        }
        Commands::Notifications { state } => {
            let enabled = proxy.set_notifications(state.enabled()).await?;
            println!("notifications {}", if enabled { "on" } else { "off" });
        }
        Commands::Capture { state } => {
            let enabled = proxy.set_capture_unknown(state.enabled()).await?;
            println!("unknown capture {}", if enabled { "on" } else { "off" });
        }
        Commands::Status => {
            print_pretty(&proxy.status().await?)?;
        }
    }

    Ok(())
}

fn print_pretty(reply: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(reply).map_err(|e| {
        tracing::warn!(error = %e, reply, "unparsable daemon reply");
        anyhow::anyhow!("daemon sent invalid JSON: {e}")
    })?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn print_entry(json: bool, verb: &str, reply: &str) -> Result<()> {
    if json {
        return print_pretty(reply);
    }
    let entry: serde_json::Value = serde_json::from_str(reply).context("daemon sent invalid JSON")?;
    println!("{verb} {}", text(&entry["name"]));
    Ok(())
}

fn print_known(reply: &str) -> Result<()> {
    let known: Vec<serde_json::Value> = serde_json::from_str(reply).context("daemon sent invalid JSON")?;
    if known.is_empty() {
        println!("no known faces");
    }
    for entry in &known {
        println!("{:<24} {}", text(&entry["name"]), text(&entry["created_at"]));
    }
    Ok(())
}

fn print_pending(reply: &str) -> Result<()> {
    let pending: Vec<serde_json::Value> = serde_json::from_str(reply).context("daemon sent invalid JSON")?;
    if pending.is_empty() {
        println!("no pending captures");
    }
    for entry in &pending {
        let status = match entry["promoted"]["to"].as_str() {
            Some(name) => format!("promoted to {name}"),
            None => "pending".into(),
        };
        println!(
            "{:<26} {:<32} {}",
            text(&entry["capture_id"]),
            text(&entry["observed_at"]),
            status
        );
    }
    Ok(())
}

fn text(value: &serde_json::Value) -> &str {
    value.as_str().unwrap_or("-")
}
