use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rollcall_hw::V4l2Camera;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[zbus::proxy(
    interface = "org.freedesktop.Rollcall1",
    default_service = "org.freedesktop.Rollcall1",
    default_path = "/org/freedesktop/Rollcall1",
    gen_blocking = false
)]
trait Rollcall {
    fn reload_embeddings(&self) -> zbus::Result<u32>;
    fn set_attendance_session(&self, session_id: i64) -> zbus::Result<()>;
    fn clear_attendance_session(&self) -> zbus::Result<()>;
    fn create_attendance_session(&self, name: &str) -> zbus::Result<i64>;
    fn attendance_records(&self, session_id: i64) -> zbus::Result<String>;
    fn add_identity(&self, display_name: &str) -> zbus::Result<i64>;
    fn set_identity_active(&self, identity_id: i64, active: bool) -> zbus::Result<()>;
    fn stop_recognition(&self) -> zbus::Result<bool>;
    fn stop_preview(&self) -> zbus::Result<bool>;
    fn enroll(&self, identity_id: i64) -> zbus::Result<String>;
    fn import_photos(&self, identity_id: i64, dir: &str) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session_bus: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List V4L2 capture devices (does not need the daemon)
    Devices,
    /// Show daemon status
    Status,
    /// Reload enrolled embeddings from the database
    Reload,
    /// Stop a running stream
    Stop {
        #[arg(value_enum)]
        stream: StreamKind,
    },
    /// Choose the attendance session for the next recognition stream
    Attend {
        /// Attendance session id
        #[arg(required_unless_present = "clear", conflicts_with = "clear")]
        session_id: Option<i64>,
        /// Stop marking attendance
        #[arg(long)]
        clear: bool,
    },
    /// Manage attendance sessions
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Manage enrolled people
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },
    /// Capture one face sample for an identity and store it
    Enroll {
        /// Identity id from `rollcall identity add`
        identity_id: i64,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Create a session and print its id
    Create { name: String },
    /// Print the attendance recorded in a session
    Records { session_id: i64 },
}

#[derive(Subcommand)]
enum IdentityAction {
    /// Register a person and print their identity id
    Add { name: String },
    /// Include an identity in recognition again
    Enable { identity_id: i64 },
    /// Exclude an identity from recognition
    Disable { identity_id: i64 },
    /// Enroll the faces found in a folder of photos
    Import {
        identity_id: i64,
        /// Folder of .jpg, .jpeg, .png or .bmp pictures of this person
        dir: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StreamKind {
    Recognition,
    Preview,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Commands::Devices = cli.command {
        return list_devices();
    }

    let connection = if cli.session_bus {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("cannot connect to D-Bus")?;
    let proxy = RollcallProxy::new(&connection)
        .await
        .context("rollcalld is not reachable; is the daemon running?")?;

    match cli.command {
        Commands::Devices => unreachable!("handled above"),
        Commands::Status => {
            let status = proxy.status().await?;
            let value: serde_json::Value = serde_json::from_str(&status).context("malformed status")?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Reload => {
            let count = proxy.reload_embeddings().await?;
            println!("{count} embeddings loaded");
        }
        Commands::Stop { stream } => {
            let was_running = match stream {
                StreamKind::Recognition => proxy.stop_recognition().await?,
                StreamKind::Preview => proxy.stop_preview().await?,
            };
            if was_running {
                println!("stop requested");
            } else {
                println!("stream was not running");
            }
        }
        Commands::Attend { session_id, clear } => match (session_id, clear) {
            (_, true) => {
                proxy.clear_attendance_session().await?;
                println!("attendance marking off");
            }
            (Some(id), false) => {
                proxy.set_attendance_session(id).await?;
                println!("next recognition stream marks attendance for session {id}");
            }
            (None, false) => bail!("give a session id or --clear"),
        },
        Commands::Session { action } => match action {
            SessionAction::Create { name } => {
                let id = proxy.create_attendance_session(&name).await?;
                println!("{id}");
            }
            SessionAction::Records { session_id } => {
                let records = proxy.attendance_records(session_id).await?;
                let value: serde_json::Value = serde_json::from_str(&records).context("malformed records")?;
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
        },
        Commands::Identity { action } => match action {
            IdentityAction::Add { name } => {
                let id = proxy.add_identity(&name).await?;
                println!("{id}");
            }
            IdentityAction::Enable { identity_id } => {
                proxy.set_identity_active(identity_id, true).await?;
                println!("identity {identity_id} enabled");
            }
            IdentityAction::Disable { identity_id } => {
                proxy.set_identity_active(identity_id, false).await?;
                println!("identity {identity_id} disabled");
            }
            IdentityAction::Import { identity_id, dir } => {
                // the daemon only accepts absolute paths
                let dir = std::fs::canonicalize(&dir).with_context(|| format!("cannot open {}", dir.display()))?;
                let dir = dir.to_str().context("photo folder path is not valid UTF-8")?;
                let result = proxy.import_photos(identity_id, dir).await?;
                let value: serde_json::Value = serde_json::from_str(&result).context("malformed import result")?;
                let imported = value["imported"].as_array().map_or(0, Vec::len);
                println!("imported {imported} face(s) for identity {identity_id}");
                for skipped in value["skipped"].as_array().into_iter().flatten() {
                    println!("  skipped {}: {}", skipped["photo"], skipped["reason"]);
                }
            }
        },
        Commands::Enroll { identity_id } => {
            println!("Look at the camera...");
            let result = proxy.enroll(identity_id).await?;
            let value: serde_json::Value = serde_json::from_str(&result).context("malformed enroll result")?;
            println!(
                "stored encoding {} (quality {:.2}) photo {}",
                value["encoding_id"], value["quality"].as_f64().unwrap_or_default(), value["photo"]
            );
        }
    }

    Ok(())
}

fn list_devices() -> Result<()> {
    let devices = V4l2Camera::list_devices();
    if devices.is_empty() {
        println!("no V4L2 capture devices found");
        return Ok(());
    }
    for device in devices {
        println!("{}  {} ({}, {})", device.path, device.name, device.driver, device.bus);
    }
    tracing::debug!("device listing complete");
    Ok(())
}
