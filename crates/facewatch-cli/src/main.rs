use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "facewatch", about = "facewatch face registry CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// Pause live capture
    Pause,
    /// Resume live capture
    Resume,
    /// Stage the unknown faces of the current frame for registration
    Stage {
        /// Default name for every staged face
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Name a staged face
    Label {
        /// Index from the `stage` listing
        index: u32,
        name: String,
    },
    /// Commit the staged faces to the registry
    Commit,
    /// Discard the staged faces and resume capture
    Cancel,
    /// List registered labels
    List,
    /// Remove every embedding registered under a label
    Remove { label: String },
    /// Print the annotated faces of the latest frame
    Detections,
    /// Register faces from a directory laid out as <dir>/<name>/<image>
    Import { dir: PathBuf },
    /// List local V4L2 capture devices (bypasses the daemon)
    Devices,
}

#[zbus::proxy(
    interface = "org.facewatch.Registry1",
    default_service = "org.facewatch.Registry1",
    default_path = "/org/facewatch/Registry1"
)]
trait Registry {
    async fn status(&self) -> zbus::Result<String>;
    async fn pause(&self) -> zbus::Result<()>;
    async fn resume(&self) -> zbus::Result<()>;
    async fn stage_registration(&self, placeholder: &str) -> zbus::Result<String>;
    async fn assign_label(&self, index: u32, label: &str) -> zbus::Result<()>;
    async fn commit_registration(&self) -> zbus::Result<String>;
    async fn cancel_registration(&self) -> zbus::Result<()>;
    async fn list_labels(&self) -> zbus::Result<String>;
    async fn remove_label(&self, label: &str) -> zbus::Result<u32>;
    async fn latest_detections(&self) -> zbus::Result<String>;
    async fn import_directory(&self, path: &str) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Commands::Devices = cli.command {
        let devices = facewatch_hw::Camera::list_devices();
        if devices.is_empty() {
            println!("No capture devices found");
        }
        for dev in devices {
            println!("{}\t{} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
        }
        return Ok(());
    }

    let conn = zbus::Connection::session()
        .await
        .context("connecting to the session bus")?;
    let proxy = RegistryProxy::new(&conn)
        .await
        .context("facewatchd is not reachable")?;
    tracing::debug!("connected to facewatchd");

    match cli.command {
        Commands::Status => print_json(&proxy.status().await?)?,
        Commands::Pause => {
            proxy.pause().await?;
            println!("Capture paused");
        }
        Commands::Resume => {
            proxy.resume().await?;
            println!("Capture resumed");
        }
        Commands::Stage { name } => {
            let staged = proxy
                .stage_registration(name.as_deref().unwrap_or(""))
                .await?;
            print_json(&staged)?;
        }
        Commands::Label { index, name } => {
            proxy.assign_label(index, &name).await?;
            println!("Face {index} labelled {name}");
        }
        Commands::Commit => print_json(&proxy.commit_registration().await?)?,
        Commands::Cancel => {
            proxy.cancel_registration().await?;
            println!("Registration cancelled");
        }
        Commands::List => print_json(&proxy.list_labels().await?)?,
        Commands::Remove { label } => {
            let removed = proxy.remove_label(&label).await?;
            println!("Removed {removed} embedding(s) for {label}");
        }
        Commands::Detections => print_json(&proxy.latest_detections().await?)?,
        Commands::Import { dir } => {
            let dir = std::fs::canonicalize(&dir)
                .with_context(|| format!("resolving {}", dir.display()))?;
            let path = dir
                .to_str()
                .with_context(|| format!("{} is not valid UTF-8", dir.display()))?;
            print_json(&proxy.import_directory(path).await?)?;
        }
        // handled above without a bus connection
        Commands::Devices => {}
    }

    Ok(())
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(raw).context("daemon returned malformed JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_stage_with_name() {
        let cli = Cli::try_parse_from(["facewatch", "stage", "--name", "Bob"]).unwrap();
        assert!(matches!(cli.command, Commands::Stage { name: Some(n) } if n == "Bob"));
    }

    #[test]
    fn test_parse_label() {
        let cli = Cli::try_parse_from(["facewatch", "label", "1", "Alice"]).unwrap();
        assert!(matches!(cli.command, Commands::Label { index: 1, name } if name == "Alice"));
    }

    #[test]
    fn test_parse_import() {
        let cli = Cli::try_parse_from(["facewatch", "import", "data"]).unwrap();
        assert!(matches!(cli.command, Commands::Import { dir } if dir == PathBuf::from("data")));
    }

    #[test]
    fn test_label_rejects_negative_index() {
        assert!(Cli::try_parse_from(["facewatch", "label", "-1", "Alice"]).is_err());
    }
}
