use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use truly_tagger::{Config, TaggingService};

#[derive(Parser)]
#[command(name = "truly-faces", about = "YoursTruly face tagging CLI")]
struct Cli {
    /// Library owner the command acts for
    #[arg(long, global = true, default_value = "local")]
    owner: String,
    /// SQLite database (overrides TRULY_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Model directory (overrides TRULY_MODEL_DIR)
    #[arg(long, global = true)]
    models: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect faces in an image and store them as untagged
    Analyze {
        /// Media ID the image is stored under
        media_id: String,
        /// Image file
        path: PathBuf,
        /// MIME type (guessed from the extension when omitted)
        #[arg(long)]
        mime: Option<String>,
    },
    /// List the faces of an image with contact suggestions
    Faces { media_id: String },
    /// Tag a face with a contact
    Tag { face_id: String, contact_id: String },
    /// Remove a face's tag
    Untag { face_id: String },
    /// List confirmed faces of a contact
    Contact { contact_id: String },
    /// List contacts usable for suggestions
    Known,
    /// Forget every face of a deleted image
    Forget { media_id: String },
    /// Show model and database status
    Status,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn guess_mime(path: &Path) -> Option<String> {
    image::ImageFormat::from_path(path)
        .ok()
        .map(|f| f.to_mime_type().to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env().context("loading configuration")?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    if let Some(models) = cli.models {
        config.model_dir = models;
    }

    let service = TaggingService::open(&config)
        .with_context(|| format!("opening face store at {}", config.db_path.display()))?;
    let owner = cli.owner.as_str();

    match cli.command {
        Commands::Analyze { media_id, path, mime } => {
            let bytes = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            let mime = mime.or_else(|| guess_mime(&path));
            let outcome = service.analyze_media(owner, &media_id, bytes, mime).await?;
            tracing::info!(media_id = %outcome.media_id, faces = outcome.faces.len(), "analysis stored");
            print_json(&outcome)?;
        }
        Commands::Faces { media_id } => {
            print_json(&service.faces_with_suggestions(owner, &media_id)?)?;
        }
        Commands::Tag { face_id, contact_id } => {
            print_json(&service.tag_face(owner, &face_id, &contact_id)?)?;
        }
        Commands::Untag { face_id } => {
            print_json(&service.untag_face(owner, &face_id)?)?;
        }
        Commands::Contact { contact_id } => {
            print_json(&service.faces_of_contact(owner, &contact_id)?)?;
        }
        Commands::Known => {
            print_json(&service.known_contacts(owner)?)?;
        }
        Commands::Forget { media_id } => {
            let removed = service.forget_media(owner, &media_id)?;
            print_json(&serde_json::json!({ "media_id": media_id, "removed": removed }))?;
        }
        Commands::Status => {
            let status = service.status().await?;
            print_json(&serde_json::json!({
                "db_path": config.db_path,
                "analyzer": status,
            }))?;
        }
    }

    Ok(())
}
