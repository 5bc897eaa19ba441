use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use docqa::config::UploadConfig;
use docqa::models::{UploadStatus, UploadedFile};
use docqa::{AppConfig, AppState};

#[derive(Parser, Debug)]
#[command(name = "ingest")]
#[command(about = "Index PDF files or folders of PDFs without going through the web UI")]
struct Cli {
    /// Files or directories to ingest.
    #[arg(required = true)]
    paths: Vec<PathBuf>,
    /// Only descend this many directory levels.
    #[arg(long)]
    max_depth: Option<usize>,
    /// List the files that would be ingested and exit.
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let files = discover(&cli.paths, &config.upload, cli.max_depth)?;
    if files.is_empty() {
        anyhow::bail!("no PDF files found");
    }

    if cli.dry_run {
        for path in &files {
            println!("{}", path.display());
        }
        println!("{} files", files.len());
        return Ok(());
    }

    let state = AppState::from_config(config)
        .await
        .context("failed to initialise services")?;

    let mut indexed = 0usize;
    let mut skipped = 0usize;
    let mut failed = 0usize;
    for path in &files {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed reading {}", path.display()))?;
        let upload = UploadedFile {
            filename: path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default(),
            content_type: None,
            bytes,
        };

        for outcome in state.ingestor.ingest_batch(vec![upload]).await? {
            match outcome.status {
                UploadStatus::Indexed => indexed += 1,
                UploadStatus::Duplicate | UploadStatus::Rejected => skipped += 1,
                UploadStatus::Failed => failed += 1,
            }
            println!(
                "[{}] {} chunks={} {}",
                outcome.status.as_str(),
                path.display(),
                outcome.chunk_count,
                outcome.message.unwrap_or_default()
            );
        }
    }

    println!("Ingest complete. indexed={indexed} skipped={skipped} failed={failed}");
    if failed > 0 {
        anyhow::bail!("{failed} files failed to ingest");
    }
    Ok(())
}

/// Expands the given paths into the files to ingest, sorted and without
/// duplicates. Directories are walked; files with other extensions are skipped.
fn discover(
    paths: &[PathBuf],
    upload: &UploadConfig,
    max_depth: Option<usize>,
) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_file() {
            if is_candidate(path, upload) {
                files.push(path.clone());
            } else {
                tracing::warn!("skipping {}: not an allowed file type", path.display());
            }
            continue;
        }
        if !path.is_dir() {
            anyhow::bail!("{} does not exist", path.display());
        }

        let mut walker = WalkDir::new(path).follow_links(true);
        if let Some(depth) = max_depth {
            walker = walker.max_depth(depth);
        }
        for entry in walker {
            let entry = entry.with_context(|| format!("failed walking {}", path.display()))?;
            if entry.file_type().is_file() && is_candidate(entry.path(), upload) {
                files.push(entry.into_path());
            }
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

fn is_candidate(path: &Path, upload: &UploadConfig) -> bool {
    path.file_name()
        .map(|name| upload.is_allowed_extension(&name.to_string_lossy()))
        .unwrap_or(false)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
