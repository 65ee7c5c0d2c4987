use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

#[derive(Parser)]
#[command(name = "facevault", about = "Facevault face gallery CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register every face found in the given images
    Register {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Maximum distance at which a face counts as already registered
        #[arg(short, long, default_value_t = 0.4)]
        tolerance: f64,
    },
    /// List gallery matches for every face in the given images
    Recognize {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(short, long, default_value_t = 0.4)]
        tolerance: f64,
    },
    /// Save the stored face crop of an identity
    Image {
        id: i64,
        /// Output path for the JPEG
        #[arg(short, long)]
        output: PathBuf,
    },
    /// List registered identities
    List,
    /// Show daemon status
    Status,
    /// Measure recognition accuracy over a directory of labelled images
    Evaluate {
        dir: PathBuf,
        /// File-name prefix and the identity it should match, e.g. "musk=5"
        #[arg(short, long = "label", value_parser = parse_label, required = true)]
        labels: Vec<(String, i64)>,
        #[arg(short, long, default_value_t = 0.4)]
        tolerance: f64,
    },
}

#[zbus::proxy(
    interface = "org.facevault.Gallery1",
    default_service = "org.facevault.Gallery1",
    default_path = "/org/facevault/Gallery1"
)]
trait Gallery {
    async fn register_faces(&self, images: Vec<(String, Vec<u8>)>, tolerance: f64) -> zbus::Result<String>;
    async fn recognize_faces(&self, images: Vec<(String, Vec<u8>)>, tolerance: f64) -> zbus::Result<String>;
    async fn face_image(&self, identity: i64) -> zbus::Result<Vec<u8>>;
    async fn list_faces(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = GalleryProxy::new(&conn)
        .await
        .context("facevaultd is not reachable")?;

    match cli.command {
        Commands::Register { files, tolerance } => {
            let images = read_images(&files)?;
            let reply = proxy.register_faces(images, tolerance).await?;
            print_json(&reply)?;
        }
        Commands::Recognize { files, tolerance } => {
            let images = read_images(&files)?;
            let reply = proxy.recognize_faces(images, tolerance).await?;
            print_json(&reply)?;
        }
        Commands::Image { id, output } => {
            let jpeg = proxy.face_image(id).await?;
            std::fs::write(&output, &jpeg)
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!("Saved face {id} ({} bytes) to {}", jpeg.len(), output.display());
        }
        Commands::List => {
            let entries: Value = serde_json::from_str(&proxy.list_faces().await?)?;
            let entries = entries.as_array().cloned().unwrap_or_default();
            if entries.is_empty() {
                println!("No faces registered");
            }
            for entry in entries {
                println!(
                    "{:>6}  {:<16}  {}",
                    entry["identity"],
                    entry["display_name"].as_str().unwrap_or("-"),
                    entry["created_at"].as_str().unwrap_or("-"),
                );
            }
        }
        Commands::Status => {
            print_json(&proxy.status().await?)?;
        }
        Commands::Evaluate {
            dir,
            labels,
            tolerance,
        } => {
            evaluate(&proxy, &dir, &labels, tolerance).await?;
        }
    }

    Ok(())
}

async fn evaluate(
    proxy: &GalleryProxy<'_>,
    dir: &Path,
    labels: &[(String, i64)],
    tolerance: f64,
) -> Result<()> {
    let mut tally = Tally::default();

    for path in image_files(dir)? {
        let name = file_name(&path);
        let Some(expected) = expected_identity(&name, labels) else {
            println!("{name}: skipped, no matching label prefix");
            continue;
        };

        let bytes = std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        tracing::debug!(file = %name, expected, "recognizing");
        let reply = match proxy.recognize_faces(vec![(name.clone(), bytes)], tolerance).await {
            Ok(reply) => reply,
            Err(e) => {
                println!("{name}: request failed: {e}");
                continue;
            }
        };
        let reports: Value = serde_json::from_str(&reply)?;
        for (face, predicted) in predicted_identities(&reports).into_iter().enumerate() {
            let hit = predicted.contains(&expected);
            tally.record(hit);
            println!(
                "{name} face {}: {} (expected {expected}, got {predicted:?})",
                face + 1,
                if hit { "correct" } else { "wrong" },
            );
        }
    }

    match tally.accuracy() {
        Some(pct) => println!("\nAccuracy: {pct:.2}% ({} of {} faces)", tally.correct, tally.total),
        None => println!("\nNo faces evaluated"),
    }
    Ok(())
}

#[derive(Debug, Default, PartialEq)]
struct Tally {
    correct: usize,
    total: usize,
}

impl Tally {
    fn record(&mut self, hit: bool) {
        self.total += 1;
        if hit {
            self.correct += 1;
        }
    }

    fn accuracy(&self) -> Option<f64> {
        (self.total > 0).then(|| self.correct as f64 * 100.0 / self.total as f64)
    }
}

fn parse_label(s: &str) -> Result<(String, i64), String> {
    let (prefix, id) = s
        .rsplit_once('=')
        .ok_or_else(|| format!("expected PREFIX=ID, got {s:?}"))?;
    if prefix.is_empty() {
        return Err("label prefix is empty".to_string());
    }
    let id = id.trim().parse().map_err(|_| format!("invalid identity {id:?}"))?;
    Ok((prefix.to_lowercase(), id))
}

/// First label whose prefix starts the file name, case-insensitively.
fn expected_identity(file_name: &str, labels: &[(String, i64)]) -> Option<i64> {
    let lower = file_name.to_lowercase();
    labels
        .iter()
        .find(|(prefix, _)| lower.starts_with(prefix.as_str()))
        .map(|(_, id)| *id)
}

/// Matched identities for each reported face, across every file report.
fn predicted_identities(reports: &Value) -> Vec<Vec<i64>> {
    let mut faces = Vec::new();
    for report in reports.as_array().into_iter().flatten() {
        for face in report["faces"].as_array().into_iter().flatten() {
            let ids: Vec<i64> = face["matches"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|m| m["identity"].as_i64())
                .collect();
            faces.push(ids);
        }
    }
    faces
}

fn image_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file() && is_image(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn read_images(files: &[PathBuf]) -> Result<Vec<(String, Vec<u8>)>> {
    let mut images = Vec::with_capacity(files.len());
    for path in files {
        if !path.is_file() {
            bail!("{} is not a file", path.display());
        }
        let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        images.push((file_name(path), bytes));
    }
    Ok(images)
}

fn print_json(reply: &str) -> Result<()> {
    let value: Value = serde_json::from_str(reply).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
