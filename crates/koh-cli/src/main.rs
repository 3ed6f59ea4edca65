use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use koh_core::codec;
use koh_core::engine::DetectedFace;
use koh_core::{BusKind, Config, Identity, PredictionResult, Recognizer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "pgm", "tif", "tiff"];

#[derive(Parser)]
#[command(name = "koh", about = "koh face corpus and recognition CLI")]
struct Cli {
    /// Corpus directory
    #[arg(long, global = true, env = "KOH_FACES_DIR")]
    faces_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train on the corpus (or another directory) and report the face count
    Train {
        /// Directory named like the corpus to train from instead
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Predict every face in an image
    Predict {
        image: PathBuf,
        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Add the face in an image to the corpus under an identity
    Enroll { identity: Identity, image: PathBuf },
    /// Print the next sequence number for an identity
    Next { identity: Identity },
    /// List identities and their record counts
    List,
    /// Predict every image in a directory and train on confident matches
    Sample { dir: PathBuf },
    /// Show daemon status
    Status,
}

// Async proxy for the daemon's review interface.
#[zbus::proxy(
    interface = "org.koh.Recognizer1",
    default_service = "org.koh.Recognizer1",
    default_path = "/org/koh/Recognizer1"
)]
trait Recognizer1 {
    async fn status(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(dir) = cli.faces_dir {
        config.faces_dir = dir;
    }

    match cli.command {
        Commands::Train { dir } => {
            let mut recognizer = Recognizer::from_config(&config)?;
            let trained = match &dir {
                Some(dir) => recognizer.bulk_train_from_dir(dir)?,
                None => recognizer.bulk_train_from_store()?,
            };
            let source = dir.as_deref().unwrap_or(&config.faces_dir);
            println!("Trained on {trained} faces from {}", source.display());
        }
        Commands::Predict { image, json } => {
            let mut recognizer = trained(&config)?;
            let results = recognizer.predict_in_file(&image)?;
            if json {
                let out: Vec<_> = results
                    .iter()
                    .map(|r| prediction_json(&recognizer, r))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else if results.is_empty() {
                println!("No faces found in {}", image.display());
            } else {
                for (i, r) in results.iter().enumerate() {
                    println!("{}", describe(i, r, recognizer.is_positive(r)));
                }
            }
        }
        Commands::Enroll { identity, image } => {
            let mut recognizer = Recognizer::from_config(&config)?;
            let frame = codec::load_grayscale(&image)
                .with_context(|| format!("failed to read {}", image.display()))?;
            let faces = recognizer.engine_mut().detect_faces(&frame)?;
            let Some(face) = largest(faces) else {
                bail!("no face found in {}", image.display());
            };
            recognizer.queue_face(identity.clone(), face.face);
            let path = recognizer.commit(&identity)?;
            println!("Enrolled {identity} as {}", path.display());
        }
        Commands::Next { identity } => {
            let store = config.store();
            println!("{}", store.next_sequence_number(&identity)?);
        }
        Commands::List => {
            let store = config.store();
            let mut counts: BTreeMap<Identity, usize> = BTreeMap::new();
            for record in store.records()? {
                *counts.entry(record.identity).or_default() += 1;
            }
            if counts.is_empty() {
                println!("No faces stored in {}", store.root().display());
            }
            for (identity, count) in counts {
                println!("{identity}\t{count}");
            }
        }
        Commands::Sample { dir } => {
            let mut recognizer = trained(&config)?;
            run_sample(&mut recognizer, &dir)?;
        }
        Commands::Status => {
            let conn = match BusKind::from_env() {
                BusKind::Session => zbus::Connection::session().await,
                BusKind::System => zbus::Connection::system().await,
            }
            .context("kohd: not connected")?;
            let proxy = Recognizer1Proxy::new(&conn).await?;
            let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}

fn trained(config: &Config) -> Result<Recognizer> {
    let mut recognizer = Recognizer::from_config(config)?;
    let faces = recognizer.bulk_train_from_store()?;
    if faces == 0 {
        bail!(
            "no faces to train on in {}; enroll some first",
            config.faces_dir.display()
        );
    }
    Ok(recognizer)
}

/// Predict every image in `dir`; accept and commit each positive match.
fn run_sample(recognizer: &mut Recognizer, dir: &Path) -> Result<()> {
    for path in image_files(dir)? {
        let results = match recognizer.predict_in_file(&path) {
            Ok(results) => results,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping sample image");
                continue;
            }
        };
        println!("{}:", path.display());
        for (i, r) in results.into_iter().enumerate() {
            let positive = recognizer.is_positive(&r);
            println!("  {}", describe(i, &r, positive));
            if positive {
                let identity = r.identity.clone();
                recognizer.accept(r);
                let saved = recognizer.commit(&identity)?;
                println!("    trained and saved {}", saved.display());
            }
        }
    }
    Ok(())
}

/// Image files directly inside `dir`, sorted by name.
fn image_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_image && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn largest(faces: Vec<DetectedFace>) -> Option<DetectedFace> {
    if faces.len() > 1 {
        tracing::warn!(count = faces.len(), "several faces found; using the largest");
    }
    faces.into_iter().max_by_key(|f| f.rect.area())
}

fn describe(index: usize, r: &PredictionResult, positive: bool) -> String {
    format!(
        "face {index}: {} (confidence {:.2}, {}) at {}x{}+{}+{}",
        r.identity,
        r.confidence,
        if positive { "match" } else { "no match" },
        r.rect.width,
        r.rect.height,
        r.rect.x,
        r.rect.y,
    )
}

fn prediction_json(recognizer: &Recognizer, r: &PredictionResult) -> serde_json::Value {
    serde_json::json!({
        "identity": r.identity,
        "confidence": r.confidence,
        "matched": recognizer.is_positive(r),
        "rect": r.rect,
    })
}
