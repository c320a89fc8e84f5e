use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use doorman_cloud::{ObjectKey, ObjectStore, ObjectStoreError};
use doorman_core::{
    Config, CosineMatcher, EmbeddingBuilder, FaceAnalyzer, Matcher, OnnxFaceAnalyzer, Snapshot,
};
use doorman_hw::Camera;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "doorman", about = "Doorman smart-door CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a face image to the dataset (and the object store, if configured)
    Enroll {
        /// Identity the image belongs to
        #[arg(short, long)]
        person: String,
        /// Image file containing the person's face
        image: PathBuf,
        /// Keep the image local even when an object store is configured
        #[arg(long)]
        no_upload: bool,
    },
    /// Remove a face image from the dataset and the object store
    Remove {
        #[arg(short, long)]
        person: String,
        /// File name of the image inside the person's folder
        name: String,
    },
    /// Rebuild the embedding cache from the dataset
    Build,
    /// Match the faces in a still image against the embedding cache
    Verify {
        image: PathBuf,
    },
    /// List V4L2 capture devices
    Devices,
    /// Show the embedding cache summary
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("loading configuration")?;

    match cli.command {
        Commands::Enroll {
            person,
            image,
            no_upload,
        } => enroll(&config, &person, &image, no_upload).await,
        Commands::Remove { person, name } => remove(&config, &person, &name).await,
        Commands::Build => build(&config),
        Commands::Verify { image } => verify(&config, &image),
        Commands::Devices => {
            devices();
            Ok(())
        }
        Commands::Status => status(&config),
    }
}

fn load_analyzer(config: &Config) -> Result<OnnxFaceAnalyzer> {
    OnnxFaceAnalyzer::load(
        &config.scrfd_model_path(),
        &config.arcface_model_path(),
        config.detection_confidence,
    )
    .with_context(|| format!("loading face models from {}", config.model_dir.display()))
}

fn object_store(config: &Config) -> Result<Option<Box<dyn ObjectStore>>> {
    doorman_cloud::configured_store(
        config.firebase_bucket.as_deref(),
        config.firebase_token.as_deref(),
        config.object_store_dir.as_deref(),
    )
    .context("configuring object store")
}

async fn enroll(config: &Config, person: &str, image: &Path, no_upload: bool) -> Result<()> {
    let filename = image
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("{} has no usable file name", image.display()))?;
    let key = ObjectKey::new(person, filename)?;
    if !key.is_image() {
        bail!("{filename} is not a supported image type");
    }

    let bytes = std::fs::read(image).with_context(|| format!("reading {}", image.display()))?;
    let gray = image::load_from_memory(&bytes)
        .with_context(|| format!("decoding {}", image.display()))?
        .to_luma8();

    let mut analyzer = load_analyzer(config)?;
    let faces = analyzer.detect(&gray)?;
    if faces.is_empty() {
        bail!("no face detected in {}", image.display());
    }
    if faces.len() > 1 {
        println!(
            "warning: {} faces detected; the most confident one ({:.2}) will be used",
            faces.len(),
            faces[0].confidence
        );
    }

    let dest = key.local_path(&config.dataset_dir);
    if dest.exists() {
        bail!("{} already exists", dest.display());
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&dest, &bytes).with_context(|| format!("writing {}", dest.display()))?;
    println!("Enrolled {key} -> {}", dest.display());

    if !no_upload {
        if let Some(store) = object_store(config)? {
            store.upload(&key, bytes).await.context("uploading image")?;
            println!("Uploaded {key}");
        }
    }
    Ok(())
}

async fn remove(config: &Config, person: &str, name: &str) -> Result<()> {
    let key = ObjectKey::new(person, name)?;
    let mut removed = false;

    if let Some(store) = object_store(config)? {
        match store.delete(&key).await {
            Ok(()) => {
                println!("Deleted {key} from the object store");
                removed = true;
            }
            Err(ObjectStoreError::NotFound(_)) => {}
            Err(e) => return Err(e).context("deleting from the object store"),
        }
    }

    let local = key.local_path(&config.dataset_dir);
    match std::fs::remove_file(&local) {
        Ok(()) => {
            println!("Deleted {}", local.display());
            removed = true;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("deleting {}", local.display())),
    }

    if !removed {
        bail!("{key} not found");
    }
    Ok(())
}

fn build(config: &Config) -> Result<()> {
    let mut analyzer = load_analyzer(config)?;
    let snapshot = EmbeddingBuilder::new(config.augment)
        .build(&config.dataset_dir, &mut analyzer)
        .context("building embedding store")?;
    snapshot
        .persist(&config.cache_path)
        .context("writing embedding cache")?;

    println!(
        "Built {} embeddings for {} identities -> {}",
        snapshot.len(),
        snapshot.identities().len(),
        config.cache_path.display()
    );
    Ok(())
}

fn verify(config: &Config, image: &Path) -> Result<()> {
    let mut analyzer = load_analyzer(config)?;
    let snapshot = Snapshot::restore(&config.cache_path, analyzer.model_version())
        .context("loading embedding cache (run `doorman build` first)")?;
    let gray = image::open(image)
        .with_context(|| format!("decoding {}", image.display()))?
        .to_luma8();

    let faces = analyzer.detect(&gray)?;
    if faces.is_empty() {
        println!("no face detected");
        return Ok(());
    }

    let matcher = CosineMatcher;
    for (i, face) in faces.iter().enumerate() {
        let probe = match analyzer.embed(&gray, face).map(|e| e.normalized()) {
            Ok(Some(probe)) => probe,
            Ok(None) => {
                println!("face {i}: embedding has zero norm");
                continue;
            }
            Err(e) => {
                println!("face {i}: {e}");
                continue;
            }
        };
        let result = matcher.compare(&probe, &snapshot, config.threshold);
        match result.distance {
            Some(d) => println!("face {i}: {} (distance {d:.4})", result.display_text()),
            None => println!("face {i}: {}", result.display_text()),
        }
    }
    Ok(())
}

fn devices() {
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
        return;
    }
    for d in devices {
        println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }
}

fn status(config: &Config) -> Result<()> {
    println!("dataset:   {}", config.dataset_dir.display());
    println!("cache:     {}", config.cache_path.display());
    println!("threshold: {}", config.threshold);

    let snapshot = match Snapshot::restore(&config.cache_path, None) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            println!("cache:     unusable ({e})");
            return Ok(());
        }
    };
    println!("model:     {}", snapshot.model_version().unwrap_or("unknown"));
    println!("embeddings: {}", snapshot.len());
    for identity in snapshot.identities() {
        let count = snapshot.names().iter().filter(|n| *n == identity).count();
        println!("  {identity}: {count}");
    }
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
    fn test_parse_enroll() {
        let cli = Cli::try_parse_from(["doorman", "enroll", "--person", "alice", "front.jpg"]).unwrap();
        match cli.command {
            Commands::Enroll {
                person,
                image,
                no_upload,
            } => {
                assert_eq!(person, "alice");
                assert_eq!(image, PathBuf::from("front.jpg"));
                assert!(!no_upload);
            }
            _ => panic!("expected enroll"),
        }
    }
}
