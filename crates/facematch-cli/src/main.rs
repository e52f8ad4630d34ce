mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use facematch_core::classifier::{Classifier, ClassifierCache, SoftmaxTrainer};
use facematch_core::distance::{DistanceMatcher, Metric};
use facematch_core::detector::Detector;
use facematch_core::pipeline::{Identification, PipelineError, RecognitionPipeline, Registration};
use facematch_core::recognizer::{EmbeddingModel, OnnxEmbedder};
use facematch_core::store::IdentityStore;
use facematch_core::ScrfdDetector;
use image::RgbImage;
use std::path::{Path, PathBuf};

type Pipeline = RecognitionPipeline<ScrfdDetector, OnnxEmbedder>;

#[derive(Parser)]
#[command(name = "facematch", about = "Face registration and identification")]
struct Cli {
    /// TOML configuration file (default: FACEMATCH_* environment variables)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register the first face in an image
    Register {
        image: PathBuf,
        /// Identity name; derived from the file name when omitted
        /// (`name-lastname_2.jpg` → "Name Lastname")
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Register every image under DIR/<name>/
    Import { dir: PathBuf },
    /// Match every face in an image against registered identities
    Identify {
        image: PathBuf,
        #[arg(short, long)]
        metric: Option<Metric>,
        #[arg(short, long)]
        threshold: Option<f32>,
    },
    /// List registered identities
    List,
    /// Predict identities with the cached classifier
    Classify {
        image: PathBuf,
        /// Discard the cached classifier and train a new one
        #[arg(long)]
        retrain: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => Config::from_env().context("reading FACEMATCH_* environment")?,
    };

    match cli.command {
        Commands::Register { image, name } => {
            let name = match name {
                Some(name) => name,
                None => name_from_filename(&image)
                    .with_context(|| format!("cannot derive a name from {}", image.display()))?,
            };
            let mut store = open_store(&config)?;
            let mut pipeline = load_pipeline(&config)?;
            match pipeline.register_image(&load_image(&image)?, &name, &mut store)? {
                Registration::Added { id, .. } => {
                    store.flush_descriptors()?;
                    println!("Registered {name} (id {id})");
                }
                Registration::NoFaceDetected => println!("No face detected in {}", image.display()),
            }
        }
        Commands::Import { dir } => {
            let mut store = open_store(&config)?;
            let mut pipeline = load_pipeline(&config)?;
            let summary = import_folder(&mut pipeline, &dir, &mut store)?;
            store.flush_descriptors()?;
            println!(
                "Imported {} faces; {} images without a face, {} unreadable, {} failed",
                summary.added, summary.no_face, summary.unreadable, summary.failed
            );
        }
        Commands::Identify {
            image,
            metric,
            threshold,
        } => {
            let store = open_store(&config)?;
            let mut pipeline = load_pipeline(&config)?;
            let matcher = DistanceMatcher::new(
                metric.unwrap_or(config.metric),
                threshold.unwrap_or(config.threshold),
            );
            match pipeline.identify(&load_image(&image)?, &store, &matcher)? {
                Identification::NoFaceDetected => println!("No face detected"),
                Identification::Faces(faces) => {
                    for (i, face) in faces.iter().enumerate() {
                        let b = face.bbox;
                        let at = format!("({:.0}, {:.0}, {:.0}×{:.0})", b.x, b.y, b.width, b.height);
                        match &face.best {
                            Some(m) => println!(
                                "face {i} {at}: {} (id {}, {} {:.4})",
                                m.name, m.id, matcher.metric, m.distance
                            ),
                            None => println!("face {i} {at}: unknown"),
                        }
                    }
                }
            }
        }
        Commands::List => {
            let store = open_store(&config)?;
            if store.is_empty() {
                println!("No identities registered");
            }
            for (id, name) in store.identities() {
                println!("{id:>4}  {name}  ({} descriptors)", store.descriptors_of(id).len());
            }
        }
        Commands::Classify { image, retrain } => {
            let store = open_store(&config)?;
            let cache = ClassifierCache::new(&config.classifier_path);
            if retrain {
                cache.invalidate()?;
            }
            let model = cache.get_or_train(&store, &SoftmaxTrainer::default())?;
            let mut pipeline = load_pipeline(&config)?;
            let descriptors = pipeline.extract_descriptors(&load_image(&image)?, None)?;
            if descriptors.is_empty() {
                println!("No face detected");
            }
            for (i, descriptor) in descriptors.iter().enumerate() {
                let name = model
                    .predict(descriptor)
                    .and_then(|id| store.name_of(id))
                    .unwrap_or("unknown");
                println!("face {i}: {name}");
            }
        }
    }

    Ok(())
}

fn open_store(config: &Config) -> Result<IdentityStore> {
    IdentityStore::open(
        &config.names_path,
        &config.descriptors_path,
        config.corrupt_policy,
    )
    .context("opening identity store")
}

fn load_pipeline(config: &Config) -> Result<Pipeline> {
    let detector = ScrfdDetector::load(&config.detector_model_path())?
        .with_confidence_threshold(config.detector_confidence);
    let embedder = OnnxEmbedder::load(&config.embedder_model_path(), config.embedder_layout)?;
    Ok(RecognitionPipeline::new(detector, embedder, config.face_size)?)
}

fn load_image(path: &Path) -> Result<RgbImage> {
    Ok(image::open(path)
        .with_context(|| format!("reading image {}", path.display()))?
        .to_rgb8())
}

#[derive(Debug, Default, PartialEq)]
struct ImportSummary {
    added: usize,
    no_face: usize,
    unreadable: usize,
    /// Images whose face could not be aligned or embedded.
    failed: usize,
}

/// Register every visible image in every visible subdirectory of `dir`,
/// using the subdirectory name as the identity.
///
/// A per-image failure is logged and counted. Descriptors are flushed only on
/// a store error, so the caller still flushes once after a successful run.
fn import_folder<D: Detector, M: EmbeddingModel>(
    pipeline: &mut RecognitionPipeline<D, M>,
    dir: &Path,
    store: &mut IdentityStore,
) -> Result<ImportSummary> {
    let mut summary = ImportSummary::default();
    for (name, folder) in visible_entries(dir)? {
        if !folder.is_dir() {
            continue;
        }
        for (_, file) in visible_entries(&folder)? {
            let image = match load_image(&file) {
                Ok(image) => image,
                Err(e) => {
                    tracing::warn!(path = %file.display(), error = %e, "skipping unreadable image");
                    summary.unreadable += 1;
                    continue;
                }
            };
            match pipeline.register_image(&image, &name, store) {
                Ok(Registration::Added { .. }) => summary.added += 1,
                Ok(Registration::NoFaceDetected) => summary.no_face += 1,
                Err(PipelineError::Store(err)) => {
                    if let Err(flush_err) = store.flush_descriptors() {
                        tracing::error!(error = %flush_err, "could not save descriptors imported so far");
                    }
                    return Err(err).context("updating identity store");
                }
                Err(err) => {
                    tracing::warn!(path = %file.display(), error = %err, "skipping image");
                    summary.failed += 1;
                }
            }
        }
    }
    Ok(summary)
}

/// Entries of `dir` not starting with `.`, sorted by name.
fn visible_entries(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        entries.push((name, entry.path()));
    }
    entries.sort();
    Ok(entries)
}

/// `jane-doe_2.jpg` → `Jane Doe`. Trailing digits and underscores are dropped,
/// `-` and `_` separate words, and each word is capitalized.
fn name_from_filename(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let stem = stem.trim_end_matches(|c: char| c.is_ascii_digit() || c == '_');
    let words: Vec<String> = stem
        .split(['-', '_', ' '])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect();
    if words.is_empty() {
        None
    } else {
        Some(words.join(" "))
    }
}
