use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{
    classify_frame, CsvLedger, DirGallery, DistanceMatcher, FaceGallery, Ledger, OnnxEncoder,
    DEFAULT_MATCH_THRESHOLD,
};
use rollcall_hw::Camera;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rollcall", about = "rollcall face attendance: offline tools")]
struct Cli {
    /// Data directory holding faces/ and attendance/ (default: $XDG_DATA_HOME/rollcall)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List enrolled identities
    List,
    /// Show attendance events for one identity
    History {
        identity: String,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Classify the faces in a still image against the gallery
    Classify {
        image: PathBuf,
        #[arg(long, default_value_t = DEFAULT_MATCH_THRESHOLD)]
        threshold: f32,
        /// Downscale factor applied before encoding (1.0 = full size)
        #[arg(long, default_value_t = 1.0)]
        scale: f32,
        /// Directory with det_10g.onnx and w600k_r50.onnx (default: <data-dir>/models)
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
    /// List V4L2 capture devices
    Devices,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let data_dir = cli.data_dir.unwrap_or_else(rollcall_core::default_data_dir);

    match cli.command {
        Commands::List => {
            let gallery = DirGallery::new(rollcall_core::faces_dir(&data_dir));
            let identities = gallery.identities().context("failed to read gallery")?;
            if identities.is_empty() {
                println!("No faces enrolled in {}", gallery.dir().display());
            }
            for identity in identities {
                println!("{identity}");
            }
        }
        Commands::History { identity, json } => {
            let ledger = CsvLedger::new(rollcall_core::attendance_dir(&data_dir));
            let events = ledger
                .history(&identity)
                .with_context(|| format!("failed to read attendance for {identity}"))?;

            if json {
                println!("{}", serde_json::to_string_pretty(&events)?);
            } else if events.is_empty() {
                println!("No attendance recorded for {identity}");
            } else {
                for e in &events {
                    println!("{}  {}  {}", e.date, e.time.format("%H:%M:%S"), e.kind);
                }
            }
        }
        Commands::Classify {
            image,
            threshold,
            scale,
            model_dir,
        } => {
            let model_dir = model_dir.unwrap_or_else(|| data_dir.join("models"));
            let mut encoder = OnnxEncoder::load(&model_dir)
                .with_context(|| format!("failed to load face models from {}", model_dir.display()))?;
            let frame = image::open(&image)
                .with_context(|| format!("failed to open {}", image.display()))?
                .to_luma8();

            let gallery = DirGallery::new(rollcall_core::faces_dir(&data_dir));
            let known = gallery.load_all(&mut encoder).context("failed to load gallery")?;
            let matcher = DistanceMatcher::new(threshold);

            let result = classify_frame(&mut encoder, &matcher, &frame, &known, scale)?;

            println!("Identity: {}", result.identity);
            if let Some(distance) = result.distance {
                println!("Distance: {distance:.4} (threshold {threshold})");
            }
            println!("Faces:    {} ({} enrolled)", result.boxes.len(), known.len());
            for (i, b) in result.boxes.iter().enumerate() {
                println!(
                    "  [{i}] x={:.0} y={:.0} w={:.0} h={:.0} score={:.2}",
                    b.x, b.y, b.width, b.height, b.confidence
                );
            }
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
        }
    }

    Ok(())
}
