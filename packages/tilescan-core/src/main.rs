use anyhow::Context;
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use tilescan_core::{export_archive, parse_drawn_area, Pipeline, PipelineConfig, Renderer, Session, SessionEvent};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(version, about = "Find mapped features inside a drawn area and decode their detections", long_about = None)]
struct Cli {
    // GeoJSON file with the drawn area
    #[arg(short, long)]
    polygon: PathBuf,
    // TOML pipeline config
    #[arg(short, long)]
    config: Option<PathBuf>,
    // Write the enriched features as a GeoJSON FeatureCollection
    #[arg(short, long)]
    output: Option<PathBuf>,
    // Render detections over their images and pack them into a zip archive
    #[arg(short, long)]
    archive: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .try_init();

    let args = Cli::parse();
    let config = match &args.config {
        Some(path) => PipelineConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => {
            let mut config = PipelineConfig::default();
            config.apply_env();
            config
        }
    };
    if config.access_token.is_empty() {
        warn!("no access token configured, requests will likely be rejected");
    }

    let geojson = std::fs::read_to_string(&args.polygon)
        .with_context(|| format!("reading {}", args.polygon.display()))?;
    let area = parse_drawn_area(&geojson)?;

    let renderer = Renderer::from_config(&config)?;
    let pipeline = Pipeline::from_config(config)?;
    let mut session = Session::new("cli");
    session.handle(SessionEvent::PolygonSubmitted(area))?;

    // Ctrl+C cancels the running search
    let cancellations = session.cancellations();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancellations.cancel_token("cli");
        }
    });

    let report = session.search(&pipeline).await?.clone();
    println!("{}", report.summary());

    if let Some(path) = &args.output {
        let body = serde_json::to_string_pretty(&report.to_feature_collection())?;
        std::fs::write(path, body).with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "features written");
    }

    if let Some(path) = &args.archive {
        let images: HashMap<String, Vec<u8>> = pipeline.fetch_images(&report.features).await.into_iter().collect();
        let entries = renderer.archive_entries(&report.features, &images);
        if entries.is_empty() {
            warn!("no images to archive");
        } else {
            let bytes = export_archive(&entries)?;
            std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), entries = entries.len(), "archive written");
        }
    }

    Ok(())
}
