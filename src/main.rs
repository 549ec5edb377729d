//! warpcache - precision and throughput report for transform adapters
//!
//! Builds the lens distortion described by the configuration, wraps it in the
//! requested adapters, then measures how closely each adapter follows the
//! exact model and how fast it resamples an image into a compressed pool.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use warpcache::config::Config;
use warpcache::distortion::RadialDistortion;
use warpcache::grid::ProjectiveGridAdapter;
use warpcache::mesh::Mesh;
use warpcache::mesh_adapter::{AffineFitter, ProjectiveMeshAdapter};
use warpcache::pool::{CountLimitedPool, ZlibCompressor};
use warpcache::precision::{study_reversibility_over, PrecisionReport, TransfoModelAdapter};
use warpcache::resample::{checkerboard, warp_into_pool, RasterLayout, WarpStats};
use warpcache::TransfoModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AdapterChoice {
    Grid,
    Mesh,
    All,
}

/// warpcache - approximate expensive coordinate transforms with cached models
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "warpcache.toml")]
    config: PathBuf,

    /// Adapters to study
    #[arg(short, long, value_enum, default_value_t = AdapterChoice::All)]
    adapter: AdapterChoice,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Serialize)]
struct WarpReport {
    #[serde(flatten)]
    stats: WarpStats,
    elapsed_ms: f64,
    pool_total_used: usize,
    compressed_rows: usize,
}

#[derive(Debug, Serialize)]
struct AdapterReport {
    name: &'static str,
    precision: PrecisionReport,
    reversibility: PrecisionReport,
    warp: WarpReport,
}

#[derive(Debug, Serialize)]
struct Report {
    exact_reversibility: PrecisionReport,
    exact_warp: WarpReport,
    adapters: Vec<AdapterReport>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("warpcache v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load_or_create(&args.config)?;
    let area = config.study.area();
    let step = config.study.step;
    let lens = RadialDistortion::from_config(&config.distortion);
    info!(
        "Study area {}x{} sampled every {} units",
        area.width(),
        area.height(),
        step
    );

    let layout = RasterLayout::new(area.width().ceil() as usize, area.height().ceil() as usize, 1);
    let image = checkerboard(layout, 16);

    let exact_reversibility = study_reversibility_over(&lens, &area, step)
        .context("Failed to study the exact model")?;
    let exact_warp = run_warp(&lens, &image, layout, &config)?;

    let mut adapters = Vec::new();
    if matches!(args.adapter, AdapterChoice::Grid | AdapterChoice::All) {
        let grid = ProjectiveGridAdapter::new(Box::new(lens.clone()), config.grid)
            .with_application_area(area);
        adapters.push(study_adapter("grid", &grid, &image, layout, &config)?);
    }
    if matches!(args.adapter, AdapterChoice::Mesh | AdapterChoice::All) {
        let (mesh, name) = if config.mesh.triangulated {
            (Mesh::triangulated(&area, config.mesh.rows, config.mesh.columns), "mesh-triangles")
        } else {
            (Mesh::regular(&area, config.mesh.rows, config.mesh.columns), "mesh")
        };
        let mut adapter =
            ProjectiveMeshAdapter::new(Box::new(lens.clone()), Arc::new(mesh), config.mesh.adapter);
        if config.mesh.triangulated {
            adapter = adapter.with_fitter(Box::new(AffineFitter));
        }
        adapter
            .create_models()
            .context("Failed to create mesh facet models")?;
        info!(
            "Mesh adapter kept {} of {} facets",
            adapter.direct_facet_count(),
            adapter.mesh().count_facets()
        );
        adapters.push(study_adapter(name, &adapter, &image, layout, &config)?);
    }

    let report = Report {
        exact_reversibility,
        exact_warp,
        adapters,
    };

    if args.json {
        let json = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
        println!("{}", json);
    } else {
        log_report(&report);
    }
    Ok(())
}

fn study_adapter<A: TransfoModelAdapter>(
    name: &'static str,
    adapter: &A,
    image: &[u8],
    layout: RasterLayout,
    config: &Config,
) -> Result<AdapterReport> {
    let area = config.study.area();
    let precision = adapter
        .study_precision_over(&area, config.study.step)
        .with_context(|| format!("Failed to study {} precision", name))?;
    let reversibility = study_reversibility_over(adapter, &area, config.study.step)
        .with_context(|| format!("Failed to study {} reversibility", name))?;
    let warp = run_warp(adapter, image, layout, config)?;
    Ok(AdapterReport {
        name,
        precision,
        reversibility,
        warp,
    })
}

fn run_warp(
    model: &dyn TransfoModel,
    image: &[u8],
    layout: RasterLayout,
    config: &Config,
) -> Result<WarpReport> {
    let pool = Arc::new(CountLimitedPool::with_compressor(
        config.pool.count_limit,
        Box::new(ZlibCompressor::new(config.pool.compression_level)),
    ));

    let started = Instant::now();
    let (rows, stats) =
        warp_into_pool(model, image, layout, layout, &pool).context("Failed to warp into pool")?;
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

    Ok(WarpReport {
        stats,
        elapsed_ms,
        pool_total_used: pool.total_used(),
        compressed_rows: rows.iter().filter(|row| row.is_compressed()).count(),
    })
}

fn log_report(report: &Report) {
    info!(
        "exact: reversibility max error {:.3e}, warp {:.1} ms",
        report.exact_reversibility.max_error, report.exact_warp.elapsed_ms
    );
    for adapter in &report.adapters {
        info!(
            "{}: mean error ({:.3e}, {:.3e}), max error {:.3e} over {} samples ({} rejected)",
            adapter.name,
            adapter.precision.mean_error_x,
            adapter.precision.mean_error_y,
            adapter.precision.max_error,
            adapter.precision.sample_count,
            adapter.precision.rejected_count
        );
        info!(
            "{}: reversibility max error {:.3e}, warp {:.1} ms, {} failed pixels, {} compressed rows",
            adapter.name,
            adapter.reversibility.max_error,
            adapter.warp.elapsed_ms,
            adapter.warp.stats.failed,
            adapter.warp.compressed_rows
        );
    }
}
