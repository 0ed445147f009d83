use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum, ValueHint};
use pgi_attrs::ela::ElaMethod;
use pgi_attrs::{
    analyze_hypsometry, ela_aabr, estimate_all, process_batch, read_outlines_geojson, zonal_table,
    BatchOutput, ElevationHistogram, ElevationSample, GlacierAttributeRecord, Grid,
    GridRasterService, Layer, OffsetConvention, Outline, Params, ZonalStats, SENTINEL,
};
use serde_json::json;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Paleoglacier ELA and attribute CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Derive ELA, hypsometry, terrain and thickness attributes for glacier outlines
    Derive(DeriveArgs),
    /// Estimate ELAs for a plain list of elevations
    Ela(ElaArgs),
    /// Per-outline zonal statistics of a raster
    Zonal(ZonalArgs),
}

#[derive(Args, Debug)]
struct ParamArgs {
    /// JSON file with estimator parameters (flags override its values)
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Elevation bin width (m)
    #[arg(long)]
    interval: Option<i64>,

    /// Accumulation-area ratio for the AAR method
    #[arg(long)]
    aar_ratio: Option<f64>,

    /// Balance ratio for the AABR method
    #[arg(long)]
    aabr_ratio: Option<f64>,

    /// Calibration offsets applied to AA/AABR
    #[arg(long, value_enum)]
    offset_convention: Option<ConventionOpt>,
}

#[derive(Parser, Debug)]
struct DeriveArgs {
    /// Glacier outlines (GeoJSON Polygon/MultiPolygon features)
    #[arg(value_hint = ValueHint::FilePath)]
    outlines: PathBuf,

    /// Surface DEM (ESRI ASCII grid)
    #[arg(long, value_hint = ValueHint::FilePath)]
    surface: PathBuf,

    /// Ice thickness raster (ESRI ASCII grid)
    #[arg(long, value_hint = ValueHint::FilePath)]
    thickness: Option<PathBuf>,

    #[command(flatten)]
    params: ParamArgs,

    /// Reconstruction method label copied to every record
    #[arg(long)]
    rec_method: Option<String>,

    /// Glacial stage used in generated PGI_IDs
    #[arg(long)]
    stage: Option<String>,

    /// Outline coordinates are longitude/latitude degrees
    #[arg(long, action = ArgAction::SetTrue)]
    geographic: bool,

    /// Output CSV path (`-` for stdout)
    #[arg(short, long, default_value = "pgi_attributes.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Also write records and run summary as JSON
    #[arg(long, value_hint = ValueHint::FilePath)]
    json: Option<PathBuf>,

    /// Worker threads (defaults to all cores)
    #[arg(long)]
    threads: Option<usize>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct ElaArgs {
    /// Elevation list, whitespace or comma separated (`-` for stdin)
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    #[command(flatten)]
    params: ParamArgs,

    /// Print JSON instead of CSV
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct ZonalArgs {
    /// Outlines (GeoJSON)
    #[arg(value_hint = ValueHint::FilePath)]
    outlines: PathBuf,

    /// Raster to summarise (ESRI ASCII grid)
    #[arg(long, value_hint = ValueHint::FilePath)]
    raster: PathBuf,

    /// Output CSV path (`-` for stdout)
    #[arg(short, long, default_value = "zonal.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ConventionOpt {
    Revised,
    Legacy,
}

impl From<ConventionOpt> for OffsetConvention {
    fn from(value: ConventionOpt) -> Self {
        match value {
            ConventionOpt::Revised => OffsetConvention::Revised,
            ConventionOpt::Legacy => OffsetConvention::Legacy,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Derive(args) => args.verbose,
        Command::Ela(args) => args.verbose,
        Command::Zonal(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Derive(args) => handle_derive(args),
        Command::Ela(args) => handle_ela(args),
        Command::Zonal(args) => handle_zonal(args),
    }
}

fn load_params(args: &ParamArgs) -> Result<Params> {
    let mut params = match args.config.as_ref() {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str::<Params>(&text)
                .with_context(|| format!("failed to parse config {}", path.display()))?
        }
        None => Params::default(),
    };
    if let Some(interval) = args.interval {
        params.interval = interval;
    }
    if let Some(ratio) = args.aar_ratio {
        params.aar_ratio = ratio;
    }
    if let Some(ratio) = args.aabr_ratio {
        params.aabr_ratio = ratio;
    }
    if let Some(convention) = args.offset_convention {
        params.offset_convention = convention.into();
    }
    Ok(params)
}

fn load_outlines(path: &Path) -> Result<Vec<Outline>> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let outlines = read_outlines_geojson(&text)
        .with_context(|| format!("failed to parse outlines {}", path.display()))?;
    if outlines.is_empty() {
        return Err(anyhow!("no outlines found in {}", path.display()));
    }
    info!("Loaded {} outlines from {}", outlines.len(), path.display());
    Ok(outlines)
}

fn load_grid(path: &Path) -> Result<Grid> {
    let grid =
        Grid::read_ascii(path).with_context(|| format!("failed to load raster {}", path.display()))?;
    debug!(
        "Raster {}: {} x {} cells of {} m",
        path.display(),
        grid.nrows(),
        grid.ncols(),
        grid.cellsize()
    );
    Ok(grid)
}

fn handle_derive(args: DeriveArgs) -> Result<()> {
    let mut params = load_params(&args.params)?;
    if let Some(rec_method) = args.rec_method.as_ref() {
        params.rec_method = rec_method.clone();
    }
    if let Some(stage) = args.stage.as_ref() {
        params.glacial_stage = stage.clone();
    }
    if args.geographic {
        params.geographic = true;
    }
    params
        .validate()
        .map_err(|e| anyhow!("invalid parameters: {}", e))?;

    if let Some(threads) = args.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .build_global()
            .map_err(|e| anyhow!("failed to size thread pool: {}", e))?;
    }

    let outlines = load_outlines(&args.outlines)?;
    let surface = load_grid(&args.surface)?;
    let thickness = args.thickness.as_deref().map(load_grid).transpose()?;
    let service = GridRasterService::new(surface, thickness);

    let output = process_batch(&service, &outlines, &params)?;
    for (kind, count) in &output.summary.issue_counts {
        warn!("{} polygon(s) with {}", count, kind);
    }

    if args.output.as_os_str() == "-" {
        write_records_stdout(&output.records)?;
    } else {
        write_records_csv(&output.records, &args.output)?;
        info!("Wrote attribute CSV: {}", args.output.display());
    }

    if let Some(path) = args.json.as_ref() {
        write_json(&output, path)?;
        info!("Wrote JSON: {}", path.display());
    }
    Ok(())
}

fn write_json(output: &BatchOutput, path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), output)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn write_records_stdout(records: &[GlacierAttributeRecord]) -> Result<()> {
    let stdout = io::stdout();
    let handle = stdout.lock();
    let mut writer = csv::Writer::from_writer(handle);
    write_record_rows(records, &mut writer)
}

fn write_records_csv(records: &[GlacierAttributeRecord], path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    write_record_rows(records, &mut writer)
}

fn write_record_rows<W: Write>(
    records: &[GlacierAttributeRecord],
    writer: &mut csv::Writer<W>,
) -> Result<()> {
    writer.write_record([
        "PolyID", "PGI_ID", "GlaStage", "RecMethod", "CenX", "CenY", "Perimeter", "A2D", "A3D",
        "A3D2D", "Z_min", "Z_max", "Z_range", "Z_mean", "Z_median", "Z_mid", "MeanSlope",
        "MeanAspect", "Hypsomax", "HI", "MGE", "AAR", "AA", "AABR", "MeanTck", "StdTck",
        "MedianTck", "MaxTck", "Vol_km3", "Status",
    ])?;

    for r in records {
        let h = &r.hypsometry;
        writer.write_record([
            r.poly_id.to_string(),
            r.pgi_id.clone().unwrap_or_default(),
            r.glacial_stage.clone(),
            r.rec_method.clone(),
            fmt_value(r.cen_x, 6),
            fmt_value(r.cen_y, 6),
            fmt_value(r.perimeter, 3),
            fmt_value(r.area_2d, 3),
            fmt_value(r.area_3d, 3),
            fmt_value(r.ratio_3d_2d, 3),
            fmt_value(h.z_min, 1),
            fmt_value(h.z_max, 1),
            fmt_value(h.z_range, 1),
            fmt_value(h.z_mean, 1),
            fmt_value(h.z_median, 1),
            fmt_value(h.z_mid, 1),
            fmt_value(r.mean_slope, 1),
            fmt_value(r.mean_aspect, 1),
            fmt_value(h.hypso_max, 0),
            fmt_value(h.hypsometric_index, 3),
            fmt_value(r.ela.mge, 1),
            fmt_value(r.ela.aar, 1),
            fmt_value(r.ela.aa, 1),
            fmt_value(r.ela.aabr, 1),
            fmt_value(r.thickness.mean, 1),
            fmt_value(r.thickness.std, 1),
            fmt_value(r.thickness.median, 1),
            fmt_value(r.thickness.max, 1),
            fmt_value(r.volume_km3, 4),
            r.status(),
        ])?;
    }

    writer.flush()?;
    Ok(())
}

// Sentinels are written bare so downstream tools can match on -999.
fn fmt_value(value: f64, decimals: usize) -> String {
    if value == SENTINEL {
        "-999".to_string()
    } else {
        format!("{:.*}", decimals, value)
    }
}

fn read_elevations(path: &Path) -> Result<Vec<f64>> {
    let text = if path.as_os_str() == "-" {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read stdin")?;
        buf
    } else {
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?
    };
    text.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty())
        .map(|t| {
            t.parse::<f64>()
                .with_context(|| format!("invalid elevation '{}' in {}", t, path.display()))
        })
        .collect()
}

fn handle_ela(args: ElaArgs) -> Result<()> {
    let params = load_params(&args.params)?;
    params
        .validate()
        .map_err(|e| anyhow!("invalid parameters: {}", e))?;

    let values = read_elevations(&args.input)?;
    let sample = ElevationSample::new(values)
        .with_context(|| format!("no usable elevations in {}", args.input.display()))?;
    let hist = ElevationHistogram::build(&sample, params.interval)?;
    let (estimates, errors) = estimate_all(&hist, &params);
    for err in &errors {
        warn!("{}", err);
    }
    let hypsometry = analyze_hypsometry(&sample);
    info!(
        "{} cells, {} bins ({} populated), z {}..{} m",
        sample.len(),
        hist.len(),
        hist.populated_bins(),
        hypsometry.z_min,
        hypsometry.z_max
    );
    if let Ok(search) = ela_aabr(&hist, params.aabr_ratio, params.offset_convention) {
        debug!(
            "AABR settled at refinf {} after {} steps",
            search.refinf, search.iterations
        );
    }

    if args.json {
        let body = json!({
            "params": params,
            "ela": estimates,
            "hypsometry": hypsometry,
        });
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        serde_json::to_writer_pretty(&mut handle, &body)?;
        writeln!(handle)?;
        return Ok(());
    }

    let stdout = io::stdout();
    let mut writer = csv::Writer::from_writer(stdout.lock());
    writer.write_record(["method", "ela_m", "description"])?;
    for method in ElaMethod::ALL {
        writer.write_record([
            method.id().to_string(),
            fmt_value(estimates.get(method), 1),
            method.description().to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn handle_zonal(args: ZonalArgs) -> Result<()> {
    let outlines = load_outlines(&args.outlines)?;
    let service = GridRasterService::new(load_grid(&args.raster)?, None);
    let table = zonal_table(&service, &outlines, Layer::Surface)
        .with_context(|| format!("zonal statistics failed for {}", args.raster.display()))?;
    if table.len() < outlines.len() {
        warn!(
            "{} of {} outlines cover no valid cells",
            outlines.len() - table.len(),
            outlines.len()
        );
    }

    if args.output.as_os_str() == "-" {
        let stdout = io::stdout();
        let mut writer = csv::Writer::from_writer(stdout.lock());
        write_zonal_rows(&table, &mut writer)?;
    } else {
        let file = File::create(&args.output)
            .with_context(|| format!("failed to create {}", args.output.display()))?;
        let mut writer = csv::Writer::from_writer(file);
        write_zonal_rows(&table, &mut writer)?;
        info!("Wrote zonal CSV: {}", args.output.display());
    }
    Ok(())
}

fn write_zonal_rows<'a, W: Write>(
    table: impl IntoIterator<Item = (&'a usize, &'a ZonalStats)>,
    writer: &mut csv::Writer<W>,
) -> Result<()> {
    writer.write_record(["PolyID", "Count", "Min", "Max", "Range", "Mean", "Std", "Median"])?;
    for (poly_id, stats) in table {
        writer.write_record([
            poly_id.to_string(),
            stats.count.to_string(),
            format!("{:.3}", stats.min),
            format!("{:.3}", stats.max),
            format!("{:.3}", stats.range),
            format!("{:.3}", stats.mean),
            format!("{:.3}", stats.std),
            format!("{:.3}", stats.median),
        ])?;
    }
    writer.flush()?;
    Ok(())
}
