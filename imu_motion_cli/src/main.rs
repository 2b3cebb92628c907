use std::fs;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Args, Parser, Subcommand, ValueHint};
use imu_motion::{
    analyze_session, joint_angle_table, load_session_from_base64, load_session_from_texts,
    load_session_from_zip, validate_required_sensors, AnalysisResult, DeviceTag, JointAngleTable,
    Options, Session,
};
use rayon::prelude::*;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Offline IMU movement analysis CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyse one or more session archives and emit JSON reports
    Analyze(AnalyzeArgs),
    /// Summarise the sensor streams found in each input
    Inspect(InspectArgs),
    /// Export per-frame joint angles of one session as CSV
    Series(SeriesArgs),
}

#[derive(Args, Debug)]
struct OptionArgs {
    /// Options JSON file; flags below override its values
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Body height (meters)
    #[arg(long)]
    height: Option<f64>,

    /// Body mass (kilograms)
    #[arg(long)]
    mass: Option<f64>,

    /// Absolute repetition peak threshold (degrees)
    #[arg(long)]
    threshold: Option<f64>,

    /// Minimum spacing between repetitions (seconds)
    #[arg(long)]
    min_peak_distance: Option<f64>,
}

#[derive(Parser, Debug)]
struct AnalyzeArgs {
    /// ZIP archives, base64 files (with --base64) or directories of sensor CSVs
    #[arg(required = true, value_hint = ValueHint::AnyPath)]
    inputs: Vec<PathBuf>,

    /// Output JSON path (`-` or omitted for stdout)
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    output: Option<PathBuf>,

    /// Treat file inputs as base64-encoded archives
    #[arg(long, action = ArgAction::SetTrue)]
    base64: bool,

    #[command(flatten)]
    options: OptionArgs,

    /// Verbose logging
    #[arg(short, long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct InspectArgs {
    #[arg(required = true, value_hint = ValueHint::AnyPath)]
    inputs: Vec<PathBuf>,

    /// Report path (`-` or omitted for stdout)
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    output: Option<PathBuf>,

    #[arg(long, action = ArgAction::SetTrue)]
    base64: bool,

    #[arg(short, long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct SeriesArgs {
    #[arg(value_hint = ValueHint::AnyPath)]
    input: PathBuf,

    /// Output CSV path (`-` for stdout)
    #[arg(short, long, default_value = "angles.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    #[arg(long, action = ArgAction::SetTrue)]
    base64: bool,

    #[command(flatten)]
    options: OptionArgs,

    #[arg(short, long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Serialize, Debug)]
struct AnalysisReport {
    input: String,
    sha256: String,
    analyzed_at: DateTime<Utc>,
    result: AnalysisResult,
}

struct LoadedInput {
    session: Session,
    sha256: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Analyze(args) => args.verbose,
        Command::Inspect(args) => args.verbose,
        Command::Series(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Analyze(args) => handle_analyze(args),
        Command::Inspect(args) => handle_inspect(args),
        Command::Series(args) => handle_series(args),
    }
}

fn build_options(args: &OptionArgs) -> Result<Options> {
    let mut options = match args.config.as_ref() {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read options {}", path.display()))?;
            Options::from_json_str(&text)
                .with_context(|| format!("invalid options in {}", path.display()))?
        }
        None => Options::default(),
    };
    if let Some(height) = args.height {
        options.body_height_m = height;
    }
    if let Some(mass) = args.mass {
        options.body_mass_kg = mass;
    }
    if let Some(threshold) = args.threshold {
        options.peak_threshold_deg = threshold;
    }
    if let Some(distance) = args.min_peak_distance {
        options.min_peak_distance_s = distance;
    }
    options.validate()?;
    Ok(options)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

fn is_sensor_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("csv") || ext.eq_ignore_ascii_case("txt"))
        .unwrap_or(false)
}

fn load_directory(dir: &Path) -> Result<LoadedInput> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("failed to list {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_sensor_file(p))
        .collect();
    paths.sort();
    if paths.is_empty() {
        warn!("No .csv/.txt sensor logs in {}", dir.display());
    }

    let mut hasher = Sha256::new();
    let mut entries = Vec::with_capacity(paths.len());
    for path in &paths {
        let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        hasher.update(&bytes);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        entries.push((name, String::from_utf8_lossy(&bytes).into_owned()));
    }
    let digest = hasher.finalize();
    Ok(LoadedInput {
        session: load_session_from_texts(entries),
        sha256: digest.iter().map(|b| format!("{:02x}", b)).collect(),
    })
}

fn load_input(path: &Path, base64: bool) -> Result<LoadedInput> {
    if path.is_dir() {
        return load_directory(path);
    }
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let opened = if base64 {
        let text = std::str::from_utf8(&data)
            .with_context(|| format!("{} is not base64 text", path.display()))?;
        load_session_from_base64(text)
    } else {
        load_session_from_zip(&data)
    };
    let session =
        opened.with_context(|| format!("failed to open session {}", path.display()))?;
    Ok(LoadedInput {
        session,
        sha256: sha256_hex(&data),
    })
}

fn open_output(path: Option<&PathBuf>) -> Result<Box<dyn Write>> {
    match path {
        Some(p) if p.as_os_str() != "-" => {
            let file =
                File::create(p).with_context(|| format!("failed to create {}", p.display()))?;
            Ok(Box::new(io::BufWriter::new(file)))
        }
        _ => Ok(Box::new(io::stdout().lock())),
    }
}

fn handle_analyze(args: AnalyzeArgs) -> Result<()> {
    if args.inputs.is_empty() {
        return Err(anyhow!("no inputs supplied"));
    }
    let options = build_options(&args.options)?;

    let t_start = Instant::now();
    let reports = args
        .inputs
        .par_iter()
        .map(|path| -> Result<AnalysisReport> {
            let loaded = load_input(path, args.base64)?;
            let result = analyze_session(&loaded.session, &options)
                .with_context(|| format!("failed to analyse {}", path.display()))?;
            Ok(AnalysisReport {
                input: path.display().to_string(),
                sha256: loaded.sha256,
                analyzed_at: Utc::now(),
                result,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    info!(
        "Analysed {} input(s) in {:.1} ms",
        reports.len(),
        t_start.elapsed().as_secs_f64() * 1000.0
    );

    let mut out = open_output(args.output.as_ref())?;
    serde_json::to_writer_pretty(&mut out, &reports).context("failed to write JSON report")?;
    writeln!(out)?;
    out.flush()?;
    if let Some(path) = args.output.as_ref().filter(|p| p.as_os_str() != "-") {
        info!("Report written: {}", path.display());
    }
    Ok(())
}

fn inspect_report(path: &Path, loaded: &LoadedInput) -> String {
    let session = &loaded.session;
    let mut report = String::new();
    report.push_str(&format!("== {} ==\n", path.display()));
    report.push_str(&format!("  sha256: {}\n", loaded.sha256));

    for tag in DeviceTag::ALL {
        let Some(stream) = session.stream(tag) else {
            continue;
        };
        let duration = stream.duration_s();
        let rate = if duration > 0.0 {
            (stream.len() - 1) as f64 / duration
        } else {
            0.0
        };
        report.push_str(&format!(
            "  [{}] {}: {} samples, {:.2} s, {:.1} Hz\n",
            tag.number(),
            tag.segment(),
            stream.len(),
            duration,
            rate
        ));
    }

    let validation = validate_required_sensors(session);
    let missing: Vec<&str> = validation.missing.iter().map(|s| s.name()).collect();
    report.push_str(&format!(
        "  missing: {}\n",
        if missing.is_empty() {
            "none".to_string()
        } else {
            missing.join(", ")
        }
    ));
    let status = |ok: bool| if ok { "complete" } else { "incomplete" };
    report.push_str(&format!(
        "  right knee pairing: {}\n  left knee pairing: {}\n",
        status(validation.right_knee_complete),
        status(validation.left_knee_complete)
    ));
    if !session.notes.is_empty() {
        report.push_str("  notes:\n");
        for note in &session.notes {
            report.push_str(&format!("    - {}: {}\n", note.entry, note.issue));
        }
    }
    report.push('\n');
    report
}

fn handle_inspect(args: InspectArgs) -> Result<()> {
    let sections = args
        .inputs
        .par_iter()
        .map(|path| -> Result<String> {
            let loaded = load_input(path, args.base64)?;
            Ok(inspect_report(path, &loaded))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut out = open_output(args.output.as_ref())?;
    for section in sections {
        out.write_all(section.as_bytes())?;
    }
    out.flush()?;
    Ok(())
}

fn write_series_rows<W: Write>(table: &JointAngleTable, writer: &mut csv::Writer<W>) -> Result<()> {
    let columns = table.columns();
    let mut header = vec!["t_s"];
    header.extend(columns.iter().map(|(name, _)| *name));
    writer.write_record(&header)?;

    for (i, t) in table.t.iter().enumerate() {
        let mut row = Vec::with_capacity(columns.len() + 1);
        row.push(format!("{:.6}", t));
        for (_, values) in &columns {
            row.push(format!("{:.4}", values[i]));
        }
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

fn handle_series(args: SeriesArgs) -> Result<()> {
    let options = build_options(&args.options)?;
    let loaded = load_input(&args.input, args.base64)?;
    let table = joint_angle_table(&loaded.session, &options)
        .with_context(|| format!("failed to compute joint angles for {}", args.input.display()))?;
    if table.is_empty() {
        warn!(
            "No joint angles could be computed for {}",
            args.input.display()
        );
    }

    if args.output.as_os_str() == "-" {
        let stdout = io::stdout();
        let mut writer = csv::Writer::from_writer(stdout.lock());
        write_series_rows(&table, &mut writer)?;
    } else {
        let file = File::create(&args.output)
            .with_context(|| format!("failed to create {}", args.output.display()))?;
        let mut writer = csv::Writer::from_writer(file);
        write_series_rows(&table, &mut writer)?;
        info!(
            "Joint angles written: {} ({} frames)",
            args.output.display(),
            table.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use imu_motion::JointPair;

    fn no_overrides() -> OptionArgs {
        OptionArgs {
            config: None,
            height: None,
            mass: None,
            threshold: None,
            min_peak_distance: None,
        }
    }

    #[test]
    fn test_flags_override_defaults() {
        let args = OptionArgs {
            height: Some(1.62),
            threshold: Some(20.0),
            ..no_overrides()
        };
        let options = build_options(&args).unwrap();
        assert_eq!(options.body_height_m, 1.62);
        assert_eq!(options.peak_threshold_deg, 20.0);
        assert_eq!(options.body_mass_kg, 70.0);
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let args = OptionArgs {
            mass: Some(0.0),
            ..no_overrides()
        };
        assert!(build_options(&args).is_err());
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_series_csv_layout() {
        let table = JointAngleTable {
            t: vec![0.0, 0.5],
            knee: JointPair {
                left: None,
                right: Some(vec![1.0, 2.0]),
            },
            hip: JointPair {
                left: Some(vec![-1.0, 0.25]),
                right: None,
            },
        };
        let mut writer = csv::Writer::from_writer(Vec::new());
        write_series_rows(&table, &mut writer).unwrap();
        let text = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "t_s,knee_right_deg,hip_left_deg");
        assert_eq!(lines[2], "0.500000,2.0000,0.2500");
    }
}
