use std::collections::HashSet;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, ValueHint};
use gpx_geotag::{
    load_photos, parse_utc_offset, read_gpx_file, run_batch, BatchReport, ExifJpeg, FailureStage,
    Params, TrackPoint, TrackPointStore,
};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Geotag JPEG files by comparing their timestamps to GPX tracks",
    long_about = None
)]
struct Cli {
    /// GPX files to use; wildcard patterns such as `tracks/*.gpx` are expanded
    #[arg(short, long, required = true, num_args = 1.., value_hint = ValueHint::FilePath)]
    gpx: Vec<String>,

    /// JPEG files to geotag; wildcard patterns such as `*.jpg` are expanded
    #[arg(short, long, required = true, num_args = 1.., value_hint = ValueHint::FilePath)]
    jpeg: Vec<String>,

    /// UTC offset of the cameras' clocks, e.g. +03:00
    #[arg(short, long, allow_hyphen_values = true)]
    timezone: String,

    /// Largest accepted gap (seconds) between a photo and the track
    #[arg(long, default_value_t = 120.0)]
    threshold: f64,

    /// Report matches without modifying any photo
    #[arg(short = 'n', long, action = ArgAction::SetTrue)]
    dry_run: bool,

    /// Write a JSON report of every photo to this path
    #[arg(long, value_hint = ValueHint::FilePath)]
    report: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Serialize)]
struct ReportFile<'a> {
    timezone: &'a str,
    params: &'a Params,
    #[serde(flatten)]
    report: &'a BatchReport,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    handle_geotag(cli)
}

fn handle_geotag(cli: Cli) -> Result<()> {
    if cli.threshold.is_nan() || cli.threshold < 0.0 {
        return Err(anyhow!("--threshold must be a non-negative number of seconds"));
    }
    let offset = parse_utc_offset(&cli.timezone)?;
    let params = Params {
        threshold_s: cli.threshold,
        dry_run: cli.dry_run,
    };

    let gpx_paths = expand_patterns(&cli.gpx)?;
    let jpeg_paths = expand_patterns(&cli.jpeg)?;

    let t_parse = Instant::now();
    let tracks = gpx_paths
        .par_iter()
        .map(|path| -> Result<Vec<TrackPoint>> {
            let points = read_gpx_file(path)
                .with_context(|| format!("failed to read track {}", path.display()))?;
            debug!("{}: {} track points", path.display(), points.len());
            Ok(points)
        })
        .collect::<Result<Vec<_>>>()?;
    let store = TrackPointStore::build(tracks)
        .with_context(|| format!("no usable points in {} GPX file(s)", gpx_paths.len()))?;
    let (first, last) = store.span();
    info!(
        "Loaded {} track points from {} file(s) spanning {} s ({:.1} ms)",
        store.len(),
        gpx_paths.len(),
        last - first,
        t_parse.elapsed().as_secs_f64() * 1000.0
    );

    let (photos, load_failures) = load_photos(&jpeg_paths, offset, &ExifJpeg);
    for failure in &load_failures {
        warn!("Skipping {}: {}", failure.path.display(), failure.message);
    }

    let mut report = run_batch(&store, &photos, &params, &ExifJpeg);
    let mut failures = load_failures;
    failures.append(&mut report.failures);
    report.failures = failures;
    if params.dry_run {
        info!("Dry run: no photos were modified");
    }

    print!("{}", render_report(&report, params.threshold_s));

    if let Some(path) = cli.report.as_ref() {
        let file = File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        let contents = ReportFile {
            timezone: &cli.timezone,
            params: &params,
            report: &report,
        };
        serde_json::to_writer_pretty(BufWriter::new(file), &contents)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("Wrote report: {}", path.display());
    }
    Ok(())
}

fn render_report(report: &BatchReport, threshold_s: f64) -> String {
    let mut out = String::new();
    for result in &report.geotagged {
        let _ = writeln!(out, "{}: {:.1} s.", result.photo.path.display(), result.time_gap_s);
    }

    if !report.not_geotagged.is_empty() {
        let _ = writeln!(
            out,
            "\nCould not geotag {} photo(s):",
            report.not_geotagged.len()
        );
        for result in &report.not_geotagged {
            let _ = writeln!(out, "{}: {:.1} s.", result.photo.path.display(), result.time_gap_s);
        }
        let _ = writeln!(
            out,
            "Warning: these photos are more than {threshold_s} s away from the nearest track point. \
             Check --timezone, or raise --threshold to accept larger gaps."
        );
    }

    if !report.failures.is_empty() {
        let _ = writeln!(out, "\nFailed to process {} photo(s):", report.failures.len());
        for failure in &report.failures {
            let stage = match failure.stage {
                FailureStage::Load => "read",
                FailureStage::Write => "write",
            };
            let _ = writeln!(
                out,
                "{}: {} failed: {}",
                failure.path.display(),
                stage,
                failure.message
            );
        }
    }
    out
}

/// Expand wildcard patterns into files, keeping the first occurrence of each.
///
/// Existing paths are taken literally. A pattern that matches nothing is an
/// error.
fn expand_patterns(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for pattern in patterns {
        let literal = Path::new(pattern);
        let matched = if literal.is_file() {
            vec![literal.to_path_buf()]
        } else {
            let (base, glob, depth) = split_pattern(literal);
            let walker = globwalk::GlobWalkerBuilder::from_patterns(&base, &[glob.as_str()])
                .max_depth(depth)
                .file_type(globwalk::FileType::FILE)
                .build()
                .with_context(|| format!("invalid pattern '{pattern}'"))?;
            let mut found: Vec<PathBuf> = walker
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.into_path())
                .collect();
            found.sort();
            found
        };
        if matched.is_empty() {
            return Err(anyhow!("'{pattern}' matched no files"));
        }
        for path in matched {
            if seen.insert(path.clone()) {
                out.push(path);
            }
        }
    }
    Ok(out)
}

/// Split a pattern into the directory to walk from, the remaining glob and
/// how many levels deep it reaches.
fn split_pattern(pattern: &Path) -> (PathBuf, String, usize) {
    let is_glob = |s: &str| s.contains(['*', '?', '[', '{']);
    let mut base = PathBuf::new();
    let mut rest: Vec<String> = Vec::new();
    for component in pattern.components() {
        let text = component.as_os_str().to_string_lossy();
        if rest.is_empty() && !(matches!(component, Component::Normal(_)) && is_glob(&text)) {
            base.push(component);
        } else {
            rest.push(text.into_owned());
        }
    }
    if rest.is_empty() {
        // No wildcard: match the path itself from its parent.
        let name = base
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        base.pop();
        rest.push(name);
    }
    if base.as_os_str().is_empty() {
        base.push(".");
    }
    let depth = rest.len();
    (base, rest.join("/"), depth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpx_geotag::{CorrelationResult, PhotoFailure, PhotoRecord};
    use std::fs;
    use tempfile::tempdir;

    fn result(path: &str, gap: f64, succeeded: bool) -> CorrelationResult {
        CorrelationResult {
            photo: PhotoRecord {
                path: PathBuf::from(path),
                capture_timestamp: 0,
            },
            succeeded,
            time_gap_s: gap,
            position: None,
        }
    }

    #[test]
    fn report_lists_successes_only_when_all_pass() {
        let report = BatchReport {
            geotagged: vec![result("a.jpg", 12.0, true), result("b.jpg", 0.0, true)],
            ..Default::default()
        };
        assert_eq!(render_report(&report, 120.0), "a.jpg: 12.0 s.\nb.jpg: 0.0 s.\n");
    }

    #[test]
    fn report_warns_about_threshold() {
        let report = BatchReport {
            geotagged: vec![result("a.jpg", 3.0, true)],
            not_geotagged: vec![result("late.jpg", 4000.0, false)],
            failures: vec![PhotoFailure {
                path: PathBuf::from("broken.jpg"),
                stage: FailureStage::Load,
                message: "metadata field DateTimeOriginal is missing".into(),
            }],
        };
        let text = render_report(&report, 90.5);
        assert!(text.starts_with("a.jpg: 3.0 s.\n\nCould not geotag 1 photo(s):\nlate.jpg: 4000.0 s.\n"));
        assert!(text.contains("more than 90.5 s away"));
        assert!(text.contains("--timezone"));
        assert!(text.contains("--threshold"));
        assert!(text.ends_with(
            "broken.jpg: read failed: metadata field DateTimeOriginal is missing\n"
        ));
    }

    #[test]
    fn split_pattern_finds_wildcard_component() {
        assert_eq!(
            split_pattern(Path::new("*.gpx")),
            (PathBuf::from("."), "*.gpx".to_string(), 1)
        );
        assert_eq!(
            split_pattern(Path::new("trips/2023/*/img_*.jpg")),
            (PathBuf::from("trips/2023"), "*/img_*.jpg".to_string(), 2)
        );
        assert_eq!(
            split_pattern(Path::new("/data/missing.gpx")),
            (PathBuf::from("/data"), "missing.gpx".to_string(), 1)
        );
    }

    #[test]
    fn expand_patterns_matches_files_once() {
        let dir = tempdir().unwrap();
        for name in ["b.jpg", "a.jpg", "c.JPG", "notes.txt"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        let jpgs = dir.path().join("*.jpg").to_string_lossy().into_owned();
        let literal = dir.path().join("a.jpg").to_string_lossy().into_owned();

        let found = expand_patterns(&[literal, jpgs]).unwrap();
        let names: Vec<String> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.jpg", "b.jpg"]);
    }

    #[test]
    fn expand_patterns_rejects_unmatched() {
        let dir = tempdir().unwrap();
        let pattern = dir.path().join("*.gpx").to_string_lossy().into_owned();
        assert!(expand_patterns(&[pattern]).is_err());
    }
}
