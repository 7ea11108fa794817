//! External command engine
//!
//! Runs a configured program as the primary tier. The series goes into
//! `input.json` in the attempt's scratch directory; the program reads the
//! paths from `FORECAST_INPUT` / `FORECAST_OUTPUT` and writes its points to
//! `output.json`:
//!
//! ```json
//! {"points": [{"value": 120.0, "lower": 100.0, "upper": 140.0}], "accuracy": 8.5}
//! ```
//!
//! The first `horizon` points must all be usable. Extra points are kept in
//! the cached snapshot up to the first one without a finite value.
//!
//! A non-zero exit status or a fatal signal is reported as
//! [`ForecastError::EngineCrash`]; a program killed at the deadline as
//! [`ForecastError::EngineTimeout`].

use super::{FittedModel, ForecastPoint, PrimaryEngine, PrimaryRequest};
use crate::error::{ForecastError, Result};
use crate::guard::AttemptContext;
use crate::period::Month;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::Duration;

pub const INPUT_FILE: &str = "input.json";
pub const OUTPUT_FILE: &str = "output.json";
const STDERR_FILE: &str = "stderr.log";
const STDERR_TAIL: usize = 400;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EngineInput<'a> {
    scope: &'a str,
    entity: &'a str,
    periods: Vec<String>,
    values: Vec<f64>,
    horizon: usize,
    forecast_periods: Vec<String>,
    confidence_level: f64,
}

#[derive(Deserialize)]
struct EngineOutput {
    points: Vec<EnginePoint>,
    #[serde(default)]
    accuracy: Option<f64>,
}

#[derive(Deserialize)]
struct EnginePoint {
    #[serde(default)]
    value: Option<f64>,
    #[serde(default)]
    lower: Option<f64>,
    #[serde(default)]
    upper: Option<f64>,
}

/// Forecast points produced by an external engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotFit {
    pub origin: Month,
    pub points: Vec<ForecastPoint>,
    pub accuracy: Option<f64>,
}

impl SnapshotFit {
    /// Replay the stored points; a snapshot cannot extend past what was produced
    pub fn project(&self, horizon: usize) -> Result<Vec<ForecastPoint>> {
        if horizon > self.points.len() {
            return Err(ForecastError::InsufficientData(format!(
                "snapshot covers {} months, {} requested",
                self.points.len(),
                horizon
            )));
        }
        Ok(self.points[..horizon].to_vec())
    }
}

#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: PathBuf,
    args: Vec<String>,
    poll_interval: Duration,
}

impl CommandEngine {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            poll_interval: Duration::from_millis(10),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn write_input(&self, request: &PrimaryRequest, path: &Path) -> Result<()> {
        let usable = request.series.usable_points();
        let origin = request.series.forecast_origin();
        let input = EngineInput {
            scope: &request.key.scope,
            entity: &request.key.entity_id,
            periods: usable.iter().map(|p| p.period.to_string()).collect(),
            values: usable.iter().map(|p| p.value).collect(),
            horizon: request.horizon,
            forecast_periods: (0..request.horizon)
                .map(|i| origin.offset(i as i64).to_string())
                .collect(),
            confidence_level: request.confidence_level,
        };

        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(&mut writer, &input)?;
        writer.flush()?;
        Ok(())
    }

    fn read_output(&self, request: &PrimaryRequest, path: &Path) -> Result<SnapshotFit> {
        let file = File::open(path).map_err(|e| {
            ForecastError::ForecastingError(format!("engine wrote no output: {}", e))
        })?;
        let output: EngineOutput =
            serde_json::from_reader(BufReader::new(file)).map_err(|e| {
                ForecastError::ForecastingError(format!("unreadable engine output: {}", e))
            })?;

        if output.points.len() < request.horizon {
            return Err(ForecastError::ForecastingError(format!(
                "engine returned {} points for a horizon of {}",
                output.points.len(),
                request.horizon
            )));
        }

        let origin = request.series.forecast_origin();
        let bounded = |i: usize, p: &EnginePoint| {
            ForecastPoint::bounded(
                origin.offset(i as i64),
                p.value.unwrap_or(f64::NAN),
                p.lower.unwrap_or(f64::NAN),
                p.upper.unwrap_or(f64::NAN),
            )
        };

        // Points past the horizon only extend the snapshot, up to the first bad one
        let mut points = output.points[..request.horizon]
            .iter()
            .enumerate()
            .map(|(i, p)| bounded(i, p))
            .collect::<Result<Vec<_>>>()?;
        for (i, p) in output.points.iter().enumerate().skip(request.horizon) {
            match bounded(i, p) {
                Ok(point) => points.push(point),
                Err(_) => break,
            }
        }

        Ok(SnapshotFit {
            origin,
            points,
            accuracy: output.accuracy.filter(|a| a.is_finite()),
        })
    }
}

impl PrimaryEngine for CommandEngine {
    fn name(&self) -> &str {
        "command"
    }

    fn fit(&self, request: &PrimaryRequest, ctx: &AttemptContext) -> Result<FittedModel> {
        let scratch = ctx.scratch_dir()?;
        let input = scratch.join(INPUT_FILE);
        let output = scratch.join(OUTPUT_FILE);
        self.write_input(request, &input)?;

        let stderr = File::create(scratch.join(STDERR_FILE))?;
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .current_dir(&scratch)
            .env("FORECAST_INPUT", &input)
            .env("FORECAST_OUTPUT", &output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr));

        ctx.spawn(&mut command)?;
        let status = ctx.wait_child(self.poll_interval)?;

        if !status.success() {
            return Err(ForecastError::EngineCrash(format!(
                "{} {}{}",
                self.program.display(),
                describe_status(&status),
                stderr_tail(&scratch.join(STDERR_FILE))
            )));
        }

        Ok(FittedModel::Snapshot(self.read_output(request, &output)?))
    }
}

#[cfg(unix)]
fn describe_status(status: &ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exited with status {}", code),
        (None, Some(signal)) => format!("terminated by signal {}", signal),
        (None, None) => "terminated abnormally".to_string(),
    }
}

#[cfg(not(unix))]
fn describe_status(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exited with status {}", code),
        None => "terminated abnormally".to_string(),
    }
}

fn stderr_tail(path: &Path) -> String {
    let Ok(text) = std::fs::read_to_string(path) else {
        return String::new();
    };
    let text = text.trim();
    if text.is_empty() {
        return String::new();
    }
    let start = text
        .char_indices()
        .rev()
        .nth(STDERR_TAIL - 1)
        .map_or(0, |(i, _)| i);
    format!(": {}", &text[start..])
}
