//! hearthd: enclosure heating daemon and ambient estimation tool.

mod logging;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use hearth::estimator::{CalibrationSample, CooldownPoint};
use hearth::sensors::{discover_zones, SensorSuite};
use hearth::{HearthArgs, HearthBuilder, HearthError, HearthRuntime, Result};

use crate::logging::{init_subscriber, Verbosity};

const DEFAULT_CONFIG_FILE: &str = "/etc/hearth/hearth.toml";

#[derive(Parser)]
#[command(name = "hearthd")]
#[command(about = "Heat an enclosure with surplus CPU and estimate ambient temperature", long_about = None)]
struct Cli {
    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Errors only
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(flatten)]
    hearth: HearthArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the thermal control loop until interrupted
    Run,

    /// Fit the ambient model, by load ladder or from a sample file
    Calibrate {
        /// JSON array of {cpu_temp, power_watts, ambient_reference}
        #[arg(long)]
        samples: Option<PathBuf>,
    },

    /// Print one ambient estimate
    Estimate {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Estimate repeatedly and print min/max/mean
    Monitor {
        #[arg(long, default_value_t = 300)]
        duration_s: u64,
        #[arg(long, default_value_t = 10)]
        interval_s: u64,
    },

    /// Record a cooldown and fit Newton's law of cooling against a reference ambient
    Cooldown {
        /// Reference ambient temperature (°C); defaults to the case sensor
        #[arg(long, allow_hyphen_values = true)]
        ambient: Option<f64>,
        #[arg(long, default_value_t = 1800)]
        duration_s: u64,
        #[arg(long, default_value_t = 10)]
        interval_s: u64,
        /// Fit this recorded series (JSON) instead of recording
        #[arg(long)]
        series: Option<PathBuf>,
        /// Save the recorded series (JSON)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Show thermal zones and the channels and power method in use
    Sensors,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_subscriber(Verbosity::from_flags(cli.verbose, cli.quiet));

    match dispatch(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(HearthError::Cancelled) => {
            warn!("interrupted");
            ExitCode::from(130)
        }
        Err(e) => {
            error!(%e, "hearthd failed");
            ExitCode::FAILURE
        }
    }
}

fn dispatch(cli: Cli) -> Result<()> {
    let builder = HearthBuilder::new()
        .file(DEFAULT_CONFIG_FILE)
        .env_prefix("HEARTH")
        .with_cli_args(&cli.hearth);

    if let Command::Sensors = cli.command {
        return show_sensors(&builder);
    }
    let runtime = builder.build()?;

    match cli.command {
        Command::Run => run(&runtime),
        Command::Calibrate { samples } => calibrate(&runtime, samples.as_deref()),
        Command::Estimate { json } => estimate(&runtime, json),
        Command::Monitor {
            duration_s,
            interval_s,
        } => monitor(&runtime, duration_s, interval_s),
        Command::Cooldown {
            ambient,
            duration_s,
            interval_s,
            series,
            output,
        } => cooldown(
            &runtime,
            ambient,
            Duration::from_secs(duration_s),
            Duration::from_secs(interval_s),
            series.as_deref(),
            output.as_deref(),
        ),
        Command::Sensors => Ok(()),
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = term.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Cancel long-running commands on SIGINT/SIGTERM.
fn watch_for_shutdown(runtime: &HearthRuntime) {
    let watcher = runtime.clone();
    runtime.tokio_handle().spawn(async move {
        if shutdown_signal().await.is_ok() {
            info!("shutdown requested");
            watcher.shutdown();
        }
    });
}

fn joined(result: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    result.map_err(|e| HearthError::Io(std::io::Error::other(e)))?
}

fn run(runtime: &HearthRuntime) -> Result<()> {
    info!("{}", runtime);
    runtime.block_on(async {
        let mut handle = runtime.spawn_controller();
        tokio::select! {
            res = &mut handle => return joined(res),
            signal = shutdown_signal() => signal?,
        }
        info!("shutdown requested");
        runtime.shutdown();
        runtime.wait_for_shutdown().await;
        joined(handle.await)
    })
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path)?;
    serde_json::from_str(&raw)
        .map_err(|e| HearthError::InvalidInput(format!("{}: {}", path.display(), e)))
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_vec_pretty(value)
        .map_err(|e| HearthError::InvalidInput(e.to_string()))?;
    fs::write(path, body)?;
    Ok(())
}

fn calibrate(runtime: &HearthRuntime, samples: Option<&Path>) -> Result<()> {
    let (outcome, samples) = match samples {
        Some(path) => {
            let samples: Vec<CalibrationSample> = read_json(path)?;
            (runtime.calibrate_from_samples(&samples)?, samples)
        }
        None => {
            watch_for_shutdown(runtime);
            (runtime.block_on(runtime.calibrate())?, Vec::new())
        }
    };

    let model = &outcome.model;
    if !samples.is_empty() {
        println!("{:>8} {:>8} {:>10} {:>10} {:>7}", "cpu °C", "power W", "measured", "predicted", "error");
        for sample in &samples {
            let predicted = model.estimate(sample.cpu_temp, sample.power_watts)?;
            println!(
                "{:>8.1} {:>8.1} {:>10.1} {:>10.1} {:>+7.2}",
                sample.cpu_temp,
                sample.power_watts,
                sample.ambient_reference,
                predicted.ambient_celsius,
                predicted.ambient_celsius - sample.ambient_reference
            );
        }
        println!();
    }
    println!("thermal resistance  {:.3} °C/W", model.thermal_resistance);
    println!("bias                {:+.2} °C", model.bias);
    println!("residual sigma      {:.2} °C", model.sigma);
    println!("R²                  {:.4}", model.r_squared);
    println!("samples             {}", model.sample_count);
    if model.low_confidence() {
        println!("warning: low confidence fit, consider recalibrating");
    }
    if !outcome.persisted {
        println!("warning: model not saved, it will be lost on restart");
    }
    Ok(())
}

fn estimate(runtime: &HearthRuntime, json: bool) -> Result<()> {
    let report = runtime.block_on(runtime.estimate_now())?;
    if json {
        let value = serde_json::json!({
            "ambient_celsius": report.estimate.ambient_celsius,
            "uncertainty_celsius": report.estimate.uncertainty_celsius,
            "cpu_temp_celsius": report.cpu_temp,
            "power_watts": report.power.watts,
            "power_method": report.power.method,
        });
        println!("{}", value);
    } else {
        println!(
            "ambient {:.1} ± {:.1} °C (cpu {:.1} °C, {:.1} W via {})",
            report.estimate.ambient_celsius,
            report.estimate.uncertainty_celsius,
            report.cpu_temp,
            report.power.watts,
            report.power.method,
        );
    }
    Ok(())
}

fn monitor(runtime: &HearthRuntime, duration_s: u64, interval_s: u64) -> Result<()> {
    watch_for_shutdown(runtime);
    let summary = runtime.block_on(runtime.monitor(
        Duration::from_secs(duration_s),
        Duration::from_secs(interval_s.max(1)),
    ))?;
    match summary {
        Some(s) => println!(
            "{} estimates: min {:.1} °C, max {:.1} °C, mean {:.1} °C",
            s.count, s.min, s.max, s.mean
        ),
        None => println!("no estimates collected"),
    }
    Ok(())
}

fn cooldown(
    runtime: &HearthRuntime,
    ambient: Option<f64>,
    duration: Duration,
    interval: Duration,
    series: Option<&Path>,
    output: Option<&Path>,
) -> Result<()> {
    let points: Vec<CooldownPoint> = match series {
        Some(path) => read_json(path)?,
        None => {
            watch_for_shutdown(runtime);
            info!(
                duration_s = duration.as_secs(),
                "recording cooldown, keep the heaters off"
            );
            runtime.block_on(runtime.record_cooldown(duration, interval.max(Duration::from_secs(1))))?
        }
    };
    if let Some(path) = output {
        write_json(path, &points)?;
    }

    let ambient = match ambient {
        Some(c) => c,
        None => runtime.sensors().ambient.read()?.temperature_celsius,
    };
    let fit = runtime.fit_cooldown(&points, ambient)?;
    println!("time constant       {:.0} s", fit.tau);
    println!("fitted ambient      {:.1} °C", fit.fitted_ambient);
    println!("reference ambient   {:.1} °C", fit.ambient_reference);
    println!("error               {:.1} °C ({})", fit.ambient_error(), fit.agreement());
    println!("rmse                {:.2} °C", fit.rmse);
    Ok(())
}

fn show_sensors(builder: &HearthBuilder) -> Result<()> {
    let config = builder.build_config()?;
    let zones = discover_zones(&config.thermal_root);
    if zones.is_empty() {
        println!("no thermal zones under {}", config.thermal_root.display());
    }
    for zone in &zones {
        match zone.read_celsius() {
            Ok(c) => println!("{:<24} {:>6.1} °C", zone.id(), c),
            Err(e) => println!("{:<24} unreadable ({})", zone.id(), e),
        }
    }

    let suite = SensorSuite::from_config(&config)?;
    println!();
    println!("case channel        {}", suite.ambient.describe());
    println!("cpu channel         {}", suite.cpu.describe());
    let power = suite.power.sample()?;
    println!("power               {:.1} W via {}", power.watts, power.method);
    Ok(())
}
