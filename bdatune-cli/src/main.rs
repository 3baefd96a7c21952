//! bdatune: tune a BDA graph and record the transport stream.
//!
//! Tune parameters come from the `[tune]` table of the configuration file
//! and `--set KEY=VALUE` overrides, using the `dvb-*` variable names.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};

mod config;
mod logging;

use bdatune::platform::loopback::{LoopbackConfig, LoopbackPlatform};
use bdatune::{BdaTuner, TuneError, TunerSettings};
use bdatune_types::NetworkStandard;
use config::{load_config, ConfigFile, TuneTable, DEFAULT_CONFIG_FILE};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// bdatune - BDA tuner graph driver
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Network standard (atsc, dvb-t, dvb-c, dvb-s)
    #[arg(long)]
    standard: Option<NetworkStandard>,

    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Tune parameter override, e.g. dvb-frequency=522000
    #[arg(short, long = "set", value_name = "KEY=VALUE")]
    set: Vec<String>,

    /// Output file for the transport stream (stdout when omitted or "-")
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Stop after this many seconds
    #[arg(long)]
    duration: Option<u64>,

    /// Directory where log files are stored
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Number of days to keep log files
    #[arg(long, default_value = "7")]
    log_retention_days: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Config file: explicit path > auto-detect > default
    let config_path = args.config.clone().or_else(|| {
        let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
        default_path.exists().then_some(default_path)
    });
    let file_config = match &config_path {
        Some(path) => match load_config(path) {
            Ok(c) => {
                eprintln!("Loaded config from: {}", path.display());
                c
            }
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                return Err(e.into());
            }
        },
        None => ConfigFile::default(),
    };

    // Command line takes precedence over the file
    let log_dir = if args.log_dir.to_string_lossy() != "logs" {
        args.log_dir.clone()
    } else {
        PathBuf::from(file_config.logging.log_dir.as_deref().unwrap_or("logs"))
    };
    let log_retention_days = if args.log_retention_days != 7 {
        args.log_retention_days
    } else {
        file_config.logging.retention_days.unwrap_or(7)
    };
    let _log_guard = logging::init_logging(
        &log_dir,
        log_retention_days,
        args.verbose,
        file_config.logging.level.as_deref(),
    )?;

    let ConfigFile {
        tune,
        tuner: settings,
        loopback,
        ..
    } = file_config;
    let mut table = TuneTable::new(tune);
    table.apply_overrides(&args.set)?;
    let standard = match args.standard {
        Some(standard) => standard,
        None => table
            .standard()?
            .ok_or("No network standard given (use --standard or [tune] standard)")?,
    };

    info!(
        "bdatune {} starting: {} via loopback platform ({} tuner(s))",
        env!("CARGO_PKG_VERSION"),
        standard,
        loopback.tuners.len()
    );

    let stop = Arc::new(AtomicBool::new(false));
    let mut worker = tokio::task::spawn_blocking({
        let stop = Arc::clone(&stop);
        let output = args.output.clone();
        move || run(loopback, settings, standard, table, output, &stop)
    });

    let deadline = async {
        match args.duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };

    let finished = tokio::select! {
        result = &mut worker => Some(result),
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping");
            None
        }
        _ = deadline => {
            info!("Duration elapsed, stopping");
            None
        }
    };
    let result = match finished {
        Some(result) => result,
        None => {
            stop.store(true, Ordering::Release);
            worker.await
        }
    };

    match result {
        Ok(Ok(bytes)) => {
            info!("Wrote {} bytes", bytes);
            Ok(())
        }
        Ok(Err(e)) => {
            error!("{}", e);
            Err(e.to_string().into())
        }
        Err(e) => {
            error!("Tuner task failed: {}", e);
            Err(e.into())
        }
    }
}

/// Tune and copy the stream to the output until `stop` is set.
fn run(
    loopback: LoopbackConfig,
    settings: TunerSettings,
    standard: NetworkStandard,
    table: TuneTable,
    output: Option<PathBuf>,
    stop: &AtomicBool,
) -> Result<u64, BoxError> {
    let platform = Arc::new(LoopbackPlatform::new(loopback));
    let mut tuner = BdaTuner::new(platform, settings);
    tuner.submit_from(standard, &table)?;
    if let Some(space) = tuner.tuning_space() {
        info!("Tuned using tuning space '{}'", space.unique_name);
    }

    let mut out: Box<dyn Write> = match output {
        Some(path) if path.as_os_str() != "-" => {
            info!("Writing transport stream to {}", path.display());
            Box::new(BufWriter::new(File::create(&path)?))
        }
        _ => Box::new(BufWriter::new(io::stdout().lock())),
    };

    let mut buf = Vec::new();
    let mut total = 0u64;
    while !stop.load(Ordering::Acquire) {
        let size = match tuner.snapshot_size() {
            Ok(size) => size,
            Err(TuneError::Timeout(wait)) => {
                warn!("No data for {:?}", wait);
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        buf.resize(size, 0);
        let report = tuner.drain(&mut buf)?;
        out.write_all(&buf[..report.bytes])?;
        total += report.bytes as u64;
    }
    out.flush()?;

    let stats = tuner.buffer_stats();
    info!(
        "Samples: {} accepted, {} delivered, {} dropped before ready, {} dropped on overflow",
        stats.accepted, stats.delivered, stats.dropped_not_ready, stats.dropped_overflow
    );
    tuner.destroy();
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "bdatune",
            "--standard",
            "dvb-t",
            "-s",
            "dvb-frequency=522000",
            "--set",
            "dvb-bandwidth=8",
            "-o",
            "out.ts",
            "--duration",
            "5",
        ])
        .unwrap();
        assert_eq!(args.standard, Some(NetworkStandard::DvbT));
        assert_eq!(args.set, vec!["dvb-frequency=522000", "dvb-bandwidth=8"]);
        assert_eq!(args.output, Some(PathBuf::from("out.ts")));
        assert_eq!(args.duration, Some(5));
        assert_eq!(args.log_retention_days, 7);
    }

    #[test]
    fn test_run_records_until_stopped() {
        let path = std::env::temp_dir().join(format!("bdatune-run-{}.ts", std::process::id()));
        let stop = Arc::new(AtomicBool::new(false));
        let worker = std::thread::spawn({
            let stop = Arc::clone(&stop);
            let path = path.clone();
            move || {
                run(
                    LoopbackConfig::default(),
                    TunerSettings {
                        sample_wait_ms: 200,
                        ..TunerSettings::default()
                    },
                    NetworkStandard::DvbC,
                    TuneTable::default(),
                    Some(path),
                    &stop,
                )
                .map_err(|e| e.to_string())
            }
        });

        std::thread::sleep(Duration::from_millis(300));
        stop.store(true, Ordering::Release);
        let written = worker.join().unwrap().unwrap();

        let data = std::fs::read(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(data.len() as u64, written);
        assert!(written > 0);
        assert_eq!(data.len() % bdatune::TS_PACKET_SIZE, 0);
    }
}
