//! ema: inspect energy devices and measure the energy of a command.

use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode, ExitStatus};

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{ArgAction, Parser, Subcommand};

use ema::{logging, Config, Ema};

#[derive(Parser)]
#[command(name = "ema")]
#[command(about = "Region based energy measurement")]
#[command(version)]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Directory receiving output.EMA.<pid> and timestamps.EMA.<pid>
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    /// Report format: csv, json
    #[arg(long, global = true)]
    format: Option<String>,

    /// Do not register the RAPL plugin
    #[arg(long, global = true)]
    no_rapl: bool,

    /// Do not register the NVML plugin
    #[arg(long, global = true)]
    no_nvml: bool,

    /// Root of the powercap RAPL tree
    #[arg(long, global = true)]
    powercap_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List plugins and the devices they provide
    Devices,
    /// Run a command as one measured region
    Measure {
        /// Name of the region in the report
        #[arg(short, long, default_value = "region")]
        region: String,

        /// Command to run, followed by its arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

impl Cli {
    fn config(&self) -> Result<Config> {
        let mut config = Config::from_env()?;
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(format) = &self.format {
            config.output_format = format.parse()?;
        }
        if self.no_rapl {
            config.rapl = false;
        }
        if self.no_nvml {
            config.nvml = false;
        }
        if let Some(root) = &self.powercap_root {
            config.powercap_root = root.clone();
        }
        Ok(config)
    }
}

fn run_devices(mut config: Config) -> Result<()> {
    config.write_results = false;
    let ema = Ema::init(config)?;

    for plugin in ema.plugins() {
        let devices = ema.plugin_devices(plugin);
        println!("{}: {} device(s)", plugin, devices.len());
        for device in devices {
            println!(
                "  {} ({}, uid {}, {} uJ)",
                device.name(),
                device.kind(),
                device.uid(),
                device.energy_uj()?
            );
        }
    }

    ema.finalize()
}

fn iso_now() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S%:z").to_string()
}

fn write_timestamps(dir: &Path, start: &str, end: &str) -> Result<PathBuf> {
    let path = dir.join(format!("timestamps.EMA.{}", std::process::id()));
    fs::write(&path, format!("ts_start,ts_end\n{},{}\n", start, end))
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

/// Exit code of a finished child, 128 + signal number when it was killed.
fn exit_code(status: ExitStatus) -> u8 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code as u8,
        (None, Some(signal)) => (128 + signal) as u8,
        (None, None) => 1,
    }
}

fn run_measure(config: Config, region_name: &str, command: &[String]) -> Result<u8> {
    let Some((program, args)) = command.split_first() else {
        bail!("No command given");
    };
    let output_dir = config.output_dir.clone();
    eprintln!("CMD: {}", command.join(" "));

    let ema = Ema::init(config)?;
    if ema.devices().is_empty() {
        eprintln!("Warning: no energy devices available, energy will be reported as zero");
    }

    let ts_start = iso_now();
    let region = ema::region!(ema, region_name)?;
    region.begin()?;

    let status = Command::new(program)
        .args(args)
        .spawn()
        .and_then(|mut child| {
            let child_pid = child.id() as libc::pid_t;
            // The child decides how to react to Ctrl-C, ema keeps running
            // to finish the report.
            let _ = ctrlc::set_handler(move || {
                unsafe { libc::kill(child_pid, libc::SIGINT) };
            });
            child.wait()
        });

    region.end()?;
    let ts_end = iso_now();
    ema.finalize()?;

    let status = status.with_context(|| format!("Failed to run {}", program))?;
    write_timestamps(&output_dir, &ts_start, &ts_end)?;
    Ok(exit_code(status))
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let config = cli.config()?;

    match &cli.command {
        Commands::Devices => {
            run_devices(config)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Measure { region, command } => {
            let code = run_measure(config, region, command)?;
            Ok(ExitCode::from(code))
        }
    }
}
