use std::path::{Path, PathBuf};
use std::process::exit;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{warn, LevelFilter};

use avrcal::logging::{init_logging, init_logging_with};
use avrcal::telnet::{TelnetSession, TelnetSettings};
use avrcal::{run_transfer, AvrSession, CalibrationFile, Config};

#[derive(Parser, Debug)]
#[command(name = "avrcal", about = "Upload room-correction calibrations to an AV receiver")]
struct Args {
    /// JSON file overriding ports, timeouts and pacing
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the receiver's info and status replies
    Status {
        /// Receiver IP address
        ip: String,
    },
    /// Prepare the receiver and upload a calibration file
    Transfer {
        /// Receiver IP address
        ip: String,
        /// Calibration (.oca) file
        calibration: PathBuf,
        /// Preset (1 or 2) to store the calibration in
        #[arg(long)]
        preset: Option<u8>,
        /// Skip power, preset and bass-management setup
        #[arg(long)]
        skip_setup: bool,
    },
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    match args.verbose {
        0 => init_logging(),
        1 => init_logging_with(LevelFilter::Debug),
        _ => init_logging_with(LevelFilter::Trace),
    }

    let config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => Config::default(),
    };

    let runtime = tokio::runtime::Runtime::new().context("starting async runtime")?;
    runtime.block_on(async {
        match args.command {
            Command::Status { ip } => status(&ip, &config).await,
            Command::Transfer {
                ip,
                calibration,
                preset,
                skip_setup,
            } => transfer(&ip, &calibration, preset, skip_setup, &config).await,
        }
    })
}

async fn status(ip: &str, config: &Config) -> Result<()> {
    let session = AvrSession::connect(ip, config.transfer.clone())
        .await
        .with_context(|| format!("connecting to {ip}"))?;
    let info = session.query_json(avrcal::frame::command::GET_AVRINF).await?;
    let status = session.query_json(avrcal::frame::command::GET_AVRSTS).await?;
    session.close().await?;

    println!("--- GET_AVRINF ---");
    println!("{}", serde_json::to_string_pretty(&info)?);
    println!("--- GET_AVRSTS ---");
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn transfer(
    ip: &str,
    path: &Path,
    preset: Option<u8>,
    skip_setup: bool,
    config: &Config,
) -> Result<()> {
    let calibration = CalibrationFile::load(path)
        .with_context(|| format!("reading calibration {}", path.display()))?;

    if !skip_setup {
        let settings = TelnetSettings::from_calibration(&calibration, preset);
        match prepare(ip, &settings, config).await {
            Ok(()) => {}
            Err(e) => warn!(
                "receiver setup failed ({e:#}); continuing, but check preset, LFE and bass \
                 settings on the receiver"
            ),
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    let mut session = AvrSession::connect(ip, config.transfer.clone())
        .await
        .with_context(|| format!("connecting to {ip}"))?;
    let summary = run_transfer(&mut session, &calibration)
        .await
        .context("calibration transfer failed")?;

    println!("Transferred {} channels ({} data):", summary.channels.len(), summary.data_type);
    println!("  {}", summary.channels.join(", "));
    println!(
        "  {} parameter frames, {} coefficient frames",
        summary.parameter_frames, summary.coefficient_frames
    );
    if !summary.untouched.is_empty() {
        println!("  not modified: {}", summary.untouched.join(", "));
    }
    println!("Use 'Flat' for normal listening levels and 'Reference' for low levels.");
    Ok(())
}

async fn prepare(ip: &str, settings: &TelnetSettings, config: &Config) -> Result<()> {
    let session = TelnetSession::connect(ip, config.telnet.clone()).await?;
    let report = session.prepare_receiver(settings).await;
    session.close().await?;
    let report = report?;
    if let Some(p) = report.preset {
        println!("Calibration will be stored in preset {p}.");
    }
    for cmd in &report.unconfirmed {
        println!("Could not confirm '{cmd}'; please verify it in the receiver menu.");
    }
    Ok(())
}
