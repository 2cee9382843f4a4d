use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use veriface_core::{FaceMatcher, MatcherConfig, ScrfdDetector};

mod proxy;

use proxy::VerifierProxy;

#[derive(Parser)]
#[command(name = "veriface", about = "Veriface identity verification CLI")]
struct Cli {
    /// Talk to the daemon on the system bus (also selected by VERIFACE_BUS=system)
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a photo contains exactly one usable face
    Validate {
        image: PathBuf,
    },
    /// Compare a reference photo with a live photo
    Compare {
        reference: PathBuf,
        live: PathBuf,
    },
    /// Compare photos and send an OTP to the phone on a match
    VerifyFace {
        phone: String,
        reference: PathBuf,
        live: PathBuf,
    },
    /// One-time passcode operations
    Otp {
        #[command(subcommand)]
        action: OtpAction,
    },
    /// Remove expired OTPs now
    Sweep,
    /// Show daemon status
    Status,
    /// Run detection and descriptor extraction locally (bypasses the daemon)
    Check {
        image: PathBuf,
        /// SCRFD model file
        #[arg(long)]
        model: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum OtpAction {
    /// Issue and send a new code
    Generate { phone: String },
    /// Verify a received code
    Verify { phone: String, code: String },
    /// Show whether a code is active
    Status { phone: String },
    /// Replace the current code and send it again
    Resend { phone: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let system = cli.system || std::env::var("VERIFACE_BUS").is_ok_and(|bus| bus == "system");

    let reply = match cli.command {
        Commands::Check { image, model } => return check(&image, model.as_deref()),
        Commands::Validate { image } => {
            let image = read(&image)?;
            connect(system).await?.validate_quality(&image).await?
        }
        Commands::Compare { reference, live } => {
            let (reference, live) = (read(&reference)?, read(&live)?);
            connect(system).await?.compare(&reference, &live).await?
        }
        Commands::VerifyFace {
            phone,
            reference,
            live,
        } => {
            let (reference, live) = (read(&reference)?, read(&live)?);
            connect(system)
                .await?
                .verify_face(&phone, &reference, &live)
                .await?
        }
        Commands::Otp { action } => {
            let proxy = connect(system).await?;
            match action {
                OtpAction::Generate { phone } => proxy.generate_otp(&phone).await?,
                OtpAction::Verify { phone, code } => proxy.verify_otp(&phone, &code).await?,
                OtpAction::Status { phone } => proxy.otp_status(&phone).await?,
                OtpAction::Resend { phone } => proxy.resend_otp(&phone).await?,
            }
        }
        Commands::Sweep => {
            let removed = connect(system).await?.sweep_expired().await?;
            println!("Removed {removed} expired OTP(s)");
            return Ok(());
        }
        Commands::Status => connect(system).await?.status().await?,
    };

    print_json(&reply);
    Ok(())
}

async fn connect(system: bool) -> Result<VerifierProxy<'static>> {
    tracing::debug!(bus = if system { "system" } else { "session" }, "connecting to verifaced");
    let connection = if system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    VerifierProxy::new(&connection)
        .await
        .context("verifaced is not reachable")
}

fn read(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

/// Pretty-print a JSON reply, or print it verbatim if it is not JSON.
fn print_json(reply: &str) {
    match serde_json::from_str::<serde_json::Value>(reply) {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(pretty) => println!("{pretty}"),
            Err(_) => println!("{reply}"),
        },
        Err(_) => println!("{reply}"),
    }
}

/// Local detection and descriptor diagnostic.
fn check(image: &Path, model: Option<&Path>) -> Result<()> {
    let model_path = model
        .map(Path::to_path_buf)
        .unwrap_or_else(|| veriface_core::default_model_dir().join("det_10g.onnx"));
    let bytes = read(image)?;

    tracing::info!(model = %model_path.display(), "loading SCRFD model");
    let detector = ScrfdDetector::load(&model_path.to_string_lossy())?;
    tracing::debug!(bytes = bytes.len(), image = %image.display(), "running local check");
    let mut matcher = FaceMatcher::new(Box::new(detector), MatcherConfig::default());

    let report = matcher.validate_quality(&bytes);
    println!("Faces:    {}", report.face_count);
    if let Some(area) = report.largest_face_area {
        println!("Area:     {area:.0} px²");
    }
    println!("Quality:  {} ({})", if report.is_valid { "ok" } else { "invalid" }, report.reason);

    match matcher.describe(&bytes) {
        Ok(set) => println!("Features: {} ORB descriptors", set.len()),
        Err(e) => println!("Features: {e} [{}]", e.code()),
    }
    Ok(())
}
