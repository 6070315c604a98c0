//! facegate - operator CLI for the face-authentication camera
//!
//! Runs against the simulated camera backend; `--subject` picks which face
//! stands in front of it.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use facegate_lib::biometrics::LocalFileStore;
use facegate_lib::config::{AppConfig, DbMode};
use facegate_lib::device::stub::{SimulatedDevice, DEFAULT_PORT};
use facegate_lib::device::{AlgoFlow, CameraRotation, MatcherConfidenceLevel, SecurityLevel};
use facegate_lib::error::friendly_error;
use facegate_lib::paths::AppPaths;
use facegate_lib::DeviceCoordinator;

#[derive(Parser, Debug)]
#[command(name = "facegate", version, about = "Face-authentication camera coordinator")]
struct Cli {
    /// Config file (defaults to the OS config directory)
    #[arg(long, env = "FACEGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Seed of the face presented to the simulated camera
    #[arg(long, env = "FACEGATE_SIM_SUBJECT")]
    subject: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Authenticate the face in front of the camera
    Authenticate {
        /// Match on the host vector store instead of the device
        #[arg(long)]
        host: bool,
    },

    /// Enroll a user from the camera or from an image file
    Enroll {
        user_id: String,
        /// Store the template on the host
        #[arg(long)]
        host: bool,
        #[arg(long)]
        image: Option<PathBuf>,
    },

    /// List enrolled users of the configured database
    Users,

    /// Remove one user, or everyone with --all
    Remove {
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        user_id: Option<String>,
        #[arg(long)]
        all: bool,
    },

    /// Serial number and firmware version
    Info,

    /// Show or change the device configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Firmware update checks
    Update {
        #[command(subcommand)]
        action: UpdateAction,
    },

    /// Capture preview frames as a multipart stream
    Preview {
        #[arg(long, default_value_t = 10)]
        frames: usize,
        /// Output file (multipart/x-mixed-replace body)
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum UpdateAction {
    /// Is a newer release published
    Check,
    /// Check a firmware file against the device without flashing it
    Inspect { firmware: PathBuf },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    Show,
    Set {
        #[arg(long)]
        algo_flow: Option<AlgoFlow>,
        #[arg(long)]
        rotation: Option<CameraRotation>,
        #[arg(long)]
        security_level: Option<SecurityLevel>,
        #[arg(long)]
        confidence: Option<MatcherConfidenceLevel>,
    },
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(coordinator: &DeviceCoordinator, command: Command) -> Result<()> {
    match command {
        Command::Authenticate { host } => {
            let response = if host || coordinator.db_mode() == DbMode::Host {
                coordinator.authenticate_host().await?
            } else {
                coordinator.authenticate().await?
            };
            print_json(&response)?;
        }
        Command::Enroll {
            user_id,
            host,
            image,
        } => {
            let host = host || coordinator.db_mode() == DbMode::Host;
            let response = match image {
                Some(path) => {
                    let bytes = fs::read(&path)
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    if host {
                        coordinator.enroll_host_image(&user_id, bytes).await?
                    } else {
                        coordinator.enroll_image(&user_id, bytes).await?
                    }
                }
                None if host => coordinator.enroll_host(&user_id).await?,
                None => coordinator.enroll(&user_id).await?,
            };
            print_json(&response)?;
        }
        Command::Users => {
            print_json(&coordinator.list_users().await?)?;
        }
        Command::Remove { user_id, all } => {
            if all {
                coordinator.remove_all_users().await?;
                println!("All users removed");
            } else if let Some(user_id) = user_id {
                coordinator.remove_user(&user_id).await?;
                println!("Removed {}", user_id);
            }
        }
        Command::Info => {
            print_json(&coordinator.query_device_info().await?)?;
        }
        Command::Config { action } => match action {
            ConfigAction::Show => print_json(&coordinator.query_device_config().await?)?,
            ConfigAction::Set {
                algo_flow,
                rotation,
                security_level,
                confidence,
            } => {
                let mut config = coordinator.query_device_config().await?;
                if let Some(v) = algo_flow {
                    config.algo_flow = v;
                }
                if let Some(v) = rotation {
                    config.camera_rotation = v;
                }
                if let Some(v) = security_level {
                    config.security_level = v;
                }
                if let Some(v) = confidence {
                    config.matcher_confidence_level = v;
                }
                print_json(&coordinator.update_device_config(config).await?)?;
            }
        },
        Command::Update { action } => match action {
            UpdateAction::Check => print_json(&coordinator.query_update_status().await?)?,
            UpdateAction::Inspect { firmware } => {
                print_json(&coordinator.query_fw_update_status(&firmware).await?)?
            }
        },
        Command::Preview { frames, out } => {
            if frames == 0 {
                bail!("--frames must be at least 1");
            }
            let mut file = fs::File::create(&out)
                .with_context(|| format!("Failed to create {}", out.display()))?;
            let mut subscription = coordinator.subscribe_preview().await?;
            log::info!("Capturing {} frames (ticket {})", frames, subscription.ticket());
            for _ in 0..frames {
                let chunk = subscription.next_chunk().await?;
                file.write_all(&chunk)?;
            }
            subscription.close().await;
            print_json(&coordinator.preview().stats())?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let paths = AppPaths::new()?;
    paths.ensure_directories()?;

    let config_path = cli.config.clone().unwrap_or_else(|| paths.config_file());
    let mut config = AppConfig::load_or_create(&config_path)?;
    config.apply_env_overrides();
    config.validate()?;

    let db_file = paths.vector_db_file(&config.host_mode.db_file);
    let store = Arc::new(LocalFileStore::open(&db_file).context("Failed to open vector store")?);

    let mut ports = vec![DEFAULT_PORT.to_string()];
    if let Some(port) = config.device.port.clone().filter(|p| p != DEFAULT_PORT) {
        ports.push(port);
    }
    let camera = SimulatedDevice::with_ports(ports);
    if let Some(seed) = cli.subject {
        camera.present_subject(seed);
    }
    camera.set_frame_interval(Some(Duration::from_millis(66)));

    let coordinator = DeviceCoordinator::new(Arc::new(camera), store, &config)?;

    if let Err(e) = run(&coordinator, cli.command).await {
        match e.downcast_ref::<facegate_lib::Error>() {
            Some(err) => {
                let friendly = friendly_error(err);
                log::error!("{}", friendly.technical);
                eprintln!("{} [{}]", friendly.message, friendly.code);
            }
            None => eprintln!("Error: {:#}", e),
        }
        std::process::exit(1);
    }

    Ok(())
}
