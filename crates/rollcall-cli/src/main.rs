use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{DescriptorExtractor, ExtractorConfig, FaceModels};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use zbus::proxy;

#[proxy(
    interface = "io.rollcall.Attendance1",
    default_service = "io.rollcall.Attendance1",
    default_path = "/io/rollcall/Attendance1"
)]
trait Attendance {
    fn enroll(&self, user: &str, image: &[u8]) -> zbus::Result<String>;
    fn verify(
        &self,
        user: &str,
        kind: &str,
        image: &[u8],
        latitude: f64,
        longitude: f64,
    ) -> zbus::Result<String>;
    fn suggest_kind(&self, user: &str) -> zbus::Result<String>;
    fn history(&self, user: &str, from: i64, to: i64) -> zbus::Result<String>;
    fn set_policy(
        &self,
        user: &str,
        required: bool,
        latitude: f64,
        longitude: f64,
        radius_meters: f64,
        label: &str,
    ) -> zbus::Result<()>;
    fn get_policy(&self, user: &str) -> zbus::Result<String>;
    fn remove_profile(&self, user: &str) -> zbus::Result<bool>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll (or re-enroll) a user from a reference photo
    Enroll { user: String, image: PathBuf },
    /// Verify a captured photo and record attendance
    Verify {
        user: String,
        image: PathBuf,
        /// check_in, check_out or auto
        #[arg(short, long, default_value = "auto")]
        kind: String,
        #[arg(long, allow_hyphen_values = true, requires = "lon")]
        lat: Option<f64>,
        #[arg(long, allow_hyphen_values = true, requires = "lat")]
        lon: Option<f64>,
    },
    /// Show which kind of event the user should record next
    Suggest { user: String },
    /// List recent attendance events
    History {
        user: String,
        /// How many days back to look
        #[arg(short, long, default_value_t = 7)]
        days: u64,
    },
    /// Manage a user's geofence
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },
    /// Clear a user's biometric profile
    Remove { user: String },
    /// Show daemon status
    Status,
    /// Run the extraction cascade locally on a photo (no daemon)
    Test {
        image: PathBuf,
        /// Directory containing det_10g.onnx and w600k_r50.onnx
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum PolicyAction {
    /// Set the circular work zone
    Set {
        user: String,
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
        /// Radius in meters
        #[arg(long)]
        radius: f64,
        #[arg(long, default_value = "")]
        label: String,
        /// Record the zone without enforcing it
        #[arg(long)]
        optional: bool,
    },
    /// Print the current policy
    Show { user: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Commands::Test { image, model_dir } = &cli.command {
        return run_diagnostics(image, model_dir.clone().unwrap_or_else(default_model_dir));
    }

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;

    match cli.command {
        Commands::Enroll { user, image } => {
            let bytes = read_image(&image)?;
            let reply = proxy.enroll(&user, &bytes).await?;
            println!("Enrolled {user}");
            print_json(&reply)?;
        }
        Commands::Verify {
            user,
            image,
            kind,
            lat,
            lon,
        } => {
            let bytes = read_image(&image)?;
            let (lat, lon) = (lat.unwrap_or(f64::NAN), lon.unwrap_or(f64::NAN));
            let reply = proxy.verify(&user, &kind, &bytes, lat, lon).await?;
            let v: serde_json::Value = serde_json::from_str(&reply)?;
            let event = &v["event"];
            println!(
                "{} {}: {} (score {:.3})",
                event["kind"].as_str().unwrap_or("?"),
                user,
                event["status"].as_str().unwrap_or("?"),
                event["match_score"].as_f64().unwrap_or(0.0),
            );
            println!("  {}", event["note"].as_str().unwrap_or(""));
            if let Some(warnings) = v["warnings"].as_array() {
                for w in warnings {
                    println!("  warning: {}", w.as_str().unwrap_or(""));
                }
            }
        }
        Commands::Suggest { user } => {
            println!("{}", proxy.suggest_kind(&user).await?);
        }
        Commands::History { user, days } => {
            let now = SystemTime::now().duration_since(UNIX_EPOCH)?;
            let from = now.saturating_sub(Duration::from_secs(days * 86_400));
            let reply = proxy
                .history(&user, from.as_secs() as i64, now.as_secs() as i64)
                .await?;
            print_json(&reply)?;
        }
        Commands::Policy { action } => match action {
            PolicyAction::Set {
                user,
                lat,
                lon,
                radius,
                label,
                optional,
            } => {
                proxy
                    .set_policy(&user, !optional, lat, lon, radius, &label)
                    .await?;
                println!("Geofence for {user}: {radius} m around {lat},{lon}");
            }
            PolicyAction::Show { user } => print_json(&proxy.get_policy(&user).await?)?,
        },
        Commands::Remove { user } => {
            if proxy.remove_profile(&user).await? {
                println!("Removed profile for {user}");
            } else {
                println!("No profile for {user}");
            }
        }
        Commands::Status => print_json(&proxy.status().await?)?,
        Commands::Test { .. } => {}
    }

    Ok(())
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn default_model_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("ROLLCALL_MODEL_DIR") {
        return PathBuf::from(dir);
    }
    std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = std::env::var_os("HOME").unwrap_or_else(|| "/tmp".into());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall/models")
}

fn run_diagnostics(image: &Path, model_dir: PathBuf) -> Result<()> {
    let bytes = read_image(image)?;
    let (w, h) = image::image_dimensions(image)
        .with_context(|| format!("decoding {}", image.display()))?;
    println!("Image: {} ({w}x{h})", image.display());

    for path in FaceModels::model_paths(&model_dir) {
        let mark = if path.exists() { "ok" } else { "MISSING" };
        println!("Model: {} [{mark}]", path.display());
    }

    tracing::debug!(dir = %model_dir.display(), "loading models");
    let models = FaceModels::load(&model_dir)?;
    let config = ExtractorConfig::default();
    let mut extractor = DescriptorExtractor::new(models, &config);
    println!("Cascade: {} steps", extractor.cascade().len());

    match extractor.extract(&bytes) {
        Ok(found) => {
            println!(
                "Face found at step {} of {} ({})",
                found.attempts,
                extractor.cascade().len(),
                found.stage
            );
            println!(
                "Descriptor: {} values, model {}",
                found.descriptor.len(),
                found.descriptor.model_version().unwrap_or("unknown")
            );
            Ok(())
        }
        Err(e) => bail!("extraction failed: {e}"),
    }
}
