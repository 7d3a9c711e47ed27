use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_hw::{Camera, CapturePlan, FrameSource};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    fn capture(&self, course_id: &str) -> zbus::Result<String>;
    fn abort_capture(&self, course_id: &str) -> zbus::Result<String>;
    fn submit(&self, course_id: &str, result_json: &str, timestamp: &str) -> zbus::Result<String>;
    fn sessions(&self, course_id: &str) -> zbus::Result<String>;
    fn student_stats(&self, student_id: &str, course_id: &str) -> zbus::Result<String>;
    fn student_overview(&self, student_id: &str) -> zbus::Result<String>;
    fn report(&self, course_id: &str, start: &str, end: &str) -> zbus::Result<String>;
    fn audit(&self, course_id: &str) -> zbus::Result<String>;
    fn train(&self, course_id: &str) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Classroom attendance by face recognition")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Daemon(DaemonCommand),
    /// List camera devices
    Devices,
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Write the captured frame as JPEG
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Commands served by rollcalld over D-Bus.
#[derive(Subcommand)]
enum DaemonCommand {
    /// Capture the classroom and show who was recognized
    Capture {
        course_id: String,
        /// Submit the result right after capture
        #[arg(long)]
        submit: bool,
        /// Also write the capture outcome to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Abort a capture that has not been sent for recognition yet
    Abort { course_id: String },
    /// Submit a saved recognition result
    Submit {
        course_id: String,
        /// JSON file holding a capture outcome or a bare recognition result
        result: PathBuf,
        /// Session time (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<String>,
    },
    /// List recorded sessions of a course
    Sessions { course_id: String },
    /// Attendance stats of one student in one course
    Stats { student_id: String, course_id: String },
    /// Attendance of one student across all enrolled courses
    Overview { student_id: String },
    /// Per-student attendance report for a course
    Report {
        course_id: String,
        /// First day included (YYYY-MM-DD)
        #[arg(long)]
        from: Option<String>,
        /// Last day included (YYYY-MM-DD)
        #[arg(long)]
        to: Option<String>,
    },
    /// Check a course's attendance data for anomalies
    Audit { course_id: String },
    /// Train face models for a course
    Train { course_id: String },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices => list_devices(),
        Commands::Test { device, output } => camera_test(&device, output),
        Commands::Daemon(command) => {
            let conn = zbus::Connection::system()
                .await
                .context("cannot reach the system bus")?;
            let proxy = AttendanceProxy::new(&conn).await?;
            tracing::debug!("connected to rollcalld");
            run(&proxy, command).await
        }
    }
}

async fn run(proxy: &AttendanceProxy<'_>, command: DaemonCommand) -> Result<()> {
    match command {
        DaemonCommand::Capture {
            course_id,
            submit,
            output,
        } => {
            println!("Capturing {course_id}...");
            let outcome: serde_json::Value = serde_json::from_str(&proxy.capture(&course_id).await?)?;
            print_json(&outcome)?;
            if let Some(path) = output {
                std::fs::write(&path, serde_json::to_vec_pretty(&outcome)?)
                    .with_context(|| format!("failed to write {}", path.display()))?;
            }
            if submit {
                let result = recognition_result(outcome)?;
                print_json_str(&proxy.submit(&course_id, &result.to_string(), "").await?)?;
            }
        }
        DaemonCommand::Abort { course_id } => print_json_str(&proxy.abort_capture(&course_id).await?)?,
        DaemonCommand::Submit { course_id, result, at } => {
            let text =
                std::fs::read_to_string(&result).with_context(|| format!("failed to read {}", result.display()))?;
            let result = recognition_result(serde_json::from_str(&text)?)?;
            let receipt = proxy
                .submit(&course_id, &result.to_string(), at.as_deref().unwrap_or(""))
                .await?;
            print_json_str(&receipt)?;
        }
        DaemonCommand::Sessions { course_id } => print_json_str(&proxy.sessions(&course_id).await?)?,
        DaemonCommand::Stats { student_id, course_id } => {
            print_json_str(&proxy.student_stats(&student_id, &course_id).await?)?
        }
        DaemonCommand::Overview { student_id } => print_json_str(&proxy.student_overview(&student_id).await?)?,
        DaemonCommand::Report { course_id, from, to } => {
            let report = proxy
                .report(&course_id, from.as_deref().unwrap_or(""), to.as_deref().unwrap_or(""))
                .await?;
            print_json_str(&report)?;
        }
        DaemonCommand::Audit { course_id } => print_json_str(&proxy.audit(&course_id).await?)?,
        DaemonCommand::Train { course_id } => {
            println!("Training {course_id}...");
            print_json_str(&proxy.train(&course_id).await?)?;
        }
        DaemonCommand::Status => match proxy.status().await {
            Ok(status) => print_json_str(&status)?,
            Err(e) => println!("rollcalld: not connected ({e})"),
        },
    }
    Ok(())
}

/// Accept either a full capture outcome or the bare result inside it.
fn recognition_result(mut value: serde_json::Value) -> Result<serde_json::Value> {
    if value.get("result").is_some() {
        return Ok(value["result"].take());
    }
    if value.get("recognizedStudents").is_none() {
        bail!("not a recognition result: missing recognizedStudents");
    }
    Ok(value)
}

fn print_json_str(text: &str) -> Result<()> {
    print_json(&serde_json::from_str(text)?)
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn list_devices() -> Result<()> {
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No camera devices found");
    }
    for d in devices {
        println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }
    Ok(())
}

fn camera_test(device: &str, output: Option<PathBuf>) -> Result<()> {
    println!("Running camera diagnostics on {device}...");
    let mut camera = Camera::open(device, 640, 480)?;
    println!("Opened {}x{} ({})", camera.width, camera.height, camera.fourcc);

    let plan = CapturePlan::new(1, Duration::from_millis(100));
    let frames = camera.capture_sequence(&plan, &CancellationToken::new())?;
    let Some(frame) = frames.first() else {
        bail!("camera returned no frames");
    };
    println!("Frame brightness: {:.1} (dark: {})", frame.avg_brightness(), frame.is_dark);

    if let Some(path) = output {
        std::fs::write(&path, frame.to_jpeg(90)?).with_context(|| format!("failed to write {}", path.display()))?;
        println!("Wrote {}", path.display());
    }
    Ok(())
}
