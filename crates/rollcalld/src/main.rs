use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod client;
mod config;
mod dbus_interface;
mod engine;
mod inflight;
mod reconciliation;
mod roster_file;
mod store;
mod submission;
mod workflow;

use client::HttpServiceClient;
use config::Config;
use engine::SourceOpener;
use rollcall_hw::{Camera, CameraError, CapturePlan, FrameSource};
use roster_file::RosterImport;
use store::SqliteStore;

const BUS_NAME: &str = "org.rollcall.Attendance1";
const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load()?;
    tracing::info!(
        camera = %config.camera_device,
        db = %config.db_path.display(),
        recognition = %config.recognition_url,
        "configuration loaded"
    );

    let store = SqliteStore::open(&config.db_path).await?;
    if let Some(path) = &config.roster_file {
        let import = RosterImport::load(path)?;
        let summary = store.import_roster(import).await?;
        tracing::info!(
            path = %path.display(),
            courses = summary.courses,
            students = summary.students,
            enrollments = summary.enrollments,
            "roster imported"
        );
    }

    let services = Arc::new(HttpServiceClient::new(
        &config.recognition_url,
        &config.resolution_url,
        config.recognition_timeout(),
    )?);

    let (device, width, height) = (config.camera_device.clone(), config.camera_width, config.camera_height);
    let opener: SourceOpener = Box::new(move || -> Result<Box<dyn FrameSource>, CameraError> {
        Ok(Box::new(Camera::open(&device, width, height)?))
    });
    let engine = engine::spawn_engine(opener, config.jpeg_quality)?;

    let plan = CapturePlan::new(config.frames_per_capture, config.capture_interval());
    let service = dbus_interface::AttendanceService {
        store: store.clone(),
        workflow: Arc::new(workflow::Workflow::new(engine, services.clone(), services.clone(), plan)),
        submission: submission::SubmissionCoordinator::new(store.clone()),
        reconciler: reconciliation::Reconciler::new(store),
        training: services,
        inflight: inflight::InFlight::new(),
        camera_device: config.camera_device.clone(),
    };

    let _conn = zbus::connection::Builder::system()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on the system bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
