use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use geoattend::{
    AttendancePipeline, AttendanceLedger, CancelToken, Config, EnrollmentCapture,
    EnrollmentRegistry, SampleStore, SessionEvent, SessionObserver, SessionState, TracingObserver,
};
use geoattend_core::{CascadeDetector, LbphMatcher, TemplateStore};
use geoattend_hw::Camera;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "geoattend", about = "Geofence-gated face recognition attendance")]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/geoattend/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve the current location and check it against the allowed zones
    Locate,
    /// Capture face samples for a new identity
    Enroll {
        /// Enrollment number (non-negative integer)
        #[arg(short, long)]
        id: String,
        /// Display name
        #[arg(short, long)]
        name: String,
    },
    /// Rebuild the template store from all enrolled samples
    Train,
    /// Take attendance for a subject
    Attend {
        /// Subject label; names the ledger folder and file
        #[arg(short, long)]
        subject: String,
        /// Override the capture window in seconds
        #[arg(long)]
        window_secs: Option<u64>,
    },
    /// List a subject's attendance sheets, oldest first
    Sheets {
        #[arg(short, long)]
        subject: String,
    },
}

/// Prints pipeline progress for a terminal user; everything is also logged.
struct ConsoleObserver;

impl SessionObserver for ConsoleObserver {
    fn on_event(&mut self, event: &SessionEvent<'_>) {
        TracingObserver.on_event(event);
        match event {
            SessionEvent::Geofence(decision) => println!("{decision}"),
            SessionEvent::StateChanged {
                state: SessionState::Running,
                ..
            } => println!("Capturing... press Ctrl-C to stop early"),
            SessionEvent::Accepted { entry, distance } => println!(
                "  present: {} ({}) distance {distance:.1}",
                entry.display_name, entry.identity
            ),
            SessionEvent::SampleSaved { count, quota, .. } => {
                if count % 10 == 0 || count == quota {
                    println!("  samples: {count}/{quota}");
                }
            }
            _ => {}
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("GEOATTEND_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Run a blocking job on the blocking pool; Ctrl-C flips `cancel` and waits
/// for the job to wind down.
async fn run_blocking<T, F>(cancel: CancelToken, job: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let mut handle = tokio::task::spawn_blocking(job);
    tokio::select! {
        joined = &mut handle => joined.context("worker panicked")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received; stopping capture");
            cancel.cancel();
            handle.await.context("worker panicked")?
        }
    }
}

fn locate(config: &Config) -> Result<()> {
    let provider = config.location_provider();
    let decision = config.geofence_gate().check(provider.as_ref());
    println!("{decision}");
    if !decision.is_accepted() {
        bail!("not inside any allowed zone");
    }
    Ok(())
}

fn enroll(config: &Config, id: &str, name: &str, cancel: CancelToken) -> Result<()> {
    let mut registry = EnrollmentRegistry::open(&config.paths.registry)
        .context("failed to open enrollment registry")?;
    let samples = SampleStore::new(&config.paths.training_dir);
    let detector = CascadeDetector::load(&config.cascade_path(), config.enrollment.detector)
        .context("failed to load face cascade")?;
    let mut observer = ConsoleObserver;

    let summary = EnrollmentCapture::new(
        config.enrollment_settings(),
        &mut registry,
        &samples,
        detector,
        &mut observer,
        cancel,
    )
    .enroll(id, name, || {
        Camera::open(
            config.camera.index,
            config.camera.width,
            config.camera.height,
            config.camera_read_timeout(),
        )
    })?;

    println!(
        "Enrolled {} ({}): {} samples in {}",
        summary.record.display_name,
        summary.record.identity,
        summary.samples,
        summary.sample_dir.display()
    );
    if summary.cancelled {
        println!("Capture stopped early; fewer samples than the quota were saved.");
    }
    println!("Run `geoattend train` to update the template store.");
    Ok(())
}

fn train(config: &Config) -> Result<()> {
    let samples = SampleStore::new(&config.paths.training_dir)
        .load_all()
        .with_context(|| format!("failed to read samples from {}", config.paths.training_dir.display()))?;
    if samples.is_empty() {
        bail!("no enrolled samples under {}", config.paths.training_dir.display());
    }

    let store = TemplateStore::train(samples);
    let path = &config.paths.template_store;
    store.save(path).context("failed to save template store")?;

    println!("Trained {} templates into {}", store.len(), path.display());
    Ok(())
}

fn attend(config: &Config, subject: &str, cancel: CancelToken) -> Result<()> {
    let registry = EnrollmentRegistry::open(&config.paths.registry)
        .context("failed to open enrollment registry")?;
    let detector = CascadeDetector::load(&config.cascade_path(), config.session.detector)
        .context("failed to load face cascade")?;
    let gate = config.geofence_gate();
    let ledger = AttendanceLedger::new(&config.paths.attendance_dir);
    let provider = config.location_provider();
    let mut observer = ConsoleObserver;

    let pipeline = AttendancePipeline {
        gate: &gate,
        registry: &registry,
        ledger: &ledger,
        settings: config.session_settings(),
        cancel,
    };
    let report = pipeline.run(
        subject,
        provider.as_ref(),
        detector,
        || LbphMatcher::load(&config.paths.template_store),
        || {
            Camera::open(
                config.camera.index,
                config.camera.width,
                config.camera.height,
                config.camera_read_timeout(),
            )
        },
        &mut observer,
    )?;

    let session = &report.session;
    println!(
        "Attendance for {}: {} present ({} frames{})",
        session.subject_label,
        session.entries.len(),
        session.frames_read,
        if session.cancelled { ", stopped early" } else { "" }
    );
    for entry in &session.entries {
        println!("  {}  {}", entry.identity, entry.display_name);
    }
    println!("Ledger: {}", report.ledger_path.display());
    Ok(())
}

fn sheets(config: &Config, subject: &str) -> Result<()> {
    let ledger = AttendanceLedger::new(&config.paths.attendance_dir);
    let files = ledger
        .list(subject)
        .with_context(|| format!("failed to list sheets for {subject}"))?;
    if files.is_empty() {
        println!("No attendance sheets for {} under {}", subject.trim(), ledger.root().display());
        return Ok(());
    }
    for path in &files {
        match AttendanceLedger::read(path) {
            Ok(rows) => println!("{}  {} present", path.display(), rows.len()),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable sheet");
                println!("{}  unreadable", path.display());
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    let cancel = CancelToken::new();

    match cli.command {
        Commands::Locate => run_blocking(cancel, move || locate(&config)).await,
        Commands::Enroll { id, name } => {
            let token = cancel.clone();
            run_blocking(cancel, move || enroll(&config, &id, &name, token)).await
        }
        Commands::Train => run_blocking(cancel, move || train(&config)).await,
        Commands::Attend {
            subject,
            window_secs,
        } => {
            if let Some(secs) = window_secs {
                if secs == 0 {
                    bail!("--window-secs must be > 0");
                }
                config.session.window_secs = secs;
            }
            let token = cancel.clone();
            run_blocking(cancel, move || attend(&config, &subject, token)).await
        }
        Commands::Sheets { subject } => sheets(&config, &subject),
    }
}
