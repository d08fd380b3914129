use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lookout_core::{
    present, CameraState, CaptureSession, Config, HttpRecognitionClient, JobStatus, LiveSettings,
    MatchResult, RecognitionService, ResultsState, ResultsStep, Route, StubAuthStore, UploadStep,
    VideoUploadStep,
};
use lookout_media::{list_devices, CameraBackend, MediaAsset, StillImageBackend, V4lBackend};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lookout", about = "Missing-person search against a face-recognition service")]
struct Cli {
    /// Recognition service origin (overrides config)
    #[arg(long, global = true)]
    service_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search one or more videos for the person in a reference photo
    Search {
        /// Reference photo of the missing person
        #[arg(short, long)]
        image: PathBuf,
        /// Videos to search
        #[arg(short, long = "video", required = true, num_args = 1..)]
        videos: Vec<PathBuf>,
        /// Download the annotated video here (single-video searches only)
        #[arg(long)]
        save_video: Option<PathBuf>,
        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Capture camera frames and check them against the reference gallery
    Live {
        /// Use a still image instead of a camera
        #[arg(long)]
        still: Option<PathBuf>,
        /// Number of manual captures
        #[arg(long, default_value_t = 1)]
        frames: u32,
        /// Capture periodically instead of manually
        #[arg(long)]
        auto: bool,
        /// How long to auto-capture, in seconds
        #[arg(long, default_value_t = 10)]
        duration: u64,
    },
    /// Ask the service to reload its reference faces
    Reload,
    /// List V4L2 capture devices
    Devices,
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::load().context("failed to load configuration")?;
    if let Some(url) = cli.service_url {
        config.service_url = url;
    }

    let mut auth = StubAuthStore::default();
    auth.initialize();

    match cli.command {
        Commands::Search {
            image,
            videos,
            save_video,
            json,
        } => {
            enter(Route::Upload, &auth)?;
            search(&config, &image, &videos, save_video.as_deref(), json).await?;
        }
        Commands::Live {
            still,
            frames,
            auto,
            duration,
        } => {
            enter(Route::Live, &auth)?;
            let backend: Arc<dyn CameraBackend> = match still {
                Some(path) => Arc::new(StillImageBackend::from_path(&path)?),
                None => Arc::new(V4lBackend),
            };
            live(&config, backend, frames, auto.then(|| Duration::from_secs(duration))).await?;
        }
        Commands::Reload => {
            let count = client(&config).reload_references().await?;
            println!("Reference faces reloaded: {count}");
        }
        Commands::Devices => {
            let devices = list_devices();
            if devices.is_empty() {
                println!("No capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn enter(route: Route, auth: &StubAuthStore) -> Result<()> {
    let landed = route.guard(auth);
    if landed != route {
        bail!("not signed in; {} requires authentication", route.path());
    }
    Ok(())
}

fn client(config: &Config) -> HttpRecognitionClient {
    HttpRecognitionClient::new(&config.service_url, config.request_timeout())
}

async fn search(
    config: &Config,
    image: &Path,
    videos: &[PathBuf],
    save_video: Option<&Path>,
    json: bool,
) -> Result<()> {
    let service = Arc::new(client(config));

    let mut upload = UploadStep::new();
    let image = MediaAsset::from_path(image)
        .with_context(|| format!("failed to read {}", image.display()))?;
    upload.select_image(image)?;
    let handoff = upload.proceed()?;

    let mut step = VideoUploadStep::enter(Some(handoff), service.clone());
    let orchestrator = step.orchestrator()?;
    let assets = videos
        .iter()
        .map(|path| {
            MediaAsset::from_path(path).with_context(|| format!("failed to read {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;
    let ids = orchestrator.add_videos(assets);

    match ids.as_slice() {
        [] => bail!("none of the inputs is a video"),
        [id] => {
            let mut results = ResultsStep::enter(Some(orchestrator.handoff(*id)?));
            println!("Processing {} ...", orchestrator.jobs()[0].video().name());
            match results.run(service.as_ref()).await {
                ResultsState::Ready(result) => {
                    report(None, result, json)?;
                    if let Some(path) = save_video {
                        download(service.as_ref(), result, path).await?;
                    }
                }
                ResultsState::Failed { error, .. } => bail!("Error processing video: {error}"),
                ResultsState::MissingInput(missing) => bail!("missing {missing}; go back and resubmit"),
                state => bail!("search did not finish: {state:?}"),
            }
        }
        _ => {
            if save_video.is_some() {
                tracing::warn!("--save-video ignored for multi-video searches");
            }
            println!("Processing {} videos ...", ids.len());
            orchestrator.process_all().await;
            let mut failed = 0;
            for job in orchestrator.jobs() {
                match job.status() {
                    JobStatus::Processed(result) => report(Some(job.video().name()), result, json)?,
                    JobStatus::Failed(err) => {
                        failed += 1;
                        eprintln!("{}: Error processing video: {err}", job.video().name());
                    }
                    other => eprintln!("{}: {}", job.video().name(), other.label()),
                }
            }
            if failed > 0 {
                bail!("{failed} of {} videos failed", ids.len());
            }
        }
    }
    Ok(())
}

fn report(name: Option<&str>, result: &MatchResult, json: bool) -> Result<()> {
    if json {
        let value = serde_json::json!({ "video": name, "result": result });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }
    if let Some(name) = name {
        println!("== {name}");
    }
    println!("{}", present(result));
    Ok(())
}

async fn download<S: RecognitionService>(service: &S, result: &MatchResult, path: &Path) -> Result<()> {
    let Some(url) = result.video_url.as_deref() else {
        bail!("the service returned no annotated video");
    };
    let bytes = service.fetch_video(url).await?;
    std::fs::write(path, &bytes).with_context(|| format!("failed to write {}", path.display()))?;
    println!("Annotated video saved to {} ({} bytes)", path.display(), bytes.len());
    Ok(())
}

async fn live(
    config: &Config,
    backend: Arc<dyn CameraBackend>,
    frames: u32,
    auto: Option<Duration>,
) -> Result<()> {
    let service = Arc::new(client(config));
    let settings = LiveSettings::from(config);
    let mut session = CaptureSession::open(backend, config.constraints(), service, settings);

    let camera = session.status().camera;
    let CameraState::Streaming { label } = &camera else {
        bail!("{camera}");
    };
    println!("Camera: {label}");

    // Give the capture thread a moment to publish its first frame.
    tokio::time::sleep(Duration::from_millis(300)).await;

    match auto {
        Some(duration) => {
            session.set_auto_capture(true)?;
            println!(
                "Auto-capturing every {:.1}s for {}s (Ctrl-C to stop)",
                settings.interval.as_secs_f64(),
                duration.as_secs()
            );
            let deadline = tokio::time::sleep(duration);
            tokio::pin!(deadline);
            let mut poll = tokio::time::interval(Duration::from_millis(250));
            let mut last_seen = None;
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    _ = tokio::signal::ctrl_c() => break,
                    _ = poll.tick() => {
                        let status = session.status();
                        if status.last_result_at != last_seen {
                            last_seen = status.last_result_at;
                            if let (Some(result), Some(at)) = (status.last_result, status.last_result_at) {
                                println!("[{}] {result}", at.format("%H:%M:%S"));
                            }
                        }
                    }
                }
            }
        }
        None => {
            for i in 0..frames {
                if i > 0 {
                    tokio::time::sleep(settings.interval).await;
                }
                match session.capture_now().await {
                    Ok(result) => println!("[{}/{frames}] {result}", i + 1),
                    Err(e) => println!("[{}/{frames}] Error processing image: {e}", i + 1),
                }
            }
        }
    }

    session.stop();
    Ok(())
}
