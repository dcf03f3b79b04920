mod config;
mod detector;
mod error;
mod fetch;
mod metadata;
mod pages;
mod pipeline;
mod report;
mod server;
mod session;
mod store;
mod tally;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use config::{DetectorSettings, FetchSettings, Paths};
use fetch::Fetcher;
use pipeline::Pipeline;
use store::{ModelStore, Role, Upload, UserStore};

#[derive(Parser, Debug)]
#[command(
    name = "sitesafe",
    version,
    about = "Construction-site safety dashboard: helmet compliance and key moments from video"
)]
struct Cli {
    #[command(flatten)]
    opts: GlobalOpts,
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Args, Debug)]
struct GlobalOpts {
    /// Directory holding config/ (users, model paths) and models/
    #[arg(long, global = true, env = "SITESAFE_DATA_DIR", default_value = ".")]
    data_dir: PathBuf,
    /// Directory for input_video.mp4, output_video.mp4 and stats_chart.png
    #[arg(long, global = true, env = "SITESAFE_WORK_DIR", default_value = ".")]
    work_dir: PathBuf,
    /// Minimum class score to keep a detection
    #[arg(long, global = true, default_value_t = config::CONF_THRESHOLD)]
    confidence: f32,
    #[arg(long, global = true, default_value_t = config::NMS_THRESHOLD)]
    nms_iou: f32,
    /// Square model input resolution
    #[arg(long, global = true, default_value_t = config::INPUT_SIZE)]
    input_size: i32,
    #[arg(long, global = true, env = "SITESAFE_YT_DLP", default_value = "yt-dlp")]
    yt_dlp: PathBuf,
    #[arg(long, global = true, env = "SITESAFE_GDOWN", default_value = "gdown")]
    gdown: PathBuf,
    /// Append newline-delimited JSON run events to this file
    #[arg(long, global = true)]
    log_json: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the web dashboard
    Serve {
        #[arg(long, env = "SITESAFE_BIND", default_value = "127.0.0.1:7860")]
        bind: SocketAddr,
    },
    /// Analyze one video URL and print the report
    Analyze { url: String },
    /// Manage dashboard accounts
    Users {
        #[command(subcommand)]
        cmd: UserCommands,
    },
    /// Show or replace the detection model
    Model {
        #[command(subcommand)]
        cmd: ModelCommands,
    },
}

#[derive(Subcommand, Debug)]
enum UserCommands {
    List,
    Add {
        username: String,
        #[arg(long)]
        password: String,
        #[arg(long, default_value = "operator")]
        role: String,
    },
    Update {
        username: String,
        #[arg(long)]
        rename: Option<String>,
        #[arg(long)]
        password: Option<String>,
        #[arg(long)]
        role: Option<String>,
    },
    Remove { username: String },
}

#[derive(Subcommand, Debug)]
enum ModelCommands {
    Show,
    /// Copy weights and metadata into models/ and make them active
    Set { weights: PathBuf, metadata: PathBuf },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    run(cli)
}

fn run(cli: Cli) -> Result<()> {
    let opts = cli.opts;
    let paths = Paths::new(&opts.data_dir, &opts.work_dir);
    paths
        .ensure_dirs()
        .with_context(|| format!("Failed to create {}", opts.data_dir.display()))?;

    let users = UserStore::new(paths.users_file());
    let models = ModelStore::new(&paths);
    let pipeline = Pipeline::new(
        paths.clone(),
        Fetcher::new(FetchSettings {
            yt_dlp: opts.yt_dlp,
            gdown: opts.gdown,
        }),
        DetectorSettings {
            confidence: opts.confidence,
            nms_iou: opts.nms_iou,
            input_size: opts.input_size,
        },
        opts.log_json,
    );

    match cli.cmd {
        Commands::Serve { bind } => {
            // Seed the default admin before the first login attempt.
            let accounts = users.load_users()?;
            tracing::info!(
                accounts = accounts.len(),
                path = %users.path().display(),
                "loaded user store"
            );
            let state = server::AppState::new(users, models, pipeline);
            let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
            runtime.block_on(server::serve(state, bind))
        }
        Commands::Analyze { url } => analyze(&pipeline, &models, &url),
        Commands::Users { cmd } => run_users(&users, cmd),
        Commands::Model { cmd } => run_model(&models, cmd),
    }
}

fn analyze(pipeline: &Pipeline, models: &ModelStore, url: &str) -> Result<()> {
    let bar = ProgressBar::new(1000);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {percent:>3}% {msg}")
            .context("Invalid progress template")?,
    );
    let mut progress = |fraction: f32, message: &str| {
        bar.set_position((fraction.clamp(0.0, 1.0) * 1000.0) as u64);
        bar.set_message(message.to_string());
    };

    let outcome = pipeline.process_video(models, url, &mut progress);
    bar.finish_and_clear();

    if !outcome.is_success() {
        eprintln!("{}", outcome.key_moments);
        bail!("analysis failed");
    }
    println!("{}\n", outcome.summary);
    println!("{}\n", outcome.key_moments);
    if let Some(video) = &outcome.output_video {
        println!("Annotated video: {}", video.display());
    }
    if let Some(chart) = &outcome.stats_chart {
        println!("Chart: {}", chart.display());
    }
    Ok(())
}

fn run_users(users: &UserStore, cmd: UserCommands) -> Result<()> {
    match cmd {
        UserCommands::List => {
            for (name, role) in users.list_users()? {
                println!("{name} ({role})");
            }
        }
        UserCommands::Add {
            username,
            password,
            role,
        } => {
            let role: Role = role.parse()?;
            users.add_user(&username, &password, role)?;
            println!("User '{username}' with role '{role}' added.");
        }
        UserCommands::Update {
            username,
            rename,
            password,
            role,
        } => {
            let role = role.map(|r| r.parse::<Role>()).transpose()?;
            let final_name =
                users.update_user(&username, rename.as_deref(), password.as_deref(), role)?;
            println!("User '{username}' updated to '{final_name}'.");
        }
        UserCommands::Remove { username } => {
            users.delete_user(&username)?;
            println!("User '{username}' deleted.");
        }
    }
    Ok(())
}

fn run_model(models: &ModelStore, cmd: ModelCommands) -> Result<()> {
    match cmd {
        ModelCommands::Show => {
            let config = models.load_config()?;
            let show = |p: &Option<PathBuf>| {
                p.as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            };
            println!("weights: {}", show(&config.weights_path));
            println!("metadata: {}", show(&config.yaml_path));
        }
        ModelCommands::Set { weights, metadata } => {
            let weights_bytes = std::fs::read(&weights)
                .with_context(|| format!("Failed to read {}", weights.display()))?;
            let metadata_bytes = std::fs::read(&metadata)
                .with_context(|| format!("Failed to read {}", metadata.display()))?;
            let dest = models.replace_model(
                Upload {
                    file_name: &weights.to_string_lossy(),
                    bytes: &weights_bytes,
                },
                Upload {
                    file_name: &metadata.to_string_lossy(),
                    bytes: &metadata_bytes,
                },
            )?;
            println!("Model updated. Now using {}.", dest.display());
        }
    }
    Ok(())
}
