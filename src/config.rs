use std::path::{Path, PathBuf};

// Files
pub const CONFIG_DIR: &str = "config";
pub const MODEL_DIR: &str = "models";
pub const USERS_FILE: &str = "users.json";
pub const MODEL_CONFIG_FILE: &str = "config.json";

// Per-run temp outputs (fixed names, one run at a time)
pub const INPUT_VIDEO: &str = "input_video.mp4";
pub const OUTPUT_VIDEO: &str = "output_video.mp4";
pub const STATS_CHART: &str = "stats_chart.png";

// First-run account
pub const DEFAULT_ADMIN_USER: &str = "admin";
pub const DEFAULT_ADMIN_PASSWORD: &str = "admin123";

// Dashboard sessions
pub const MAX_SESSIONS: usize = 256;
pub const SESSION_IDLE_SECS: u64 = 8 * 60 * 60;

// Aggregation
pub const KEY_MOMENT_GAP_SECS: f64 = 2.0; // Quiet period before a class is re-recorded
pub const MAX_LISTED_MOMENTS: usize = 15;

// Class labels the summary reports on
pub const PERSON_CLASS: &str = "Person";
pub const HARDHAT_CLASS: &str = "Hardhat";
pub const NO_HARDHAT_CLASS: &str = "NO-Hardhat";

// AI Thresholds
pub const CONF_THRESHOLD: f32 = 0.25;
pub const NMS_THRESHOLD: f32 = 0.45;
pub const INPUT_SIZE: i32 = 640; // YOLOv8 export resolution

/// Where the dashboard keeps its state. `data_dir` holds `config/` and
/// `models/`; `work_dir` holds the per-run temp files.
#[derive(Debug, Clone)]
pub struct Paths {
    pub data_dir: PathBuf,
    pub work_dir: PathBuf,
}

impl Paths {
    pub fn new(data_dir: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            work_dir: work_dir.into(),
        }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.data_dir.join(CONFIG_DIR)
    }

    pub fn model_dir(&self) -> PathBuf {
        self.data_dir.join(MODEL_DIR)
    }

    pub fn users_file(&self) -> PathBuf {
        self.config_dir().join(USERS_FILE)
    }

    pub fn model_config_file(&self) -> PathBuf {
        self.config_dir().join(MODEL_CONFIG_FILE)
    }

    pub fn input_video(&self) -> PathBuf {
        self.work_dir.join(INPUT_VIDEO)
    }

    pub fn output_video(&self) -> PathBuf {
        self.work_dir.join(OUTPUT_VIDEO)
    }

    pub fn stats_chart(&self) -> PathBuf {
        self.work_dir.join(STATS_CHART)
    }

    pub fn temp_files(&self) -> [PathBuf; 3] {
        [self.input_video(), self.output_video(), self.stats_chart()]
    }

    /// Create `config/` and `models/` if they are missing.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::create_dir_all(self.model_dir())?;
        std::fs::create_dir_all(&self.work_dir)?;
        Ok(())
    }
}

/// Inference knobs shared by the CLI and the web server.
#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub confidence: f32,
    pub nms_iou: f32,
    pub input_size: i32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            confidence: CONF_THRESHOLD,
            nms_iou: NMS_THRESHOLD,
            input_size: INPUT_SIZE,
        }
    }
}

/// External downloader binaries.
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub yt_dlp: PathBuf,
    pub gdown: PathBuf,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            yt_dlp: PathBuf::from("yt-dlp"),
            gdown: PathBuf::from("gdown"),
        }
    }
}

pub fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
