//! Fetch → detect every frame → tally → report.
//!
//! [`Pipeline::process_video`] never fails: every error of a run is logged
//! and turned into a null result with a Markdown message, and nothing
//! computed before the failure is kept.

use anyhow::{bail, Context, Result};
use opencv::{
    core::Size,
    prelude::*,
    videoio::{self, VideoCapture, VideoWriter},
};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::config::{remove_if_exists, DetectorSettings, Paths};
use crate::detector::{draw_detections, Detector, YoloDetector};
use crate::fetch::Fetcher;
use crate::metadata::ClassNames;
use crate::report;
use crate::store::ModelStore;
use crate::tally::{frame_time, RunTally, SafetySummary};

/// Receives `(fraction in [0, 1], description)` at fixed milestones.
pub trait Progress {
    fn report(&mut self, fraction: f32, message: &str);
}

impl<F: FnMut(f32, &str)> Progress for F {
    fn report(&mut self, fraction: f32, message: &str) {
        self(fraction, message)
    }
}

pub trait FrameSource {
    /// Read the next frame into `frame`; false at end of stream.
    fn read_frame(&mut self, frame: &mut Mat) -> Result<bool>;
}

impl FrameSource for VideoCapture {
    fn read_frame(&mut self, frame: &mut Mat) -> Result<bool> {
        Ok(self.read(frame)? && !frame.empty())
    }
}

pub trait FrameSink {
    fn write_frame(&mut self, frame: &Mat) -> Result<()>;
}

impl FrameSink for VideoWriter {
    fn write_frame(&mut self, frame: &Mat) -> Result<()> {
        self.write(frame)?;
        Ok(())
    }
}

/// What the dashboard shows after a run. On failure both paths are `None`.
#[derive(Debug, Clone, Default)]
pub struct AnalysisOutcome {
    pub output_video: Option<PathBuf>,
    pub stats_chart: Option<PathBuf>,
    pub summary: String,
    pub key_moments: String,
}

impl AnalysisOutcome {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            output_video: None,
            stats_chart: None,
            summary: "---".to_string(),
            key_moments: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.output_video.is_some()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VideoMeta {
    pub fps: f64,
    pub total_frames: u64,
    pub width: i32,
    pub height: i32,
}

impl VideoMeta {
    pub fn duration_secs(&self) -> f64 {
        self.total_frames as f64 / self.fps
    }
}

#[derive(Serialize)]
struct RunStartLog<'a> {
    event: &'static str,
    timestamp: String,
    url: &'a str,
    weights: String,
    fps: f64,
    total_frames: u64,
    width: i32,
    height: i32,
}

#[derive(Serialize)]
struct KeyMomentLog<'a> {
    event: &'static str,
    timestamp: String,
    frame_index: u64,
    class_name: &'a str,
    video_time: f64,
}

#[derive(Serialize)]
struct RunSummaryLog<'a> {
    event: &'static str,
    timestamp: String,
    frames: u64,
    detections: u64,
    people: usize,
    hardhat: usize,
    no_hardhat: usize,
    compliance: f64,
    output_video: &'a str,
}

/// Newline-delimited JSON event log, appended across runs.
pub struct JsonLogger {
    writer: BufWriter<File>,
}

impl JsonLogger {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    fn write_event<T: Serialize>(&mut self, event: &T) -> Result<()> {
        serde_json::to_writer(&mut self.writer, event)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

fn timestamp_now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Result of the frame loop.
#[derive(Debug)]
pub struct FrameRun {
    pub tally: RunTally,
    pub frames: u64,
}

/// Detect, annotate and tally every frame of `source` in order.
pub fn analyze_frames<S, D, W>(
    source: &mut S,
    detector: &mut D,
    sink: &mut W,
    names: &ClassNames,
    meta: &VideoMeta,
    progress: &mut dyn Progress,
    mut log: Option<&mut JsonLogger>,
) -> Result<FrameRun>
where
    S: FrameSource + ?Sized,
    D: Detector + ?Sized,
    W: FrameSink + ?Sized,
{
    let mut tally = RunTally::new();
    let mut frame = Mat::default();
    let mut frames = 0;

    for frame_index in 0..meta.total_frames {
        if !source.read_frame(&mut frame)? {
            break;
        }
        progress.report(
            0.1 + 0.7 * (frame_index as f32 / meta.total_frames as f32),
            &format!("Detecting... frame {}/{}", frame_index + 1, meta.total_frames),
        );

        let detections = detector.detect(&frame)?;
        draw_detections(&mut frame, &detections, names)?;

        let current_time = frame_time(frame_index, meta.fps);
        for det in &detections {
            let Some(class_name) = names.get(det.class_id) else {
                bail!(
                    "Model predicted class {} but the metadata lists only {} names",
                    det.class_id,
                    names.len()
                );
            };
            if tally.record(class_name, current_time) {
                tracing::debug!(class_name, time = current_time, "key moment");
                if let Some(logger) = log.as_deref_mut() {
                    logger.write_event(&KeyMomentLog {
                        event: "key_moment",
                        timestamp: timestamp_now(),
                        frame_index,
                        class_name,
                        video_time: current_time,
                    })?;
                }
            }
        }
        sink.write_frame(&frame)?;
        frames += 1;
    }

    Ok(FrameRun { tally, frames })
}

fn open_video(path: &Path) -> Result<(VideoCapture, VideoMeta)> {
    let path_str = path.to_str().context("Video path is not valid UTF-8")?;
    let capture = VideoCapture::from_file(path_str, videoio::CAP_ANY)
        .with_context(|| format!("Failed to open video {}", path.display()))?;
    if !capture.is_opened()? {
        bail!("Video cannot be read.");
    }

    let fps = capture.get(videoio::CAP_PROP_FPS)?;
    let total_frames = capture.get(videoio::CAP_PROP_FRAME_COUNT)?;
    let width = capture.get(videoio::CAP_PROP_FRAME_WIDTH)? as i32;
    let height = capture.get(videoio::CAP_PROP_FRAME_HEIGHT)? as i32;
    if total_frames < 1.0 || !(fps > 0.0) {
        bail!("Video cannot be read.");
    }

    Ok((
        capture,
        VideoMeta {
            fps,
            total_frames: total_frames as u64,
            width,
            height,
        },
    ))
}

fn create_writer(path: &Path, meta: &VideoMeta) -> Result<VideoWriter> {
    let path_str = path.to_str().context("Output path is not valid UTF-8")?;
    let fourcc = VideoWriter::fourcc('m', 'p', '4', 'v')?;
    let writer = VideoWriter::new(
        path_str,
        fourcc,
        meta.fps,
        Size::new(meta.width, meta.height),
        true,
    )?;
    if !writer.is_opened()? {
        bail!("Failed to create output video {}", path.display());
    }
    Ok(writer)
}

pub struct Pipeline {
    paths: Paths,
    fetcher: Fetcher,
    detector: DetectorSettings,
    event_log: Option<PathBuf>,
}

impl Pipeline {
    pub fn new(
        paths: Paths,
        fetcher: Fetcher,
        detector: DetectorSettings,
        event_log: Option<PathBuf>,
    ) -> Self {
        Self {
            paths,
            fetcher,
            detector,
            event_log,
        }
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    /// Delete the fixed-name input, output and chart files.
    pub fn cleanup_temp_files(&self) {
        for path in self.paths.temp_files() {
            if let Err(e) = remove_if_exists(&path) {
                tracing::warn!(path = %path.display(), "failed to remove temp file: {}", e);
            }
        }
    }

    pub fn process_video(
        &self,
        models: &ModelStore,
        url: &str,
        progress: &mut dyn Progress,
    ) -> AnalysisOutcome {
        self.cleanup_temp_files();

        let url = url.trim();
        if url.is_empty() {
            return AnalysisOutcome::failure("### Error: Please enter a video URL.");
        }
        let config = match models.load_config() {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("failed to load model config: {}", e);
                return AnalysisOutcome::failure(format!("### Error: {e}"));
            }
        };
        let Some((weights, yaml)) = config.paths() else {
            return AnalysisOutcome::failure(
                "### Error: An admin must configure the model in the 'Model Management' tab.",
            );
        };
        if !weights.is_file() || !yaml.is_file() {
            return AnalysisOutcome::failure(format!(
                "### Error: Model files not found. Please upload a valid model in the \
                 'Model Management' tab. Current path: `{}`",
                weights.display()
            ));
        }

        match self.run(url, weights, yaml, progress) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(url, "video analysis failed: {:#}", e);
                AnalysisOutcome::failure(format!("### ❌ An Error Occurred:\n`{e:#}`"))
            }
        }
    }

    fn run(
        &self,
        url: &str,
        weights: &Path,
        yaml: &Path,
        progress: &mut dyn Progress,
    ) -> Result<AnalysisOutcome> {
        progress.report(0.0, "Downloading video...");
        let input = self.fetcher.download(url, &self.paths.input_video())?;

        progress.report(0.1, "Loading model...");
        let names = ClassNames::load(yaml)?;
        let mut detector = YoloDetector::new(weights, names.len(), self.detector.clone())?;

        let (mut capture, meta) = open_video(&input)?;
        let output_video = self.paths.output_video();
        let mut writer = create_writer(&output_video, &meta)?;
        tracing::info!(
            fps = meta.fps,
            frames = meta.total_frames,
            width = meta.width,
            height = meta.height,
            "processing video"
        );

        let mut logger = match self.event_log.as_ref() {
            Some(path) => Some(JsonLogger::open(path)?),
            None => None,
        };
        if let Some(logger) = logger.as_mut() {
            logger.write_event(&RunStartLog {
                event: "run_start",
                timestamp: timestamp_now(),
                url,
                weights: weights.display().to_string(),
                fps: meta.fps,
                total_frames: meta.total_frames,
                width: meta.width,
                height: meta.height,
            })?;
        }

        let run = analyze_frames(
            &mut capture,
            &mut detector,
            &mut writer,
            &names,
            &meta,
            progress,
            logger.as_mut(),
        )?;
        capture.release()?;
        writer.release()?;

        progress.report(0.85, "Generating statistics...");
        let stats_chart = if run.tally.is_empty() {
            None
        } else {
            let path = self.paths.stats_chart();
            report::render_chart(run.tally.stats(), &path)?;
            Some(path)
        };

        progress.report(0.95, "Compiling results...");
        let key_moments = report::key_moments_markdown(run.tally.moments());
        let summary = SafetySummary::from_moments(run.tally.moments());
        let summary_md = report::summary_markdown(meta.duration_secs(), &summary);

        if let Some(logger) = logger.as_mut() {
            logger.write_event(&RunSummaryLog {
                event: "run_summary",
                timestamp: timestamp_now(),
                frames: run.frames,
                detections: run.tally.stats().values().sum(),
                people: summary.people,
                hardhat: summary.hardhat,
                no_hardhat: summary.no_hardhat,
                compliance: summary.compliance,
                output_video: &output_video.display().to_string(),
            })?;
            logger.flush()?;
        }

        remove_if_exists(&input)?;
        tracing::info!(
            frames = run.frames,
            compliance = summary.compliance,
            "analysis complete"
        );
        progress.report(1.0, "Done!");

        Ok(AnalysisOutcome {
            output_video: Some(output_video),
            stats_chart,
            summary: summary_md,
            key_moments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FetchSettings;
    use crate::detector::Detection;
    use crate::store::Upload;
    use opencv::core::{self, Rect, Scalar};
    use std::collections::HashMap;
    use tempfile::TempDir;

    struct BlankFrames {
        remaining: u64,
    }

    impl FrameSource for BlankFrames {
        fn read_frame(&mut self, frame: &mut Mat) -> Result<bool> {
            if self.remaining == 0 {
                return Ok(false);
            }
            self.remaining -= 1;
            *frame = Mat::new_rows_cols_with_default(48, 64, core::CV_8UC3, Scalar::all(0.0))?;
            Ok(true)
        }
    }

    /// Returns the scripted classes for each frame, in call order.
    struct ScriptedDetector {
        script: HashMap<u64, Vec<usize>>,
        frame: u64,
    }

    impl Detector for ScriptedDetector {
        fn detect(&mut self, _frame: &Mat) -> Result<Vec<Detection>> {
            let classes = self.script.get(&self.frame).cloned().unwrap_or_default();
            self.frame += 1;
            Ok(classes
                .into_iter()
                .map(|class_id| Detection {
                    class_id,
                    confidence: 0.9,
                    bbox: Rect::new(4, 4, 20, 20),
                })
                .collect())
        }
    }

    #[derive(Default)]
    struct CountingSink {
        written: u64,
    }

    impl FrameSink for CountingSink {
        fn write_frame(&mut self, _frame: &Mat) -> Result<()> {
            self.written += 1;
            Ok(())
        }
    }

    fn names() -> ClassNames {
        ClassNames::new(vec!["Hardhat".into(), "NO-Hardhat".into(), "Person".into()])
    }

    fn meta(total_frames: u64) -> VideoMeta {
        VideoMeta {
            fps: 30.0,
            total_frames,
            width: 64,
            height: 48,
        }
    }

    fn run_script(script: &[(u64, usize)], total: u64) -> (FrameRun, Vec<f32>, u64) {
        let mut by_frame: HashMap<u64, Vec<usize>> = HashMap::new();
        for &(frame, class) in script {
            by_frame.entry(frame).or_default().push(class);
        }
        let mut detector = ScriptedDetector {
            script: by_frame,
            frame: 0,
        };
        let mut source = BlankFrames { remaining: total };
        let mut sink = CountingSink::default();
        let mut fractions = Vec::new();
        let mut progress = |f: f32, _: &str| fractions.push(f);

        let run = analyze_frames(
            &mut source,
            &mut detector,
            &mut sink,
            &names(),
            &meta(total),
            &mut progress,
            None,
        )
        .unwrap();
        (run, fractions, sink.written)
    }

    #[test]
    fn ninety_frame_clip_end_to_end() {
        let (run, fractions, written) =
            run_script(&[(10, 0), (11, 0), (40, 0), (70, 1)], 90);

        assert_eq!(run.frames, 90);
        assert_eq!(written, 90);
        assert_eq!(run.tally.stats()["Hardhat"], 3);
        assert_eq!(run.tally.stats()["NO-Hardhat"], 1);
        // Frame 40 is 1 s after the frame-10 moment, inside the 2 s window.
        assert_eq!(run.tally.moments()["Hardhat"], vec![11.0 / 30.0]);
        assert_eq!(run.tally.moments()["NO-Hardhat"], vec![71.0 / 30.0]);

        assert_eq!(fractions.len(), 90);
        assert!((fractions[0] - 0.1).abs() < 1e-6);
        assert!(fractions.iter().all(|f| (0.1..0.8).contains(f)));
        assert!(fractions.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn helmet_seen_again_after_gap_counts_twice() {
        let (run, _, _) = run_script(&[(10, 0), (11, 0), (80, 0), (70, 1)], 90);
        let summary = SafetySummary::from_moments(run.tally.moments());
        assert_eq!(summary.hardhat, 2);
        assert_eq!(summary.no_hardhat, 1);
        let md = report::summary_markdown(meta(90).duration_secs(), &summary);
        assert!(md.contains("`66.67%`"));
        assert!(md.contains("`00:03`"));
    }

    #[test]
    fn stops_at_end_of_stream() {
        let mut detector = ScriptedDetector {
            script: HashMap::new(),
            frame: 0,
        };
        let mut source = BlankFrames { remaining: 5 };
        let mut sink = CountingSink::default();
        let run = analyze_frames(
            &mut source,
            &mut detector,
            &mut sink,
            &names(),
            &meta(90),
            &mut |_: f32, _: &str| {},
            None,
        )
        .unwrap();
        assert_eq!(run.frames, 5);
        assert!(run.tally.is_empty());
    }

    #[test]
    fn unknown_class_index_fails_the_run() {
        let mut detector = ScriptedDetector {
            script: HashMap::from([(0, vec![7])]),
            frame: 0,
        };
        let mut source = BlankFrames { remaining: 3 };
        let mut sink = CountingSink::default();
        let err = analyze_frames(
            &mut source,
            &mut detector,
            &mut sink,
            &names(),
            &meta(3),
            &mut |_: f32, _: &str| {},
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("class 7"));
    }

    fn pipeline(dir: &TempDir) -> (Pipeline, ModelStore) {
        let paths = Paths::new(dir.path().join("data"), dir.path().join("work"));
        paths.ensure_dirs().unwrap();
        let models = ModelStore::new(&paths);
        let pipeline = Pipeline::new(
            paths,
            Fetcher::new(FetchSettings::default()),
            DetectorSettings::default(),
            None,
        );
        (pipeline, models)
    }

    #[test]
    fn unconfigured_model_is_reported() {
        let dir = TempDir::new().unwrap();
        let (pipeline, models) = pipeline(&dir);
        let outcome = pipeline.process_video(&models, "https://youtu.be/x", &mut |_: f32, _: &str| {});
        assert!(!outcome.is_success());
        assert_eq!(outcome.summary, "---");
        assert!(outcome.key_moments.contains("Model Management"));
    }

    #[test]
    fn unsupported_url_yields_null_output_and_no_files() {
        let dir = TempDir::new().unwrap();
        let (pipeline, models) = pipeline(&dir);
        models
            .replace_model(
                Upload { file_name: "best.onnx", bytes: b"not-a-real-model" },
                Upload { file_name: "data.yaml", bytes: b"names: [Hardhat]" },
            )
            .unwrap();

        let outcome =
            pipeline.process_video(&models, "http://example.com/x.mp4", &mut |_: f32, _: &str| {});
        assert!(outcome.output_video.is_none());
        assert!(outcome.stats_chart.is_none());
        assert!(outcome.key_moments.contains("Unsupported URL"));
        for path in pipeline.paths().temp_files() {
            assert!(!path.exists(), "{} should not exist", path.display());
        }
    }

    #[test]
    fn cleanup_removes_stale_outputs() {
        let dir = TempDir::new().unwrap();
        let (pipeline, _) = pipeline(&dir);
        for path in pipeline.paths().temp_files() {
            std::fs::write(&path, b"old").unwrap();
        }
        pipeline.cleanup_temp_files();
        for path in pipeline.paths().temp_files() {
            assert!(!path.exists());
        }
    }

    fn read_events(path: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn key_moments_are_logged_as_json_lines() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("runs.ndjson");
        let mut logger = JsonLogger::open(&log_path).unwrap();

        let mut by_frame: HashMap<u64, Vec<usize>> = HashMap::new();
        for (frame, class) in [(10, 0), (40, 0), (80, 0), (12, 2)] {
            by_frame.entry(frame).or_default().push(class);
        }
        let mut detector = ScriptedDetector {
            script: by_frame,
            frame: 0,
        };
        let mut source = BlankFrames { remaining: 90 };
        let mut sink = CountingSink::default();
        let mut progress = |_: f32, _: &str| {};
        analyze_frames(
            &mut source,
            &mut detector,
            &mut sink,
            &names(),
            &meta(90),
            &mut progress,
            Some(&mut logger),
        )
        .unwrap();
        logger.flush().unwrap();

        let events = read_events(&log_path);
        let moments: Vec<(u64, &str)> = events
            .iter()
            .map(|e| {
                assert_eq!(e["event"], "key_moment");
                assert!(e["timestamp"].is_string());
                (e["frame_index"].as_u64().unwrap(), e["class_name"].as_str().unwrap())
            })
            .collect();
        assert_eq!(moments, vec![(10, "Hardhat"), (12, "Person"), (80, "Hardhat")]);
        assert_eq!(events[2]["video_time"].as_f64().unwrap(), 81.0 / 30.0);
    }

    #[test]
    fn run_log_appends_across_runs() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("runs.ndjson");
        for url in ["https://youtu.be/a", "https://youtu.be/b"] {
            let mut logger = JsonLogger::open(&log_path).unwrap();
            logger
                .write_event(&RunStartLog {
                    event: "run_start",
                    timestamp: timestamp_now(),
                    url,
                    weights: "models/best.onnx".to_string(),
                    fps: 30.0,
                    total_frames: 90,
                    width: 64,
                    height: 48,
                })
                .unwrap();
            logger
                .write_event(&RunSummaryLog {
                    event: "run_summary",
                    timestamp: timestamp_now(),
                    frames: 90,
                    detections: 4,
                    people: 1,
                    hardhat: 2,
                    no_hardhat: 1,
                    compliance: 66.67,
                    output_video: "output_video.mp4",
                })
                .unwrap();
            logger.flush().unwrap();
        }

        let events = read_events(&log_path);
        let kinds: Vec<&str> = events.iter().map(|e| e["event"].as_str().unwrap()).collect();
        assert_eq!(kinds, ["run_start", "run_summary", "run_start", "run_summary"]);
        assert_eq!(events[2]["url"], "https://youtu.be/b");
        assert_eq!(events[3]["hardhat"], 2);
    }
}
