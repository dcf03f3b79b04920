//! Turn a finished run into a bar chart and Markdown text.

use anyhow::{Context, Result};
use opencv::{
    core::{self, Point, Rect, Scalar, Vector},
    imgcodecs, imgproc,
    prelude::*,
};
use std::cmp::Ordering;
use std::fmt::Write as _;
use std::path::Path;

use crate::config::MAX_LISTED_MOMENTS;
use crate::tally::{DetectionStats, KeyMoments, SafetySummary};

/// `MM:SS`, truncating fractional seconds.
pub fn format_timestamp(seconds: f64) -> String {
    let seconds = seconds.max(0.0);
    let minutes = (seconds / 60.0).floor() as u64;
    let secs = (seconds % 60.0).floor() as u64;
    format!("{minutes:02}:{secs:02}")
}

/// Classes by count, largest first; ties by name for a stable chart.
pub fn sorted_counts(stats: &DetectionStats) -> Vec<(&str, u64)> {
    let mut rows: Vec<(&str, u64)> = stats.iter().map(|(k, v)| (k.as_str(), *v)).collect();
    rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    rows
}

pub fn key_moments_markdown(moments: &KeyMoments) -> String {
    if moments.is_empty() {
        return "No key moments.".to_string();
    }

    let mut rows: Vec<(&String, &Vec<f64>)> = moments.iter().collect();
    rows.sort_by(|a, b| match b.1.len().cmp(&a.1.len()) {
        Ordering::Equal => a.0.cmp(b.0),
        other => other,
    });

    let paragraphs: Vec<String> = rows
        .into_iter()
        .map(|(label, times)| {
            let listed: Vec<String> = times
                .iter()
                .take(MAX_LISTED_MOMENTS)
                .map(|t| format!("`{}`", format_timestamp(*t)))
                .collect();
            let more = if times.len() > MAX_LISTED_MOMENTS { " ..." } else { "" };
            format!("**{}:** {}{}", label, listed.join(", "), more)
        })
        .collect();

    format!("### ⏱️ Key Moments\n\n{}", paragraphs.join("\n\n"))
}

pub fn summary_markdown(duration_secs: f64, summary: &SafetySummary) -> String {
    let mut out = String::from("### 📊 Analysis Summary\n");
    let _ = writeln!(out, "- **Total Duration:** `{}`", format_timestamp(duration_secs));
    let _ = writeln!(out, "- **Total People:** `{}`", summary.people);
    let _ = write!(
        out,
        "- **Helmet Compliance:** `{:.2}%` (`{}` with helmet, `{}` without helmet)",
        summary.compliance, summary.hardhat, summary.no_hardhat
    );
    out
}

const CHART_W: i32 = 1200;
const CHART_H: i32 = 700;
const MARGIN_LEFT: i32 = 80;
const MARGIN_RIGHT: i32 = 40;
const MARGIN_TOP: i32 = 70;
const MARGIN_BOTTOM: i32 = 120;

/// Render a count-per-class bar chart to `path` (PNG by extension).
pub fn render_chart(stats: &DetectionStats, path: &Path) -> Result<()> {
    let rows = sorted_counts(stats);
    let max = rows.first().map_or(1, |r| r.1.max(1));

    let white = Scalar::new(255.0, 255.0, 255.0, 0.0);
    let black = Scalar::new(0.0, 0.0, 0.0, 0.0);
    let sky_blue = Scalar::new(235.0, 206.0, 135.0, 0.0);

    let mut canvas = Mat::new_rows_cols_with_default(CHART_H, CHART_W, core::CV_8UC3, white)?;

    imgproc::put_text(
        &mut canvas,
        "Object Detection Statistics",
        Point::new(CHART_W / 2 - 220, 40),
        imgproc::FONT_HERSHEY_SIMPLEX,
        1.0,
        black,
        2,
        imgproc::LINE_AA,
        false,
    )?;

    let plot_w = CHART_W - MARGIN_LEFT - MARGIN_RIGHT;
    let plot_h = CHART_H - MARGIN_TOP - MARGIN_BOTTOM;
    let baseline = MARGIN_TOP + plot_h;
    imgproc::line(
        &mut canvas,
        Point::new(MARGIN_LEFT, baseline),
        Point::new(MARGIN_LEFT + plot_w, baseline),
        black,
        1,
        imgproc::LINE_8,
        0,
    )?;
    imgproc::line(
        &mut canvas,
        Point::new(MARGIN_LEFT, MARGIN_TOP),
        Point::new(MARGIN_LEFT, baseline),
        black,
        1,
        imgproc::LINE_8,
        0,
    )?;

    if !rows.is_empty() {
        let slot = plot_w / rows.len() as i32;
        let bar_w = (slot * 7 / 10).max(2);
        for (i, (label, count)) in rows.iter().enumerate() {
            let bar_h = ((*count as f64 / max as f64) * plot_h as f64).round() as i32;
            let x = MARGIN_LEFT + i as i32 * slot + (slot - bar_w) / 2;
            let bar = Rect::new(x, baseline - bar_h, bar_w, bar_h.max(1));
            imgproc::rectangle(&mut canvas, bar, sky_blue, imgproc::FILLED, imgproc::LINE_8, 0)?;

            imgproc::put_text(
                &mut canvas,
                &count.to_string(),
                Point::new(x, baseline - bar_h - 6),
                imgproc::FONT_HERSHEY_SIMPLEX,
                0.5,
                black,
                1,
                imgproc::LINE_AA,
                false,
            )?;

            let max_chars = ((slot / 9).max(3)) as usize;
            let short: String = label.chars().take(max_chars).collect();
            imgproc::put_text(
                &mut canvas,
                &short,
                Point::new(x, baseline + 22),
                imgproc::FONT_HERSHEY_SIMPLEX,
                0.45,
                black,
                1,
                imgproc::LINE_AA,
                false,
            )?;
        }
    }

    let path_str = path.to_str().context("Chart path is not valid UTF-8")?;
    let written = imgcodecs::imwrite(path_str, &canvas, &Vector::<i32>::new())?;
    if !written {
        anyhow::bail!("Failed to write chart {}", path.display());
    }
    Ok(())
}
