//! 📊 progress.rs: "Are we there yet?" Every load test, every time, forever.
//!
//! 🚀 Once per status tick the pool supervisor hands this module a snapshot and
//! it redraws a progress bar (length = target records) with a comfy-table grid
//! of rates underneath. On finalize it builds the closing report.
//!
//! ⚠️ Watching this progress bar will not make the broker go faster.
//! Neither will refreshing it. We've tried. Science says no.

use std::fmt;
use std::time::Duration;

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::NOTHING};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::debug;

use crate::app_config::TuningConfig;

/// 🔢 Formats a number with commas for the 3 people in the audience who like readability.
/// "1000000 rec" → "1,000,000 rec". You're welcome, eyes.
pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}

/// ⏱️ Formats a Duration into MM:SS or HH:MM:SS.
/// If it shows HH:MM:SS, the broker is either very slow or very patient.
pub(crate) fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

/// 🌡️ How a throughput number feels, relative to the tuner's watermarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tier {
    /// 🔥 at or above the high watermark
    OnFire,
    /// ✅ at or above mid
    Strong,
    /// ⚠️ at or above low
    Meh,
    /// ❌ below low
    Struggling,
}

impl Tier {
    pub(crate) fn of(rate: f64, tiers: &Watermarks) -> Self {
        if rate >= tiers.high {
            Tier::OnFire
        } else if rate >= tiers.mid {
            Tier::Strong
        } else if rate >= tiers.low {
            Tier::Meh
        } else {
            Tier::Struggling
        }
    }

    pub(crate) fn glyph(self) -> &'static str {
        match self {
            Tier::OnFire => "🔥",
            Tier::Strong => "✅",
            Tier::Meh => "⚠️",
            Tier::Struggling => "❌",
        }
    }

    fn verdict(self) -> &'static str {
        match self {
            Tier::OnFire => "target achieved",
            Tier::Strong => "very high, just short of target",
            Tier::Meh => "good, but below target",
            Tier::Struggling => "target not reached",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.glyph(), self.verdict())
    }
}

/// 📏 The three lines in the sand, copied off the tuning config.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Watermarks {
    pub low: f64,
    pub mid: f64,
    pub high: f64,
}

impl From<&TuningConfig> for Watermarks {
    fn from(tuning: &TuningConfig) -> Self {
        Self {
            low: tuning.low_watermark,
            mid: tuning.mid_watermark,
            high: tuning.high_watermark,
        }
    }
}

/// 📈 Arrow and percent change since the previous sample. No previous sample, no drama.
pub(crate) fn trend(previous: Option<f64>, current: f64) -> (&'static str, f64) {
    match previous {
        Some(previous) if previous > 0.0 => {
            let change = (current - previous) / previous * 100.0;
            let arrow = if change > 0.0 {
                "↑"
            } else if change < 0.0 {
                "↓"
            } else {
                "→"
            };
            (arrow, change.abs())
        }
        _ => ("→", 0.0),
    }
}

/// 📸 Everything the board needs for one redraw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct StatusSnapshot {
    pub current_rate: f64,
    pub total: u64,
    pub overall_rate: f64,
    pub workers: usize,
    pub elapsed: Duration,
}

/// 📊 The producer pool's status board.
pub(crate) struct StatusBoard {
    target: u64,
    watermarks: Watermarks,
    last_rate: Option<f64>,
    progress_bar: ProgressBar,
}

impl fmt::Debug for StatusBoard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // -- 🎭 ProgressBar is a diva and doesn't derive Debug
        f.debug_struct("StatusBoard")
            .field("target", &self.target)
            .field("watermarks", &self.watermarks)
            .field("last_rate", &self.last_rate)
            .finish()
    }
}

impl StatusBoard {
    pub(crate) fn new(target: u64, watermarks: Watermarks) -> Self {
        let progress_bar = ProgressBar::new(target);
        // -- 🎨 cyan because it's classy. the template is a literal, so the fallback is paperwork.
        let style = ProgressStyle::default_bar()
            .template("{msg}\n| [{bar:40.cyan/blue}]")
            .map(|style| style.progress_chars("=>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        progress_bar.set_style(style);
        Self {
            target,
            watermarks,
            last_rate: None,
            progress_bar,
        }
    }

    /// 🔄 Redraw with a fresh snapshot.
    pub(crate) fn update(&mut self, snapshot: StatusSnapshot) {
        let (arrow, change) = trend(self.last_rate, snapshot.current_rate);
        self.last_rate = Some(snapshot.current_rate);
        let tier = Tier::of(snapshot.current_rate, &self.watermarks);
        let percent = if self.target > 0 {
            snapshot.total as f64 / self.target as f64 * 100.0
        } else {
            0.0
        };

        debug!(
            rate = snapshot.current_rate as u64,
            total = snapshot.total,
            workers = snapshot.workers,
            "{} {} rec/s {arrow}{change:.1}% | {:.2}% of target",
            tier.glyph(),
            format_number(snapshot.current_rate as u64),
            percent
        );

        let mut table = Table::new();
        table.load_preset(NOTHING);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.add_row(vec![
            Cell::new(format!(
                "{} {} rec/s {arrow}{change:.1}%",
                tier.glyph(),
                format_number(snapshot.current_rate as u64)
            ))
            .set_alignment(CellAlignment::Right),
            Cell::new(format!("{} rec", format_number(snapshot.total)))
                .set_alignment(CellAlignment::Right),
        ]);
        table.add_row(vec![
            Cell::new(format!("{} rec/s avg", format_number(snapshot.overall_rate as u64)))
                .set_alignment(CellAlignment::Right),
            Cell::new(format!("{} workers", snapshot.workers)).set_alignment(CellAlignment::Right),
        ]);
        table.add_row(vec![
            Cell::new(format!("{:.2}% of {}", percent, format_number(self.target)))
                .set_alignment(CellAlignment::Right),
            Cell::new(format!("{} elapsed", format_duration(snapshot.elapsed)))
                .set_alignment(CellAlignment::Right),
        ]);

        self.progress_bar.set_message(table.to_string());
        self.progress_bar.set_position(snapshot.total.min(self.target));
    }

    /// ✅ Ring the bell. We made it. (Or we were told to stop. Same energy.)
    pub(crate) fn finish(&self) {
        self.progress_bar.finish();
    }
}

/// 🧾 The closing numbers, as a table ready to log.
pub(crate) fn final_report(total: u64, elapsed: Duration, watermarks: &Watermarks) -> String {
    let secs = elapsed.as_secs_f64();
    let overall = if secs > 0.0 { total as f64 / secs } else { 0.0 };
    let mut table = Table::new();
    table.load_preset(NOTHING);
    table.add_row(vec!["Total records".to_string(), format_number(total)]);
    table.add_row(vec!["Total runtime".to_string(), format!("{secs:.2}s")]);
    table.add_row(vec![
        "Overall throughput".to_string(),
        format!("{} rec/s", format_number(overall as u64)),
    ]);
    table.add_row(vec![
        "Verdict".to_string(),
        Tier::of(overall, watermarks).to_string(),
    ]);
    table.to_string()
}
