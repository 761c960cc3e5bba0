use std::io::{self, Write};

use crate::core::{JobEvent, JobRun, LogTag, Preset, RunState};
use crate::core::models::format_elapsed;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Pretty,
    Json,
}

/// Writes controller events to a sink, one line each.
pub struct EventPrinter<W: Write> {
    out: W,
    format: OutputFormat,
    last_percent: Option<u32>,
}

impl<W: Write> EventPrinter<W> {
    pub fn new(out: W, format: OutputFormat) -> Self {
        Self {
            out,
            format,
            last_percent: None,
        }
    }

    pub fn print(&mut self, event: &JobEvent) -> io::Result<()> {
        match self.format {
            OutputFormat::Json => {
                serde_json::to_writer(&mut self.out, event)?;
                writeln!(self.out)?;
            }
            OutputFormat::Pretty => self.print_pretty(event)?,
        }
        self.out.flush()
    }

    fn print_pretty(&mut self, event: &JobEvent) -> io::Result<()> {
        match event {
            JobEvent::Log { event, .. } => {
                let time = event.at.with_timezone(&chrono::Local).format("%H:%M:%S");
                writeln!(self.out, "[{time}] {:<8} {}", tag_label(event.tag), event.text)
            }
            JobEvent::Progress(update) => {
                let percent = (update.value * 100.0).round() as u32;
                if self.last_percent == Some(percent) {
                    return Ok(());
                }
                self.last_percent = Some(percent);
                writeln!(self.out, "{:>10} {} {percent:>3}%", "", progress_bar(update.value))
            }
            JobEvent::Lifecycle(t) => {
                write!(self.out, "== {} -> {}", t.from, t.to)?;
                if let Some(code) = t.exit_code {
                    write!(self.out, " (exit code {code})")?;
                }
                if let Some(reason) = &t.reason {
                    write!(self.out, ": {reason}")?;
                }
                writeln!(self.out)
            }
        }
    }

    /// Closing summary for a settled run.
    pub fn summary(&mut self, run: &JobRun) -> io::Result<()> {
        if self.format == OutputFormat::Json {
            return Ok(());
        }

        let count = |tag: LogTag| run.logs.iter().filter(|e| e.tag == tag).count();
        let headline = match run.state {
            RunState::Succeeded => "Compression completed",
            RunState::Cancelled => "Compression cancelled",
            _ => "Compression failed",
        };

        writeln!(self.out, "{}", "=".repeat(60))?;
        writeln!(self.out, "{headline} after {}", format_elapsed(run.elapsed()))?;
        writeln!(self.out, "Output:   {}", run.config.output_dir.display())?;
        writeln!(
            self.out,
            "Lines:    {} ({} progress, {} ok, {} errors, {} warnings)",
            run.logs.len(),
            count(LogTag::Progress),
            count(LogTag::Success),
            count(LogTag::Error),
            count(LogTag::Warning),
        )?;
        writeln!(self.out, "{}", "=".repeat(60))?;
        self.out.flush()
    }
}

fn tag_label(tag: LogTag) -> &'static str {
    match tag {
        LogTag::Progress => "progress",
        LogTag::Success => "ok",
        LogTag::Error => "error",
        LogTag::Warning => "warning",
        LogTag::Plain => "",
    }
}

fn progress_bar(value: f64) -> String {
    const WIDTH: usize = 30;
    let filled = ((value.clamp(0.0, 1.0) * WIDTH as f64).round()) as usize;
    format!("[{}{}]", "#".repeat(filled), "-".repeat(WIDTH - filled))
}

/// Table of the quick presets.
pub fn render_presets(mut out: impl Write) -> io::Result<()> {
    for preset in Preset::ALL {
        let size = preset.target_size();
        writeln!(out, "{:<14} {:>6}   ({})", preset.label(), size.to_string(), size.flag())?;
    }
    Ok(())
}
