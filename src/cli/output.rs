//! Output formatting and progress display

use crate::cli::args::VerbosityLevel;
use crate::core::events::Observer;
use crate::core::progress::{format_bytes, format_bytes_per_second, format_duration, Progress};
use crate::core::task::{Task, TaskId, TaskState};
use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg} {prefix}";
const SPINNER_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] {bytes} {msg} {prefix}";

/// Terminal observer: one progress bar per running task plus coloured state lines
pub struct OutputFormatter {
    verbosity: VerbosityLevel,
    show_progress: bool,
    multi: MultiProgress,
    bars: Mutex<HashMap<TaskId, ProgressBar>>,
}

impl OutputFormatter {
    pub fn new(verbosity: VerbosityLevel, show_progress: bool) -> Self {
        let multi = MultiProgress::new();
        if verbosity == VerbosityLevel::Quiet || !show_progress {
            multi.set_draw_target(ProgressDrawTarget::hidden());
        }
        Self {
            verbosity,
            show_progress: show_progress && verbosity != VerbosityLevel::Quiet,
            multi,
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn bar_style(total: Option<u64>) -> ProgressStyle {
        let template = if total.is_some() { BAR_TEMPLATE } else { SPINNER_TEMPLATE };
        ProgressStyle::with_template(template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-")
    }

    fn line(&self, message: String) {
        if self.verbosity == VerbosityLevel::Quiet {
            return;
        }
        if self.show_progress {
            // keeps bars intact below the printed line
            let _ = self.multi.println(message);
        } else {
            println!("{}", message);
        }
    }

    fn take_bar(&self, id: &TaskId) -> Option<ProgressBar> {
        self.bars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    /// Print info message
    pub fn info(&self, message: &str) {
        self.line(format!("ℹ️  {}", message));
    }

    /// Print success message
    pub fn success(&self, message: &str) {
        self.line(format!("✅ {}", message.green()));
    }

    /// Print warning message
    pub fn warning(&self, message: &str) {
        if self.verbosity != VerbosityLevel::Quiet {
            eprintln!("⚠️  {}", message.yellow());
        }
    }

    /// Print error message
    pub fn error(&self, message: &str) {
        eprintln!("❌ {}", message.red());
    }

    /// Print help text
    pub fn print_help(&self) {
        println!("dlcore - download orchestration");
        println!();
        println!("Usage: dlcore [OPTIONS] <URL>...");
        println!();
        println!("Examples:");
        println!("  dlcore URL1 URL2 URL3");
        println!("  dlcore -j 2 --priority highest URL");
        println!("  dlcore --rate-limit 2MiB/s --output ./downloads URL");
        println!("  dlcore --config dlcore.json URL");
        println!();
        println!("For more information, run: dlcore --help");
    }

    /// Print the end-of-run table
    pub fn print_summary(&self, tasks: &[Task], elapsed: Duration) {
        if self.verbosity == VerbosityLevel::Quiet {
            return;
        }

        println!();
        for task in tasks {
            let state = match task.state {
                TaskState::Completed => task.state.to_string().green(),
                TaskState::Failed => task.state.to_string().red(),
                TaskState::Cancelled | TaskState::Paused => task.state.to_string().yellow(),
                _ => task.state.to_string().normal(),
            };
            let detail = match (&task.error, task.state) {
                (Some(error), _) => error.clone(),
                (None, TaskState::Completed) => format_bytes(task.bytes_transferred),
                _ => String::new(),
            };
            println!("{:>10}  {}  {}", state, task.id, detail.dimmed());
        }

        let summary = Summary::from_tasks(tasks, elapsed);
        println!();
        println!(
            "{} completed, {} failed, {} other, {} in {}",
            summary.completed.to_string().green(),
            summary.failed.to_string().red(),
            summary.other,
            format_bytes(summary.bytes_transferred),
            format_duration(elapsed)
        );
    }
}

impl Observer for OutputFormatter {
    fn on_progress(&self, id: &TaskId, progress: &Progress) {
        if !self.show_progress {
            return;
        }
        let bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(bar) = bars.get(id) {
            if let Some(total) = progress.total_size {
                if bar.length() != Some(total) {
                    bar.set_style(Self::bar_style(Some(total)));
                    bar.set_length(total);
                }
            }
            bar.set_position(progress.downloaded_size);
            if let Some(speed) = progress.speed {
                bar.set_message(format_bytes_per_second(speed));
            }
        }
    }

    fn on_state_changed(&self, id: &TaskId, _from: TaskState, to: TaskState) {
        match to {
            TaskState::Running => {
                if self.show_progress {
                    let bar = self.multi.add(ProgressBar::no_length());
                    bar.set_style(Self::bar_style(None));
                    bar.set_prefix(id.to_string());
                    bar.enable_steady_tick(Duration::from_millis(120));
                    self.bars
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(id.clone(), bar);
                }
                if self.verbosity == VerbosityLevel::Verbose {
                    self.line(format!("{} {}", "started".cyan(), id));
                }
            }
            TaskState::Completed => {
                if let Some(bar) = self.take_bar(id) {
                    bar.finish_and_clear();
                }
                self.line(format!("{} {}", "done".green().bold(), id));
            }
            TaskState::Failed => {
                if let Some(bar) = self.take_bar(id) {
                    bar.abandon();
                }
                self.line(format!("{} {}", "failed".red().bold(), id));
            }
            TaskState::Paused | TaskState::Cancelled => {
                if let Some(bar) = self.take_bar(id) {
                    bar.finish_and_clear();
                }
                self.line(format!("{} {}", to.to_string().yellow(), id));
            }
            TaskState::Pending => {}
        }
    }

    fn on_error(&self, id: &TaskId, error: &str) {
        if self.verbosity == VerbosityLevel::Verbose {
            self.line(format!("  {} {}", id.to_string().dimmed(), error.red()));
        }
    }
}

/// Machine-readable end-of-run report
#[derive(Debug, Serialize)]
pub struct Summary {
    pub completed: usize,
    pub failed: usize,
    /// Tasks left pending, paused or cancelled
    pub other: usize,
    pub bytes_transferred: u64,
    pub elapsed_secs: f64,
    pub tasks: Vec<Task>,
}

impl Summary {
    pub fn from_tasks(tasks: &[Task], elapsed: Duration) -> Self {
        let completed = tasks.iter().filter(|t| t.state == TaskState::Completed).count();
        let failed = tasks.iter().filter(|t| t.state == TaskState::Failed).count();
        Self {
            completed,
            failed,
            other: tasks.len() - completed - failed,
            bytes_transferred: tasks.iter().map(|t| t.bytes_transferred).sum(),
            elapsed_secs: elapsed.as_secs_f64(),
            tasks: tasks.to_vec(),
        }
    }
}
