/// Human-readable progress output for backup runs

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;
use std::time::Duration;

use crate::core::error::PipelineError;
use crate::core::pipeline::Stage;

/// Receives one event per stage transition
///
/// A failed stage is the last event of a run: no further stages are
/// reported after it.
pub trait ProgressReporter: Send + Sync {
    fn stage_started(&self, stage: Stage);
    fn stage_completed(&self, stage: Stage, detail: &str);
    fn stage_failed(&self, stage: Stage, error: &PipelineError);
    fn database_backed_up(&self, database: &str);
}

/// Spinner while a stage runs, then a `✔` or `✘` line
pub struct ConsoleReporter {
    spinner: Mutex<Option<ProgressBar>>,
}

impl ConsoleReporter {
    pub fn new() -> Self {
        Self {
            spinner: Mutex::new(None),
        }
    }

    fn take_spinner(&self) -> Option<ProgressBar> {
        self.spinner.lock().ok().and_then(|mut guard| guard.take())
    }
}

impl Default for ConsoleReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for ConsoleReporter {
    fn stage_started(&self, stage: Stage) {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg} ({elapsed})") {
            spinner.set_style(style);
        }
        spinner.set_message(format!("{}...", stage.label()));
        spinner.enable_steady_tick(Duration::from_millis(120));

        if let Ok(mut guard) = self.spinner.lock() {
            if let Some(previous) = guard.replace(spinner) {
                previous.finish_and_clear();
            }
        }
    }

    fn stage_completed(&self, _stage: Stage, detail: &str) {
        if let Some(spinner) = self.take_spinner() {
            spinner.finish_and_clear();
        }
        println!("{} {}", "✔".green(), detail);
    }

    fn stage_failed(&self, stage: Stage, error: &PipelineError) {
        if let Some(spinner) = self.take_spinner() {
            spinner.finish_and_clear();
        }
        eprintln!("{} {} failed: {}", "✘".red(), stage.label(), error);
    }

    fn database_backed_up(&self, database: &str) {
        let line = format!("  {} Backup completed for {}", "✔".green(), database);
        match self.spinner.lock().ok().and_then(|guard| guard.clone()) {
            Some(spinner) => spinner.println(line),
            None => println!("{}", line),
        }
    }
}
