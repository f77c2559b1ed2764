//! Interface de terminal do photo-jobs: spinners por job e saída colorida.
//!
//! Usa `indicatif` para um spinner por imagem e `console` para estilização.
//! O [`BatchProgress`] consome [`JobEvent`]s e mantém um spinner vivo
//! enquanto o job não chega a um estado terminal.

use std::collections::HashMap;
use std::time::Duration;

use console::Style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use photo_jobs::{BatchSummary, EventKind, Job, JobEvent, JobId, JobStatus};

/// Acompanha visualmente os jobs de uma execução.
pub struct BatchProgress {
    // Agrupador dos spinners do indicatif.
    multi: MultiProgress,
    // Um spinner por job ainda em andamento.
    bars: HashMap<JobId, ProgressBar>,
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl BatchProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    /// Atualiza o spinner do job ou o finaliza quando o job termina.
    pub fn handle(&mut self, event: &JobEvent) {
        let job = &event.job;

        // Linhas de stderr chegam como erro sem mudança de status.
        if event.kind == EventKind::Error && !job.status.is_terminal() {
            if let (Some(pb), Some(text)) = (self.bars.get(&event.job_id), &event.message) {
                pb.println(format!(
                    "  {} {}: {text}",
                    self.yellow.apply_to("!"),
                    job.file_name()
                ));
            }
            return;
        }

        if job.status.is_terminal() {
            if let Some(pb) = self.bars.remove(&event.job_id) {
                pb.finish_and_clear();
            }
            self.print_outcome(job);
            return;
        }

        let line = format!(
            "{} {} {}",
            job.file_name(),
            self.dim.apply_to(format!("[{}]", job.progress.stage)),
            job.progress.message
        );
        match self.bars.get(&event.job_id) {
            Some(pb) => pb.set_message(line),
            None => {
                let pb = self.multi.add(spinner());
                pb.set_message(line);
                self.bars.insert(event.job_id.clone(), pb);
            }
        }
    }

    fn print_outcome(&self, job: &Job) {
        let name = job.file_name();
        let text = match job.status {
            JobStatus::Completed => {
                let mark = match job.quality_passed {
                    Some(false) => self.yellow.apply_to("✓"),
                    _ => self.green.apply_to("✓"),
                };
                let mut text = format!("  {mark} {name}");
                if let Some(score) = job.progress.quality_score {
                    text.push_str(&format!(" (quality {score:.1}/10)"));
                }
                if let Some(path) = &job.output_path {
                    text.push_str(&format!(" -> {}", path.display()));
                }
                text
            }
            JobStatus::Cancelled => format!(
                "  {} {name}: {}",
                self.yellow.apply_to("-"),
                job.progress.message
            ),
            _ => format!(
                "  {} {name}: {}",
                self.red.apply_to("✗"),
                job.progress.message
            ),
        };
        let _ = self.multi.println(text);
    }

    /// Imprime o resumo final de um lote.
    pub fn print_summary(&self, summary: &BatchSummary) {
        let style = if summary.failed == 0 {
            &self.green
        } else {
            &self.red
        };
        println!();
        println!("{}", style.apply_to("─── Batch Summary ───"));
        println!(
            "  {} total, {} completed, {} passed quality, {} failed, {} cancelled",
            summary.total, summary.completed, summary.passed_quality, summary.failed, summary.cancelled
        );
        println!("  success rate: {:.0}%", summary.success_rate * 100.0);
    }
}

fn spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(style);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(job: &Job, kind: EventKind, message: Option<&str>) -> JobEvent {
        JobEvent {
            job_id: job.id.clone(),
            kind,
            message: message.map(str::to_string),
            job: job.clone(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn spinner_lives_until_terminal_event() {
        let mut ui = BatchProgress::new();
        let mut job = Job::new("/tmp/a.jpg".into(), "process".into(), None);

        ui.handle(&event(&job, EventKind::Progress, None));
        assert_eq!(ui.bars.len(), 1);

        job.status = JobStatus::Running;
        ui.handle(&event(&job, EventKind::Error, Some("warning from model")));
        assert_eq!(ui.bars.len(), 1);

        job.status = JobStatus::Completed;
        ui.handle(&event(&job, EventKind::Completed, None));
        assert!(ui.bars.is_empty());
    }
}
