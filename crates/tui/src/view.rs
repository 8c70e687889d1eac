use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use mdai_core::ProgressEvent;

use crate::Outcome;

const SPINNER: [&str; 7] = ["▱▱▱", "▰▱▱", "▰▰▱", "▰▰▰", "▰▰▱", "▰▱▱", "▱▱▱"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Normal,
    Debug,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub kind: LineKind,
    pub text: String,
}

/// Render-independent state of a progress run.
#[derive(Debug)]
pub struct ProgressView {
    title: String,
    lines: Vec<LogLine>,
    debug: bool,
    // reset on every message so each line shows the time its step took
    last: Instant,
    frame: usize,
    outcome: Option<Outcome>,
}

fn stamp(now: DateTime<Local>) -> String { format!("[{}]", now.format("%Y-%m-%d %H:%M:%S")) }

impl ProgressView {
    pub fn new(debug: bool) -> Self {
        Self::started_at(debug, Local::now())
    }

    pub fn started_at(debug: bool, now: DateTime<Local>) -> Self {
        Self {
            title: String::new(),
            lines: vec![LogLine { kind: LineKind::Normal, text: format!("{} process started...", stamp(now)) }],
            debug,
            last: Instant::now(),
            frame: 0,
            outcome: None,
        }
    }

    pub fn apply(&mut self, ev: ProgressEvent) -> Flow {
        let elapsed = self.last.elapsed();
        self.apply_at(ev, Local::now(), elapsed)
    }

    /// Like [`apply`](Self::apply) with an explicit clock.
    pub fn apply_at(&mut self, ev: ProgressEvent, now: DateTime<Local>, elapsed: Duration) -> Flow {
        if self.outcome.is_some() { return Flow::Stop; }
        match ev {
            ProgressEvent::Task(t) => self.title = t,
            ProgressEvent::Message(m) => {
                self.lines.push(LogLine { kind: LineKind::Normal, text: format!("{} {} ({:.1?})", stamp(now), m, elapsed) });
                self.last = Instant::now();
            }
            ProgressEvent::Debug(d) => {
                if self.debug { self.lines.push(LogLine { kind: LineKind::Debug, text: format!("{} {}", stamp(now), d) }); }
            }
            ProgressEvent::Error(e) => {
                self.lines.push(LogLine { kind: LineKind::Error, text: format!("{} {}", stamp(now), e) });
                self.outcome = Some(Outcome::Failed(e));
                return Flow::Stop;
            }
            ProgressEvent::Done => {
                self.title = "process complete".into();
                self.outcome = Some(Outcome::Completed);
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    /// The user asked to stop.
    pub fn cancel(&mut self) {
        if self.outcome.is_none() { self.outcome = Some(Outcome::Cancelled); }
    }

    /// The stream ended without a terminal event.
    pub fn close(&mut self, cancelled: bool) {
        if self.outcome.is_none() {
            self.outcome = Some(if cancelled { Outcome::Cancelled } else { Outcome::Failed("progress stream closed unexpectedly".into()) });
        }
    }

    pub fn tick(&mut self) { self.frame = (self.frame + 1) % SPINNER.len(); }

    pub fn spinner(&self) -> &'static str { SPINNER[self.frame] }
    pub fn title(&self) -> &str { &self.title }
    pub fn lines(&self) -> &[LogLine] { &self.lines }
    pub fn since_last(&self) -> Duration { self.last.elapsed() }
    pub fn is_finished(&self) -> bool { self.outcome.is_some() }

    pub fn outcome(&self) -> Outcome {
        self.outcome.clone().unwrap_or(Outcome::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Local> { Local.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap() }

    #[test]
    fn messages_are_stamped_with_elapsed_time() {
        let mut v = ProgressView::started_at(false, at());
        assert_eq!(v.lines()[0].text, "[2024-05-06 07:08:09] process started...");
        let flow = v.apply_at(ProgressEvent::Message("added repo jetstack".into()), at(), Duration::from_millis(1500));
        assert_eq!(flow, Flow::Continue);
        assert_eq!(v.lines()[1].text, "[2024-05-06 07:08:09] added repo jetstack (1.5s)");
    }

    #[test]
    fn task_sets_title_and_done_finishes() {
        let mut v = ProgressView::started_at(false, at());
        v.apply_at(ProgressEvent::Task("adding repos".into()), at(), Duration::ZERO);
        assert_eq!(v.title(), "adding repos");
        assert_eq!(v.lines().len(), 1);
        assert_eq!(v.apply_at(ProgressEvent::Done, at(), Duration::ZERO), Flow::Stop);
        assert_eq!(v.title(), "process complete");
        assert_eq!(v.outcome(), Outcome::Completed);
    }

    #[test]
    fn debug_lines_need_debug_mode() {
        let mut quiet = ProgressView::started_at(false, at());
        quiet.apply_at(ProgressEvent::Debug("listing nodes".into()), at(), Duration::ZERO);
        assert_eq!(quiet.lines().len(), 1);

        let mut loud = ProgressView::started_at(true, at());
        loud.apply_at(ProgressEvent::Debug("listing nodes".into()), at(), Duration::ZERO);
        assert_eq!(loud.lines()[1], LogLine { kind: LineKind::Debug, text: "[2024-05-06 07:08:09] listing nodes".into() });
    }

    #[test]
    fn error_is_marked_and_ignores_later_events() {
        let mut v = ProgressView::started_at(false, at());
        assert_eq!(v.apply_at(ProgressEvent::Error("chart failed".into()), at(), Duration::ZERO), Flow::Stop);
        assert_eq!(v.lines()[1].kind, LineKind::Error);
        assert_eq!(v.apply_at(ProgressEvent::Done, at(), Duration::ZERO), Flow::Stop);
        assert_eq!(v.outcome(), Outcome::Failed("chart failed".into()));
        v.cancel();
        assert_eq!(v.outcome(), Outcome::Failed("chart failed".into()));
    }

    #[test]
    fn closed_stream_without_terminal() {
        let mut v = ProgressView::new(false);
        v.close(false);
        assert!(matches!(v.outcome(), Outcome::Failed(_)));
        let mut c = ProgressView::new(false);
        c.close(true);
        assert_eq!(c.outcome(), Outcome::Cancelled);
    }

    #[test]
    fn spinner_wraps() {
        let mut v = ProgressView::new(false);
        let first = v.spinner();
        for _ in 0..SPINNER.len() { v.tick(); }
        assert_eq!(v.spinner(), first);
    }
}
