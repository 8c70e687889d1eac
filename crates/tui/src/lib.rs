//! Presentation loop for progress runs: a ratatui view for interactive terminals
//! and a line-oriented renderer for everything else.

#![forbid(unsafe_code)]

mod term;
mod view;

use anyhow::Result;
use mdai_core::{EventStream, ProgressEvent};
use serde::Serialize;
use tracing::{debug, error, info};

pub use term::run_tui;
pub use view::{Flow, LineKind, LogLine, ProgressView};

#[derive(Debug, Clone, Copy, Default)]
pub struct ViewOptions {
    /// Keep `Debug` events in the log.
    pub debug: bool,
    /// Title and spinner only.
    pub quiet: bool,
    /// One JSON object per event (plain renderer only).
    pub json: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed(String),
    Cancelled,
}

impl Outcome {
    pub fn is_success(&self) -> bool { matches!(self, Outcome::Completed) }
}

#[derive(Serialize)]
struct JsonEvent<'a> {
    ts: String,
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
}

fn json_line(ev: &ProgressEvent) -> Result<String> {
    let (kind, text) = match ev {
        ProgressEvent::Task(t) => ("task", Some(t.as_str())),
        ProgressEvent::Message(t) => ("message", Some(t.as_str())),
        ProgressEvent::Debug(t) => ("debug", Some(t.as_str())),
        ProgressEvent::Error(t) => ("error", Some(t.as_str())),
        ProgressEvent::Done => ("done", None),
    };
    let ts = chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, false);
    Ok(serde_json::to_string(&JsonEvent { ts, kind, text })?)
}

/// Non-interactive renderer: drains the stream, mirroring every event into tracing and
/// printing log lines (or JSON objects) on stdout. Ctrl-C cancels the run.
pub async fn run_plain(mut stream: EventStream, opts: ViewOptions) -> Result<Outcome> {
    let mut view = ProgressView::new(opts.debug);
    let mut printed = if opts.json { view.lines().len() } else { 0 };
    loop {
        let next = tokio::select! {
            ev = stream.recv() => ev,
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received; stopping run");
                stream.cancel();
                view.cancel();
                break;
            }
        };
        let Some(ev) = next else {
            view.close(stream.is_cancelled());
            break;
        };
        match &ev {
            ProgressEvent::Task(t) => info!(task = %t, "task"),
            ProgressEvent::Message(t) => info!("{}", t),
            ProgressEvent::Debug(t) => debug!("{}", t),
            ProgressEvent::Error(t) => error!("{}", t),
            ProgressEvent::Done => debug!("done"),
        }
        if opts.json && (opts.debug || !matches!(ev, ProgressEvent::Debug(_))) {
            println!("{}", json_line(&ev)?);
        }
        let flow = view.apply(ev);
        if !opts.json && !opts.quiet {
            for line in &view.lines()[printed..] { println!("{}", line.text); }
            printed = view.lines().len();
        }
        if flow == Flow::Stop { break; }
    }
    Ok(view.outcome())
}
