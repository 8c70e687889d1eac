use std::io::{self, Stdout};
use std::time::Duration;

use anyhow::{Context, Result};
use crossterm::event::{Event, EventStream as KeyStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use futures::StreamExt;
use mdai_core::EventStream;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Paragraph, Wrap};
use ratatui::{Frame, Terminal};
use tracing::debug;

use crate::view::{Flow, LineKind, ProgressView};
use crate::{Outcome, ViewOptions};

type Term = Terminal<CrosstermBackend<Stdout>>;

/// Owns raw mode and the alternate screen; dropping it restores the terminal.
struct TerminalGuard {
    terminal: Term,
}

impl TerminalGuard {
    fn enter() -> Result<Self> {
        enable_raw_mode().context("enable raw mode")?;
        let mut stdout = io::stdout();
        if let Err(e) = execute!(stdout, EnterAlternateScreen) {
            disable_raw_mode().ok();
            return Err(e).context("enter alternate screen");
        }
        match Terminal::new(CrosstermBackend::new(stdout)) {
            Ok(terminal) => Ok(Self { terminal }),
            Err(e) => {
                disable_raw_mode().ok();
                execute!(io::stdout(), LeaveAlternateScreen).ok();
                Err(e).context("create terminal")
            }
        }
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        disable_raw_mode().ok();
        execute!(self.terminal.backend_mut(), LeaveAlternateScreen).ok();
        self.terminal.show_cursor().ok();
    }
}

fn is_quit(key: &KeyEvent) -> bool {
    if key.kind != KeyEventKind::Press { return false; }
    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => true,
        KeyCode::Char('c') => key.modifiers.contains(KeyModifiers::CONTROL),
        _ => false,
    }
}

fn style_for(kind: LineKind) -> Style {
    match kind {
        LineKind::Normal => Style::default().fg(Color::Gray),
        LineKind::Debug => Style::default().fg(Color::DarkGray),
        LineKind::Error => Style::default().fg(Color::Red),
    }
}

fn render(frame: &mut Frame, view: &ProgressView, quiet: bool) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(1), Constraint::Min(0)])
        .split(frame.size());

    let mut header = vec![
        Span::styled(view.spinner(), Style::default().fg(Color::Magenta)),
        Span::raw(" "),
        Span::styled(view.title().to_string(), Style::default().add_modifier(Modifier::BOLD | Modifier::UNDERLINED)),
    ];
    if !quiet {
        header.push(Span::raw(format!(" ({}s)", view.since_last().as_secs())));
    }
    frame.render_widget(Paragraph::new(Line::from(header)), chunks[0]);
    if quiet { return; }

    let lines: Vec<Line> = view.lines().iter().map(|l| Line::styled(l.text.clone(), style_for(l.kind))).collect();
    // follow the tail
    let overflow = lines.len().saturating_sub(chunks[1].height as usize);
    let body = Paragraph::new(lines).wrap(Wrap { trim: false }).scroll((u16::try_from(overflow).unwrap_or(u16::MAX), 0));
    frame.render_widget(body, chunks[1]);
}

/// Interactive renderer. Returns once the run ends or the user quits; on quit the
/// stream is cancelled so the producer stops at its next step boundary.
pub async fn run_tui(mut stream: EventStream, opts: ViewOptions) -> Result<(Outcome, ProgressView)> {
    let mut guard = TerminalGuard::enter()?;
    let mut view = ProgressView::new(opts.debug);
    let mut keys = KeyStream::new();
    let mut tick = tokio::time::interval(Duration::from_millis(120));

    loop {
        guard.terminal.draw(|f| render(f, &view, opts.quiet)).context("drawing progress view")?;
        tokio::select! {
            ev = stream.recv() => match ev {
                Some(ev) => if view.apply(ev) == Flow::Stop { break; },
                None => { view.close(stream.is_cancelled()); break; }
            },
            key = keys.next() => match key {
                Some(Ok(Event::Key(k))) if is_quit(&k) => {
                    debug!("quit requested");
                    stream.cancel();
                    view.cancel();
                    break;
                }
                Some(Err(e)) => return Err(e).context("reading terminal events"),
                _ => {}
            },
            _ = tick.tick() => view.tick(),
        }
    }
    guard.terminal.draw(|f| render(f, &view, opts.quiet)).ok();
    drop(guard);
    Ok((view.outcome(), view))
}
