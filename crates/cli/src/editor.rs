//! Edit a document in `$EDITOR` through a temp file.

use std::io::Write;

use anyhow::{anyhow, Context, Result};
use clap::ValueEnum;
use tracing::debug;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum Block { Receivers, Processors, Exporters }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum Phase { Metrics, Logs, Traces }

impl Block {
    fn as_str(self) -> &'static str {
        match self { Block::Receivers => "receivers", Block::Processors => "processors", Block::Exporters => "exporters" }
    }
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self { Phase::Metrics => "metrics", Phase::Logs => "logs", Phase::Traces => "traces" }
    }
}

/// Search argument that opens the editor on the requested section. A block wins over a phase.
pub fn jump_arg(block: Option<Block>, phase: Option<Phase>) -> Option<String> {
    match (block, phase) {
        (Some(b), _) => Some(format!("+/^{}:", b.as_str())),
        (None, Some(p)) => Some(format!("+/^ .*{}:", p.as_str())),
        (None, None) => None,
    }
}

/// Program and leading arguments from an `$EDITOR` value; `vim` when unset.
pub fn editor_command(var: Option<String>) -> (String, Vec<String>) {
    let raw = var.filter(|s| !s.trim().is_empty()).unwrap_or_else(|| "vim".into());
    let mut parts = raw.split_whitespace().map(String::from);
    let program = parts.next().unwrap_or_else(|| "vim".into());
    (program, parts.collect())
}

/// Write `initial` to a temp file, hand it to the editor and return what was saved.
pub async fn edit(initial: &str, jump: Option<String>) -> Result<String> {
    let mut file = tempfile::Builder::new().prefix("otelconfig").suffix(".yaml").tempfile().context("creating temp file")?;
    file.write_all(initial.as_bytes()).context("writing temp file")?;
    file.flush()?;

    let (program, mut args) = editor_command(std::env::var("EDITOR").ok());
    args.push(file.path().display().to_string());
    args.extend(jump);
    debug!(editor = %program, args = ?args, "launching editor");
    let status = tokio::process::Command::new(&program)
        .args(&args)
        .status()
        .await
        .with_context(|| format!("launching editor {}", program))?;
    if !status.success() {
        return Err(anyhow!("editor {} exited with {}", program, status));
    }
    tokio::fs::read_to_string(file.path()).await.context("reading edited file")
}
