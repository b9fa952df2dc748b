//! Post-folder formatting pipeline.
//!
//! Walks the saved-posts directory, sends unformatted listing text to the
//! chat backend, and writes the result next to the source. Every call is
//! gated by the quota tracker up front; the actual spend reported by the API
//! is recorded once the response arrives.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    errors::Error,
    model::{client::ChatClient, types::ChatRequest},
    quota::{QuotaError, QuotaTracker, Scope},
    Result,
};

const SOURCE_FILE: &str = "text_close.txt";
const OUTPUT_FILE: &str = "text_gpt.txt";
const POST_DIR_PREFIX: &str = "post_";
const USAGE_KIND: &str = "text_formatting";

/// What happened to a single post directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PostOutcome {
    Formatted,
    NoSourceText,
    AlreadyFormatted,
    EmptySource,
    QuotaDenied(Scope),
}

/// Counts for one scan over the posts directory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub formatted: usize,
    pub skipped: usize,
    pub denied: usize,
    pub failed: usize,
}

pub struct FormatterService {
    cfg: Arc<Config>,
    client: Arc<dyn ChatClient>,
    quota: Arc<QuotaTracker>,
}

impl FormatterService {
    pub fn new(cfg: Arc<Config>, client: Arc<dyn ChatClient>, quota: Arc<QuotaTracker>) -> Self {
        Self { cfg, client, quota }
    }

    /// Scan the posts directory once and format everything eligible.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let save_dir = &self.cfg.save_dir;
        if !save_dir.exists() {
            return Err(Error::Config(format!(
                "posts directory {} does not exist",
                save_dir.display()
            )));
        }

        let mut dirs = post_dirs(save_dir)?;
        dirs.sort();
        if dirs.is_empty() {
            info!("no post directories found in {}", save_dir.display());
            return Ok(RunSummary::default());
        }
        info!(
            "found {} post directories in {}",
            dirs.len(),
            save_dir.display()
        );

        let mut summary = RunSummary::default();
        for dir in dirs {
            match self.process_post_dir(&dir).await {
                Ok(PostOutcome::Formatted) => summary.formatted += 1,
                Ok(PostOutcome::QuotaDenied(scope)) => {
                    summary.denied += 1;
                    info!("skipping {}: {scope} token budget exhausted", dir.display());
                }
                Ok(_) => summary.skipped += 1,
                Err(Error::Quota(e)) => {
                    // The recorded spend crossed a ceiling; stop the batch
                    // rather than keep overshooting the budget.
                    summary.failed += 1;
                    warn!("stopping batch after {}: {e}", dir.display());
                    break;
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!("failed to process {}: {e}", dir.display());
                }
            }
        }

        Ok(summary)
    }

    /// Keep scanning on a fixed interval until cancelled.
    pub async fn run_watch(&self, cancel: CancellationToken) -> Result<()> {
        let mut tick = tokio::time::interval(self.cfg.poll_interval);
        loop {
            tokio::select! {
              _ = cancel.cancelled() => break,
              _ = tick.tick() => {
                if let Err(e) = self.run_once().await {
                  warn!("scan failed: {e}");
                }
              }
            }
        }
        Ok(())
    }

    async fn process_post_dir(&self, dir: &Path) -> Result<PostOutcome> {
        let source = dir.join(SOURCE_FILE);
        let output = dir.join(OUTPUT_FILE);

        if !source.exists() {
            debug!("skipping {}: no {SOURCE_FILE}", dir.display());
            return Ok(PostOutcome::NoSourceText);
        }
        if output.exists() {
            debug!("skipping {}: already formatted", dir.display());
            return Ok(PostOutcome::AlreadyFormatted);
        }

        let text = std::fs::read_to_string(&source)?;
        let text = text.trim();
        if text.is_empty() {
            debug!("skipping {}: empty source text", dir.display());
            return Ok(PostOutcome::EmptySource);
        }

        // Gate on the full completion budget before spending anything.
        let proposed = self.cfg.request_token_limit as i64;
        if let Err(e) = self.quota.check(proposed).await {
            match e {
                QuotaError::Exceeded { scope, .. } => return Ok(PostOutcome::QuotaDenied(scope)),
                QuotaError::InvalidTokenCount(_) => return Err(e.into()),
            }
        }

        info!("formatting {}", dir.display());
        let completion = self
            .client
            .complete(ChatRequest {
                system_prompt: self.cfg.format_prompt.clone(),
                user_text: text.to_string(),
                max_tokens: self.cfg.request_token_limit,
            })
            .await?;

        std::fs::write(&output, &completion.text)?;

        let usage = completion.usage;
        info!(
            "formatted {}: prompt={} completion={} total={}",
            dir.display(),
            usage.prompt_tokens,
            usage.completion_tokens,
            usage.total_tokens
        );

        self.quota
            .record(usage.total_tokens as i64, USAGE_KIND)
            .await?;

        Ok(PostOutcome::Formatted)
    }
}

fn post_dirs(save_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(save_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if entry
            .file_name()
            .to_string_lossy()
            .starts_with(POST_DIR_PREFIX)
        {
            out.push(path);
        }
    }
    Ok(out)
}
