//! Page rendering collaborator.
//!
//! A [`PageRenderer`] turns one page at one zoom level into a bitmap plus its
//! positioned text runs. [`RenderSlot`] owns the single in-flight render and
//! replaces it atomically, so two renders never race for the same surface.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use regex::Regex;
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::models::{PageText, TextRun, Viewport};

/// Resolution of a page at scale 1.0.
const BASE_DPI: f32 = 72.0;

#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub page: u32,
    pub scale: f32,
    /// PNG bytes; empty when no rasterizer is installed.
    pub bitmap: Vec<u8>,
    pub text: PageText,
}

pub trait PageRenderer: Send + Sync + 'static {
    fn page_count(&self) -> usize;

    /// Renders 1-based `page` at `scale`.
    fn render(&self, page: u32, scale: f32) -> impl Future<Output = Result<RenderedPage>> + Send;

    /// Plain text of the whole document, used to build the semantic index.
    fn document_text(&self) -> impl Future<Output = Result<String>> + Send;
}

struct RenderTask {
    ticket: u64,
    handle: JoinHandle<()>,
}

/// Holder of the one render task allowed to run at a time.
pub struct RenderSlot {
    current: Option<RenderTask>,
    latest: Arc<AtomicU64>,
}

impl Default for RenderSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderSlot {
    pub fn new() -> Self {
        Self {
            current: None,
            latest: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Aborts the in-flight render, if any, then spawns `start(ticket)`.
    ///
    /// A task may still reach its last step after being aborted, so tasks
    /// should compare their ticket with [`RenderSlot::latest`] before
    /// publishing anything.
    pub fn cancel_and_replace<F, Fut>(&mut self, start: F) -> u64
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        let ticket = self.latest.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = tokio::spawn(start(ticket));
        self.current = Some(RenderTask { ticket, handle });
        ticket
    }

    pub fn cancel(&mut self) {
        if let Some(task) = self.current.take() {
            if !task.handle.is_finished() {
                tracing::debug!(ticket = task.ticket, "cancelling in-flight render");
            }
            task.handle.abort();
        }
    }

    /// Shared counter holding the most recently issued ticket.
    pub fn latest(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.latest)
    }

    pub fn current_ticket(&self) -> Option<u64> {
        self.current.as_ref().map(|task| task.ticket)
    }

    pub fn is_busy(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Waits for the in-flight render to finish and returns its ticket.
    pub async fn wait(&mut self) -> Option<u64> {
        let task = self.current.take()?;
        if let Err(err) = task.handle.await {
            if !err.is_cancelled() {
                tracing::warn!(ticket = task.ticket, "render task failed: {err}");
            }
        }
        Some(task.ticket)
    }
}

impl Drop for RenderSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Renders PDFs with the poppler command line tools.
#[derive(Debug, Clone)]
pub struct PopplerRenderer {
    path: PathBuf,
    page_count: usize,
}

impl PopplerRenderer {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_file() {
            bail!("{} is not a readable file", path.display());
        }

        let page_count = get_pdf_page_count(&path).await?;
        tracing::info!(path = %path.display(), page_count, "opened PDF");
        Ok(Self { path, page_count })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_page(&self, page: u32) -> Result<()> {
        if page == 0 || page as usize > self.page_count {
            bail!("page {page} is outside 1..={}", self.page_count);
        }
        Ok(())
    }

    async fn text_layer(&self, page: u32, scale: f32) -> Result<PageText> {
        let output = Command::new("pdftotext")
            .arg("-bbox")
            .arg("-f")
            .arg(page.to_string())
            .arg("-l")
            .arg(page.to_string())
            .arg(&self.path)
            .arg("-")
            .output()
            .await
            .with_context(|| format!("failed to run pdftotext -bbox for page {page}"))?;

        if !output.status.success() {
            bail!("pdftotext -bbox exited with {}", output.status);
        }

        parse_bbox_page(&String::from_utf8_lossy(&output.stdout), scale)
    }

    async fn bitmap(&self, page: u32, scale: f32) -> Result<Vec<u8>> {
        if !has_command("pdftoppm").await {
            tracing::warn!("pdftoppm not found; rendering text layer only");
            return Ok(Vec::new());
        }

        let dpi = (BASE_DPI * scale).round().max(1.0);
        let output = Command::new("pdftoppm")
            .arg("-png")
            .arg("-r")
            .arg(format!("{dpi}"))
            .arg("-f")
            .arg(page.to_string())
            .arg("-l")
            .arg(page.to_string())
            .arg("-singlefile")
            .arg(&self.path)
            .output()
            .await
            .with_context(|| format!("failed to run pdftoppm for page {page}"))?;

        if !output.status.success() {
            bail!("pdftoppm exited with {}", output.status);
        }
        Ok(output.stdout)
    }
}

impl PageRenderer for PopplerRenderer {
    fn page_count(&self) -> usize {
        self.page_count
    }

    async fn render(&self, page: u32, scale: f32) -> Result<RenderedPage> {
        self.check_page(page)?;
        let (bitmap, text) =
            tokio::try_join!(self.bitmap(page, scale), self.text_layer(page, scale))?;
        Ok(RenderedPage {
            page,
            scale,
            bitmap,
            text,
        })
    }

    async fn document_text(&self) -> Result<String> {
        if has_command("pdftotext").await {
            let output = Command::new("pdftotext")
                .arg("-layout")
                .arg("-nopgbrk")
                .arg(&self.path)
                .arg("-")
                .output()
                .await
                .context("failed to run pdftotext")?;

            if output.status.success() {
                let text = String::from_utf8_lossy(&output.stdout).to_string();
                if !text.trim().is_empty() {
                    return Ok(text);
                }
            }
        }

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || pdf_extract::extract_text(&path))
            .await
            .context("PDF extraction task panicked")?
            .context("failed to extract text from PDF")
    }
}

/// Converts `pdftotext -bbox` output for one page into text runs.
///
/// Word boxes are top-down; runs get bottom-up transforms with the origin on
/// the word's baseline, as a PDF text layer reports them.
pub fn parse_bbox_page(html: &str, scale: f32) -> Result<PageText> {
    let page_re = Regex::new(r#"<page width="([0-9.]+)" height="([0-9.]+)">"#)?;
    let word_re = Regex::new(concat!(
        r#"<word xMin="(-?[0-9.]+)" yMin="(-?[0-9.]+)" "#,
        r#"xMax="(-?[0-9.]+)" yMax="(-?[0-9.]+)">([^<]*)</word>"#,
    ))?;

    let caps = page_re
        .captures(html)
        .context("pdftotext output has no page element")?;
    let page_width: f32 = caps[1].parse().context("bad page width")?;
    let page_height: f32 = caps[2].parse().context("bad page height")?;

    let mut runs = Vec::new();
    for caps in word_re.captures_iter(html) {
        let coords: Vec<f32> = (1..=4)
            .map(|i| caps[i].parse::<f32>())
            .collect::<Result<Vec<f32>, _>>()
            .context("bad word coordinates")?;
        let (x_min, y_min, x_max, y_max) = (coords[0], coords[1], coords[2], coords[3]);
        let height = (y_max - y_min).max(0.0);

        runs.push(TextRun {
            text: unescape_entities(&caps[5]),
            transform: [height, 0.0, 0.0, height, x_min, page_height - y_max],
            width: (x_max - x_min).max(0.0),
            height,
        });
    }

    Ok(PageText {
        runs,
        viewport: Viewport::for_page(page_width, page_height, scale),
    })
}

fn unescape_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

async fn get_pdf_page_count(pdf_path: &Path) -> Result<usize> {
    let output = Command::new("pdfinfo")
        .arg(pdf_path)
        .output()
        .await
        .context("failed to run pdfinfo")?;

    if !output.status.success() {
        bail!("pdfinfo exited with non-zero status");
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let regex = Regex::new(r"(?m)^Pages:\s+(\d+)\s*$")?;
    regex
        .captures(&stdout)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<usize>().ok())
        .context("unable to parse page count from pdfinfo")
}

async fn has_command(binary: &str) -> bool {
    Command::new("which")
        .arg(binary)
        .output()
        .await
        .map(|out| out.status.success() && !out.stdout.is_empty())
        .unwrap_or(false)
}
