//! Headless-browser page rendering through a short Node + Playwright script.
//!
//! Expected setup: Node.js on PATH (or `node_bin`), the `playwright` npm package resolvable by
//! Node, and a Chromium install (`npx playwright install chromium`). Nothing is installed at
//! runtime; a missing toolchain surfaces as `Error::NotConfigured`.

use answerpipe_core::{Error, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub enabled: bool,
    pub node_bin: String,
    /// Extra NODE_PATH entries (e.g. the output of `npm root -g`).
    pub node_path: Option<String>,
    pub timeout_ms: u64,
    pub max_html_chars: usize,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            node_bin: "node".to_string(),
            node_path: None,
            timeout_ms: 20_000,
            max_html_chars: 2_000_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub final_url: String,
    pub status: Option<u16>,
    pub html: String,
    pub elapsed_ms: u64,
}

const RENDER_SCRIPT: &str = r#"
const fs = require('fs');

const reply = (body) => process.stdout.write(JSON.stringify(body));
const fail = (code, message) => reply({ ok: false, error: { code, message } });
const describe = (e) => String(e && e.message ? e.message : e);

async function render() {
  let input;
  try { input = JSON.parse(fs.readFileSync(0, 'utf8') || '{}'); }
  catch (_) { return fail('invalid_params', 'render request is not valid JSON'); }

  let playwright;
  try { playwright = require('playwright'); }
  catch (_) { return fail('not_configured', 'node cannot resolve the "playwright" package'); }

  const target = String(input.url || '').trim();
  if (!target) return fail('invalid_params', 'render request has no url');
  const navTimeout = Number(input.timeout_ms || 20000);
  const started = Date.now();

  let browser;
  try {
    browser = await playwright.chromium.launch({ headless: true });
    const ctx = await browser.newContext({ serviceWorkers: 'block', locale: input.locale || undefined });
    const page = await ctx.newPage();
    // Text is all we keep, so heavy assets are skipped.
    await page.route('**/*', (r) => {
      const kind = r.request().resourceType();
      return ['image', 'media', 'font'].includes(kind) ? r.abort() : r.continue();
    }).catch(() => {});
    const resp = await page.goto(target, { waitUntil: 'domcontentloaded', timeout: navTimeout });
    await page.waitForLoadState('networkidle', { timeout: Math.min(5000, navTimeout) }).catch(() => {});
    reply({
      ok: true,
      final_url: page.url(),
      status: resp ? resp.status() : null,
      html: await page.content(),
      elapsed_ms: Date.now() - started,
    });
  } catch (e) {
    fail('fetch_failed', describe(e));
  } finally {
    if (browser) await browser.close().catch(() => {});
  }
}

render().catch((e) => fail('fetch_failed', describe(e)));
"#;

/// Slack on top of the navigation timeout for browser start-up and shutdown.
const PROCESS_SLACK_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct PlaywrightRenderer {
    settings: RenderSettings,
}

impl PlaywrightRenderer {
    pub fn new(settings: RenderSettings) -> Self {
        Self { settings }
    }

    pub fn enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Longest a single [`render`](Self::render) call can run before the process is killed.
    pub fn budget_ms(&self) -> u64 {
        self.settings.timeout_ms.saturating_add(PROCESS_SLACK_MS)
    }

    fn command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.settings.node_bin);
        if let Some(extra) = self.settings.node_path.as_deref() {
            let node_path = match std::env::var("NODE_PATH") {
                Ok(cur) if !cur.trim().is_empty() => format!("{cur}:{extra}"),
                _ => extra.to_string(),
            };
            cmd.env("NODE_PATH", node_path);
        }
        cmd.arg("-e")
            .arg(RENDER_SCRIPT)
            .kill_on_drop(true)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    /// Render `url` and return the post-JS DOM.
    ///
    /// The node process gets the navigation timeout plus a fixed slack; past that it is killed.
    /// Dropping the future kills it too.
    pub async fn render(&self, url: &str, locale: Option<&str>) -> Result<RenderedPage> {
        if !self.settings.enabled {
            return Err(Error::NotConfigured(
                "page rendering is disabled (render.enabled = false)".to_string(),
            ));
        }
        let started = std::time::Instant::now();
        let request = serde_json::json!({
            "url": url,
            "timeout_ms": self.settings.timeout_ms,
            "locale": locale,
        })
        .to_string();
        let deadline = Duration::from_millis(self.budget_ms());

        let mut child = self.command().spawn().map_err(|e| {
            Error::NotConfigured(format!(
                "page rendering needs node at `{}`: {e}",
                self.settings.node_bin
            ))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            // The script reports a write failure as invalid_params.
            let _ = stdin.write_all(request.as_bytes()).await;
            let _ = stdin.shutdown().await;
        }

        // Pipes are drained separately so the child stays killable on timeout.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        match tokio::time::timeout(deadline, child.wait()).await {
            Ok(status) => {
                status.map_err(|e| Error::Fetch(format!("render process failed: {e}")))?;
            }
            Err(_) => {
                let _ = child.kill().await;
                stdout.abort();
                stderr.abort();
                return Err(Error::Fetch(format!(
                    "render process killed after {}ms",
                    deadline.as_millis()
                )));
            }
        }

        let out = stdout.await.unwrap_or_default();
        let err = stderr.await.unwrap_or_default();
        let page = parse_render_output(&out, &err, url, self.settings.max_html_chars)?;
        tracing::debug!(
            url,
            final_url = %page.final_url,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "rendered page"
        );
        Ok(page)
    }
}

fn drain<R>(pipe: Option<R>) -> tokio::task::JoinHandle<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut r) = pipe {
            let _ = r.read_to_end(&mut buf).await;
        }
        buf
    })
}

/// Interpret the script's JSON-only stdout.
fn parse_render_output(
    stdout: &[u8],
    stderr: &[u8],
    url: &str,
    max_html_chars: usize,
) -> Result<RenderedPage> {
    let body = String::from_utf8_lossy(stdout);
    let v: serde_json::Value = serde_json::from_str(body.trim()).map_err(|e| {
        let diag = String::from_utf8_lossy(stderr);
        match diag.trim() {
            "" => Error::Fetch(format!("render output is not JSON: {e}")),
            diag => Error::Fetch(format!("render output is not JSON: {e} (stderr: {diag})")),
        }
    })?;

    if v.get("ok").and_then(|x| x.as_bool()) != Some(true) {
        let code = v
            .pointer("/error/code")
            .and_then(|x| x.as_str())
            .unwrap_or("fetch_failed");
        let message = v
            .pointer("/error/message")
            .and_then(|x| x.as_str())
            .unwrap_or("render failed")
            .to_string();
        return Err(match code {
            "not_configured" => Error::NotConfigured(message),
            "invalid_params" => Error::InvalidUrl(message),
            _ => Error::Fetch(message),
        });
    }

    let html = v
        .get("html")
        .and_then(|x| x.as_str())
        .unwrap_or("")
        .to_string();
    if html.trim().is_empty() {
        return Err(Error::Fetch(
            "render produced an empty document".to_string(),
        ));
    }
    if html.len() > max_html_chars {
        return Err(Error::Fetch(format!(
            "rendered document too large ({} > {max_html_chars} chars)",
            html.len()
        )));
    }

    Ok(RenderedPage {
        final_url: v
            .get("final_url")
            .and_then(|x| x.as_str())
            .unwrap_or(url)
            .to_string(),
        status: v.get("status").and_then(|x| x.as_u64()).map(|n| n as u16),
        html,
        elapsed_ms: v.get("elapsed_ms").and_then(|x| x.as_u64()).unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_renderer_is_not_configured() {
        let r = PlaywrightRenderer::new(RenderSettings {
            enabled: false,
            ..RenderSettings::default()
        });
        let err = r.render("https://example.com", None).await.unwrap_err();
        assert!(matches!(err, Error::NotConfigured(_)));
    }

    #[tokio::test]
    async fn missing_node_binary_is_not_configured() {
        let r = PlaywrightRenderer::new(RenderSettings {
            node_bin: "answerpipe-definitely-not-a-node-binary".to_string(),
            ..RenderSettings::default()
        });
        let err = r.render("https://example.com", None).await.unwrap_err();
        assert!(matches!(err, Error::NotConfigured(_)), "err={err}");
    }

    #[test]
    fn parses_ok_output() {
        let js = br#"{"ok":true,"final_url":"https://e.com/x","status":200,"html":"<html>hi</html>","elapsed_ms":12}"#;
        let p = parse_render_output(js, b"", "https://e.com", 1_000).unwrap();
        assert_eq!(p.final_url, "https://e.com/x");
        assert_eq!(p.status, Some(200));
        assert_eq!(p.elapsed_ms, 12);
    }

    #[test]
    fn maps_script_error_codes() {
        let js = br#"{"ok":false,"error":{"code":"not_configured","message":"no playwright"}}"#;
        let err = parse_render_output(js, b"", "u", 1_000).unwrap_err();
        assert!(matches!(err, Error::NotConfigured(_)));
        let err = parse_render_output(b"garbage", b"boom", "u", 1_000).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn rejects_oversized_html() {
        let js = br#"{"ok":true,"html":"<html>0123456789</html>"}"#;
        let err = parse_render_output(js, b"", "u", 5).unwrap_err();
        assert!(matches!(err, Error::Fetch(_)));
    }
}
