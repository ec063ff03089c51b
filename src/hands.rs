//! Execution surface adapter: the browser the agent acts on.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{BrowserSettings, RetrySettings};
use crate::error::{AgentError, Result};
use crate::types::{Action, ActionResult, PageState, ScrollDirection, WaitPolicy};

const EXTRACT_MAX_CHARS: usize = 2000;
/// Longest wait between retries, whatever the policy's multiplier.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);
/// Headroom past the navigation timeout so Chrome's own wait reports first.
const NAVIGATION_GRACE: Duration = Duration::from_secs(5);

/// Backoff between retried attempts of one action.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            multiplier: settings.multiplier,
            jitter: settings.jitter,
        }
    }
}

impl RetryPolicy {
    pub fn no_delay(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Delay after the `attempt`-th failure (1-indexed):
    /// `base_delay * multiplier^(attempt - 1)`, scaled into `[50%, 100%]` when
    /// jitter is on and capped at [`MAX_RETRY_DELAY`].
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let mut secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if self.jitter {
            secs *= 0.5 + rand::random::<f64>() * 0.5;
        }
        Duration::try_from_secs_f64(secs)
            .unwrap_or(MAX_RETRY_DELAY)
            .min(MAX_RETRY_DELAY)
    }
}

/// The browser execution surface.
///
/// Implementors provide single-attempt primitives; `act` and `navigate` layer
/// validation, retry and wait-policy fallback on top of them uniformly.
#[async_trait]
pub trait ExecutionSurface: Send {
    async fn launch(&mut self, headless: bool) -> Result<()>;

    async fn capture(&mut self) -> Result<Vec<u8>>;

    async fn page_state(&mut self) -> Result<PageState>;

    /// One attempt at `action`. Returns the variant's payload, if any.
    async fn perform(&mut self, action: &Action) -> Result<Option<Value>>;

    /// Loads `url` and waits according to `policy`. Should report an expired
    /// wait as [`AgentError::Timeout`].
    async fn goto(&mut self, url: &str, policy: WaitPolicy) -> Result<()>;

    /// Releases the browser. Safe to call on an uninitialized surface.
    async fn close(&mut self) -> Result<()>;

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    /// Validates and performs `action`, retrying retryable failures when
    /// `retry` is set. Never fails; the outcome is in the result.
    async fn act(&mut self, action: &Action, retry: bool) -> ActionResult {
        if let Err(e) = action.validate() {
            return ActionResult::failed(e.to_string(), 0);
        }

        let policy = self.retry_policy();
        let max_attempts = if retry { policy.max_attempts } else { 1 };
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.perform(action).await {
                Ok(data) => return ActionResult::ok(data, attempt),
                Err(e) if attempt < max_attempts && e.is_retryable() => {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        attempt,
                        error = %e,
                        ?delay,
                        kind = %action.kind(),
                        "action failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return ActionResult::failed(e.to_string(), attempt),
            }
        }
    }

    /// Loads `url`; a strict wait that times out is retried once with the
    /// loose policy.
    async fn navigate(&mut self, url: &str, policy: WaitPolicy) -> Result<()> {
        match self.goto(url, policy).await {
            Err(AgentError::Timeout(reason)) if policy == WaitPolicy::Strict => {
                warn!(url, %reason, "strict navigation wait timed out, falling back to loose");
                self.goto(url, WaitPolicy::Loose).await
            }
            other => other,
        }
    }
}

/// Chrome driven over CDP.
pub struct ChromeSurface {
    settings: BrowserSettings,
    retry: RetryPolicy,
    browser: Option<Browser>,
    tab: Option<Arc<Tab>>,
}

impl ChromeSurface {
    pub fn new(settings: BrowserSettings, retry: RetryPolicy) -> Self {
        Self {
            settings,
            retry,
            browser: None,
            tab: None,
        }
    }

    /// A handle to the running browser, for collaborators that open their own tabs.
    pub fn browser(&self) -> Option<Browser> {
        self.browser.clone()
    }

    fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.navigation_timeout_ms)
    }

    /// Runs `f` against the active tab on the blocking pool.
    async fn with_tab<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Arc<Tab>) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let tab = self.tab.clone().ok_or(AgentError::NotInitialized)?;
        tokio::task::spawn_blocking(move || f(tab))
            .await
            .map_err(|e| AgentError::execution(format!("browser task panicked: {e}")))?
            .map_err(classify)
    }
}

#[async_trait]
impl ExecutionSurface for ChromeSurface {
    async fn launch(&mut self, headless: bool) -> Result<()> {
        if self.tab.is_some() {
            return Ok(());
        }
        let settings = self.settings.clone();
        let (browser, tab) = tokio::task::spawn_blocking(move || open_browser(&settings, headless))
            .await
            .map_err(|e| AgentError::initialization(format!("browser launch panicked: {e}")))?
            .map_err(|e| AgentError::initialization(format!("{e:#}")))?;
        info!(headless, "browser ready");
        self.browser = Some(browser);
        self.tab = Some(tab);
        Ok(())
    }

    async fn capture(&mut self) -> Result<Vec<u8>> {
        self.with_tab(|tab| {
            tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
        })
        .await
    }

    async fn page_state(&mut self) -> Result<PageState> {
        self.with_tab(|tab| {
            let url = tab.get_url();
            let title = tab.get_title().unwrap_or_default();
            let ready_state = eval_string(&tab, "document.readyState")?;
            Ok(PageState::new(url, title, ready_state))
        })
        .await
    }

    async fn perform(&mut self, action: &Action) -> Result<Option<Value>> {
        debug!(?action, "performing");
        match action.clone() {
            Action::Wait { duration_ms } => {
                if self.tab.is_none() {
                    return Err(AgentError::NotInitialized);
                }
                tokio::time::sleep(Duration::from_millis(duration_ms)).await;
                Ok(None)
            }
            Action::Click { selector, text } => {
                self.with_tab(move |tab| {
                    let element = match (selector.filter(|s| !s.trim().is_empty()), text) {
                        (Some(selector), _) => tab.find_element(&selector)?,
                        (None, Some(text)) => tab.find_element_by_xpath(&format!(
                            "//*[contains(normalize-space(.), {})][not(*[contains(normalize-space(.), {})])]",
                            xpath_literal(&text),
                            xpath_literal(&text)
                        ))?,
                        (None, None) => anyhow::bail!("click has no target"),
                    };
                    element.click()?;
                    Ok(None)
                })
                .await
            }
            Action::Type { selector, text } => {
                self.with_tab(move |tab| {
                    let element = tab.find_element(&selector)?;
                    element.click()?;
                    tab.evaluate(
                        &format!(
                            "(document.querySelector({}) || {{}}).value = ''",
                            js_string(&selector)
                        ),
                        false,
                    )?;
                    tab.type_str(&text)?;
                    Ok(None)
                })
                .await
            }
            Action::Scroll { direction, amount } => {
                let (dx, dy) = match direction {
                    ScrollDirection::Up => (0i64, -(amount as i64)),
                    ScrollDirection::Down => (0, amount as i64),
                    ScrollDirection::Left => (-(amount as i64), 0),
                    ScrollDirection::Right => (amount as i64, 0),
                };
                self.with_tab(move |tab| {
                    tab.evaluate(&format!("window.scrollBy({dx}, {dy})"), false)?;
                    Ok(None)
                })
                .await
            }
            Action::Navigate { url } => {
                self.with_tab(move |tab| {
                    tab.navigate_to(&url)?.wait_until_navigated()?;
                    Ok(None)
                })
                .await
            }
            Action::Extract { selector } => {
                self.with_tab(move |tab| {
                    let script = format!(
                        "JSON.stringify([...document.querySelectorAll({})].map(e => (e.innerText || '').trim()))",
                        js_string(&selector)
                    );
                    let raw = eval_string(&tab, &script)?;
                    let texts: Vec<String> = serde_json::from_str(&raw)?;
                    if texts.is_empty() {
                        anyhow::bail!("no element matches {selector}");
                    }
                    let texts: Vec<Value> = texts
                        .into_iter()
                        .map(|t| Value::String(t.chars().take(EXTRACT_MAX_CHARS).collect()))
                        .collect();
                    Ok(Some(Value::Array(texts)))
                })
                .await
            }
        }
    }

    async fn goto(&mut self, url: &str, policy: WaitPolicy) -> Result<()> {
        let timeout = self.navigation_timeout();
        let target = url.to_string();
        let load = self.with_tab(move |tab| {
            tab.set_default_timeout(timeout);
            match policy {
                WaitPolicy::Strict => {
                    tab.navigate_to(&target)?.wait_until_navigated()?;
                    tab.wait_for_element("body")?;
                }
                WaitPolicy::Loose => {
                    tab.navigate_to(&target)?;
                    tab.wait_for_element_with_custom_timeout("body", timeout)?;
                }
            }
            Ok(())
        });
        tokio::time::timeout(timeout + NAVIGATION_GRACE, load)
            .await
            .map_err(|_| AgentError::Timeout(format!("navigation to {url} ({policy:?})")))?
    }

    async fn close(&mut self) -> Result<()> {
        let tab = self.tab.take();
        let browser = self.browser.take();
        if tab.is_none() && browser.is_none() {
            return Ok(());
        }
        tokio::task::spawn_blocking(move || {
            if let Some(tab) = tab
                && let Err(e) = tab.close(false)
            {
                debug!(error = %e, "tab close failed");
            }
            drop(browser);
        })
        .await
        .map_err(|e| AgentError::execution(format!("browser shutdown panicked: {e}")))?;
        info!("browser closed");
        Ok(())
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone()
    }
}

/// Attaches to a running Chrome when a debugger URL is configured, otherwise
/// launches a fresh one.
fn open_browser(settings: &BrowserSettings, headless: bool) -> anyhow::Result<(Browser, Arc<Tab>)> {
    if let Some(debugger_url) = &settings.debugger_url {
        match Browser::connect(debugger_url.clone()) {
            Ok(browser) => {
                info!(debugger_url, "attached to existing Chrome");
                let tab = browser.new_tab()?;
                return Ok((browser, tab));
            }
            Err(e) => warn!(debugger_url, error = %e, "could not attach, launching instead"),
        }
    }

    let options = LaunchOptions {
        headless,
        path: settings.chrome_path.clone(),
        user_data_dir: settings.profile_dir.clone(),
        window_size: Some((settings.window_width, settings.window_height)),
        args: vec![
            OsStr::new("--no-first-run"),
            OsStr::new("--no-default-browser-check"),
            OsStr::new("--disable-blink-features=AutomationControlled"),
            OsStr::new("--disable-infobars"),
        ],
        idle_browser_timeout: Duration::from_secs(300),
        ..Default::default()
    };
    let browser = Browser::new(options)?;
    let tab = browser.new_tab()?;
    tab.navigate_to("about:blank")?;
    Ok((browser, tab))
}

fn eval_string(tab: &Tab, script: &str) -> anyhow::Result<String> {
    let result = tab.evaluate(script, false)?;
    Ok(result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_default())
}

/// A JavaScript string literal for `value`.
fn js_string(value: &str) -> String {
    Value::String(value.to_string()).to_string()
}

/// An XPath 1.0 string literal for `value`, which has no escape syntax.
fn xpath_literal(value: &str) -> String {
    if !value.contains('\'') {
        format!("'{value}'")
    } else if !value.contains('"') {
        format!("\"{value}\"")
    } else {
        let parts: Vec<String> = value.split('\'').map(|p| format!("'{p}'")).collect();
        format!("concat({})", parts.join(", \"'\", "))
    }
}

/// Chrome's wait helpers report expiry as `util::Timeout`; keep that distinct.
fn classify(error: anyhow::Error) -> AgentError {
    if error.downcast_ref::<headless_chrome::util::Timeout>().is_some() {
        AgentError::Timeout(format!("{error:#}"))
    } else {
        AgentError::execution(format!("{error:#}"))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn backoff_grows_exponentially_without_jitter() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[rstest]
    #[case(64)]
    #[case(2000)]
    #[case(u32::MAX)]
    fn runaway_backoff_is_capped(#[case] attempt: u32) {
        let policy = RetryPolicy {
            max_attempts: u32::MAX,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: true,
        };
        assert_eq!(policy.delay_for(attempt), MAX_RETRY_DELAY);
    }

    #[test]
    fn chrome_wait_expiry_is_a_timeout() {
        let expired = anyhow::Error::from(headless_chrome::util::Timeout)
            .context("waiting for body");
        assert!(matches!(classify(expired), AgentError::Timeout(_)));

        let refused = anyhow::anyhow!("net::ERR_CONNECTION_REFUSED");
        assert!(matches!(classify(refused), AgentError::Execution(_)));
    }

    #[test]
    fn jitter_stays_within_half_to_full_delay() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            multiplier: 1.0,
            jitter: true,
        };
        for _ in 0..50 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(500) && delay <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn policy_from_settings_never_has_zero_attempts() {
        let settings = RetrySettings {
            max_attempts: 0,
            ..RetrySettings::default()
        };
        assert_eq!(RetryPolicy::from(&settings).max_attempts, 1);
    }

    #[test]
    fn xpath_literals_handle_quotes() {
        assert_eq!(xpath_literal("Next"), "'Next'");
        assert_eq!(xpath_literal("Don't"), "\"Don't\"");
        assert_eq!(
            xpath_literal(r#"a'b"c"#),
            r#"concat('a', "'", 'b"c')"#
        );
    }

    #[test]
    fn js_strings_are_escaped() {
        assert_eq!(js_string("a'b\"c"), r#""a'b\"c""#);
    }

    #[tokio::test]
    async fn uninitialized_chrome_surface_reports_not_initialized() {
        let mut surface = ChromeSurface::new(BrowserSettings::default(), RetryPolicy::no_delay(1));
        assert!(matches!(surface.capture().await, Err(AgentError::NotInitialized)));
        assert!(matches!(surface.page_state().await, Err(AgentError::NotInitialized)));
        let result = surface.act(&Action::wait(0), true).await;
        assert!(!result.is_success());
        assert_eq!(result.attempts(), 1);
        assert!(surface.close().await.is_ok());
    }
}
