//! Structural analysis of a page: how addressable its interactive elements
//! are, and how many forms it has.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::{Browser, Tab};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{AgentError, Result};

/// JavaScript that walks the visible DOM (max depth 25) and describes every
/// interactive element (a, button, input, textarea, select, [role=button])
/// by the attributes a structural locator could key on. Read-only.
/// Headroom past the analysis timeout so Chrome's own waits expire first and
/// the scratch tab still gets closed.
const TAB_GRACE: Duration = Duration::from_secs(5);

const FEATURES_JS: &str = r#"
(() => {
  const SKIP = new Set(['SCRIPT','STYLE','NOSCRIPT','SVG','LINK']);
  const INTERACTIVE = new Set(['a','button','input','textarea','select']);
  const elements = [];

  function isVisible(el) {
    if (el.offsetParent === null && el.tagName !== 'BODY' && el.tagName !== 'HTML') return false;
    const s = getComputedStyle(el);
    return s.display !== 'none' && s.visibility !== 'hidden' && s.opacity !== '0';
  }

  function walk(node, depth) {
    if (depth > 25) return;
    for (const child of node.children) {
      if (SKIP.has(child.tagName)) continue;
      if (!isVisible(child)) continue;
      const tag = child.tagName.toLowerCase();
      if (INTERACTIVE.has(tag) || child.getAttribute('role') === 'button') {
        elements.push({
          tag,
          hasId: !!child.id,
          hasName: !!child.getAttribute('name'),
          hasAriaLabel: !!child.getAttribute('aria-label'),
          hasTestId: !!(child.getAttribute('data-testid') || child.getAttribute('data-test')),
          hasText: (child.textContent || '').trim().length > 0 || !!child.placeholder,
        });
      }
      walk(child, depth + 1);
    }
  }

  walk(document.body, 0);
  return JSON.stringify({ forms: document.forms.length, elements });
})()
"#;

/// The three signals the approach policy reads from a page.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StructuralAnalysis {
    /// In `[0, 1]`.
    pub confidence: f64,
    pub interactive_element_count: usize,
    pub forms_count: usize,
}

impl StructuralAnalysis {
    pub fn new(confidence: f64, interactive_element_count: usize, forms_count: usize) -> Self {
        Self {
            confidence: if confidence.is_nan() { 0.0 } else { confidence.clamp(0.0, 1.0) },
            interactive_element_count,
            forms_count,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ElementFeatures {
    pub tag: String,
    pub has_id: bool,
    pub has_name: bool,
    pub has_aria_label: bool,
    pub has_test_id: bool,
    pub has_text: bool,
}

/// Raw features collected from one page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageFeatures {
    pub forms: usize,
    pub elements: Vec<ElementFeatures>,
}

impl PageFeatures {
    pub fn analyze(&self, scorer: &dyn ConfidenceScorer) -> StructuralAnalysis {
        StructuralAnalysis::new(scorer.score(&self.elements), self.elements.len(), self.forms)
    }
}

/// Turns element features into a structural confidence in `[0, 1]`.
///
/// Only the relative ordering of scores is meaningful; swap the scorer to
/// retune.
pub trait ConfidenceScorer: Send + Sync {
    fn score(&self, elements: &[ElementFeatures]) -> f64;
}

/// Additive per-element weights, averaged over the page.
#[derive(Debug, Clone, PartialEq)]
pub struct HeuristicScorer {
    pub base: f64,
    pub id: f64,
    pub name: f64,
    pub aria_label: f64,
    pub test_id: f64,
    pub text: f64,
}

impl Default for HeuristicScorer {
    fn default() -> Self {
        Self {
            base: 0.3,
            id: 0.25,
            name: 0.15,
            aria_label: 0.1,
            test_id: 0.15,
            text: 0.1,
        }
    }
}

impl HeuristicScorer {
    fn element_score(&self, e: &ElementFeatures) -> f64 {
        let mut score = self.base;
        if e.has_id {
            score += self.id;
        }
        if e.has_name {
            score += self.name;
        }
        if e.has_aria_label {
            score += self.aria_label;
        }
        if e.has_test_id {
            score += self.test_id;
        }
        if e.has_text {
            score += self.text;
        }
        score.min(1.0)
    }
}

impl ConfidenceScorer for HeuristicScorer {
    fn score(&self, elements: &[ElementFeatures]) -> f64 {
        if elements.is_empty() {
            return 0.0;
        }
        let total: f64 = elements.iter().map(|e| self.element_score(e)).sum();
        total / elements.len() as f64
    }
}

/// Supplies structural signals for a URL.
#[async_trait]
pub trait StructuralAnalyzer: Send + Sync {
    async fn analyze(&self, url: &str) -> Result<StructuralAnalysis>;
}

/// Loads the URL in a throwaway tab of a running Chrome and scores it.
pub struct ChromeDomAnalyzer {
    browser: Browser,
    scorer: Arc<dyn ConfidenceScorer>,
    timeout: Duration,
}

impl ChromeDomAnalyzer {
    pub fn new(browser: Browser, timeout: Duration) -> Self {
        Self::with_scorer(browser, timeout, Arc::new(HeuristicScorer::default()))
    }

    pub fn with_scorer(
        browser: Browser,
        timeout: Duration,
        scorer: Arc<dyn ConfidenceScorer>,
    ) -> Self {
        Self {
            browser,
            scorer,
            timeout,
        }
    }
}

#[async_trait]
impl StructuralAnalyzer for ChromeDomAnalyzer {
    async fn analyze(&self, url: &str) -> Result<StructuralAnalysis> {
        let browser = self.browser.clone();
        let target = url.to_string();
        let timeout = self.timeout;
        let collect = tokio::task::spawn_blocking(move || -> anyhow::Result<PageFeatures> {
            let tab = browser.new_tab()?;
            tab.set_default_timeout(timeout);
            let features = read_features(&tab, &target);
            release_tab(&target, tab.close(false));
            features
        });

        let features = tokio::time::timeout(timeout + TAB_GRACE, collect)
            .await
            .map_err(|_| AgentError::Timeout(format!("structural analysis of {url}")))?
            .map_err(|e| AgentError::execution(format!("analysis task panicked: {e}")))?
            .map_err(|e| AgentError::execution(format!("{e:#}")))?;

        let analysis = features.analyze(self.scorer.as_ref());
        debug!(url, ?analysis, "structural analysis");
        Ok(analysis)
    }
}

fn read_features(tab: &Tab, url: &str) -> anyhow::Result<PageFeatures> {
    tab.navigate_to(url)?.wait_until_navigated()?;
    let raw = tab
        .evaluate(FEATURES_JS, false)?
        .value
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_default();
    Ok(serde_json::from_str(&raw)?)
}

/// Scratch tabs are closed whatever the analysis outcome; a failed close is
/// only worth a warning. Returns whether the tab is known to be gone.
fn release_tab(url: &str, closed: anyhow::Result<bool>) -> bool {
    match closed {
        Ok(_) => true,
        Err(e) => {
            warn!(url, error = %e, "failed to close analysis tab");
            false
        }
    }
}
