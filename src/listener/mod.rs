//! Reference model of the client-side scroll listener.
//!
//! The browser never runs this code; it runs the script rendered by
//! [`script`]. This module is the same algorithm expressed as an explicit
//! state machine so it can be driven against any [`Page`] implementation
//! (a static snapshot, a test double) and checked without a browser.

pub mod ajax;
pub mod script;

use crate::settings::{DEFAULT_THRESHOLDS, ListenerParams};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

pub use ajax::RequestCompletion;

/// Data-layer event name pushed once per reached threshold.
pub const THRESHOLD_EVENT: &str = "scrollGeniusThreshold";
/// Data-layer event name pushed for every successful AJAX request.
pub const FORM_SUCCESS_EVENT: &str = "scrollGeniusFormSuccess";
/// Delay between a navigation and the re-measurement, so the new view can settle.
pub const NAV_SETTLE_DELAY: Duration = Duration::from_millis(60);

/// Records the listener pushes onto the host page's `dataLayer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum DataLayerEvent {
    #[serde(rename = "scrollGeniusThreshold")]
    Threshold { scroll_percent: u8 },
    #[serde(rename = "scrollGeniusFormSuccess")]
    FormSuccess {
        #[serde(rename = "formUrl")]
        form_url: String,
    },
}

/// Ascending thresholds parsed from a comma-separated list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThresholdSet(Vec<u8>);

impl ThresholdSet {
    /// Empty input means the default set. Entries that do not start with an
    /// integer, or fall outside `0..=100`, are dropped. Duplicates are kept;
    /// the fired set makes them harmless.
    pub fn parse(csv: &str) -> Self {
        let csv = if csv.is_empty() { DEFAULT_THRESHOLDS } else { csv };
        let mut values: Vec<u8> = csv
            .split(',')
            .filter_map(parse_int_prefix)
            .filter_map(|v| u8::try_from(v).ok())
            .filter(|v| *v <= 100)
            .collect();
        values.sort_unstable();
        Self(values)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

/// Base-10 parse of the longest leading integer, the way browsers parse `"50px"` as 50.
fn parse_int_prefix(raw: &str) -> Option<i64> {
    let s = raw.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    let magnitude: i64 = digits[..end].parse().ok()?;
    Some(if negative { -magnitude } else { magnitude })
}

pub fn parse_exclusions(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Height measurements of one DOM node.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Extent {
    pub scroll_height: f64,
    pub offset_height: f64,
    pub client_height: f64,
}

impl Extent {
    fn tallest(&self) -> f64 {
        self.scroll_height
            .max(self.offset_height)
            .max(self.client_height)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Layout {
    pub root: Extent,
    pub body: Extent,
    pub inner_height: Option<f64>,
    pub scroll_y: f64,
}

impl Layout {
    /// A page whose root and body both report `document` pixels of content.
    pub fn uniform(document: f64, viewport: f64, scroll_y: f64) -> Self {
        Self {
            root: Extent {
                scroll_height: document,
                offset_height: document,
                client_height: viewport,
            },
            body: Extent {
                scroll_height: document,
                offset_height: document,
                client_height: 0.0,
            },
            inner_height: Some(viewport),
            scroll_y,
        }
    }

    /// Root and body report heights inconsistently across layouts; take the largest.
    pub fn document_height(&self) -> f64 {
        self.root.tallest().max(self.body.tallest())
    }

    pub fn viewport_height(&self) -> f64 {
        match self.inner_height {
            Some(h) if h > 0.0 => h,
            _ => self.root.client_height.max(0.0),
        }
    }
}

/// Scroll progress in `0..=100`. A positive exclusion total shrinks the
/// scrollable span, so the result never goes down when chrome is excluded.
pub fn compute_percent(layout: &Layout, exclusion_total: f64) -> u8 {
    let document = layout.document_height();
    let viewport = layout.viewport_height();
    let y = layout.scroll_y.max(0.0);
    if exclusion_total > 0.0 && document > viewport {
        return percent_of(y, (document - exclusion_total) - viewport);
    }
    percent_of(y, document - viewport)
}

fn percent_of(y: f64, span: f64) -> u8 {
    let percent = (y / span.max(1.0) * 100.0).round();
    if percent.is_nan() {
        return 0;
    }
    percent.clamp(0.0, 100.0) as u8
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExclusionError {
    #[error("invalid selector {0:?}")]
    InvalidSelector(String),
}

/// The host page's event queue.
pub trait DataLayer {
    fn push(&mut self, event: DataLayerEvent);
}

impl DataLayer for Vec<DataLayerEvent> {
    fn push(&mut self, event: DataLayerEvent) {
        Vec::push(self, event);
    }
}

/// Everything the listener reads from, or writes to, the page it runs in.
pub trait Page {
    fn layout(&self) -> Layout;
    /// Total offset height of the elements matching `selector`.
    fn excluded_height(&self, selector: &str) -> Result<f64, ExclusionError>;
    /// `None` when the page has no usable `dataLayer`.
    fn data_layer(&mut self) -> Option<&mut dyn DataLayer>;
}

/// Sums excluded heights. A selector that fails contributes zero.
pub fn exclusion_total<P: Page + ?Sized>(page: &P, selectors: &[String]) -> f64 {
    selectors
        .iter()
        .map(|selector| match page.excluded_height(selector) {
            Ok(height) if height.is_finite() && height > 0.0 => height,
            Ok(_) => 0.0,
            Err(err) => {
                debug!(%selector, %err, "exclusion selector skipped");
                0.0
            }
        })
        .sum()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRequest {
    /// Caller must run [`ScrollTracker::tick`] on the next animation frame.
    Schedule,
    /// A frame is already pending.
    Coalesced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Navigation {
    PushState,
    ReplaceState,
    PopState,
    HashChange,
}

/// Per-navigation-epoch state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Epoch {
    fired: BTreeSet<u8>,
}

/// Scroll-depth listener state machine.
#[derive(Debug, Clone)]
pub struct ScrollTracker {
    thresholds: ThresholdSet,
    exclusions: Vec<String>,
    nav_fix: bool,
    epoch: Epoch,
    pending_frame: bool,
}

impl ScrollTracker {
    pub fn new(params: &ListenerParams) -> Self {
        Self {
            thresholds: ThresholdSet::parse(&params.thresholds),
            exclusions: parse_exclusions(&params.exclusions),
            nav_fix: params.nav_fix,
            epoch: Epoch::default(),
            pending_frame: false,
        }
    }

    pub fn thresholds(&self) -> &[u8] {
        self.thresholds.as_slice()
    }

    pub fn exclusions(&self) -> &[String] {
        &self.exclusions
    }

    pub fn fired(&self) -> Vec<u8> {
        self.epoch.fired.iter().copied().collect()
    }

    pub fn is_frame_pending(&self) -> bool {
        self.pending_frame
    }

    /// Starts a fresh epoch and measures once, covering pages that load already scrolled.
    pub fn init<P: Page + ?Sized>(&mut self, page: &mut P) -> Vec<u8> {
        self.epoch = Epoch::default();
        self.tick(page)
    }

    pub fn on_scroll(&mut self) -> FrameRequest {
        if self.pending_frame {
            return FrameRequest::Coalesced;
        }
        self.pending_frame = true;
        FrameRequest::Schedule
    }

    pub fn on_resize(&mut self) -> FrameRequest {
        self.on_scroll()
    }

    /// One measurement. Returns the thresholds that fired, ascending.
    pub fn tick<P: Page + ?Sized>(&mut self, page: &mut P) -> Vec<u8> {
        self.pending_frame = false;
        let excluded = exclusion_total(page, &self.exclusions);
        let percent = compute_percent(&page.layout(), excluded);
        let mut newly_fired = Vec::new();
        for &threshold in self.thresholds.as_slice() {
            if percent >= threshold && self.epoch.fired.insert(threshold) {
                newly_fired.push(threshold);
                if let Some(data_layer) = page.data_layer() {
                    data_layer.push(DataLayerEvent::Threshold {
                        scroll_percent: threshold,
                    });
                }
            }
        }
        if !newly_fired.is_empty() {
            trace!(percent, fired = ?newly_fired, "thresholds reached");
        }
        newly_fired
    }

    /// Resets the epoch when the navigation fix is on. The returned delay is
    /// how long the caller waits before the next [`tick`](Self::tick).
    pub fn on_navigation(&mut self, kind: Navigation) -> Option<Duration> {
        if !self.nav_fix {
            return None;
        }
        debug!(?kind, cleared = self.epoch.fired.len(), "navigation reset");
        self.epoch = Epoch::default();
        Some(NAV_SETTLE_DELAY)
    }
}
