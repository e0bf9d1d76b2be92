//! Static page snapshot that the listener model can run against.
//!
//! Heights come from `data-*` attributes: `data-scroll-height`,
//! `data-offset-height` and `data-client-height` on `<html>` and `<body>`,
//! `data-inner-height` on `<html>` for the viewport, and `data-height` on any
//! element for its offset height. Exclusion selectors go through the DOM's
//! own selector engine.

use crate::listener::{
    DataLayer, DataLayerEvent, ExclusionError, Extent, FrameRequest, Layout, Navigation, Page,
    ScrollTracker,
};
use kuchiki::NodeRef;
use kuchiki::traits::*;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PageError {
    #[error("page has no <{0}> element")]
    MissingElement(&'static str),
    #[error("invalid {attr} on <{element}>: {value:?}")]
    InvalidAttribute {
        element: &'static str,
        attr: &'static str,
        value: String,
    },
    #[error("invalid step {0:?}: expected a scroll offset or `nav`")]
    InvalidStep(String),
}

pub struct PageSnapshot {
    document: NodeRef,
    layout: Layout,
    events: Vec<DataLayerEvent>,
    has_data_layer: bool,
}

impl fmt::Debug for PageSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageSnapshot")
            .field("layout", &self.layout)
            .field("events", &self.events)
            .field("has_data_layer", &self.has_data_layer)
            .finish_non_exhaustive()
    }
}

impl PageSnapshot {
    pub fn parse(html: &str) -> Result<Self, PageError> {
        let document = kuchiki::parse_html().one(html);
        let root = extent_of(&document, "html")?;
        let body = extent_of(&document, "body")?;
        let inner_height = numeric_attr(&document, "html", "data-inner-height")?;
        Ok(Self {
            document,
            layout: Layout {
                root,
                body,
                inner_height,
                scroll_y: 0.0,
            },
            events: Vec::new(),
            has_data_layer: true,
        })
    }

    /// Overrides the viewport height from the markup.
    pub fn with_viewport(mut self, height: f64) -> Self {
        self.layout.inner_height = Some(height);
        self
    }

    /// Simulates a page that never defined `dataLayer`.
    pub fn without_data_layer(mut self) -> Self {
        self.has_data_layer = false;
        self
    }

    pub fn scroll_to(&mut self, y: f64) {
        self.layout.scroll_y = y;
    }

    pub fn events(&self) -> &[DataLayerEvent] {
        &self.events
    }
}

fn extent_of(document: &NodeRef, element: &'static str) -> Result<Extent, PageError> {
    Ok(Extent {
        scroll_height: numeric_attr(document, element, "data-scroll-height")?.unwrap_or(0.0),
        offset_height: numeric_attr(document, element, "data-offset-height")?.unwrap_or(0.0),
        client_height: numeric_attr(document, element, "data-client-height")?.unwrap_or(0.0),
    })
}

fn numeric_attr(
    document: &NodeRef,
    element: &'static str,
    attr: &'static str,
) -> Result<Option<f64>, PageError> {
    let node = document
        .select_first(element)
        .map_err(|()| PageError::MissingElement(element))?;
    let attributes = node.attributes.borrow();
    let Some(raw) = attributes.get(attr) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<f64>()
        .map(Some)
        .map_err(|_| PageError::InvalidAttribute {
            element,
            attr,
            value: raw.to_string(),
        })
}

impl Page for PageSnapshot {
    fn layout(&self) -> Layout {
        self.layout
    }

    fn excluded_height(&self, selector: &str) -> Result<f64, ExclusionError> {
        let matches = self
            .document
            .select(selector)
            .map_err(|()| ExclusionError::InvalidSelector(selector.to_string()))?;
        Ok(matches
            .filter_map(|element| {
                let attributes = element.attributes.borrow();
                attributes
                    .get("data-height")
                    .and_then(|h| h.trim().parse::<f64>().ok())
            })
            .filter(|h| *h > 0.0)
            .sum())
    }

    fn data_layer(&mut self) -> Option<&mut dyn DataLayer> {
        if self.has_data_layer {
            Some(&mut self.events)
        } else {
            None
        }
    }
}

/// One scripted interaction in a simulation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Step {
    Scroll(f64),
    Navigate,
}

impl FromStr for Step {
    type Err = PageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("nav") {
            return Ok(Step::Navigate);
        }
        s.parse::<f64>()
            .ok()
            .filter(|y| y.is_finite())
            .map(Step::Scroll)
            .ok_or_else(|| PageError::InvalidStep(s.to_string()))
    }
}

pub fn parse_steps(csv: &str) -> Result<Vec<Step>, PageError> {
    csv.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(str::parse)
        .collect()
}

/// Loads the page, then replays `steps`: each scroll schedules a frame which
/// is run immediately, each navigation waits out the settle delay and measures.
/// Returns everything pushed to the data layer.
pub fn simulate(
    tracker: &mut ScrollTracker,
    page: &mut PageSnapshot,
    steps: &[Step],
) -> Vec<DataLayerEvent> {
    tracker.init(page);
    for step in steps {
        match *step {
            Step::Scroll(y) => {
                page.scroll_to(y);
                if tracker.on_scroll() == FrameRequest::Schedule {
                    tracker.tick(page);
                }
            }
            Step::Navigate => {
                if let Some(delay) = tracker.on_navigation(Navigation::PushState) {
                    debug!(delay_ms = delay.as_millis() as u64, "re-measuring after navigation");
                    tracker.tick(page);
                }
            }
        }
    }
    page.events().to_vec()
}
