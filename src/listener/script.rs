//! Browser payloads embedded in the container's Custom HTML tags.
//!
//! The templates mirror the state machine in the parent module. Parameters
//! are substituted as JSON string literals in one pass, then newlines are
//! flattened so each payload is a single line. Templates use block comments
//! only and never contain a double opening brace, which the tag manager
//! would treat as a variable reference.

use crate::settings::ListenerParams;
use regex::{Captures, Regex};
use std::sync::LazyLock;

const CORE_LISTENER_TEMPLATE: &str = r#"<script>
(function(){
  var THRESHOLD_CSV = __THRESHOLDS__;
  var EXCLUDE_CSV = __EXCLUSIONS__;
  var NAV_FIX = __NAV_FIX__;
  var THRESHOLDS = (THRESHOLD_CSV || "25,50,75,100").split(",")
    .map(function(x){ return parseInt(x, 10); })
    .filter(function(x){ return !isNaN(x) && x >= 0 && x <= 100; })
    .sort(function(a, b){ return a - b; });
  var EXCLUDE = (EXCLUDE_CSV || "").split(",")
    .map(function(s){ return s.trim(); })
    .filter(Boolean);

  function Tracker(){ this.fired = {}; this.pending = false; }
  Tracker.prototype.reset = function(){ this.fired = {}; };
  var state = new Tracker();

  function exclusionTotal(){
    var total = 0;
    for (var i = 0; i < EXCLUDE.length; i++) {
      try {
        var nodes = document.querySelectorAll(EXCLUDE[i]);
        for (var j = 0; j < nodes.length; j++) {
          var h = nodes[j] && nodes[j].offsetHeight;
          if (h > 0) { total += h; }
        }
      } catch (e) { /* selector contributes nothing */ }
    }
    return total;
  }

  function percentOf(y, span){
    return Math.max(0, Math.min(100, Math.round((y / Math.max(1, span)) * 100)));
  }

  function computePercent(){
    var root = document.documentElement;
    var body = document.body || root;
    var doc = Math.max(
      root.scrollHeight || 0, body.scrollHeight || 0,
      root.offsetHeight || 0, body.offsetHeight || 0,
      root.clientHeight || 0, body.clientHeight || 0
    );
    var viewport = window.innerHeight || root.clientHeight || 0;
    var y = window.pageYOffset || root.scrollTop || 0;
    var excluded = exclusionTotal();
    if (excluded > 0 && doc > viewport) { return percentOf(y, (doc - excluded) - viewport); }
    return percentOf(y, doc - viewport);
  }

  function push(record){
    var dl = window.dataLayer;
    if (dl && typeof dl.push === "function") { dl.push(record); }
  }

  function tick(){
    state.pending = false;
    var p = computePercent();
    for (var i = 0; i < THRESHOLDS.length; i++) {
      var t = THRESHOLDS[i];
      if (p >= t && !state.fired[t]) {
        state.fired[t] = 1;
        push({ event: "scrollGeniusThreshold", scroll_percent: t });
      }
    }
  }

  function schedule(){
    if (state.pending) { return; }
    state.pending = true;
    window.requestAnimationFrame(tick);
  }

  function init(){
    state.reset();
    window.addEventListener("scroll", schedule, { passive: true });
    window.addEventListener("resize", schedule, { passive: true });
    tick();
  }

  function onNavigation(){
    state.reset();
    setTimeout(tick, __SETTLE_MS__);
  }

  if (NAV_FIX && window.history) {
    var pushState = history.pushState;
    var replaceState = history.replaceState;
    history.pushState = function(){ var r = pushState.apply(this, arguments); onNavigation(); return r; };
    history.replaceState = function(){ var r = replaceState.apply(this, arguments); onNavigation(); return r; };
    window.addEventListener("popstate", onNavigation);
    window.addEventListener("hashchange", onNavigation);
  }

  if (document.readyState === "loading") {
    document.addEventListener("DOMContentLoaded", init);
  } else {
    init();
  }
})();
</script>
"#;

const AJAX_LISTENER_TEMPLATE: &str = r#"<script>
(function(){
  function push(url, fallback){
    var dl = window.dataLayer;
    if (dl && typeof dl.push === "function") {
      dl.push({ event: "scrollGeniusFormSuccess", formUrl: url || fallback });
    }
  }
  if (window.XMLHttpRequest) {
    var send = XMLHttpRequest.prototype.send;
    XMLHttpRequest.prototype.send = function(){
      this.addEventListener("loadend", function(){
        if (this.readyState === 4 && this.status >= 200 && this.status < 300) { push(this.responseURL, "XHR"); }
      });
      return send.apply(this, arguments);
    };
  }
  if (window.fetch) {
    var nativeFetch = window.fetch;
    window.fetch = function(){
      var pending = nativeFetch.apply(this, arguments);
      pending.then(function(r){ if (r && r.ok) { push(r.url, "fetch"); } }, function(){});
      return pending;
    };
  }
})();
</script>
"#;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"__(THRESHOLDS|EXCLUSIONS|NAV_FIX|SETTLE_MS)__").expect("placeholder pattern")
});

/// Core scroll listener, parameterized and flattened to one line.
pub fn core_listener_html(params: &ListenerParams) -> String {
    let rendered = PLACEHOLDER.replace_all(CORE_LISTENER_TEMPLATE, |caps: &Captures<'_>| {
        match &caps[1] {
            "THRESHOLDS" => js_string(&params.thresholds),
            "EXCLUSIONS" => js_string(&params.exclusions),
            "NAV_FIX" => params.nav_fix.to_string(),
            _ => super::NAV_SETTLE_DELAY.as_millis().to_string(),
        }
    });
    flatten(&rendered)
}

pub fn ajax_listener_html() -> String {
    flatten(AJAX_LISTENER_TEMPLATE)
}

/// JSON string literal that is also safe inside a `<script>` element and
/// inside a tag-manager template field.
fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string())
        .to_string()
        .replace('<', "\\u003c")
        .replace('{', "\\u007b")
        .replace('}', "\\u007d")
}

fn flatten(source: &str) -> String {
    source.replace("\r\n", " ").replace('\n', " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{FORM_SUCCESS_EVENT, THRESHOLD_EVENT};

    fn params(thresholds: &str, exclusions: &str, nav_fix: bool) -> ListenerParams {
        ListenerParams {
            thresholds: thresholds.into(),
            exclusions: exclusions.into(),
            nav_fix,
        }
    }

    #[test]
    fn substitutes_parameters() {
        let html = core_listener_html(&params("10,90", "#footer, .cookie", false));
        assert!(html.contains(r#"var THRESHOLD_CSV = "10,90";"#));
        assert!(html.contains(r##"var EXCLUDE_CSV = "#footer, .cookie";"##));
        assert!(html.contains("var NAV_FIX = false;"));
        assert!(html.contains("setTimeout(tick, 60);"));
        assert!(!html.contains("__"));
        assert!(html.contains(THRESHOLD_EVENT));
    }

    #[test]
    fn payloads_are_single_line_scripts() {
        for html in [core_listener_html(&params("", "", true)), ajax_listener_html()] {
            assert!(!html.contains('\n'));
            assert!(html.starts_with("<script>"));
            assert!(html.trim_end().ends_with("</script>"));
            assert!(!html.contains("{{"));
            assert!(!html.contains("//"));
        }
        assert!(ajax_listener_html().contains(FORM_SUCCESS_EVENT));
    }

    #[test]
    fn hostile_values_stay_inside_the_string_literal() {
        let html = core_listener_html(&params(
            "__EXCLUSIONS__",
            "</script><script>alert(1)</script>, {{Page URL}}",
            true,
        ));
        assert!(html.contains(r#"var THRESHOLD_CSV = "__EXCLUSIONS__";"#));
        assert_eq!(html.matches("</script>").count(), 1);
        assert!(!html.contains("{{"));
        assert!(html.contains(r"\u007b\u007bPage URL\u007d\u007d"));
    }
}

/// Runs the emitted payloads in an embedded JavaScript engine against a
/// stubbed browser and checks them against the Rust listener model.
#[cfg(test)]
mod execution {
    use super::*;
    use crate::listener::{DataLayerEvent, FrameRequest, RequestCompletion, ScrollTracker};
    use crate::page::{self, PageSnapshot, Step};
    use rquickjs::{CatchResultExt, Context, Runtime};
    use serde_json::Value;

    const BROWSER_STUB: &str = r#"
var window = globalThis;
var __listeners = {};
var __frames = [];
var __timers = [];
var __page = { document: 0, viewport: 0, heights: {} };
window.dataLayer = [];
window.pageYOffset = 0;
window.innerHeight = 0;
window.addEventListener = function (type, fn) {
  (__listeners[type] = __listeners[type] || []).push(fn);
};
window.requestAnimationFrame = function (fn) { __frames.push(fn); return __frames.length; };
window.setTimeout = function (fn) { __timers.push(fn); return __timers.length; };
window.history = { pushState: function () {}, replaceState: function () {} };
function __extent(reportsViewport) {
  return {
    get scrollHeight() { return __page.document; },
    get offsetHeight() { return __page.document; },
    get clientHeight() { return reportsViewport ? __page.viewport : 0; },
    scrollTop: 0
  };
}
window.document = {
  readyState: "complete",
  documentElement: __extent(true),
  body: __extent(false),
  addEventListener: function () {},
  querySelectorAll: function (selector) {
    if (selector.indexOf("[") !== -1 && selector.indexOf("]") === -1) {
      throw new SyntaxError("invalid selector " + selector);
    }
    var height = __page.heights[selector];
    return height === undefined ? [] : [{ offsetHeight: height }];
  }
};
function XMLHttpRequest() { this.readyState = 0; this.status = 0; this.responseURL = ""; this.__loadend = []; }
XMLHttpRequest.prototype.addEventListener = function (type, fn) {
  if (type === "loadend") { this.__loadend.push(fn); }
};
XMLHttpRequest.prototype.send = function () {};
XMLHttpRequest.prototype.__finish = function (readyState, status, url) {
  this.readyState = readyState;
  this.status = status;
  this.responseURL = url;
  var xhr = this;
  this.__loadend.forEach(function (fn) { fn.call(xhr); });
};
window.fetch = function (input, response) {
  return response ? Promise.resolve(response) : Promise.reject(new TypeError("network error"));
};
function __emit(type) { (__listeners[type] || []).forEach(function (fn) { fn(); }); }
function __drain(queue) { queue.splice(0, queue.length).forEach(function (fn) { fn(); }); }
function __scrollTo(y) { window.pageYOffset = y; __emit("scroll"); __drain(__frames); }
function __navigate() { history.pushState({}, "", "/next"); __drain(__timers); }
"#;

    struct Browser {
        runtime: Runtime,
        context: Context,
    }

    impl Browser {
        fn new() -> Self {
            let runtime = Runtime::new().unwrap();
            let context = Context::full(&runtime).unwrap();
            let browser = Self { runtime, context };
            browser.run(BROWSER_STUB);
            browser
        }

        /// Evaluates `source`, then settles every queued promise job.
        fn run(&self, source: &str) {
            self.context.with(|ctx| {
                ctx.eval::<(), _>(source).catch(&ctx).unwrap();
            });
            while let Ok(true) = self.runtime.execute_pending_job() {}
        }

        fn json(&self, expression: &str) -> Value {
            let raw: String = self.context.with(|ctx| {
                ctx.eval::<String, _>(format!("JSON.stringify({expression})"))
                    .catch(&ctx)
                    .unwrap()
            });
            serde_json::from_str(&raw).unwrap()
        }

        fn load(&self, html: &str) {
            let body = html
                .trim_end()
                .strip_prefix("<script>")
                .and_then(|rest| rest.strip_suffix("</script>"))
                .unwrap();
            self.run(body);
        }

        fn data_layer(&self) -> Vec<DataLayerEvent> {
            serde_json::from_value(self.json("window.dataLayer")).unwrap()
        }
    }

    struct Scenario {
        thresholds: &'static str,
        exclusions: &'static str,
        nav_fix: bool,
        document: f64,
        viewport: f64,
        footer: f64,
        steps: &'static str,
        fired: &'static [u8],
    }

    const SCENARIOS: &[Scenario] = &[
        Scenario {
            thresholds: "25,50,75,100",
            exclusions: "",
            nav_fix: true,
            document: 1100.0,
            viewport: 100.0,
            footer: 0.0,
            steps: "100,400,760,400,900",
            fired: &[25, 50, 75],
        },
        Scenario {
            thresholds: "25,50,75",
            exclusions: "",
            nav_fix: true,
            document: 2000.0,
            viewport: 800.0,
            footer: 0.0,
            steps: "300,600,300,nav",
            fired: &[25, 50, 25],
        },
        Scenario {
            thresholds: "25,50,75",
            exclusions: "",
            nav_fix: false,
            document: 2000.0,
            viewport: 800.0,
            footer: 0.0,
            steps: "300,600,300,nav",
            fired: &[25, 50],
        },
        Scenario {
            thresholds: "50,75",
            exclusions: "#footer",
            nav_fix: true,
            document: 2000.0,
            viewport: 800.0,
            footer: 400.0,
            steps: "600",
            fired: &[50, 75],
        },
        Scenario {
            thresholds: "50,75",
            exclusions: "div[",
            nav_fix: true,
            document: 2000.0,
            viewport: 800.0,
            footer: 400.0,
            steps: "600",
            fired: &[50],
        },
        Scenario {
            thresholds: "75,25,50",
            exclusions: "div[, #footer",
            nav_fix: true,
            document: 2000.0,
            viewport: 800.0,
            footer: 400.0,
            steps: "0,100,300,600,300,nav,240",
            fired: &[25, 50, 75, 25],
        },
    ];

    impl Scenario {
        fn params(&self) -> ListenerParams {
            ListenerParams {
                thresholds: self.thresholds.into(),
                exclusions: self.exclusions.into(),
                nav_fix: self.nav_fix,
            }
        }

        fn steps(&self) -> Vec<Step> {
            page::parse_steps(self.steps).unwrap()
        }

        fn expected(&self) -> Vec<DataLayerEvent> {
            self.fired
                .iter()
                .map(|&scroll_percent| DataLayerEvent::Threshold { scroll_percent })
                .collect()
        }

        fn run_model(&self) -> Vec<DataLayerEvent> {
            let html = format!(
                r#"<html data-scroll-height="{doc}" data-offset-height="{doc}" data-client-height="{vp}" data-inner-height="{vp}">
<body data-scroll-height="{doc}" data-offset-height="{doc}"><footer id="footer" data-height="{footer}"></footer></body></html>"#,
                doc = self.document,
                vp = self.viewport,
                footer = self.footer,
            );
            let mut snapshot = PageSnapshot::parse(&html).unwrap();
            page::simulate(&mut ScrollTracker::new(&self.params()), &mut snapshot, &self.steps())
        }

        fn run_script(&self) -> Vec<DataLayerEvent> {
            let browser = Browser::new();
            browser.run(&format!(
                r##"__page.document = {doc}; __page.viewport = {vp}; __page.heights = {{ "#footer": {footer} }}; window.innerHeight = {vp};"##,
                doc = self.document,
                vp = self.viewport,
                footer = self.footer,
            ));
            browser.load(&core_listener_html(&self.params()));
            for step in self.steps() {
                match step {
                    Step::Scroll(y) => browser.run(&format!("__scrollTo({y});")),
                    Step::Navigate => browser.run("__navigate();"),
                }
            }
            browser.data_layer()
        }
    }

    #[test]
    fn emitted_listener_matches_the_model() {
        for (index, scenario) in SCENARIOS.iter().enumerate() {
            let expected = scenario.expected();
            assert_eq!(scenario.run_model(), expected, "model, scenario {index}");
            assert_eq!(scenario.run_script(), expected, "script, scenario {index}");
        }
    }

    #[test]
    fn emitted_listener_coalesces_frames() {
        let browser = Browser::new();
        browser.run("__page.document = 2000; __page.viewport = 800; window.innerHeight = 800;");
        browser.load(&core_listener_html(&ListenerParams::free_tier(true)));
        browser.run(r#"window.pageYOffset = 600; __emit("scroll"); __emit("resize"); __emit("scroll");"#);
        assert_eq!(browser.json("__frames.length"), 1);

        let mut tracker = ScrollTracker::new(&ListenerParams::free_tier(true));
        assert_eq!(tracker.on_scroll(), FrameRequest::Schedule);
        assert_eq!(tracker.on_resize(), FrameRequest::Coalesced);
        assert_eq!(tracker.on_scroll(), FrameRequest::Coalesced);

        browser.run("__drain(__frames);");
        assert_eq!(
            browser.data_layer(),
            vec![
                DataLayerEvent::Threshold { scroll_percent: 25 },
                DataLayerEvent::Threshold { scroll_percent: 50 },
            ]
        );
    }

    #[test]
    fn emitted_listener_tolerates_a_missing_data_layer() {
        let browser = Browser::new();
        browser.run("delete window.dataLayer; __page.document = 2000; __page.viewport = 800; window.innerHeight = 800;");
        browser.load(&core_listener_html(&ListenerParams::free_tier(true)));
        browser.run("__scrollTo(1200);");
        assert_eq!(browser.json("typeof window.dataLayer"), "undefined");
    }

    fn completion_script(completion: &RequestCompletion) -> String {
        let literal = |url: &Option<String>| Value::String(url.clone().unwrap_or_default()).to_string();
        match completion {
            RequestCompletion::Xhr {
                ready_state,
                status,
                response_url,
            } => format!(
                "(function () {{ var xhr = new XMLHttpRequest(); xhr.send(); xhr.__finish({ready_state}, {status}, {url}); }})();",
                url = literal(response_url),
            ),
            RequestCompletion::Fetch { ok, url } => format!(
                r#"fetch("/submit", {{ ok: {ok}, url: {url} }});"#,
                url = literal(url),
            ),
        }
    }

    #[test]
    fn emitted_ajax_listener_matches_the_model() {
        let completions = [
            RequestCompletion::Xhr {
                ready_state: 4,
                status: 200,
                response_url: Some("https://shop.example/contact".into()),
            },
            RequestCompletion::Xhr {
                ready_state: 4,
                status: 204,
                response_url: None,
            },
            RequestCompletion::Xhr {
                ready_state: 4,
                status: 404,
                response_url: Some("https://shop.example/missing".into()),
            },
            RequestCompletion::Fetch {
                ok: true,
                url: Some("https://shop.example/subscribe".into()),
            },
            RequestCompletion::Fetch { ok: true, url: None },
            RequestCompletion::Fetch {
                ok: false,
                url: Some("https://shop.example/subscribe".into()),
            },
        ];

        let browser = Browser::new();
        browser.load(&ajax_listener_html());
        for completion in &completions {
            browser.run(&completion_script(completion));
        }
        browser.run(r#"fetch("/offline").catch(function () {});"#);

        let expected: Vec<DataLayerEvent> =
            completions.iter().filter_map(RequestCompletion::form_success).collect();
        assert_eq!(expected.len(), 4);
        assert_eq!(browser.data_layer(), expected);
    }
}
