use super::{DataLayerEvent, Page};

/// Completion of a request observed by the AJAX listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestCompletion {
    /// `XMLHttpRequest` reaching `loadend`.
    Xhr {
        ready_state: u8,
        status: u16,
        response_url: Option<String>,
    },
    /// Resolution of a `fetch` promise.
    Fetch { ok: bool, url: Option<String> },
}

impl RequestCompletion {
    /// The form-success record for a successful request. Every success
    /// produces one; repeated submissions are meaningful and not deduplicated.
    pub fn form_success(&self) -> Option<DataLayerEvent> {
        let form_url = match self {
            RequestCompletion::Xhr {
                ready_state: 4,
                status: 200..=299,
                response_url,
            } => resolved_url(response_url.as_deref(), "XHR"),
            RequestCompletion::Fetch { ok: true, url } => resolved_url(url.as_deref(), "fetch"),
            _ => return None,
        };
        Some(DataLayerEvent::FormSuccess { form_url })
    }
}

fn resolved_url(url: Option<&str>, fallback: &str) -> String {
    url.filter(|u| !u.is_empty()).unwrap_or(fallback).to_string()
}

/// Pushes the form-success record, if any, onto the page's data layer.
/// Returns whether a record was pushed.
pub fn record_completion<P: Page + ?Sized>(page: &mut P, completion: &RequestCompletion) -> bool {
    let Some(event) = completion.form_success() else {
        return false;
    };
    match page.data_layer() {
        Some(data_layer) => {
            data_layer.push(event);
            true
        }
        None => false,
    }
}
