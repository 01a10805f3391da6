use http::{HeaderMap, Response};
use std::collections::BTreeMap;

/// The normalized response handed to
/// [`ResponseHandler::headers_received`](crate::ResponseHandler::headers_received).
///
/// Header names are lowercase and every value of a repeated header is kept,
/// in wire order, under its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    status_code: u16,
    status_text: String,
    headers: BTreeMap<String, Vec<String>>,
}

impl ResponseHead {
    pub fn new(
        status_code: u16,
        status_text: impl Into<String>,
        headers: BTreeMap<String, Vec<String>>,
    ) -> Self {
        Self {
            status_code,
            status_text: status_text.into(),
            headers,
        }
    }

    /// Builds the head from a parsed response.
    ///
    /// HTTP/1.1 responses carry their reason phrase; HTTP/2 has none, so the
    /// canonical reason for the status is used instead.
    pub fn from_response<B>(response: &Response<B>) -> Self {
        let status = response.status();
        let status_text = response
            .extensions()
            .get::<hyper::ext::ReasonPhrase>()
            .map(|reason| String::from_utf8_lossy(reason.as_bytes()).into_owned())
            .or_else(|| status.canonical_reason().map(str::to_owned))
            .unwrap_or_default();

        Self {
            status_code: status.as_u16(),
            status_text,
            headers: group_headers(response.headers()),
        }
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    pub fn headers(&self) -> &BTreeMap<String, Vec<String>> {
        &self.headers
    }

    /// First value of `name`, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_values(name).first().map(String::as_str)
    }

    pub fn header_values(&self, name: &str) -> &[String] {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

fn group_headers(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        grouped
            .entry(name.as_str().to_owned())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    grouped
}
