//! Resolves media message bodies into fetchable URLs.

use parley_store::MessageRecord;

pub struct MediaLocator {
    base_url: String,
}

impl MediaLocator {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into().trim().to_string();
        if !base_url.is_empty() && !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self { base_url }
    }

    /// URL for a media message body. Absolute URLs pass through; storage
    /// paths get the configured base prepended. Non-media messages resolve
    /// to nothing.
    pub fn resolve(&self, record: &MessageRecord) -> Option<String> {
        if !record.kind.is_media() {
            return None;
        }

        let body = record.body.trim();
        if body.is_empty() {
            return None;
        }
        if body.starts_with("http://") || body.starts_with("https://") {
            return Some(body.to_string());
        }
        Some(format!(
            "{}{}",
            self.base_url,
            body.trim_start_matches('/')
        ))
    }
}
