//! User-Agent string sent with every crawl request.
//!
//! Identifies the tool and version so site operators can recognise mirror
//! traffic (good citizenship; RFC 9308).

/// Product token used in the User-Agent header.
const PRODUCT: &str = "webmirror";

/// Default User-Agent for page and asset requests.
#[must_use]
pub(crate) fn default_crawl_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("{PRODUCT}/{version} (offline-mirror-crawler)")
}
