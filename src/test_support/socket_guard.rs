//! Lets wiremock tests skip where the sandbox forbids binding localhost.
//!
//! Set `WEBMIRROR_REQUIRE_SOCKET_TESTS=1` in CI so a missing socket fails
//! the test instead.

use std::net::TcpListener;
use std::panic::Location;

use wiremock::MockServer;

fn skip_allowed() -> bool {
    !std::env::var("WEBMIRROR_REQUIRE_SOCKET_TESTS")
        .is_ok_and(|value| matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

/// Starts a mock server, or returns `None` after logging why the caller is
/// being skipped.
#[track_caller]
pub(crate) fn start_mock_server_or_skip() -> impl std::future::Future<Output = Option<MockServer>> {
    let caller = Location::caller();
    let bindable = TcpListener::bind(("127.0.0.1", 0)).is_ok();
    async move {
        if bindable {
            return Some(MockServer::start().await);
        }
        let reason = format!("{caller}: no localhost socket available for wiremock");
        assert!(skip_allowed(), "{reason}");
        eprintln!("skipping {reason}");
        None
    }
}
