use crate::config::HttpTimeouts;
use reqwest::Client;

/// Shared outbound client. These timeouts are the only ones applied to
/// identity, store, mail and LLM calls.
pub fn build_client(timeouts: HttpTimeouts) -> Client {
    Client::builder()
        .timeout(timeouts.request)
        .connect_timeout(timeouts.connect)
        .user_agent(concat!("ceylog-api-rs/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| Client::new())
}
