//! HTTP client used by bridges to announce themselves to the directory.

use core::fmt::{Display, Formatter};
use std::time::Duration;

use reqwest::header::HOST;
use reqwest::StatusCode;

use crate::crypto::Cookie;

/// Failure of one announce round-trip.
#[derive(Debug)]
#[non_exhaustive]
pub enum AnnounceError {
    /// The request never produced a response.
    Http(reqwest::Error),
    /// The directory answered with a non-success status.
    Status(StatusCode),
}

impl Display for AnnounceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            AnnounceError::Http(e) => write!(f, "announce failed: {}", e),
            AnnounceError::Status(code) => write!(f, "directory answered {}", code),
        }
    }
}

impl core::error::Error for AnnounceError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            AnnounceError::Http(e) => Some(e),
            AnnounceError::Status(_) => None,
        }
    }
}

impl From<reqwest::Error> for AnnounceError {
    fn from(e: reqwest::Error) -> Self {
        AnnounceError::Http(e)
    }
}

/// Client for the directory's bridge-facing surface.
///
/// Requests go to the fronting URL with the directory's real hostname in
/// the `Host` header, so the TLS SNI shows only the front.
#[derive(Debug)]
pub struct BinderClient {
    front: String,
    real_host: String,
    http: reqwest::Client,
}

impl BinderClient {
    /// Creates a client for the directory fronted at `front` whose real
    /// hostname is `real_host`.
    pub fn new(front: impl Into<String>, real_host: impl Into<String>) -> Self {
        Self {
            front: front.into(),
            real_host: real_host.into(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("static client configuration"),
        }
    }

    /// Announces (or refreshes) a bridge registration.
    ///
    /// The directory will probe the advertised `host` with `cookie` before
    /// accepting, so the bridge must already be listening when it announces.
    pub async fn add_bridge(
        &self,
        bridge_key: &str,
        cookie: &Cookie,
        host: &str,
        alloc_group: &str,
    ) -> Result<(), AnnounceError> {
        let response = self
            .http
            .post(format!("{}/add-bridge", self.front))
            .header(HOST, &self.real_host)
            .basic_auth("", Some(bridge_key))
            .form(&[
                ("cookie", cookie.to_hex().as_str()),
                ("host", host),
                ("allocGroup", alloc_group),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AnnounceError::Status(response.status()));
        }
        Ok(())
    }
}
