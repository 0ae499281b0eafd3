//! Source trust checks for inbound webhook requests.

use std::net::IpAddr;

/// Decides whether a webhook request may be processed based on its source address.
///
/// `None` means the address could not be determined.
pub trait TrustPolicy: Send + Sync {
    fn is_trusted_source(&self, ip: Option<IpAddr>) -> bool;
}

/// Permits every source. The webhook secret in the URL is the only gate.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl TrustPolicy for AllowAll {
    fn is_trusted_source(&self, _ip: Option<IpAddr>) -> bool {
        true
    }
}

/// Best-effort client address from proxy headers.
///
/// Uses the first entry of `x-forwarded-for`, then `x-real-ip`. Both are
/// client-controlled and can be spoofed.
pub fn client_ip(headers: &axum::http::HeaderMap) -> Option<IpAddr> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok());

    forwarded.or_else(|| {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    })
}
