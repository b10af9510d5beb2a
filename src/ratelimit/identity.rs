//! Client identifier resolution.

use std::net::IpAddr;

/// Header carrying the proxy chain, leftmost entry is the original client.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
/// Header some proxies use for the directly connected client.
pub const REAL_IP_HEADER: &str = "x-real-ip";

/// The parts of an inbound request the limiter cares about.
#[derive(Debug, Clone, Default)]
pub struct ClientRequest {
    /// HTTP method
    pub method: String,
    /// Authenticated user id, if the request is signed in
    pub user_id: Option<String>,
    /// Raw forwarded-for header value
    pub forwarded_for: Option<String>,
    /// Address of the directly connected peer
    pub direct_addr: Option<String>,
}

impl ClientRequest {
    /// Create a new builder for a client request.
    pub fn builder() -> ClientRequestBuilder {
        ClientRequestBuilder::default()
    }

    /// Build a request from raw header pairs and the peer address.
    ///
    /// Header names are matched case-insensitively. `x-real-ip` is used as
    /// the direct address when no socket address is known.
    pub fn from_headers<'a, I>(method: &str, headers: I, peer: Option<IpAddr>) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut forwarded_for = None;
        let mut real_ip = None;

        for (name, value) in headers {
            if name.eq_ignore_ascii_case(FORWARDED_FOR_HEADER) {
                forwarded_for = Some(value.to_string());
            } else if name.eq_ignore_ascii_case(REAL_IP_HEADER) {
                real_ip = Some(value.trim().to_string());
            }
        }

        Self {
            method: method.to_string(),
            user_id: None,
            forwarded_for,
            direct_addr: peer.map(|ip| ip.to_string()).or(real_ip),
        }
    }

    /// Derive the stable identity string for this request.
    ///
    /// `user:{id}` when authenticated, otherwise `ip:{address}` using the
    /// first forwarded-for entry, then the direct address, then `unknown`.
    pub fn resolve(&self) -> String {
        if let Some(user_id) = self.user_id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
            return format!("user:{user_id}");
        }

        let forwarded = self
            .forwarded_for
            .as_deref()
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|addr| !addr.is_empty());

        let direct = self
            .direct_addr
            .as_deref()
            .map(str::trim)
            .filter(|addr| !addr.is_empty());

        format!("ip:{}", forwarded.or(direct).unwrap_or("unknown"))
    }
}

/// Builder for creating client requests.
#[derive(Debug, Default)]
pub struct ClientRequestBuilder {
    method: Option<String>,
    user_id: Option<String>,
    forwarded_for: Option<String>,
    direct_addr: Option<String>,
}

impl ClientRequestBuilder {
    /// Set the HTTP method.
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    /// Set the authenticated user id.
    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set the forwarded-for header value.
    pub fn forwarded_for(mut self, value: impl Into<String>) -> Self {
        self.forwarded_for = Some(value.into());
        self
    }

    /// Set the direct peer address.
    pub fn direct_addr(mut self, addr: impl Into<String>) -> Self {
        self.direct_addr = Some(addr.into());
        self
    }

    /// Build the client request.
    pub fn build(self) -> ClientRequest {
        ClientRequest {
            method: self.method.unwrap_or_else(|| "GET".to_string()),
            user_id: self.user_id,
            forwarded_for: self.forwarded_for,
            direct_addr: self.direct_addr,
        }
    }
}
