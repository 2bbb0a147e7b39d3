use axum::extract::{ConnectInfo, FromRequestParts};
use http::{request::Parts, HeaderMap, StatusCode};
use std::{
    fmt::{self, Formatter},
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

/// Proxy headers consulted, in order, for the real client address.
const FORWARDED_HEADERS: [&str; 4] = [
    "x-client-ip",
    "x-forwarded-for",
    "x-real-ip",
    "cf-connecting-ip",
];

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClientAddr {
    pub addr: SocketAddr,
}

impl ClientAddr {
    pub fn new(addr: SocketAddr) -> Self {
        ClientAddr { addr }
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    /// Peer address, overridden by the first parseable forwarded header.
    pub fn from_http_parts(headers: &HeaderMap, connect_info: Option<SocketAddr>) -> Self {
        let mut addr = connect_info
            .unwrap_or_else(|| SocketAddr::from((IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)));
        for header in FORWARDED_HEADERS {
            let Some(value) = headers.get(header).and_then(|v| v.to_str().ok()) else {
                continue;
            };
            // X-Forwarded-For may carry a chain; the first hop is the client
            let first = value.split(',').next().unwrap_or(value).trim();
            if let Ok(ip) = first.parse::<IpAddr>() {
                addr.set_ip(ip);
                break;
            }
        }
        ClientAddr { addr }
    }
}

impl<S> FromRequestParts<S> for ClientAddr
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let connect_info = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(Self::from_http_parts(&parts.headers, connect_info))
    }
}

impl fmt::Display for ClientAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}
