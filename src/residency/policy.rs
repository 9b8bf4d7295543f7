//! Buffer-or-stream decision and redirect signal parsing.
//!
//! The decision is a pure function of the status code and the headers as
//! they stand when the handler commits its status. Only responses inside the
//! configured status range that already carry the redirect header are
//! buffered; everything else streams.

use std::ops::RangeInclusive;
use std::str::FromStr;

use axum::http::uri::{Authority, PathAndQuery, Scheme};
use axum::http::{header, HeaderMap, HeaderName, StatusCode, Uri};

use crate::config::RedirectConfig;
use crate::residency::ResidencyError;

/// Decides which responses are held back pending a possible replay.
#[derive(Debug, Clone)]
pub struct RedirectPolicy {
    status_range: RangeInclusive<u16>,
    header_name: HeaderName,
}

impl RedirectPolicy {
    pub fn new(status_range: RangeInclusive<u16>, header_name: HeaderName) -> Self {
        Self {
            status_range,
            header_name,
        }
    }

    pub fn from_config(config: &RedirectConfig) -> Result<Self, header::InvalidHeaderName> {
        let (min, max) = config.buffer_status_range;
        let header_name = HeaderName::from_bytes(config.header_name.as_bytes())?;
        Ok(Self::new(min..=max, header_name))
    }

    pub fn header_name(&self) -> &HeaderName {
        &self.header_name
    }

    /// True when a response committed with `status` and `headers` must be buffered.
    pub fn should_buffer(&self, status: StatusCode, headers: &HeaderMap) -> bool {
        if !self.status_range.contains(&status.as_u16()) {
            return false;
        }
        headers
            .get(&self.header_name)
            .is_some_and(|value| !value.is_empty())
    }

    /// Extract the replay target from a buffered response's headers.
    ///
    /// Relative targets resolve against `origin`; without one they are
    /// malformed. The inbound `Host` is never consulted.
    pub fn signal(
        &self,
        headers: &HeaderMap,
        origin: Option<&Origin>,
    ) -> Result<Option<RedirectSignal>, ResidencyError> {
        let Some(value) = headers.get(&self.header_name) else {
            return Ok(None);
        };
        let value = value
            .to_str()
            .map_err(|_| ResidencyError::MalformedRedirectSignal {
                value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
                reason: "header value is not visible ASCII",
            })?
            .trim();
        if value.is_empty() {
            return Ok(None);
        }

        RedirectSignal::parse(value, origin)
            .map(Some)
            .map_err(|reason| ResidencyError::MalformedRedirectSignal {
                value: value.to_string(),
                reason,
            })
    }
}

impl Default for RedirectPolicy {
    fn default() -> Self {
        Self::new(400..=500, HeaderName::from_static("x-accel-redirect"))
    }
}

/// Scheme and authority that relative redirect targets resolve against.
///
/// Set by the operator, typically the upstream the edge forwards to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    scheme: Scheme,
    authority: Authority,
}

impl Origin {
    pub fn new(scheme: Scheme, authority: Authority) -> Self {
        Self { scheme, authority }
    }

    pub fn http(authority: Authority) -> Self {
        Self::new(Scheme::HTTP, authority)
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }
}

impl FromStr for Origin {
    type Err = &'static str;

    /// Accepts `http://host:port`, `https://host:port` or a bare `host:port`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if !value.contains("://") {
            return Authority::from_str(value)
                .map(Self::http)
                .map_err(|_| "not a valid authority");
        }
        let uri = Uri::from_str(value).map_err(|_| "not a valid URI")?;
        let scheme = match uri.scheme() {
            Some(s) if *s == Scheme::HTTP || *s == Scheme::HTTPS => s.clone(),
            _ => return Err("unsupported scheme"),
        };
        if uri.path_and_query().is_some_and(|pq| pq.as_str() != "/") {
            return Err("origin must not carry a path");
        }
        let authority = uri.authority().cloned().ok_or("missing host")?;
        Ok(Self::new(scheme, authority))
    }
}

/// Target a buffered response asked to be served from instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectSignal {
    scheme: Scheme,
    authority: Authority,
    path: String,
}

impl RedirectSignal {
    /// Parse `scheme://host/path` or a path relative to `origin`.
    ///
    /// Only the path of the target is kept; the replay carries the inbound
    /// query string.
    pub fn parse(value: &str, origin: Option<&Origin>) -> Result<Self, &'static str> {
        if value.contains("://") {
            let uri = Uri::from_str(value).map_err(|_| "not a valid URI")?;
            let scheme = match uri.scheme() {
                Some(s) if *s == Scheme::HTTP || *s == Scheme::HTTPS => s.clone(),
                Some(_) => return Err("unsupported scheme"),
                None => return Err("missing scheme"),
            };
            let authority = uri.authority().cloned().ok_or("missing host")?;
            let path = match uri.path() {
                "" => "/".to_string(),
                p => p.to_string(),
            };
            return Ok(Self {
                scheme,
                authority,
                path,
            });
        }

        if value.starts_with("//") {
            return Err("network-path reference without scheme");
        }
        let path = if value.starts_with('/') {
            value.to_string()
        } else {
            format!("/{value}")
        };
        let path = PathAndQuery::from_str(&path).map_err(|_| "not a valid path")?;

        let origin = origin.ok_or("no origin configured for relative targets")?;

        Ok(Self {
            scheme: origin.scheme.clone(),
            authority: origin.authority.clone(),
            path: path.path().to_string(),
        })
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Build the replay URI, keeping the query string of `original`.
    pub fn target_uri(&self, original: &Uri) -> Result<Uri, axum::http::Error> {
        let path_and_query = match original.query() {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        };
        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
    }
}
