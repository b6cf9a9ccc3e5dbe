/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::fmt;

use http::header::{CONTENT_DISPOSITION, HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use log::warn;
use prerender_core::{FinalStatus, NoVarySearch};

pub(crate) const NO_VARY_SEARCH: &str = "no-vary-search";
pub(crate) const SUPPORTS_LOADING_MODE: &str = "supports-loading-mode";
pub(crate) const CREDENTIALED_PRERENDER: &str = "credentialed-prerender";

/// Terminal response of a speculative document's initial navigation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseHeaders {
    status: StatusCode,
    headers: HeaderMap,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponseHeadersError {
    InvalidStatus(u16),
    InvalidHeader { name: String },
}

impl fmt::Display for ResponseHeadersError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidStatus(code) => write!(f, "invalid HTTP status {code}"),
            Self::InvalidHeader { name } => write!(f, "invalid response header '{name}'"),
        }
    }
}

impl std::error::Error for ResponseHeadersError {}

impl ResponseHeaders {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::OK)
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Builds headers from loosely typed pairs, as a replay script or a host
    /// bridge would hand them over.
    pub fn from_pairs<'a>(
        status: u16,
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, ResponseHeadersError> {
        let status =
            StatusCode::from_u16(status).map_err(|_| ResponseHeadersError::InvalidStatus(status))?;
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            let invalid = || ResponseHeadersError::InvalidHeader {
                name: name.to_string(),
            };
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid())?;
            let header_value = HeaderValue::from_str(value).map_err(|_| invalid())?;
            headers.append(header_name, header_value);
        }
        Ok(Self { status, headers })
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The authoritative `No-Vary-Search` relation, if the response declared a
    /// parseable one.
    pub fn no_vary_search(&self) -> Option<NoVarySearch> {
        let raw = self.headers.get(NO_VARY_SEARCH)?.to_str().ok()?;
        match NoVarySearch::parse(raw) {
            Ok(nvs) => Some(nvs),
            Err(error) => {
                warn!("ignoring response No-Vary-Search: {error}");
                None
            }
        }
    }

    /// Same-site cross-origin opt-in: `Supports-Loading-Mode: credentialed-prerender`.
    pub fn opts_into_cross_origin_prerender(&self) -> bool {
        self.headers
            .get_all(SUPPORTS_LOADING_MODE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case(CREDENTIALED_PRERENDER))
    }

    pub fn is_attachment(&self) -> bool {
        self.headers
            .get(CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .map(|value| {
                value
                    .split(';')
                    .next()
                    .is_some_and(|kind| kind.trim().eq_ignore_ascii_case("attachment"))
            })
            .unwrap_or(false)
    }

    /// Whether the response can become a speculative document at all.
    pub fn classify(&self) -> Result<(), FinalStatus> {
        match self.status {
            StatusCode::UNAUTHORIZED | StatusCode::PROXY_AUTHENTICATION_REQUIRED => {
                return Err(FinalStatus::AuthRequested);
            }
            StatusCode::NO_CONTENT | StatusCode::RESET_CONTENT => {
                return Err(FinalStatus::BadHttpStatus);
            }
            status if !status.is_success() => return Err(FinalStatus::BadHttpStatus),
            _ => {}
        }
        if self.is_attachment() {
            return Err(FinalStatus::DownloadTriggered);
        }
        Ok(())
    }
}
