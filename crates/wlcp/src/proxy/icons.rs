// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Platform icons served in place of the workspace's own.

use axum::body::Body;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, ETAG, EXPIRES, LAST_MODIFIED};
use axum::http::{Response, StatusCode};
use chrono::{Duration, Utc};

pub const ICON_ETAG: &str = "gigo-http-icon-v1";
const ICON_CACHE_CONTROL: &str = "public, max-age=604800";
const EPOCH_HTTP_DATE: &str = "Thu, 01 Jan 1970 00:00:00 GMT";

static FAVICON: &[u8] = include_bytes!("../../static/favicon.ico");
static APPLE_ICON: &[u8] = include_bytes!("../../static/apple-icon.png");
static ICON_192: &[u8] = include_bytes!("../../static/icon192.png");
static ICON_512: &[u8] = include_bytes!("../../static/icon512.png");

/// Bundled icon for a request path, matched on its suffix.
fn lookup(path: &str) -> Option<(&'static [u8], &'static str)> {
    if path.ends_with("/favicon.ico")
        || path.ends_with("/favicon-dark-support.ico")
        || path.ends_with("/favicon-dark-support.svg")
    {
        return Some((FAVICON, "image/x-icon"));
    }
    if path.ends_with("/apple-icon.png") {
        return Some((APPLE_ICON, "image/png"));
    }
    if path.ends_with("/icon192.png") {
        return Some((ICON_192, "image/png"));
    }
    if path.ends_with("/icon512.png") {
        return Some((ICON_512, "image/png"));
    }
    None
}

/// Response serving the bundled icon for `path`, if it names one.
pub fn icon_for_path(path: &str) -> Option<axum::response::Response> {
    let (bytes, content_type) = lookup(path)?;
    let expires = (Utc::now() + Duration::days(7))
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string();

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, content_type)
        .header(CACHE_CONTROL, ICON_CACHE_CONTROL)
        .header(EXPIRES, expires)
        .header(LAST_MODIFIED, EPOCH_HTTP_DATE)
        .header(ETAG, ICON_ETAG)
        .body(Body::from(bytes))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_icon_family() {
        let response = icon_for_path("/favicon.ico").unwrap();
        assert_eq!(response.headers()[CONTENT_TYPE], "image/x-icon");
        assert_eq!(response.headers()[ETAG], ICON_ETAG);
        assert_eq!(response.headers()[CACHE_CONTROL], "public, max-age=604800");
        assert_eq!(response.headers()[LAST_MODIFIED], EPOCH_HTTP_DATE);

        let response = icon_for_path("/static/favicon-dark-support.svg").unwrap();
        assert_eq!(response.headers()[CONTENT_TYPE], "image/x-icon");

        for path in ["/apple-icon.png", "/icon192.png", "/deep/icon512.png"] {
            let response = icon_for_path(path).unwrap();
            assert_eq!(response.headers()[CONTENT_TYPE], "image/png");
        }
    }

    #[test]
    fn test_other_paths_pass_through() {
        assert!(icon_for_path("/").is_none());
        assert!(icon_for_path("/myfavicon.ico").is_none());
        assert!(icon_for_path("/icon256.png").is_none());
    }

    #[test]
    fn test_bundled_images_are_valid() {
        assert_eq!(&ICON_192[..8], b"\x89PNG\r\n\x1a\n");
        assert_eq!(&FAVICON[..4], &[0, 0, 1, 0]);
    }
}
