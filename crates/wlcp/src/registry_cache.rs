// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container image rewriting through registry mirrors.

use crate::config::RegistryCacheRule;

const DOCKER_HUB: &str = "docker.io";

/// Rewrite `image` to pull through the first matching cache.
///
/// An image starting with a rule's `source` has that prefix replaced by the
/// rule's `cache`. An image without a registry host (at most one `/`) is
/// assumed to come from Docker Hub and is prefixed with the `docker.io`
/// cache when one is configured.
pub fn rewrite_image(image: &str, caches: &[RegistryCacheRule]) -> String {
    let mut docker_cache = None;

    for rule in caches {
        if let Some(rest) = image.strip_prefix(rule.source.as_str()) {
            return format!("{}{}", rule.cache, rest);
        }
        if rule.source == DOCKER_HUB {
            docker_cache = Some(rule.cache.as_str());
        }
    }

    match docker_cache {
        Some(cache) if image.matches('/').count() <= 1 => format!("{}/{}", cache, image),
        _ => image.to_string(),
    }
}
