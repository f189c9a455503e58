/*
 * Copyright 2019-2021 Wren Powell
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::uri::ResourceUri;

use super::description::ResourceDescription;

/// A filter which selects resources during child enumeration.
///
/// Filtering happens in two phases: candidates are first tested by URI, and only those which
/// pass are described and tested by their full description. Backends never construct a
/// description for a resource rejected by [`accept_uri`], so URI-based rejection stays cheap.
///
/// [`accept_uri`]: ResourceFilter::accept_uri
pub trait ResourceFilter {
    /// Return whether the resource at `uri` should be considered at all.
    fn accept_uri(&self, uri: &ResourceUri) -> bool {
        let _ = uri;
        true
    }

    /// Return whether the described resource should be included.
    fn accept(&self, description: &ResourceDescription) -> bool {
        let _ = description;
        true
    }
}

/// A [`ResourceFilter`] which selects only collection resources.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectionFilter;

impl ResourceFilter for CollectionFilter {
    fn accept_uri(&self, uri: &ResourceUri) -> bool {
        uri.is_collection()
    }
}

/// A [`ResourceFilter`] which selects resources by name extension.
#[derive(Debug, Clone)]
pub struct ExtensionFilter {
    extension: String,
}

impl ExtensionFilter {
    /// Create a filter which selects non-collection resources whose name ends with the given
    /// `extension` (not including the `.`).
    pub fn new(extension: impl Into<String>) -> Self {
        ExtensionFilter {
            extension: extension.into(),
        }
    }
}

impl ResourceFilter for ExtensionFilter {
    fn accept_uri(&self, uri: &ResourceUri) -> bool {
        !uri.is_collection()
            && uri
                .name()
                .rsplit_once('.')
                .map(|(_, extension)| extension == self.extension)
                .unwrap_or(false)
    }
}
