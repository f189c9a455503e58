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

use std::io;
use std::result;

use thiserror::Error as DeriveError;

use crate::uri::ResourceUri;

/// The error type for operations with a repository.
///
/// Backend-specific errors (HTTP status codes, file system errors, zip format errors) are
/// translated into this taxonomy at the repository boundary and never leaked raw to callers.
/// Variants which concern a specific resource carry its URI.
#[derive(Debug, DeriveError)]
#[non_exhaustive]
pub enum Error {
    /// No resource exists at the given URI.
    #[error("No resource exists at `{uri}`.")]
    NotFound {
        /// The URI of the missing resource.
        uri: ResourceUri,
    },

    /// Access to the resource was denied by the backend.
    #[error("Access to the resource at `{uri}` was denied.")]
    Forbidden {
        /// The URI of the resource.
        uri: ResourceUri,
    },

    /// A precondition on the resource failed, such as a concurrent modification or a clash
    /// between a collection and a non-collection resource at the same name.
    #[error("A precondition on the resource at `{uri}` failed.")]
    Conflict {
        /// The URI of the resource.
        uri: ResourceUri,
    },

    /// The repository is missing required configuration.
    ///
    /// This is fatal until corrected by a configuration change and is never retried
    /// automatically.
    #[error("The repository is misconfigured: {0}")]
    Configuration(String),

    /// The operation is not available on this repository variant.
    #[error("The operation `{operation}` is not supported by this repository.")]
    Unsupported {
        /// The name of the unsupported operation.
        operation: &'static str,
    },

    /// The repository is closed and auto-open is not configured.
    #[error("The repository is closed.")]
    Closed,

    /// The given string is not a valid resource URI.
    #[error("The string `{0}` is not a valid resource URI.")]
    InvalidUri(String),

    /// An error occurred in the backend transport.
    #[error("A transport error occurred for the resource at `{uri}`: {source}")]
    Transport {
        /// The URI of the resource the operation concerned.
        uri: ResourceUri,
        /// The underlying cause.
        #[source]
        source: anyhow::Error,
    },

    /// A value could not be serialized.
    #[error("A value could not be serialized.")]
    Serialize,

    /// A value could not be deserialized.
    #[error("A value could not be deserialized.")]
    Deserialize,

    /// An I/O error occurred.
    #[error("{0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Construct a `Transport` error for the resource at `uri` from a backend error.
    pub fn transport(
        uri: &ResourceUri,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        Error::Transport {
            uri: uri.clone(),
            source: source.into(),
        }
    }

    /// Construct a `NotFound` error for the resource at `uri`.
    pub fn not_found(uri: &ResourceUri) -> Self {
        Error::NotFound { uri: uri.clone() }
    }

    /// Construct a `Conflict` error for the resource at `uri`.
    pub fn conflict(uri: &ResourceUri) -> Self {
        Error::Conflict { uri: uri.clone() }
    }
}

/// The result type for operations with a repository.
pub type Result<T> = result::Result<T, Error>;
