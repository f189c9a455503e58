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

//! Repositories and the resources they hold.
//!
//! A [`Repository`] presents a hierarchy of resources addressed by [`ResourceUri`] values and
//! described by [`ResourceDescription`] values, independent of where the resources are actually
//! stored. This module provides the repository abstraction itself along with the bundled
//! implementations:
//!
//! - [`FileRepository`]: Resources stored in a directory on the local file system.
//! - [`TransportRepository`]: Resources behind a pluggable remote [`Transport`].
//! - [`ZipRepository`]: Read-only resources inside a zip archive.
//! - [`RepositoryRouter`]: A composite which routes requests to mounted sub-repositories.
//!
//! [`ResourceUri`]: crate::uri::ResourceUri

mod archive;
mod description;
mod file;
mod filter;
mod repository;
mod router;
mod transport;

pub use archive::{ZipConfig, ZipRepository};
pub use description::{
    format_timestamp, parse_timestamp, Property, ResourceDescription, StandardProperty,
    CONTENT_CREATED, CONTENT_LENGTH, CONTENT_MODIFIED, CONTENT_TYPE, RESOURCE_TYPE,
};
pub use file::FileRepository;
pub use filter::{CollectionFilter, ExtensionFilter, ResourceFilter};
pub use repository::{
    copy_tree, move_tree, DeferredWriter, Depth, Repository, ResourceWriter,
    COLLECTION_CONTENT_NAME,
};
pub use router::RepositoryRouter;
pub use transport::{
    MemoryTransport, Transport, TransportEntry, TransportError, TransportRepository,
    TransportResult,
};
