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

//! `cairn-store` is a library providing a uniform repository abstraction over heterogeneous
//! resource stores, with a local file cache for remote resource content.
//!
//! A [`Repository`] exposes a single CRUD+metadata surface over a hierarchical namespace of
//! resources addressed by [`ResourceUri`] values, where a trailing path separator distinguishes
//! collections from non-collection resources. This crate builds the following on top of that
//! surface:
//! - Sub-repository mounting: a repository can be grafted at a path inside another repository,
//!   fully shadowing that subtree. Routing is handled by [`RepositoryRouter`] so backends never
//!   re-implement delegation logic.
//! - An archive-backed read-only repository which presents the entries of a zip file obtained
//!   from another repository as native resources.
//! - A [`ResourceCache`] which materializes remote resource bytes into local files, decides
//!   staleness from modification timestamps, and can apply resource-kit content filters to
//!   produce derivative files keyed by "aspect" (for example, a thumbnail).
//! - A [`KitSession`] registry mapping content types and resource types to pluggable
//!   [`ResourceKit`] handlers which provide creation defaults and aspect filters.
//!
//! The following repository backends are provided out of the box:
//! - [`FileRepository`] serves resources from a directory in the local file system.
//! - [`TransportRepository`] serves resources through an opaque [`Transport`], which is the
//!   integration point for WebDAV, Subversion-over-WebDAV, and S3 clients. [`MemoryTransport`]
//!   is an in-memory transport useful for testing.
//! - [`ZipRepository`] serves the entries of a cached zip archive, read-only.
//!
//! # Examples
//! ```
//! use cairn_store::repo::{FileRepository, Repository, ResourceDescription};
//! use cairn_store::uri::ResourceUri;
//!
//! fn main() -> cairn_store::Result<()> {
//!     let dir = tempfile::tempdir()?;
//!     let root = ResourceUri::parse("/")?;
//!     let repository = FileRepository::new(root.clone(), dir.path())?;
//!     repository.open()?;
//!
//!     let uri = root.child("greeting.txt")?;
//!     repository.create(&uri, &ResourceDescription::new(uri.clone()), b"hello")?;
//!
//!     assert!(repository.exists(&uri)?);
//!     assert_eq!(repository.describe(&uri)?.content_length(), 5);
//!
//!     Ok(())
//! }
//! ```
//!
//! [`Repository`]: crate::repo::Repository
//! [`ResourceUri`]: crate::uri::ResourceUri
//! [`RepositoryRouter`]: crate::repo::RepositoryRouter
//! [`ResourceCache`]: crate::cache::ResourceCache
//! [`KitSession`]: crate::kit::KitSession
//! [`ResourceKit`]: crate::kit::ResourceKit
//! [`FileRepository`]: crate::repo::FileRepository
//! [`TransportRepository`]: crate::repo::TransportRepository
//! [`Transport`]: crate::repo::Transport
//! [`MemoryTransport`]: crate::repo::MemoryTransport
//! [`ZipRepository`]: crate::repo::ZipRepository

pub use uuid;

pub use error::{Error, Result};

mod error;

pub mod cache;
pub mod kit;
pub mod repo;
pub mod uri;
