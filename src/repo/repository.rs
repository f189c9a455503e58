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

use std::fmt::Debug;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use static_assertions::assert_obj_safe;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::uri::{encode_segment, ResourceUri};

use super::description::ResourceDescription;
use super::filter::ResourceFilter;

/// The name of the child resource which holds the literal content of a collection.
///
/// Collections are not assumed to carry literal bytes. Reading the content of a collection URI
/// streams the bytes of this surrogate child if it exists and an empty stream otherwise.
pub const COLLECTION_CONTENT_NAME: &str = ".content";

/// A depth limit for child resource enumeration.
///
/// A depth of zero always yields an empty child list. `Unlimited` enumerates the entire subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    /// Enumerate children at most this many hierarchy levels deep.
    Limited(u32),

    /// Enumerate the entire subtree.
    Unlimited,
}

impl Depth {
    /// A depth which yields no children.
    pub const ZERO: Depth = Depth::Limited(0);

    /// A depth which yields only direct children.
    pub const ONE: Depth = Depth::Limited(1);

    /// Return whether this depth yields no children.
    pub fn is_zero(self) -> bool {
        self == Depth::ZERO
    }

    /// Return whether a resource `levels` below the enumeration root is within this depth.
    pub fn includes(self, levels: u32) -> bool {
        match self {
            Depth::Limited(limit) => levels <= limit,
            Depth::Unlimited => true,
        }
    }

    /// Return the depth budget remaining after descending `levels` hierarchy levels.
    pub fn remaining(self, levels: u32) -> Depth {
        match self {
            Depth::Limited(limit) => Depth::Limited(limit.saturating_sub(levels)),
            Depth::Unlimited => Depth::Unlimited,
        }
    }
}

/// A writer for the content of a resource.
///
/// Dropping the writer commits the written bytes; use [`finish`] to commit explicitly and
/// observe errors, or [`abort`] to discard the written bytes and leave the previous version of
/// the resource intact. The resource's description is only updated once the writer is finished,
/// since the content length depends on the final content.
///
/// [`finish`]: ResourceWriter::finish
/// [`abort`]: ResourceWriter::abort
pub trait ResourceWriter: Write + Send {
    /// Commit the written bytes and update the resource description.
    fn finish(self: Box<Self>) -> Result<()>;

    /// Discard the written bytes, leaving the previous version of the resource intact.
    fn abort(self: Box<Self>);
}

/// A repository of resources addressed by URI.
///
/// All operations accept and return URIs in the repository's *public* namespace; translation to
/// a private backing namespace, if the two diverge, is the repository's responsibility and is
/// invisible to callers.
///
/// A repository is either open or closed. [`open`] establishes and validates backend
/// connectivity, and all addressing and content operations require the repository to be open
/// unless it was configured to open automatically on first use. [`close`] is idempotent.
///
/// Repositories are internally synchronized; operations may be invoked concurrently from
/// independent caller threads. Blocking I/O occurs synchronously within the calling thread.
///
/// [`open`]: Repository::open
/// [`close`]: Repository::close
pub trait Repository: Debug + Send + Sync {
    /// Return an identifier unique to this repository instance.
    fn instance_id(&self) -> Uuid;

    /// Return the root URI of the repository's public address space.
    fn root_uri(&self) -> &ResourceUri;

    /// Open the repository, establishing and validating backend connectivity.
    fn open(&self) -> Result<()>;

    /// Close the repository.
    ///
    /// Closing an already-closed repository does nothing.
    fn close(&self);

    /// Return whether the repository is open.
    fn is_open(&self) -> bool;

    /// Attach the parent repository this repository is mounted under.
    ///
    /// This is invoked when the repository is mounted as a sub-repository. The default
    /// implementation discards the parent.
    fn attach_parent(&self, parent: Arc<dyn Repository>) {
        let _ = parent;
    }

    /// Return whether a resource exists at the given `uri`.
    ///
    /// # Errors
    /// - `Error::Transport`: A backend error occurred.
    fn exists(&self, uri: &ResourceUri) -> Result<bool>;

    /// Return a description of the resource at the given `uri`.
    ///
    /// # Errors
    /// - `Error::NotFound`: There is no resource at `uri`.
    /// - `Error::Forbidden`: The backend denied access to the resource.
    fn describe(&self, uri: &ResourceUri) -> Result<ResourceDescription>;

    /// Return a stream of the content of the resource at the given `uri`.
    ///
    /// For a collection URI this returns the bytes of the collection's content surrogate child
    /// ([`COLLECTION_CONTENT_NAME`]) if present and an empty stream otherwise.
    ///
    /// # Errors
    /// - `Error::NotFound`: There is no resource at `uri`.
    fn read(&self, uri: &ResourceUri) -> Result<Box<dyn Read + Send>>;

    /// Return a writer which replaces the content of the resource at the given `uri`.
    ///
    /// A missing non-collection resource is created when the writer finishes, like [`create`].
    /// The resource's description is updated when the writer is finished, not before.
    ///
    /// # Errors
    /// - `Error::NotFound`: `uri` is a collection URI and no collection exists there, or its
    /// parent collection does not exist.
    /// - `Error::Unsupported`: This repository is read-only.
    ///
    /// [`create`]: Repository::create
    fn write(&self, uri: &ResourceUri) -> Result<Box<dyn ResourceWriter>>;

    /// Create or overwrite the resource at the given `uri` with the given `content`.
    ///
    /// Custom properties in `description` are applied to the new resource. When an existing
    /// resource is overwritten, its previously set custom properties are preserved unless
    /// `description` explicitly replaces them.
    ///
    /// # Errors
    /// - `Error::Conflict`: A collection exists at the non-collection form of `uri`, or vice
    /// versa.
    /// - `Error::Unsupported`: This repository is read-only.
    fn create(
        &self,
        uri: &ResourceUri,
        description: &ResourceDescription,
        content: &[u8],
    ) -> Result<ResourceDescription>;

    /// Create the collection at the given `uri`.
    ///
    /// # Errors
    /// - `Error::InvalidUri`: `uri` is not a collection URI.
    /// - `Error::Conflict`: A non-collection resource exists at the same name.
    /// - `Error::Unsupported`: This repository is read-only.
    fn create_collection(&self, uri: &ResourceUri) -> Result<ResourceDescription>;

    /// Delete the resource at the given `uri`, including any descendants.
    ///
    /// # Errors
    /// - `Error::Configuration`: `uri` is the repository's own root, which cannot be deleted.
    /// - `Error::NotFound`: There is no resource at `uri`.
    /// - `Error::Unsupported`: This repository is read-only.
    fn delete(&self, uri: &ResourceUri) -> Result<()>;

    /// Return descriptions of the child resources of the collection at `uri`.
    ///
    /// A `depth` of zero returns an empty list. At each level, candidate children are first
    /// filtered by URI and only then described, so that resources rejected by the cheap URI
    /// check never pay the cost of description construction.
    ///
    /// # Errors
    /// - `Error::NotFound`: There is no resource at `uri`.
    fn list_children(
        &self,
        uri: &ResourceUri,
        filter: Option<&dyn ResourceFilter>,
        depth: Depth,
    ) -> Result<Vec<ResourceDescription>>;

    /// Set the given `properties` on the resource at `uri`, returning the updated description.
    ///
    /// # Errors
    /// - `Error::NotFound`: There is no resource at `uri`.
    fn set_properties(
        &self,
        uri: &ResourceUri,
        properties: &[super::description::Property],
    ) -> Result<ResourceDescription>;

    /// Remove the properties with the given URIs from the resource at `uri`, returning the
    /// updated description.
    ///
    /// # Errors
    /// - `Error::NotFound`: There is no resource at `uri`.
    fn remove_properties(
        &self,
        uri: &ResourceUri,
        property_uris: &[&str],
    ) -> Result<ResourceDescription>;

    /// Copy the resource at `source` to `dest` within this repository.
    ///
    /// Copying a collection recursively copies its child resources. Content and custom
    /// properties are carried to the destination.
    ///
    /// # Errors
    /// - `Error::NotFound`: There is no resource at `source`.
    /// - `Error::Conflict`: `source` and `dest` do not agree on collection-ness.
    fn copy(&self, source: &ResourceUri, dest: &ResourceUri) -> Result<()> {
        copy_tree(self, self, source, dest)
    }

    /// Move the resource at `source` to `dest` within this repository.
    ///
    /// The move is atomic from the caller's perspective: after a successful move the destination
    /// holds the full prior content and properties and the source no longer exists; after a
    /// failed move the source is unchanged and the destination is not left partially populated.
    ///
    /// # Errors
    /// - `Error::Configuration`: `source` is the repository's own root, which cannot be renamed.
    /// - `Error::NotFound`: There is no resource at `source`.
    fn move_resource(&self, source: &ResourceUri, dest: &ResourceUri) -> Result<()> {
        if source == self.root_uri() {
            return Err(Error::Configuration(format!(
                "the repository root `{}` cannot be moved",
                source
            )));
        }
        move_tree(self, source, dest)
    }
}

assert_obj_safe!(Repository);

/// Copy the resource at `source` in `source_repo` to `dest` in `dest_repo`.
///
/// Collections are copied recursively, one level at a time. Custom properties are carried to
/// each destination resource. The copy aborts at the first failure.
pub fn copy_tree<S, D>(
    source_repo: &S,
    dest_repo: &D,
    source: &ResourceUri,
    dest: &ResourceUri,
) -> Result<()>
where
    S: Repository + ?Sized,
    D: Repository + ?Sized,
{
    if source.is_collection() != dest.is_collection() {
        return Err(Error::conflict(dest));
    }

    let description = source_repo.describe(source)?;

    let mut carried = ResourceDescription::new(dest.clone());
    for property in description.custom_properties() {
        carried.set_property(property.clone());
    }

    if source.is_collection() {
        dest_repo.create_collection(dest)?;
        let custom: Vec<_> = carried.properties().to_vec();
        if !custom.is_empty() {
            dest_repo.set_properties(dest, &custom)?;
        }

        for child in source_repo.list_children(source, None, Depth::ONE)? {
            // The listed name is decoded; re-encode it for the destination URI.
            let name = encode_segment(&child.uri().name());
            let child_dest = if child.uri().is_collection() {
                dest.child_collection(&name)?
            } else {
                dest.child(&name)?
            };
            copy_tree(source_repo, dest_repo, child.uri(), &child_dest)?;
        }
    } else {
        let mut content = Vec::new();
        source_repo.read(source)?.read_to_end(&mut content)?;
        dest_repo.create(dest, &carried, &content)?;
    }

    Ok(())
}

/// Move the resource at `source` to `dest` by copying and then deleting the source.
///
/// If the copy fails, whatever part of the destination was populated is removed before the
/// error is reported, so a failed move never leaves a partially populated destination.
pub fn move_tree<R>(repo: &R, source: &ResourceUri, dest: &ResourceUri) -> Result<()>
where
    R: Repository + ?Sized,
{
    match repo.copy(source, dest) {
        Ok(()) => repo.delete(source),
        Err(error) => {
            if repo.exists(dest).unwrap_or(false) {
                if let Err(cleanup_error) = repo.delete(dest) {
                    log::warn!(
                        "could not clean up partially moved resource at `{}`: {}",
                        dest,
                        cleanup_error
                    );
                }
            }
            Err(error)
        }
    }
}

/// The open/closed state of a repository.
///
/// Backends call [`ensure_open`] at the top of every operation. When the repository was
/// configured to open automatically, the first operation transitions it to open transparently;
/// otherwise operating on a closed repository fails fast with `Error::Closed`.
///
/// [`ensure_open`]: OpenState::ensure_open
#[derive(Debug)]
pub(crate) struct OpenState {
    open: AtomicBool,
    auto_open: bool,
}

impl OpenState {
    pub fn new(auto_open: bool) -> Self {
        OpenState {
            open: AtomicBool::new(false),
            auto_open,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn set_open(&self) {
        self.open.store(true, Ordering::Release);
    }

    pub fn set_closed(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub fn ensure_open(&self, open: impl FnOnce() -> Result<()>) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        if self.auto_open {
            open()
        } else {
            Err(Error::Closed)
        }
    }
}

/// A [`ResourceWriter`] which stages bytes in an inner writer and defers the commit action
/// until the stream is finished.
///
/// The commit action runs exactly once on every exit path: explicit [`finish`], an early drop
/// after a write failure, or abandonment of the writer. [`abort`] replaces the commit action
/// with the rollback action.
///
/// [`finish`]: ResourceWriter::finish
/// [`abort`]: ResourceWriter::abort
pub struct DeferredWriter<W: Write + Send> {
    inner: Option<W>,
    commit: Option<Box<dyn FnOnce(W) -> Result<()> + Send>>,
    rollback: Option<Box<dyn FnOnce(W) + Send>>,
}

impl<W: Write + Send> DeferredWriter<W> {
    /// Create a writer which stages bytes in `inner` and runs `commit` once the stream is
    /// finished, or `rollback` if the stream is aborted.
    pub fn new(
        inner: W,
        commit: impl FnOnce(W) -> Result<()> + Send + 'static,
        rollback: impl FnOnce(W) + Send + 'static,
    ) -> Self {
        DeferredWriter {
            inner: Some(inner),
            commit: Some(Box::new(commit)),
            rollback: Some(Box::new(rollback)),
        }
    }
}

impl<W: Write + Send> Debug for DeferredWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredWriter")
            .field("finished", &self.inner.is_none())
            .finish()
    }
}

impl<W: Write + Send> Write for DeferredWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.inner.as_mut() {
            Some(inner) => inner.write(buf),
            None => Err(io::Error::new(
                io::ErrorKind::Other,
                "the writer is already finished",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.as_mut() {
            Some(inner) => inner.flush(),
            None => Ok(()),
        }
    }
}

impl<W: Write + Send> ResourceWriter for DeferredWriter<W> {
    fn finish(mut self: Box<Self>) -> Result<()> {
        self.rollback.take();
        match (self.inner.take(), self.commit.take()) {
            (Some(inner), Some(commit)) => commit(inner),
            _ => Err(Error::Io(io::Error::new(
                io::ErrorKind::Other,
                "the writer is already finished",
            ))),
        }
    }

    fn abort(mut self: Box<Self>) {
        if let (Some(inner), Some(rollback)) = (self.inner.take(), self.rollback.take()) {
            self.commit.take();
            rollback(inner);
        }
    }
}

impl<W: Write + Send> Drop for DeferredWriter<W> {
    fn drop(&mut self) {
        if let (Some(inner), Some(commit)) = (self.inner.take(), self.commit.take()) {
            if let Err(error) = commit(inner) {
                log::warn!("could not commit a dropped resource writer: {}", error);
            }
        }
    }
}
