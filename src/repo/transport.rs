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

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::{Cursor, Read};
use std::result;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use static_assertions::assert_obj_safe;
use thiserror::Error as DeriveError;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::uri::{ResourceUri, SEPARATOR};

use super::description::{Property, ResourceDescription, StandardProperty, CONTENT_MODIFIED};
use super::filter::ResourceFilter;
use super::repository::{
    DeferredWriter, Depth, OpenState, Repository, ResourceWriter, COLLECTION_CONTENT_NAME,
};

/// An error that occurred in a transport.
///
/// Access denial is the only backend condition a repository must distinguish; everything else is
/// opaque and surfaces as `Error::Transport` with the offending URI attached.
#[derive(Debug, DeriveError)]
pub enum TransportError {
    /// The backend denied access to the resource.
    #[error("The transport denied access to the resource.")]
    Forbidden,

    /// Any other backend failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The result type for transport operations.
pub type TransportResult<T> = result::Result<T, TransportError>;

/// Translate a transport error into the repository taxonomy, attaching the offending URI.
fn translate_error(uri: &ResourceUri, error: TransportError) -> Error {
    match error {
        TransportError::Forbidden => Error::Forbidden { uri: uri.clone() },
        TransportError::Other(source) => Error::Transport {
            uri: uri.clone(),
            source,
        },
    }
}

/// The metadata of a resource as reported by a transport.
///
/// Paths are relative to the transport's root; a trailing separator marks a collection, matching
/// the public URI convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEntry {
    /// The path of the resource, relative to the transport root.
    pub path: String,

    /// The length of the resource content in bytes.
    pub content_length: u64,

    /// The time the resource content was last modified.
    pub modified: Option<SystemTime>,

    /// The time the resource content was created.
    pub created: Option<SystemTime>,

    /// The stored properties of the resource.
    pub properties: Vec<Property>,
}

impl TransportEntry {
    /// Return whether this entry is a collection.
    pub fn is_collection(&self) -> bool {
        self.path.ends_with(SEPARATOR) || self.path.is_empty()
    }
}

/// An opaque resource transport.
///
/// This is the integration point for concrete wire protocols: a WebDAV, Subversion-over-WebDAV,
/// or S3 client implements this trait and [`TransportRepository`] builds the full repository
/// surface on top of it. The trait is deliberately small: existence, content get/put, delete,
/// depth-bounded listing (the PROPFIND equivalent), and a property patch (the PROPPATCH
/// equivalent).
///
/// Paths are relative to the transport root; the empty path is the root collection, and a
/// trailing separator marks a collection. Implementations are internally synchronized.
pub trait Transport: Debug + Send + Sync {
    /// Establish and validate connectivity.
    fn connect(&self) -> TransportResult<()> {
        Ok(())
    }

    /// Return whether a resource exists at `path`.
    fn exists(&self, path: &str) -> TransportResult<bool>;

    /// Return the metadata of the resource at `path`, or `None` if there is none.
    fn metadata(&self, path: &str) -> TransportResult<Option<TransportEntry>>;

    /// Return the content of the resource at `path`, or `None` if there is none.
    fn get(&self, path: &str) -> TransportResult<Option<Vec<u8>>>;

    /// Create or overwrite the non-collection resource at `path` with `data`.
    ///
    /// Stored properties of an existing resource are preserved.
    fn put(&self, path: &str, data: &[u8]) -> TransportResult<()>;

    /// Create the collection at `path`.
    fn make_collection(&self, path: &str) -> TransportResult<()>;

    /// Delete the resource at `path` and any descendants.
    ///
    /// Deleting a missing resource does nothing.
    fn delete(&self, path: &str) -> TransportResult<()>;

    /// Return the descendants of the collection at `path` up to `depth` levels deep.
    ///
    /// The listed collection itself is not included.
    fn list(&self, path: &str, depth: Depth) -> TransportResult<Vec<TransportEntry>>;

    /// Set and remove stored properties of the resource at `path`.
    fn patch_properties(
        &self,
        path: &str,
        set: &[Property],
        remove: &[&str],
    ) -> TransportResult<()>;
}

assert_obj_safe!(Transport);

/// A stored resource in a [`MemoryTransport`].
#[derive(Debug, Clone)]
struct StoredResource {
    /// The resource content, or `None` for a collection.
    content: Option<Vec<u8>>,
    modified: SystemTime,
    created: SystemTime,
    properties: Vec<Property>,
}

/// A [`Transport`] which stores resources in memory.
///
/// Unlike other transports, data in a `MemoryTransport` is not stored persistently and is only
/// accessible to the current process. This transport is useful for testing.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    resources: Mutex<BTreeMap<String, StoredResource>>,
}

impl MemoryTransport {
    /// Create a new empty `MemoryTransport`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the modified timestamp of the resource at `path`.
    ///
    /// This simulates an out-of-band change to the backing store, which is useful for testing
    /// staleness behavior.
    pub fn set_modified(&self, path: &str, modified: SystemTime) -> bool {
        let mut resources = self.resources.lock().unwrap();
        match resources.get_mut(path) {
            Some(resource) => {
                resource.modified = modified;
                true
            }
            None => false,
        }
    }

    fn entry_for(path: &str, resource: &StoredResource) -> TransportEntry {
        TransportEntry {
            path: path.to_owned(),
            content_length: resource
                .content
                .as_ref()
                .map(|content| content.len() as u64)
                .unwrap_or(0),
            modified: Some(resource.modified),
            created: Some(resource.created),
            properties: resource.properties.clone(),
        }
    }

    fn root_entry() -> TransportEntry {
        TransportEntry {
            path: String::new(),
            content_length: 0,
            modified: None,
            created: None,
            properties: Vec::new(),
        }
    }
}

impl Transport for MemoryTransport {
    fn exists(&self, path: &str) -> TransportResult<bool> {
        if path.is_empty() {
            return Ok(true);
        }
        Ok(self.resources.lock().unwrap().contains_key(path))
    }

    fn metadata(&self, path: &str) -> TransportResult<Option<TransportEntry>> {
        if path.is_empty() {
            return Ok(Some(Self::root_entry()));
        }
        Ok(self
            .resources
            .lock()
            .unwrap()
            .get(path)
            .map(|resource| Self::entry_for(path, resource)))
    }

    fn get(&self, path: &str) -> TransportResult<Option<Vec<u8>>> {
        Ok(self
            .resources
            .lock()
            .unwrap()
            .get(path)
            .and_then(|resource| resource.content.clone()))
    }

    fn put(&self, path: &str, data: &[u8]) -> TransportResult<()> {
        let now = SystemTime::now();
        let mut resources = self.resources.lock().unwrap();
        match resources.get_mut(path) {
            Some(resource) => {
                resource.content = Some(data.to_owned());
                resource.modified = now;
            }
            None => {
                resources.insert(
                    path.to_owned(),
                    StoredResource {
                        content: Some(data.to_owned()),
                        modified: now,
                        created: now,
                        properties: Vec::new(),
                    },
                );
            }
        }
        Ok(())
    }

    fn make_collection(&self, path: &str) -> TransportResult<()> {
        let now = SystemTime::now();
        let mut resources = self.resources.lock().unwrap();
        resources.entry(path.to_owned()).or_insert(StoredResource {
            content: None,
            modified: now,
            created: now,
            properties: Vec::new(),
        });
        Ok(())
    }

    fn delete(&self, path: &str) -> TransportResult<()> {
        let mut resources = self.resources.lock().unwrap();
        resources.remove(path);
        if path.ends_with(SEPARATOR) {
            resources.retain(|key, _| !key.starts_with(path));
        }
        Ok(())
    }

    fn list(&self, path: &str, depth: Depth) -> TransportResult<Vec<TransportEntry>> {
        let resources = self.resources.lock().unwrap();
        let mut entries = Vec::new();
        for (key, resource) in resources.range(path.to_owned()..) {
            if !key.starts_with(path) {
                break;
            }
            let relative = &key[path.len()..];
            if relative.is_empty() {
                continue;
            }
            let separators = relative.matches(SEPARATOR).count() as u32;
            let levels = if relative.ends_with(SEPARATOR) {
                separators
            } else {
                separators + 1
            };
            if depth.includes(levels) {
                entries.push(Self::entry_for(key, resource));
            }
        }
        Ok(entries)
    }

    fn patch_properties(
        &self,
        path: &str,
        set: &[Property],
        remove: &[&str],
    ) -> TransportResult<()> {
        let mut resources = self.resources.lock().unwrap();
        let resource = resources
            .get_mut(path)
            .ok_or_else(|| anyhow::anyhow!("no resource at `{}`", path))?;

        for property in set {
            // A write of the modified timestamp property is applied to the stored timestamp
            // rather than the property list, like a file timestamp write.
            if property.uri == CONTENT_MODIFIED {
                let mut scratch =
                    ResourceDescription::new(ResourceUri::parse("/").expect("root URI"));
                scratch.set_property(property.clone());
                if let Some(modified) = scratch.content_modified() {
                    resource.modified = modified;
                }
                continue;
            }
            match resource
                .properties
                .iter_mut()
                .find(|existing| existing.uri == property.uri)
            {
                Some(existing) => *existing = property.clone(),
                None => resource.properties.push(property.clone()),
            }
        }
        resource
            .properties
            .retain(|property| !remove.contains(&property.uri.as_str()));
        Ok(())
    }
}

/// A [`Repository`] which serves resources through an opaque [`Transport`].
///
/// The repository translates public resource URIs into transport-relative paths and translates
/// transport errors into the repository error taxonomy. All protocol semantics live behind the
/// transport.
#[derive(Debug)]
pub struct TransportRepository<T: Transport> {
    id: Uuid,
    root_uri: ResourceUri,
    // Shared with in-flight content writers, which send their bytes on finish.
    transport: Arc<T>,
    state: OpenState,
}

impl<T: Transport + 'static> TransportRepository<T> {
    /// Create a repository serving `transport` under the public collection URI `root_uri`.
    ///
    /// The repository opens automatically on first use.
    ///
    /// # Errors
    /// - `Error::InvalidUri`: `root_uri` is not a collection URI.
    pub fn new(root_uri: ResourceUri, transport: T) -> Result<Self> {
        Self::with_options(root_uri, transport, true)
    }

    /// Create a repository serving `transport` under `root_uri`, controlling the auto-open
    /// policy.
    pub fn with_options(root_uri: ResourceUri, transport: T, auto_open: bool) -> Result<Self> {
        if !root_uri.is_collection() {
            return Err(Error::InvalidUri(root_uri.as_str().to_owned()));
        }
        Ok(TransportRepository {
            id: Uuid::new_v4(),
            root_uri,
            transport: Arc::new(transport),
            state: OpenState::new(auto_open),
        })
    }

    /// Return a reference to the underlying transport.
    pub fn transport(&self) -> &T {
        self.transport.as_ref()
    }

    /// Map a public resource URI onto its transport-relative path.
    fn path(&self, uri: &ResourceUri) -> Result<String> {
        uri.relative_to(&self.root_uri)
            .map(str::to_owned)
            .ok_or_else(|| Error::not_found(uri))
    }

    /// Translate a transport error into the repository taxonomy.
    fn translate(&self, uri: &ResourceUri, error: TransportError) -> Error {
        translate_error(uri, error)
    }

    /// Build the public URI of a transport entry.
    fn entry_uri(&self, entry: &TransportEntry) -> Result<ResourceUri> {
        ResourceUri::parse(format!("{}{}", self.root_uri, entry.path))
    }

    /// Build the description of the resource at `uri` from a transport entry.
    fn describe_entry(&self, uri: &ResourceUri, entry: &TransportEntry) -> Result<ResourceDescription> {
        let mut description = ResourceDescription::new(uri.clone());

        if entry.is_collection() {
            // A collection carries content only through its content surrogate child.
            let content_path = format!("{}{}", entry.path, COLLECTION_CONTENT_NAME);
            if let Some(content) = self
                .transport
                .metadata(&content_path)
                .map_err(|error| self.translate(uri, error))?
            {
                description.set_content_length(content.content_length);
                if let Some(modified) = content.modified {
                    description.set_content_modified(modified);
                }
            }
        } else {
            description.set_content_length(entry.content_length);
            if let Some(modified) = entry.modified {
                description.set_content_modified(modified);
            }
            if let Some(created) = entry.created {
                description.set_content_created(created);
            }
        }

        for property in &entry.properties {
            description.set_property(property.clone());
        }

        Ok(description)
    }

    fn ensure_open(&self) -> Result<()> {
        self.state.ensure_open(|| self.open())
    }
}

impl<T: Transport + 'static> Repository for TransportRepository<T> {
    fn instance_id(&self) -> Uuid {
        self.id
    }

    fn root_uri(&self) -> &ResourceUri {
        &self.root_uri
    }

    fn open(&self) -> Result<()> {
        self.transport
            .connect()
            .map_err(|error| self.translate(&self.root_uri, error))?;
        self.state.set_open();
        Ok(())
    }

    fn close(&self) {
        self.state.set_closed();
    }

    fn is_open(&self) -> bool {
        self.state.is_open()
    }

    fn exists(&self, uri: &ResourceUri) -> Result<bool> {
        self.ensure_open()?;
        let path = self.path(uri)?;
        self.transport
            .exists(&path)
            .map_err(|error| self.translate(uri, error))
    }

    fn describe(&self, uri: &ResourceUri) -> Result<ResourceDescription> {
        self.ensure_open()?;
        let path = self.path(uri)?;
        let entry = self
            .transport
            .metadata(&path)
            .map_err(|error| self.translate(uri, error))?
            .ok_or_else(|| Error::not_found(uri))?;
        self.describe_entry(uri, &entry)
    }

    fn read(&self, uri: &ResourceUri) -> Result<Box<dyn Read + Send>> {
        self.ensure_open()?;
        let path = self.path(uri)?;

        if uri.is_collection() {
            if !self.exists(uri)? {
                return Err(Error::not_found(uri));
            }
            let content_path = format!("{}{}", path, COLLECTION_CONTENT_NAME);
            let content = self
                .transport
                .get(&content_path)
                .map_err(|error| self.translate(uri, error))?
                .unwrap_or_default();
            return Ok(Box::new(Cursor::new(content)));
        }

        let content = self
            .transport
            .get(&path)
            .map_err(|error| self.translate(uri, error))?
            .ok_or_else(|| Error::not_found(uri))?;
        Ok(Box::new(Cursor::new(content)))
    }

    fn write(&self, uri: &ResourceUri) -> Result<Box<dyn ResourceWriter>> {
        self.ensure_open()?;
        let path = if uri.is_collection() {
            if !self.exists(uri)? {
                return Err(Error::not_found(uri));
            }
            format!("{}{}", self.path(uri)?, COLLECTION_CONTENT_NAME)
        } else {
            if let Some(parent) = uri.parent() {
                if (parent.is_descendant_of(&self.root_uri) || parent == self.root_uri)
                    && !self.exists(&parent)?
                {
                    return Err(Error::not_found(&parent));
                }
            }
            self.path(uri)?
        };

        // Bytes are buffered locally and sent in a single put once the stream is finished, so
        // the backend's description update happens strictly after the final content is known.
        let transport = Arc::clone(&self.transport);
        let target = uri.clone();
        let writer = DeferredWriter::new(
            Vec::new(),
            move |buffer: Vec<u8>| {
                transport
                    .put(&path, &buffer)
                    .map_err(|error| translate_error(&target, error))
            },
            |_buffer: Vec<u8>| {},
        );
        Ok(Box::new(writer))
    }

    fn create(
        &self,
        uri: &ResourceUri,
        description: &ResourceDescription,
        content: &[u8],
    ) -> Result<ResourceDescription> {
        self.ensure_open()?;
        if uri.is_collection() {
            return Err(Error::InvalidUri(uri.as_str().to_owned()));
        }
        if self.exists(&uri.as_collection())? {
            return Err(Error::conflict(uri));
        }
        if let Some(parent) = uri.parent() {
            if parent.is_descendant_of(&self.root_uri) || parent == self.root_uri {
                if !self.exists(&parent)? {
                    return Err(Error::not_found(&parent));
                }
            }
        }

        let path = self.path(uri)?;
        self.transport
            .put(&path, content)
            .map_err(|error| self.translate(uri, error))?;

        let custom: Vec<Property> = description.custom_properties().cloned().collect();
        if !custom.is_empty() {
            self.transport
                .patch_properties(&path, &custom, &[])
                .map_err(|error| self.translate(uri, error))?;
        }

        self.describe(uri)
    }

    fn create_collection(&self, uri: &ResourceUri) -> Result<ResourceDescription> {
        self.ensure_open()?;
        if !uri.is_collection() {
            return Err(Error::InvalidUri(uri.as_str().to_owned()));
        }
        if let Some(non_collection) = uri.as_non_collection() {
            if non_collection != *uri && self.exists(&non_collection)? {
                return Err(Error::conflict(uri));
            }
        }
        if let Some(parent) = uri.parent() {
            if (parent.is_descendant_of(&self.root_uri) || parent == self.root_uri)
                && !self.exists(&parent)?
            {
                return Err(Error::not_found(&parent));
            }
        }

        let path = self.path(uri)?;
        self.transport
            .make_collection(&path)
            .map_err(|error| self.translate(uri, error))?;
        self.describe(uri)
    }

    fn delete(&self, uri: &ResourceUri) -> Result<()> {
        self.ensure_open()?;
        if uri == &self.root_uri {
            return Err(Error::Configuration(format!(
                "the repository root `{}` cannot be deleted",
                uri
            )));
        }
        if !self.exists(uri)? {
            return Err(Error::not_found(uri));
        }
        let path = self.path(uri)?;
        self.transport
            .delete(&path)
            .map_err(|error| self.translate(uri, error))
    }

    fn list_children(
        &self,
        uri: &ResourceUri,
        filter: Option<&dyn ResourceFilter>,
        depth: Depth,
    ) -> Result<Vec<ResourceDescription>> {
        self.ensure_open()?;
        if !uri.is_collection() {
            return Err(Error::InvalidUri(uri.as_str().to_owned()));
        }
        if !self.exists(uri)? {
            return Err(Error::not_found(uri));
        }
        if depth.is_zero() {
            return Ok(Vec::new());
        }

        let path = self.path(uri)?;
        let entries = self
            .transport
            .list(&path, depth)
            .map_err(|error| self.translate(uri, error))?;

        let mut output = Vec::new();
        for entry in entries {
            let child = self.entry_uri(&entry)?;
            if let Some(filter) = filter {
                if !filter.accept_uri(&child) {
                    continue;
                }
            }
            let description = self.describe_entry(&child, &entry)?;
            if let Some(filter) = filter {
                if !filter.accept(&description) {
                    continue;
                }
            }
            output.push(description);
        }
        Ok(output)
    }

    fn set_properties(
        &self,
        uri: &ResourceUri,
        properties: &[Property],
    ) -> Result<ResourceDescription> {
        self.ensure_open()?;
        if !self.exists(uri)? {
            return Err(Error::not_found(uri));
        }
        let path = self.path(uri)?;
        let applicable: Vec<Property> = properties
            .iter()
            .filter(|property| match StandardProperty::from_uri(&property.uri) {
                None | Some(StandardProperty::ContentModified) => true,
                Some(_) => false,
            })
            .cloned()
            .collect();
        self.transport
            .patch_properties(&path, &applicable, &[])
            .map_err(|error| self.translate(uri, error))?;
        self.describe(uri)
    }

    fn remove_properties(
        &self,
        uri: &ResourceUri,
        property_uris: &[&str],
    ) -> Result<ResourceDescription> {
        self.ensure_open()?;
        if !self.exists(uri)? {
            return Err(Error::not_found(uri));
        }
        let path = self.path(uri)?;
        self.transport
            .patch_properties(&path, &[], property_uris)
            .map_err(|error| self.translate(uri, error))?;
        self.describe(uri)
    }
}
