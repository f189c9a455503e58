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

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use filetime::FileTime;
use relative_path::RelativePath;
use tempfile::NamedTempFile;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::uri::{decode, encode_file_name, encode_segment, ResourceUri, SEPARATOR};

use super::description::{Property, ResourceDescription, StandardProperty};
use super::filter::ResourceFilter;
use super::repository::{
    DeferredWriter, Depth, OpenState, Repository, ResourceWriter, COLLECTION_CONTENT_NAME,
};

/// The name of the directory holding property sidecar files, directly under the backing
/// directory. It is never listed as a child resource.
const PROPERTIES_DIRECTORY: &str = ".cairn-props";

/// The file name extension of property sidecar files.
const PROPERTIES_EXTENSION: &str = ".props";

/// A [`Repository`] which serves resources from a directory in the local file system.
///
/// The repository's public root URI is mapped onto a private backing directory; collections are
/// directories and non-collection resources are regular files. Custom resource properties are
/// persisted in per-resource sidecar files under a hidden directory at the root of the backing
/// directory.
#[derive(Debug)]
pub struct FileRepository {
    id: Uuid,
    root_uri: ResourceUri,
    base: PathBuf,
    state: OpenState,
}

impl FileRepository {
    /// Create a repository serving `base` under the public collection URI `root_uri`.
    ///
    /// The repository opens automatically on first use.
    ///
    /// # Errors
    /// - `Error::InvalidUri`: `root_uri` is not a collection URI.
    pub fn new(root_uri: ResourceUri, base: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(root_uri, base, true)
    }

    /// Create a repository serving `base` under `root_uri`, controlling the auto-open policy.
    ///
    /// With `auto_open` disabled, operations fail with `Error::Closed` until [`open`] is called.
    ///
    /// [`open`]: Repository::open
    pub fn with_options(
        root_uri: ResourceUri,
        base: impl AsRef<Path>,
        auto_open: bool,
    ) -> Result<Self> {
        if !root_uri.is_collection() {
            return Err(Error::InvalidUri(root_uri.as_str().to_owned()));
        }
        Ok(FileRepository {
            id: Uuid::new_v4(),
            root_uri,
            base: base.as_ref().to_owned(),
            state: OpenState::new(auto_open),
        })
    }

    /// Map a public resource URI onto its backing file path.
    ///
    /// URI segments are percent-decoded; names on disk carry the decoded form.
    fn file_path(&self, uri: &ResourceUri) -> Result<PathBuf> {
        let relative = uri
            .relative_to(&self.root_uri)
            .ok_or_else(|| Error::not_found(uri))?;
        let relative = relative.trim_end_matches(SEPARATOR);
        if relative.is_empty() {
            return Ok(self.base.clone());
        }

        let mut decoded = Vec::new();
        for segment in relative.split(SEPARATOR) {
            let name = decode(segment);
            // A decoded name must still be a single plain path component, or it could escape
            // the backing directory.
            if name.is_empty() || name == "." || name == ".." || name.contains(SEPARATOR) {
                return Err(Error::InvalidUri(uri.as_str().to_owned()));
            }
            decoded.push(name);
        }
        Ok(RelativePath::new(&decoded.join("/")).to_path(&self.base))
    }

    /// Return the path of the property sidecar file for the resource at `uri`.
    fn properties_path(&self, uri: &ResourceUri) -> Result<PathBuf> {
        let relative = uri
            .relative_to(&self.root_uri)
            .ok_or_else(|| Error::not_found(uri))?;
        Ok(self
            .base
            .join(PROPERTIES_DIRECTORY)
            .join(encode_file_name(relative) + PROPERTIES_EXTENSION))
    }

    /// Read the custom properties persisted for the resource at `uri`.
    fn load_properties(&self, uri: &ResourceUri) -> Result<Vec<Property>> {
        let path = self.properties_path(uri)?;
        match fs::read(&path) {
            Ok(bytes) => rmp_serde::from_slice(&bytes).map_err(|_| Error::Deserialize),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(error) => Err(error.into()),
        }
    }

    /// Persist the custom properties for the resource at `uri`.
    fn save_properties(&self, uri: &ResourceUri, properties: &[Property]) -> Result<()> {
        let path = self.properties_path(uri)?;
        if properties.is_empty() {
            match fs::remove_file(&path) {
                Ok(()) => return Ok(()),
                Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(error) => return Err(error.into()),
            }
        }
        fs::create_dir_all(path.parent().unwrap())?;
        let bytes = rmp_serde::to_vec(properties).map_err(|_| Error::Serialize)?;
        fs::write(&path, bytes)?;
        Ok(())
    }

    /// Remove the property sidecars of the resource at `uri` and, for collections, of all of
    /// its descendants.
    fn remove_properties_under(&self, uri: &ResourceUri) -> Result<()> {
        let relative = uri
            .relative_to(&self.root_uri)
            .ok_or_else(|| Error::not_found(uri))?;
        let directory = self.base.join(PROPERTIES_DIRECTORY);

        if !uri.is_collection() {
            // Only the exact sidecar; a bare prefix would also match sibling names which
            // merely start with this one.
            let sidecar = directory.join(encode_file_name(relative) + PROPERTIES_EXTENSION);
            return match fs::remove_file(&sidecar) {
                Ok(()) => Ok(()),
                Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(error) => Err(error.into()),
            };
        }

        // A collection's encoded path ends with its escaped trailing separator, so the prefix
        // matches exactly the collection's own sidecar and those of its descendants.
        let prefix = encode_file_name(relative);
        let entries = match fs::read_dir(&directory) {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(error) => return Err(error.into()),
        };
        for entry in entries {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(&prefix) {
                    fs::remove_file(entry.path())?;
                }
            }
        }
        Ok(())
    }

    /// Build the description of the resource at `uri` from file metadata and its sidecar.
    fn describe_path(&self, uri: &ResourceUri, path: &Path) -> Result<ResourceDescription> {
        let metadata = fs::metadata(path).map_err(|error| match error.kind() {
            io::ErrorKind::NotFound => Error::not_found(uri),
            io::ErrorKind::PermissionDenied => Error::Forbidden { uri: uri.clone() },
            _ => error.into(),
        })?;
        if metadata.is_dir() != uri.is_collection() {
            return Err(Error::not_found(uri));
        }

        let mut description = ResourceDescription::new(uri.clone());

        if uri.is_collection() {
            // A collection carries content only through its content surrogate child.
            let content_path = path.join(COLLECTION_CONTENT_NAME);
            if let Ok(content_metadata) = fs::metadata(&content_path) {
                description.set_content_length(content_metadata.len());
                if let Ok(modified) = content_metadata.modified() {
                    description.set_content_modified(modified);
                }
            }
        } else {
            description.set_content_length(metadata.len());
            if let Ok(modified) = metadata.modified() {
                description.set_content_modified(modified);
            }
            if let Ok(created) = metadata.created() {
                description.set_content_created(created);
            }
        }

        for property in self.load_properties(uri)? {
            description.set_property(property);
        }

        Ok(description)
    }

    /// Append the children of the collection at `uri` to `output`.
    fn collect_children(
        &self,
        uri: &ResourceUri,
        filter: Option<&dyn ResourceFilter>,
        depth: Depth,
        output: &mut Vec<ResourceDescription>,
    ) -> Result<()> {
        let directory = self.file_path(uri)?;
        let max_depth = match depth {
            Depth::Limited(limit) => limit as usize,
            Depth::Unlimited => usize::MAX,
        };

        let walk = WalkDir::new(&directory)
            .min_depth(1)
            .max_depth(max_depth)
            .into_iter()
            .filter_entry(|entry| entry.file_name() != PROPERTIES_DIRECTORY);

        for entry in walk {
            let entry = entry.map_err(|error| Error::transport(uri, error))?;
            let relative = match entry.path().strip_prefix(&directory) {
                Ok(relative) => relative,
                Err(_) => continue,
            };
            let mut child = uri.clone();
            for component in relative.components() {
                let name = match component.as_os_str().to_str() {
                    Some(name) => name,
                    None => {
                        log::warn!("skipping file with non-UTF-8 name under {:?}", directory);
                        child = uri.clone();
                        break;
                    }
                };
                child = child.child_collection(&encode_segment(name))?;
            }
            if child == *uri {
                continue;
            }
            if !entry.file_type().is_dir() {
                child = match child.as_non_collection() {
                    Some(child) => child,
                    None => continue,
                };
            }

            if let Some(filter) = filter {
                if !filter.accept_uri(&child) {
                    continue;
                }
            }
            let description = self.describe_path(&child, entry.path())?;
            if let Some(filter) = filter {
                if !filter.accept(&description) {
                    continue;
                }
            }
            output.push(description);
        }

        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        self.state.ensure_open(|| self.open())
    }
}

impl Repository for FileRepository {
    fn instance_id(&self) -> Uuid {
        self.id
    }

    fn root_uri(&self) -> &ResourceUri {
        &self.root_uri
    }

    fn open(&self) -> Result<()> {
        fs::create_dir_all(&self.base)?;
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
        let path = self.file_path(uri)?;
        match fs::metadata(&path) {
            Ok(metadata) => Ok(metadata.is_dir() == uri.is_collection()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(Error::transport(uri, error)),
        }
    }

    fn describe(&self, uri: &ResourceUri) -> Result<ResourceDescription> {
        self.ensure_open()?;
        let path = self.file_path(uri)?;
        self.describe_path(uri, &path)
    }

    fn read(&self, uri: &ResourceUri) -> Result<Box<dyn Read + Send>> {
        self.ensure_open()?;
        let path = self.file_path(uri)?;

        if uri.is_collection() {
            if !self.exists(uri)? {
                return Err(Error::not_found(uri));
            }
            let content_path = path.join(COLLECTION_CONTENT_NAME);
            return match File::open(&content_path) {
                Ok(file) => Ok(Box::new(file)),
                Err(error) if error.kind() == io::ErrorKind::NotFound => {
                    Ok(Box::new(io::empty()))
                }
                Err(error) => Err(Error::transport(uri, error)),
            };
        }

        match File::open(&path) {
            Ok(file) => Ok(Box::new(file)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Err(Error::not_found(uri)),
            Err(error) if error.kind() == io::ErrorKind::PermissionDenied => {
                Err(Error::Forbidden { uri: uri.clone() })
            }
            Err(error) => Err(Error::transport(uri, error)),
        }
    }

    fn write(&self, uri: &ResourceUri) -> Result<Box<dyn ResourceWriter>> {
        self.ensure_open()?;
        let path = if uri.is_collection() {
            if !self.exists(uri)? {
                return Err(Error::not_found(uri));
            }
            self.file_path(uri)?.join(COLLECTION_CONTENT_NAME)
        } else {
            if fs::metadata(self.file_path(uri)?)
                .map(|metadata| metadata.is_dir())
                .unwrap_or(false)
            {
                return Err(Error::conflict(uri));
            }
            self.file_path(uri)?
        };

        let parent = path.parent().unwrap().to_owned();
        if !parent.is_dir() {
            return Err(Error::not_found(&uri.parent().unwrap_or_else(|| uri.clone())));
        }

        // Stage in the target directory so the final rename is atomic, and defer the rename
        // until the stream is finished so a concurrent reader never sees a torn file.
        let staging = NamedTempFile::new_in(&parent)?;
        let final_path = path;
        let writer = DeferredWriter::new(
            staging,
            move |staging: NamedTempFile| {
                staging
                    .persist(&final_path)
                    .map_err(|error| Error::Io(error.error))?;
                Ok(())
            },
            |staging: NamedTempFile| {
                // Dropping the staging file removes it, leaving the previous version intact.
                drop(staging);
            },
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
        let path = self.file_path(uri)?;
        if path.is_dir() {
            return Err(Error::conflict(uri));
        }
        let parent_uri = uri.parent().unwrap_or_else(|| uri.clone());
        let parent = path.parent().unwrap();
        if !parent.is_dir() {
            return Err(Error::not_found(&parent_uri));
        }

        let mut staging = NamedTempFile::new_in(parent)?;
        io::Write::write_all(&mut staging, content)?;
        staging
            .persist(&path)
            .map_err(|error| Error::Io(error.error))?;

        // Merge the given custom properties over any previously persisted ones; an overwrite
        // preserves existing custom properties unless explicitly replaced.
        let mut merged = ResourceDescription::new(uri.clone());
        for property in self.load_properties(uri)? {
            merged.set_property(property);
        }
        for property in description.custom_properties() {
            merged.set_property(property.clone());
        }
        let custom: Vec<Property> = merged.custom_properties().cloned().collect();
        self.save_properties(uri, &custom)?;

        self.describe(uri)
    }

    fn create_collection(&self, uri: &ResourceUri) -> Result<ResourceDescription> {
        self.ensure_open()?;
        if !uri.is_collection() {
            return Err(Error::InvalidUri(uri.as_str().to_owned()));
        }
        let path = self.file_path(uri)?;
        match fs::metadata(&path) {
            Ok(metadata) if metadata.is_dir() => return self.describe(uri),
            Ok(_) => return Err(Error::conflict(uri)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => return Err(Error::transport(uri, error)),
        }
        fs::create_dir(&path).map_err(|error| match error.kind() {
            io::ErrorKind::NotFound => {
                Error::not_found(&uri.parent().unwrap_or_else(|| uri.clone()))
            }
            _ => Error::transport(uri, error),
        })?;
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
        let path = self.file_path(uri)?;
        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return Err(Error::not_found(uri))
            }
            Err(error) => return Err(Error::transport(uri, error)),
        };
        if metadata.is_dir() != uri.is_collection() {
            return Err(Error::not_found(uri));
        }

        if metadata.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
        self.remove_properties_under(uri)?;
        Ok(())
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
        let mut output = Vec::new();
        if depth.is_zero() {
            return Ok(output);
        }
        self.collect_children(uri, filter, depth, &mut output)?;
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

        let mut stored = ResourceDescription::new(uri.clone());
        for property in self.load_properties(uri)? {
            stored.set_property(property);
        }
        for property in properties {
            match StandardProperty::from_uri(&property.uri) {
                // Setting the modified timestamp is translated into a file timestamp write.
                Some(StandardProperty::ContentModified) => {
                    let mut description = ResourceDescription::new(uri.clone());
                    description.set_property(property.clone());
                    if let Some(modified) = description.content_modified() {
                        set_file_modified(&self.file_path(uri)?, modified)?;
                    }
                }
                Some(_) => {}
                None => stored.set_property(property.clone()),
            }
        }
        let custom: Vec<Property> = stored.custom_properties().cloned().collect();
        self.save_properties(uri, &custom)?;
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
        let mut stored = ResourceDescription::new(uri.clone());
        for property in self.load_properties(uri)? {
            stored.set_property(property);
        }
        for property_uri in property_uris {
            stored.remove(property_uri);
        }
        let custom: Vec<Property> = stored.custom_properties().cloned().collect();
        self.save_properties(uri, &custom)?;
        self.describe(uri)
    }
}

/// Set the modified timestamp of the file at `path`.
pub(crate) fn set_file_modified(path: &Path, modified: SystemTime) -> Result<()> {
    filetime::set_file_mtime(path, FileTime::from_system_time(modified))?;
    Ok(())
}
