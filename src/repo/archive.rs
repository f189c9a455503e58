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

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::warn;
use uuid::Uuid;
use zip::ZipArchive;

use crate::cache::{CacheData, ResourceCache};
use crate::error::{Error, Result};
use crate::uri::{decode, encode_segment, ResourceUri};

use super::description::{Property, ResourceDescription};
use super::filter::ResourceFilter;
use super::repository::{Depth, OpenState, Repository, ResourceWriter, COLLECTION_CONTENT_NAME};

/// The configuration of a [`ZipRepository`].
#[derive(Debug, Clone)]
pub struct ZipConfig {
    /// The root URI of the repository's public address space. Must be a collection URI.
    pub root_uri: ResourceUri,

    /// The URI of the archive resource in the source repository.
    pub source_uri: ResourceUri,

    /// The cache which materializes the archive into a local file.
    pub cache: Arc<ResourceCache>,

    /// The repository holding the archive resource.
    ///
    /// When this is `None`, the repository the archive is mounted under is used instead.
    pub source_repository: Option<Arc<dyn Repository>>,

    /// Whether the repository opens automatically on first use.
    pub auto_open: bool,
}

#[derive(Debug, Clone)]
struct EntryInfo {
    /// The entry's index in the archive, or `None` for a directory implied by the paths of
    /// other entries.
    index: Option<usize>,
    is_dir: bool,
    size: u64,
    modified: Option<SystemTime>,
}

impl EntryInfo {
    fn implied_dir() -> Self {
        EntryInfo {
            index: None,
            is_dir: true,
            size: 0,
            modified: None,
        }
    }
}

/// The entry index of the currently loaded archive file.
#[derive(Debug)]
struct OpenArchive {
    generation: Uuid,
    file: PathBuf,
    modified: Option<SystemTime>,
    entries: BTreeMap<String, EntryInfo>,
}

/// A read-only repository exposing the entries of a zip archive as resources.
///
/// The archive itself is a resource in another repository; it is materialized into a local file
/// through a [`ResourceCache`] and reopened whenever the cache reports a new generation, so
/// changes to the archive resource are picked up between operations.
///
/// Content and structure are immutable. Write operations fail with `Error::Unsupported`, except
/// property operations, which are kept in a per-instance overlay that lives only as long as the
/// repository value.
#[derive(Debug)]
pub struct ZipRepository {
    id: Uuid,
    config: ZipConfig,
    parent: RwLock<Option<Arc<dyn Repository>>>,
    state: OpenState,
    archive: Mutex<Option<OpenArchive>>,
    overlay: RwLock<HashMap<ResourceUri, Vec<Property>>>,
}

impl ZipRepository {
    /// Create a repository for the archive described by `config`.
    ///
    /// # Errors
    /// - `Error::Configuration`: The root URI is not a collection or the source URI is one.
    pub fn new(config: ZipConfig) -> Result<Self> {
        if !config.root_uri.is_collection() {
            return Err(Error::Configuration(format!(
                "the archive root `{}` must be a collection URI",
                config.root_uri
            )));
        }
        if config.source_uri.is_collection() {
            return Err(Error::Configuration(format!(
                "the archive source `{}` must not be a collection URI",
                config.source_uri
            )));
        }
        let auto_open = config.auto_open;
        Ok(ZipRepository {
            id: Uuid::new_v4(),
            config,
            parent: RwLock::new(None),
            state: OpenState::new(auto_open),
            archive: Mutex::new(None),
            overlay: RwLock::new(HashMap::new()),
        })
    }

    fn source(&self) -> Result<Arc<dyn Repository>> {
        if let Some(source) = &self.config.source_repository {
            return Ok(Arc::clone(source));
        }
        match &*self.parent.read().unwrap() {
            Some(parent) => Ok(Arc::clone(parent)),
            None => Err(Error::Configuration(format!(
                "the archive repository at `{}` has no source repository",
                self.config.root_uri
            ))),
        }
    }

    /// Run `operation` against the current entry index, reloading the archive first if the
    /// cached file was refreshed.
    fn with_archive<R>(&self, operation: impl FnOnce(&OpenArchive) -> Result<R>) -> Result<R> {
        let source = self.source()?;
        let data = self
            .config
            .cache
            .fetch(source.as_ref(), &self.config.source_uri, None)?;

        let mut state = self.archive.lock().unwrap();
        let open = match state.take() {
            Some(open) if open.generation == data.generation => open,
            _ => self.load(&data)?,
        };
        let result = operation(&open);
        *state = Some(open);
        result
    }

    /// Build the entry index from the cached archive file.
    fn load(&self, data: &CacheData) -> Result<OpenArchive> {
        let file = File::open(&data.file)?;
        let mut archive = ZipArchive::new(file)
            .map_err(|error| Error::transport(&self.config.source_uri, error))?;

        let mut entries = BTreeMap::new();
        for index in 0..archive.len() {
            let entry = archive
                .by_index(index)
                .map_err(|error| Error::transport(&self.config.source_uri, error))?;
            let path = entry.name().trim_matches('/').to_owned();
            if path.is_empty() {
                continue;
            }
            if self.entry_uri(&path, entry.is_dir()).is_err() {
                warn!(
                    "Skipping archive entry `{}` whose name is not a valid URI path.",
                    entry.name()
                );
                continue;
            }
            entries.insert(
                path.clone(),
                EntryInfo {
                    index: Some(index),
                    is_dir: entry.is_dir(),
                    size: entry.size(),
                    modified: entry.last_modified().and_then(datetime_to_system_time),
                },
            );

            // Archives are not required to carry entries for intermediate directories.
            let mut ancestor = path.as_str();
            while let Some(separator) = ancestor.rfind('/') {
                ancestor = &ancestor[..separator];
                entries
                    .entry(ancestor.to_owned())
                    .or_insert_with(EntryInfo::implied_dir);
            }
        }

        Ok(OpenArchive {
            generation: data.generation,
            file: data.file.clone(),
            modified: data.modified,
            entries,
        })
    }

    /// Return the archive entry path for `uri`, without checking that the entry exists.
    ///
    /// The repository root maps to the empty path.
    fn entry_path(&self, uri: &ResourceUri) -> Result<String> {
        let relative = uri
            .relative_to(&self.config.root_uri)
            .ok_or_else(|| Error::not_found(uri))?;
        // Entries are indexed by their raw archive names; the URI form carries the escapes.
        Ok(relative
            .trim_end_matches('/')
            .split('/')
            .map(decode)
            .collect::<Vec<_>>()
            .join("/"))
    }

    /// Return the public URI for the archive entry at `path`.
    fn entry_uri(&self, path: &str, is_dir: bool) -> Result<ResourceUri> {
        let root = self.config.root_uri.as_str();
        let encoded = path
            .split('/')
            .map(encode_segment)
            .collect::<Vec<_>>()
            .join("/");
        if is_dir {
            ResourceUri::parse(format!("{}{}/", root, encoded))
        } else {
            ResourceUri::parse(format!("{}{}", root, encoded))
        }
    }

    /// Look up the entry for `uri`, treating a collection/non-collection mismatch as missing.
    fn lookup<'a>(
        &self,
        open: &'a OpenArchive,
        uri: &ResourceUri,
    ) -> Result<(String, &'a EntryInfo)> {
        let path = self.entry_path(uri)?;
        if path.is_empty() {
            return Err(Error::not_found(uri));
        }
        match open.entries.get(&path) {
            Some(info) if info.is_dir == uri.is_collection() => Ok((path, info)),
            _ => Err(Error::not_found(uri)),
        }
    }

    fn describe_entry(
        &self,
        open: &OpenArchive,
        uri: &ResourceUri,
        path: &str,
        info: &EntryInfo,
    ) -> ResourceDescription {
        let mut description = ResourceDescription::new(uri.clone());

        if info.is_dir {
            // A directory's literal content is its content surrogate child, if it has one.
            let surrogate = format!("{}/{}", path, COLLECTION_CONTENT_NAME);
            let surrogate = if path.is_empty() {
                COLLECTION_CONTENT_NAME.to_owned()
            } else {
                surrogate
            };
            if let Some(content) = open.entries.get(&surrogate) {
                description.set_content_length(content.size);
                if let Some(modified) = content.modified {
                    description.set_content_modified(modified);
                }
            }
        } else {
            description.set_content_length(info.size);
            if let Some(modified) = info.modified.or(open.modified) {
                description.set_content_modified(modified);
            }
        }

        if let Some(properties) = self.overlay.read().unwrap().get(uri) {
            for property in properties {
                description.set_property(property.clone());
            }
        }

        description
    }

    fn describe_root(&self, open: &OpenArchive) -> ResourceDescription {
        let root = self.config.root_uri.clone();
        let mut description = ResourceDescription::new(root.clone());
        if let Some(content) = open.entries.get(COLLECTION_CONTENT_NAME) {
            description.set_content_length(content.size);
        }
        if let Some(modified) = open.modified {
            description.set_content_modified(modified);
        }
        if let Some(properties) = self.overlay.read().unwrap().get(&root) {
            for property in properties {
                description.set_property(property.clone());
            }
        }
        description
    }

    /// Read the full content of the entry at `index` out of the archive file.
    fn read_entry(&self, open: &OpenArchive, uri: &ResourceUri, index: usize) -> Result<Vec<u8>> {
        let file = File::open(&open.file)?;
        let mut archive =
            ZipArchive::new(file).map_err(|error| Error::transport(uri, error))?;
        let mut entry = archive
            .by_index(index)
            .map_err(|error| Error::transport(uri, error))?;
        let mut content = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut content)?;
        Ok(content)
    }

    fn ensure_open(&self) -> Result<()> {
        self.state.ensure_open(|| Repository::open(self))
    }

    fn unsupported(operation: &'static str) -> Error {
        Error::Unsupported { operation }
    }
}

impl Repository for ZipRepository {
    fn instance_id(&self) -> Uuid {
        self.id
    }

    fn root_uri(&self) -> &ResourceUri {
        &self.config.root_uri
    }

    fn open(&self) -> Result<()> {
        self.with_archive(|_| Ok(()))?;
        self.state.set_open();
        Ok(())
    }

    fn close(&self) {
        self.state.set_closed();
        *self.archive.lock().unwrap() = None;
    }

    fn is_open(&self) -> bool {
        self.state.is_open()
    }

    fn attach_parent(&self, parent: Arc<dyn Repository>) {
        *self.parent.write().unwrap() = Some(parent);
    }

    fn exists(&self, uri: &ResourceUri) -> Result<bool> {
        self.ensure_open()?;
        self.with_archive(|open| {
            if uri == &self.config.root_uri {
                return Ok(true);
            }
            match self.lookup(open, uri) {
                Ok(_) => Ok(true),
                Err(Error::NotFound { .. }) => Ok(false),
                Err(error) => Err(error),
            }
        })
    }

    fn describe(&self, uri: &ResourceUri) -> Result<ResourceDescription> {
        self.ensure_open()?;
        self.with_archive(|open| {
            if uri == &self.config.root_uri {
                return Ok(self.describe_root(open));
            }
            let (path, info) = self.lookup(open, uri)?;
            Ok(self.describe_entry(open, uri, &path, info))
        })
    }

    fn read(&self, uri: &ResourceUri) -> Result<Box<dyn Read + Send>> {
        self.ensure_open()?;
        self.with_archive(|open| {
            let index = if uri.is_collection() {
                // Collections stream their content surrogate child if the archive has one.
                let path = self.entry_path(uri)?;
                let surrogate = if path.is_empty() {
                    COLLECTION_CONTENT_NAME.to_owned()
                } else {
                    format!("{}/{}", path, COLLECTION_CONTENT_NAME)
                };
                if uri != &self.config.root_uri {
                    match open.entries.get(&path) {
                        Some(info) if info.is_dir => {}
                        _ => return Err(Error::not_found(uri)),
                    }
                }
                open.entries.get(&surrogate).and_then(|info| info.index)
            } else {
                let (_, info) = self.lookup(open, uri)?;
                info.index
            };

            let content = match index {
                Some(index) => self.read_entry(open, uri, index)?,
                None => Vec::new(),
            };
            Ok(Box::new(Cursor::new(content)) as Box<dyn Read + Send>)
        })
    }

    fn write(&self, _uri: &ResourceUri) -> Result<Box<dyn ResourceWriter>> {
        Err(Self::unsupported("write"))
    }

    fn create(
        &self,
        _uri: &ResourceUri,
        _description: &ResourceDescription,
        _content: &[u8],
    ) -> Result<ResourceDescription> {
        Err(Self::unsupported("create"))
    }

    fn create_collection(&self, _uri: &ResourceUri) -> Result<ResourceDescription> {
        Err(Self::unsupported("create_collection"))
    }

    fn delete(&self, _uri: &ResourceUri) -> Result<()> {
        Err(Self::unsupported("delete"))
    }

    fn list_children(
        &self,
        uri: &ResourceUri,
        filter: Option<&dyn ResourceFilter>,
        depth: Depth,
    ) -> Result<Vec<ResourceDescription>> {
        self.ensure_open()?;
        if depth.is_zero() {
            return Ok(Vec::new());
        }
        self.with_archive(|open| {
            let parent = self.entry_path(uri)?;
            if !uri.is_collection() {
                return Err(Error::not_found(uri));
            }
            if !parent.is_empty() && !open.entries.contains_key(&parent) {
                return Err(Error::not_found(uri));
            }

            let prefix = if parent.is_empty() {
                String::new()
            } else {
                format!("{}/", parent)
            };

            let mut children = Vec::new();
            for (path, info) in &open.entries {
                let relative = match path.strip_prefix(&prefix) {
                    Some(relative) if !relative.is_empty() => relative,
                    _ => continue,
                };
                let levels = relative.matches('/').count() as u32 + 1;
                if !depth.includes(levels) {
                    continue;
                }
                let child_uri = match self.entry_uri(path, info.is_dir) {
                    Ok(child_uri) => child_uri,
                    Err(_) => continue,
                };
                if let Some(filter) = filter {
                    if !filter.accept_uri(&child_uri) {
                        continue;
                    }
                }
                let description = self.describe_entry(open, &child_uri, path, info);
                if let Some(filter) = filter {
                    if !filter.accept(&description) {
                        continue;
                    }
                }
                children.push(description);
            }
            Ok(children)
        })
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
        {
            let mut overlay = self.overlay.write().unwrap();
            let stored = overlay.entry(uri.clone()).or_default();
            for property in properties {
                stored.retain(|existing| existing.uri != property.uri);
                if !property.values.is_empty() {
                    stored.push(property.clone());
                }
            }
        }
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
        {
            let mut overlay = self.overlay.write().unwrap();
            if let Some(stored) = overlay.get_mut(uri) {
                stored.retain(|existing| {
                    !property_uris.iter().any(|removed| *removed == existing.uri)
                });
            }
        }
        self.describe(uri)
    }

    fn copy(&self, _source: &ResourceUri, _dest: &ResourceUri) -> Result<()> {
        Err(Self::unsupported("copy"))
    }

    fn move_resource(&self, _source: &ResourceUri, _dest: &ResourceUri) -> Result<()> {
        Err(Self::unsupported("move"))
    }
}

/// Convert an archive timestamp to a `SystemTime`.
///
/// Archive timestamps carry no zone, so they are interpreted as UTC.
fn datetime_to_system_time(datetime: zip::DateTime) -> Option<SystemTime> {
    let days = days_from_civil(
        i64::from(datetime.year()),
        u32::from(datetime.month()),
        u32::from(datetime.day()),
    );
    let seconds_of_day = i64::from(datetime.hour()) * 3600
        + i64::from(datetime.minute()) * 60
        + i64::from(datetime.second());
    let seconds = days * 86_400 + seconds_of_day;
    if seconds >= 0 {
        UNIX_EPOCH.checked_add(Duration::from_secs(seconds as u64))
    } else {
        UNIX_EPOCH.checked_sub(Duration::from_secs(seconds.unsigned_abs()))
    }
}

/// Return the number of days between the civil date and 1970-01-01.
fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let year = if month <= 2 { year - 1 } else { year };
    let era = if year >= 0 { year } else { year - 399 } / 400;
    let year_of_era = year - era * 400;
    let day_of_year = (153 * i64::from((month + 9) % 12) + 2) / 5 + i64::from(day) - 1;
    let day_of_era = year_of_era * 365 + year_of_era / 4 - year_of_era / 100 + day_of_year;
    era * 146_097 + day_of_era - 719_468
}
