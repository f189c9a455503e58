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

//! A file-based cache of repository resource content.
//!
//! A [`ResourceCache`] materializes resource content into files in a local directory so that
//! consumers which need a real file path, like archive readers and external tools, can work
//! with remote resources. Cached files are refreshed when the resource's modification time
//! moves away from the cached copy's, and aspect-specific derivatives are produced by running
//! the content filter chains of the installed resource kits.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use filetime::FileTime;
use log::debug;
use tempfile::NamedTempFile;
use uuid::Uuid;
use weak_table::WeakValueHashMap;

use crate::error::{Error, Result};
use crate::kit::KitSession;
use crate::repo::{Repository, ResourceDescription};
use crate::uri::{encode_file_name, ResourceUri};

/// The tolerance when comparing a resource's modification time against the cached copy's.
///
/// Backends and file systems round timestamps to whole seconds, so cached copies within this
/// tolerance of the source are considered current.
const MODIFIED_TOLERANCE: Duration = Duration::from_secs(1);

/// The separator between a cached file's name and the aspect of a derivative.
///
/// This character never appears in encoded file names, so derivative names cannot collide with
/// the base names of other resources.
const ASPECT_SEPARATOR: char = '~';

/// A handle to a cached copy of a resource's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheData {
    /// The path of the cached file.
    pub file: PathBuf,

    /// The modification time recorded for the cached content.
    pub modified: Option<SystemTime>,

    /// The generation of the cached base content.
    ///
    /// A new generation value is assigned every time the base content is refreshed from the
    /// repository. Consumers holding state derived from the cached file, like an open archive
    /// reader, can compare generations to detect that the file changed underneath them.
    pub generation: Uuid,
}

#[derive(Debug)]
struct EntryState {
    generation: Uuid,
    checked: Instant,
}

/// The table of per-entry locks, keyed by the base file name of the cache entry.
///
/// Locks are dropped from the table once no fetch holds them.
#[derive(Debug, Default)]
struct LockTable(Mutex<WeakValueHashMap<String, Weak<Mutex<()>>>>);

impl LockTable {
    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        let mut table = self.0.lock().unwrap();
        match table.get(name) {
            Some(lock) => lock,
            None => {
                let lock = Arc::new(Mutex::new(()));
                table.insert(name.to_owned(), Arc::clone(&lock));
                lock
            }
        }
    }
}

/// A file-based cache of resource content.
///
/// Concurrent fetches of the same resource are serialized on a per-entry lock, so a resource is
/// copied out of its repository at most once even when requested from several threads. Fetches
/// of distinct resources proceed in parallel.
#[derive(Debug)]
pub struct ResourceCache {
    directory: PathBuf,
    max_age: Option<Duration>,
    session: Option<Arc<KitSession>>,
    locks: LockTable,
    entries: Mutex<HashMap<PathBuf, EntryState>>,
}

impl ResourceCache {
    /// Create a cache storing its files in the given `directory`.
    ///
    /// The directory is created if it does not exist.
    ///
    /// # Errors
    /// - `Error::Io`: An I/O error occurred.
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        Ok(ResourceCache {
            directory,
            max_age: None,
            session: None,
            locks: LockTable::default(),
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Trust cached entries for the given duration before re-checking the repository.
    ///
    /// Without a trust window, every fetch describes the resource to check its modification
    /// time. With one, a fetch within `max_age` of the last check serves the cached file
    /// without contacting the repository at all.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// Use the given kit session to resolve the filter chains for aspect derivatives.
    ///
    /// Without a session, fetching an aspect returns the unfiltered base content.
    pub fn with_session(mut self, session: Arc<KitSession>) -> Self {
        self.session = Some(session);
        self
    }

    /// Return the directory this cache stores its files in.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Return a cached copy of the content of the resource at `uri` in `repository`.
    ///
    /// When `aspect` is given and an installed kit declares a filter chain for it, the returned
    /// file holds the filtered derivative; otherwise it holds the resource content as-is. The
    /// returned file belongs to the cache and must not be modified.
    ///
    /// # Errors
    /// - `Error::NotFound`: There is no resource at `uri`.
    /// - `Error::Closed`: The repository is closed and does not reopen automatically.
    /// - `Error::Io`: An I/O error occurred.
    pub fn fetch(
        &self,
        repository: &dyn Repository,
        uri: &ResourceUri,
        aspect: Option<&str>,
    ) -> Result<CacheData> {
        let name = self.entry_name(repository, uri);
        let base = self.directory.join(&name);
        let lock = self.locks.lock_for(&name);
        let _guard = lock.lock().unwrap();

        let mut description = None;

        if !self.is_trusted(&base) {
            let described = repository.describe(uri)?;
            let modified = described.content_modified();
            if stale(&base, modified) {
                self.refresh(repository, uri, &base, modified)?;
            }
            self.touch(&base);
            description = Some(described);
        }

        let generation = self.generation(&base);
        let modified = file_modified(&base);

        let file = match aspect {
            None => base,
            Some(aspect) => {
                let derivative = derivative_path(&base, aspect);
                if needs_rebuild(&derivative, modified) {
                    let described = match description {
                        Some(described) => described,
                        None => repository.describe(uri)?,
                    };
                    if self.build_derivative(&described, aspect, &base, &derivative)? {
                        derivative
                    } else {
                        base
                    }
                } else {
                    derivative
                }
            }
        };

        Ok(CacheData {
            file,
            modified,
            generation,
        })
    }

    /// Start fetching the resource at `uri` on a background thread.
    ///
    /// The returned [`PendingFetch`] yields the same result [`fetch`] would.
    ///
    /// [`fetch`]: ResourceCache::fetch
    pub fn fetch_deferred(
        self: &Arc<Self>,
        repository: Arc<dyn Repository>,
        uri: ResourceUri,
        aspect: Option<String>,
    ) -> PendingFetch {
        let cache = Arc::clone(self);
        let (sender, receiver) = mpsc::channel();
        thread::spawn(move || {
            let result = cache.fetch(repository.as_ref(), &uri, aspect.as_deref());
            // The caller may have dropped the pending fetch.
            sender.send(result).ok();
        });
        PendingFetch { receiver }
    }

    /// Return whether the cached copy of the resource at `uri` is stale.
    ///
    /// A resource with no cached copy, or whose modification time is unknown, is always stale.
    ///
    /// # Errors
    /// - `Error::NotFound`: There is no resource at `uri`.
    pub fn is_stale(&self, repository: &dyn Repository, uri: &ResourceUri) -> Result<bool> {
        let base = self.directory.join(self.entry_name(repository, uri));
        let description = repository.describe(uri)?;
        Ok(stale(&base, description.content_modified()))
    }

    /// Remove the cached copy of the resource at `uri`, including all aspect derivatives.
    ///
    /// # Errors
    /// - `Error::Io`: An I/O error occurred.
    pub fn evict(&self, repository: &dyn Repository, uri: &ResourceUri) -> Result<()> {
        let name = self.entry_name(repository, uri);
        let base = self.directory.join(&name);
        let lock = self.locks.lock_for(&name);
        let _guard = lock.lock().unwrap();

        self.remove_derivatives(&name)?;
        remove_if_present(&base)?;
        self.entries.lock().unwrap().remove(&base);
        debug!("Evicted cache entry `{}`.", name);
        Ok(())
    }

    /// Remove the cached derivative for the given `aspect` of the resource at `uri`.
    ///
    /// The base content and other aspects stay cached.
    ///
    /// # Errors
    /// - `Error::Io`: An I/O error occurred.
    pub fn evict_aspect(
        &self,
        repository: &dyn Repository,
        uri: &ResourceUri,
        aspect: &str,
    ) -> Result<()> {
        let name = self.entry_name(repository, uri);
        let base = self.directory.join(&name);
        let lock = self.locks.lock_for(&name);
        let _guard = lock.lock().unwrap();

        remove_if_present(&derivative_path(&base, aspect))
    }

    fn entry_name(&self, repository: &dyn Repository, uri: &ResourceUri) -> String {
        format!(
            "{}-{}",
            repository.instance_id().simple(),
            encode_file_name(uri.path())
        )
    }

    fn is_trusted(&self, base: &Path) -> bool {
        let max_age = match self.max_age {
            Some(max_age) => max_age,
            None => return false,
        };
        if !base.exists() {
            return false;
        }
        let entries = self.entries.lock().unwrap();
        match entries.get(base) {
            Some(entry) => entry.checked.elapsed() <= max_age,
            None => false,
        }
    }

    fn touch(&self, base: &Path) {
        let mut entries = self.entries.lock().unwrap();
        entries
            .entry(base.to_owned())
            .or_insert_with(|| EntryState {
                generation: Uuid::new_v4(),
                checked: Instant::now(),
            })
            .checked = Instant::now();
    }

    fn generation(&self, base: &Path) -> Uuid {
        let mut entries = self.entries.lock().unwrap();
        entries
            .entry(base.to_owned())
            .or_insert_with(|| EntryState {
                generation: Uuid::new_v4(),
                checked: Instant::now(),
            })
            .generation
    }

    /// Copy the resource content into the cache, replacing the current entry.
    ///
    /// The content is staged in a temporary file and moved into place, so readers never see a
    /// partially written cache file. The cached file's modification time is stamped with the
    /// resource's after the copy completes.
    fn refresh(
        &self,
        repository: &dyn Repository,
        uri: &ResourceUri,
        base: &Path,
        modified: Option<SystemTime>,
    ) -> Result<()> {
        let name = base
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_owned();
        debug!("Refreshing cache entry `{}` from `{}`.", name, uri);

        let mut reader = repository.read(uri)?;
        let mut staged = NamedTempFile::new_in(&self.directory)?;
        io::copy(&mut reader, &mut staged)?;
        staged.persist(base).map_err(|error| error.error)?;

        if let Some(modified) = modified {
            filetime::set_file_mtime(base, FileTime::from_system_time(modified))?;
        }

        // Derivatives of the old content are no longer valid.
        self.remove_derivatives(&name)?;

        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            base.to_owned(),
            EntryState {
                generation: Uuid::new_v4(),
                checked: Instant::now(),
            },
        );

        Ok(())
    }

    fn remove_derivatives(&self, name: &str) -> Result<()> {
        let prefix = format!("{}{}", name, ASPECT_SEPARATOR);
        for entry in fs::read_dir(&self.directory)? {
            let entry = entry?;
            let file_name = entry.file_name();
            if let Some(file_name) = file_name.to_str() {
                if file_name.starts_with(&prefix) {
                    remove_if_present(&entry.path())?;
                }
            }
        }
        Ok(())
    }

    /// Run the filter chain for `aspect` over the cached base content.
    ///
    /// Returns `false` if no installed kit declares filters for the aspect, in which case no
    /// derivative file is produced and the base content stands in for it.
    fn build_derivative(
        &self,
        description: &ResourceDescription,
        aspect: &str,
        base: &Path,
        derivative: &Path,
    ) -> Result<bool> {
        let filters = match &self.session {
            Some(session) => session.filters_for_aspect(description, aspect),
            None => Vec::new(),
        };
        if filters.is_empty() {
            return Ok(false);
        }

        debug!(
            "Building `{}` derivative of `{}` with {} filters.",
            aspect,
            description.uri(),
            filters.len()
        );

        let mut input = base.to_owned();
        let mut staged: Option<NamedTempFile> = None;
        for filter in &filters {
            let output = NamedTempFile::new_in(&self.directory)?;
            filter.filter_file(&input, output.path())?;
            input = output.path().to_owned();
            staged = Some(output);
        }

        // The chain is non-empty, so a staged file exists.
        let staged = staged.ok_or_else(|| {
            Error::Configuration("the filter chain produced no output".to_owned())
        })?;
        staged.persist(derivative).map_err(|error| error.error)?;

        // Stamp the derivative with the base's time so staleness checks line up.
        if let Ok(metadata) = fs::metadata(base) {
            filetime::set_file_mtime(derivative, FileTime::from_last_modification_time(&metadata))?;
        }

        Ok(true)
    }
}

/// An in-flight background fetch started by [`ResourceCache::fetch_deferred`].
#[derive(Debug)]
pub struct PendingFetch {
    receiver: Receiver<Result<CacheData>>,
}

impl PendingFetch {
    /// Return the result of the fetch if it has completed, without blocking.
    pub fn poll(&mut self) -> Option<Result<CacheData>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(cancelled())),
        }
    }

    /// Block until the fetch completes and return its result.
    pub fn wait(self) -> Result<CacheData> {
        self.receiver.recv().unwrap_or_else(|_| Err(cancelled()))
    }
}

fn cancelled() -> Error {
    Error::Configuration("the deferred fetch did not complete".to_owned())
}

fn derivative_path(base: &Path, aspect: &str) -> PathBuf {
    let mut name = base
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default()
        .to_owned();
    name.push(ASPECT_SEPARATOR);
    name.push_str(&encode_file_name(aspect));
    base.with_file_name(name)
}

/// Remove the file at `path`, tolerating its absence.
fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error.into()),
    }
}

fn file_modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|metadata| metadata.modified()).ok()
}

/// Return whether the cached file at `path` is out of date for a resource last modified at
/// `modified`.
fn stale(path: &Path, modified: Option<SystemTime>) -> bool {
    let modified = match modified {
        Some(modified) => modified,
        // With no modification time to compare, the cached copy cannot be trusted.
        None => return true,
    };
    match file_modified(path) {
        Some(cached) => !within_tolerance(cached, modified),
        None => true,
    }
}

fn needs_rebuild(derivative: &Path, base_modified: Option<SystemTime>) -> bool {
    match (file_modified(derivative), base_modified) {
        (Some(derived), Some(base)) => !within_tolerance(derived, base),
        _ => true,
    }
}

fn within_tolerance(first: SystemTime, second: SystemTime) -> bool {
    let difference = first
        .duration_since(second)
        .unwrap_or_else(|error| error.duration());
    difference <= MODIFIED_TOLERANCE
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use spectral::prelude::*;
    use tempfile::tempdir;

    use crate::kit::{
        Capabilities, ContentFilter, KitDefaults, KitHandle, KitSession, ResourceKit,
    };
    use crate::repo::{FileRepository, ResourceDescription};

    use super::*;

    fn repository() -> (tempfile::TempDir, FileRepository) {
        let directory = tempdir().unwrap();
        let root = ResourceUri::parse("/").unwrap();
        let repository = FileRepository::new(root, directory.path()).unwrap();
        (directory, repository)
    }

    fn create(repository: &FileRepository, path: &str, content: &[u8]) -> ResourceUri {
        let uri = ResourceUri::parse(path).unwrap();
        let description = ResourceDescription::new(uri.clone());
        repository.create(&uri, &description, content).unwrap();
        uri
    }

    fn read_file(path: &Path) -> Vec<u8> {
        let mut content = Vec::new();
        File::open(path).unwrap().read_to_end(&mut content).unwrap();
        content
    }

    #[test]
    fn fetch_copies_content_into_the_cache() {
        let (_repo_dir, repository) = repository();
        let cache_dir = tempdir().unwrap();
        let cache = ResourceCache::new(cache_dir.path()).unwrap();
        let uri = create(&repository, "/notes.txt", b"some notes");

        let data = cache.fetch(&repository, &uri, None).unwrap();

        assert_that!(data.file.starts_with(cache_dir.path())).is_true();
        assert_that!(read_file(&data.file)).is_equal_to(b"some notes".to_vec());
    }

    #[test]
    fn unchanged_resources_keep_their_generation() {
        let (_repo_dir, repository) = repository();
        let cache_dir = tempdir().unwrap();
        let cache = ResourceCache::new(cache_dir.path()).unwrap();
        let uri = create(&repository, "/notes.txt", b"some notes");

        let first = cache.fetch(&repository, &uri, None).unwrap();
        let second = cache.fetch(&repository, &uri, None).unwrap();

        assert_that!(second.generation).is_equal_to(first.generation);
        assert_that!(second.file).is_equal_to(first.file);
    }

    #[test]
    fn modified_resources_are_refetched_with_a_new_generation() {
        let (repo_dir, repository) = repository();
        let cache_dir = tempdir().unwrap();
        let cache = ResourceCache::new(cache_dir.path()).unwrap();
        let uri = create(&repository, "/notes.txt", b"some notes");

        let first = cache.fetch(&repository, &uri, None).unwrap();

        // Push the modification time well past the comparison tolerance.
        let future = SystemTime::now() + Duration::from_secs(120);
        create(&repository, "/notes.txt", b"revised notes");
        filetime::set_file_mtime(
            repo_dir.path().join("notes.txt"),
            FileTime::from_system_time(future),
        )
        .unwrap();

        let second = cache.fetch(&repository, &uri, None).unwrap();

        assert_that!(second.generation).is_not_equal_to(first.generation);
        assert_that!(read_file(&second.file)).is_equal_to(b"revised notes".to_vec());
    }

    #[test]
    fn missing_resources_are_not_cached() {
        let (_repo_dir, repository) = repository();
        let cache_dir = tempdir().unwrap();
        let cache = ResourceCache::new(cache_dir.path()).unwrap();
        let uri = ResourceUri::parse("/absent.txt").unwrap();

        assert!(matches!(
            cache.fetch(&repository, &uri, None),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn evicted_entries_are_refetched() {
        let (_repo_dir, repository) = repository();
        let cache_dir = tempdir().unwrap();
        let cache = ResourceCache::new(cache_dir.path()).unwrap();
        let uri = create(&repository, "/notes.txt", b"some notes");

        let first = cache.fetch(&repository, &uri, None).unwrap();
        cache.evict(&repository, &uri).unwrap();

        assert_that!(first.file.exists()).is_false();

        let second = cache.fetch(&repository, &uri, None).unwrap();
        assert_that!(second.generation).is_not_equal_to(first.generation);
    }

    #[derive(Debug, Default)]
    struct UppercaseFilter {
        calls: Arc<AtomicUsize>,
    }

    impl ContentFilter for UppercaseFilter {
        fn filter(&self, input: &mut dyn Read, output: &mut dyn Write) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut content = String::new();
            input.read_to_string(&mut content)?;
            output.write_all(content.to_uppercase().as_bytes())?;
            Ok(())
        }
    }

    #[derive(Debug)]
    struct UppercaseKit {
        filter: Arc<UppercaseFilter>,
    }

    impl ResourceKit for UppercaseKit {
        fn supported_content_types(&self) -> &[&str] {
            &["text/plain"]
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::empty()
        }

        fn filters_for_aspect(
            &self,
            _description: &ResourceDescription,
            aspect: &str,
        ) -> Vec<Arc<dyn ContentFilter>> {
            if aspect == "shouting" {
                vec![Arc::clone(&self.filter) as Arc<dyn ContentFilter>]
            } else {
                Vec::new()
            }
        }
    }

    fn session_with_kit() -> (Arc<KitSession>, Arc<AtomicUsize>) {
        let filter = Arc::new(UppercaseFilter::default());
        let calls = Arc::clone(&filter.calls);
        let session = Arc::new(KitSession::new());
        session
            .install(
                KitHandle::new(Arc::new(UppercaseKit { filter })),
                KitDefaults::default(),
            )
            .unwrap();
        (session, calls)
    }

    fn create_text(repository: &FileRepository, path: &str, content: &[u8]) -> ResourceUri {
        let uri = ResourceUri::parse(path).unwrap();
        let mut description = ResourceDescription::new(uri.clone());
        description.set_content_type("text/plain");
        repository.create(&uri, &description, content).unwrap();
        uri
    }

    #[test]
    fn aspects_apply_the_kit_filter_chain() {
        let (_repo_dir, repository) = repository();
        let cache_dir = tempdir().unwrap();
        let (session, _calls) = session_with_kit();
        let cache = ResourceCache::new(cache_dir.path())
            .unwrap()
            .with_session(session);
        let uri = create_text(&repository, "/notes.txt", b"some notes");

        let base = cache.fetch(&repository, &uri, None).unwrap();
        let shouting = cache.fetch(&repository, &uri, Some("shouting")).unwrap();

        assert_that!(shouting.file).is_not_equal_to(&base.file);
        assert_that!(read_file(&shouting.file)).is_equal_to(b"SOME NOTES".to_vec());
        // The base content is left as-is.
        assert_that!(read_file(&base.file)).is_equal_to(b"some notes".to_vec());
    }

    #[test]
    fn repeated_aspect_fetches_reuse_the_derivative() {
        let (_repo_dir, repository) = repository();
        let cache_dir = tempdir().unwrap();
        let (session, calls) = session_with_kit();
        let cache = ResourceCache::new(cache_dir.path())
            .unwrap()
            .with_session(session);
        let uri = create_text(&repository, "/notes.txt", b"some notes");

        let first = cache.fetch(&repository, &uri, Some("shouting")).unwrap();
        let second = cache.fetch(&repository, &uri, Some("shouting")).unwrap();

        assert_that!(second.file).is_equal_to(&first.file);
        assert_that!(read_file(&second.file)).is_equal_to(b"SOME NOTES".to_vec());
        assert_that!(calls.load(Ordering::SeqCst)).is_equal_to(1);
    }

    #[test]
    fn unhandled_aspects_fall_back_to_the_base_content() {
        let (_repo_dir, repository) = repository();
        let cache_dir = tempdir().unwrap();
        let (session, _calls) = session_with_kit();
        let cache = ResourceCache::new(cache_dir.path())
            .unwrap()
            .with_session(session);
        let uri = create_text(&repository, "/notes.txt", b"some notes");

        let base = cache.fetch(&repository, &uri, None).unwrap();
        let unknown = cache.fetch(&repository, &uri, Some("thumbnail")).unwrap();

        assert_that!(unknown.file).is_equal_to(base.file);
    }

    #[test]
    fn evicting_the_base_removes_derivatives() {
        let (_repo_dir, repository) = repository();
        let cache_dir = tempdir().unwrap();
        let (session, _calls) = session_with_kit();
        let cache = ResourceCache::new(cache_dir.path())
            .unwrap()
            .with_session(session);
        let uri = create_text(&repository, "/notes.txt", b"some notes");

        let shouting = cache.fetch(&repository, &uri, Some("shouting")).unwrap();
        cache.evict(&repository, &uri).unwrap();

        assert_that!(shouting.file.exists()).is_false();
    }

    #[test]
    fn evicting_an_aspect_keeps_the_base() {
        let (_repo_dir, repository) = repository();
        let cache_dir = tempdir().unwrap();
        let (session, _calls) = session_with_kit();
        let cache = ResourceCache::new(cache_dir.path())
            .unwrap()
            .with_session(session);
        let uri = create_text(&repository, "/notes.txt", b"some notes");

        let base = cache.fetch(&repository, &uri, None).unwrap();
        let shouting = cache.fetch(&repository, &uri, Some("shouting")).unwrap();
        cache.evict_aspect(&repository, &uri, "shouting").unwrap();

        assert_that!(shouting.file.exists()).is_false();
        assert_that!(base.file.exists()).is_true();
        // Evicting an aspect which was never built is not an error.
        cache.evict_aspect(&repository, &uri, "thumbnail").unwrap();
    }

    #[test]
    fn deferred_fetches_complete_in_the_background() {
        let (_repo_dir, repository) = repository();
        let cache_dir = tempdir().unwrap();
        let cache = Arc::new(ResourceCache::new(cache_dir.path()).unwrap());
        let uri = create(&repository, "/notes.txt", b"some notes");

        let repository: Arc<dyn Repository> = Arc::new(repository);
        let pending = cache.fetch_deferred(Arc::clone(&repository), uri.clone(), None);
        let data = pending.wait().unwrap();

        assert_that!(read_file(&data.file)).is_equal_to(b"some notes".to_vec());
    }
}
