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
use std::io::Read;
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::uri::ResourceUri;

use super::description::{Property, ResourceDescription};
use super::filter::ResourceFilter;
use super::repository::{copy_tree, move_tree, Depth, Repository, ResourceWriter};

/// The table of mounted sub-repositories, keyed by mount point.
type MountTable = BTreeMap<ResourceUri, Arc<dyn Repository>>;

/// A [`Repository`] which routes operations to mounted sub-repositories.
///
/// A `RepositoryRouter` wraps a base repository and a table of sub-repositories grafted at
/// collection URIs within the base repository's address space. Every operation first resolves
/// the repository owning the target URI; if a mounted sub-repository's root covers the URI, the
/// whole operation is forwarded there and no base-repository logic executes. A mounted
/// repository therefore fully shadows the base repository's view of that subtree.
///
/// Backends never implement delegation themselves; mounting always goes through a router.
///
/// Mounting and unmounting are rare compared to resource operations, so the mount table is
/// rebuilt wholesale on every change and swapped atomically. Concurrent readers always observe
/// either the old or the new table, never a partial rebuild.
#[derive(Debug)]
pub struct RepositoryRouter {
    id: Uuid,
    base: Arc<dyn Repository>,
    mounts: RwLock<Arc<MountTable>>,
}

impl RepositoryRouter {
    /// Create a router over the given `base` repository with no mounted sub-repositories.
    pub fn new(base: Arc<dyn Repository>) -> Self {
        RepositoryRouter {
            id: Uuid::new_v4(),
            base,
            mounts: RwLock::new(Arc::new(MountTable::new())),
        }
    }

    /// Mount `repository` at the collection URI `at`, shadowing that subtree of the base
    /// repository.
    ///
    /// The mounted repository's public root URI must equal the mount point, so that its address
    /// space lines up with the subtree it shadows. The mounted repository is told about its
    /// enclosing parent via [`Repository::attach_parent`].
    ///
    /// # Errors
    /// - `Error::Configuration`: `at` is not a collection URI within the base repository, does
    /// not equal the mounted repository's root URI, or is already a mount point.
    pub fn mount(self: &Arc<Self>, at: ResourceUri, repository: Arc<dyn Repository>) -> Result<()> {
        if !at.is_collection() || !at.is_descendant_of(self.base.root_uri()) {
            return Err(Error::Configuration(format!(
                "`{}` is not a collection within the repository at `{}`",
                at,
                self.base.root_uri()
            )));
        }
        if repository.root_uri() != &at {
            return Err(Error::Configuration(format!(
                "the mounted repository's root `{}` does not match the mount point `{}`",
                repository.root_uri(),
                at
            )));
        }

        let mut mounts = self.mounts.write().unwrap();
        if mounts.contains_key(&at) {
            return Err(Error::Configuration(format!(
                "a repository is already mounted at `{}`",
                at
            )));
        }

        repository.attach_parent(Arc::clone(self) as Arc<dyn Repository>);

        let mut rebuilt = MountTable::clone(&mounts);
        rebuilt.insert(at.clone(), repository);
        *mounts = Arc::new(rebuilt);
        log::debug!("mounted a sub-repository at `{}`", at);
        Ok(())
    }

    /// Unmount the sub-repository at the collection URI `at`.
    ///
    /// # Errors
    /// - `Error::Configuration`: Nothing is mounted at `at`.
    pub fn unmount(&self, at: &ResourceUri) -> Result<()> {
        let mut mounts = self.mounts.write().unwrap();
        if !mounts.contains_key(at) {
            return Err(Error::Configuration(format!(
                "no repository is mounted at `{}`",
                at
            )));
        }
        let mut rebuilt = MountTable::clone(&mounts);
        rebuilt.remove(at);
        *mounts = Arc::new(rebuilt);
        log::debug!("unmounted the sub-repository at `{}`", at);
        Ok(())
    }

    /// Return a snapshot of the current mount table.
    fn snapshot(&self) -> Arc<MountTable> {
        Arc::clone(&self.mounts.read().unwrap())
    }

    /// Return the sub-repository owning the resource at `uri`, or `None` if the base repository
    /// owns it.
    ///
    /// When nested mount points cover the URI, the longest mount point wins.
    fn route(&self, uri: &ResourceUri) -> Option<Arc<dyn Repository>> {
        let mounts = self.snapshot();
        mounts
            .iter()
            .filter(|(mount, _)| *uri == **mount || uri.is_descendant_of(mount))
            .max_by_key(|(mount, _)| mount.as_str().len())
            .map(|(_, repository)| Arc::clone(repository))
    }
}

impl Repository for RepositoryRouter {
    fn instance_id(&self) -> Uuid {
        self.id
    }

    fn root_uri(&self) -> &ResourceUri {
        self.base.root_uri()
    }

    fn open(&self) -> Result<()> {
        self.base.open()?;
        for repository in self.snapshot().values() {
            repository.open()?;
        }
        Ok(())
    }

    fn close(&self) {
        for repository in self.snapshot().values() {
            repository.close();
        }
        self.base.close();
    }

    fn is_open(&self) -> bool {
        self.base.is_open()
    }

    fn exists(&self, uri: &ResourceUri) -> Result<bool> {
        match self.route(uri) {
            Some(repository) => repository.exists(uri),
            None => self.base.exists(uri),
        }
    }

    fn describe(&self, uri: &ResourceUri) -> Result<ResourceDescription> {
        match self.route(uri) {
            Some(repository) => repository.describe(uri),
            None => self.base.describe(uri),
        }
    }

    fn read(&self, uri: &ResourceUri) -> Result<Box<dyn Read + Send>> {
        match self.route(uri) {
            Some(repository) => repository.read(uri),
            None => self.base.read(uri),
        }
    }

    fn write(&self, uri: &ResourceUri) -> Result<Box<dyn ResourceWriter>> {
        match self.route(uri) {
            Some(repository) => repository.write(uri),
            None => self.base.write(uri),
        }
    }

    fn create(
        &self,
        uri: &ResourceUri,
        description: &ResourceDescription,
        content: &[u8],
    ) -> Result<ResourceDescription> {
        match self.route(uri) {
            Some(repository) => repository.create(uri, description, content),
            None => self.base.create(uri, description, content),
        }
    }

    fn create_collection(&self, uri: &ResourceUri) -> Result<ResourceDescription> {
        match self.route(uri) {
            Some(repository) => repository.create_collection(uri),
            None => self.base.create_collection(uri),
        }
    }

    fn delete(&self, uri: &ResourceUri) -> Result<()> {
        match self.route(uri) {
            Some(repository) => repository.delete(uri),
            None => self.base.delete(uri),
        }
    }

    fn list_children(
        &self,
        uri: &ResourceUri,
        filter: Option<&dyn ResourceFilter>,
        depth: Depth,
    ) -> Result<Vec<ResourceDescription>> {
        if let Some(repository) = self.route(uri) {
            return repository.list_children(uri, filter, depth);
        }
        if depth.is_zero() {
            return Ok(Vec::new());
        }

        let mounts = self.snapshot();
        let mut children = self.base.list_children(uri, filter, depth)?;

        // Mounted repositories fully shadow the base repository's view of their subtree.
        children.retain(|child| {
            !mounts
                .keys()
                .any(|mount| child.uri() == mount || child.uri().is_descendant_of(mount))
        });

        for (mount, repository) in mounts.iter() {
            let levels = match mount.depth_below(uri) {
                Some(levels) if levels > 0 => levels,
                _ => continue,
            };
            if !depth.includes(levels) {
                continue;
            }

            let include_root = filter
                .map(|filter| filter.accept_uri(mount))
                .unwrap_or(true);
            if include_root {
                let description = repository.describe(mount)?;
                if filter
                    .map(|filter| filter.accept(&description))
                    .unwrap_or(true)
                {
                    children.push(description);
                }
            }

            let remaining = depth.remaining(levels);
            if !remaining.is_zero() {
                children.extend(repository.list_children(mount, filter, remaining)?);
            }
        }

        Ok(children)
    }

    fn set_properties(
        &self,
        uri: &ResourceUri,
        properties: &[Property],
    ) -> Result<ResourceDescription> {
        match self.route(uri) {
            Some(repository) => repository.set_properties(uri, properties),
            None => self.base.set_properties(uri, properties),
        }
    }

    fn remove_properties(
        &self,
        uri: &ResourceUri,
        property_uris: &[&str],
    ) -> Result<ResourceDescription> {
        match self.route(uri) {
            Some(repository) => repository.remove_properties(uri, property_uris),
            None => self.base.remove_properties(uri, property_uris),
        }
    }

    fn copy(&self, source: &ResourceUri, dest: &ResourceUri) -> Result<()> {
        match (self.route(source), self.route(dest)) {
            (Some(source_repo), Some(dest_repo)) if Arc::ptr_eq(&source_repo, &dest_repo) => {
                source_repo.copy(source, dest)
            }
            // Cross-repository copies go resource by resource through the router itself.
            _ => copy_tree(self, self, source, dest),
        }
    }

    fn move_resource(&self, source: &ResourceUri, dest: &ResourceUri) -> Result<()> {
        if source == self.root_uri() {
            return Err(Error::Configuration(format!(
                "the repository root `{}` cannot be moved",
                source
            )));
        }
        if self.snapshot().contains_key(source) {
            return Err(Error::Configuration(format!(
                "the mounted repository at `{}` cannot be moved",
                source
            )));
        }
        move_tree(self, source, dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::{FileRepository, MemoryTransport, TransportRepository};

    fn base() -> (tempfile::TempDir, Arc<RepositoryRouter>) {
        let dir = tempfile::tempdir().unwrap();
        let root = ResourceUri::parse("/").unwrap();
        let repository = FileRepository::new(root, dir.path()).unwrap();
        (dir, Arc::new(RepositoryRouter::new(Arc::new(repository))))
    }

    fn mounted(router: &Arc<RepositoryRouter>, at: &str) -> Arc<dyn Repository> {
        let mount = ResourceUri::parse(at).unwrap();
        let repository: Arc<dyn Repository> = Arc::new(
            TransportRepository::new(mount.clone(), MemoryTransport::new()).unwrap(),
        );
        router.mount(mount, Arc::clone(&repository)).unwrap();
        repository
    }

    #[test]
    fn mount_point_must_match_mounted_root() {
        let (_dir, router) = base();
        let repository = Arc::new(
            TransportRepository::new(
                ResourceUri::parse("/elsewhere/").unwrap(),
                MemoryTransport::new(),
            )
            .unwrap(),
        );
        let result = router.mount(ResourceUri::parse("/mnt/").unwrap(), repository);
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn operations_under_a_mount_are_delegated() {
        let (_dir, router) = base();
        mounted(&router, "/mnt/");

        let uri = ResourceUri::parse("/mnt/file.bin").unwrap();
        router
            .create(&uri, &ResourceDescription::new(uri.clone()), b"data")
            .unwrap();

        // The resource lives in the mounted repository, not the base file system.
        assert!(router.exists(&uri).unwrap());
        assert!(!router
            .base
            .exists(&ResourceUri::parse("/mnt/").unwrap())
            .unwrap());
    }

    #[test]
    fn longest_mount_point_wins() {
        let (_dir, router) = base();
        let outer = mounted(&router, "/mnt/");
        let inner_mount = ResourceUri::parse("/mnt/inner/").unwrap();
        let inner: Arc<dyn Repository> = Arc::new(
            TransportRepository::new(inner_mount.clone(), MemoryTransport::new()).unwrap(),
        );
        router.mount(inner_mount.clone(), Arc::clone(&inner)).unwrap();

        let uri = inner_mount.child("file.bin").unwrap();
        router
            .create(&uri, &ResourceDescription::new(uri.clone()), b"data")
            .unwrap();

        assert!(inner.exists(&uri).unwrap());
        assert!(!outer.exists(&uri).unwrap());
    }

    #[test]
    fn unmounting_restores_the_base_view() {
        let (_dir, router) = base();
        let mount = ResourceUri::parse("/mnt/").unwrap();
        mounted(&router, "/mnt/");

        assert!(router.exists(&mount).unwrap());
        router.unmount(&mount).unwrap();
        assert!(!router.exists(&mount).unwrap());
        assert!(matches!(
            router.unmount(&mount),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn listing_includes_mounted_roots_within_depth() {
        let (_dir, router) = base();
        let root = ResourceUri::parse("/").unwrap();
        mounted(&router, "/mnt/");

        let children = router.list_children(&root, None, Depth::ONE).unwrap();
        assert!(children
            .iter()
            .any(|child| child.uri() == &ResourceUri::parse("/mnt/").unwrap()));

        let children = router.list_children(&root, None, Depth::ZERO).unwrap();
        assert!(children.is_empty());
    }

    #[test]
    fn mounted_repository_root_cannot_be_moved() {
        let (_dir, router) = base();
        mounted(&router, "/mnt/");

        let result = router.move_resource(
            &ResourceUri::parse("/mnt/").unwrap(),
            &ResourceUri::parse("/elsewhere/").unwrap(),
        );
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
