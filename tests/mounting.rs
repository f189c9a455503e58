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

use std::io::{Cursor, Write};
use std::sync::Arc;

use tempfile::{tempdir, TempDir};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use cairn_store::cache::ResourceCache;
use cairn_store::repo::{
    Depth, FileRepository, MemoryTransport, Repository, RepositoryRouter, TransportRepository,
    ZipConfig, ZipRepository,
};
use cairn_store::uri::ResourceUri;

use common::{assert_contains_all, create, read_all, uri, uris_of};

mod common;

fn router() -> (TempDir, Arc<RepositoryRouter>) {
    let directory = tempdir().unwrap();
    let root = ResourceUri::parse("/").unwrap();
    let base = FileRepository::new(root, directory.path()).unwrap();
    (directory, Arc::new(RepositoryRouter::new(Arc::new(base))))
}

fn mount_transport(router: &Arc<RepositoryRouter>, at: &str) {
    let mount = uri(at);
    let repository =
        TransportRepository::new(mount.clone(), MemoryTransport::new()).unwrap();
    router.mount(mount, Arc::new(repository)).unwrap();
}

fn archive_bytes() -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    writer.start_file("readme.txt", options).unwrap();
    writer.write_all(b"start here").unwrap();
    writer.start_file("docs/guide.txt", options).unwrap();
    writer.write_all(b"the guide").unwrap();
    writer.finish().unwrap().into_inner()
}

#[test]
fn mounted_repositories_shadow_the_base() -> anyhow::Result<()> {
    let (_directory, router) = router();

    create(router.as_ref(), "/base.txt", b"base content")?;
    mount_transport(&router, "/mnt/");
    create(router.as_ref(), "/mnt/sub.txt", b"mounted content")?;

    assert_eq!(read_all(router.as_ref(), &uri("/base.txt"))?, b"base content");
    assert_eq!(read_all(router.as_ref(), &uri("/mnt/sub.txt"))?, b"mounted content");

    // The mounted resource disappears with its repository.
    router.unmount(&uri("/mnt/"))?;
    assert!(!router.exists(&uri("/mnt/sub.txt"))?);
    assert!(router.exists(&uri("/base.txt"))?);
    Ok(())
}

#[test]
fn listing_crosses_mount_boundaries() -> anyhow::Result<()> {
    let (_directory, router) = router();

    create(router.as_ref(), "/base.txt", b"base content")?;
    mount_transport(&router, "/mnt/");
    create(router.as_ref(), "/mnt/sub.txt", b"mounted content")?;

    let direct = router.list_children(&uri("/"), None, Depth::ONE)?;
    assert_contains_all(
        uris_of(&direct),
        vec!["/base.txt".to_owned(), "/mnt/".to_owned()],
    );

    let all = router.list_children(&uri("/"), None, Depth::Unlimited)?;
    assert_contains_all(
        uris_of(&all),
        vec![
            "/base.txt".to_owned(),
            "/mnt/".to_owned(),
            "/mnt/sub.txt".to_owned(),
        ],
    );
    Ok(())
}

#[test]
fn copying_across_mounts_goes_through_the_router() -> anyhow::Result<()> {
    let (_directory, router) = router();
    mount_transport(&router, "/mnt/");

    create(router.as_ref(), "/original.txt", b"content")?;
    router.copy(&uri("/original.txt"), &uri("/mnt/copy.txt"))?;

    assert_eq!(read_all(router.as_ref(), &uri("/mnt/copy.txt"))?, b"content");
    assert!(router.exists(&uri("/original.txt"))?);
    Ok(())
}

#[test]
fn mounted_archives_fetch_their_source_through_the_parent() -> anyhow::Result<()> {
    let (_directory, router) = router();
    let cache_dir = tempdir()?;

    // The archive lives in the base repository, next to its own mount point.
    create(router.as_ref(), "/bundle.zip", &archive_bytes())?;

    let archive = ZipRepository::new(ZipConfig {
        root_uri: uri("/bundle/"),
        source_uri: uri("/bundle.zip"),
        cache: Arc::new(ResourceCache::new(cache_dir.path())?),
        source_repository: None,
        auto_open: true,
    })?;
    router.mount(uri("/bundle/"), Arc::new(archive))?;

    assert_eq!(
        read_all(router.as_ref(), &uri("/bundle/readme.txt"))?,
        b"start here"
    );
    assert_eq!(
        read_all(router.as_ref(), &uri("/bundle/docs/guide.txt"))?,
        b"the guide"
    );

    let children = router.list_children(&uri("/bundle/"), None, Depth::ONE)?;
    assert_contains_all(
        uris_of(&children),
        vec!["/bundle/readme.txt".to_owned(), "/bundle/docs/".to_owned()],
    );
    Ok(())
}

#[test]
fn nested_mounts_route_to_the_longest_mount_point() -> anyhow::Result<()> {
    let (_directory, router) = router();
    mount_transport(&router, "/mnt/");
    create(router.as_ref(), "/mnt/outer.txt", b"outer")?;
    mount_transport(&router, "/mnt/inner/");
    create(router.as_ref(), "/mnt/inner/inner.txt", b"inner")?;

    assert_eq!(read_all(router.as_ref(), &uri("/mnt/outer.txt"))?, b"outer");
    assert_eq!(
        read_all(router.as_ref(), &uri("/mnt/inner/inner.txt"))?,
        b"inner"
    );

    // The inner subtree belongs to the inner mount, not the outer one.
    assert!(!router.exists(&uri("/mnt/inner/outer.txt"))?);
    Ok(())
}
