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

#![allow(dead_code)]

use std::fmt::Debug;
use std::hash::Hash;
use std::io::Read;
use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};
use tempfile::TempDir;

use cairn_store::repo::{
    FileRepository, MemoryTransport, Repository, ResourceDescription, TransportRepository,
};
use cairn_store::uri::ResourceUri;

/// The minimum size of test data buffers.
pub const MIN_BUFFER_SIZE: usize = 1024;

/// The maximum size of test data buffers.
pub const MAX_BUFFER_SIZE: usize = 2048;

/// A repository under test along with the state backing it.
pub struct TestRepo {
    pub repository: Arc<dyn Repository>,
    _directory: Option<TempDir>,
}

/// A repository serving a temporary directory on the local file system.
pub fn file_backend() -> TestRepo {
    let directory = tempfile::tempdir().unwrap();
    let root = ResourceUri::parse("/").unwrap();
    let repository = FileRepository::new(root, directory.path()).unwrap();
    TestRepo {
        repository: Arc::new(repository),
        _directory: Some(directory),
    }
}

/// A repository serving an in-memory transport.
pub fn transport_backend() -> TestRepo {
    let root = ResourceUri::parse("/").unwrap();
    let repository = TransportRepository::new(root, MemoryTransport::new()).unwrap();
    TestRepo {
        repository: Arc::new(repository),
        _directory: None,
    }
}

/// Generate a buffer of random bytes.
pub fn random_buffer() -> Vec<u8> {
    let mut rng = SmallRng::from_entropy();
    let mut buffer = vec![0u8; rng.gen_range(MIN_BUFFER_SIZE..MAX_BUFFER_SIZE)];
    rng.fill_bytes(&mut buffer);
    buffer
}

pub fn uri(path: &str) -> ResourceUri {
    ResourceUri::parse(path).unwrap()
}

/// Create a non-collection resource with the given content and an empty description.
pub fn create(
    repository: &dyn Repository,
    path: &str,
    content: &[u8],
) -> anyhow::Result<ResourceUri> {
    let uri = ResourceUri::parse(path)?;
    repository.create(&uri, &ResourceDescription::new(uri.clone()), content)?;
    Ok(uri)
}

/// Create a collection resource.
pub fn create_collection(repository: &dyn Repository, path: &str) -> anyhow::Result<ResourceUri> {
    let uri = ResourceUri::parse(path)?;
    repository.create_collection(&uri)?;
    Ok(uri)
}

/// Read the full content of the resource at `uri`.
pub fn read_all(repository: &dyn Repository, uri: &ResourceUri) -> anyhow::Result<Vec<u8>> {
    let mut content = Vec::new();
    repository.read(uri)?.read_to_end(&mut content)?;
    Ok(content)
}

/// Return the URIs of the given descriptions as strings.
pub fn uris_of(descriptions: &[ResourceDescription]) -> Vec<String> {
    descriptions
        .iter()
        .map(|description| description.uri().as_str().to_owned())
        .collect()
}

/// Assert that two collections contain all the same elements, regardless of order.
pub fn assert_contains_all<T: Hash + Eq + Debug>(
    actual: impl IntoIterator<Item = T>,
    expected: impl IntoIterator<Item = T>,
) {
    let actual: std::collections::HashSet<T> = actual.into_iter().collect();
    let expected: std::collections::HashSet<T> = expected.into_iter().collect();
    assert_eq!(actual, expected);
}
