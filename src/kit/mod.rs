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

//! Resource kits and the session-level kit registry.
//!
//! A [`ResourceKit`] is a pluggable handler for a class of resources, providing type-specific
//! creation defaults, content filters keyed by aspect, and capability declarations. Kits are
//! installed into a [`KitSession`], which dispatches resources to kits by content type and
//! resource type. The resource cache consults the session to find the filters to apply when an
//! aspect-specific derivative is requested.

use std::collections::HashMap;
use std::fmt::Debug;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use bitflags::bitflags;
use static_assertions::assert_obj_safe;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::repo::{Repository, ResourceDescription};
use crate::uri::{encode_segment, ResourceUri};

bitflags! {
    /// The capabilities a resource kit declares for its resources.
    pub struct Capabilities: u32 {
        /// The kit can create new resources.
        const CREATE = 0b01;

        /// The kit can edit existing resources.
        const EDIT = 0b10;
    }
}

/// A transformation of resource content.
///
/// Filters run in chains: each filter consumes the output of the previous one. The cache applies
/// filter chains to produce aspect-specific derivative files.
pub trait ContentFilter: Debug + Send + Sync {
    /// Transform the bytes of `input`, writing the result to `output`.
    fn filter(&self, input: &mut dyn Read, output: &mut dyn Write) -> Result<()>;

    /// Transform the file at `input` into the file at `output`.
    ///
    /// The default implementation streams through [`filter`]; kits whose transformations work
    /// on whole files can override it.
    ///
    /// [`filter`]: ContentFilter::filter
    fn filter_file(&self, input: &Path, output: &Path) -> Result<()> {
        let mut reader = File::open(input)?;
        let mut writer = File::create(output)?;
        self.filter(&mut reader, &mut writer)?;
        writer.flush()?;
        Ok(())
    }
}

assert_obj_safe!(ContentFilter);

/// A pluggable handler for a class of resources.
///
/// A kit declares which content types and resource types it handles, its capabilities, and the
/// defaults used when creating resources of its class. Kits are immutable; all per-session
/// state lives in the [`KitSession`] they are installed into.
pub trait ResourceKit: Debug + Send + Sync {
    /// Return the base content types this kit supports.
    fn supported_content_types(&self) -> &[&str] {
        &[]
    }

    /// Return the resource type URIs this kit supports.
    fn supported_resource_types(&self) -> &[&str] {
        &[]
    }

    /// Return the default name extension for resources created by this kit.
    fn default_extension(&self) -> Option<&str> {
        None
    }

    /// Return the capabilities of this kit.
    fn capabilities(&self) -> Capabilities;

    /// Return the default content for a new resource described by `description`.
    fn default_content(&self, description: &ResourceDescription) -> Result<Vec<u8>> {
        let _ = description;
        Ok(Vec::new())
    }

    /// Return the ordered content filters to apply for the given `aspect` of the described
    /// resource.
    ///
    /// An empty chain means the kit provides no derivative for that aspect and the unfiltered
    /// content is used as-is.
    fn filters_for_aspect(
        &self,
        description: &ResourceDescription,
        aspect: &str,
    ) -> Vec<Arc<dyn ContentFilter>> {
        let _ = (description, aspect);
        Vec::new()
    }
}

assert_obj_safe!(ResourceKit);

/// An installable handle around a [`ResourceKit`].
///
/// A kit instance may be installed in at most one session at a time; the handle carries the
/// ownership slot which enforces that.
#[derive(Debug)]
pub struct KitHandle {
    kit: Arc<dyn ResourceKit>,
    owner: Mutex<Option<Uuid>>,
}

impl KitHandle {
    /// Create a handle around the given `kit`.
    pub fn new(kit: Arc<dyn ResourceKit>) -> Arc<Self> {
        Arc::new(KitHandle {
            kit,
            owner: Mutex::new(None),
        })
    }

    /// Return the kit behind this handle.
    pub fn kit(&self) -> &Arc<dyn ResourceKit> {
        &self.kit
    }

    fn claim(&self, session: Uuid) -> Result<()> {
        let mut owner = self.owner.lock().unwrap();
        match *owner {
            Some(existing) if existing != session => Err(Error::Configuration(
                "the resource kit is already installed in another session".to_owned(),
            )),
            Some(_) => Err(Error::Configuration(
                "the resource kit is already installed in this session".to_owned(),
            )),
            None => {
                *owner = Some(session);
                Ok(())
            }
        }
    }

    fn release(&self, session: Uuid) {
        let mut owner = self.owner.lock().unwrap();
        if *owner == Some(session) {
            *owner = None;
        }
    }
}

/// Which default roles an installed kit takes on in its session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KitDefaults {
    /// Use the kit as the session's default kit.
    pub default: bool,

    /// Use the kit as the session's default kit for collection resources.
    pub collection_default: bool,
}

/// The immutable lookup tables of a session, rebuilt wholesale on every install or uninstall.
#[derive(Debug, Default)]
struct Tables {
    by_content_type: HashMap<String, Arc<dyn ResourceKit>>,
    by_resource_type: HashMap<String, Arc<dyn ResourceKit>>,
    default_kit: Option<Arc<dyn ResourceKit>>,
    collection_default: Option<Arc<dyn ResourceKit>>,
}

impl Tables {
    fn build(installed: &[(Arc<KitHandle>, KitDefaults)]) -> Self {
        let mut tables = Tables::default();
        for (handle, defaults) in installed {
            let kit = Arc::clone(handle.kit());
            for content_type in kit.supported_content_types() {
                tables
                    .by_content_type
                    .insert(base_content_type(content_type).to_owned(), Arc::clone(&kit));
            }
            for resource_type in kit.supported_resource_types() {
                tables
                    .by_resource_type
                    .insert((*resource_type).to_owned(), Arc::clone(&kit));
            }
            if defaults.default {
                tables.default_kit = Some(Arc::clone(&kit));
            }
            if defaults.collection_default {
                tables.collection_default = Some(Arc::clone(&kit));
            }
        }
        tables
    }
}

/// A session holding installed resource kits and dispatching resources to them.
///
/// Lookup precedence for the kit handling a resource: exact base content type match with the
/// required capabilities, then resource type URI match, then the default collection kit (for
/// collection URIs) with the required capabilities, then the default kit with the required
/// capabilities, else none.
///
/// The lookup tables are rebuilt from scratch and swapped atomically on every install and
/// uninstall rather than patched incrementally, so concurrent readers never observe a partially
/// rebuilt table.
#[derive(Debug)]
pub struct KitSession {
    id: Uuid,
    installed: Mutex<Vec<(Arc<KitHandle>, KitDefaults)>>,
    tables: RwLock<Arc<Tables>>,
}

impl Default for KitSession {
    fn default() -> Self {
        Self::new()
    }
}

impl KitSession {
    /// Create a new session with no installed kits.
    pub fn new() -> Self {
        KitSession {
            id: Uuid::new_v4(),
            installed: Mutex::new(Vec::new()),
            tables: RwLock::new(Arc::new(Tables::default())),
        }
    }

    /// Install the kit behind `handle` into this session.
    ///
    /// # Errors
    /// - `Error::Configuration`: The kit is already installed in this or another session.
    pub fn install(&self, handle: Arc<KitHandle>, defaults: KitDefaults) -> Result<()> {
        handle.claim(self.id)?;
        let mut installed = self.installed.lock().unwrap();
        installed.push((handle, defaults));
        self.rebuild(&installed);
        Ok(())
    }

    /// Uninstall the kit behind `handle` from this session.
    ///
    /// # Errors
    /// - `Error::Configuration`: The kit is not installed in this session.
    pub fn uninstall(&self, handle: &Arc<KitHandle>) -> Result<()> {
        let mut installed = self.installed.lock().unwrap();
        let index = installed
            .iter()
            .position(|(existing, _)| Arc::ptr_eq(existing, handle))
            .ok_or_else(|| {
                Error::Configuration(
                    "the resource kit is not installed in this session".to_owned(),
                )
            })?;
        let (handle, _) = installed.remove(index);
        handle.release(self.id);
        self.rebuild(&installed);
        Ok(())
    }

    fn rebuild(&self, installed: &[(Arc<KitHandle>, KitDefaults)]) {
        let tables = Arc::new(Tables::build(installed));
        *self.tables.write().unwrap() = tables;
    }

    fn snapshot(&self) -> Arc<Tables> {
        Arc::clone(&self.tables.read().unwrap())
    }

    /// Return the kit handling the described resource, requiring the given capabilities.
    pub fn kit_for(
        &self,
        description: &ResourceDescription,
        required: Capabilities,
    ) -> Option<Arc<dyn ResourceKit>> {
        let tables = self.snapshot();

        if let Some(content_type) = description.content_type() {
            if let Some(kit) = tables.by_content_type.get(base_content_type(content_type)) {
                if kit.capabilities().contains(required) {
                    return Some(Arc::clone(kit));
                }
            }
        }

        for resource_type in description.resource_types() {
            if let Some(kit) = tables.by_resource_type.get(resource_type.as_str()) {
                return Some(Arc::clone(kit));
            }
        }

        if description.uri().is_collection() {
            if let Some(kit) = &tables.collection_default {
                if kit.capabilities().contains(required) {
                    return Some(Arc::clone(kit));
                }
            }
        }

        match &tables.default_kit {
            Some(kit) if kit.capabilities().contains(required) => Some(Arc::clone(kit)),
            _ => None,
        }
    }

    /// Return the filter chain for the given `aspect` of the described resource.
    ///
    /// This is empty if no installed kit handles the resource or the handling kit declares no
    /// filters for the aspect.
    pub fn filters_for_aspect(
        &self,
        description: &ResourceDescription,
        aspect: &str,
    ) -> Vec<Arc<dyn ContentFilter>> {
        match self.kit_for(description, Capabilities::empty()) {
            Some(kit) => kit.filters_for_aspect(description, aspect),
            None => Vec::new(),
        }
    }

    /// Create a resource in `repository` using the kit handling the given content type.
    ///
    /// The kit supplies the default content for the new resource. If the URI's name has no
    /// extension and the kit declares a default extension, the resource is created with the
    /// extension appended. Without a capable kit the resource is created empty.
    ///
    /// The description of the created resource is returned; its URI reflects any extension
    /// defaulting.
    pub fn create_resource(
        &self,
        repository: &dyn Repository,
        uri: &ResourceUri,
        content_type: Option<&str>,
    ) -> Result<ResourceDescription> {
        let mut description = ResourceDescription::new(uri.clone());
        if let Some(content_type) = content_type {
            description.set_content_type(content_type);
        }

        let kit = self.kit_for(&description, Capabilities::CREATE);

        let target = match &kit {
            Some(kit) => match kit.default_extension() {
                Some(extension) if !uri.name().contains('.') && !uri.is_collection() => {
                    let parent = uri.parent().ok_or_else(|| {
                        Error::InvalidUri(uri.as_str().to_owned())
                    })?;
                    parent.child(&format!("{}.{}", encode_segment(&uri.name()), extension))?
                }
                _ => uri.clone(),
            },
            None => uri.clone(),
        };

        let content = match &kit {
            Some(kit) => kit.default_content(&description)?,
            None => Vec::new(),
        };

        let mut target_description = ResourceDescription::new(target.clone());
        for property in description.properties() {
            target_description.set_property(property.clone());
        }

        if target.is_collection() {
            repository.create_collection(&target)
        } else {
            repository.create(&target, &target_description, &content)
        }
    }
}

/// Return the base type of a content type, without any parameters.
fn base_content_type(content_type: &str) -> &str {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct TextKit;

    impl ResourceKit for TextKit {
        fn supported_content_types(&self) -> &[&str] {
            &["text/plain"]
        }

        fn default_extension(&self) -> Option<&str> {
            Some("txt")
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::CREATE | Capabilities::EDIT
        }

        fn default_content(&self, _description: &ResourceDescription) -> Result<Vec<u8>> {
            Ok(b"default text".to_vec())
        }
    }

    #[derive(Debug)]
    struct ReadOnlyKit;

    impl ResourceKit for ReadOnlyKit {
        fn supported_content_types(&self) -> &[&str] {
            &["application/octet-stream"]
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::empty()
        }
    }

    fn description(content_type: Option<&str>) -> ResourceDescription {
        let mut description =
            ResourceDescription::new(ResourceUri::parse("/file.bin").unwrap());
        if let Some(content_type) = content_type {
            description.set_content_type(content_type);
        }
        description
    }

    #[test]
    fn kit_owned_by_one_session_at_a_time() {
        let handle = KitHandle::new(Arc::new(TextKit));
        let first = KitSession::new();
        let second = KitSession::new();

        first.install(Arc::clone(&handle), KitDefaults::default()).unwrap();
        assert!(matches!(
            second.install(Arc::clone(&handle), KitDefaults::default()),
            Err(Error::Configuration(_))
        ));

        first.uninstall(&handle).unwrap();
        second.install(handle, KitDefaults::default()).unwrap();
    }

    #[test]
    fn content_type_match_ignores_parameters() {
        let session = KitSession::new();
        session
            .install(KitHandle::new(Arc::new(TextKit)), KitDefaults::default())
            .unwrap();

        let kit = session
            .kit_for(
                &description(Some("text/plain; charset=utf-8")),
                Capabilities::empty(),
            )
            .unwrap();
        assert_eq!(kit.default_extension(), Some("txt"));
    }

    #[test]
    fn capability_requirements_are_enforced() {
        let session = KitSession::new();
        session
            .install(
                KitHandle::new(Arc::new(ReadOnlyKit)),
                KitDefaults::default(),
            )
            .unwrap();

        let described = description(Some("application/octet-stream"));
        assert!(session.kit_for(&described, Capabilities::empty()).is_some());
        assert!(session.kit_for(&described, Capabilities::CREATE).is_none());
    }

    #[test]
    fn default_kit_is_the_last_resort() {
        let session = KitSession::new();
        session
            .install(
                KitHandle::new(Arc::new(TextKit)),
                KitDefaults {
                    default: true,
                    collection_default: false,
                },
            )
            .unwrap();

        // No content type at all still resolves to the default kit.
        let kit = session
            .kit_for(&description(None), Capabilities::CREATE)
            .unwrap();
        assert_eq!(kit.default_extension(), Some("txt"));
    }

    #[test]
    fn created_resources_get_kit_defaults() {
        use crate::repo::FileRepository;

        let directory = tempfile::tempdir().unwrap();
        let root = ResourceUri::parse("/").unwrap();
        let repository = FileRepository::new(root.clone(), directory.path()).unwrap();

        let session = KitSession::new();
        session
            .install(KitHandle::new(Arc::new(TextKit)), KitDefaults::default())
            .unwrap();

        let uri = root.child("notes").unwrap();
        let created = session
            .create_resource(&repository, &uri, Some("text/plain"))
            .unwrap();

        // The kit appends its default extension and supplies the default content.
        let expected = root.child("notes.txt").unwrap();
        assert_eq!(created.uri(), &expected);
        assert_eq!(created.content_length(), b"default text".len() as u64);
        assert!(repository.exists(&expected).unwrap());
        assert!(!repository.exists(&uri).unwrap());
    }

    #[test]
    fn uninstalled_kits_are_forgotten() {
        let session = KitSession::new();
        let handle = KitHandle::new(Arc::new(TextKit));
        session
            .install(Arc::clone(&handle), KitDefaults::default())
            .unwrap();
        session.uninstall(&handle).unwrap();

        assert!(session
            .kit_for(&description(Some("text/plain")), Capabilities::empty())
            .is_none());
    }
}
