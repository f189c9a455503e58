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

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::uri::ResourceUri;

/// The URI of the content length property.
pub const CONTENT_LENGTH: &str = "https://cairn.dev/ns/content-length";

/// The URI of the content type property.
pub const CONTENT_TYPE: &str = "https://cairn.dev/ns/content-type";

/// The URI of the content modified timestamp property.
pub const CONTENT_MODIFIED: &str = "https://cairn.dev/ns/content-modified";

/// The URI of the content created timestamp property.
pub const CONTENT_CREATED: &str = "https://cairn.dev/ns/content-created";

/// The URI of the resource type property.
pub const RESOURCE_TYPE: &str = "https://cairn.dev/ns/resource-type";

/// A standard resource property with a well-known URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StandardProperty {
    ContentLength,
    ContentType,
    ContentModified,
    ContentCreated,
    ResourceType,
}

impl StandardProperty {
    /// Return the property URI of this standard property.
    pub const fn uri(self) -> &'static str {
        match self {
            StandardProperty::ContentLength => CONTENT_LENGTH,
            StandardProperty::ContentType => CONTENT_TYPE,
            StandardProperty::ContentModified => CONTENT_MODIFIED,
            StandardProperty::ContentCreated => CONTENT_CREATED,
            StandardProperty::ResourceType => RESOURCE_TYPE,
        }
    }

    /// Return the standard property with the given property `uri`, if there is one.
    pub fn from_uri(uri: &str) -> Option<Self> {
        BY_URI.get(uri).copied()
    }
}

/// The table of standard properties by URI, constructed once at first use.
static BY_URI: Lazy<HashMap<&'static str, StandardProperty>> = Lazy::new(|| {
    [
        StandardProperty::ContentLength,
        StandardProperty::ContentType,
        StandardProperty::ContentModified,
        StandardProperty::ContentCreated,
        StandardProperty::ResourceType,
    ]
    .into_iter()
    .map(|property| (property.uri(), property))
    .collect()
});

/// A resource property: a property URI and an ordered sequence of values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    /// The URI identifying the property.
    pub uri: String,

    /// The ordered values of the property.
    pub values: Vec<String>,
}

impl Property {
    /// Create a property with a single value.
    pub fn new(uri: impl Into<String>, value: impl Into<String>) -> Self {
        Property {
            uri: uri.into(),
            values: vec![value.into()],
        }
    }
}

/// A description of a resource: an ordered property bag attached to exactly one resource URI.
///
/// Keys are unique by property URI; each key maps to an ordered sequence of values. Descriptions
/// are created transiently on every description read and mutated through the repository's
/// property operations, which translate the changes into backend-specific writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescription {
    uri: ResourceUri,
    properties: Vec<Property>,
}

impl ResourceDescription {
    /// Create an empty description for the resource at `uri`.
    pub fn new(uri: ResourceUri) -> Self {
        ResourceDescription {
            uri,
            properties: Vec::new(),
        }
    }

    /// Return the URI of the resource this description is attached to.
    pub fn uri(&self) -> &ResourceUri {
        &self.uri
    }

    /// Return the first value of the property with the given `uri`.
    pub fn get(&self, uri: &str) -> Option<&str> {
        self.property(uri)
            .and_then(|property| property.values.first())
            .map(String::as_str)
    }

    /// Return the ordered values of the property with the given `uri`.
    pub fn values(&self, uri: &str) -> &[String] {
        self.property(uri)
            .map(|property| property.values.as_slice())
            .unwrap_or_default()
    }

    /// Return the property with the given `uri`.
    pub fn property(&self, uri: &str) -> Option<&Property> {
        self.properties.iter().find(|property| property.uri == uri)
    }

    /// Set the property with the given `uri` to a single `value`, replacing any existing values.
    pub fn set(&mut self, uri: impl Into<String>, value: impl Into<String>) {
        self.set_property(Property::new(uri, value));
    }

    /// Set a property, replacing any existing property with the same URI.
    ///
    /// A property with no values removes the key.
    pub fn set_property(&mut self, property: Property) {
        if property.values.is_empty() {
            self.remove(&property.uri);
            return;
        }
        match self
            .properties
            .iter_mut()
            .find(|existing| existing.uri == property.uri)
        {
            Some(existing) => *existing = property,
            None => self.properties.push(property),
        }
    }

    /// Append a value to the property with the given `uri`, creating it if necessary.
    pub fn add(&mut self, uri: impl Into<String>, value: impl Into<String>) {
        let uri = uri.into();
        match self
            .properties
            .iter_mut()
            .find(|existing| existing.uri == uri)
        {
            Some(existing) => existing.values.push(value.into()),
            None => self.properties.push(Property::new(uri, value)),
        }
    }

    /// Remove the property with the given `uri`, returning it if it was present.
    pub fn remove(&mut self, uri: &str) -> Option<Property> {
        let index = self
            .properties
            .iter()
            .position(|property| property.uri == uri)?;
        Some(self.properties.remove(index))
    }

    /// Return the properties in insertion order.
    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    /// Return the properties which are not standard derivable properties.
    ///
    /// These are the properties which must be preserved when a resource is overwritten, copied,
    /// or moved.
    pub fn custom_properties(&self) -> impl Iterator<Item = &Property> {
        self.properties
            .iter()
            .filter(|property| StandardProperty::from_uri(&property.uri).is_none())
    }

    /// Return the content length of the resource.
    ///
    /// This is `0` if the property is absent, which is the case for collections without a
    /// content override.
    pub fn content_length(&self) -> u64 {
        self.get(CONTENT_LENGTH)
            .and_then(|value| value.parse().ok())
            .unwrap_or(0)
    }

    /// Set the content length of the resource.
    pub fn set_content_length(&mut self, length: u64) {
        self.set(CONTENT_LENGTH, length.to_string());
    }

    /// Return the content type of the resource.
    pub fn content_type(&self) -> Option<&str> {
        self.get(CONTENT_TYPE)
    }

    /// Set the content type of the resource.
    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.set(CONTENT_TYPE, content_type);
    }

    /// Return the time the resource content was last modified.
    ///
    /// This is optional for collections.
    pub fn content_modified(&self) -> Option<SystemTime> {
        self.get(CONTENT_MODIFIED).and_then(parse_timestamp)
    }

    /// Set the time the resource content was last modified.
    ///
    /// If the recorded creation time is later than `modified`, it is moved back to `modified` so
    /// that a resource is never created after it was modified.
    pub fn set_content_modified(&mut self, modified: SystemTime) {
        self.set(CONTENT_MODIFIED, format_timestamp(modified));
        if let Some(created) = self.content_created() {
            if created > modified {
                self.set(CONTENT_CREATED, format_timestamp(modified));
            }
        }
    }

    /// Return the time the resource content was created.
    pub fn content_created(&self) -> Option<SystemTime> {
        self.get(CONTENT_CREATED).and_then(parse_timestamp)
    }

    /// Set the time the resource content was created.
    ///
    /// The creation time is clamped to the recorded modification time, since content can never
    /// be created after it was last modified.
    pub fn set_content_created(&mut self, created: SystemTime) {
        let created = match self.content_modified() {
            Some(modified) if created > modified => modified,
            _ => created,
        };
        self.set(CONTENT_CREATED, format_timestamp(created));
    }

    /// Return the resource type URIs of the resource.
    pub fn resource_types(&self) -> &[String] {
        self.values(RESOURCE_TYPE)
    }
}

/// Format a timestamp as whole milliseconds since the Unix epoch.
pub fn format_timestamp(time: SystemTime) -> String {
    time.duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
        .to_string()
}

/// Parse a timestamp in whole milliseconds since the Unix epoch.
pub fn parse_timestamp(value: &str) -> Option<SystemTime> {
    let millis: u64 = value.parse().ok()?;
    UNIX_EPOCH.checked_add(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn description() -> ResourceDescription {
        ResourceDescription::new(ResourceUri::parse("/test.bin").unwrap())
    }

    #[test]
    fn keys_are_unique_by_uri() {
        let mut description = description();
        description.set("urn:example:color", "red");
        description.set("urn:example:color", "blue");

        assert_eq!(description.get("urn:example:color"), Some("blue"));
        assert_eq!(description.properties().len(), 1);
    }

    #[test]
    fn values_are_ordered() {
        let mut description = description();
        description.add("urn:example:tag", "first");
        description.add("urn:example:tag", "second");

        assert_eq!(description.values("urn:example:tag"), ["first", "second"]);
    }

    #[test]
    fn removed_properties_are_absent() {
        let mut description = description();
        description.set("urn:example:color", "red");

        assert!(description.remove("urn:example:color").is_some());
        assert_eq!(description.get("urn:example:color"), None);
        assert!(description.remove("urn:example:color").is_none());
    }

    #[test]
    fn content_length_defaults_to_zero() {
        assert_eq!(description().content_length(), 0);

        let mut description = description();
        description.set_content_length(1025);
        assert_eq!(description.content_length(), 1025);
    }

    #[test]
    fn created_never_later_than_modified() {
        let modified = UNIX_EPOCH + Duration::from_secs(100);
        let later = UNIX_EPOCH + Duration::from_secs(200);

        let mut description = description();
        description.set_content_modified(modified);
        description.set_content_created(later);

        assert_eq!(description.content_created(), Some(modified));

        description.set_content_created(later);
        description.set_content_modified(modified);
        assert!(description.content_created() <= description.content_modified());
    }

    #[test]
    fn custom_properties_exclude_standard_ones() {
        let mut description = description();
        description.set_content_length(10);
        description.set("urn:example:color", "red");

        let custom: Vec<_> = description.custom_properties().collect();
        assert_eq!(custom.len(), 1);
        assert_eq!(custom[0].uri, "urn:example:color");
    }

    #[test]
    fn standard_property_lookup_by_uri() {
        assert_eq!(
            StandardProperty::from_uri(CONTENT_LENGTH),
            Some(StandardProperty::ContentLength)
        );
        assert_eq!(StandardProperty::from_uri("urn:example:color"), None);
    }
}
