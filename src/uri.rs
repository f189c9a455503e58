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

//! Resource addressing.
//!
//! Resources are addressed by absolute, hierarchical [`ResourceUri`] values. A URI ending in the
//! path separator `/` denotes a *collection*, which may have child resources; all other URIs
//! denote *non-collection* resources. A collection and a non-collection resource never coexist at
//! the same name; the two forms are distinct URIs and repositories enforce the disambiguation on
//! creation and deletion.

use std::fmt;

use crate::error::{Error, Result};

/// The path separator in resource URIs.
pub const SEPARATOR: char = '/';

/// An absolute, hierarchical resource URI.
///
/// A `ResourceUri` is either a plain absolute path such as `/photos/cat.jpg` or a full URI with a
/// scheme such as `https://example.com/photos/`. Whether the URI denotes a collection is encoded
/// solely by a trailing `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceUri(String);

impl ResourceUri {
    /// Parse a resource URI from the given string.
    ///
    /// # Errors
    /// - `Error::InvalidUri`: The string is empty, contains whitespace, is not absolute, or
    /// contains an empty path segment.
    pub fn parse(uri: impl Into<String>) -> Result<Self> {
        let uri = uri.into();

        if uri.is_empty() || uri.chars().any(char::is_whitespace) {
            return Err(Error::InvalidUri(uri));
        }

        let path = match path_start(&uri) {
            Some(start) => &uri[start..],
            None => return Err(Error::InvalidUri(uri)),
        };

        // Empty and self-referential segments would make parent/child resolution ambiguous and
        // allow escaping a repository's backing namespace.
        if path[1..]
            .split_terminator(SEPARATOR)
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return Err(Error::InvalidUri(uri));
        }

        Ok(ResourceUri(uri))
    }

    /// Return this URI as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Return whether this URI denotes a collection.
    pub fn is_collection(&self) -> bool {
        self.0.ends_with(SEPARATOR)
    }

    /// Return the hierarchical path of this URI, starting at the root `/`.
    ///
    /// For a URI without a scheme this is the whole URI.
    pub fn path(&self) -> &str {
        // Validated by `parse`.
        &self.0[path_start(&self.0).unwrap()..]
    }

    /// Return the decoded name of the resource, which is its final path segment.
    ///
    /// The name of a collection does not include the trailing separator. The name of a root
    /// collection is the empty string.
    pub fn name(&self) -> String {
        let path = self.path().trim_end_matches(SEPARATOR);
        match path.rfind(SEPARATOR) {
            Some(index) => decode(&path[index + 1..]),
            None => String::new(),
        }
    }

    /// Return the URI of this resource's parent collection.
    ///
    /// This returns `None` if this URI is a root collection.
    pub fn parent(&self) -> Option<ResourceUri> {
        let trimmed = self.0.trim_end_matches(SEPARATOR);
        if trimmed.len() < path_start(&self.0).unwrap() + 1 {
            return None;
        }
        trimmed
            .rfind(SEPARATOR)
            .map(|index| ResourceUri(self.0[..index + 1].to_owned()))
    }

    /// Resolve the non-collection child resource with the given `name`.
    ///
    /// # Errors
    /// - `Error::InvalidUri`: This URI is not a collection, or `name` is empty or contains a
    /// path separator.
    pub fn child(&self, name: &str) -> Result<ResourceUri> {
        self.check_child(name)?;
        Ok(ResourceUri(format!("{}{}", self.0, name)))
    }

    /// Resolve the child collection with the given `name`.
    ///
    /// # Errors
    /// - `Error::InvalidUri`: This URI is not a collection, or `name` is empty or contains a
    /// path separator.
    pub fn child_collection(&self, name: &str) -> Result<ResourceUri> {
        self.check_child(name)?;
        Ok(ResourceUri(format!("{}{}{}", self.0, name, SEPARATOR)))
    }

    fn check_child(&self, name: &str) -> Result<()> {
        if !self.is_collection() || name.is_empty() || name.contains(SEPARATOR) {
            return Err(Error::InvalidUri(format!("{}{}", self.0, name)));
        }
        Ok(())
    }

    /// Return the path of this URI relative to the collection URI `base`.
    ///
    /// This returns `None` if this URI does not fall under `base`. The relative path of `base`
    /// itself is the empty string.
    pub fn relative_to(&self, base: &ResourceUri) -> Option<&str> {
        if !base.is_collection() {
            return None;
        }
        self.0.strip_prefix(base.as_str())
    }

    /// Return whether this URI falls strictly under the collection URI `base`.
    pub fn is_descendant_of(&self, base: &ResourceUri) -> bool {
        match self.relative_to(base) {
            Some(relative) => !relative.is_empty(),
            None => false,
        }
    }

    /// Return the number of hierarchy levels separating this URI from the collection URI `base`.
    ///
    /// A direct child is at depth 1. This returns `None` if this URI does not fall under `base`.
    pub fn depth_below(&self, base: &ResourceUri) -> Option<u32> {
        let relative = self.relative_to(base)?;
        if relative.is_empty() {
            return Some(0);
        }
        let separators = relative.matches(SEPARATOR).count() as u32;
        if relative.ends_with(SEPARATOR) {
            Some(separators)
        } else {
            Some(separators + 1)
        }
    }

    /// Return the collection form of this URI.
    pub fn as_collection(&self) -> ResourceUri {
        if self.is_collection() {
            self.clone()
        } else {
            ResourceUri(format!("{}{}", self.0, SEPARATOR))
        }
    }

    /// Return the non-collection form of this URI.
    ///
    /// This returns `None` for a root collection, which has no non-collection form.
    pub fn as_non_collection(&self) -> Option<ResourceUri> {
        if !self.is_collection() {
            return Some(self.clone());
        }
        let trimmed = self.0.trim_end_matches(SEPARATOR);
        if trimmed.len() < path_start(&self.0).unwrap() + 1 {
            None
        } else {
            Some(ResourceUri(trimmed.to_owned()))
        }
    }
}

impl fmt::Display for ResourceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ResourceUri {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Return the index at which the hierarchical path of `uri` begins, or `None` if the URI has no
/// absolute path.
fn path_start(uri: &str) -> Option<usize> {
    if uri.starts_with(SEPARATOR) {
        return Some(0);
    }
    let authority = uri.find("://")? + 3;
    uri[authority..]
        .find(SEPARATOR)
        .map(|index| authority + index)
}

/// Percent-decode the given URI segment.
pub(crate) fn decode(segment: &str) -> String {
    let bytes = segment.as_bytes();
    let mut output = Vec::with_capacity(bytes.len());
    let mut index = 0;

    while index < bytes.len() {
        match bytes[index] {
            b'%' if index + 2 < bytes.len() => {
                match u8::from_str_radix(segment.get(index + 1..index + 3).unwrap_or(""), 16) {
                    Ok(byte) => {
                        output.push(byte);
                        index += 3;
                    }
                    Err(_) => {
                        output.push(b'%');
                        index += 1;
                    }
                }
            }
            byte => {
                output.push(byte);
                index += 1;
            }
        }
    }

    String::from_utf8_lossy(&output).into_owned()
}

/// Percent-encode a resource name for use as a single URI path segment.
///
/// The escape character and characters which cannot appear in a resource URI are escaped as
/// `%XX`, so any backing-store name produces a parseable URI and survives a round trip through
/// [`ResourceUri::name`].
pub fn encode_segment(name: &str) -> String {
    let mut output = String::with_capacity(name.len());

    for character in name.chars() {
        if character == '%' || character.is_whitespace() || character.is_control() {
            let mut buffer = [0u8; 4];
            for byte in character.encode_utf8(&mut buffer).bytes() {
                output.push_str(&format!("%{:02X}", byte));
            }
        } else {
            output.push(character);
        }
    }

    output
}

/// Encode a resource path as a single file name.
///
/// The encoding is deterministic and collision-free across the addressable namespace: every byte
/// outside `[A-Za-z0-9._-]` is escaped as `%XX`, so distinct paths always produce distinct file
/// names while the original name extension is preserved. This is used to derive cache file names.
pub fn encode_file_name(path: &str) -> String {
    let mut output = String::with_capacity(path.len());

    for byte in path.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                output.push(byte as char)
            }
            _ => output.push_str(&format!("%{:02X}", byte)),
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_invalid_uris() {
        assert!(matches!(ResourceUri::parse(""), Err(Error::InvalidUri(_))));
        assert!(matches!(
            ResourceUri::parse("relative/path"),
            Err(Error::InvalidUri(_))
        ));
        assert!(matches!(
            ResourceUri::parse("/with space"),
            Err(Error::InvalidUri(_))
        ));
        assert!(matches!(
            ResourceUri::parse("/a//b"),
            Err(Error::InvalidUri(_))
        ));
    }

    #[test]
    fn parse_accepts_absolute_uris() {
        assert!(ResourceUri::parse("/").is_ok());
        assert!(ResourceUri::parse("/a/b.txt").is_ok());
        assert!(ResourceUri::parse("https://example.com/a/").is_ok());
    }

    #[test]
    fn trailing_separator_denotes_collection() {
        let collection = ResourceUri::parse("/test/").unwrap();
        let resource = ResourceUri::parse("/test").unwrap();

        assert!(collection.is_collection());
        assert!(!resource.is_collection());
        assert_ne!(collection, resource);
    }

    #[test]
    fn name_is_final_segment() {
        assert_eq!(ResourceUri::parse("/a/b.txt").unwrap().name(), "b.txt");
        assert_eq!(ResourceUri::parse("/a/b/").unwrap().name(), "b");
        assert_eq!(ResourceUri::parse("/").unwrap().name(), "");
        assert_eq!(ResourceUri::parse("/a%20b").unwrap().name(), "a b");
    }

    #[test]
    fn parent_of_child_is_collection() {
        let uri = ResourceUri::parse("/a/b/c.txt").unwrap();
        assert_eq!(uri.parent(), Some(ResourceUri::parse("/a/b/").unwrap()));

        let collection = ResourceUri::parse("/a/b/").unwrap();
        assert_eq!(
            collection.parent(),
            Some(ResourceUri::parse("/a/").unwrap())
        );

        assert_eq!(ResourceUri::parse("/").unwrap().parent(), None);
    }

    #[test]
    fn parent_stops_at_scheme_root() {
        let root = ResourceUri::parse("https://example.com/").unwrap();
        assert_eq!(root.parent(), None);

        let child = ResourceUri::parse("https://example.com/a").unwrap();
        assert_eq!(child.parent(), Some(root));
    }

    #[test]
    fn child_resolution_requires_collection() {
        let collection = ResourceUri::parse("/test/").unwrap();
        assert_eq!(
            collection.child("a.bin").unwrap(),
            ResourceUri::parse("/test/a.bin").unwrap()
        );
        assert_eq!(
            collection.child_collection("sub").unwrap(),
            ResourceUri::parse("/test/sub/").unwrap()
        );

        let resource = ResourceUri::parse("/test").unwrap();
        assert!(resource.child("a.bin").is_err());
        assert!(collection.child("a/b").is_err());
    }

    #[test]
    fn relative_path_computation() {
        let base = ResourceUri::parse("/a/").unwrap();
        let uri = ResourceUri::parse("/a/b/c.txt").unwrap();

        assert_eq!(uri.relative_to(&base), Some("b/c.txt"));
        assert_eq!(base.relative_to(&base), Some(""));
        assert_eq!(
            ResourceUri::parse("/x/").unwrap().relative_to(&base),
            None
        );
    }

    #[test]
    fn depth_counts_hierarchy_levels() {
        let base = ResourceUri::parse("/a/").unwrap();

        assert_eq!(
            ResourceUri::parse("/a/b").unwrap().depth_below(&base),
            Some(1)
        );
        assert_eq!(
            ResourceUri::parse("/a/b/").unwrap().depth_below(&base),
            Some(1)
        );
        assert_eq!(
            ResourceUri::parse("/a/b/c").unwrap().depth_below(&base),
            Some(2)
        );
        assert_eq!(base.depth_below(&base), Some(0));
    }

    #[test]
    fn collection_form_round_trip() {
        let resource = ResourceUri::parse("/a/b").unwrap();
        let collection = resource.as_collection();

        assert!(collection.is_collection());
        assert_eq!(collection.as_non_collection(), Some(resource));
        assert_eq!(ResourceUri::parse("/").unwrap().as_non_collection(), None);
    }

    #[test]
    fn encoded_segments_parse_and_decode_back() {
        let encoded = encode_segment("a b%c.txt");

        assert_eq!(encoded, "a%20b%25c.txt");
        let uri = ResourceUri::parse(format!("/{}", encoded)).unwrap();
        assert_eq!(uri.name(), "a b%c.txt");
    }

    #[test]
    fn encoded_file_names_are_distinct() {
        let first = encode_file_name("a/b.txt");
        let second = encode_file_name("a%2Fb.txt");

        assert_ne!(first, second);
        assert!(first.ends_with(".txt"));
    }
}
