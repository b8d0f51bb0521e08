//! Data format identity and matching.
//!
//! A [`DataFormat`] names the semantic kind of a payload. It carries one
//! canonical name, any number of alias names for transports that know the
//! same format under a different native name, and an optional membership in
//! the small set of well-known [`Kind`]s.

use std::borrow::Cow;
use std::fmt;

/// The set of well-known payload kinds.
///
/// A transport that cannot express an exotic mime type can still negotiate
/// through the kind: two formats of the same well-known kind match even when
/// their native names differ.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Kind {
    /// No well-known classification.
    #[default]
    None,
    /// Uninterpreted bytes.
    Raw,
    /// Unicode text.
    Text,
    /// A list of URIs, one per line.
    UriList,
    /// An encoded image.
    Image,
}

impl Kind {
    /// The canonical format name for a well-known kind.
    ///
    /// [`Kind::None`] has no canonical name.
    pub fn canonical_name(self) -> Option<&'static str> {
        match self {
            Kind::None => None,
            Kind::Raw => Some("application/octet-stream"),
            Kind::Text => Some("text/plain;charset=utf-8"),
            Kind::UriList => Some("text/uri-list"),
            Kind::Image => Some("image/png"),
        }
    }
}

/// Identity of a payload's semantic kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataFormat {
    name: Cow<'static, str>,
    aliases: Vec<Cow<'static, str>>,
    kind: Kind,
}

impl DataFormat {
    /// A format with the given canonical name, no aliases and no well-known
    /// kind.
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self { name: name.into(), aliases: Vec::new(), kind: Kind::None }
    }

    /// The well-known raw-bytes format.
    pub fn raw() -> Self {
        Self::new(Kind::Raw.canonical_name().unwrap()).with_kind(Kind::Raw)
    }

    /// The well-known text format.
    ///
    /// Carries the bare `text/plain` alias since many producers advertise
    /// text without the charset parameter.
    pub fn text() -> Self {
        Self::new(Kind::Text.canonical_name().unwrap())
            .with_kind(Kind::Text)
            .with_alias("text/plain")
    }

    /// The well-known uri-list format.
    pub fn uri_list() -> Self {
        Self::new(Kind::UriList.canonical_name().unwrap()).with_kind(Kind::UriList)
    }

    /// The well-known image format.
    pub fn image() -> Self {
        Self::new(Kind::Image.canonical_name().unwrap()).with_kind(Kind::Image)
    }

    /// Attach a well-known kind.
    pub fn with_kind(mut self, kind: Kind) -> Self {
        self.kind = kind;
        self
    }

    /// Attach an alias name.
    pub fn with_alias(mut self, alias: impl Into<Cow<'static, str>>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    /// The canonical name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The alias names, in the order they were attached.
    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.aliases.iter().map(|alias| alias.as_ref())
    }

    /// The well-known kind, if any.
    #[inline]
    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// Whether two formats name the same logical payload kind.
    ///
    /// True when the canonical names are equal, when either format's alias
    /// set contains the other's canonical name, or when both resolve to the
    /// same well-known kind. The comparison is deliberately pairwise; no
    /// transitive closure over aliases is derived, so a transport may present
    /// several native names for one logical format without creating
    /// accidental equivalences.
    pub fn matches(&self, other: &DataFormat) -> bool {
        if self.name == other.name {
            return true;
        }

        if self.aliases.iter().any(|alias| *alias == other.name) {
            return true;
        }

        if other.aliases.iter().any(|alias| *alias == self.name) {
            return true;
        }

        self.kind != Kind::None && self.kind == other.kind
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_matches_both_directions() {
        let text = DataFormat::text();
        let plain = DataFormat::new("text/plain");
        assert!(text.matches(&plain));
        assert!(plain.matches(&text));
    }

    #[test]
    fn every_alias_matches_its_format() {
        let format = DataFormat::new("image/png")
            .with_alias("PNG")
            .with_alias("image/x-png");
        for alias in ["PNG", "image/x-png"] {
            assert!(format.matches(&DataFormat::new(alias.to_string())));
        }
    }

    #[test]
    fn unrelated_name_does_not_match() {
        let text = DataFormat::text();
        assert!(!text.matches(&DataFormat::new("audio/ogg")));
        assert!(!text.matches(&DataFormat::uri_list()));
    }

    #[test]
    fn same_kind_matches_across_names() {
        let theirs = DataFormat::new("UTF8_STRING").with_kind(Kind::Text);
        assert!(DataFormat::text().matches(&theirs));
    }

    #[test]
    fn kind_none_never_matches_by_kind() {
        let a = DataFormat::new("application/x-a");
        let b = DataFormat::new("application/x-b");
        assert!(!a.matches(&b));
    }

    #[test]
    fn aliases_do_not_chain() {
        // a aliases b, b aliases c: a and c are unrelated.
        let a = DataFormat::new("a").with_alias("b");
        let c = DataFormat::new("c");
        let b = DataFormat::new("b").with_alias("c");
        assert!(a.matches(&b));
        assert!(b.matches(&c));
        assert!(!a.matches(&c));
    }

    #[test]
    fn canonical_names_are_stable() {
        assert_eq!(Kind::Text.canonical_name(), Some("text/plain;charset=utf-8"));
        assert_eq!(Kind::None.canonical_name(), None);
    }
}
