use std::collections::HashMap;
use std::str::FromStr;

use crate::controls::Control;
use crate::result::{LdapError, Result};

use lber::common::TagClass;
use lber::structure::StructureTag;
use lber::structures::{ASNTag, OctetString, Sequence, Set, Tag};

/// Possible values for search scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    /// Base object; search only the object named in the base DN.
    Base = 0,
    /// Search the objects immediately below the base DN.
    OneLevel = 1,
    /// Search the object named in the base DN and the whole subtree below it.
    Subtree = 2,
}

impl FromStr for Scope {
    type Err = LdapError;

    /// Parse the scope component of an LDAP URL.
    fn from_str(s: &str) -> Result<Scope> {
        match s {
            "" | "base" => Ok(Scope::Base),
            "one" => Ok(Scope::OneLevel),
            "sub" => Ok(Scope::Subtree),
            _ => Err(LdapError::InvalidScopeString(s.to_owned())),
        }
    }
}

/// Possible values for alias dereferencing during search.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DerefAliases {
    /// Never dereference.
    #[default]
    Never = 0,
    /// Dereference while retrieving objects according to search scope.
    Searching = 1,
    /// Dereference while finding the base object.
    Finding = 2,
    /// Always dereference.
    Always = 3,
}

/// Wrapper for the internal structure of a result entry.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ResultEntry(pub StructureTag, pub Vec<Control>);

impl ResultEntry {
    #[doc(hidden)]
    pub fn new(st: StructureTag) -> ResultEntry {
        ResultEntry(st, vec![])
    }

    /// Returns true if the enclosed entry is a referral.
    pub fn is_ref(&self) -> bool {
        self.0.id == 19
    }

    /// Returns true if the enclosed entry is an intermediate message.
    pub fn is_intermediate(&self) -> bool {
        self.0.id == 25
    }
}

/// Additional parameters for the Search operation.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct SearchOptions {
    pub deref: DerefAliases,
    pub typesonly: bool,
    pub timelimit: i32,
    pub sizelimit: i32,
}

impl SearchOptions {
    /// Create an instance of the structure with default values.
    pub fn new() -> Self {
        SearchOptions {
            ..Default::default()
        }
    }

    /// Set the method for dereferencing aliases.
    pub fn deref(mut self, d: DerefAliases) -> Self {
        self.deref = d;
        self
    }

    /// Set the indicator of returning just attribute names (`true`) vs. names and values (`false`).
    pub fn typesonly(mut self, typesonly: bool) -> Self {
        self.typesonly = typesonly;
        self
    }

    /// Set the time limit, in seconds, for the whole search operation.
    ///
    /// This is a server-side limit of the elapsed time for performing the operation, _not_ a
    /// network timeout for retrieving result entries or the result of the whole operation.
    pub fn timelimit(mut self, timelimit: i32) -> Self {
        self.timelimit = timelimit;
        self
    }

    /// Set the size limit, in entries, for the whole search operation.
    pub fn sizelimit(mut self, sizelimit: i32) -> Self {
        self.sizelimit = sizelimit;
        self
    }
}

/// Parsed search result entry.
///
/// While LDAP attributes can have a variety of syntaxes, they're all returned in
/// search results as octet strings, without any associated type information. A
/// general-purpose result parser could leave all values in that format, but then
/// retrieving them from user code would be cumbersome and tedious.
///
/// For that reason, the parser tries to convert every value into a `String`. If an
/// attribute can contain unconstrained binary strings, the conversion may fail. In that case,
/// the attribute and all its values will be in the `bin_attrs` hashmap. Since it's
/// possible that a particular set of values for a binary attribute _could_ be
/// converted into UTF-8 `String`s, the presence of such an attribute in the result
/// entry should be checked for both in `attrs` and `bin_atrrs`.
#[derive(Debug, Clone)]
pub struct SearchEntry {
    /// Entry DN.
    pub dn: String,
    /// Attributes.
    pub attrs: HashMap<String, Vec<String>>,
    /// Binary-valued attributes.
    pub bin_attrs: HashMap<String, Vec<Vec<u8>>>,
}

fn entry_error(what: &str) -> LdapError {
    LdapError::SocketReceive(format!("malformed search entry: {}", what))
}

impl SearchEntry {
    /// Parse raw BER data and convert it into attribute map(s).
    pub fn construct(re: ResultEntry) -> Result<SearchEntry> {
        let mut tags =
            re.0.match_id(4)
                .and_then(|t| t.expect_constructed())
                .ok_or_else(|| entry_error("not an entry"))?
                .into_iter();
        let dn = tags
            .next()
            .and_then(|t| t.expect_primitive())
            .ok_or_else(|| entry_error("dn"))?;
        let dn = String::from_utf8(dn).map_err(|_| LdapError::DecodingUTF8)?;
        let mut attr_vals = HashMap::new();
        let mut bin_attr_vals = HashMap::new();
        let attrs = tags
            .next()
            .and_then(|t| t.expect_constructed())
            .ok_or_else(|| entry_error("attributes"))?;
        for a_v in attrs {
            let mut part_attr = a_v
                .expect_constructed()
                .ok_or_else(|| entry_error("partial attribute"))?
                .into_iter();
            let a_type = part_attr
                .next()
                .and_then(|t| t.expect_primitive())
                .and_then(|v| String::from_utf8(v).ok())
                .ok_or_else(|| entry_error("attribute type"))?;
            let raw_values = part_attr
                .next()
                .and_then(|t| t.expect_constructed())
                .ok_or_else(|| entry_error("values"))?
                .into_iter()
                .map(|t| t.expect_primitive().ok_or_else(|| entry_error("value")))
                .collect::<Result<Vec<Vec<u8>>>>()?;
            if raw_values.iter().all(|v| std::str::from_utf8(v).is_ok()) {
                let values = raw_values
                    .into_iter()
                    .filter_map(|v| String::from_utf8(v).ok())
                    .collect();
                attr_vals.insert(a_type, values);
            } else {
                bin_attr_vals.insert(a_type, raw_values);
            }
        }
        Ok(SearchEntry {
            dn,
            attrs: attr_vals,
            bin_attrs: bin_attr_vals,
        })
    }
}

/// Build a SearchResultEntry protocol op.
pub(crate) fn entry_tag(dn: &str, attrs: Vec<(String, Vec<Vec<u8>>)>) -> StructureTag {
    Tag::Sequence(Sequence {
        id: 4,
        class: TagClass::Application,
        inner: vec![
            Tag::OctetString(OctetString {
                inner: Vec::from(dn.as_bytes()),
                ..Default::default()
            }),
            Tag::Sequence(Sequence {
                inner: attrs
                    .into_iter()
                    .map(|(name, values)| {
                        Tag::Sequence(Sequence {
                            inner: vec![
                                Tag::OctetString(OctetString {
                                    inner: name.into_bytes(),
                                    ..Default::default()
                                }),
                                Tag::Set(Set {
                                    inner: values
                                        .into_iter()
                                        .map(|v| {
                                            Tag::OctetString(OctetString {
                                                inner: v,
                                                ..Default::default()
                                            })
                                        })
                                        .collect(),
                                    ..Default::default()
                                }),
                            ],
                            ..Default::default()
                        })
                    })
                    .collect(),
                ..Default::default()
            }),
        ],
    })
    .into_structure()
}

/// Parse the referrals from the supplied BER-encoded sequence.
pub fn parse_refs(t: StructureTag) -> Result<Vec<String>> {
    t.expect_constructed()
        .ok_or_else(|| LdapError::SocketReceive("malformed referrals".into()))?
        .into_iter()
        .map(|t| {
            t.expect_primitive()
                .and_then(|v| String::from_utf8(v).ok())
                .ok_or_else(|| LdapError::SocketReceive("malformed referral URL".into()))
        })
        .collect()
}
