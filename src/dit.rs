//! In-memory directory used by the mock strategies.
//!
//! A [`Dit`](struct.Dit.html) is a map from normalized DN to entry. Entries keep
//! their attribute names as given, but attribute lookup is case-insensitive.
//! An optional [`MockSchema`](struct.MockSchema.html) adds single-value and
//! object class checks to every change.
//!
//! The directory is usually handed to [`Server::mock()`](crate::Server::mock),
//! which shares it between all mock connections to that server.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::filter::{AttributeAssertion, Filter, FilterNode, SubstringAssertion};
use crate::request::{Change, ModOp};
use crate::search::Scope;
use crate::util::{is_descendant, normalize_dn, parent_dn, parse_rdn, split_dn};

use regex::bytes::RegexBuilder;
use thiserror::Error;

const ENTRY_DN: &str = "entryDN";
const OBJECT_CLASS: &str = "objectclass";
const USER_PASSWORD: &str = "userpassword";

/// Failure of a directory operation, mapped to an LDAP result code by
/// [`rc()`](#method.rc).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DitError {
    #[error("entry already exists")]
    Exists,
    #[error("no such object")]
    NoSuchObject,
    #[error("attribute {0} is single-valued")]
    SingleValued(String),
    #[error("unknown object class {0}")]
    UnknownClass(String),
    #[error("invalid DN: {0}")]
    InvalidDn(String),
    #[error("entry has subordinates")]
    NotLeaf,
    #[error("no such attribute or value: {0}")]
    NoSuchAttribute(String),
    #[error("value already exists in attribute {0}")]
    ValueExists(String),
    #[error("not allowed on RDN attribute {0}")]
    NotAllowedOnRdn(String),
    #[error("unwilling to perform: {0}")]
    Unwilling(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("{0}")]
    InvalidCredentials(String),
    #[error("unsupported by the mock directory: {0}")]
    Unsupported(String),
}

impl DitError {
    /// LDAP result code of the error.
    ///
    /// The mock strategy reports `Unsupported` as an error rather than a result.
    pub fn rc(&self) -> u32 {
        match self {
            DitError::Protocol(_) => 2,
            DitError::NoSuchAttribute(_) => 16,
            DitError::SingleValued(_) => 19,
            DitError::ValueExists(_) => 20,
            DitError::NoSuchObject => 32,
            DitError::InvalidDn(_) => 34,
            DitError::InvalidCredentials(_) => 49,
            DitError::Unwilling(_) => 53,
            DitError::UnknownClass(_) => 65,
            DitError::NotLeaf => 66,
            DitError::NotAllowedOnRdn(_) => 67,
            DitError::Exists => 68,
            DitError::Unsupported(_) => 80,
        }
    }
}

type DitResult<T> = std::result::Result<T, DitError>;

/// One attribute of an entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub values: Vec<Vec<u8>>,
}

/// Directory entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    dn: String,
    attrs: BTreeMap<String, Attribute>,
}

impl Entry {
    fn new(dn: &str) -> Entry {
        Entry {
            dn: dn.to_owned(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn dn(&self) -> &str {
        &self.dn
    }

    /// Attribute by name, case-insensitively.
    pub fn get(&self, attr: &str) -> Option<&Attribute> {
        self.attrs.get(&attr.to_lowercase())
    }

    pub fn attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attrs.values()
    }

    /// True for attributes the directory maintains itself.
    pub fn is_operational(attr: &str) -> bool {
        attr.eq_ignore_ascii_case(ENTRY_DN)
    }

    fn values_mut(&mut self, attr: &str) -> &mut Vec<Vec<u8>> {
        &mut self
            .attrs
            .entry(attr.to_lowercase())
            .or_insert_with(|| Attribute {
                name: attr.to_owned(),
                values: vec![],
            })
            .values
    }

    /// Add a value unless an equal one is present. Returns false if it was.
    fn add_value(&mut self, attr: &str, val: Vec<u8>) -> bool {
        let values = self.values_mut(attr);
        if values.iter().any(|v| values_match(v, &val)) {
            return false;
        }
        values.push(val);
        true
    }

    fn drop_empty(&mut self) {
        self.attrs.retain(|_, a| !a.values.is_empty());
    }
}

/// Equality used throughout the mock: raw bytes, then integer value, then
/// case-insensitive text.
fn values_match(stored: &[u8], asserted: &[u8]) -> bool {
    if stored == asserted {
        return true;
    }
    let (s, a) = match (std::str::from_utf8(stored), std::str::from_utf8(asserted)) {
        (Ok(s), Ok(a)) => (s.trim(), a.trim()),
        _ => return false,
    };
    if let (Ok(s), Ok(a)) = (s.parse::<i64>(), a.parse::<i64>()) {
        return s == a;
    }
    s.to_lowercase() == a.to_lowercase()
}

#[derive(Clone, Debug)]
struct AttributeDef {
    single_valued: bool,
}

#[derive(Clone, Debug)]
struct ClassDef {
    name: String,
    superiors: Vec<String>,
}

/// Minimal schema for a mock directory.
///
/// Attribute types not listed are accepted as multi-valued. If any object
/// class is listed, unknown classes are rejected.
#[derive(Clone, Debug, Default)]
pub struct MockSchema {
    attributes: HashMap<String, AttributeDef>,
    classes: HashMap<String, ClassDef>,
}

impl MockSchema {
    pub fn new() -> MockSchema {
        MockSchema::default()
    }

    pub fn with_attribute(mut self, name: &str, single_valued: bool) -> Self {
        self.attributes
            .insert(name.to_lowercase(), AttributeDef { single_valued });
        self
    }

    pub fn with_class(mut self, name: &str, superiors: &[&str]) -> Self {
        self.classes.insert(
            name.to_lowercase(),
            ClassDef {
                name: name.to_owned(),
                superiors: superiors.iter().map(|s| s.to_string()).collect(),
            },
        );
        self
    }

    fn is_single_valued(&self, attr: &str) -> bool {
        self.attributes
            .get(&attr.to_lowercase())
            .map(|a| a.single_valued)
            .unwrap_or(false)
    }

    /// Full set of classes implied by `classes`, superiors after their subclasses.
    fn expand(&self, classes: &[Vec<u8>]) -> DitResult<Vec<Vec<u8>>> {
        let mut out: Vec<Vec<u8>> = vec![];
        let mut pending = classes
            .iter()
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect::<Vec<_>>();
        pending.reverse();
        while let Some(class) = pending.pop() {
            let name = match self.classes.get(&class.to_lowercase()) {
                Some(def) => {
                    pending.extend(def.superiors.iter().rev().cloned());
                    def.name.clone()
                }
                None if self.classes.is_empty() => class,
                None => return Err(DitError::UnknownClass(class)),
            };
            if !out.iter().any(|v| values_match(v, name.as_bytes())) {
                out.push(name.into_bytes());
            }
        }
        Ok(out)
    }

    fn validate(&self, entry: &mut Entry) -> DitResult<()> {
        for attr in entry.attrs.values() {
            if attr.values.len() > 1 && self.is_single_valued(&attr.name) {
                return Err(DitError::SingleValued(attr.name.clone()));
            }
        }
        if let Some(oc) = entry.attrs.get_mut(OBJECT_CLASS) {
            oc.values = self.expand(&oc.values)?;
        }
        Ok(())
    }
}

/// The in-memory directory tree.
#[derive(Clone, Debug, Default)]
pub struct Dit {
    entries: BTreeMap<String, Entry>,
    schema: Option<MockSchema>,
}

impl Dit {
    pub fn new() -> Dit {
        Dit::default()
    }

    pub fn with_schema(mut self, schema: MockSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, dn: &str) -> Option<&Entry> {
        self.entries.get(&normalize_dn(dn))
    }

    pub fn contains(&self, dn: &str) -> bool {
        self.entries.contains_key(&normalize_dn(dn))
    }

    fn has_children(&self, key: &str) -> bool {
        self.entries.keys().any(|k| is_descendant(k, key))
    }

    fn validate(&self, entry: &mut Entry) -> DitResult<()> {
        match self.schema {
            Some(ref schema) => schema.validate(entry),
            None => Ok(()),
        }
    }

    /// Add an entry. Values of the RDN are added if missing, and the
    /// object class hierarchy is expanded when a schema is attached.
    pub fn add_entry<A, V, I>(&mut self, dn: &str, attrs: I) -> DitResult<()>
    where
        A: AsRef<str>,
        V: Into<Vec<u8>>,
        I: IntoIterator<Item = (A, Vec<V>)>,
    {
        let key = normalize_dn(dn);
        if key.is_empty() {
            return Err(DitError::InvalidDn(dn.to_owned()));
        }
        let rdn = rdn_values(dn)?;
        if self.entries.contains_key(&key) {
            return Err(DitError::Exists);
        }
        let dn = split_dn(dn).join(",");
        let mut entry = Entry::new(&dn);
        for (attr, vals) in attrs {
            if Entry::is_operational(attr.as_ref()) {
                continue;
            }
            for val in vals {
                entry.add_value(attr.as_ref(), val.into());
            }
        }
        for (attr, val) in rdn {
            entry.add_value(&attr, val.into_bytes());
        }
        entry.drop_empty();
        self.validate(&mut entry)?;
        entry.values_mut(ENTRY_DN).push(dn.clone().into_bytes());
        debug!("mock directory: added {}", dn);
        self.entries.insert(key, entry);
        Ok(())
    }

    /// Remove a leaf entry.
    pub fn remove_entry(&mut self, dn: &str) -> DitResult<Entry> {
        let key = normalize_dn(dn);
        if !self.entries.contains_key(&key) {
            return Err(DitError::NoSuchObject);
        }
        if self.has_children(&key) {
            return Err(DitError::NotLeaf);
        }
        self.entries.remove(&key).ok_or(DitError::NoSuchObject)
    }

    /// Apply the changes in order. Nothing is stored unless all of them succeed.
    pub fn modify_entry(&mut self, dn: &str, changes: &[Change]) -> DitResult<()> {
        let key = normalize_dn(dn);
        let mut entry = self.entries.get(&key).cloned().ok_or(DitError::NoSuchObject)?;
        let rdn = rdn_values(&entry.dn)?;
        for change in changes {
            apply_change(&mut entry, &rdn, change)?;
        }
        entry.drop_empty();
        self.validate(&mut entry)?;
        self.entries.insert(key, entry);
        Ok(())
    }

    /// Move or rename a leaf entry.
    pub fn rename_entry(
        &mut self,
        dn: &str,
        new_rdn: &str,
        delete_old: bool,
        new_superior: Option<&str>,
    ) -> DitResult<()> {
        let key = normalize_dn(dn);
        let mut entry = self.entries.get(&key).cloned().ok_or(DitError::NoSuchObject)?;
        if self.has_children(&key) {
            return Err(DitError::NotLeaf);
        }
        let parent = match new_superior {
            Some(sup) => {
                if !sup.is_empty() && !self.contains(sup) {
                    return Err(DitError::NoSuchObject);
                }
                split_dn(sup).join(",")
            }
            None => parent_dn(&entry.dn),
        };
        let new_rdn = new_rdn.trim();
        let new_dn = if parent.is_empty() {
            new_rdn.to_owned()
        } else {
            format!("{},{}", new_rdn, parent)
        };
        let new_key = normalize_dn(&new_dn);
        if new_key != key && self.entries.contains_key(&new_key) {
            return Err(DitError::Exists);
        }
        let old_rdn = rdn_values(&entry.dn)?;
        let rdn = rdn_values(&new_dn)?;
        if delete_old {
            for (attr, val) in &old_rdn {
                if let Some(a) = entry.attrs.get_mut(&attr.to_lowercase()) {
                    a.values.retain(|v| !values_match(v, val.as_bytes()));
                }
            }
        }
        for (attr, val) in rdn {
            entry.add_value(&attr, val.into_bytes());
        }
        entry.drop_empty();
        self.validate(&mut entry)?;
        entry.dn = new_dn.clone();
        *entry.values_mut(ENTRY_DN) = vec![new_dn.clone().into_bytes()];
        self.entries.remove(&key);
        self.entries.insert(new_key, entry);
        debug!("mock directory: renamed {} to {}", dn, new_dn);
        Ok(())
    }

    /// Compare an attribute value, returning whether it's present.
    pub fn compare(&self, dn: &str, attr: &str, value: &[u8]) -> DitResult<bool> {
        let entry = self.get(dn).ok_or(DitError::NoSuchObject)?;
        let attr = entry
            .get(attr)
            .ok_or_else(|| DitError::NoSuchAttribute(attr.to_owned()))?;
        Ok(attr.values.iter().any(|v| values_match(v, value)))
    }

    /// Verify a simple bind password against `userPassword`.
    pub fn check_password(&self, dn: &str, password: &[u8]) -> DitResult<()> {
        let entry = self
            .get(dn)
            .ok_or_else(|| DitError::InvalidCredentials("missing object".into()))?;
        let stored = entry.get(USER_PASSWORD).ok_or_else(|| {
            DitError::InvalidCredentials("missing userPassword attribute".into())
        })?;
        if stored.values.iter().any(|v| values_match(v, password)) {
            Ok(())
        } else {
            Err(DitError::InvalidCredentials("invalid credentials".into()))
        }
    }

    /// Entries in the scope of `base`, in DN order.
    fn candidates(&self, base: &str, scope: Scope) -> DitResult<Vec<&Entry>> {
        let base = normalize_dn(base);
        let base_entry = self.entries.get(&base);
        if !base.is_empty() && base_entry.is_none() {
            return Err(DitError::NoSuchObject);
        }
        Ok(match scope {
            Scope::Base => base_entry.into_iter().collect(),
            Scope::OneLevel => self
                .entries
                .iter()
                .filter(|(k, _)| *k != &base && normalize_dn(&parent_dn(k)) == base)
                .map(|(_, e)| e)
                .collect(),
            Scope::Subtree => self
                .entries
                .iter()
                .filter(|(k, _)| *k == &base || is_descendant(k, &base))
                .map(|(_, e)| e)
                .collect(),
        })
    }

    /// Entries in scope which match the filter.
    pub fn search(&self, base: &str, scope: Scope, filter: &Filter) -> DitResult<Vec<Entry>> {
        let candidates = self.candidates(base, scope)?;
        let (matched, _) = evaluate(filter.root(), &candidates)?;
        Ok(matched
            .into_iter()
            .map(|i| candidates[i].clone())
            .collect())
    }
}

fn rdn_values(dn: &str) -> DitResult<Vec<(String, String)>> {
    let rdns = split_dn(dn);
    let first = rdns.first().ok_or_else(|| DitError::InvalidDn(dn.to_owned()))?;
    parse_rdn(first).map_err(|_| DitError::InvalidDn(dn.to_owned()))
}

fn rdn_value_of<'a>(rdn: &'a [(String, String)], attr: &str) -> Option<&'a str> {
    rdn.iter()
        .find(|(a, _)| a.eq_ignore_ascii_case(attr))
        .map(|(_, v)| v.as_str())
}

fn parse_number(val: &[u8]) -> Option<i64> {
    std::str::from_utf8(val).ok()?.trim().parse().ok()
}

fn apply_change(entry: &mut Entry, rdn: &[(String, String)], change: &Change) -> DitResult<()> {
    let attr = change.attr.as_str();
    if Entry::is_operational(attr) {
        return Err(DitError::Unwilling(format!("{} is read-only", attr)));
    }
    let rdn_val = rdn_value_of(rdn, attr);
    match change.op {
        ModOp::Add => {
            for val in &change.values {
                if !entry.add_value(attr, val.clone()) {
                    return Err(DitError::ValueExists(attr.to_owned()));
                }
            }
        }
        ModOp::Delete => {
            let key = attr.to_lowercase();
            let stored = entry
                .attrs
                .get_mut(&key)
                .ok_or_else(|| DitError::NoSuchAttribute(attr.to_owned()))?;
            if change.values.is_empty() {
                if rdn_val.is_some() {
                    return Err(DitError::NotAllowedOnRdn(attr.to_owned()));
                }
                entry.attrs.remove(&key);
                return Ok(());
            }
            for val in &change.values {
                if rdn_val.map_or(false, |r| values_match(r.as_bytes(), val)) {
                    return Err(DitError::NotAllowedOnRdn(attr.to_owned()));
                }
                let before = stored.values.len();
                stored.values.retain(|v| !values_match(v, val));
                if stored.values.len() == before {
                    return Err(DitError::NoSuchAttribute(attr.to_owned()));
                }
            }
        }
        ModOp::Replace => {
            if let Some(r) = rdn_val {
                if !change.values.iter().any(|v| values_match(r.as_bytes(), v)) {
                    return Err(DitError::NotAllowedOnRdn(attr.to_owned()));
                }
            }
            let values = entry.values_mut(attr);
            values.clear();
            for val in &change.values {
                if !values.iter().any(|v| values_match(v, val)) {
                    values.push(val.clone());
                }
            }
        }
        ModOp::Increment => {
            let delta = match change.values.as_slice() {
                [delta] => parse_number(delta)
                    .ok_or_else(|| DitError::Unwilling(format!("non-numeric increment of {}", attr)))?,
                _ => {
                    return Err(DitError::Protocol(
                        "increment requires exactly one value".into(),
                    ))
                }
            };
            let stored = entry
                .attrs
                .get_mut(&attr.to_lowercase())
                .ok_or_else(|| DitError::NoSuchAttribute(attr.to_owned()))?;
            for val in stored.values.iter_mut() {
                let n = parse_number(val)
                    .ok_or_else(|| DitError::Unwilling(format!("{} is not numeric", attr)))?;
                let sum = n
                    .checked_add(delta)
                    .ok_or_else(|| DitError::Unwilling(format!("increment of {} overflows", attr)))?;
                *val = sum.to_string().into_bytes();
            }
        }
    }
    Ok(())
}

type Split = (BTreeSet<usize>, BTreeSet<usize>);

/// Partition the candidates into those matching the node and the rest.
fn evaluate(node: &FilterNode, candidates: &[&Entry]) -> DitResult<Split> {
    match node {
        FilterNode::And(children) => {
            let mut matched = (0..candidates.len()).collect::<BTreeSet<_>>();
            let mut unmatched = BTreeSet::new();
            for child in children {
                let (m, u) = evaluate(child, candidates)?;
                matched = matched.intersection(&m).copied().collect();
                unmatched.extend(u);
            }
            Ok((matched, unmatched))
        }
        FilterNode::Or(children) => {
            let mut matched = BTreeSet::new();
            let mut unmatched = (0..candidates.len()).collect::<BTreeSet<_>>();
            for child in children {
                let (m, u) = evaluate(child, candidates)?;
                matched.extend(m);
                unmatched = unmatched.intersection(&u).copied().collect();
            }
            Ok((matched, unmatched))
        }
        FilterNode::Not(inner) => {
            let (m, u) = evaluate(inner, candidates)?;
            Ok((u, m))
        }
        FilterNode::Equality(ava) | FilterNode::Approx(ava) => {
            Ok(partition(candidates, &ava.attr, |v| values_match(v, &ava.value)))
        }
        FilterNode::GreaterOrEqual(ava) => Ok(ordering(candidates, ava, |o| o.is_ge())),
        FilterNode::LessOrEqual(ava) => Ok(ordering(candidates, ava, |o| o.is_le())),
        FilterNode::Present(attr) => Ok(partition(candidates, attr, |_| true)),
        FilterNode::Substring(sub) => substring(candidates, sub),
        FilterNode::Extensible(_) => Err(DitError::Unsupported(
            "extensible match filter".into(),
        )),
    }
}

fn partition(candidates: &[&Entry], attr: &str, pred: impl Fn(&[u8]) -> bool) -> Split {
    let mut matched = BTreeSet::new();
    let mut unmatched = BTreeSet::new();
    for (i, entry) in candidates.iter().enumerate() {
        let hit = entry
            .get(attr)
            .map_or(false, |a| a.values.iter().any(|v| pred(v)));
        if hit {
            matched.insert(i);
        } else {
            unmatched.insert(i);
        }
    }
    (matched, unmatched)
}

fn compare_values(stored: &[u8], asserted: &[u8]) -> std::cmp::Ordering {
    if let (Some(s), Some(a)) = (parse_number(stored), parse_number(asserted)) {
        return s.cmp(&a);
    }
    String::from_utf8_lossy(stored)
        .to_lowercase()
        .cmp(&String::from_utf8_lossy(asserted).to_lowercase())
}

fn ordering(
    candidates: &[&Entry],
    ava: &AttributeAssertion,
    accept: impl Fn(std::cmp::Ordering) -> bool,
) -> Split {
    partition(candidates, &ava.attr, |v| accept(compare_values(v, &ava.value)))
}

fn substring(candidates: &[&Entry], sub: &SubstringAssertion) -> DitResult<Split> {
    let escape = |part: &[u8]| regex::escape(&String::from_utf8_lossy(part));
    let mut pattern = String::from("^");
    if let Some(ref initial) = sub.initial {
        pattern.push_str(&escape(initial));
    }
    pattern.push_str(".*");
    for any in &sub.any {
        pattern.push_str(&escape(any));
        pattern.push_str(".*");
    }
    if let Some(ref final_) = sub.final_ {
        pattern.push_str(&escape(final_));
    }
    pattern.push('$');
    let re = RegexBuilder::new(&pattern)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .map_err(|e| DitError::Protocol(format!("invalid substring filter: {}", e)))?;
    Ok(partition(candidates, &sub.attr, |v| re.is_match(v)))
}
