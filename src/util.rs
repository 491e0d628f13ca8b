use std::borrow::Cow;

use crate::filter::Unescaper;
use crate::result::{LdapError, Result};
use crate::search::Scope;

use percent_encoding::percent_decode_str;
use url::Url;

#[inline]
fn xdigit(c: u8) -> u8 {
    c + if c < 10 { b'0' } else { b'a' - 10 }
}

fn escape_with<'a>(val: Cow<'a, str>, needs_escape: impl Fn(usize, u8) -> bool) -> Cow<'a, str> {
    let mut output: Option<String> = None;
    for (i, c) in val.char_indices() {
        let b = c as u32;
        if b < 0x80 && needs_escape(i, b as u8) {
            // guess: up to 4 escaped chars
            let output = output.get_or_insert_with(|| {
                let mut s = String::with_capacity(val.len() + 12);
                s.push_str(&val[..i]);
                s
            });
            output.push('\\');
            output.push(xdigit(b as u8 >> 4) as char);
            output.push(xdigit(b as u8 & 0xF) as char);
        } else if let Some(ref mut output) = output {
            output.push(c);
        }
    }
    match output {
        Some(output) => Cow::Owned(output),
        None => val,
    }
}

/// Escape a filter literal.
///
/// Literal values appearing in an LDAP filter can contain any character,
/// but some characters (parentheses, asterisk, backslash, NUL) must be
/// escaped in the filter's string representation. This function does the
/// escaping.
///
/// The argument, `lit`, can be owned or borrowed. The function doesn't
/// allocate the return value unless there's need to escape the input.
pub fn ldap_escape<'a, S: Into<Cow<'a, str>>>(lit: S) -> Cow<'a, str> {
    escape_with(lit.into(), |_, c| {
        c == b'\\' || c == b'*' || c == b'(' || c == b')' || c == 0
    })
}

/// Escape an attribute value in a relative distinguished name (RDN).
///
/// When a literal string is used to represent an attribute value in an RDN,
/// some of its characters might need to be escaped according to the rules
/// of [RFC 4514](https://tools.ietf.org/html/rfc4514).
///
/// The argument, `val`, can be owned or borrowed. The function doesn't
/// allocate the return value unless there's need to escape the input.
pub fn dn_escape<'a, S: Into<Cow<'a, str>>>(val: S) -> Cow<'a, str> {
    let val = val.into();
    let last = val.len().saturating_sub(1);
    escape_with(val, move |i, c| {
        matches!(c, b'"' | b'+' | b',' | b';' | b'<' | b'=' | b'>' | b'\\' | 0)
            || i == 0 && (c == b' ' || c == b'#')
            || i == last && c == b' '
    })
}

/// Unescape a string using LDAP filter escapes.
///
/// If a string contains `\nn` hexadecimal escapes, return a string where those
/// escapes are turned back into characters they represent. The result must be
/// a valid UTF-8 string, otherwise an error is returned.
pub fn ldap_unescape<'a, S: Into<Cow<'a, str>>>(val: S) -> Result<Cow<'a, str>> {
    let val = val.into();
    if !val.contains('\\') {
        return Ok(val);
    }
    let mut output = Vec::with_capacity(val.len());
    let mut esc = Unescaper::Value(0);
    for &c in val.as_bytes() {
        esc = esc.feed(c);
        if let Unescaper::Value(c) = esc {
            output.push(c);
        }
    }
    match esc {
        Unescaper::Value(_) => Ok(Cow::Owned(
            String::from_utf8(output).map_err(|_| LdapError::DecodingUTF8)?,
        )),
        _ => Err(LdapError::DecodingUTF8),
    }
}

/// Parameters of an LDAP URL which matter when following a referral.
///
/// Components missing from the URL are `None`, so that the corresponding
/// parts of the original request can be kept.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LdapUrlParams {
    /// Search base or target DN, percent-decoded. Empty if absent.
    pub base: String,
    /// Attribute list.
    pub attrs: Option<Vec<String>>,
    /// Search scope.
    pub scope: Option<Scope>,
    /// Filter string, percent-decoded.
    pub filter: Option<String>,
}

fn decode(s: &str) -> Result<String> {
    Ok(percent_decode_str(s)
        .decode_utf8()
        .map_err(|_| LdapError::DecodingUTF8)?
        .into_owned())
}

/// Extract parameters from an LDAP URL.
pub fn get_url_params(url: &Url) -> Result<LdapUrlParams> {
    let base = decode(url.path().strip_prefix('/').unwrap_or(url.path()))?;
    let mut query = url.query().unwrap_or("").splitn(4, '?');
    let attrs = match query.next() {
        Some("") | None => None,
        Some(alist) => Some(alist.split(',').map(String::from).collect()),
    };
    let scope = match query.next() {
        Some("") | None => None,
        Some(scope_str) => Some(scope_str.parse()?),
    };
    let filter = match query.next() {
        Some("") | None => None,
        Some(filter) => Some(decode(filter)?),
    };
    Ok(LdapUrlParams {
        base,
        attrs,
        scope,
        filter,
    })
}

/// Split a DN into its RDN components, honoring backslash escapes.
///
/// Whitespace around each component is dropped. An empty DN has no components.
pub fn split_dn(dn: &str) -> Vec<&str> {
    let mut parts = vec![];
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in dn.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            ',' | ';' => {
                parts.push(dn[start..i].trim());
                start = i + 1;
            }
            _ => (),
        }
    }
    let tail = dn[start..].trim();
    if !tail.is_empty() || !parts.is_empty() {
        parts.push(tail);
    }
    parts
}

fn unescape_dn_value(val: &str) -> String {
    let bytes = val.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok());
            match hex {
                Some(b) => {
                    out.push(b);
                    i += 3;
                }
                None => {
                    out.push(bytes[i + 1]);
                    i += 2;
                }
            }
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Decompose an RDN into its attribute/value pairs.
///
/// Multi-valued RDNs are split on unescaped `+`. Values are unescaped.
pub fn parse_rdn(rdn: &str) -> Result<Vec<(String, String)>> {
    let mut avas = vec![];
    let mut start = 0;
    let mut escaped = false;
    let mut pieces = vec![];
    for (i, c) in rdn.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '+' => {
                pieces.push(&rdn[start..i]);
                start = i + 1;
            }
            _ => (),
        }
    }
    pieces.push(&rdn[start..]);
    for piece in pieces {
        let (attr, value) = piece
            .split_once('=')
            .ok_or_else(|| LdapError::Configuration(format!("invalid RDN: {}", rdn)))?;
        let attr = attr.trim();
        if attr.is_empty() {
            return Err(LdapError::Configuration(format!("invalid RDN: {}", rdn)));
        }
        avas.push((attr.to_owned(), unescape_dn_value(value.trim())));
    }
    Ok(avas)
}

/// Canonical form of a DN, used for comparisons.
///
/// Attribute names and values are lowercased, and whitespace around
/// separators is removed.
pub fn normalize_dn(dn: &str) -> String {
    split_dn(dn)
        .into_iter()
        .map(|rdn| {
            rdn.split('=')
                .map(str::trim)
                .collect::<Vec<_>>()
                .join("=")
                .to_lowercase()
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// DN of the parent entry, or the empty string for a single-RDN DN.
pub fn parent_dn(dn: &str) -> String {
    let rdns = split_dn(dn);
    if rdns.len() <= 1 {
        String::new()
    } else {
        rdns[1..].join(",")
    }
}

/// Returns true if `dn` lies strictly below `base`. Both must be normalized.
pub(crate) fn is_descendant(dn: &str, base: &str) -> bool {
    if base.is_empty() {
        return !dn.is_empty();
    }
    dn.len() > base.len() + 1
        && dn.ends_with(base)
        && dn.as_bytes()[dn.len() - base.len() - 1] == b','
        && !dn[..dn.len() - base.len() - 1].ends_with('\\')
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dn_esc_leading_space() {
        assert_eq!(dn_escape(" foo"), "\\20foo");
    }

    #[test]
    fn dn_esc_trailing_space() {
        assert_eq!(dn_escape("foo "), "foo\\20");
    }

    #[test]
    fn dn_esc_inner_space() {
        assert_eq!(dn_escape("f o o"), "f o o");
    }

    #[test]
    fn dn_esc_three_spaces() {
        assert_eq!(dn_escape("   "), "\\20 \\20");
    }

    #[test]
    fn dn_esc_leading_hash() {
        assert_eq!(dn_escape("#rust"), "\\23rust");
    }

    #[test]
    fn filter_escape_round_trip() {
        let escaped = ldap_escape("a*(b)\\");
        assert_eq!(escaped, "a\\2a\\28b\\29\\5c");
        assert_eq!(ldap_unescape(escaped).unwrap(), "a*(b)\\");
        assert!(ldap_unescape("a\\2").is_err());
    }

    #[test]
    fn split_escaped_dn() {
        assert_eq!(
            split_dn("cn=Doe\\, John , ou=People,dc=example"),
            vec!["cn=Doe\\, John", "ou=People", "dc=example"]
        );
        assert!(split_dn("").is_empty());
    }

    #[test]
    fn rdn_values() {
        let avas = parse_rdn("cn=Doe\\, John+uid=jd").unwrap();
        assert_eq!(
            avas,
            vec![
                ("cn".to_owned(), "Doe, John".to_owned()),
                ("uid".to_owned(), "jd".to_owned())
            ]
        );
        assert!(parse_rdn("nonsense").is_err());
    }

    #[test]
    fn dn_relations() {
        assert_eq!(normalize_dn("CN=A , DC=Example"), "cn=a,dc=example");
        assert_eq!(parent_dn("cn=a,dc=example"), "dc=example");
        assert!(is_descendant("cn=a,dc=example", "dc=example"));
        assert!(!is_descendant("dc=example", "dc=example"));
        assert!(!is_descendant("cn=a,xdc=example", "dc=example"));
    }

    #[test]
    fn referral_url_params() {
        let url = Url::parse("ldap://h2/ou=x,dc=example??one?(cn=a)").unwrap();
        let params = get_url_params(&url).unwrap();
        assert_eq!(params.base, "ou=x,dc=example");
        assert_eq!(params.scope, Some(Scope::OneLevel));
        assert_eq!(params.filter.as_deref(), Some("(cn=a)"));
        assert!(params.attrs.is_none());
    }
}
