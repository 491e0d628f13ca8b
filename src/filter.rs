#![allow(clippy::blocks_in_conditions)]

use std::str::FromStr;

use crate::result::{LdapError, Result};

use lber::common::TagClass;
use lber::structures::{Boolean, ExplicitTag, OctetString, Sequence, Tag};

use nom::branch::alt;
use nom::bytes::complete::{tag, take_while, take_while1};
use nom::character::complete::digit1;
use nom::character::{is_alphabetic, is_alphanumeric, is_hex_digit};
use nom::combinator::{map, map_res, opt, recognize, verify};
use nom::multi::{fold_many0, many0};
use nom::number::complete::be_u8;
use nom::sequence::{delimited, preceded};
use nom::IResult;

/// Parse the string representation of a search filter.
///
/// The outermost parentheses may be omitted for a single item.
pub fn parse(input: impl AsRef<[u8]>) -> Result<Filter> {
    match filtexpr(input.as_ref()) {
        Ok((r, root)) if r.is_empty() => Ok(Filter { root }),
        _ => Err(LdapError::FilterParsing),
    }
}

const AND_FILT: u64 = 0;
const OR_FILT: u64 = 1;
const NOT_FILT: u64 = 2;

const EQ_MATCH: u64 = 3;
const SUBSTR_MATCH: u64 = 4;
const GTE_MATCH: u64 = 5;
const LTE_MATCH: u64 = 6;
const PRES_MATCH: u64 = 7;
const APPROX_MATCH: u64 = 8;
const EXT_MATCH: u64 = 9;

const SUB_INITIAL: u64 = 0;
const SUB_ANY: u64 = 1;
const SUB_FINAL: u64 = 2;

/// Kind of a node in the filter tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterTag {
    Root,
    And,
    Or,
    Not,
    Equality,
    Substring,
    GreaterOrEqual,
    LessOrEqual,
    Present,
    Approx,
    Extensible,
}

/// Attribute/value pair of a simple filter item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttributeAssertion {
    pub attr: String,
    pub value: Vec<u8>,
}

/// Components of a substring filter item.
///
/// An absent `initial` means the pattern starts with an asterisk, an absent
/// `final_` that it ends with one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubstringAssertion {
    pub attr: String,
    pub initial: Option<Vec<u8>>,
    pub any: Vec<Vec<u8>>,
    pub final_: Option<Vec<u8>>,
}

/// Components of an extensible match filter item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtensibleAssertion {
    pub rule: Option<String>,
    pub attr: Option<String>,
    pub value: Vec<u8>,
    pub dn: bool,
}

/// Node of a parsed search filter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FilterNode {
    And(Vec<FilterNode>),
    Or(Vec<FilterNode>),
    Not(Box<FilterNode>),
    Equality(AttributeAssertion),
    Substring(SubstringAssertion),
    GreaterOrEqual(AttributeAssertion),
    LessOrEqual(AttributeAssertion),
    Present(String),
    Approx(AttributeAssertion),
    Extensible(ExtensibleAssertion),
}

impl FilterNode {
    pub fn tag(&self) -> FilterTag {
        match self {
            FilterNode::And(_) => FilterTag::And,
            FilterNode::Or(_) => FilterTag::Or,
            FilterNode::Not(_) => FilterTag::Not,
            FilterNode::Equality(_) => FilterTag::Equality,
            FilterNode::Substring(_) => FilterTag::Substring,
            FilterNode::GreaterOrEqual(_) => FilterTag::GreaterOrEqual,
            FilterNode::LessOrEqual(_) => FilterTag::LessOrEqual,
            FilterNode::Present(_) => FilterTag::Present,
            FilterNode::Approx(_) => FilterTag::Approx,
            FilterNode::Extensible(_) => FilterTag::Extensible,
        }
    }

    /// Child nodes, in filter order. Items have none.
    pub fn children(&self) -> &[FilterNode] {
        match self {
            FilterNode::And(v) | FilterNode::Or(v) => v,
            FilterNode::Not(inner) => std::slice::from_ref(inner.as_ref()),
            _ => &[],
        }
    }

    fn to_tag(&self) -> Tag {
        match self {
            FilterNode::And(v) => Tag::Sequence(Sequence {
                class: TagClass::Context,
                id: AND_FILT,
                inner: v.iter().map(FilterNode::to_tag).collect(),
            }),
            FilterNode::Or(v) => Tag::Sequence(Sequence {
                class: TagClass::Context,
                id: OR_FILT,
                inner: v.iter().map(FilterNode::to_tag).collect(),
            }),
            FilterNode::Not(inner) => Tag::ExplicitTag(ExplicitTag {
                class: TagClass::Context,
                id: NOT_FILT,
                inner: Box::new(inner.to_tag()),
            }),
            FilterNode::Equality(a) => assertion_tag(EQ_MATCH, a),
            FilterNode::GreaterOrEqual(a) => assertion_tag(GTE_MATCH, a),
            FilterNode::LessOrEqual(a) => assertion_tag(LTE_MATCH, a),
            FilterNode::Approx(a) => assertion_tag(APPROX_MATCH, a),
            FilterNode::Present(attr) => Tag::OctetString(OctetString {
                class: TagClass::Context,
                id: PRES_MATCH,
                inner: attr.as_bytes().to_vec(),
            }),
            FilterNode::Substring(s) => {
                let mut inner = vec![];
                if let Some(ref initial) = s.initial {
                    inner.push(substring_tag(SUB_INITIAL, initial));
                }
                for any in &s.any {
                    inner.push(substring_tag(SUB_ANY, any));
                }
                if let Some(ref final_) = s.final_ {
                    inner.push(substring_tag(SUB_FINAL, final_));
                }
                Tag::Sequence(Sequence {
                    class: TagClass::Context,
                    id: SUBSTR_MATCH,
                    inner: vec![
                        Tag::OctetString(OctetString {
                            inner: s.attr.as_bytes().to_vec(),
                            ..Default::default()
                        }),
                        Tag::Sequence(Sequence {
                            inner,
                            ..Default::default()
                        }),
                    ],
                })
            }
            FilterNode::Extensible(e) => extensible_tag(e),
        }
    }
}

fn assertion_tag(id: u64, a: &AttributeAssertion) -> Tag {
    Tag::Sequence(Sequence {
        class: TagClass::Context,
        id,
        inner: vec![
            Tag::OctetString(OctetString {
                inner: a.attr.as_bytes().to_vec(),
                ..Default::default()
            }),
            Tag::OctetString(OctetString {
                inner: a.value.clone(),
                ..Default::default()
            }),
        ],
    })
}

fn substring_tag(id: u64, value: &[u8]) -> Tag {
    Tag::OctetString(OctetString {
        class: TagClass::Context,
        id,
        inner: value.to_vec(),
    })
}

fn extensible_tag(e: &ExtensibleAssertion) -> Tag {
    let mut inner = vec![];
    if let Some(ref mrule) = e.rule {
        inner.push(Tag::OctetString(OctetString {
            class: TagClass::Context,
            id: 1,
            inner: mrule.as_bytes().to_vec(),
        }));
    }
    if let Some(ref attr) = e.attr {
        inner.push(Tag::OctetString(OctetString {
            class: TagClass::Context,
            id: 2,
            inner: attr.as_bytes().to_vec(),
        }));
    }
    inner.push(Tag::OctetString(OctetString {
        class: TagClass::Context,
        id: 3,
        inner: e.value.clone(),
    }));
    if e.dn {
        inner.push(Tag::Boolean(Boolean {
            class: TagClass::Context,
            id: 4,
            inner: e.dn,
        }));
    }
    Tag::Sequence(Sequence {
        class: TagClass::Context,
        id: EXT_MATCH,
        inner,
    })
}

/// Parsed search filter.
///
/// The filter is the root of a tree of [`FilterNode`]s; it has exactly one child,
/// the outermost filter expression.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Filter {
    root: FilterNode,
}

impl Filter {
    pub fn tag(&self) -> FilterTag {
        FilterTag::Root
    }

    /// The outermost filter expression.
    pub fn root(&self) -> &FilterNode {
        &self.root
    }

    /// BER form of the filter, as it appears in a Search request.
    pub fn to_tag(&self) -> Tag {
        self.root.to_tag()
    }
}

impl FromStr for Filter {
    type Err = LdapError;

    fn from_str(s: &str) -> Result<Filter> {
        parse(s)
    }
}

fn filtexpr(i: &[u8]) -> IResult<&[u8], FilterNode> {
    alt((filter, item))(i)
}

fn filter(i: &[u8]) -> IResult<&[u8], FilterNode> {
    delimited(tag(b"("), filtercomp, tag(b")"))(i)
}

fn filtercomp(i: &[u8]) -> IResult<&[u8], FilterNode> {
    alt((and, or, not, item))(i)
}

fn filterlist(i: &[u8]) -> IResult<&[u8], Vec<FilterNode>> {
    many0(filter)(i)
}

fn and(i: &[u8]) -> IResult<&[u8], FilterNode> {
    map(preceded(tag(b"&"), filterlist), FilterNode::And)(i)
}

fn or(i: &[u8]) -> IResult<&[u8], FilterNode> {
    map(preceded(tag(b"|"), filterlist), FilterNode::Or)(i)
}

fn not(i: &[u8]) -> IResult<&[u8], FilterNode> {
    map(preceded(tag(b"!"), filter), |node| {
        FilterNode::Not(Box::new(node))
    })(i)
}

fn item(i: &[u8]) -> IResult<&[u8], FilterNode> {
    alt((eq, non_eq, extensible))(i)
}

pub(crate) enum Unescaper {
    WantFirst,
    WantSecond(u8),
    Value(u8),
    Error,
}

impl Unescaper {
    pub(crate) fn feed(&self, c: u8) -> Unescaper {
        match *self {
            Unescaper::Error => Unescaper::Error,
            Unescaper::WantFirst => {
                if is_hex_digit(c) {
                    Unescaper::WantSecond(hex_value(c))
                } else {
                    Unescaper::Error
                }
            }
            Unescaper::WantSecond(partial) => {
                if is_hex_digit(c) {
                    Unescaper::Value((partial << 4) + hex_value(c))
                } else {
                    Unescaper::Error
                }
            }
            Unescaper::Value(_v) => {
                if c != b'\\' {
                    Unescaper::Value(c)
                } else {
                    Unescaper::WantFirst
                }
            }
        }
    }
}

fn hex_value(c: u8) -> u8 {
    c - if c <= b'9' {
        b'0'
    } else {
        (c & 0x20) + b'A' - 10
    }
}

// Any byte in the assertion value may be represented by \NN, where N is a hex digit.
// Parentheses, asterisk and backslash itself must be represented in this way.
fn unescaped(i: &[u8]) -> IResult<&[u8], Vec<u8>> {
    map_res(
        fold_many0(
            verify(be_u8, is_value_char),
            || (Unescaper::Value(0), Vec::new()),
            |(mut u, mut vec): (Unescaper, Vec<_>), c: u8| {
                u = u.feed(c);
                if let Unescaper::Value(c) = u {
                    vec.push(c);
                }
                (u, vec)
            },
        ),
        |(u, vec): (Unescaper, Vec<_>)| -> std::result::Result<Vec<u8>, ()> {
            if let Unescaper::Value(_) = u {
                Ok(vec)
            } else {
                Err(())
            }
        },
    )(i)
}

fn is_value_char(&c: &u8) -> bool {
    c != 0 && c != b'(' && c != b')' && c != b'*'
}

fn attr_string(attr: &[u8]) -> String {
    String::from_utf8_lossy(attr).into_owned()
}

fn non_eq(i: &[u8]) -> IResult<&[u8], FilterNode> {
    let (i, attr) = attributedescription(i)?;
    let (i, filterop) = alt((tag(b">="), tag(b"<="), tag("~=")))(i)?;
    let (i, value) = unescaped(i)?;
    let assertion = AttributeAssertion {
        attr: attr_string(attr),
        value,
    };
    let node = match filterop {
        b">=" => FilterNode::GreaterOrEqual(assertion),
        b"<=" => FilterNode::LessOrEqual(assertion),
        _ => FilterNode::Approx(assertion),
    };
    Ok((i, node))
}

fn eq(i: &[u8]) -> IResult<&[u8], FilterNode> {
    let (i, attr) = attributedescription(i)?;
    let (i, _) = tag(b"=")(i)?;
    let (i, initial) = unescaped(i)?;
    let (i, mut mid_final) = map_res(
        many0(preceded(tag(b"*"), unescaped)),
        |v: Vec<Vec<u8>>| -> std::result::Result<Vec<Vec<u8>>, ()> {
            if v.iter()
                .enumerate()
                .any(|(n, ve)| ve.is_empty() && n + 1 != v.len())
            {
                Err(())
            } else {
                Ok(v)
            }
        },
    )(i)?;
    let attr = attr_string(attr);
    let node = if mid_final.is_empty() {
        // simple equality, no asterisks in assertion value
        FilterNode::Equality(AttributeAssertion {
            attr,
            value: initial,
        })
    } else if initial.is_empty() && mid_final.len() == 1 && mid_final[0].is_empty() {
        // presence, single asterisk in assertion value
        FilterNode::Present(attr)
    } else {
        // substring match; the last component is the final substring unless empty
        let final_ = mid_final.pop().filter(|f| !f.is_empty());
        FilterNode::Substring(SubstringAssertion {
            attr,
            initial: Some(initial).filter(|ini| !ini.is_empty()),
            any: mid_final,
            final_,
        })
    };
    Ok((i, node))
}

fn extensible(i: &[u8]) -> IResult<&[u8], FilterNode> {
    alt((attr_dn_mrule, dn_mrule))(i)
}

fn attr_dn_mrule(i: &[u8]) -> IResult<&[u8], FilterNode> {
    let (i, attr) = attributedescription(i)?;
    let (i, dn) = opt(tag(b":dn"))(i)?;
    let (i, mrule) = opt(preceded(tag(b":"), attributetype))(i)?;
    let (i, _) = tag(b":=")(i)?;
    let (i, value) = unescaped(i)?;
    Ok((
        i,
        FilterNode::Extensible(ExtensibleAssertion {
            rule: mrule.map(attr_string),
            attr: Some(attr_string(attr)),
            value,
            dn: dn.is_some(),
        }),
    ))
}

fn dn_mrule(i: &[u8]) -> IResult<&[u8], FilterNode> {
    let (i, dn) = opt(tag(b":dn"))(i)?;
    let (i, mrule) = preceded(tag(b":"), attributetype)(i)?;
    let (i, _) = tag(b":=")(i)?;
    let (i, value) = unescaped(i)?;
    Ok((
        i,
        FilterNode::Extensible(ExtensibleAssertion {
            rule: Some(attr_string(mrule)),
            attr: None,
            value,
            dn: dn.is_some(),
        }),
    ))
}

fn attributedescription(i: &[u8]) -> IResult<&[u8], &[u8]> {
    recognize(|i| -> IResult<&[u8], ()> {
        let (i, _) = attributetype(i)?;
        let (i, _) = many0(preceded(tag(b";"), take_while1(is_alnum_hyphen)))(i)?;
        Ok((i, ()))
    })(i)
}

fn is_alnum_hyphen(c: u8) -> bool {
    is_alphanumeric(c) || c == b'-'
}

fn attributetype(i: &[u8]) -> IResult<&[u8], &[u8]> {
    alt((numericoid, descr))(i)
}

fn numericoid(i: &[u8]) -> IResult<&[u8], &[u8]> {
    recognize(|i| -> IResult<&[u8], ()> {
        let (i, _) = number(i)?;
        let (i, _) = many0(preceded(tag(b"."), number))(i)?;
        Ok((i, ()))
    })(i)
}

// A number may be zero, but must not have superfluous leading zeroes
fn number(i: &[u8]) -> IResult<&[u8], &[u8]> {
    verify(digit1, |d: &[u8]| d.len() == 1 || d[0] != b'0')(i)
}

fn descr(i: &[u8]) -> IResult<&[u8], &[u8]> {
    recognize(|i| -> IResult<&[u8], ()> {
        let (i, _) = verify(be_u8, |c| is_alphabetic(*c))(i)?;
        let (i, _) = take_while(is_alnum_hyphen)(i)?;
        Ok((i, ()))
    })(i)
}

#[cfg(test)]
mod test {
    use super::*;

    fn ber_vec_eq(filter: &str, ber: &[u8]) {
        use bytes::BytesMut;
        use lber::structures::ASNTag;
        use lber::write;

        let mut buf = BytesMut::new();
        let tag = parse(filter).unwrap().to_tag();
        write::encode_into(&mut buf, tag.into_structure()).unwrap();
        assert_eq!(buf, ber);
    }

    #[test]
    fn filt_bare_item() {
        ber_vec_eq("a=v", b"\xa3\x06\x04\x01a\x04\x01v");
    }

    #[test]
    fn filt_simple_eq() {
        ber_vec_eq("(a=v)", b"\xa3\x06\x04\x01a\x04\x01v");
    }

    #[test]
    fn filt_extra_garbage() {
        assert!(parse("(a=v)garbage").is_err());
    }

    #[test]
    fn filt_simple_noneq() {
        ber_vec_eq("(a<=2)", b"\xa6\x06\x04\x01a\x04\x012");
    }

    #[test]
    fn filt_pres() {
        ber_vec_eq("(a=*)", b"\x87\x01a");
    }

    #[test]
    fn filt_ast_ini() {
        ber_vec_eq("(a=*v)", b"\xa4\x08\x04\x01a0\x03\x82\x01v");
    }

    #[test]
    fn filt_ast_fin() {
        ber_vec_eq("(a=v*)", b"\xa4\x08\x04\x01a0\x03\x80\x01v");
    }

    #[test]
    fn filt_ast_multi() {
        ber_vec_eq(
            "(a=v*x*y)",
            b"\xa4\x0e\x04\x01a0\t\x80\x01v\x81\x01x\x82\x01y",
        );
    }

    #[test]
    fn filt_ast_double() {
        assert!(parse("(a=f**)").is_err());
    }

    #[test]
    fn filt_esc_ok() {
        ber_vec_eq("(a=v\\2ax)", b"\xa3\x08\x04\x01a\x04\x03v*x");
    }

    #[test]
    fn filt_esc_runt() {
        assert!(parse("(a=v\\2)").is_err());
    }

    #[test]
    fn filt_esc_invalid() {
        assert!(parse("(a=v\\0x)").is_err());
    }

    #[test]
    fn filt_oid() {
        ber_vec_eq("(2.5.4.3=v)", b"\xa3\x0c\x04\x072.5.4.3\x04\x01v");
    }

    #[test]
    fn filt_oidl0() {
        assert!(parse("(2.5.04.0=top)").is_err());
    }

    #[test]
    fn filt_complex() {
        ber_vec_eq("(&(a=v)(b=x)(!(c=y)))", b"\xa0\x1a\xa3\x06\x04\x01a\x04\x01v\xa3\x06\x04\x01b\x04\x01x\xa2\x08\xa3\x06\x04\x01c\x04\x01y");
    }

    #[test]
    fn filt_abs_true() {
        ber_vec_eq("(&)", b"\xa0\0");
    }

    #[test]
    fn filt_ext_dn() {
        ber_vec_eq(
            "(ou:dn:=People)",
            b"\xa9\x0f\x82\x02ou\x83\x06People\x84\x01\xff",
        );
    }

    #[test]
    fn filt_ext_mrule() {
        ber_vec_eq(
            "(cn:2.5.13.5:=J D)",
            b"\xa9\x13\x81\x082.5.13.5\x82\x02cn\x83\x03J D",
        );
    }

    #[test]
    fn tree_shape() {
        let f = parse("(&(cn=a*b*c)(!(sn=x)))").unwrap();
        assert_eq!(f.tag(), FilterTag::Root);
        let root = f.root();
        assert_eq!(root.tag(), FilterTag::And);
        assert_eq!(root.children().len(), 2);
        match &root.children()[0] {
            FilterNode::Substring(s) => {
                assert_eq!(s.initial.as_deref(), Some(&b"a"[..]));
                assert_eq!(s.any, vec![b"b".to_vec()]);
                assert_eq!(s.final_.as_deref(), Some(&b"c"[..]));
            }
            other => panic!("unexpected node {:?}", other),
        }
        assert_eq!(root.children()[1].tag(), FilterTag::Not);
        assert_eq!(root.children()[1].children()[0].tag(), FilterTag::Equality);
    }

    #[test]
    fn parse_error_kind() {
        let err = "(cn=".parse::<Filter>().unwrap_err();
        assert!(matches!(err, LdapError::FilterParsing));
    }
}
