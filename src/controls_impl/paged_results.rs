use crate::controls::{ControlParser, MakeCritical, RawControl};
use crate::result::{LdapError, Result};

use bytes::BytesMut;

use lber::common::TagClass;
use lber::parse::{parse_tag, parse_uint};
use lber::structures::{ASNTag, Integer, OctetString, Sequence, Tag};
use lber::universal::Types;
use lber::write;

pub const PAGED_RESULTS_OID: &str = "1.2.840.113556.1.4.319";

/// Paged Results control ([RFC 2696](https://tools.ietf.org/html/rfc2696)).
///
/// This struct can be used both for requests and responses, although `size`
/// means different things in each case. In a request, it is the page size,
/// in a response the server's estimate of the total result set size.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PagedResults {
    /// For requests, desired page size. For responses, a server's estimate
    /// of the result set size, if non-zero.
    pub size: i32,
    /// Paging cookie. Empty in the first request and in the last response.
    pub cookie: Vec<u8>,
}

impl MakeCritical for PagedResults {}

impl From<PagedResults> for RawControl {
    fn from(pr: PagedResults) -> RawControl {
        let cap_est = pr.cookie.len() + 16;
        let pr_val = Tag::Sequence(Sequence {
            inner: vec![
                Tag::Integer(Integer {
                    inner: pr.size as i64,
                    ..Default::default()
                }),
                Tag::OctetString(OctetString {
                    inner: pr.cookie,
                    ..Default::default()
                }),
            ],
            ..Default::default()
        })
        .into_structure();
        let mut buf = BytesMut::with_capacity(cap_est);
        write::encode_into(&mut buf, pr_val).expect("encoded");
        RawControl {
            ctype: PAGED_RESULTS_OID.to_owned(),
            crit: false,
            val: Some(Vec::from(&buf[..])),
        }
    }
}

impl ControlParser for PagedResults {
    fn parse(val: &[u8]) -> Result<PagedResults> {
        let malformed = || LdapError::SocketReceive("malformed paged results control".into());
        let mut tags = match parse_tag(val) {
            Ok((_, tag)) => tag,
            _ => return Err(malformed()),
        }
        .expect_constructed()
        .ok_or_else(malformed)?
        .into_iter();
        let size = tags
            .next()
            .and_then(|t| t.match_class(TagClass::Universal))
            .and_then(|t| t.match_id(Types::Integer as u64))
            .and_then(|t| t.expect_primitive())
            .and_then(|v| parse_uint(v.as_slice()).ok().map(|(_, size)| size as i32))
            .ok_or_else(malformed)?;
        let cookie = tags
            .next()
            .and_then(|t| t.expect_primitive())
            .ok_or_else(malformed)?;
        Ok(PagedResults { size, cookie })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_own_encoding() {
        let raw = RawControl::from(PagedResults {
            size: 250,
            cookie: b"10".to_vec(),
        });
        let pr: PagedResults = raw.parse().unwrap();
        assert_eq!(pr.size, 250);
        assert_eq!(pr.cookie, b"10");
    }
}
