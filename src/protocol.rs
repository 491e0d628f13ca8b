use std::io;

use crate::controls::{Control, RawControl};
use crate::controls_impl::{build_tag, parse_controls};
use crate::result::{LdapError, ResponseType, Result};
use crate::RequestId;

use lber::common::TagClass;
use lber::parse::{parse_tag, parse_uint};
use lber::structure::{StructureTag, PL};
use lber::structures::{ASNTag, Integer, Sequence, Tag};
use lber::universal::Types;
use lber::write;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

pub(crate) type MaybeControls = Option<Vec<RawControl>>;

/// OID of the Notice of Disconnection unsolicited notification.
pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";
/// OID of the unsolicited notification announcing an aborted transaction.
pub const TRANSACTION_ERROR_OID: &str = "2.16.840.1.113719.1.27.103.4";

/// Compute the total length of the first BER element in `buf`.
///
/// Returns `Ok(None)` when `buf` doesn't yet hold the complete element, either
/// because the length header itself is incomplete or because fewer bytes than
/// the header announces have arrived. The length returned includes the tag byte
/// and the length header. Indefinite lengths and length headers longer than the
/// platform word are rejected as malformed.
pub fn compute_message_length(buf: &[u8]) -> Result<Option<usize>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let total = if buf[1] & 0x80 == 0 {
        buf[1] as usize + 2
    } else {
        let octets = (buf[1] & 0x7f) as usize;
        if octets == 0 {
            return Err(LdapError::SocketReceive(
                "indefinite BER length not allowed".into(),
            ));
        }
        if octets > std::mem::size_of::<usize>() {
            return Err(LdapError::SocketReceive(format!(
                "BER length header too long: {} octets",
                octets
            )));
        }
        if buf.len() < 2 + octets {
            return Ok(None);
        }
        let value = buf[2..2 + octets]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize);
        value
            .checked_add(2 + octets)
            .ok_or_else(|| LdapError::SocketReceive("BER length overflow".into()))?
    };
    if buf.len() < total {
        Ok(None)
    } else {
        Ok(Some(total))
    }
}

/// Decoded LDAP message.
#[derive(Clone, Debug)]
pub(crate) struct LdapMessage {
    pub id: RequestId,
    pub op: StructureTag,
    pub controls: Vec<Control>,
}

impl LdapMessage {
    pub fn rtype(&self) -> Result<ResponseType> {
        if self.op.class != TagClass::Application {
            return Err(LdapError::SocketReceive("protocol op not application-tagged".into()));
        }
        ResponseType::from_id(self.op.id).ok_or_else(|| {
            LdapError::SocketReceive(format!("unexpected protocol op: {}", self.op.id))
        })
    }
}

#[derive(Default)]
pub(crate) struct LdapCodec;

fn decoding_error(what: &str) -> LdapError {
    LdapError::SocketReceive(format!("decoding error: {}", what))
}

impl Decoder for LdapCodec {
    type Item = LdapMessage;
    type Error = LdapError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<LdapMessage>> {
        let len = match compute_message_length(buf)? {
            Some(len) => len,
            None => return Ok(None),
        };
        let frame = buf.split_to(len);
        let tag = match parse_tag(&frame) {
            Ok((rest, _)) if !rest.is_empty() => {
                return Err(decoding_error("trailing bytes in frame"))
            }
            Ok((_, tag)) => tag,
            Err(_) => return Err(decoding_error("invalid BER")),
        };
        let mut tags = tag
            .match_id(Types::Sequence as u64)
            .and_then(|t| t.expect_constructed())
            .ok_or_else(|| decoding_error("envelope"))?;
        let mut maybe_controls = tags.pop().ok_or_else(|| decoding_error("empty envelope"))?;
        let has_controls = match maybe_controls {
            StructureTag {
                id,
                class,
                ref payload,
            } if class == TagClass::Context && id == 0 => match *payload {
                PL::C(_) => true,
                PL::P(_) => return Err(decoding_error("primitive controls")),
            },
            StructureTag { id, class, .. } if class == TagClass::Context && id == 10 => {
                // Active Directory puts the OID of a Notice of Disconnection outside
                // the ExtendedResponse sequence, where the controls belong.
                maybe_controls = tags.pop().ok_or_else(|| decoding_error("protocol op"))?;
                false
            }
            _ => false,
        };
        let (protoop, controls) = if has_controls {
            (
                tags.pop().ok_or_else(|| decoding_error("protocol op"))?,
                Some(maybe_controls),
            )
        } else {
            (maybe_controls, None)
        };
        let controls = match controls {
            Some(controls) => parse_controls(controls)?,
            None => vec![],
        };
        let id = tags
            .pop()
            .and_then(|t| t.match_class(TagClass::Universal))
            .and_then(|t| t.match_id(Types::Integer as u64))
            .and_then(|t| t.expect_primitive())
            .and_then(|v| parse_uint(v.as_slice()).ok().map(|(_, id)| id as RequestId))
            .ok_or_else(|| decoding_error("message id"))?;
        Ok(Some(LdapMessage {
            id,
            op: protoop,
            controls,
        }))
    }
}

impl Encoder<(RequestId, Tag, MaybeControls)> for LdapCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        msg: (RequestId, Tag, MaybeControls),
        into: &mut BytesMut,
    ) -> io::Result<()> {
        let (id, tag, controls) = msg;
        let outstruct = {
            let mut msg = vec![
                Tag::Integer(Integer {
                    inner: id as i64,
                    ..Default::default()
                }),
                tag,
            ];
            if let Some(controls) = controls {
                msg.push(Tag::StructureTag(StructureTag {
                    id: 0,
                    class: TagClass::Context,
                    payload: PL::C(controls.into_iter().map(build_tag).collect()),
                }));
            }
            Tag::Sequence(Sequence {
                inner: msg,
                ..Default::default()
            })
            .into_structure()
        };
        write::encode_into(into, outstruct)?;
        Ok(())
    }
}
