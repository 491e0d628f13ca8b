use std::collections::HashMap;
use std::sync::LazyLock;

use crate::result::{LdapError, Result};

use lber::structure::{StructureTag, PL};
use lber::structures::{ASNTag, Boolean, OctetString, Sequence, Tag};
use lber::universal::Types;

/// Recognized control types.
///
/// The variants can't be exhaustively matched, since the list of
/// recognized and internally implemented controls can change from one
/// release to the next.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlType {
    PagedResults,
    ManageDsaIt,
}

mod paged_results;
pub use self::paged_results::PagedResults;
pub(crate) use self::paged_results::PAGED_RESULTS_OID;

mod manage_dsa_it;
pub use self::manage_dsa_it::ManageDsaIt;

#[rustfmt::skip]
static CONTROLS: LazyLock<HashMap<&'static str, ControlType>> = LazyLock::new(|| {
    HashMap::from([
        (self::paged_results::PAGED_RESULTS_OID, ControlType::PagedResults),
        (self::manage_dsa_it::MANAGE_DSA_IT_OID, ControlType::ManageDsaIt),
    ])
});

/// Conversion trait for single control instances.
///
/// The [`LdapConn::with_controls()`](crate::LdapConn::with_controls) method accepts a vector
/// of controls, as dictated by the LDAP specification. However, it's expected that most uses
/// of controls involve a single instance, so constructing a vector at the call site is noisy.
/// If a control implements this trait, its single instance may be used in the call, and
/// a single-element vector is constructed internally.
pub trait IntoRawControlVec {
    /// Create a control vector.
    fn into(self) -> Vec<RawControl>;
}

/// Trivial implementation for a control vector, returning itself.
impl IntoRawControlVec for Vec<RawControl> {
    fn into(self) -> Vec<RawControl> {
        self
    }
}

/// Blanket implementation for any control. The vector is constructed by the conversion
/// method.
impl<R> IntoRawControlVec for R
where
    RawControl: From<R>,
{
    fn into(self) -> Vec<RawControl> {
        vec![std::convert::Into::into(self)]
    }
}

/// Mark a control as critical.
///
/// Controls provided by this library implement this trait. All controls
/// are instantiated as non-critical by default, unless dictated otherwise by
/// their specification.
pub trait MakeCritical {
    /// Mark the control instance as critical. This operation consumes the control,
    /// and is irreversible.
    fn critical(self) -> CriticalControl<Self>
    where
        Self: Sized,
    {
        CriticalControl { control: self }
    }
}

/// Wrapper for a control marked as critical.
///
/// The wrapper ensures that the criticality of the control will be set to
/// true when the control is encoded.
pub struct CriticalControl<T> {
    control: T,
}

impl<T> From<CriticalControl<T>> for RawControl
where
    T: Into<RawControl>,
{
    fn from(cc: CriticalControl<T>) -> RawControl {
        let mut rc = cc.control.into();
        rc.crit = true;
        rc
    }
}

/// Conversion trait for response controls.
pub trait ControlParser: Sized {
    /// Convert the raw BER value into a control-specific struct.
    fn parse(val: &[u8]) -> Result<Self>;
}

/// Response control.
///
/// If the OID is recognized as corresponding to one of controls implemented by this
/// library while parsing raw BER data of the response, the first element will have
/// a value, otherwise it will be `None`.
#[derive(Clone, Debug)]
pub struct Control(pub Option<ControlType>, pub RawControl);

impl From<RawControl> for Control {
    fn from(raw: RawControl) -> Control {
        let known_type = CONTROLS.get(raw.ctype.as_str()).copied();
        Control(known_type, raw)
    }
}

/// Generic control.
///
/// This struct can be used both for request and response controls. For requests, an
/// independently implemented control can produce an instance of this type and use it
/// to provide an element of the vector passed to
/// [`with_controls()`](../struct.LdapConn.html#method.with_controls) by calling
/// `into()` on the instance.
///
/// For responses, an instance is packed into a [`Control`](struct.Control.html) and
/// can be parsed by calling type-qualified [`parse()`](#method.parse) on that instance,
/// if a [`ControlParser`](trait.ControlParser.html) implementation exists for the
/// specified type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawControl {
    /// OID of the control.
    pub ctype: String,
    /// Criticality, has no meaning on response.
    pub crit: bool,
    /// Raw value of the control, if any.
    pub val: Option<Vec<u8>>,
}

impl RawControl {
    /// Parse the generic control into a control-specific struct.
    ///
    /// A control without a value can't be parsed, and produces an error.
    pub fn parse<T: ControlParser>(&self) -> Result<T> {
        match self.val {
            Some(ref val) => T::parse(val),
            None => Err(LdapError::SocketReceive(format!(
                "control {} has no value",
                self.ctype
            ))),
        }
    }
}

pub fn build_tag(rc: RawControl) -> StructureTag {
    let mut seq = vec![Tag::OctetString(OctetString {
        inner: Vec::from(rc.ctype.as_bytes()),
        ..Default::default()
    })];
    if rc.crit {
        seq.push(Tag::Boolean(Boolean {
            inner: true,
            ..Default::default()
        }));
    }
    if let Some(val) = rc.val {
        seq.push(Tag::OctetString(OctetString {
            inner: val,
            ..Default::default()
        }));
    }
    Tag::Sequence(Sequence {
        inner: seq,
        ..Default::default()
    })
    .into_structure()
}

fn control_error(what: &str) -> LdapError {
    LdapError::SocketReceive(format!("malformed control: {}", what))
}

pub fn parse_controls(t: StructureTag) -> Result<Vec<Control>> {
    let tags = t
        .expect_constructed()
        .ok_or_else(|| control_error("sequence"))?
        .into_iter();
    let mut ctrls = Vec::new();
    for ctrl in tags {
        let mut components = ctrl
            .expect_constructed()
            .ok_or_else(|| control_error("components"))?
            .into_iter();
        let ctype = components
            .next()
            .and_then(|t| t.expect_primitive())
            .and_then(|v| String::from_utf8(v).ok())
            .ok_or_else(|| control_error("control type"))?;
        let (crit, maybe_val) = match components.next() {
            None => (false, None),
            Some(c) => match c {
                StructureTag {
                    id,
                    payload: PL::P(ref v),
                    ..
                } if id == Types::Boolean as u64 => {
                    (v.first().map_or(false, |b| *b != 0), components.next())
                }
                StructureTag { id, .. } if id == Types::OctetString as u64 => (false, Some(c)),
                _ => return Err(control_error("criticality")),
            },
        };
        let val = match maybe_val {
            Some(v) => Some(v.expect_primitive().ok_or_else(|| control_error("value"))?),
            None => None,
        };
        ctrls.push(Control::from(RawControl { ctype, crit, val }));
    }
    Ok(ctrls)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn controls_round_trip_through_tags() {
        let raw: RawControl = std::convert::Into::into(ManageDsaIt.critical());
        let wrapped = Tag::Sequence(Sequence {
            inner: vec![Tag::StructureTag(build_tag(raw.clone()))],
            ..Default::default()
        })
        .into_structure();
        let parsed = parse_controls(wrapped).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].0, Some(ControlType::ManageDsaIt));
        assert_eq!(parsed[0].1, raw);
    }

    #[test]
    fn unknown_control_type() {
        let raw = RawControl {
            ctype: "1.2.3.4".into(),
            crit: false,
            val: Some(b"x".to_vec()),
        };
        let ctrl = Control::from(raw);
        assert!(ctrl.0.is_none());
        assert!(ctrl.1.parse::<PagedResults>().is_err());
    }
}
