use crate::result::Result;

use lber::common::TagClass;
use lber::structures::{OctetString, Sequence, Tag};

mod starttls;
pub use self::starttls::{StartTLS, STARTTLS_OID};

mod whoami;
pub use self::whoami::{WhoAmI, WhoAmIResp, WHOAMI_OID};

/// Generic extended operation.
///
/// Since the same struct can be used both for requests and responses,
/// both fields must be declared as optional; when sending an extended
/// request, `name` must not be `None`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Exop {
    /// OID of the operation. It may be absent in the response.
    pub name: Option<String>,
    /// Request or response value. It may be absent in both cases.
    pub val: Option<Vec<u8>>,
}

impl Exop {
    /// Parse the generic exop into a exop-specific struct.
    ///
    /// A missing value is handed to the parser as an empty slice.
    pub fn parse<T: ExopParser>(&self) -> Result<T> {
        T::parse(self.val.as_deref().unwrap_or_default())
    }
}

/// Conversion trait for Extended response values.
pub trait ExopParser: Sized {
    /// Convert the raw BER value into an exop-specific struct.
    fn parse(val: &[u8]) -> Result<Self>;
}

pub fn construct_exop(exop: Exop) -> Vec<Tag> {
    let mut seq = vec![Tag::OctetString(OctetString {
        id: 0,
        class: TagClass::Context,
        inner: exop.name.unwrap_or_default().into_bytes(),
    })];
    if let Some(val) = exop.val {
        seq.push(Tag::OctetString(OctetString {
            id: 1,
            class: TagClass::Context,
            inner: val,
        }));
    }
    seq
}

pub(crate) fn exop_tag(exop: Exop) -> Tag {
    Tag::Sequence(Sequence {
        id: 23,
        class: TagClass::Application,
        inner: construct_exop(exop),
    })
}
