use super::Exop;

pub const STARTTLS_OID: &str = "1.3.6.1.4.1.1466.20037";

/// StartTLS extended operation ([RFC 4511](https://tools.ietf.org/html/rfc4511#section-4.14)).
///
/// The request has no value. A successful response means the server expects the
/// TLS handshake to begin immediately on the same connection.
#[derive(Clone, Debug)]
pub struct StartTLS;

impl From<StartTLS> for Exop {
    fn from(_: StartTLS) -> Exop {
        Exop {
            name: Some(STARTTLS_OID.to_owned()),
            val: None,
        }
    }
}

impl Exop {
    pub(crate) fn is_starttls(&self) -> bool {
        self.name.as_deref() == Some(STARTTLS_OID)
    }
}
