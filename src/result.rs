//! Operation result structures and helpers.
//!
//! Most LDAP operations return an [`LdapResult`](struct.LdapResult.html), usually as a
//! part of a [`Response`](struct.Response.html). This module contains their definitions,
//! the error type shared by the whole crate, and a number of wrapper structs with helper
//! methods which adapt LDAP result handling to be a closer match to Rust conventions.

use std::error::Error;
use std::fmt;
use std::io;
use std::result::Result as StdResult;
use std::time::{Duration, SystemTime};

use crate::controls::Control;
use crate::exop::Exop;
use crate::search::{parse_refs, ResultEntry};
use crate::RequestId;

use lber::common::TagClass;
use lber::parse::parse_uint;
use lber::structure::StructureTag;
use lber::universal::Types;

use thiserror::Error;

/// Type alias for the standard `Result` with the fixed `LdapError` error part.
pub type Result<T> = std::result::Result<T, LdapError>;

/// Broad classification of errors, used to decide whether a failure may be retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid settings or arguments, detected before anything is sent.
    Configuration,
    /// Socket connect, send or receive failure.
    Transport,
    /// Corrupted or unexpected data on the stream.
    Protocol,
    /// The server returned a result code which was turned into an error.
    Operation,
    /// The restart budget of a connection was spent.
    RetriesExhausted,
    /// No pooled worker produced a result in time.
    Timeout,
    /// An operation the chosen strategy can't express.
    Definition,
}

/// One failed attempt recorded by a restartable connection.
#[derive(Clone, Debug)]
pub struct RetryRecord {
    /// When the attempt failed.
    pub time: SystemTime,
    /// Kind of the error which ended the attempt.
    pub kind: ErrorKind,
    /// Error message.
    pub message: String,
}

impl RetryRecord {
    pub(crate) fn from_error(e: &LdapError) -> RetryRecord {
        RetryRecord {
            time: SystemTime::now(),
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Error variants recognized by the library.
#[derive(Debug, Error)]
pub enum LdapError {
    /// No path given for a `ldapi://` URL.
    #[error("empty Unix domain socket path")]
    EmptyUnixPath,

    /// A `ldapi://` URL contains a port spec, which it shouldn't.
    #[error("the port must be empty in the ldapi scheme")]
    PortInUnixPath,

    /// Encapsulated I/O error.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// Error parsing the string representation of a search filter.
    #[error("filter parse error")]
    FilterParsing,

    /// The server closed the stream before a complete response arrived.
    #[error("premature end of stream")]
    EndOfStream,

    /// URL parsing error.
    #[error("url parse error: {source}")]
    UrlParsing {
        #[from]
        source: url::ParseError,
    },

    /// Unknown LDAP URL scheme.
    #[error("unknown LDAP URL scheme: {0}")]
    UnknownScheme(String),

    #[cfg(feature = "tls-native")]
    /// Native TLS library error.
    #[error("native TLS error: {source}")]
    NativeTLS {
        #[from]
        source: native_tls::Error,
    },

    /// LDAP operation result with an error return code.
    #[error("LDAP operation result: {result}")]
    LdapResult {
        #[from]
        result: LdapResult,
    },

    /// No values provided for the Add operation.
    #[error("empty value set for Add")]
    AddNoValues,

    /// Error converting an octet- or percent-decoded string to UTF-8.
    #[error("utf8 decoding error")]
    DecodingUTF8,

    /// Invalid scope string in LDAP URL.
    #[error("invalid scope string in LDAP URL: {0}")]
    InvalidScopeString(String),

    /// Invalid connection setting.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A reusable pool can't be registered under an empty name.
    #[error("invalid pool name")]
    InvalidPoolName,

    /// An operation was submitted to a reusable pool which isn't running.
    #[error("{0}")]
    PoolNotStarted(String),

    /// Every server in the server pool is temporarily excluded.
    #[error("no available server in the server pool")]
    PoolExhausted,

    /// A write operation was attempted on a read-only connection.
    #[error("connection is read-only")]
    ReadOnly,

    /// The socket isn't open for sending.
    #[error("{0}")]
    SocketNotOpen(String),

    /// The server sent a Notice of Disconnection, or closed the connection.
    #[error("session terminated by server")]
    SessionTerminated,

    /// Unexpected or malformed data received from the server.
    #[error("socket receive error: {0}")]
    SocketReceive(String),

    /// `get_response()` was called with an id which isn't awaiting a response.
    #[error("message id {0} not in outstanding queue")]
    NotOutstanding(RequestId),

    /// Referral chasing went deeper than allowed.
    #[error("referral hop limit exceeded")]
    ReferralHopLimit,

    /// The restartable strategy gave up.
    #[error("{message} ({} failed attempts)", .history.len())]
    MaxRetries {
        message: String,
        history: Vec<RetryRecord>,
        tries: Option<u32>,
    },

    /// No result arrived from the connection pool in time.
    #[error("no response from server after {0:?}")]
    ResponseTimeout(Duration),

    /// The operation can't be performed with the selected strategy.
    #[error("definition error: {0}")]
    Definition(String),
}

impl LdapError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LdapError::Io { .. }
            | LdapError::EndOfStream
            | LdapError::SocketNotOpen(_)
            | LdapError::SessionTerminated
            | LdapError::PoolExhausted => ErrorKind::Transport,
            #[cfg(feature = "tls-native")]
            LdapError::NativeTLS { .. } => ErrorKind::Transport,
            LdapError::SocketReceive(_) => ErrorKind::Protocol,
            LdapError::LdapResult { .. } | LdapError::ReferralHopLimit => ErrorKind::Operation,
            LdapError::MaxRetries { .. } => ErrorKind::RetriesExhausted,
            LdapError::ResponseTimeout(_) => ErrorKind::Timeout,
            LdapError::Definition(_) | LdapError::NotOutstanding(_) => ErrorKind::Definition,
            LdapError::EmptyUnixPath
            | LdapError::PortInUnixPath
            | LdapError::FilterParsing
            | LdapError::UrlParsing { .. }
            | LdapError::UnknownScheme(_)
            | LdapError::AddNoValues
            | LdapError::DecodingUTF8
            | LdapError::InvalidScopeString(_)
            | LdapError::Configuration(_)
            | LdapError::InvalidPoolName
            | LdapError::PoolNotStarted(_)
            | LdapError::ReadOnly => ErrorKind::Configuration,
        }
    }

    /// Returns true if reconnecting and repeating the operation may succeed.
    pub fn is_recoverable(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }
}

impl From<LdapError> for io::Error {
    fn from(le: LdapError) -> io::Error {
        match le {
            LdapError::Io { source, .. } => source,
            _ => io::Error::new(io::ErrorKind::Other, format!("{}", le)),
        }
    }
}

/// Protocol operation which carried a result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseType {
    BindResponse,
    SearchResEntry,
    SearchResDone,
    SearchResRef,
    ModifyResponse,
    AddResponse,
    DelResponse,
    ModDnResponse,
    CompareResponse,
    ExtendedResp,
    IntermediateResponse,
}

impl ResponseType {
    /// Map the application tag number of a protocol op to its type.
    pub fn from_id(id: u64) -> Option<ResponseType> {
        Some(match id {
            1 => ResponseType::BindResponse,
            4 => ResponseType::SearchResEntry,
            5 => ResponseType::SearchResDone,
            7 => ResponseType::ModifyResponse,
            9 => ResponseType::AddResponse,
            11 => ResponseType::DelResponse,
            13 => ResponseType::ModDnResponse,
            15 => ResponseType::CompareResponse,
            19 => ResponseType::SearchResRef,
            24 => ResponseType::ExtendedResp,
            25 => ResponseType::IntermediateResponse,
            _ => return None,
        })
    }

    /// Name of the protocol op, as used in RFC 4511.
    pub fn name(self) -> &'static str {
        match self {
            ResponseType::BindResponse => "bindResponse",
            ResponseType::SearchResEntry => "searchResEntry",
            ResponseType::SearchResDone => "searchResDone",
            ResponseType::SearchResRef => "searchResRef",
            ResponseType::ModifyResponse => "modifyResponse",
            ResponseType::AddResponse => "addResponse",
            ResponseType::DelResponse => "delResponse",
            ResponseType::ModDnResponse => "modDNResponse",
            ResponseType::CompareResponse => "compareResponse",
            ResponseType::ExtendedResp => "extendedResp",
            ResponseType::IntermediateResponse => "intermediateResponse",
        }
    }

    /// True for the messages which precede the final one in a multi-message response.
    pub fn is_partial(self) -> bool {
        matches!(
            self,
            ResponseType::SearchResEntry
                | ResponseType::SearchResRef
                | ResponseType::IntermediateResponse
        )
    }
}

/// Common components of an LDAP operation result.
///
/// This structure faithfully replicates the components dictated by the standard,
/// and is distinctly C-like with its reliance on numeric codes for the indication
/// of outcome. The helper methods [`success()`](#method.success) and
/// [`non_error()`](#method.non_error) may be used for ergonomic error handling
/// when simple condition checking suffices.
#[derive(Clone, Debug)]
pub struct LdapResult {
    /// Result code.
    ///
    /// Generally, the value of zero indicates successful completion, but there's
    /// a number of other non-error codes arising as a result of various operations.
    /// See [Section A.1 of RFC 4511](https://tools.ietf.org/html/rfc4511#appendix-A.1).
    pub rc: u32,
    /// Matched component DN, where applicable.
    pub matched: String,
    /// Additional diagnostic text.
    pub text: String,
    /// Referrals.
    ///
    /// Absence of referrals is represented by an empty vector.
    pub refs: Vec<String>,
    /// Response controls.
    ///
    /// Missing and empty controls are both represented by an empty vector.
    pub ctrls: Vec<Control>,
    /// Protocol op which carried the result.
    pub rtype: ResponseType,
}

impl Error for LdapResult {}

impl fmt::Display for LdapResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> StdResult<(), fmt::Error> {
        write!(
            f,
            "rc={} ({}), dn: \"{}\", text: \"{}\"",
            self.rc,
            self.description(),
            self.matched,
            self.text
        )
    }
}

impl LdapResult {
    pub(crate) fn new(rtype: ResponseType, rc: u32, text: impl Into<String>) -> LdapResult {
        LdapResult {
            rc,
            matched: String::new(),
            text: text.into(),
            refs: vec![],
            ctrls: vec![],
            rtype,
        }
    }

    /// Symbolic name of the result code.
    pub fn description(&self) -> &'static str {
        match self.rc {
            0 => "success",
            1 => "operationsError",
            2 => "protocolError",
            3 => "timeLimitExceeded",
            4 => "sizeLimitExceeded",
            5 => "compareFalse",
            6 => "compareTrue",
            7 => "authMethodNotSupported",
            8 => "strongerAuthRequired",
            10 => "referral",
            11 => "adminLimitExceeded",
            12 => "unavailableCriticalExtension",
            13 => "confidentialityRequired",
            14 => "saslBindInProgress",
            16 => "noSuchAttribute",
            17 => "undefinedAttributeType",
            18 => "inappropriateMatching",
            19 => "constraintViolation",
            20 => "attributeOrValueExists",
            21 => "invalidAttributeSyntax",
            32 => "noSuchObject",
            33 => "aliasProblem",
            34 => "invalidDNSyntax",
            36 => "aliasDereferencingProblem",
            48 => "inappropriateAuthentication",
            49 => "invalidCredentials",
            50 => "insufficientAccessRights",
            51 => "busy",
            52 => "unavailable",
            53 => "unwillingToPerform",
            54 => "loopDetect",
            64 => "namingViolation",
            65 => "objectClassViolation",
            66 => "notAllowedOnNonLeaf",
            67 => "notAllowedOnRDN",
            68 => "entryAlreadyExists",
            69 => "objectClassModsProhibited",
            71 => "affectsMultipleDSAs",
            80 => "other",
            88 => "abandoned",
            122 => "assertionFailed",
            _ => "unknown",
        }
    }

    /// If the result code is zero, return the instance itself wrapped
    /// in `Ok()`, otherwise wrap the instance in an `LdapError`.
    pub fn success(self) -> Result<Self> {
        if self.rc == 0 {
            Ok(self)
        } else {
            Err(LdapError::from(self))
        }
    }

    /// If the result code is 0 or 10 (referral), return the instance
    /// itself wrapped in `Ok()`, otherwise wrap the instance in an
    /// `LdapError`.
    pub fn non_error(self) -> Result<Self> {
        if self.rc == 0 || self.rc == 10 {
            Ok(self)
        } else {
            Err(LdapError::from(self))
        }
    }

    /// Result codes which are never turned into errors by a connection
    /// configured to raise on unsuccessful results.
    pub(crate) fn never_raised(&self) -> bool {
        matches!(self.rc, 0 | 5 | 6 | 10 | 14)
    }
}

#[derive(Clone, Debug)]
pub(crate) struct LdapResultExt(pub LdapResult, pub Exop, pub Option<Vec<u8>>);

fn malformed(what: &str) -> LdapError {
    LdapError::SocketReceive(format!("malformed {}", what))
}

fn octet_string(t: Option<StructureTag>, what: &str) -> Result<String> {
    let bytes = t
        .and_then(|t| t.expect_primitive())
        .ok_or_else(|| malformed(what))?;
    String::from_utf8(bytes).map_err(|_| malformed(what))
}

impl TryFrom<StructureTag> for LdapResultExt {
    type Error = LdapError;

    fn try_from(t: StructureTag) -> Result<LdapResultExt> {
        let rtype = ResponseType::from_id(t.id).ok_or_else(|| malformed("response type"))?;
        let mut tags = t
            .expect_constructed()
            .ok_or_else(|| malformed("result sequence"))?
            .into_iter();
        let rc = tags
            .next()
            .and_then(|t| t.match_class(TagClass::Universal))
            .and_then(|t| t.match_id(Types::Enumerated as u64))
            .and_then(|t| t.expect_primitive())
            .and_then(|v| parse_uint(v.as_slice()).ok().map(|(_, rc)| rc as u32))
            .ok_or_else(|| malformed("result code"))?;
        let matched = octet_string(tags.next(), "matched dn")?;
        let text = octet_string(tags.next(), "diagnostic message")?;
        let mut refs = Vec::new();
        let mut exop_name = None;
        let mut exop_val = None;
        let mut sasl_creds = None;
        for comp in tags {
            match comp.id {
                3 => refs.extend(parse_refs(comp)?),
                7 => sasl_creds = comp.expect_primitive(),
                10 => exop_name = Some(octet_string(Some(comp), "exop name")?),
                11 => exop_val = comp.expect_primitive(),
                _ => (),
            }
        }
        Ok(LdapResultExt(
            LdapResult {
                rc,
                matched,
                text,
                refs,
                ctrls: vec![],
                rtype,
            },
            Exop {
                name: exop_name,
                val: exop_val,
            },
            sasl_creds,
        ))
    }
}

/// Complete outcome of one operation.
///
/// Besides the final result, a response gathers the messages which preceded it:
/// search entries, search references and intermediate responses, in arrival order.
#[derive(Clone, Debug)]
pub struct Response {
    /// Entries, references and intermediate messages.
    pub entries: Vec<ResultEntry>,
    /// Final result of the operation.
    pub result: LdapResult,
    /// Extended operation name and value, if the result carried them.
    pub exop: Exop,
    /// SASL credentials returned by the server in a Bind response.
    pub sasl_creds: Option<Vec<u8>>,
    /// LDIF rendering of the request, produced by the LDIF strategy.
    pub ldif: Option<String>,
}

impl Response {
    pub(crate) fn from_result(result: LdapResult) -> Response {
        Response {
            entries: vec![],
            result,
            exop: Exop::default(),
            sasl_creds: None,
            ldif: None,
        }
    }

    /// If the result code is zero, return the instance wrapped in `Ok()`,
    /// otherwise wrap the result in an `LdapError`.
    pub fn success(self) -> Result<Self> {
        if self.result.rc == 0 {
            Ok(self)
        } else {
            Err(LdapError::from(self.result))
        }
    }
}

/// Wrapper for results of a Search operation which returns all entries at once.
///
/// The wrapper exists so that methods [`success()`](#method.success) and
/// [`non_error()`](#method.non_error) can be called on an instance. Those methods
/// destructure the wrapper and return its components as elements of an anonymous
/// tuple.
#[derive(Clone, Debug)]
pub struct SearchResult(pub Vec<ResultEntry>, pub LdapResult);

impl From<Response> for SearchResult {
    fn from(resp: Response) -> SearchResult {
        SearchResult(resp.entries, resp.result)
    }
}

impl SearchResult {
    /// If the result code is zero, return an anonymous tuple of component structs
    /// wrapped in `Ok()`, otherwise wrap the `LdapResult` part in an `LdapError`.
    pub fn success(self) -> Result<(Vec<ResultEntry>, LdapResult)> {
        if self.1.rc == 0 {
            Ok((self.0, self.1))
        } else {
            Err(LdapError::from(self.1))
        }
    }

    /// If the result code is 0 or 10 (referral), return an anonymous tuple of component
    /// structs wrapped in `Ok()`, otherwise wrap the `LdapResult` part in an `LdapError`.
    pub fn non_error(self) -> Result<(Vec<ResultEntry>, LdapResult)> {
        if self.1.rc == 0 || self.1.rc == 10 {
            Ok((self.0, self.1))
        } else {
            Err(LdapError::from(self.1))
        }
    }
}

/// Wrapper for the result of a Compare operation.
///
/// Compare uniquely has two non-zero return codes to indicate the outcome of a successful
/// comparison, while other return codes indicate errors, as usual (except 10 for referral).
#[derive(Clone, Debug)]
pub struct CompareResult(pub LdapResult);

impl CompareResult {
    /// If the result code is 5 (compareFalse) or 6 (compareTrue), return the corresponding
    /// boolean value wrapped in `Ok()`, otherwise wrap the `LdapResult` part in an `LdapError`.
    pub fn equal(self) -> Result<bool> {
        match self.0.rc {
            5 => Ok(false),
            6 => Ok(true),
            _ => Err(LdapError::from(self.0)),
        }
    }

    /// If the result code is 5 (compareFalse), 6 (compareTrue),  or 10 (referral), return
    /// the inner `LdapResult`, otherwise rewrap `LdapResult` in an `LdapError`.
    pub fn non_error(self) -> Result<LdapResult> {
        if self.0.rc == 5 || self.0.rc == 6 || self.0.rc == 10 {
            Ok(self.0)
        } else {
            Err(LdapError::from(self.0))
        }
    }
}

/// Wrapper for the result of an Extended operation.
#[derive(Clone, Debug)]
pub struct ExopResult(pub Exop, pub LdapResult);

impl ExopResult {
    /// If the result code is zero, return an anonymous tuple of component structs
    /// wrapped in `Ok()`, otherwise wrap the `LdapResult` part in an `LdapError`.
    pub fn success(self) -> Result<(Exop, LdapResult)> {
        if self.1.rc == 0 {
            Ok((self.0, self.1))
        } else {
            Err(LdapError::from(self.1))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use lber::structures::{ASNTag, Enumerated, OctetString, Sequence, Tag};

    fn result_tag(id: u64, rc: i64, extra: Vec<Tag>) -> StructureTag {
        let mut inner = vec![
            Tag::Enumerated(Enumerated {
                inner: rc,
                ..Default::default()
            }),
            Tag::OctetString(OctetString {
                inner: b"dc=example".to_vec(),
                ..Default::default()
            }),
            Tag::OctetString(OctetString {
                inner: b"oops".to_vec(),
                ..Default::default()
            }),
        ];
        inner.extend(extra);
        Tag::Sequence(Sequence {
            id,
            class: TagClass::Application,
            inner,
        })
        .into_structure()
    }

    #[test]
    fn parse_plain_result() {
        let ext = LdapResultExt::try_from(result_tag(7, 32, vec![])).unwrap();
        assert_eq!(ext.0.rc, 32);
        assert_eq!(ext.0.matched, "dc=example");
        assert_eq!(ext.0.text, "oops");
        assert_eq!(ext.0.rtype, ResponseType::ModifyResponse);
        assert_eq!(ext.0.description(), "noSuchObject");
    }

    #[test]
    fn parse_exop_result() {
        let name = Tag::OctetString(OctetString {
            id: 10,
            class: TagClass::Context,
            inner: b"1.3.6.1.4.1.1466.20036".to_vec(),
        });
        let ext = LdapResultExt::try_from(result_tag(24, 52, vec![name])).unwrap();
        assert_eq!(ext.1.name.as_deref(), Some("1.3.6.1.4.1.1466.20036"));
        assert!(ext.1.val.is_none());
    }

    #[test]
    fn truncated_result_is_an_error() {
        let tag = Tag::Sequence(Sequence {
            id: 9,
            class: TagClass::Application,
            inner: vec![Tag::Enumerated(Enumerated {
                inner: 0,
                ..Default::default()
            })],
        })
        .into_structure();
        let err = LdapResultExt::try_from(tag).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn error_kinds() {
        assert!(LdapError::EndOfStream.is_recoverable());
        assert!(LdapError::SessionTerminated.is_recoverable());
        assert!(!LdapError::SocketReceive("x".into()).is_recoverable());
        assert_eq!(LdapError::InvalidPoolName.kind(), ErrorKind::Configuration);
        assert_eq!(
            LdapError::ResponseTimeout(Duration::from_secs(1)).kind(),
            ErrorKind::Timeout
        );
    }

    #[test]
    fn compare_outcomes() {
        let t = LdapResult::new(ResponseType::CompareResponse, 6, "");
        assert!(CompareResult(t).equal().unwrap());
        let f = LdapResult::new(ResponseType::CompareResponse, 5, "");
        assert!(!CompareResult(f).equal().unwrap());
        let e = LdapResult::new(ResponseType::CompareResponse, 16, "");
        assert!(CompareResult(e).equal().is_err());
    }
}
