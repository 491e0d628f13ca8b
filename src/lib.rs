//! LDAP client connections with pluggable execution strategies.
//!
//! ## Usage
//!
//! In `Cargo.toml`:
//!
//! ```toml
//! [dependencies.ldapcore]
//! version = "0.3.0"
//! ```
//!
//! ## Summary
//!
//! The [`LdapConn`](struct.LdapConn.html) structure is the starting point for all operations.
//! How an operation reaches the directory is decided by the
//! [`ClientStrategy`](enum.ClientStrategy.html) given in the
//! [`LdapConnSettings`](struct.LdapConnSettings.html) of the connection:
//!
//! * __Sync__: one blocking socket, one operation at a time.
//!
//! * __Restartable__: like Sync, but a connection failure is followed by reconnecting,
//!   possibly to another server of a [`ServerPool`](struct.ServerPool.html), restoring
//!   TLS and the last bind, and repeating the operation.
//!
//! * __Reusable__: a pool of restartable connections, each served by its own worker thread.
//!   Pools can be shared by name through a [`PoolRegistry`](strategy/struct.PoolRegistry.html).
//!
//! * __Ldif__: write operations are rendered as LDIF change records instead of being sent.
//!
//! * __MockSync__ and __MockAsync__: operations are answered from an in-memory
//!   [`Dit`](struct.Dit.html) attached to a mock [`Server`](struct.Server.html).
//!
//! The documentation is written for readers familiar with LDAP concepts and terminology,
//! which it won't attempt to explain.
//!
//! ## Compile-time features
//!
//! * __tls__ (enabled by default): TLS support, backed by the `native-tls` crate, which uses
//!   a platform-specific TLS backend. This is an alias for __tls-native__.
//!
//! Without any features, only plain TCP connections (and Unix domain sockets on Unix-like
//! platforms) are available.
//!
//! ## Example
//!
//! ```rust,no_run
//! use ldapcore::{ClientStrategy, LdapConn, LdapConnSettings, Scope, SearchEntry};
//! use ldapcore::result::Result;
//!
//! fn main() -> Result<()> {
//!     let settings = LdapConnSettings::new().set_strategy(ClientStrategy::Restartable);
//!     let mut ldap = LdapConn::with_settings(settings, "ldap://localhost:2389")?;
//!     let (rs, _res) = ldap.search(
//!         "ou=Places,dc=example,dc=org",
//!         Scope::Subtree,
//!         "(&(objectClass=locality)(l=ma*))",
//!         vec!["l"]
//!     )?.success()?;
//!     for entry in rs {
//!         println!("{:?}", SearchEntry::construct(entry));
//!     }
//!     Ok(ldap.unbind()?)
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

#[doc(hidden)]
#[macro_use]
pub extern crate log;

/// Type alias for the LDAP message ID.
pub type RequestId = i32;

pub mod asn1 {
    //! ASN.1 structure construction and parsing.
    //!
    //! If you need examples of using this interface for, e.g., implementing a new
    //! extended operation or a control, consult the source of existing exops/controls.
    pub use lber::common::TagClass;
    pub use lber::parse::{parse_tag, parse_uint};
    pub use lber::structure::{StructureTag, PL};
    pub use lber::structures::{
        ASNTag, Boolean, Enumerated, ExplicitTag, Integer, Null, OctetString, Sequence, Set, Tag,
    };
    pub use lber::universal::Types;
    pub use lber::write;
}
mod conn;
pub mod controls {
    //! Control construction and parsing.
    //!
    //! A control can be associated with a request or a response. The
    //! [`PagedResults`](struct.PagedResults.html) and [`ManageDsaIt`](struct.ManageDsaIt.html)
    //! controls are implemented directly by this library.
    //!
    //! A request control can be created by instantiating its structure and converting
    //! it to ASN.1 with `into()` when passing the instance or constructing the request
    //! control vector in the call to [`with_controls()`](../struct.LdapConn.html#method.with_controls).
    //! A third-party control must implement the conversion from an instance
    //! of itself to [`RawControl`](struct.RawControl.html), a general form of control.
    //!
    //! A recognized response control can be parsed by calling
    //! [`parse()`](struct.RawControl.html#method.parse) on the instance of `RawControl`
    //! representing it. A third-party control must implement the
    //! [`ControlParser`](trait.ControlParser.html) trait to support this interface.
    pub use crate::controls_impl::{
        Control, ControlParser, ControlType, CriticalControl, IntoRawControlVec, MakeCritical,
        RawControl,
    };
    pub use crate::controls_impl::{ManageDsaIt, PagedResults};
    pub(crate) use crate::controls_impl::PAGED_RESULTS_OID;
}
mod controls_impl;
mod dit;
mod exop_impl;
pub mod exop {
    //! Extended operation construction and parsing.
    //!
    //! A generic exop is represented by [`Exop`](struct.Exop.html). A request struct
    //! must implement the `From` conversion of itself into `Exop`. A response struct
    //! must implement the [`ExopParser`](trait.ExopParser.html) trait.
    pub use crate::exop_impl::{
        Exop, ExopParser, StartTLS, WhoAmI, WhoAmIResp, STARTTLS_OID, WHOAMI_OID,
    };
}
mod filter;
mod ldap;
mod protocol;
mod request;
pub mod result;
mod search;
mod server;
pub mod strategy;
mod util;

pub use conn::{ClientStrategy, LdapConnSettings, Usage};
pub use dit::{Attribute, Dit, DitError, Entry, MockSchema};
pub use filter::parse as parse_filter;
pub use filter::{
    AttributeAssertion, ExtensibleAssertion, Filter, FilterNode, FilterTag, SubstringAssertion,
};
pub use ldap::LdapConn;
pub use protocol::compute_message_length;
pub use request::{BindAuth, Change, Mod, ModOp, Request, SearchRequest};
pub use result::{
    CompareResult, ErrorKind, ExopResult, LdapError, LdapResult, Response, ResponseType,
    RetryRecord, SearchResult,
};
pub use search::parse_refs;
pub use search::{DerefAliases, ResultEntry, Scope, SearchEntry, SearchOptions};
pub use server::{DsaInfo, PoolingStrategy, Scheme, Server, ServerPool};
pub use strategy::{ConnectionPool, PoolRegistry, WorkerState};
pub use util::{
    dn_escape, get_url_params, ldap_escape, ldap_unescape, normalize_dn, parent_dn, parse_rdn,
    split_dn, LdapUrlParams,
};
