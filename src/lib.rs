//! Hardened intake layer for untrusted external input
//!
//! Converts untrusted remote input into validated internal data without
//! letting the parser itself become an attack surface:
//! - Policy-bounded XML parsing (no DTD/external entities by default,
//!   size / depth / expansion limits)
//! - Declarative record extraction from the parsed tree
//! - Allow-list URL validation with boundary-aware host matching
//!
//! The crate performs no I/O: it receives bytes and policy, and returns
//! either a validated value or a typed rejection. What to do with a
//! validated record or URL is the caller's business.

pub mod allowlist;
pub mod document;
pub mod record;

pub use allowlist::{validate, AllowListPolicy, ParsedHost, RejectReason, ValidationOutcome};
pub use document::{parse, Document, Element, ParseError, ParserPolicy};
pub use record::{
    extract, extract_all, BlogRecord, DuplicatePolicy, ExtractionError, FieldMap, FieldSpec,
    Record,
};
