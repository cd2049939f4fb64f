//! Hardened XML document parsing
//!
//! Parses untrusted XML into an immutable element tree under an explicit
//! [`ParserPolicy`]. The underlying quick-xml reader performs no entity
//! resolution and no I/O of its own; this module adds the policy checks on
//! top: DOCTYPE rejection, external-entity rejection, and size / depth /
//! expansion limits enforced before the corresponding work is done.
//!
//! Declared external (`SYSTEM` / `PUBLIC`) entities are never fetched under
//! any policy. Opting into `allow_external_entities` only stops the DTD scan
//! from rejecting their declarations; a reference to one still fails as
//! [`ParseError::Malformed`] because no resolver exists to satisfy it.

use std::collections::HashMap;

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Serialize;
use thiserror::Error;

/// Nested expansions deeper than this are treated as a cycle.
const MAX_ENTITY_RECURSION: usize = 16;

/// Parsing limits and feature toggles for a single `parse` call.
///
/// Default construction is maximally restrictive: no DTD processing, no
/// external entities. Setting either flag is an explicit opt-in to a
/// lower-security mode.
#[derive(Debug, Clone, Serialize)]
pub struct ParserPolicy {
    /// Accept a document type declaration (internal entities only).
    pub allow_dtd: bool,
    /// Accept `SYSTEM` / `PUBLIC` identifiers inside an allowed DTD.
    /// External entities are still never resolved.
    pub allow_external_entities: bool,
    /// Input larger than this is rejected before any parsing starts.
    pub max_document_bytes: usize,
    /// Maximum element nesting depth.
    pub max_element_depth: usize,
    /// Budget, in bytes, for text produced by entity expansion.
    pub max_expanded_size: usize,
}

impl Default for ParserPolicy {
    fn default() -> Self {
        Self {
            allow_dtd: false,
            allow_external_entities: false,
            max_document_bytes: 8 * 1024 * 1024,
            max_element_depth: 64,
            max_expanded_size: 64 * 1024,
        }
    }
}

/// Error from [`parse`]. Security-relevant rejections (`DtdDisallowed`,
/// the limit variants) are distinct from ordinary `Malformed` input so
/// callers can audit them separately.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed document: {0}")]
    Malformed(String),
    #[error("document type declarations are not allowed by policy")]
    DtdDisallowed,
    #[error("document is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("element nesting exceeds the limit of {limit}")]
    TooDeep { limit: usize },
    #[error("entity expansion exceeds the limit of {limit} bytes")]
    EntityExpansionExceeded { limit: usize },
}

/// Single element in a parsed document: a name, ordered child elements,
/// and the element's own text content (verbatim, references resolved).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Element {
    name: String,
    children: Vec<Element>,
    text: String,
}

impl Element {
    fn new(name: String) -> Self {
        Self {
            name,
            children: Vec::new(),
            text: String::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Direct text content, exactly as written (no trimming).
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter()
    }

    /// First direct child with the given name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// All direct children with the given name, in document order.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.name == name)
    }
}

/// Immutable result of a successful parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Document {
    root: Element,
}

impl Document {
    pub fn root(&self) -> &Element {
        &self.root
    }
}

/// Parse untrusted bytes into a [`Document`] under the given policy.
///
/// The size limit is checked before a reader is even constructed; depth and
/// expansion limits are checked as the document is walked, never after the
/// fact.
pub fn parse(bytes: &[u8], policy: &ParserPolicy) -> Result<Document, ParseError> {
    if bytes.len() > policy.max_document_bytes {
        tracing::debug!(
            size = bytes.len(),
            limit = policy.max_document_bytes,
            "rejecting oversized document before parsing"
        );
        return Err(ParseError::TooLarge {
            size: bytes.len(),
            limit: policy.max_document_bytes,
        });
    }

    let text = std::str::from_utf8(bytes)
        .map_err(|_| ParseError::Malformed("document is not valid UTF-8".into()))?;

    let mut reader = Reader::from_str(text);
    reader.config_mut().expand_empty_elements = true;

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;
    let mut entities: HashMap<String, String> = HashMap::new();
    // Bytes produced by entity expansion so far, across the whole document.
    let mut expanded: usize = 0;

    loop {
        match reader.read_event() {
            Ok(Event::DocType(e)) => {
                if !policy.allow_dtd {
                    tracing::debug!("rejecting document type declaration");
                    return Err(ParseError::DtdDisallowed);
                }
                let dtd = String::from_utf8_lossy(&e).into_owned();
                if !policy.allow_external_entities && has_external_identifiers(&dtd) {
                    tracing::debug!("rejecting DTD with external identifiers");
                    return Err(ParseError::DtdDisallowed);
                }
                collect_internal_entities(&dtd, &mut entities);
            }
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if root.is_some() && stack.is_empty() {
                    return Err(ParseError::Malformed(format!(
                        "unexpected second root element `{name}`"
                    )));
                }
                if stack.len() >= policy.max_element_depth {
                    return Err(ParseError::TooDeep {
                        limit: policy.max_element_depth,
                    });
                }
                stack.push(Element::new(name));
            }
            Ok(Event::End(_)) => {
                let el = stack.pop().ok_or_else(|| {
                    ParseError::Malformed("closing tag without an open element".into())
                })?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(el),
                    None => root = Some(el),
                }
            }
            Ok(Event::Text(e)) => {
                // The reader reports references as separate GeneralRef
                // events, so text content carries no entity syntax.
                let content = e
                    .decode()
                    .map_err(|err| ParseError::Malformed(err.to_string()))?;
                match stack.last_mut() {
                    Some(top) => top.text.push_str(&content),
                    None if content.trim().is_empty() => {}
                    None => {
                        return Err(ParseError::Malformed(
                            "text content outside of the root element".into(),
                        ))
                    }
                }
            }
            Ok(Event::CData(e)) => {
                let content = String::from_utf8_lossy(&e).into_owned();
                match stack.last_mut() {
                    Some(top) => top.text.push_str(&content),
                    None => {
                        return Err(ParseError::Malformed(
                            "CDATA outside of the root element".into(),
                        ))
                    }
                }
            }
            Ok(Event::GeneralRef(e)) => {
                let name = String::from_utf8_lossy(&e).into_owned();
                let top = stack.last_mut().ok_or_else(|| {
                    ParseError::Malformed("reference outside of the root element".into())
                })?;
                resolve_reference(
                    &name,
                    &entities,
                    &mut top.text,
                    &mut expanded,
                    policy.max_expanded_size,
                    0,
                )?;
            }
            Ok(Event::Eof) => break,
            Ok(_) => {} // declaration, comments, processing instructions
            Err(e) => return Err(ParseError::Malformed(e.to_string())),
        }
    }

    if !stack.is_empty() {
        return Err(ParseError::Malformed("unexpected end of document".into()));
    }
    let root = root.ok_or_else(|| ParseError::Malformed("document has no root element".into()))?;
    Ok(Document { root })
}

/// True when the DTD carries `SYSTEM` or `PUBLIC` identifiers. Conservative:
/// a quoted literal containing either word is also rejected.
fn has_external_identifiers(dtd: &str) -> bool {
    let upper = dtd.to_ascii_uppercase();
    upper.contains("SYSTEM") || upper.contains("PUBLIC")
}

/// Collect `<!ENTITY name "value">` declarations from an internal subset.
/// Parameter entities (`%`) are skipped; external declarations carry no
/// inline value and are caught by the identifier scan.
fn collect_internal_entities(dtd: &str, entities: &mut HashMap<String, String>) {
    let mut rest = dtd;
    while let Some(pos) = rest.find("<!ENTITY") {
        rest = &rest[pos + "<!ENTITY".len()..];
        let decl = rest.trim_start();
        if decl.starts_with('%') {
            continue;
        }
        let Some(name_end) = decl.find(|c: char| c.is_whitespace()) else {
            break;
        };
        let name = &decl[..name_end];
        let after_name = decl[name_end..].trim_start();
        let Some(quote) = after_name.chars().next().filter(|c| *c == '"' || *c == '\'') else {
            continue;
        };
        let value_start = &after_name[1..];
        let Some(value_end) = value_start.find(quote) else {
            continue;
        };
        entities.insert(name.to_string(), value_start[..value_end].to_string());
        rest = &value_start[value_end..];
    }
}

/// Resolve one reference name into `out`, charging every produced byte
/// against the expansion budget. Declared entities expand recursively so a
/// nested bomb fails on the budget long before its full size is allocated.
fn resolve_reference(
    name: &str,
    entities: &HashMap<String, String>,
    out: &mut String,
    expanded: &mut usize,
    limit: usize,
    depth: usize,
) -> Result<(), ParseError> {
    if depth > MAX_ENTITY_RECURSION {
        return Err(ParseError::EntityExpansionExceeded { limit });
    }

    if let Some(rest) = name.strip_prefix('#') {
        let code = if let Some(hex) = rest.strip_prefix('x').or_else(|| rest.strip_prefix('X')) {
            u32::from_str_radix(hex, 16).ok()
        } else {
            rest.parse::<u32>().ok()
        };
        let ch = code.and_then(char::from_u32).ok_or_else(|| {
            ParseError::Malformed(format!("invalid character reference `&{name};`"))
        })?;
        charge(expanded, ch.len_utf8(), limit)?;
        out.push(ch);
        return Ok(());
    }

    let predefined = match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "apos" => Some('\''),
        "quot" => Some('"'),
        _ => None,
    };
    if let Some(ch) = predefined {
        charge(expanded, ch.len_utf8(), limit)?;
        out.push(ch);
        return Ok(());
    }

    let value = entities
        .get(name)
        .ok_or_else(|| ParseError::Malformed(format!("undeclared entity `&{name};`")))?;
    expand_value(value, entities, out, expanded, limit, depth + 1)
}

/// Expand an entity value, resolving any references it contains in turn.
fn expand_value(
    value: &str,
    entities: &HashMap<String, String>,
    out: &mut String,
    expanded: &mut usize,
    limit: usize,
    depth: usize,
) -> Result<(), ParseError> {
    let mut rest = value;
    while let Some(amp) = rest.find('&') {
        let (plain, tail) = rest.split_at(amp);
        charge(expanded, plain.len(), limit)?;
        out.push_str(plain);
        let semi = tail
            .find(';')
            .ok_or_else(|| ParseError::Malformed("unterminated entity reference".into()))?;
        resolve_reference(&tail[1..semi], entities, out, expanded, limit, depth)?;
        rest = &tail[semi + 1..];
    }
    charge(expanded, rest.len(), limit)?;
    out.push_str(rest);
    Ok(())
}

fn charge(expanded: &mut usize, amount: usize, limit: usize) -> Result<(), ParseError> {
    *expanded += amount;
    if *expanded > limit {
        tracing::debug!(limit, "entity expansion budget exhausted");
        return Err(ParseError::EntityExpansionExceeded { limit });
    }
    Ok(())
}
