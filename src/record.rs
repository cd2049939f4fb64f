//! Record extraction from parsed documents
//!
//! Walks a [`Document`](crate::document::Document) under a declarative
//! [`FieldMap`] (source element name -> logical field) and produces a fully
//! populated [`Record`] or a typed [`ExtractionError`]. Adding a record type
//! is a matter of describing its fields, not of writing new dispatch code.

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;

use crate::document::{Document, Element};

/// Mapping from one source element to one logical record field.
#[derive(Debug, Clone, Serialize)]
pub struct FieldSpec {
    /// Logical field name in the produced record.
    pub field: String,
    /// Element name in the source document.
    pub source: String,
    pub required: bool,
}

/// How to treat a source element that appears more than once under the root.
///
/// This is an explicit choice: silently overwriting (last-wins) lets a later
/// attacker-controlled element shadow an earlier value, so the default is
/// `Reject`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DuplicatePolicy {
    FirstWins,
    LastWins,
    Reject,
}

/// Declarative description of a record type: its field specs plus the
/// duplicate-element policy. Both source element names and logical field
/// names are unique per map; aliasing two elements to one field is a
/// construction error, not a runtime ambiguity.
#[derive(Debug, Clone, Serialize)]
pub struct FieldMap {
    specs: Vec<FieldSpec>,
    duplicates: DuplicatePolicy,
}

impl FieldMap {
    pub fn new() -> Self {
        Self {
            specs: Vec::new(),
            duplicates: DuplicatePolicy::Reject,
        }
    }

    pub fn required(self, field: &str, source: &str) -> Self {
        self.push(field, source, true)
    }

    pub fn optional(self, field: &str, source: &str) -> Self {
        self.push(field, source, false)
    }

    pub fn on_duplicate(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicates = policy;
        self
    }

    fn push(mut self, field: &str, source: &str, required: bool) -> Self {
        debug_assert!(
            !self.specs.iter().any(|s| s.source == source),
            "duplicate source element `{source}` in field map"
        );
        debug_assert!(
            !self.specs.iter().any(|s| s.field == field),
            "duplicate logical field `{field}` in field map"
        );
        self.specs.push(FieldSpec {
            field: field.to_string(),
            source: source.to_string(),
            required,
        });
        self
    }

    fn spec_for(&self, source: &str) -> Option<&FieldSpec> {
        self.specs.iter().find(|s| s.source == source)
    }
}

impl Default for FieldMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Fully populated extraction result. Constructed only when every required
/// field was found; there is no partially filled record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    fields: HashMap<String, String>,
}

impl Record {
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn into_fields(self) -> HashMap<String, String> {
        self.fields
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionError {
    #[error("root element `{0}` not found")]
    RootNotFound(String),
    #[error("expected one `{name}` element, found {count}")]
    AmbiguousRoot { name: String, count: usize },
    /// Carries the missing *source element* name, e.g. `MissingField("Author")`.
    #[error("required element `{0}` is missing")]
    MissingField(String),
    #[error("element `{0}` appears more than once")]
    DuplicateField(String),
}

/// Extract a single record rooted at the element named `root_selector`.
///
/// The selector matches the document root itself or exactly one of its
/// direct children. Element values are taken verbatim; element names not in
/// the map are ignored for forward compatibility.
pub fn extract(
    doc: &Document,
    root_selector: &str,
    map: &FieldMap,
) -> Result<Record, ExtractionError> {
    let root = doc.root();
    if root.name() == root_selector {
        return extract_fields(root, map);
    }
    let candidates: Vec<&Element> = root.children_named(root_selector).collect();
    match candidates.as_slice() {
        [] => Err(ExtractionError::RootNotFound(root_selector.to_string())),
        [only] => extract_fields(only, map),
        many => Err(ExtractionError::AmbiguousRoot {
            name: root_selector.to_string(),
            count: many.len(),
        }),
    }
}

/// Extract every element named `item_selector` under the document root as
/// its own record (a bulk upload of repeated items). The first failing item
/// fails the whole batch; zero items is an empty `Ok`.
pub fn extract_all(
    doc: &Document,
    item_selector: &str,
    map: &FieldMap,
) -> Result<Vec<Record>, ExtractionError> {
    let root = doc.root();
    if root.name() == item_selector {
        return extract_fields(root, map).map(|r| vec![r]);
    }
    root.children_named(item_selector)
        .map(|item| extract_fields(item, map))
        .collect()
}

fn extract_fields(el: &Element, map: &FieldMap) -> Result<Record, ExtractionError> {
    let mut fields: HashMap<String, String> = HashMap::new();
    for child in el.children() {
        let Some(spec) = map.spec_for(child.name()) else {
            continue;
        };
        if fields.contains_key(&spec.field) {
            match map.duplicates {
                DuplicatePolicy::FirstWins => {}
                DuplicatePolicy::LastWins => {
                    fields.insert(spec.field.clone(), child.text().to_string());
                }
                DuplicatePolicy::Reject => {
                    return Err(ExtractionError::DuplicateField(spec.source.clone()));
                }
            }
        } else {
            fields.insert(spec.field.clone(), child.text().to_string());
        }
    }
    for spec in &map.specs {
        if spec.required && !fields.contains_key(&spec.field) {
            return Err(ExtractionError::MissingField(spec.source.clone()));
        }
    }
    Ok(Record { fields })
}

/// Example target entity: a blog post submitted as an XML upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlogRecord {
    pub title: String,
    pub author: String,
    pub content: String,
    pub status: String,
}

impl BlogRecord {
    /// Field map for the single-post upload format (`<Content>`).
    pub fn field_map() -> FieldMap {
        FieldMap::new()
            .required("title", "Title")
            .required("author", "Author")
            .required("content", "Content")
            .required("status", "Status")
    }

    /// Field map for the bulk upload format, which carries the body in
    /// `<Description>` instead of `<Content>`.
    pub fn bulk_field_map() -> FieldMap {
        FieldMap::new()
            .required("title", "Title")
            .required("author", "Author")
            .required("content", "Description")
            .required("status", "Status")
    }

    pub fn from_record(record: Record) -> Result<Self, ExtractionError> {
        let mut fields = record.into_fields();
        let mut take = |field: &str, source: &str| {
            fields
                .remove(field)
                .ok_or_else(|| ExtractionError::MissingField(source.to_string()))
        };
        Ok(Self {
            title: take("title", "Title")?,
            author: take("author", "Author")?,
            content: take("content", "Content")?,
            status: take("status", "Status")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{parse, ParserPolicy};

    fn parse_default(xml: &str) -> Document {
        parse(xml.as_bytes(), &ParserPolicy::default()).unwrap()
    }

    #[test]
    fn test_extract_blog_record() {
        let doc = parse_default(
            "<Blog>\
               <Title>First Post</Title>\
               <Author>jane</Author>\
               <Content>hello world</Content>\
               <Status>draft</Status>\
             </Blog>",
        );
        let record = extract(&doc, "Blog", &BlogRecord::field_map()).unwrap();
        let blog = BlogRecord::from_record(record).unwrap();

        assert_eq!(blog.title, "First Post");
        assert_eq!(blog.author, "jane");
        assert_eq!(blog.content, "hello world");
        assert_eq!(blog.status, "draft");
    }

    #[test]
    fn test_extraction_is_idempotent() {
        let xml = "<Blog><Title>T</Title><Author>a</Author>\
                   <Content>c</Content><Status>s</Status></Blog>";
        let first = extract(&parse_default(xml), "Blog", &BlogRecord::field_map()).unwrap();
        let second = extract(&parse_default(xml), "Blog", &BlogRecord::field_map()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_required_field() {
        let doc = parse_default("<Blog><Title>T</Title></Blog>");
        let err = extract(&doc, "Blog", &BlogRecord::field_map()).unwrap_err();
        assert_eq!(err, ExtractionError::MissingField("Author".to_string()));
    }

    #[test]
    fn test_unknown_elements_ignored() {
        let doc = parse_default(
            "<Blog><Title>T</Title><Author>a</Author><Content>c</Content>\
             <Status>s</Status><Tracking>ignored</Tracking></Blog>",
        );
        let record = extract(&doc, "Blog", &BlogRecord::field_map()).unwrap();
        assert_eq!(record.get("tracking"), None);
        assert_eq!(record.get("title"), Some("T"));
    }

    #[test]
    fn test_values_are_verbatim() {
        let map = FieldMap::new().required("title", "Title");
        let doc = parse_default("<Blog><Title>  padded  </Title></Blog>");
        let record = extract(&doc, "Blog", &map).unwrap();
        assert_eq!(record.get("title"), Some("  padded  "));
    }

    #[test]
    fn test_duplicate_rejected_by_default() {
        let map = FieldMap::new().required("title", "Title");
        let doc = parse_default("<Blog><Title>one</Title><Title>two</Title></Blog>");
        let err = extract(&doc, "Blog", &map).unwrap_err();
        assert_eq!(err, ExtractionError::DuplicateField("Title".to_string()));
    }

    #[test]
    fn test_duplicate_first_wins() {
        let map = FieldMap::new()
            .required("title", "Title")
            .on_duplicate(DuplicatePolicy::FirstWins);
        let doc = parse_default("<Blog><Title>one</Title><Title>two</Title></Blog>");
        let record = extract(&doc, "Blog", &map).unwrap();
        assert_eq!(record.get("title"), Some("one"));
    }

    #[test]
    fn test_duplicate_last_wins() {
        let map = FieldMap::new()
            .required("title", "Title")
            .on_duplicate(DuplicatePolicy::LastWins);
        let doc = parse_default("<Blog><Title>one</Title><Title>two</Title></Blog>");
        let record = extract(&doc, "Blog", &map).unwrap();
        assert_eq!(record.get("title"), Some("two"));
    }

    #[test]
    fn test_root_not_found() {
        let doc = parse_default("<Feed><Entry/></Feed>");
        let err = extract(&doc, "Blog", &BlogRecord::field_map()).unwrap_err();
        assert_eq!(err, ExtractionError::RootNotFound("Blog".to_string()));
    }

    #[test]
    fn test_ambiguous_root() {
        let doc = parse_default("<Feed><Blog/><Blog/></Feed>");
        let err = extract(&doc, "Blog", &BlogRecord::field_map()).unwrap_err();
        assert_eq!(
            err,
            ExtractionError::AmbiguousRoot {
                name: "Blog".to_string(),
                count: 2
            }
        );
    }

    #[test]
    fn test_extract_all_bulk_upload() {
        let doc = parse_default(
            "<Blogs>\
               <Blog><Title>A</Title><Author>x</Author>\
                 <Description>da</Description><Status>live</Status></Blog>\
               <Blog><Title>B</Title><Author>y</Author>\
                 <Description>db</Description><Status>draft</Status></Blog>\
             </Blogs>",
        );
        let records = extract_all(&doc, "Blog", &BlogRecord::bulk_field_map()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("title"), Some("A"));
        assert_eq!(records[1].get("content"), Some("db"));
    }

    #[test]
    fn test_extract_all_fails_on_first_bad_item() {
        let doc = parse_default(
            "<Blogs>\
               <Blog><Title>A</Title><Author>x</Author>\
                 <Description>da</Description><Status>live</Status></Blog>\
               <Blog><Title>B</Title></Blog>\
             </Blogs>",
        );
        let err = extract_all(&doc, "Blog", &BlogRecord::bulk_field_map()).unwrap_err();
        assert_eq!(err, ExtractionError::MissingField("Author".to_string()));
    }

    #[test]
    fn test_extract_all_empty_batch() {
        let doc = parse_default("<Blogs></Blogs>");
        let records = extract_all(&doc, "Blog", &BlogRecord::bulk_field_map()).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    #[should_panic(expected = "duplicate logical field")]
    fn test_field_map_rejects_aliased_logical_field() {
        let _ = FieldMap::new()
            .required("content", "Content")
            .required("content", "Description");
    }

    #[test]
    fn test_optional_field_absent() {
        let map = FieldMap::new()
            .required("title", "Title")
            .optional("subtitle", "Subtitle");
        let doc = parse_default("<Blog><Title>T</Title></Blog>");
        let record = extract(&doc, "Blog", &map).unwrap();
        assert_eq!(record.get("subtitle"), None);
    }
}
