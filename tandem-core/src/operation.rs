//! Edit operations.
//!
//! An [`Operation`] is what one client submits for one document: an
//! ordered list of primitive [`OpKind`] components plus the metadata the
//! server needs to reconcile it (origin, observed version, id).
//!
//! A freshly created operation has exactly one component. Transformation
//! can split a delete around a concurrent insert (two components) or cancel
//! it entirely (zero components).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;
use crate::text;

/// Primitive edit. Positions and lengths count chars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OpKind {
    Insert { position: usize, text: String },
    Delete { position: usize, length: usize },
}

impl OpKind {
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        OpKind::Insert {
            position,
            text: text.into(),
        }
    }

    pub fn delete(position: usize, length: usize) -> Self {
        OpKind::Delete { position, length }
    }

    pub fn position(&self) -> usize {
        match self {
            OpKind::Insert { position, .. } | OpKind::Delete { position, .. } => *position,
        }
    }

    /// True when applying this component changes nothing.
    pub fn is_noop(&self) -> bool {
        match self {
            OpKind::Insert { text, .. } => text.is_empty(),
            OpKind::Delete { length, .. } => *length == 0,
        }
    }

    /// Change in document length caused by this component.
    pub fn len_delta(&self) -> isize {
        match self {
            OpKind::Insert { text, .. } => text::char_len(text) as isize,
            OpKind::Delete { length, .. } => -(*length as isize),
        }
    }

    /// Check the component against a document of `document_length` chars.
    pub fn check_bounds(&self, document_length: usize) -> Result<(), CoreError> {
        let (position, length) = match self {
            OpKind::Insert { position, .. } => (*position, 0),
            OpKind::Delete { position, length } => (*position, *length),
        };
        match position.checked_add(length) {
            Some(end) if end <= document_length => Ok(()),
            _ => Err(CoreError::Range {
                position,
                length,
                document_length,
            }),
        }
    }

    /// Apply to a plain string whose char length is `*length`.
    pub(crate) fn apply_to_string(
        &self,
        content: &mut String,
        length: &mut usize,
    ) -> Result<(), CoreError> {
        self.check_bounds(*length)?;
        match self {
            OpKind::Insert { position, text } => {
                text::insert_at(content, *position, text);
            }
            OpKind::Delete { position, length: len } => {
                text::remove_range(content, *position, *len);
            }
        }
        *length = (*length as isize + self.len_delta()) as usize;
        Ok(())
    }
}

/// One client edit against one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique id, stable across retries and transformation.
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Originating client. The server overwrites this with the sender's id.
    #[serde(default)]
    pub client_id: String,
    /// Document version the client had observed when creating the edit.
    #[serde(default)]
    pub base_version: u64,
    /// Components, applied in order.
    pub components: Vec<OpKind>,
}

impl Operation {
    pub fn new(client_id: impl Into<String>, base_version: u64, kind: OpKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            client_id: client_id.into(),
            base_version,
            components: vec![kind],
        }
    }

    pub fn insert(
        client_id: impl Into<String>,
        base_version: u64,
        position: usize,
        text: impl Into<String>,
    ) -> Self {
        Self::new(client_id, base_version, OpKind::insert(position, text))
    }

    pub fn delete(
        client_id: impl Into<String>,
        base_version: u64,
        position: usize,
        length: usize,
    ) -> Self {
        Self::new(client_id, base_version, OpKind::delete(position, length))
    }

    /// Same identity and origin, different components.
    pub fn with_components(&self, components: Vec<OpKind>) -> Self {
        Self {
            id: self.id,
            client_id: self.client_id.clone(),
            base_version: self.base_version,
            components,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.components.iter().all(OpKind::is_noop)
    }

    pub fn len_delta(&self) -> isize {
        self.components.iter().map(OpKind::len_delta).sum()
    }

    /// Validate every component in sequence against a document of
    /// `document_length` chars without touching any content.
    pub fn validate(&self, document_length: usize) -> Result<(), CoreError> {
        let mut length = document_length;
        for component in &self.components {
            component.check_bounds(length)?;
            length = (length as isize + component.len_delta()) as usize;
        }
        Ok(())
    }

    /// Apply to a plain string. Nothing changes on error.
    pub fn apply_to_str(&self, content: &str) -> Result<String, CoreError> {
        let mut length = text::char_len(content);
        self.validate(length)?;
        let mut out = content.to_string();
        for component in &self.components {
            component.apply_to_string(&mut out, &mut length)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_apply() {
        let op = Operation::insert("a", 0, 0, "X");
        assert_eq!(op.apply_to_str("hello").unwrap(), "Xhello");
    }

    #[test]
    fn test_delete_apply() {
        let op = Operation::delete("a", 0, 4, 1);
        assert_eq!(op.apply_to_str("hello").unwrap(), "hell");
    }

    #[test]
    fn test_multi_component_apply_in_order() {
        let op = Operation::insert("a", 0, 1, "X")
            .with_components(vec![OpKind::delete(1, 2), OpKind::delete(2, 1)]);
        assert_eq!(op.apply_to_str("abcdef").unwrap(), "adf");
    }

    #[test]
    fn test_range_error_on_delete_past_end() {
        let op = Operation::delete("a", 0, 3, 5);
        let err = op.apply_to_str("hello").unwrap_err();
        assert_eq!(
            err,
            CoreError::Range {
                position: 3,
                length: 5,
                document_length: 5
            }
        );
    }

    #[test]
    fn test_validate_is_sequential() {
        // Second component is only valid after the first one grew the text.
        let op = Operation::insert("a", 0, 0, "xyz")
            .with_components(vec![OpKind::insert(0, "xyz"), OpKind::delete(5, 3)]);
        assert!(op.validate(5).is_ok());
        assert!(op.validate(4).is_err());
    }

    #[test]
    fn test_noop_detection() {
        assert!(OpKind::delete(3, 0).is_noop());
        assert!(OpKind::insert(3, "").is_noop());
        assert!(Operation::insert("a", 0, 0, "x").with_components(vec![]).is_noop());
        assert!(!Operation::insert("a", 0, 0, "x").is_noop());
    }

    #[test]
    fn test_len_delta_counts_chars() {
        assert_eq!(OpKind::insert(0, "漢字").len_delta(), 2);
        assert_eq!(OpKind::delete(0, 3).len_delta(), -3);
    }

    #[test]
    fn test_wire_shape() {
        let op = Operation::insert("client-a", 3, 1, "X");
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["components"][0]["type"], "insert");
        assert_eq!(json["components"][0]["position"], 1);
        assert_eq!(json["base_version"], 3);

        let parsed: Operation = serde_json::from_str(
            r#"{"components":[{"type":"delete","position":2,"length":4}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.components, vec![OpKind::delete(2, 4)]);
        assert_eq!(parsed.base_version, 0);
        assert!(parsed.client_id.is_empty());
    }
}
