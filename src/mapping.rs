use std::collections::HashMap;

use crate::{
    doc_id::DocumentId,
    error::{Error, Result},
    hnsw::InternalId,
};

/// Bijection between graph node ids and document ids for one tenant.
///
/// Node ids are dense, so the forward direction is a plain vector indexed by
/// [`InternalId`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdMapping {
    by_internal: Vec<DocumentId>,
    by_document: HashMap<DocumentId, InternalId>,
}

impl IdMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a mapping from document ids listed in InternalId order.
    pub fn from_documents(documents: Vec<DocumentId>) -> Result<Self> {
        let mut mapping = Self {
            by_internal: Vec::with_capacity(documents.len()),
            by_document: HashMap::with_capacity(documents.len()),
        };
        for (i, doc) in documents.into_iter().enumerate() {
            mapping.insert(i as InternalId, doc)?;
        }
        Ok(mapping)
    }

    /// Record the next pair. `internal` must be the next dense id and
    /// `document` must not be mapped yet.
    pub fn insert(
        &mut self,
        internal: InternalId,
        document: DocumentId,
    ) -> Result<()> {
        if internal as usize != self.by_internal.len() {
            return Err(Error::MappingInconsistency(format!(
                "expected node id {}, got {internal}",
                self.by_internal.len()
            )));
        }
        if let Some(existing) = self.by_document.get(&document) {
            return Err(Error::MappingInconsistency(format!(
                "document '{document}' already mapped to node {existing}"
            )));
        }
        self.by_document.insert(document.clone(), internal);
        self.by_internal.push(document);
        Ok(())
    }

    pub fn document(&self, internal: InternalId) -> Option<&DocumentId> {
        self.by_internal.get(internal as usize)
    }

    pub fn internal(&self, document: &str) -> Option<InternalId> {
        self.by_document.get(document).copied()
    }

    pub fn contains(&self, document: &str) -> bool {
        self.by_document.contains_key(document)
    }

    pub fn len(&self) -> usize {
        self.by_internal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_internal.is_empty()
    }

    /// Document ids in InternalId order.
    pub fn documents(&self) -> &[DocumentId] {
        &self.by_internal
    }

    pub fn iter(&self) -> impl Iterator<Item = (InternalId, &DocumentId)> {
        self.by_internal
            .iter()
            .enumerate()
            .map(|(i, doc)| (i as InternalId, doc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_in_both_directions() {
        let mut mapping = IdMapping::new();
        mapping.insert(0, "a".into()).unwrap();
        mapping.insert(1, "b".into()).unwrap();

        assert_eq!(mapping.document(1).map(DocumentId::as_str), Some("b"));
        assert_eq!(mapping.internal("a"), Some(0));
        assert_eq!(mapping.document(2), None);
        assert_eq!(mapping.internal("z"), None);
        assert_eq!(mapping.len(), 2);
    }

    #[test]
    fn duplicate_document_rejected() {
        let mut mapping = IdMapping::new();
        mapping.insert(0, "a".into()).unwrap();
        let err = mapping.insert(1, "a".into()).unwrap_err();
        assert!(matches!(err, Error::MappingInconsistency(_)));
        assert_eq!(mapping.len(), 1);
    }

    #[test]
    fn ids_must_be_dense() {
        let mut mapping = IdMapping::new();
        assert!(mapping.insert(3, "a".into()).is_err());
        assert!(mapping.is_empty());
    }

    #[test]
    fn from_documents_preserves_order() {
        let mapping =
            IdMapping::from_documents(vec!["x".into(), "y".into()]).unwrap();
        let pairs: Vec<_> =
            mapping.iter().map(|(i, d)| (i, d.as_str())).collect();
        assert_eq!(pairs, vec![(0, "x"), (1, "y")]);
        assert!(
            IdMapping::from_documents(vec!["x".into(), "x".into()]).is_err()
        );
    }
}
