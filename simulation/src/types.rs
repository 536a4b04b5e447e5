//! Entity state used by the scenarios

use std::collections::BTreeMap;

use blobsync_engine::{PostcardCodec, StateOwner, SyncEngine};
use regex::Regex;

/// Full state of one simulated document: field name to value
pub type Document = BTreeMap<String, String>;

/// Engine specialised for documents
pub type SimEngine = SyncEngine<PostcardCodec<Document>>;

/// Prefix of per-server fields the default cleanup pattern strips
pub const CURSOR_PREFIX: &str = "cursor:";

/// In-memory owner of a document on one server
#[derive(Debug, Default)]
pub struct DocumentOwner {
    fields: Document,
    replaced: usize,
}

impl DocumentOwner {
    pub fn edit(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn fields(&self) -> &Document {
        &self.fields
    }

    /// How many times replication replaced this document
    pub fn replaced(&self) -> usize {
        self.replaced
    }

    /// The document as another server sees it after `cleanup` ran
    pub fn shared_view(&self, cleanup: Option<&Regex>) -> Document {
        without_matching(&self.fields, cleanup)
    }
}

impl StateOwner for DocumentOwner {
    type State = Document;

    fn snapshot(&self) -> Document {
        self.fields.clone()
    }

    fn replace(&mut self, state: Document) {
        self.fields = state;
        self.replaced += 1;
    }

    fn prune_matching(&mut self, pattern: &Regex) -> usize {
        let before = self.fields.len();
        self.fields.retain(|field, _| !pattern.is_match(field));
        before - self.fields.len()
    }
}

/// `document` minus the fields `cleanup` matches
pub fn without_matching(document: &Document, cleanup: Option<&Regex>) -> Document {
    document
        .iter()
        .filter(|(field, _)| cleanup.is_none_or(|pattern| !pattern.is_match(field)))
        .map(|(field, value)| (field.clone(), value.clone()))
        .collect()
}
