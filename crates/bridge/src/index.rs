//! Indexes

use crate::store::{BaseStore, ObjectStore};
use crate::transaction::Transaction;
use idbind_core::RawIndex;
use std::ops::Deref;
use std::sync::Arc;

/// An index within one transaction.
///
/// Reads, counts and cursors come from [`BaseStore`]; keys passed to them
/// are index keys.
#[derive(Clone)]
pub struct Index {
    base: BaseStore<dyn RawIndex>,
}

impl Index {
    pub(crate) fn new(raw: Arc<dyn RawIndex>, txn: Transaction) -> Self {
        Self {
            base: BaseStore { raw, txn },
        }
    }

    /// Whether index keys are unique
    pub fn unique(&self) -> bool {
        self.base.raw.unique()
    }

    /// Whether array keys are indexed per element
    pub fn multi_entry(&self) -> bool {
        self.base.raw.multi_entry()
    }

    /// The indexed object store
    pub fn object_store(&self) -> ObjectStore {
        ObjectStore::new(self.base.raw.object_store(), self.base.txn.clone())
    }
}

impl Deref for Index {
    type Target = BaseStore<dyn RawIndex>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("name", &self.base.raw.name())
            .field("unique", &self.base.raw.unique())
            .field("multi_entry", &self.base.raw.multi_entry())
            .finish()
    }
}
