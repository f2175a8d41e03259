use std::{collections::BTreeSet, path::Path};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use crate::{
    doc_id::DocumentId,
    error::{Error, Result},
    source::{DocumentSource, Documents},
    tenant::TenantId,
};

/// `(tenant, document id) -> text`
const DOCUMENTS: TableDefinition<(&str, &str), &str> =
    TableDefinition::new("documents");
const SETTINGS: TableDefinition<&str, &str> = TableDefinition::new("settings");

/// Persistent document text and settings, backed by redb.
pub struct DocumentDb {
    db: Database,
}

impl DocumentDb {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        // Ensure all tables exist by opening them in a write transaction.
        let txn = db.begin_write()?;
        txn.open_table(DOCUMENTS)?;
        txn.open_table(SETTINGS)?;
        txn.commit()?;

        Ok(Self { db })
    }

    // -- Documents --

    pub fn put_document(
        &self,
        tenant: &TenantId,
        id: &DocumentId,
        text: &str,
    ) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(DOCUMENTS)?;
            table.insert((tenant.as_str(), id.as_str()), text)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_document(
        &self,
        tenant: &TenantId,
        id: &str,
    ) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        Ok(table
            .get((tenant.as_str(), id))?
            .map(|v| v.value().to_string()))
    }

    /// Like [`get_document`](Self::get_document), but a missing document is
    /// an error.
    pub fn require_document(&self, tenant: &TenantId, id: &str) -> Result<String> {
        self.get_document(tenant, id)?.ok_or_else(|| Error::NotFound {
            kind: "document",
            name: format!("{tenant}/{id}"),
        })
    }

    pub fn list_document_ids(&self, tenant: &TenantId) -> Result<Vec<DocumentId>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        let mut result = Vec::new();
        for entry in table.range((tenant.as_str(), "")..)? {
            let (k, _v) = entry?;
            let (owner, id) = k.value();
            if owner != tenant.as_str() {
                break;
            }
            result.push(DocumentId::from(id));
        }
        Ok(result)
    }

    pub fn count_documents(&self, tenant: &TenantId) -> Result<usize> {
        Ok(self.list_document_ids(tenant)?.len())
    }

    /// Every tenant that has at least one stored document.
    pub fn list_tenants(&self) -> Result<Vec<TenantId>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        let mut names = BTreeSet::new();
        for entry in table.iter()? {
            let (k, _v) = entry?;
            names.insert(k.value().0.to_string());
        }
        names.into_iter().map(TenantId::new).collect()
    }

    // -- Settings --

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SETTINGS)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }

    /// Get a setting, returning the default if not set.
    pub fn get_setting_or(&self, key: &str, default: &str) -> Result<String> {
        Ok(self
            .get_setting(key)?
            .unwrap_or_else(|| default.to_string()))
    }

    pub fn remove_setting(&self, key: &str) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(SETTINGS)?;
            table.remove(key)?.is_some()
        };
        txn.commit()?;
        Ok(removed)
    }

    pub fn list_settings(&self) -> Result<Vec<(String, String)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            result.push((k.value().to_string(), v.value().to_string()));
        }
        Ok(result)
    }
}

impl DocumentSource for DocumentDb {
    fn get_all_documents(&self, tenant: &TenantId) -> Result<Documents> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        let mut result = Documents::new();
        for entry in table.range((tenant.as_str(), "")..)? {
            let (k, v) = entry?;
            let (owner, id) = k.value();
            if owner != tenant.as_str() {
                break;
            }
            result.insert(DocumentId::from(id), v.value().to_string());
        }
        Ok(result)
    }
}

impl std::fmt::Debug for DocumentDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentDb").finish_non_exhaustive()
    }
}
