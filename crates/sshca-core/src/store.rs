//! Certificate persistence.
//!
//! The CA only talks to storage through [`CertStorer`]. [`MemoryStore`] is the
//! in-process backend; anything durable (SQL, document stores) plugs in behind
//! the same trait.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use ssh_key::Certificate;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{CaError, Result};
use crate::types::CertRecord;

/// Records issued certificates for audit and revocation.
///
/// Implementations must be safe to share between the HTTP and SSH signing
/// paths.
#[async_trait]
pub trait CertStorer: Send + Sync {
    /// Fetch a record by key id.
    async fn get(&self, key_id: &str) -> Result<CertRecord>;

    /// Record a freshly signed certificate.
    async fn set_cert(&self, cert: &Certificate) -> Result<()> {
        self.set_record(CertRecord::from_certificate(cert)?).await
    }

    /// Insert or replace a record.
    async fn set_record(&self, record: CertRecord) -> Result<()>;

    /// All records, optionally including expired ones.
    async fn list(&self, include_expired: bool) -> Result<Vec<CertRecord>>;

    /// Mark every listed key id revoked. Revoking twice is not an error.
    async fn revoke(&self, key_ids: &[String]) -> Result<()>;

    /// Revoked records that have not yet expired.
    async fn get_revoked(&self) -> Result<Vec<CertRecord>>;

    /// Release backend resources.
    async fn close(&self) -> Result<()>;
}

/// A [`CertStorer`] backed by a map. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    certs: RwLock<HashMap<String, CertRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CertStorer for MemoryStore {
    async fn get(&self, key_id: &str) -> Result<CertRecord> {
        self.certs
            .read()
            .await
            .get(key_id)
            .cloned()
            .ok_or_else(|| CaError::NotFound(key_id.to_string()))
    }

    async fn set_record(&self, record: CertRecord) -> Result<()> {
        debug!(key_id = %record.key_id, "storing certificate record");
        self.certs
            .write()
            .await
            .insert(record.key_id.clone(), record);
        Ok(())
    }

    async fn list(&self, include_expired: bool) -> Result<Vec<CertRecord>> {
        let now = Utc::now();
        let mut records: Vec<CertRecord> = self
            .certs
            .read()
            .await
            .values()
            .filter(|r| include_expired || !r.is_expired(now))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    async fn revoke(&self, key_ids: &[String]) -> Result<()> {
        let mut certs = self.certs.write().await;
        if let Some(missing) = key_ids.iter().find(|id| !certs.contains_key(id.as_str())) {
            return Err(CaError::NotFound(missing.clone()));
        }
        for id in key_ids {
            if let Some(record) = certs.get_mut(id) {
                record.revoked = true;
            }
        }
        Ok(())
    }

    async fn get_revoked(&self) -> Result<Vec<CertRecord>> {
        let now = Utc::now();
        Ok(self
            .certs
            .read()
            .await
            .values()
            .filter(|r| r.revoked && !r.is_expired(now))
            .cloned()
            .collect())
    }

    async fn close(&self) -> Result<()> {
        self.certs.write().await.clear();
        Ok(())
    }
}
