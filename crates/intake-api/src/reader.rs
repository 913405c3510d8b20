use std::sync::Arc;

use intake_core::{Page, PrimaryStore, Record, RecordFilter, RecordId, StoreError};
use intake_fallback::{FallbackLog, LogError};
use serde::{Deserialize, Serialize};

use crate::availability::PrimaryHandle;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ReadSource {
    Primary,
    Fallback,
}

impl ReadSource {
    #[must_use]
    pub fn degraded(self) -> bool {
        self == Self::Fallback
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Listing {
    pub records: Vec<Record>,
    pub source: ReadSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PagedListing {
    pub records: Vec<Record>,
    pub source: ReadSource,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
    pub pages: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lookup {
    pub record: Record,
    pub source: ReadSource,
}

/// Reads from the primary store while it answers and from the local log otherwise.
///
/// Listings come from one store only. While the primary store is up, records still pending in
/// the local log are missing from listings until the next reconciliation copies them over.
/// Single lookups check both.
pub struct UnifiedReader {
    primary: Arc<PrimaryHandle>,
    log: Arc<FallbackLog>,
}

impl UnifiedReader {
    #[must_use]
    pub fn new(primary: Arc<PrimaryHandle>, log: Arc<FallbackLog>) -> Self {
        Self { primary, log }
    }

    /// # Errors
    /// Returns [`LogError`] when the primary store is down and the local log cannot be read.
    pub fn list_all(&self) -> Result<Listing, LogError> {
        if let Some(records) = self.from_primary(|store| store.find(&RecordFilter::default(), None))
        {
            return Ok(Listing { records, source: ReadSource::Primary });
        }
        Ok(Listing { records: self.log.all()?, source: ReadSource::Fallback })
    }

    /// Looks the id up in the primary store first, then in the local log.
    ///
    /// # Errors
    /// Returns [`LogError`] when the local log has to be consulted and cannot be read.
    pub fn get(&self, id: &RecordId) -> Result<Option<Lookup>, LogError> {
        if let Some(Some(record)) = self.from_primary(|store| store.find_one(id)) {
            return Ok(Some(Lookup { record, source: ReadSource::Primary }));
        }
        Ok(self.log.get(id)?.map(|record| Lookup { record, source: ReadSource::Fallback }))
    }

    /// # Errors
    /// Returns [`LogError`] when the primary store is down and the local log cannot be read.
    pub fn list(&self, filter: &RecordFilter, page: Page) -> Result<PagedListing, LogError> {
        let from_primary = self.from_primary(|store| {
            let total = store.count(filter)?;
            let records = store.find(filter, Some(page))?;
            Ok((total, records))
        });
        if let Some((total, records)) = from_primary {
            return Ok(paged(records, ReadSource::Primary, total, page));
        }

        let matching =
            self.log.all()?.into_iter().filter(|record| record.matches(filter)).collect::<Vec<_>>();
        let total = u64::try_from(matching.len()).unwrap_or(u64::MAX);
        Ok(paged(page.slice(matching), ReadSource::Fallback, total, page))
    }

    /// Every record matching `filter`, unpaged.
    ///
    /// # Errors
    /// Returns [`LogError`] when the primary store is down and the local log cannot be read.
    pub fn find_all(&self, filter: &RecordFilter) -> Result<Listing, LogError> {
        if let Some(records) = self.from_primary(|store| store.find(filter, None)) {
            return Ok(Listing { records, source: ReadSource::Primary });
        }
        let records =
            self.log.all()?.into_iter().filter(|record| record.matches(filter)).collect();
        Ok(Listing { records, source: ReadSource::Fallback })
    }

    fn from_primary<T>(
        &self,
        query: impl FnOnce(&dyn PrimaryStore) -> Result<T, StoreError>,
    ) -> Option<T> {
        if !self.primary.is_available() {
            return None;
        }
        match query(self.primary.store()) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!("primary read failed, serving from fallback log: {err}");
                self.primary.mark_unavailable(&err);
                None
            }
        }
    }
}

fn paged(records: Vec<Record>, source: ReadSource, total: u64, page: Page) -> PagedListing {
    PagedListing {
        records,
        source,
        total,
        page: page.number(),
        limit: page.limit(),
        pages: page.pages(total),
    }
}
