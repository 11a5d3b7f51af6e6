//! Universe loader.
//!
//! Pages through the listing source until a short page, the reported
//! total or the page cap, deduplicates by code, and checks the result
//! against a reference count before anything downstream runs.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::data::{Instrument, ListingRecord, RequestBudget, UniverseSource};
use crate::error::{Result, ScreenerError};

use super::config::UniverseConfig;

/// Instruments entering the pipeline.
#[derive(Debug, Clone)]
pub struct Universe {
    /// Tradable instruments, in listing order
    pub instruments: Vec<Instrument>,
    /// Distinct listing rows retrieved
    pub retrieved: usize,
    /// Delisted or suspended rows dropped
    pub excluded: usize,
    /// Pages fetched
    pub pages: usize,
    /// Reference count the sanity check used
    pub expected: Option<usize>,
}

impl Universe {
    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }
}

/// Loads and sanity-checks the universe.
pub struct UniverseLoader {
    source: Arc<dyn UniverseSource>,
    budget: Arc<RequestBudget>,
    config: UniverseConfig,
}

impl UniverseLoader {
    pub fn new(
        source: Arc<dyn UniverseSource>,
        budget: Arc<RequestBudget>,
        config: UniverseConfig,
    ) -> Self {
        Self {
            source,
            budget,
            config,
        }
    }

    /// Retrieve the full listing.
    ///
    /// Fails with [`ScreenerError::UniverseSanityFailure`] when nothing was
    /// retrieved or the count deviates from the reference beyond tolerance.
    pub async fn load(&self) -> Result<Universe> {
        let name = self.source.name();
        let page_size = self.config.page_size.max(1);

        let total = match self.budget.call(name, self.source.total_count()).await {
            Ok(total) => total,
            Err(e) => {
                warn!(source = name, error = %e, "Listing total unavailable");
                None
            }
        };
        let expected = self.config.expected_size.or(total);

        let mut seen = HashSet::new();
        let mut records: Vec<ListingRecord> = Vec::new();
        let mut fetched_rows = 0;
        let mut pages = 0;
        let mut complete = false;

        for page in 1..=self.config.max_pages {
            let rows = match self.budget.call(name, self.source.fetch_page(page, page_size)).await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(source = name, page, error = %e, "Listing page failed, stopping pagination");
                    break;
                }
            };
            pages += 1;
            fetched_rows += rows.len();
            let short = rows.len() < page_size;

            for record in rows {
                if seen.insert(record.code.clone()) {
                    records.push(record);
                }
            }
            debug!(page, rows = fetched_rows, distinct = records.len(), "Listing page fetched");

            if short || total.is_some_and(|t| fetched_rows >= t) {
                complete = true;
                break;
            }
        }

        if !complete {
            warn!(
                pages,
                max_pages = self.config.max_pages,
                "Pagination stopped before the listing was exhausted"
            );
        }

        let retrieved = records.len();
        self.check_size(retrieved, expected)?;

        let mut instruments = Vec::with_capacity(retrieved);
        let mut excluded = 0;
        for record in &records {
            let instrument = Instrument::from_listing(record);
            if instrument.status.is_tradable() {
                instruments.push(instrument);
            } else {
                debug!(symbol = %instrument.symbol, status = ?instrument.status, "Dropped from universe");
                excluded += 1;
            }
        }

        info!(
            source = name,
            pages,
            retrieved,
            expected = ?expected,
            excluded,
            universe = instruments.len(),
            "Universe loaded"
        );

        Ok(Universe {
            instruments,
            retrieved,
            excluded,
            pages,
            expected,
        })
    }

    fn check_size(&self, retrieved: usize, expected: Option<usize>) -> Result<()> {
        let tolerance = self.config.size_tolerance;
        let failure = |expected: usize| ScreenerError::UniverseSanityFailure {
            retrieved,
            expected,
            tolerance,
        };

        if retrieved == 0 {
            return Err(failure(expected.unwrap_or(0)));
        }

        match expected {
            Some(expected) if expected > 0 => {
                let deviation = (retrieved as f64 - expected as f64).abs() / expected as f64;
                if deviation > tolerance {
                    return Err(failure(expected));
                }
            }
            _ => {
                warn!(retrieved, "No reference universe size, sanity check skipped");
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ListingStatus, ProviderError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct PagedSource {
        rows: Vec<ListingRecord>,
        total: Option<usize>,
        fail_from_page: Option<usize>,
        pages: AtomicU32,
    }

    impl PagedSource {
        fn new(count: usize, total: Option<usize>) -> Self {
            let rows = (0..count)
                .map(|i| ListingRecord {
                    code: format!("{}", 600000 + i),
                    name: format!("股票{}", i),
                    last_price: Some(10.0),
                })
                .collect();
            Self {
                rows,
                total,
                fail_from_page: None,
                pages: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl UniverseSource for PagedSource {
        fn name(&self) -> &'static str {
            "paged"
        }

        async fn total_count(&self) -> std::result::Result<Option<usize>, ProviderError> {
            Ok(self.total)
        }

        async fn fetch_page(
            &self,
            page: usize,
            page_size: usize,
        ) -> std::result::Result<Vec<ListingRecord>, ProviderError> {
            self.pages.fetch_add(1, Ordering::SeqCst);
            if self.fail_from_page.is_some_and(|p| page >= p) {
                return Err(ProviderError::Network("connection reset".into()));
            }
            let start = (page - 1) * page_size;
            Ok(self.rows.iter().skip(start).take(page_size).cloned().collect())
        }
    }

    fn loader(source: PagedSource, config: UniverseConfig) -> (UniverseLoader, Arc<PagedSource>) {
        let source = Arc::new(source);
        let loader = UniverseLoader::new(
            source.clone(),
            Arc::new(RequestBudget::new(2, Duration::from_secs(5))),
            config,
        );
        (loader, source)
    }

    #[tokio::test]
    async fn test_paginates_until_short_page() {
        let (loader, source) = loader(PagedSource::new(205, Some(205)), UniverseConfig::default());
        let universe = loader.load().await.unwrap();
        assert_eq!(universe.retrieved, 205);
        assert_eq!(universe.pages, 3);
        assert_eq!(source.pages.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stops_when_total_reached() {
        // exact multiple of the page size: no short page ever arrives
        let (loader, source) = loader(PagedSource::new(160, Some(160)), UniverseConfig::default());
        let universe = loader.load().await.unwrap();
        assert_eq!(universe.retrieved, 160);
        assert_eq!(source.pages.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_truncated_listing_fails_sanity_check() {
        let mut source = PagedSource::new(5484, Some(5484));
        source.fail_from_page = Some(50);
        let (loader, _) = loader(source, UniverseConfig::default());

        match loader.load().await {
            Err(ScreenerError::UniverseSanityFailure {
                retrieved,
                expected,
                ..
            }) => {
                assert_eq!(retrieved, 49 * 80);
                assert_eq!(expected, 5484);
            }
            other => panic!("unexpected: {:?}", other.map(|u| u.len())),
        }
    }

    #[tokio::test]
    async fn test_configured_expected_size_overrides_source_total() {
        let config = UniverseConfig {
            expected_size: Some(5000),
            ..UniverseConfig::default()
        };
        let (within, _) = loader(PagedSource::new(4900, Some(4900)), config);
        let universe = within.load().await.unwrap();
        assert_eq!(universe.expected, Some(5000));

        let config = UniverseConfig {
            expected_size: Some(6000),
            ..UniverseConfig::default()
        };
        let (short, _) = loader(PagedSource::new(4900, Some(4900)), config);
        assert!(matches!(
            short.load().await,
            Err(ScreenerError::UniverseSanityFailure { .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_listing_fails() {
        let (loader, _) = loader(PagedSource::new(0, None), UniverseConfig::default());
        assert!(matches!(
            loader.load().await,
            Err(ScreenerError::UniverseSanityFailure { retrieved: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_dedupes_and_drops_untradable() {
        let mut source = PagedSource::new(10, None);
        source.rows.push(source.rows[0].clone());
        source.rows[1].name = "*ST退市".into();
        source.rows[2].last_price = Some(0.0);
        source.rows[3].name = "ST中天".into();
        let (loader, _) = loader(source, UniverseConfig::default());

        let universe = loader.load().await.unwrap();
        assert_eq!(universe.retrieved, 10);
        assert_eq!(universe.excluded, 2);
        assert_eq!(universe.len(), 8);
        assert_eq!(universe.expected, None);
        assert!(universe
            .instruments
            .iter()
            .any(|i| i.status == ListingStatus::SpecialTreatment));
    }
}
