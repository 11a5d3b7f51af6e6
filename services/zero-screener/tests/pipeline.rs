//! End-to-end screening runs over in-process sources.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{healthy_market, scenario_market, test_config, MockSource, StockSpec};
use zero_screener::screener::{FactorDimension, QualityFlag, ScreenerEngine};
use zero_screener::{ReportFormat, ScreenerError};

fn engine_over(
    config: zero_screener::ScreenerConfig,
    primary: &Arc<MockSource>,
    secondary: &Arc<MockSource>,
) -> ScreenerEngine {
    ScreenerEngine::new(config, secondary.clone(), primary.clone(), secondary.clone())
        .expect("valid config")
}

#[tokio::test]
async fn test_full_market_funnel() {
    let market = scenario_market();
    let primary = Arc::new(MockSource::new("primary", &market));
    let secondary = Arc::new(MockSource::new("secondary", &market));
    let engine = engine_over(test_config(), &primary, &secondary);

    let output = engine.run().await.expect("run should complete");
    let meta = &output.metadata;

    assert_eq!(meta.universe.retrieved, 5484);
    assert_eq!(meta.universe.size, 5484);
    assert_eq!(meta.universe.expected, Some(5484));

    let stages: Vec<(&str, usize, usize)> = meta
        .filter_stages
        .iter()
        .map(|s| (s.stage.as_str(), s.input, s.passed))
        .collect();
    assert_eq!(
        stages,
        vec![
            ("not_special_treatment", 5484, 5334),
            ("price_floor", 5334, 5034),
            ("market_cap_floor", 5034, 4034),
            ("positive_earnings", 4034, 3034),
            ("traded_value_floor", 3034, 2690),
        ]
    );
    assert_eq!(meta.filter_survivors, 2690);

    // Every stage only narrows the candidate set
    assert!(meta.scored <= meta.filter_survivors);
    assert_eq!(meta.enrichment.considered, 200);
    assert_eq!(output.rows.len(), 50);
    assert!(output.rows.len() <= meta.enrichment.considered);

    assert_eq!(meta.market_data.sub_batches, 110);
    assert_eq!(meta.market_data.fallback, 0);
    assert_eq!(meta.market_data.discrepancies, 0);
    assert_eq!(meta.enrichment.unavailable, 0);

    // Only finalists had candles fetched
    assert_eq!(primary.candle_calls.load(Ordering::SeqCst), 200);
    assert_eq!(secondary.candle_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_output_is_ranked_and_bounded() {
    let market = scenario_market();
    let primary = Arc::new(MockSource::new("primary", &market));
    let secondary = Arc::new(MockSource::new("secondary", &market));
    let engine = engine_over(test_config(), &primary, &secondary);

    let output = engine.run().await.unwrap();

    for (i, row) in output.rows.iter().enumerate() {
        assert_eq!(row.rank, i + 1);
        assert!((0.0..=100.0).contains(&row.composite), "{}", row.composite);
        assert_eq!(row.factors.len(), 5);
        for factor in &row.factors {
            if let Some(p) = factor.percentile {
                assert!((0.0..=100.0).contains(&p));
            }
        }
        assert!(row.technicals.is_some());
        assert!(!row.name.contains("ST"));
    }

    for pair in output.rows.windows(2) {
        assert!(
            pair[0].composite > pair[1].composite
                || (pair[0].composite == pair[1].composite && pair[0].symbol < pair[1].symbol)
        );
    }

    // Eliminated instruments never reach the output
    let eliminated: Vec<String> = scenario_market()[..2794].iter().map(StockSpec::symbol).collect();
    assert!(output.rows.iter().all(|r| !eliminated.contains(&r.symbol)));
}

#[tokio::test]
async fn test_identical_inputs_give_identical_rankings() {
    let market = scenario_market();
    let primary = Arc::new(MockSource::new("primary", &market));
    let secondary = Arc::new(MockSource::new("secondary", &market));
    let engine = engine_over(test_config(), &primary, &secondary);

    let first = engine.run().await.unwrap();
    let second = engine.run().await.unwrap();

    assert_ne!(first.metadata.run_id, second.metadata.run_id);
    assert_eq!(
        serde_json::to_string(&first.rows).unwrap(),
        serde_json::to_string(&second.rows).unwrap()
    );
}

#[tokio::test]
async fn test_invalid_config_rejected_before_any_fetch() {
    let market = healthy_market(10);
    let primary = Arc::new(MockSource::new("primary", &market));
    let secondary = Arc::new(MockSource::new("secondary", &market));

    let mut config = test_config();
    config.weights.growth = 0.40;
    let result = ScreenerEngine::new(config, secondary.clone(), primary.clone(), secondary.clone());

    match result {
        Err(ScreenerError::ConfigInvalid(e)) => assert!(e.to_string().contains("weights")),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("invalid weights accepted"),
    }
    assert_eq!(primary.total_calls(), 0);
    assert_eq!(secondary.total_calls(), 0);
}

#[tokio::test]
async fn test_top_n_larger_than_k_is_invalid() {
    let market = healthy_market(10);
    let primary = Arc::new(MockSource::new("primary", &market));
    let secondary = Arc::new(MockSource::new("secondary", &market));

    let mut config = test_config();
    config.output.top_n = config.enrichment.top_k + 1;
    let result = ScreenerEngine::new(config, secondary.clone(), primary.clone(), secondary.clone());
    assert!(matches!(result, Err(ScreenerError::ConfigInvalid(_))));
}

#[tokio::test]
async fn test_short_universe_aborts_run() {
    let market = healthy_market(500);
    let primary = Arc::new(MockSource::new("primary", &market));
    let secondary = Arc::new(MockSource::new("secondary", &market).with_total(Some(600)));
    let engine = engine_over(test_config(), &primary, &secondary);

    let err = engine.run().await.unwrap_err();
    assert!(matches!(
        err,
        ScreenerError::UniverseSanityFailure {
            retrieved: 500,
            expected: 600,
            ..
        }
    ));
    assert_eq!(err.exit_code(), 3);
    // No market data was requested for a truncated universe
    assert_eq!(primary.snapshot_calls.load(Ordering::SeqCst), 0);
    assert_eq!(secondary.snapshot_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_universe_within_tolerance_runs() {
    let market = healthy_market(580);
    let primary = Arc::new(MockSource::new("primary", &market));
    let secondary = Arc::new(MockSource::new("secondary", &market).with_total(Some(600)));
    let mut config = test_config();
    config.universe.expected_size = Some(600);
    let engine = engine_over(config, &primary, &secondary);

    let output = engine.run().await.unwrap();
    assert_eq!(output.metadata.universe.retrieved, 580);
    assert_eq!(output.rows.len(), 50);
}

#[tokio::test]
async fn test_cancellation_publishes_nothing() {
    let market = healthy_market(100);
    let primary = Arc::new(MockSource::new("primary", &market));
    let secondary =
        Arc::new(MockSource::new("secondary", &market).with_page_delay(Duration::from_secs(5)));
    let engine = engine_over(test_config(), &primary, &secondary);

    let err = engine.run_until_cancelled(async {}).await.unwrap_err();
    assert!(matches!(err, ScreenerError::Cancelled));
    assert_eq!(err.exit_code(), 130);
    assert_eq!(primary.snapshot_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_short_history_flags_enrichment_unavailable() {
    let market = healthy_market(120);
    let primary = Arc::new(MockSource::new("primary", &market).with_history(10));
    let secondary = Arc::new(MockSource::new("secondary", &market).with_history(10));
    let engine = engine_over(test_config(), &primary, &secondary);

    let output = engine.run().await.unwrap();

    assert_eq!(output.rows.len(), 50);
    assert_eq!(output.metadata.enrichment.unavailable, 120);
    for row in &output.rows {
        assert!(row.flags.contains(&QualityFlag::EnrichmentUnavailable));
        assert!(row.technicals.is_none());
        let momentum = row.factor(FactorDimension::Momentum).unwrap();
        assert!(momentum.percentile.is_none());
        assert!((0.0..=100.0).contains(&row.composite));
    }
}

#[tokio::test]
async fn test_candles_fall_back_to_secondary() {
    let market = healthy_market(60);
    let primary = Arc::new(MockSource::new("primary", &market).failing_candles());
    let secondary = Arc::new(MockSource::new("secondary", &market));
    let engine = engine_over(test_config(), &primary, &secondary);

    let output = engine.run().await.unwrap();

    assert_eq!(output.metadata.enrichment.fallback, 60);
    assert_eq!(output.metadata.enrichment.unavailable, 0);
    assert!(output.rows.iter().all(|r| r.technicals.is_some()));
    assert_eq!(secondary.candle_calls.load(Ordering::SeqCst), 60);
}

#[tokio::test]
async fn test_published_artifacts_carry_run_metadata() {
    let market = healthy_market(80);
    let primary = Arc::new(MockSource::new("primary", &market));
    let secondary = Arc::new(MockSource::new("secondary", &market));
    let engine = engine_over(test_config(), &primary, &secondary);
    let output = engine.run().await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let written = output
        .publish(dir.path(), &[ReportFormat::Json, ReportFormat::Markdown])
        .unwrap();
    assert_eq!(written.len(), 2);

    let json = std::fs::read_to_string(&written[0]).unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["metadata"]["run_id"], output.metadata.run_id.as_str());
    assert_eq!(value["metadata"]["weights"]["growth"], 0.30);
    assert_eq!(value["metadata"]["thresholds"]["min_price"], 3.0);
    assert_eq!(value["rows"].as_array().unwrap().len(), 50);

    let markdown = std::fs::read_to_string(&written[1]).unwrap();
    assert!(markdown.contains("全市场筛选报告"));
    assert!(markdown.contains(&output.metadata.run_id));

    // No temporary files are left behind
    let leftovers = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .count();
    assert_eq!(leftovers, 0);
}
