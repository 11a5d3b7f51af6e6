//! Ranked output and report rendering.
//!
//! [`RankedOutput`] is the immutable artifact of a run: run metadata plus
//! one row per instrument of the final top N. It renders to:
//! - JSON (canonical, machine-readable)
//! - Markdown (summary for humans)
//!
//! Files are written to a temporary path and renamed into place, so a
//! failed publish never leaves a partial artifact behind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::data::{Board, SourceDiscrepancy};
use crate::error::{Result, ScreenerError};

use super::config::{FactorWeights, FilterConfig, MissingDataPolicy};
use super::filter::FilterResult;
use super::scoring::{FactorDimension, FactorScore, QualityFlag, ScoredInstrument};
use super::technical::TechnicalIndicators;

// ============================================================================
// Report Format
// ============================================================================

/// Supported report formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    /// JSON format (canonical artifact)
    Json,
    /// Markdown format (human-readable)
    Markdown,
}

impl ReportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Markdown => "md",
        }
    }
}

impl std::fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Markdown => write!(f, "markdown"),
        }
    }
}

impl std::str::FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "markdown" | "md" => Ok(Self::Markdown),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown report format: {}", s)),
        }
    }
}

// ============================================================================
// Ranked Output
// ============================================================================

/// One dimension of a row's score breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorBreakdown {
    pub dimension: FactorDimension,
    pub raw: Option<f64>,
    pub percentile: Option<f64>,
    pub weight: f64,
    pub effective_weight: f64,
    pub contribution: f64,
}

impl From<&FactorScore> for FactorBreakdown {
    fn from(score: &FactorScore) -> Self {
        Self {
            dimension: score.dimension,
            raw: score.raw,
            percentile: score.percentile,
            weight: score.weight,
            effective_weight: score.effective_weight,
            contribution: score.contribution,
        }
    }
}

/// One ranked instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedRow {
    /// 1-based
    pub rank: usize,
    pub symbol: String,
    pub name: String,
    pub board: Board,
    /// Composite score (0-100)
    pub composite: f64,
    pub factors: Vec<FactorBreakdown>,
    pub flags: Vec<QualityFlag>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub discrepancies: Vec<SourceDiscrepancy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub technicals: Option<TechnicalIndicators>,
}

impl RankedRow {
    pub fn from_scored(rank: usize, scored: &ScoredInstrument) -> Self {
        Self {
            rank,
            symbol: scored.symbol().to_string(),
            name: scored.name().to_string(),
            board: scored.board(),
            composite: scored.composite,
            factors: scored.factors.iter().map(FactorBreakdown::from).collect(),
            flags: scored.flags.clone(),
            discrepancies: scored.discrepancies().to_vec(),
            technicals: scored.technicals.clone(),
        }
    }

    pub fn factor(&self, dimension: FactorDimension) -> Option<&FactorBreakdown> {
        self.factors.iter().find(|f| f.dimension == dimension)
    }
}

/// Universe counts for the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniverseSummary {
    /// Distinct listing rows retrieved
    pub retrieved: usize,
    /// Reference count used by the sanity check
    pub expected: Option<usize>,
    /// Delisted or suspended, dropped on load
    pub excluded: usize,
    /// Instruments entering the pipeline
    pub size: usize,
}

/// Market data fetch counts for the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketDataSummary {
    pub sub_batches: usize,
    pub fallback: usize,
    pub unavailable: usize,
    /// Instruments with at least one discrepancy
    pub discrepancies: usize,
}

/// Enrichment counts for the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentSummary {
    pub considered: usize,
    pub enriched: usize,
    pub fallback: usize,
    pub unavailable: usize,
    pub excluded: usize,
}

/// Run parameters and diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub universe: UniverseSummary,
    pub market_data: MarketDataSummary,
    /// One entry per hard filter, in application order
    pub filter_stages: Vec<FilterResult>,
    pub filter_survivors: usize,
    /// Ranked after pass 1
    pub scored: usize,
    /// Dropped by the missing-data policy in pass 1
    pub scoring_excluded: usize,
    pub enrichment: EnrichmentSummary,
    pub weights: FactorWeights,
    pub missing_data_policy: MissingDataPolicy,
    pub thresholds: FilterConfig,
    pub top_k: usize,
    pub top_n: usize,
    /// Echoed for downstream consumers
    pub holdings: Vec<String>,
}

/// The published result of a run. Read-only for consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedOutput {
    pub metadata: RunMetadata,
    pub rows: Vec<RankedRow>,
}

impl RankedOutput {
    /// Build from finalists already in rank order.
    pub fn new(metadata: RunMetadata, finalists: &[ScoredInstrument]) -> Self {
        let rows = finalists
            .iter()
            .enumerate()
            .map(|(i, s)| RankedRow::from_scored(i + 1, s))
            .collect();
        Self { metadata, rows }
    }

    /// Summary string for logging.
    pub fn summary(&self) -> String {
        let m = &self.metadata;
        format!(
            "Screened {} instruments in {:.1}s: {} survived filters, {} ranked",
            m.universe.size,
            m.duration_secs,
            m.filter_survivors,
            self.rows.len()
        )
    }

    /// Render in the given format.
    pub fn render(&self, format: ReportFormat) -> Result<String> {
        match format {
            ReportFormat::Json => self.to_json(),
            ReportFormat::Markdown => Ok(self.to_markdown()),
        }
    }

    /// Generate JSON report.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ScreenerError::Output(format!("Failed to serialize output: {}", e)))
    }

    /// Generate markdown report.
    pub fn to_markdown(&self) -> String {
        let m = &self.metadata;
        let mut md = String::new();

        md.push_str(&format!(
            "# 全市场筛选报告\n\n**运行ID**: {}\n**时间**: {}\n**耗时**: {:.1}秒\n\n",
            m.run_id,
            m.completed_at.format("%Y-%m-%d %H:%M:%S"),
            m.duration_secs
        ));

        md.push_str("## 筛选摘要\n\n");
        md.push_str(&format!(
            "- **股票池**: {} 只 (获取 {}, 剔除退市/停牌 {})\n",
            m.universe.size, m.universe.retrieved, m.universe.excluded
        ));
        md.push_str(&format!("- **硬性筛选通过**: {} 只\n", m.filter_survivors));
        md.push_str(&format!(
            "- **精选 (K={}) → 输出 (N={})**: {} 只\n",
            m.top_k,
            m.top_n,
            self.rows.len()
        ));
        md.push_str(&format!(
            "- **权重**: 成长 {:.0}% / 估值 {:.0}% / 质量 {:.0}% / 安全 {:.0}% / 动量 {:.0}%\n",
            m.weights.growth * 100.0,
            m.weights.valuation * 100.0,
            m.weights.quality * 100.0,
            m.weights.safety * 100.0,
            m.weights.momentum * 100.0
        ));
        md.push_str(&format!(
            "- **数据源**: 降级 {} 批, 不可用 {} 批, 数据分歧 {} 只\n\n",
            m.market_data.fallback, m.market_data.unavailable, m.market_data.discrepancies
        ));

        md.push_str("### 筛选漏斗\n\n");
        md.push_str("| 阶段 | 输入 | 通过 | 淘汰 | 缺失 | 淘汰率 |\n");
        md.push_str("|------|------|------|------|------|--------|\n");
        for fr in &m.filter_stages {
            md.push_str(&format!(
                "| {} | {} | {} | {} | {} | {:.1}% |\n",
                fr.stage, fr.input, fr.passed, fr.eliminated, fr.missing, fr.elimination_rate
            ));
        }
        md.push('\n');

        md.push_str("## 优选股票\n\n");
        md.push_str("| 排名 | 代码 | 名称 | 板块 | 综合得分 | 成长 | 估值 | 质量 | 安全 | 动量 | 标记 |\n");
        md.push_str("|------|------|------|------|----------|------|------|------|------|------|------|\n");
        for row in &self.rows {
            let pct = |d: FactorDimension| {
                row.factor(d)
                    .and_then(|f| f.percentile)
                    .map(|p| format!("{:.0}", p))
                    .unwrap_or_else(|| "-".to_string())
            };
            let flags = if row.flags.is_empty() {
                "-".to_string()
            } else {
                row.flags.iter().map(|f| f.to_string()).collect::<Vec<_>>().join(", ")
            };
            md.push_str(&format!(
                "| {} | {} | {} | {} | {:.1} | {} | {} | {} | {} | {} | {} |\n",
                row.rank,
                row.symbol,
                row.name,
                row.board,
                row.composite,
                pct(FactorDimension::Growth),
                pct(FactorDimension::Valuation),
                pct(FactorDimension::Quality),
                pct(FactorDimension::Safety),
                pct(FactorDimension::Momentum),
                flags
            ));
        }
        md.push('\n');

        let flagged: Vec<_> = self.rows.iter().filter(|r| !r.discrepancies.is_empty()).collect();
        if !flagged.is_empty() {
            md.push_str("## 数据分歧\n\n");
            md.push_str("| 代码 | 字段 | 主源 | 备源 | 差异 |\n");
            md.push_str("|------|------|------|------|------|\n");
            for row in flagged {
                for d in &row.discrepancies {
                    md.push_str(&format!(
                        "| {} | {} | {} {} | {} {} | {:.1}% |\n",
                        row.symbol,
                        d.field,
                        d.primary_source,
                        d.primary_value,
                        d.secondary_source,
                        d.secondary_value,
                        d.relative_diff * 100.0
                    ));
                }
            }
            md.push('\n');
        }

        md.push_str("---\n\n");
        md.push_str(&format!(
            "*报告生成于 {} UTC*\n",
            m.completed_at.format("%Y-%m-%d %H:%M:%S")
        ));

        md
    }

    /// Save one format to `path`, adding the format's extension when missing.
    pub fn save_to_file(&self, path: &Path, format: ReportFormat) -> Result<PathBuf> {
        let mut written = self.publish_files(&[(path.to_path_buf(), format)])?;
        written
            .pop()
            .ok_or_else(|| ScreenerError::Output("nothing written".into()))
    }

    /// Publish every format into `dir` as `screener_<timestamp>.<ext>`.
    ///
    /// All renders are written to temporary files first; only when every
    /// one succeeded are they renamed into place.
    pub fn publish(&self, dir: &Path, formats: &[ReportFormat]) -> Result<Vec<PathBuf>> {
        let stem = format!(
            "screener_{}",
            self.metadata.started_at.format("%Y%m%d_%H%M%S")
        );
        let targets: Vec<(PathBuf, ReportFormat)> =
            formats.iter().map(|f| (dir.join(&stem), *f)).collect();
        self.publish_files(&targets)
    }

    fn publish_files(&self, targets: &[(PathBuf, ReportFormat)]) -> Result<Vec<PathBuf>> {
        let resolved: Vec<(PathBuf, ReportFormat)> = targets
            .iter()
            .map(|(path, format)| {
                let file_path = if path.extension().is_none() {
                    path.with_extension(format.extension())
                } else {
                    path.clone()
                };
                (file_path, *format)
            })
            .collect();
        for (i, (file_path, _)) in resolved.iter().enumerate() {
            if resolved[..i].iter().any(|(p, _)| p == file_path) {
                return Err(ScreenerError::Output(format!(
                    "{} targeted more than once",
                    file_path.display()
                )));
            }
        }

        let mut staged: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(resolved.len());

        for (file_path, format) in resolved {
            let temp_path = temp_path_for(&file_path, &self.metadata.run_id);

            let staged_one = self.render(format).and_then(|content| {
                if let Some(parent) = file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent).map_err(|e| {
                        ScreenerError::Output(format!(
                            "Failed to create report directory {}: {}",
                            parent.display(),
                            e
                        ))
                    })?;
                }
                fs::write(&temp_path, content).map_err(|e| {
                    ScreenerError::Output(format!("Failed to write {}: {}", temp_path.display(), e))
                })
            });

            if let Err(e) = staged_one {
                discard(&staged);
                let _ = fs::remove_file(&temp_path);
                return Err(e);
            }
            staged.push((temp_path, file_path));
        }

        let mut written: Vec<PathBuf> = Vec::with_capacity(staged.len());
        for (i, (temp_path, file_path)) in staged.iter().enumerate() {
            if let Err(e) = fs::rename(temp_path, file_path) {
                discard(&staged[i..]);
                for published in &written {
                    let _ = fs::remove_file(published);
                }
                return Err(ScreenerError::Output(format!(
                    "Failed to publish {}: {}",
                    file_path.display(),
                    e
                )));
            }
            written.push(file_path.clone());
        }
        Ok(written)
    }
}

fn temp_path_for(path: &Path, run_id: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, run_id))
}

fn discard(staged: &[(PathBuf, PathBuf)]) {
    for (temp_path, _) in staged {
        let _ = fs::remove_file(temp_path);
    }
}

// ============================================================================
// Tests
// ============================================================================
