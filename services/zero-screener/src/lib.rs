//! Zero Screener Library
//!
//! Full-market A-share screening: every listed instrument is loaded, priced
//! from two independent sources, passed through hard eligibility filters,
//! ranked by a five-factor percentile composite and refined with technical
//! indicators for the top finalists.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                    zero-screener (Batch Job)                        │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────┐     │
//! │  │  Market Data    │  │  Screener       │  │  Ranked Output  │     │
//! │  │  Tencent + Sina │  │  Engine         │  │  JSON / MD      │     │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────┘     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Concepts
//!
//! ## Cross-validation
//! - Price, earnings multiple and market cap are read from both sources
//! - A relative difference above the threshold flags the instrument; it still ranks
//!
//! ## Survivorship
//! - Every stage only narrows the candidate set
//! - `|output| <= K <= |filter survivors| <= |universe|`

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod data;
pub mod error;
pub mod screener;

pub use error::{Result, ScreenerError};
pub use screener::{RankedOutput, ReportFormat, ScreenerConfig, ScreenerEngine};
