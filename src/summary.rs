use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::control_flow::ControlSummary;
use crate::fetch_queue::FetchQueueSummary;
use crate::normalize::{FlushReason, FlushSource};
use crate::predict::PredictSummary;
use crate::stall::StallCategory;

/// Where a metric family's numbers came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricSource {
    /// Authoritative per-run counters.
    Summary,
    /// Rebuilt from per-event or sampled lines.
    Sampled,
    None,
}

impl MetricSource {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricSource::Summary => "summary",
            MetricSource::Sampled => "sampled",
            MetricSource::None => "none",
        }
    }

    /// `Summary` if any summary tag was seen, else `Sampled` if any qualifying
    /// line was seen, else `None`.
    pub fn choose(has_summary: bool, has_samples: bool) -> Self {
        if has_summary {
            MetricSource::Summary
        } else if has_samples {
            MetricSource::Sampled
        } else {
            MetricSource::None
        }
    }
}

impl fmt::Display for MetricSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricFamily {
    Commit,
    Control,
    Hotspot,
    Stall,
    FrontendEmptyDetail,
    DecodeBlockedDetail,
    RobBackpressureDetail,
    OtherDetail,
    Predict,
    FetchQueue,
    Flush,
}

impl MetricFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricFamily::Commit => "commit",
            MetricFamily::Control => "control",
            MetricFamily::Hotspot => "hotspot",
            MetricFamily::Stall => "stall",
            MetricFamily::FrontendEmptyDetail => "frontend_empty_detail",
            MetricFamily::DecodeBlockedDetail => "decode_blocked_detail",
            MetricFamily::RobBackpressureDetail => "rob_backpressure_detail",
            MetricFamily::OtherDetail => "other_detail",
            MetricFamily::Predict => "predict",
            MetricFamily::FetchQueue => "fetch_queue",
            MetricFamily::Flush => "flush",
        }
    }
}

impl fmt::Display for MetricFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stall totals are per-cycle counters (`cycle`), sampled lines
/// (`sampled`), or absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StallMode {
    Cycle,
    Sampled,
    None,
}

impl StallMode {
    pub fn as_str(self) -> &'static str {
        match self {
            StallMode::Cycle => "cycle",
            StallMode::Sampled => "sampled",
            StallMode::None => "none",
        }
    }
}

impl From<MetricSource> for StallMode {
    fn from(source: MetricSource) -> Self {
        match source {
            MetricSource::Summary => StallMode::Cycle,
            MetricSource::Sampled => StallMode::Sampled,
            MetricSource::None => StallMode::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BenchmarkTimeSource {
    #[serde(rename = "self")]
    SelfReported,
    HostFallback,
    Host,
    None,
}

impl BenchmarkTimeSource {
    pub fn as_str(self) -> &'static str {
        match self {
            BenchmarkTimeSource::SelfReported => "self",
            BenchmarkTimeSource::HostFallback => "host_fallback",
            BenchmarkTimeSource::Host => "host",
            BenchmarkTimeSource::None => "none",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HotPc {
    pub pc: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HotInst {
    pub inst: String,
    pub count: u64,
}

pub fn format_word(value: u64) -> String {
    format!("0x{value:08x}")
}

/// Everything learned from one trace file. Built once by
/// [`crate::reconcile::reconcile`] and not modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub log_path: String,

    pub ipc: f64,
    pub cpi: f64,
    pub cycles: u64,
    pub commits: u64,

    pub bench_reported_time_ms: Option<f64>,
    pub host_time_us: Option<u64>,
    pub host_time_ms: Option<f64>,
    pub effective_benchmark_time_ms: Option<f64>,
    pub benchmark_time_source: BenchmarkTimeSource,

    pub flush_count: u64,
    pub flush_per_kinst: f64,
    pub bru_count: u64,
    pub bru_per_kinst: f64,
    pub flush_reason_histogram: BTreeMap<FlushReason, u64>,
    pub flush_source_histogram: BTreeMap<FlushSource, u64>,
    pub mispredict_flush_count: u64,
    pub mispredict_cond_count: u64,
    pub mispredict_jump_count: u64,
    pub mispredict_jump_direct_count: u64,
    pub mispredict_jump_indirect_count: u64,
    pub mispredict_ret_count: u64,
    pub mispredict_control_unknown_count: u64,
    pub wrong_path_kill_uops: u64,
    pub flush_penalty_cycles: u64,
    pub branch_penalty_cycles: u64,
    pub redirect_distance_samples: u64,
    pub redirect_distance_sum: u64,
    pub redirect_distance_max: u64,
    pub redirect_distance_avg: f64,

    pub has_commit_detail: bool,
    pub has_commit_summary: bool,
    pub commit_width_hist: BTreeMap<u32, u64>,
    pub control: ControlSummary,
    pub top_pc: Vec<HotPc>,
    pub top_inst: Vec<HotInst>,

    pub stall_mode: StallMode,
    pub stall_total: u64,
    pub stall_category: BTreeMap<StallCategory, u64>,
    pub stall_frontend_empty_total: u64,
    pub stall_frontend_empty_detail: BTreeMap<String, u64>,
    pub stall_decode_blocked_total: u64,
    pub stall_decode_blocked_detail: BTreeMap<String, u64>,
    pub stall_rob_backpressure_total: u64,
    pub stall_rob_backpressure_detail: BTreeMap<String, u64>,
    pub stall_other_total: u64,
    pub stall_other_detail: BTreeMap<String, u64>,
    pub stall_other_aux: BTreeMap<String, u64>,
    pub stall_post_flush_window_cycles: u64,
    pub stall_decode_blocked_post_flush: u64,
    pub stall_decode_blocked_post_flush_ratio: f64,
    pub stall_decode_blocked_post_branch_flush: u64,
    pub stall_decode_blocked_post_branch_flush_ratio: f64,

    pub predict: PredictSummary,
    pub ifu_fq: FetchQueueSummary,

    pub metric_sources: BTreeMap<MetricFamily, MetricSource>,
    pub quality_warnings: Vec<String>,
}

impl RunSummary {
    pub fn source(&self, family: MetricFamily) -> MetricSource {
        self.metric_sources
            .get(&family)
            .copied()
            .unwrap_or(MetricSource::None)
    }

    pub fn stall_count(&self, category: StallCategory) -> u64 {
        self.stall_category.get(&category).copied().unwrap_or(0)
    }
}
