//! Turns the raw scan state into a [`RunSummary`]: picks a source per metric
//! family, applies the fallbacks, and records every compromise as a quality
//! warning.

use std::collections::BTreeMap;
use std::path::Path;

use log::warn;

use crate::config::ProfileConfig;
use crate::control_flow::{self, ControlSummary};
use crate::fetch_queue::FetchQueueSummary;
use crate::predict::{PredictCounters, PredictSummary};
use crate::scan::{DetailCounts, DetailSummary, ScanState};
use crate::stall::StallCategory;
use crate::summary::{
    format_word, BenchmarkTimeSource, HotInst, HotPc, MetricFamily, MetricSource, RunSummary,
    StallMode,
};

struct Warnings<'p> {
    log_path: &'p str,
    messages: Vec<String>,
}

impl Warnings<'_> {
    fn push(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{}: {}", self.log_path, message);
        self.messages.push(message);
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

fn per_kinst(count: u64, commits: u64) -> f64 {
    ratio(count * 1000, commits)
}

/// Most frequent first, ties broken by the smaller key.
fn top_counts(counts: impl IntoIterator<Item = (u32, u64)>, limit: usize) -> Vec<(u32, u64)> {
    let mut ranked: Vec<_> = counts.into_iter().collect();
    ranked.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.truncate(limit);
    ranked
}

fn owned_labels(counts: DetailCounts) -> BTreeMap<String, u64> {
    counts
        .into_iter()
        .map(|(label, count)| (label.to_string(), count))
        .collect()
}

/// Total and detail map of one stall detail family.
struct DetailFamily {
    source: MetricSource,
    total: u64,
    detail: BTreeMap<String, u64>,
}

/// Summary lines give both figures; samples give the sampled count and their
/// labels; with neither, the category total stands alone.
fn detail_family(
    summary: Option<DetailSummary>,
    samples: DetailCounts,
    sampled_total: u64,
    category_total: u64,
) -> DetailFamily {
    let source = MetricSource::choose(summary.is_some(), !samples.is_empty());
    match (summary, source) {
        (Some(summary), _) => DetailFamily {
            source,
            total: summary.total,
            detail: summary.detail,
        },
        (None, MetricSource::Sampled) => DetailFamily {
            source,
            total: sampled_total,
            detail: owned_labels(samples),
        },
        (None, _) => DetailFamily {
            source,
            total: category_total,
            detail: BTreeMap::new(),
        },
    }
}

pub(crate) fn reconcile(mut state: ScanState, log_path: &Path, config: &ProfileConfig) -> RunSummary {
    let log_path = log_path.display().to_string();
    let mut warnings = Warnings {
        log_path: &log_path,
        messages: Vec::new(),
    };
    let mut sources = BTreeMap::new();

    // run totals
    let (mut ipc, mut cpi, mut cycles, mut commits) = state
        .run_stats
        .map_or((0.0, 0.0, 0, 0), |s| (s.ipc, s.cpi, s.cycles, s.commits));
    let commit_summary = state.commit_summary.take();
    if cycles == 0 {
        if let Some(c) = commit_summary.as_ref().and_then(|c| c.cycles) {
            cycles = c;
        } else if let Some(timeout) = state.timeout_cycles {
            cycles = timeout;
            warnings.push(format!(
                "run timed out after {timeout} cycles; totals cover the partial run"
            ));
        }
    }
    if commits == 0 {
        commits = commit_summary
            .as_ref()
            .and_then(|c| c.commits)
            .unwrap_or(state.commits.len() as u64);
    }
    if ipc == 0.0 && cycles > 0 {
        ipc = ratio(commits, cycles);
    }
    if cpi == 0.0 && commits > 0 {
        cpi = ratio(cycles, commits);
    }

    // benchmark time
    let host_time_ms = state.host_time_us.map(|us| us as f64 / 1000.0);
    let (effective_benchmark_time_ms, benchmark_time_source) =
        match (state.bench_time_ms, host_time_ms) {
            (Some(ms), _) if ms > 0.0 => (Some(ms), BenchmarkTimeSource::SelfReported),
            (Some(_), Some(host)) => {
                warnings.push("benchmark self-reported time is 0ms; using host time instead");
                (Some(host), BenchmarkTimeSource::HostFallback)
            }
            (Some(_), None) => {
                warnings.push(
                    "benchmark self-reported time is 0ms and no host time is available",
                );
                (None, BenchmarkTimeSource::None)
            }
            (None, Some(host)) => (Some(host), BenchmarkTimeSource::Host),
            (None, None) => (None, BenchmarkTimeSource::None),
        };

    // commit width
    let has_commit_detail = !state.commits.is_empty();
    let has_commit_summary = commit_summary.is_some();
    let commit_source = MetricSource::choose(has_commit_summary, has_commit_detail);
    sources.insert(MetricFamily::Commit, commit_source);
    let mut commit_width_hist = match commit_summary {
        Some(summary) => summary.widths,
        None => {
            let mut hist = BTreeMap::new();
            for &width in state.commits_per_cycle.values() {
                *hist.entry(width as u32).or_insert(0) += 1;
            }
            let busy = state.commits_per_cycle.len() as u64;
            hist.insert(0, cycles.saturating_sub(busy));
            hist
        }
    };
    for width in 0..config.min_commit_width_buckets {
        commit_width_hist.entry(width).or_insert(0);
    }
    match commit_source {
        MetricSource::Summary if !has_commit_detail => {
            warnings.push("commit metrics sourced from summary without per-instruction detail")
        }
        MetricSource::None => {
            warnings.push("commit metrics unavailable: no [commit] lines or [commitm] summary")
        }
        _ => {}
    }

    // control flow
    let control_source =
        MetricSource::choose(state.control_summary.is_some(), has_commit_detail);
    sources.insert(MetricFamily::Control, control_source);
    let control = match state.control_summary.take() {
        Some(summary) => summary.finish(commits),
        None if has_commit_detail => control_flow::reconstruct(&mut state.commits),
        None => ControlSummary::default(),
    };

    // hotspots
    let hotspot_source = MetricSource::choose(
        state.hot_pc_summary.is_some() || state.hot_inst_summary.is_some(),
        has_commit_detail,
    );
    sources.insert(MetricFamily::Hotspot, hotspot_source);
    let (top_pc, top_inst) = if hotspot_source == MetricSource::Summary {
        let mut top_pc = state.hot_pc_summary.take().unwrap_or_default();
        let mut top_inst = state.hot_inst_summary.take().unwrap_or_default();
        top_pc.truncate(config.hotspot_limit);
        top_inst.truncate(config.hotspot_limit);
        (top_pc, top_inst)
    } else {
        let top_pc = top_counts(state.pc_counts.drain(), config.hotspot_limit)
            .into_iter()
            .map(|(pc, count)| HotPc {
                pc: format_word(pc.into()),
                count,
            })
            .collect();
        let top_inst = top_counts(state.inst_counts.drain(), config.hotspot_limit)
            .into_iter()
            .map(|(inst, count)| HotInst {
                inst: format_word(inst.into()),
                count,
            })
            .collect();
        (top_pc, top_inst)
    };

    // stall categories
    let sampled_stalls: u64 = state.stall_samples.values().sum();
    let stall_source = MetricSource::choose(state.stall_summary.is_some(), sampled_stalls > 0);
    sources.insert(MetricFamily::Stall, stall_source);
    let (stall_total, mut stall_category) = match state.stall_summary.take() {
        Some(summary) => (summary.total, summary.categories),
        None => (sampled_stalls, state.stall_samples.clone()),
    };
    for category in StallCategory::ALL {
        stall_category.entry(category).or_insert(0);
    }
    if stall_source == MetricSource::Sampled {
        warnings.push("stall metrics are sampled events, not cycle-accurate");
    }
    let sampled = |category: StallCategory| state.stall_samples.get(&category).copied().unwrap_or(0);
    let category_total = |category: StallCategory| stall_category.get(&category).copied().unwrap_or(0);

    let frontend_empty = detail_family(
        state.frontend_empty_summary.take(),
        DetailCounts::new(),
        0,
        category_total(StallCategory::FrontendEmpty),
    );
    let decode_blocked = detail_family(
        state.decode_blocked_summary.take(),
        std::mem::take(&mut state.decode_blocked_samples),
        sampled(StallCategory::DecodeBlocked),
        category_total(StallCategory::DecodeBlocked),
    );
    let rob_backpressure = detail_family(
        state.rob_backpressure_summary.take(),
        std::mem::take(&mut state.rob_backpressure_samples),
        sampled(StallCategory::RobBackpressure),
        category_total(StallCategory::RobBackpressure),
    );
    let other = detail_family(
        state.other_summary.take(),
        std::mem::take(&mut state.other_samples),
        sampled(StallCategory::Other),
        category_total(StallCategory::Other),
    );
    for (family, detail) in [
        (MetricFamily::FrontendEmptyDetail, &frontend_empty),
        (MetricFamily::DecodeBlockedDetail, &decode_blocked),
        (MetricFamily::RobBackpressureDetail, &rob_backpressure),
        (MetricFamily::OtherDetail, &other),
    ] {
        sources.insert(family, detail.source);
        if stall_source == MetricSource::Summary && detail.source == MetricSource::Sampled {
            warnings.push(format!(
                "{family} is sampled while stall totals are cycle-accurate"
            ));
        }
    }

    let decode_samples = sampled(StallCategory::DecodeBlocked);
    let stall_decode_blocked_post_flush_ratio =
        ratio(state.decode_blocked_post_flush, decode_samples);
    let stall_decode_blocked_post_branch_flush_ratio =
        ratio(state.decode_blocked_post_branch_flush, decode_samples);

    // predictor
    let flush = &state.flush;
    let predict_source = MetricSource::choose(
        state.predict.is_some(),
        has_commit_detail || flush.mispredict_count > 0,
    );
    sources.insert(MetricFamily::Predict, predict_source);
    let counters = match state.predict {
        Some(counters) => counters,
        None if predict_source == MetricSource::Sampled => {
            warnings.push(
                "predictor metrics reconstructed from [commit] classes and mispredict flushes",
            );
            PredictCounters::reconstruct(&state.branch_classes, &flush.misses)
        }
        None => PredictCounters::default(),
    };
    for violation in counters.exclusivity_violations() {
        warnings.push(violation);
    }
    let predict = PredictSummary::from(counters);

    // fetch queue
    let fq_source = MetricSource::choose(
        state.fetch_queue_summary.is_some(),
        !state.fetch_queue_samples.is_empty(),
    );
    sources.insert(MetricFamily::FetchQueue, fq_source);
    let ifu_fq = match state.fetch_queue_summary.take() {
        Some(summary) => summary,
        None if fq_source == MetricSource::Sampled => {
            warnings.push("fetch queue metrics are sampled from [stall] lines, not cycle-accurate");
            std::mem::take(&mut state.fetch_queue_samples).finish()
        }
        None => FetchQueueSummary::default(),
    };

    // flush
    let flush = std::mem::take(&mut state.flush);
    let flush_source = MetricSource::choose(state.flush_summary.is_some(), flush.count > 0);
    sources.insert(MetricFamily::Flush, flush_source);
    let (wrong_path_kill_uops, redirect_samples, redirect_sum, redirect_max) =
        match state.flush_summary {
            Some(m) => (
                m.wrong_path_killed_uops,
                m.redirect_samples,
                m.redirect_sum,
                m.redirect_max,
            ),
            None => (
                flush.wrong_path_kill_uops,
                flush.redirect_samples,
                flush.redirect_sum,
                flush.redirect_max,
            ),
        };

    RunSummary {
        ipc,
        cpi,
        cycles,
        commits,

        bench_reported_time_ms: state.bench_time_ms,
        host_time_us: state.host_time_us,
        host_time_ms,
        effective_benchmark_time_ms,
        benchmark_time_source,

        flush_count: flush.count,
        flush_per_kinst: per_kinst(flush.count, commits),
        bru_count: state.bru_count,
        bru_per_kinst: per_kinst(state.bru_count, commits),
        flush_reason_histogram: flush.reasons,
        flush_source_histogram: flush.sources,
        mispredict_flush_count: flush.mispredict_count,
        mispredict_cond_count: flush.misses.cond,
        mispredict_jump_count: flush.misses.jump,
        mispredict_jump_direct_count: flush.misses.jump_direct,
        mispredict_jump_indirect_count: flush.misses.jump_indirect,
        mispredict_ret_count: flush.misses.ret,
        mispredict_control_unknown_count: flush.control_unknown,
        wrong_path_kill_uops,
        flush_penalty_cycles: flush.penalty_cycles,
        branch_penalty_cycles: flush.branch_penalty_cycles,
        redirect_distance_samples: redirect_samples,
        redirect_distance_sum: redirect_sum,
        redirect_distance_max: redirect_max,
        redirect_distance_avg: ratio(redirect_sum, redirect_samples),

        has_commit_detail,
        has_commit_summary,
        commit_width_hist,
        control,
        top_pc,
        top_inst,

        stall_mode: StallMode::from(stall_source),
        stall_total,
        stall_category,
        stall_frontend_empty_total: frontend_empty.total,
        stall_frontend_empty_detail: frontend_empty.detail,
        stall_decode_blocked_total: decode_blocked.total,
        stall_decode_blocked_detail: decode_blocked.detail,
        stall_rob_backpressure_total: rob_backpressure.total,
        stall_rob_backpressure_detail: rob_backpressure.detail,
        stall_other_total: other.total,
        stall_other_detail: other.detail,
        stall_other_aux: state.other_aux_summary.unwrap_or_default(),
        stall_post_flush_window_cycles: config.post_flush_window_cycles,
        stall_decode_blocked_post_flush: state.decode_blocked_post_flush,
        stall_decode_blocked_post_flush_ratio,
        stall_decode_blocked_post_branch_flush: state.decode_blocked_post_branch_flush,
        stall_decode_blocked_post_branch_flush_ratio,

        predict,
        ifu_fq,

        metric_sources: sources,
        quality_warnings: warnings.messages,
        log_path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::TraceScanner;

    fn summarize(lines: &[&str]) -> RunSummary {
        let config = ProfileConfig::default();
        let mut scanner = TraceScanner::new(&config);
        for line in lines {
            scanner.feed_line(line);
        }
        scanner.finish(Path::new("run.log"))
    }

    #[test]
    fn empty_trace_reports_everything_missing() {
        let s = summarize(&[]);
        assert_eq!(s.cycles, 0);
        assert_eq!(s.stall_mode, StallMode::None);
        assert_eq!(s.stall_category.len(), 8);
        assert_eq!(s.commit_width_hist.len(), 5);
        assert_eq!(s.source(MetricFamily::Commit), MetricSource::None);
        assert!(s.quality_warnings.iter().any(|w| w.contains("commit")));
        assert_eq!(s.benchmark_time_source, BenchmarkTimeSource::None);
    }

    #[test]
    fn timeout_supplies_cycles_and_rates() {
        let s = summarize(&[
            "TIMEOUT after 100 cycles",
            "[commit] cycle=3 slot=0 pc=0x80000000 inst=0x00000013",
            "[commit] cycle=4 slot=0 pc=0x80000004 inst=0x00000013",
        ]);
        assert_eq!(s.cycles, 100);
        assert_eq!(s.commits, 2);
        assert!((s.ipc - 0.02).abs() < 1e-12);
        assert!((s.cpi - 50.0).abs() < 1e-12);
        assert_eq!(s.commit_width_hist[&0], 98);
        assert_eq!(s.commit_width_hist[&1], 2);
    }

    #[test]
    fn zero_self_reported_time_falls_back_to_host() {
        let s = summarize(&[
            "Total time (ms)  : 0",
            "[src/cpu/cpu-exec.c:104 statistic] host time spent = 263093 us",
        ]);
        assert_eq!(s.bench_reported_time_ms, Some(0.0));
        assert_eq!(s.host_time_us, Some(263_093));
        assert_eq!(s.effective_benchmark_time_ms, Some(263.093));
        assert_eq!(s.benchmark_time_source, BenchmarkTimeSource::HostFallback);
        assert!(s
            .quality_warnings
            .iter()
            .any(|w| w.contains("self-reported time is 0ms")));
    }

    #[test]
    fn positive_self_reported_time_wins() {
        let s = summarize(&[
            "Total time (ms)  : 12.5",
            "[src/cpu/cpu-exec.c:104 statistic] host time spent = 9000 us",
        ]);
        assert_eq!(s.effective_benchmark_time_ms, Some(12.5));
        assert_eq!(s.benchmark_time_source, BenchmarkTimeSource::SelfReported);
    }

    #[test]
    fn sampled_stalls_warn_and_fill_categories() {
        let s = summarize(&[
            "IPC=0.100000 CPI=10.000000 cycles=40 commits=4",
            "[stall ] cycle=1 dec(v/r)=0/1",
            "[stall ] cycle=2 rob_ready=0",
        ]);
        assert_eq!(s.stall_mode, StallMode::Sampled);
        assert_eq!(s.stall_total, 2);
        assert_eq!(s.stall_count(StallCategory::FrontendEmpty), 1);
        assert_eq!(s.stall_count(StallCategory::FlushRecovery), 0);
        assert_eq!(s.stall_rob_backpressure_total, 1);
        assert_eq!(s.source(MetricFamily::RobBackpressureDetail), MetricSource::Sampled);
        assert_eq!(s.source(MetricFamily::FrontendEmptyDetail), MetricSource::None);
        assert_eq!(s.stall_frontend_empty_total, 1);
        assert!(s.quality_warnings.iter().any(|w| w.contains("sampled")));
    }

    #[test]
    fn cycle_summary_outranks_samples() {
        let s = summarize(&[
            "[stall ] cycle=1 dec(v/r)=1/0",
            "[stallm] mode=cycle stall_total_cycles=20 frontend_empty=5 decode_blocked=9 rob_backpressure=2 other=4",
            "[stallm3] mode=cycle decode_blocked_total=9 lsu_rs_pressure=6 other=3",
        ]);
        assert_eq!(s.stall_mode, StallMode::Cycle);
        assert_eq!(s.stall_total, 20);
        assert_eq!(s.stall_decode_blocked_total, 9);
        assert_eq!(s.stall_decode_blocked_detail["lsu_rs_pressure"], 6);
        assert_eq!(s.stall_other_total, 4);
        assert!(s.stall_other_detail.is_empty());
        assert!(!s.quality_warnings.iter().any(|w| w.contains("stall metrics")));
    }

    #[test]
    fn sampled_detail_under_cycle_totals_is_flagged() {
        let s = summarize(&[
            "[stall ] cycle=1 rob_ready=0",
            "[stallm] mode=cycle stall_total_cycles=3 rob_backpressure=3",
        ]);
        assert_eq!(s.source(MetricFamily::RobBackpressureDetail), MetricSource::Sampled);
        assert_eq!(s.stall_rob_backpressure_total, 1);
        assert!(s
            .quality_warnings
            .iter()
            .any(|w| w.starts_with("rob_backpressure_detail is sampled")));
    }

    #[test]
    fn hotspots_rank_by_count_then_value() {
        let s = summarize(&[
            "[commit] cycle=1 slot=0 pc=0x80000008 inst=0x00000013",
            "[commit] cycle=2 slot=0 pc=0x80000004 inst=0x00000013",
            "[commit] cycle=3 slot=0 pc=0x80000008 inst=0x00100073",
            "[commit] cycle=4 slot=0 pc=0x80000000 inst=0x00000013",
        ]);
        assert_eq!(s.top_pc[0], HotPc { pc: "0x80000008".into(), count: 2 });
        assert_eq!(s.top_pc[1].pc, "0x80000000");
        assert_eq!(s.top_inst[0].inst, "0x00000013");
        assert_eq!(s.source(MetricFamily::Hotspot), MetricSource::Sampled);
    }

    #[test]
    fn flush_summary_supplies_redirect_figures() {
        let s = summarize(&[
            "[flush ] cycle=10 reason=branch_mispredict source=rob miss_type=cond_branch redirect_distance=8 killed_uops=3",
            "[flushm] wrong_path_killed_uops=40 redirect_distance_samples=4 redirect_distance_sum=100 redirect_distance_max=64",
        ]);
        assert_eq!(s.source(MetricFamily::Flush), MetricSource::Summary);
        assert_eq!(s.flush_count, 1);
        assert_eq!(s.mispredict_cond_count, 1);
        assert_eq!(s.wrong_path_kill_uops, 40);
        assert_eq!(s.redirect_distance_max, 64);
        assert!((s.redirect_distance_avg - 25.0).abs() < 1e-12);
    }

    #[test]
    fn predictor_is_rebuilt_without_counters() {
        let s = summarize(&[
            "[commit] cycle=1 slot=0 pc=0x80000000 inst=0x00000463",
            "[commit] cycle=2 slot=0 pc=0x80000010 inst=0x00008067",
            "[flush ] cycle=3 reason=branch_mispredict source=rob miss_type=return",
        ]);
        assert_eq!(s.source(MetricFamily::Predict), MetricSource::Sampled);
        assert_eq!(s.predict.counters.cond_total, 1);
        assert_eq!(s.predict.counters.ret_total, 1);
        assert_eq!(s.predict.counters.ret_miss, 1);
        assert!(s.quality_warnings.iter().any(|w| w.contains("predictor")));
    }
}
