//! Markdown rendering of per-benchmark run summaries.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{Result, TraceError};
use crate::summary::{MetricSource, RunSummary};

pub const DEFAULT_TEMPLATE: &str = include_str!("../templates/report_template.md");

/// Benchmarks in report order.
pub const BENCHMARK_ORDER: [&str; 3] = ["dhrystone", "coremark", "coremark_sample"];

const TOP_PC_SHOWN: usize = 5;

/// Reads a user template, or falls back to the built-in one.
pub fn load_template(path: Option<&Path>) -> Result<Cow<'static, str>> {
    match path {
        Some(path) => fs::read_to_string(path)
            .map(Cow::Owned)
            .map_err(|source| TraceError::Template {
                path: path.to_path_buf(),
                source,
            }),
        None => Ok(Cow::Borrowed(DEFAULT_TEMPLATE)),
    }
}

fn pct(part: u64, total: u64) -> String {
    if total == 0 {
        "0.00%".to_string()
    } else {
        format!("{:.2}%", part as f64 * 100.0 / total as f64)
    }
}

fn rate(value: f64) -> String {
    format!("{:.2}%", value * 100.0)
}

/// `- key: `count` (share)` lines, largest first.
fn breakdown(lines: &mut Vec<String>, title: &str, detail: &BTreeMap<String, u64>, total: u64) {
    if detail.is_empty() {
        return;
    }
    let mut entries: Vec<_> = detail.iter().collect();
    entries.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
    lines.push(String::new());
    lines.push(title.to_string());
    lines.push(format!("- total: `{total}`"));
    for (key, count) in entries {
        lines.push(format!("- {key}: `{count}` ({})", pct(*count, total)));
    }
}

fn predictor_lines(lines: &mut Vec<String>, s: &RunSummary) {
    let p = &s.predict;
    let c = &p.counters;
    lines.extend([
        format!(
            "- predict(cond hit/miss/total): `{}` / `{}` / `{}` (miss {})",
            c.cond_hit,
            c.cond_miss,
            c.cond_total,
            rate(p.cond_miss_rate)
        ),
        format!(
            "- predict(cond local/global/selected acc): `{}` / `{}` / `{}`",
            rate(p.cond_local_accuracy),
            rate(p.cond_global_accuracy),
            rate(p.cond_selected_accuracy)
        ),
        format!(
            "- predict(cond chooser local/global): `{}` / `{}`",
            c.cond_choose_local, c.cond_choose_global
        ),
        format!(
            "- predict(jump hit/miss): `{}` / `{}` (miss {})",
            c.jump_hit,
            c.jump_miss,
            rate(p.jump_miss_rate)
        ),
        format!(
            "- predict(jump direct hit/miss): `{}` / `{}`",
            c.jump_direct_hit, c.jump_direct_miss
        ),
        format!(
            "- predict(jump indirect hit/miss): `{}` / `{}`",
            c.jump_indirect_hit, c.jump_indirect_miss
        ),
        format!(
            "- predict(ret hit/miss): `{}` / `{}` (miss {})",
            c.ret_hit,
            c.ret_miss,
            rate(p.ret_miss_rate)
        ),
        format!(
            "- predict(tage lookup/hit/override/correct): `{}` / `{}` / `{}` / `{}`",
            c.tage_lookup_total, c.tage_hit_total, c.tage_override_total, c.tage_override_correct
        ),
        format!(
            "- predict(sc lookup/confident/override/correct): `{}` / `{}` / `{}` / `{}`",
            c.sc_lookup_total, c.sc_confident_total, c.sc_override_total, c.sc_override_correct
        ),
        format!(
            "- predict(loop lookup/hit/confident/override/correct): `{}` / `{}` / `{}` / `{}` / `{}`",
            c.loop_lookup_total,
            c.loop_hit_total,
            c.loop_confident_total,
            c.loop_override_total,
            c.loop_override_correct
        ),
        format!(
            "- predict(cond provider selected legacy/tage/sc/loop): `{}` / `{}` / `{}` / `{}` (coverage {})",
            c.cond_provider_legacy_selected,
            c.cond_provider_tage_selected,
            c.cond_provider_sc_selected,
            c.cond_provider_loop_selected,
            rate(p.cond_provider_coverage)
        ),
        format!(
            "- predict(cond wrong-selected alt-correct legacy/tage/sc/loop/any): `{}` / `{}` / `{}` / `{}` / `{}` (of `{}`)",
            c.cond_selected_wrong_alt_legacy_correct,
            c.cond_selected_wrong_alt_tage_correct,
            c.cond_selected_wrong_alt_sc_correct,
            c.cond_selected_wrong_alt_loop_correct,
            c.cond_selected_wrong_alt_any_correct,
            p.cond_selected_wrong_total
        ),
    ]);
}

fn fetch_queue_lines(lines: &mut Vec<String>, s: &RunSummary) {
    let fq = &s.ifu_fq;
    if fq.fq_samples == 0 && fq.fq_enq == 0 {
        return;
    }
    lines.extend([
        String::new(),
        "Fetch Queue Effectiveness:".to_string(),
        format!(
            "- enq/deq/bypass: `{}` / `{}` / `{}` (bypass {})",
            fq.fq_enq,
            fq.fq_deq,
            fq.fq_bypass,
            rate(fq.fq_bypass_ratio)
        ),
        format!("- enq_blocked: `{}`", fq.fq_enq_blocked),
        format!(
            "- full/empty/nonempty cycles: `{}` / `{}` / `{}`",
            fq.fq_full_cycles, fq.fq_empty_cycles, fq.fq_nonempty_cycles
        ),
        format!(
            "- occupancy(avg/max): `{:.3}` / `{}`",
            fq.fq_occ_avg, fq.fq_occ_max
        ),
    ]);
    for (occ, count) in &fq.fq_occ_hist {
        lines.push(format!("- occ={occ}: `{count}` ({})", pct(*count, fq.fq_samples)));
    }
}

pub fn render_benchmark(name: &str, s: &RunSummary) -> String {
    let benchmark_time = match s.effective_benchmark_time_ms {
        Some(ms) => format!("`{ms:.3}` ({})", s.benchmark_time_source.as_str()),
        None => "`N/A`".to_string(),
    };
    let mut lines = vec![
        format!("### {name}"),
        String::new(),
        format!("- IPC/CPI: `{:.6}` / `{:.6}`", s.ipc, s.cpi),
        format!("- cycles/commits: `{}` / `{}`", s.cycles, s.commits),
        format!("- benchmark_time_ms: {benchmark_time}"),
        format!("- flush_per_kinst: `{:.3}`", s.flush_per_kinst),
        format!("- bru_per_kinst: `{:.3}`", s.bru_per_kinst),
        format!(
            "- mispredict_flush(cond/jump/ret/unknown): `{}` / `{}` / `{}` / `{}`",
            s.mispredict_cond_count,
            s.mispredict_jump_count,
            s.mispredict_ret_count,
            s.mispredict_control_unknown_count
        ),
        format!("- wrong_path_kill_uops: `{}`", s.wrong_path_kill_uops),
        format!(
            "- flush_penalty/branch_penalty cycles: `{}` / `{}`",
            s.flush_penalty_cycles, s.branch_penalty_cycles
        ),
        format!(
            "- redirect_distance(avg/max): `{:.2}` / `{}`",
            s.redirect_distance_avg, s.redirect_distance_max
        ),
        format!("- control_ratio: `{}`", rate(s.control.control_ratio)),
        format!(
            "- est_misp_per_kinst(static NT proxy): `{:.3}`",
            s.control.est_misp_per_kinst
        ),
    ];
    predictor_lines(&mut lines, s);

    lines.push(String::new());
    lines.push("Commit Width Histogram:".to_string());
    for (width, count) in &s.commit_width_hist {
        lines.push(format!("- width{width}: `{count}`"));
    }

    lines.push(String::new());
    lines.push(format!("Stall Categories ({}):", s.stall_mode.as_str()));
    if s.stall_total == 0 {
        lines.push("- (no stall samples)".to_string());
    } else {
        let mut categories: Vec<_> = s.stall_category.iter().collect();
        categories.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
        for (category, count) in categories {
            lines.push(format!(
                "- {category}: `{count}` ({})",
                pct(*count, s.stall_total)
            ));
        }
        lines.push(format!(
            "- decode_blocked within {} cycles of flush/branch flush: `{}` / `{}`",
            s.stall_post_flush_window_cycles,
            s.stall_decode_blocked_post_flush,
            s.stall_decode_blocked_post_branch_flush
        ));
    }
    breakdown(
        &mut lines,
        "Frontend Empty Breakdown:",
        &s.stall_frontend_empty_detail,
        s.stall_frontend_empty_total,
    );
    breakdown(
        &mut lines,
        "Decode Blocked Breakdown:",
        &s.stall_decode_blocked_detail,
        s.stall_decode_blocked_total,
    );
    breakdown(
        &mut lines,
        "ROB Backpressure Breakdown:",
        &s.stall_rob_backpressure_detail,
        s.stall_rob_backpressure_total,
    );
    breakdown(
        &mut lines,
        "Other Breakdown:",
        &s.stall_other_detail,
        s.stall_other_total,
    );
    fetch_queue_lines(&mut lines, s);

    if !s.top_pc.is_empty() {
        lines.push(String::new());
        lines.push("Top PC Hotspots:".to_string());
        for hot in s.top_pc.iter().take(TOP_PC_SHOWN) {
            lines.push(format!("- {}: `{}`", hot.pc, hot.count));
        }
    }

    let degraded: Vec<_> = s
        .metric_sources
        .iter()
        .filter(|(_, source)| **source != MetricSource::Summary)
        .collect();
    if !degraded.is_empty() {
        lines.push(String::new());
        lines.push("Metric Sources (non-summary):".to_string());
        for (family, source) in degraded {
            lines.push(format!("- {family}: `{source}`"));
        }
    }
    if !s.quality_warnings.is_empty() {
        lines.push(String::new());
        lines.push("Quality Warnings:".to_string());
        for warning in &s.quality_warnings {
            lines.push(format!("- {warning}"));
        }
    }
    lines.join("\n")
}

/// Fills the template placeholders. Benchmarks outside [`BENCHMARK_ORDER`]
/// are not rendered.
pub fn render_report(
    template: &str,
    summaries: &BTreeMap<String, RunSummary>,
    generated_at: &str,
) -> String {
    let ordered: Vec<_> = BENCHMARK_ORDER
        .iter()
        .filter_map(|name| summaries.get(*name).map(|s| (*name, s)))
        .collect();
    let body = if ordered.is_empty() {
        "(No benchmark logs found)".to_string()
    } else {
        ordered
            .iter()
            .map(|(name, s)| render_benchmark(name, s))
            .collect::<Vec<_>>()
            .join("\n\n")
    };
    let profile_dir = ordered
        .first()
        .and_then(|(_, s)| Path::new(&s.log_path).parent())
        .map_or_else(|| "N/A".to_string(), |dir| dir.display().to_string());
    template
        .replace("{{GENERATED_AT}}", generated_at)
        .replace("{{PROFILE_DIR}}", &profile_dir)
        .replace("{{BENCHMARK_SECTIONS}}", &body)
}
