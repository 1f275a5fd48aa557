use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::thread;

use log::{debug, info};

use crate::config::ProfileConfig;
use crate::control_flow::{BranchClassCounts, CommitRecord, ControlSummary};
use crate::error::{Result, TraceError};
use crate::fetch_queue::{FetchQueueSampler, FetchQueueSummary};
use crate::log_parser::{classify_line, parse_num, Facts, LogParser, Tag, TraceLine};
use crate::normalize::{self, FlushReason, FlushSource, MissSubtype, MissType};
use crate::predict::{MispredictCounts, PredictCounters};
use crate::reconcile::reconcile;
use crate::stall::{classify_stall, StallCategory, StallSignals};
use crate::stall_detail::{classify_detail, StallProbe};
use crate::summary::{format_word, HotInst, HotPc, RunSummary};

/// Benchmarks looked up by [`parse_log_directory`], each with the file names
/// tried in order.
pub const BENCHMARK_CANDIDATES: &[(&str, &[&str])] = &[
    ("dhrystone", &["dhrystone.log", "dhrystone_full.log"]),
    ("coremark", &["coremark.log", "coremark_full.log"]),
    ("coremark_sample", &["coremark_commit_sample.log"]),
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct RunStats {
    pub ipc: f64,
    pub cpi: f64,
    pub cycles: u64,
    pub commits: u64,
}

/// Per-event flush accounting from `[flush ]`, `[flushp]` lines.
#[derive(Debug, Clone, Default)]
pub(crate) struct FlushTally {
    pub count: u64,
    pub reasons: BTreeMap<FlushReason, u64>,
    pub sources: BTreeMap<FlushSource, u64>,
    pub mispredict_count: u64,
    pub misses: MispredictCounts,
    pub control_unknown: u64,
    pub wrong_path_kill_uops: u64,
    pub redirect_samples: u64,
    pub redirect_sum: u64,
    pub redirect_max: u64,
    pub penalty_cycles: u64,
    pub branch_penalty_cycles: u64,
    pub last_flush_cycle: Option<u64>,
    pub last_branch_flush_cycle: Option<u64>,
}

/// Aggregates from a `[flushm]` line.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FlushMetrics {
    pub wrong_path_killed_uops: u64,
    pub redirect_samples: u64,
    pub redirect_sum: u64,
    pub redirect_max: u64,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct CommitSummaryLine {
    pub cycles: Option<u64>,
    pub commits: Option<u64>,
    pub widths: BTreeMap<u32, u64>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct StallSummaryLine {
    pub total: u64,
    pub categories: BTreeMap<StallCategory, u64>,
}

/// One `[stallm2]`..`[stallm5]` line: the family total plus its detail keys.
#[derive(Debug, Clone, Default)]
pub(crate) struct DetailSummary {
    pub total: u64,
    pub detail: BTreeMap<String, u64>,
}

/// Sampled detail label counts for one stall category.
pub(crate) type DetailCounts = BTreeMap<&'static str, u64>;

/// Running state of one trace scan. Owned by [`TraceScanner`] and consumed
/// by [`reconcile`].
#[derive(Debug, Default)]
pub(crate) struct ScanState {
    pub lines: u64,
    pub run_stats: Option<RunStats>,
    pub timeout_cycles: Option<u64>,
    pub bench_time_ms: Option<f64>,
    pub host_time_us: Option<u64>,

    pub flush: FlushTally,
    pub flush_summary: Option<FlushMetrics>,
    pub bru_count: u64,

    pub commits: Vec<CommitRecord>,
    pub commits_per_cycle: HashMap<u64, u64>,
    pub pc_counts: HashMap<u32, u64>,
    pub inst_counts: HashMap<u32, u64>,
    pub branch_classes: BranchClassCounts,
    pub commit_summary: Option<CommitSummaryLine>,
    pub control_summary: Option<ControlSummary>,
    pub hot_pc_summary: Option<Vec<HotPc>>,
    pub hot_inst_summary: Option<Vec<HotInst>>,

    pub stall_samples: BTreeMap<StallCategory, u64>,
    pub decode_blocked_samples: DetailCounts,
    pub rob_backpressure_samples: DetailCounts,
    pub other_samples: DetailCounts,
    pub decode_blocked_post_flush: u64,
    pub decode_blocked_post_branch_flush: u64,
    pub stall_summary: Option<StallSummaryLine>,
    pub frontend_empty_summary: Option<DetailSummary>,
    pub decode_blocked_summary: Option<DetailSummary>,
    pub rob_backpressure_summary: Option<DetailSummary>,
    pub other_summary: Option<DetailSummary>,
    pub other_aux_summary: Option<BTreeMap<String, u64>>,

    pub predict: Option<PredictCounters>,
    pub fetch_queue_summary: Option<FetchQueueSummary>,
    pub fetch_queue_samples: FetchQueueSampler,
}

/// Feeds trace lines one at a time and produces a [`RunSummary`] at the end.
pub struct TraceScanner<'c> {
    config: &'c ProfileConfig,
    state: ScanState,
}

impl<'c> TraceScanner<'c> {
    pub fn new(config: &'c ProfileConfig) -> Self {
        TraceScanner {
            config,
            state: ScanState::default(),
        }
    }

    pub fn feed_line(&mut self, line: &str) {
        self.state.lines += 1;
        match classify_line(line) {
            TraceLine::RunStats {
                ipc,
                cpi,
                cycles,
                commits,
            } => {
                self.state.run_stats = Some(RunStats {
                    ipc,
                    cpi,
                    cycles,
                    commits,
                })
            }
            TraceLine::Timeout { cycles } => self.state.timeout_cycles = Some(cycles),
            TraceLine::BenchTime { ms } => self.state.bench_time_ms = Some(ms),
            TraceLine::HostTime { us } => self.state.host_time_us = Some(us),
            TraceLine::Tagged { tag, facts } => self.feed_tagged(tag, &facts),
            TraceLine::Untagged => {}
        }
    }

    fn feed_tagged(&mut self, tag: Tag, facts: &Facts<'_>) {
        match tag {
            Tag::Flush => self.record_flush(facts),
            Tag::FlushPenalty => self.record_flush_penalty(facts),
            Tag::Bru => self.state.bru_count += 1,
            Tag::Pred => self.state.predict = Some(PredictCounters::from_facts(facts)),
            Tag::Commit => self.record_commit(facts),
            Tag::Stall => self.record_stall(facts),
            Tag::CommitSummary => {
                self.state.commit_summary = Some(CommitSummaryLine {
                    cycles: facts.num("cycles"),
                    commits: facts.num("commits"),
                    widths: numbered_keys(facts, "width"),
                })
            }
            Tag::ControlSummary => {
                self.state.control_summary = Some(ControlSummary::from_facts(facts, 0))
            }
            Tag::HotPcSummary => {
                self.state.hot_pc_summary = Some(
                    ranked(facts, "pc")
                        .map(|(pc, count)| HotPc {
                            pc: format_word(pc),
                            count,
                        })
                        .collect(),
                )
            }
            Tag::HotInstSummary => {
                self.state.hot_inst_summary = Some(
                    ranked(facts, "inst")
                        .map(|(inst, count)| HotInst {
                            inst: format_word(inst),
                            count,
                        })
                        .collect(),
                )
            }
            Tag::StallSummary => {
                let categories: BTreeMap<_, _> = StallCategory::ALL
                    .iter()
                    .map(|&category| (category, facts.num_or(category.as_str(), 0)))
                    .collect();
                let total = facts
                    .num("stall_total_cycles")
                    .unwrap_or_else(|| categories.values().sum());
                self.state.stall_summary = Some(StallSummaryLine { total, categories });
            }
            Tag::FrontendEmptySummary => {
                self.state.frontend_empty_summary = Some(detail_summary(facts, "frontend_empty_total"))
            }
            Tag::DecodeBlockedSummary => {
                self.state.decode_blocked_summary = Some(detail_summary(facts, "decode_blocked_total"))
            }
            Tag::RobBackpressureSummary => {
                self.state.rob_backpressure_summary =
                    Some(detail_summary(facts, "rob_backpressure_total"))
            }
            Tag::OtherSummary => {
                let mut summary = detail_summary(facts, "other_total");
                summary.detail = summary
                    .detail
                    .into_iter()
                    .map(|(key, count)| (canonical_other_key(key), count))
                    .collect();
                self.state.other_summary = Some(summary);
            }
            Tag::OtherAuxSummary => {
                self.state.other_aux_summary = Some(detail_summary(facts, "").detail)
            }
            Tag::FetchQueueSummary => {
                self.state.fetch_queue_summary = Some(FetchQueueSummary::from_facts(facts))
            }
            Tag::FlushSummary => {
                self.state.flush_summary = Some(FlushMetrics {
                    wrong_path_killed_uops: facts.num_or("wrong_path_killed_uops", 0),
                    redirect_samples: facts.num_or("redirect_distance_samples", 0),
                    redirect_sum: facts.num_or("redirect_distance_sum", 0),
                    redirect_max: facts.num_or("redirect_distance_max", 0),
                })
            }
        }
    }

    fn record_flush(&mut self, facts: &Facts<'_>) {
        let flush = &mut self.state.flush;
        let reason = normalize::flush_reason(
            facts.get("reason").unwrap_or_default(),
            facts.span("reason"),
        );
        let source = normalize::flush_source(
            facts.get("source").unwrap_or_default(),
            facts.span("source"),
        );
        let subtype = facts
            .get("miss_subtype")
            .map(|token| normalize::miss_subtype(token, facts.span("miss_subtype")))
            .unwrap_or(MissSubtype::None);
        let miss_type = match subtype {
            MissSubtype::None => normalize::miss_type(
                facts.get("miss_type").unwrap_or_default(),
                facts.span("miss_type"),
            ),
            refined => refined.miss_type(),
        };

        flush.count += 1;
        *flush.reasons.entry(reason).or_insert(0) += 1;
        *flush.sources.entry(source).or_insert(0) += 1;
        if let Some(distance) = facts.num("redirect_distance") {
            flush.redirect_samples += 1;
            flush.redirect_sum += distance;
            flush.redirect_max = flush.redirect_max.max(distance);
        }

        let cycle = facts.num("cycle");
        if cycle.is_some() {
            flush.last_flush_cycle = cycle;
        }
        if reason != FlushReason::BranchMispredict {
            return;
        }
        if cycle.is_some() {
            flush.last_branch_flush_cycle = cycle;
        }
        flush.mispredict_count += 1;
        flush.wrong_path_kill_uops += facts.num_or("killed_uops", 0);
        match miss_type {
            MissType::CondBranch => flush.misses.cond += 1,
            MissType::Jump => flush.misses.jump += 1,
            MissType::Return => flush.misses.ret += 1,
            MissType::ControlUnknown => flush.control_unknown += 1,
            MissType::None => {}
        }
        match subtype {
            MissSubtype::JumpDirect => flush.misses.jump_direct += 1,
            MissSubtype::JumpIndirect => flush.misses.jump_indirect += 1,
            _ => {}
        }
    }

    fn record_flush_penalty(&mut self, facts: &Facts<'_>) {
        let flush = &mut self.state.flush;
        let penalty = facts.num_or("penalty", 0);
        flush.penalty_cycles += penalty;
        let reason = normalize::flush_reason(
            facts.get("reason").unwrap_or_default(),
            facts.span("reason"),
        );
        if reason == FlushReason::BranchMispredict {
            flush.branch_penalty_cycles += penalty;
        }
    }

    fn record_commit(&mut self, facts: &Facts<'_>) {
        let Some(commit) = CommitRecord::from_facts(facts) else {
            debug!("skipping [commit] line without cycle/slot/pc/inst");
            return;
        };
        let state = &mut self.state;
        *state.commits_per_cycle.entry(commit.cycle).or_insert(0) += 1;
        *state.pc_counts.entry(commit.pc).or_insert(0) += 1;
        *state.inst_counts.entry(commit.inst).or_insert(0) += 1;
        state.branch_classes.record(commit.inst);
        state.commits.push(commit);
    }

    fn record_stall(&mut self, facts: &Facts<'_>) {
        let config = self.config;
        let state = &mut self.state;
        let category = classify_stall(&StallSignals::from_facts(facts));
        *state.stall_samples.entry(category).or_insert(0) += 1;

        if let Some(fq) = facts.slots("ifu_fq(cnt/full/empty/pop)") {
            state.fetch_queue_samples.record(&fq, config.fq_occ_bins);
        }

        let samples = match category {
            StallCategory::DecodeBlocked => &mut state.decode_blocked_samples,
            StallCategory::RobBackpressure => &mut state.rob_backpressure_samples,
            StallCategory::Other => &mut state.other_samples,
            _ => return,
        };
        let probe = StallProbe::from_facts(facts);
        if let Some(label) = classify_detail(category, &probe, config) {
            *samples.entry(label).or_insert(0) += 1;
        }

        if category != StallCategory::DecodeBlocked {
            return;
        }
        let Some(cycle) = facts.num("cycle") else {
            return;
        };
        let within = |last: Option<u64>| {
            last.is_some_and(|last| cycle >= last && cycle - last <= config.post_flush_window_cycles)
        };
        if within(state.flush.last_flush_cycle) {
            state.decode_blocked_post_flush += 1;
        }
        if within(state.flush.last_branch_flush_cycle) {
            state.decode_blocked_post_branch_flush += 1;
        }
    }

    pub fn finish(self, log_path: &Path) -> RunSummary {
        info!(
            "scanned {} lines from {}",
            self.state.lines,
            log_path.display()
        );
        reconcile(self.state, log_path, self.config)
    }
}

/// `<prefix><N>=<count>` keys, e.g. `width5=7`.
fn numbered_keys(facts: &Facts<'_>, prefix: &str) -> BTreeMap<u32, u64> {
    facts
        .iter()
        .filter_map(|(key, value)| {
            let n = key.strip_prefix(prefix)?.parse::<u32>().ok()?;
            Some((n, parse_num(value)))
        })
        .collect()
}

/// `rank<i>_<value_key>` / `rank<i>_count` pairs in rank order.
fn ranked<'f>(facts: &'f Facts<'_>, value_key: &'f str) -> impl Iterator<Item = (u64, u64)> + 'f {
    (0..).map_while(move |i| {
        let value = facts.num(&format!("rank{i}_{value_key}"))?;
        Some((value, facts.num_or(&format!("rank{i}_count"), 0)))
    })
}

fn detail_summary(facts: &Facts<'_>, total_key: &str) -> DetailSummary {
    DetailSummary {
        total: facts.num_or(total_key, 0),
        detail: facts
            .iter()
            .filter(|(key, _)| *key != "mode" && *key != total_key)
            .map(|(key, value)| (key.to_string(), parse_num(value)))
            .collect(),
    }
}

/// Other-category heads are reported as non-backpressure causes.
fn canonical_other_key(key: String) -> String {
    if key.starts_with("rob_head_") && !key.ends_with("_nonbp") {
        format!("{key}_nonbp")
    } else {
        key
    }
}

pub fn parse_trace_reader<R: BufRead>(
    reader: R,
    log_path: &Path,
    config: &ProfileConfig,
) -> Result<RunSummary> {
    scan_lines(LogParser::new(reader), log_path, config)
}

pub fn parse_trace_file(path: &Path, config: &ProfileConfig) -> Result<RunSummary> {
    info!("scanning {}", path.display());
    scan_lines(LogParser::<BufReader<File>>::open(path)?, path, config)
}

fn scan_lines<R: BufRead>(
    parser: LogParser<R>,
    log_path: &Path,
    config: &ProfileConfig,
) -> Result<RunSummary> {
    let mut scanner = TraceScanner::new(config);
    for line in parser {
        let line = line.map_err(|source| TraceError::Io {
            path: log_path.to_path_buf(),
            source,
        })?;
        scanner.feed_line(&line);
    }
    Ok(scanner.finish(log_path))
}

/// First existing candidate file per benchmark.
pub fn find_benchmark_logs(dir: &Path) -> Vec<(&'static str, PathBuf)> {
    BENCHMARK_CANDIDATES
        .iter()
        .filter_map(|(bench, names)| {
            names
                .iter()
                .map(|name| dir.join(name))
                .find(|path| path.is_file())
                .map(|path| (*bench, path))
        })
        .collect()
}

/// Scans every benchmark log found in `dir`, one thread per file.
pub fn parse_log_directory(
    dir: &Path,
    config: &ProfileConfig,
) -> Result<BTreeMap<String, RunSummary>> {
    let logs = find_benchmark_logs(dir);
    if logs.is_empty() {
        info!("no benchmark logs found in {}", dir.display());
    }
    thread::scope(|scope| {
        let handles: Vec<_> = logs
            .iter()
            .map(|(bench, path)| {
                scope.spawn(move || parse_trace_file(path, config).map(|s| (bench.to_string(), s)))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(lines: &[&str]) -> ScanState {
        let config = ProfileConfig::default();
        let mut scanner = TraceScanner::new(&config);
        for line in lines {
            scanner.feed_line(line);
        }
        scanner.state
    }

    #[test]
    fn flush_lines_are_tallied_by_reason() {
        let state = scan(&[
            "[flush ] cycle=10 reason=branch_mispredict source=rob miss_type=jump miss_subtype=jump_indirect redirect_distance=16 killed_uops=5",
            "[flush ] cycle=30 reason=exception source=rob miss_type=none redirect_distance=208 killed_uops=2",
            "[flushp] cycle=13 reason=branch_mis penalty=3",
            "[flushp] cycle=36 reason=exception penalty=6",
        ]);
        let flush = &state.flush;
        assert_eq!(flush.count, 2);
        assert_eq!(flush.mispredict_count, 1);
        assert_eq!(flush.misses.jump, 1);
        assert_eq!(flush.misses.jump_indirect, 1);
        assert_eq!(flush.wrong_path_kill_uops, 5);
        assert_eq!(flush.redirect_max, 208);
        assert_eq!(flush.penalty_cycles, 9);
        assert_eq!(flush.branch_penalty_cycles, 3);
        assert_eq!(flush.last_flush_cycle, Some(30));
        assert_eq!(flush.last_branch_flush_cycle, Some(10));
    }

    #[test]
    fn subtype_supplies_missing_miss_type() {
        let state = scan(&["[flush ] cycle=40 reason=branch_mispredict source=rob miss_subtype=return"]);
        assert_eq!(state.flush.misses.ret, 1);
    }

    #[test]
    fn malformed_commit_lines_are_skipped() {
        let state = scan(&[
            "[commit] cycle=11 slot=0 pc=0x80000000 inst=0xfe0716e3",
            "[commit] cycle=12 slot=0",
        ]);
        assert_eq!(state.commits.len(), 1);
        assert_eq!(state.commits_per_cycle[&11], 1);
        assert_eq!(state.branch_classes.cond, 1);
    }

    #[test]
    fn stall_details_only_for_matching_category() {
        let state = scan(&[
            "[stall ] cycle=10 dec(v/r)=0/1 sb_alloc(req/ready/fire)=0x1/0/0",
            "[stall ] cycle=11 dec(v/r)=1/0 sb_alloc(req/ready/fire)=0x1/0/0",
        ]);
        assert_eq!(state.stall_samples[&StallCategory::FrontendEmpty], 1);
        assert_eq!(state.decode_blocked_samples["sb_alloc_blocked"], 1);
        assert!(state.rob_backpressure_samples.is_empty());
        assert!(state.other_samples.is_empty());
    }

    #[test]
    fn other_summary_keys_gain_nonbp_suffix() {
        let state = scan(&[
            "[stallm5] mode=cycle other_total=13 rob_head_lsu_incomplete_wait_req_ready=5 rob_head_alu_incomplete_nonbp=2 rob_empty_refill_ren_fire=4",
        ]);
        let other = state.other_summary.unwrap();
        assert_eq!(other.total, 13);
        assert_eq!(other.detail["rob_head_lsu_incomplete_wait_req_ready_nonbp"], 5);
        assert_eq!(other.detail["rob_head_alu_incomplete_nonbp"], 2);
        assert_eq!(other.detail["rob_empty_refill_ren_fire"], 4);
        assert!(!other.detail.contains_key("mode"));
        assert!(!other.detail.contains_key("other_total"));
    }

    #[test]
    fn ranked_hotspots_stop_at_first_gap() {
        let state = scan(&[
            "[hotpcm] rank0_pc=0x80000010 rank0_count=123 rank1_pc=0x80000020 rank1_count=77 rank3_pc=0x1 rank3_count=1",
        ]);
        let pcs = state.hot_pc_summary.unwrap();
        assert_eq!(pcs.len(), 2);
        assert_eq!(pcs[0].pc, "0x80000010");
        assert_eq!(pcs[1].count, 77);
    }

    #[test]
    fn commit_summary_collects_width_keys() {
        let state = scan(&["[commitm] cycles=100 commits=70 width0=30 width1=20 width5=7 width6=3"]);
        let commit = state.commit_summary.unwrap();
        assert_eq!(commit.cycles, Some(100));
        assert_eq!(commit.widths.get(&6), Some(&3));
        assert_eq!(commit.widths.len(), 4);
    }
}
