//! Branch predictor statistics from the cumulative `[pred]` counters, with
//! the derived rates the report shows.

use serde::Serialize;

use crate::control_flow::BranchClassCounts;
use crate::log_parser::Facts;

fn ratio(numer: u64, denom: u64) -> f64 {
    if denom == 0 {
        0.0
    } else {
        numer as f64 / denom as f64
    }
}

/// Raw counters as emitted on a `[pred]` line. Absent counters read as 0;
/// absent hit counts are derived as `total - miss`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PredictCounters {
    pub cond_total: u64,
    pub cond_miss: u64,
    pub cond_hit: u64,
    pub jump_total: u64,
    pub jump_miss: u64,
    pub jump_hit: u64,
    pub jump_direct_total: u64,
    pub jump_direct_miss: u64,
    pub jump_direct_hit: u64,
    pub jump_indirect_total: u64,
    pub jump_indirect_miss: u64,
    pub jump_indirect_hit: u64,
    pub ret_total: u64,
    pub ret_miss: u64,
    pub ret_hit: u64,
    pub call_total: u64,

    pub cond_update_total: u64,
    pub cond_local_correct: u64,
    pub cond_global_correct: u64,
    pub cond_selected_correct: u64,
    pub cond_choose_local: u64,
    pub cond_choose_global: u64,

    pub tage_lookup_total: u64,
    pub tage_hit_total: u64,
    pub tage_override_total: u64,
    pub tage_override_correct: u64,

    pub sc_lookup_total: u64,
    pub sc_confident_total: u64,
    pub sc_override_total: u64,
    pub sc_override_correct: u64,

    pub loop_lookup_total: u64,
    pub loop_hit_total: u64,
    pub loop_confident_total: u64,
    pub loop_override_total: u64,
    pub loop_override_correct: u64,

    pub cond_provider_legacy_selected: u64,
    pub cond_provider_tage_selected: u64,
    pub cond_provider_sc_selected: u64,
    pub cond_provider_loop_selected: u64,
    pub cond_provider_legacy_correct: u64,
    pub cond_provider_tage_correct: u64,
    pub cond_provider_sc_correct: u64,
    pub cond_provider_loop_correct: u64,

    pub cond_selected_wrong_alt_legacy_correct: u64,
    pub cond_selected_wrong_alt_tage_correct: u64,
    pub cond_selected_wrong_alt_sc_correct: u64,
    pub cond_selected_wrong_alt_loop_correct: u64,
    pub cond_selected_wrong_alt_any_correct: u64,
}

impl PredictCounters {
    pub fn from_facts(facts: &Facts<'_>) -> Self {
        let n = |key: &str| facts.num_or(key, 0);
        let hit = |prefix: &str| {
            facts
                .num(&format!("{prefix}_hit"))
                .unwrap_or_else(|| n(&format!("{prefix}_total")).saturating_sub(n(&format!("{prefix}_miss"))))
        };
        PredictCounters {
            cond_total: n("cond_total"),
            cond_miss: n("cond_miss"),
            cond_hit: hit("cond"),
            jump_total: n("jump_total"),
            jump_miss: n("jump_miss"),
            jump_hit: hit("jump"),
            jump_direct_total: n("jump_direct_total"),
            jump_direct_miss: n("jump_direct_miss"),
            jump_direct_hit: hit("jump_direct"),
            jump_indirect_total: n("jump_indirect_total"),
            jump_indirect_miss: n("jump_indirect_miss"),
            jump_indirect_hit: hit("jump_indirect"),
            ret_total: n("ret_total"),
            ret_miss: n("ret_miss"),
            ret_hit: hit("ret"),
            call_total: n("call_total"),

            cond_update_total: n("cond_update_total"),
            cond_local_correct: n("cond_local_correct"),
            cond_global_correct: n("cond_global_correct"),
            cond_selected_correct: n("cond_selected_correct"),
            cond_choose_local: n("cond_choose_local"),
            cond_choose_global: n("cond_choose_global"),

            tage_lookup_total: n("tage_lookup_total"),
            tage_hit_total: n("tage_hit_total"),
            tage_override_total: n("tage_override_total"),
            tage_override_correct: n("tage_override_correct"),

            sc_lookup_total: n("sc_lookup_total"),
            sc_confident_total: n("sc_confident_total"),
            sc_override_total: n("sc_override_total"),
            sc_override_correct: n("sc_override_correct"),

            loop_lookup_total: n("loop_lookup_total"),
            loop_hit_total: n("loop_hit_total"),
            loop_confident_total: n("loop_confident_total"),
            loop_override_total: n("loop_override_total"),
            loop_override_correct: n("loop_override_correct"),

            cond_provider_legacy_selected: n("cond_provider_legacy_selected"),
            cond_provider_tage_selected: n("cond_provider_tage_selected"),
            cond_provider_sc_selected: n("cond_provider_sc_selected"),
            cond_provider_loop_selected: n("cond_provider_loop_selected"),
            cond_provider_legacy_correct: n("cond_provider_legacy_correct"),
            cond_provider_tage_correct: n("cond_provider_tage_correct"),
            cond_provider_sc_correct: n("cond_provider_sc_correct"),
            cond_provider_loop_correct: n("cond_provider_loop_correct"),

            cond_selected_wrong_alt_legacy_correct: n("cond_selected_wrong_alt_legacy_correct"),
            cond_selected_wrong_alt_tage_correct: n("cond_selected_wrong_alt_tage_correct"),
            cond_selected_wrong_alt_sc_correct: n("cond_selected_wrong_alt_sc_correct"),
            cond_selected_wrong_alt_loop_correct: n("cond_selected_wrong_alt_loop_correct"),
            cond_selected_wrong_alt_any_correct: n("cond_selected_wrong_alt_any_correct"),
        }
    }

    /// Totals from retired instruction classes, misses from mispredict
    /// flushes. Hit counts follow as `total - miss`.
    pub fn reconstruct(classes: &BranchClassCounts, misses: &MispredictCounts) -> Self {
        let split = |total: u64, miss: u64| (total, miss, total.saturating_sub(miss));
        let (cond_total, cond_miss, cond_hit) = split(classes.cond, misses.cond);
        let (jump_total, jump_miss, jump_hit) = split(classes.jump, misses.jump);
        let (jump_direct_total, jump_direct_miss, jump_direct_hit) =
            split(classes.jump_direct, misses.jump_direct);
        let (jump_indirect_total, jump_indirect_miss, jump_indirect_hit) =
            split(classes.jump_indirect, misses.jump_indirect);
        let (ret_total, ret_miss, ret_hit) = split(classes.ret, misses.ret);
        PredictCounters {
            cond_total,
            cond_miss,
            cond_hit,
            jump_total,
            jump_miss,
            jump_hit,
            jump_direct_total,
            jump_direct_miss,
            jump_direct_hit,
            jump_indirect_total,
            jump_indirect_miss,
            jump_indirect_hit,
            ret_total,
            ret_miss,
            ret_hit,
            call_total: classes.call,
            ..PredictCounters::default()
        }
    }

    fn provider_selected(&self) -> [u64; 4] {
        [
            self.cond_provider_legacy_selected,
            self.cond_provider_tage_selected,
            self.cond_provider_sc_selected,
            self.cond_provider_loop_selected,
        ]
    }

    fn provider_correct(&self) -> [u64; 4] {
        [
            self.cond_provider_legacy_correct,
            self.cond_provider_tage_correct,
            self.cond_provider_sc_correct,
            self.cond_provider_loop_correct,
        ]
    }

    fn wrong_alt_correct(&self) -> [u64; 4] {
        [
            self.cond_selected_wrong_alt_legacy_correct,
            self.cond_selected_wrong_alt_tage_correct,
            self.cond_selected_wrong_alt_sc_correct,
            self.cond_selected_wrong_alt_loop_correct,
        ]
    }

    /// Checks that the four providers behave as mutually exclusive per
    /// update. Returns one message per violated bound.
    pub fn exclusivity_violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        let selected: u64 = self.provider_selected().iter().sum();
        if selected > self.cond_update_total {
            violations.push(format!(
                "predictor providers overlap: selected total {selected} exceeds cond_update_total {}",
                self.cond_update_total
            ));
        }
        let any = self.cond_selected_wrong_alt_any_correct;
        for (name, count) in PROVIDERS.iter().zip(self.wrong_alt_correct()) {
            if count > any {
                violations.push(format!(
                    "predictor wrong-alt accounting inconsistent: {name} alt-correct {count} exceeds any {any}"
                ));
            }
        }
        violations
    }
}

const PROVIDERS: [&str; 4] = ["legacy", "tage", "sc", "loop"];

/// Mispredict flush counts per control subtype.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MispredictCounts {
    pub cond: u64,
    pub jump: u64,
    pub jump_direct: u64,
    pub jump_indirect: u64,
    pub ret: u64,
}

/// Counters plus every derived rate. Ratios with a zero denominator are 0.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PredictSummary {
    #[serde(flatten)]
    pub counters: PredictCounters,

    pub cond_miss_rate: f64,
    pub jump_miss_rate: f64,
    pub jump_direct_miss_rate: f64,
    pub jump_indirect_miss_rate: f64,
    pub ret_miss_rate: f64,

    pub cond_local_accuracy: f64,
    pub cond_global_accuracy: f64,
    pub cond_selected_accuracy: f64,
    pub cond_choose_global_ratio: f64,

    pub tage_hit_rate: f64,
    pub tage_override_ratio: f64,
    pub tage_override_accuracy: f64,

    pub sc_confident_ratio: f64,
    pub sc_override_ratio: f64,
    pub sc_override_accuracy: f64,

    pub loop_hit_rate: f64,
    pub loop_confident_ratio: f64,
    pub loop_override_ratio: f64,
    pub loop_override_accuracy: f64,

    pub cond_provider_total_selected: u64,
    pub cond_provider_coverage: f64,
    pub cond_provider_legacy_accuracy: f64,
    pub cond_provider_tage_accuracy: f64,
    pub cond_provider_sc_accuracy: f64,
    pub cond_provider_loop_accuracy: f64,
    pub cond_provider_legacy_share: f64,
    pub cond_provider_tage_share: f64,
    pub cond_provider_sc_share: f64,
    pub cond_provider_loop_share: f64,

    pub cond_selected_wrong_total: u64,
    pub cond_selected_wrong_alt_any_ratio: f64,
}

impl From<PredictCounters> for PredictSummary {
    fn from(c: PredictCounters) -> Self {
        let selected = c.provider_selected();
        let correct = c.provider_correct();
        let total_selected: u64 = selected.iter().sum();
        let accuracy: Vec<f64> = selected.iter().zip(correct).map(|(&s, c)| ratio(c, s)).collect();
        let share: Vec<f64> = selected.iter().map(|&s| ratio(s, total_selected)).collect();
        let wrong_total = c.cond_update_total.saturating_sub(c.cond_selected_correct);

        PredictSummary {
            cond_miss_rate: ratio(c.cond_miss, c.cond_total),
            jump_miss_rate: ratio(c.jump_miss, c.jump_total),
            jump_direct_miss_rate: ratio(c.jump_direct_miss, c.jump_direct_total),
            jump_indirect_miss_rate: ratio(c.jump_indirect_miss, c.jump_indirect_total),
            ret_miss_rate: ratio(c.ret_miss, c.ret_total),

            cond_local_accuracy: ratio(c.cond_local_correct, c.cond_update_total),
            cond_global_accuracy: ratio(c.cond_global_correct, c.cond_update_total),
            cond_selected_accuracy: ratio(c.cond_selected_correct, c.cond_update_total),
            cond_choose_global_ratio: ratio(
                c.cond_choose_global,
                c.cond_choose_local + c.cond_choose_global,
            ),

            tage_hit_rate: ratio(c.tage_hit_total, c.tage_lookup_total),
            tage_override_ratio: ratio(c.tage_override_total, c.tage_lookup_total),
            tage_override_accuracy: ratio(c.tage_override_correct, c.tage_override_total),

            sc_confident_ratio: ratio(c.sc_confident_total, c.sc_lookup_total),
            sc_override_ratio: ratio(c.sc_override_total, c.sc_lookup_total),
            sc_override_accuracy: ratio(c.sc_override_correct, c.sc_override_total),

            loop_hit_rate: ratio(c.loop_hit_total, c.loop_lookup_total),
            loop_confident_ratio: ratio(c.loop_confident_total, c.loop_lookup_total),
            loop_override_ratio: ratio(c.loop_override_total, c.loop_lookup_total),
            loop_override_accuracy: ratio(c.loop_override_correct, c.loop_override_total),

            cond_provider_total_selected: total_selected,
            cond_provider_coverage: ratio(total_selected, c.cond_update_total),
            cond_provider_legacy_accuracy: accuracy[0],
            cond_provider_tage_accuracy: accuracy[1],
            cond_provider_sc_accuracy: accuracy[2],
            cond_provider_loop_accuracy: accuracy[3],
            cond_provider_legacy_share: share[0],
            cond_provider_tage_share: share[1],
            cond_provider_sc_share: share[2],
            cond_provider_loop_share: share[3],

            cond_selected_wrong_total: wrong_total,
            cond_selected_wrong_alt_any_ratio: ratio(c.cond_selected_wrong_alt_any_correct, wrong_total),

            counters: c,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(line: &str) -> PredictSummary {
        PredictCounters::from_facts(&Facts::tokenize(line)).into()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn miss_rates_and_derived_hits() {
        let pred = summary(
            " cond_total=10 cond_miss=4 jump_total=8 jump_miss=3 jump_direct_total=5 jump_direct_miss=1 \
             jump_indirect_total=3 jump_indirect_miss=2 ret_total=3 ret_miss=2 call_total=5",
        );
        assert_eq!(pred.counters.cond_hit, 6);
        assert_eq!(pred.counters.jump_direct_hit, 4);
        assert_eq!(pred.counters.ret_hit, 1);
        assert!(close(pred.ret_miss_rate, 2.0 / 3.0));
        assert!(close(pred.jump_direct_miss_rate, 0.2));
        assert!(close(pred.jump_indirect_miss_rate, 2.0 / 3.0));
    }

    #[test]
    fn explicit_hit_counts_are_kept() {
        let pred = summary(" cond_total=5 cond_miss=1 cond_hit=3");
        assert_eq!(pred.counters.cond_hit, 3);
    }

    #[test]
    fn tournament_and_tage_figures() {
        let pred = summary(
            " cond_update_total=100 cond_local_correct=78 cond_global_correct=70 cond_selected_correct=82 \
             cond_choose_local=60 cond_choose_global=40 tage_lookup_total=90 tage_hit_total=30 \
             tage_override_total=12 tage_override_correct=8",
        );
        assert!(close(pred.cond_local_accuracy, 0.78));
        assert!(close(pred.cond_selected_accuracy, 0.82));
        assert!(close(pred.cond_choose_global_ratio, 0.40));
        assert!(close(pred.tage_hit_rate, 1.0 / 3.0));
        assert!(close(pred.tage_override_ratio, 12.0 / 90.0));
        assert!(close(pred.tage_override_accuracy, 2.0 / 3.0));
    }

    #[test]
    fn sc_and_loop_figures() {
        let pred = summary(
            " sc_lookup_total=80 sc_confident_total=20 sc_override_total=12 sc_override_correct=9 \
             loop_lookup_total=50 loop_hit_total=40 loop_confident_total=12 loop_override_total=10 loop_override_correct=7",
        );
        assert!(close(pred.sc_confident_ratio, 0.25));
        assert!(close(pred.sc_override_accuracy, 0.75));
        assert!(close(pred.loop_hit_rate, 0.8));
        assert!(close(pred.loop_confident_ratio, 0.24));
        assert!(close(pred.loop_override_ratio, 0.2));
        assert!(close(pred.loop_override_accuracy, 0.7));
    }

    const PROVIDER_LINE: &str = " cond_update_total=90 cond_selected_correct=72 \
        cond_provider_legacy_selected=45 cond_provider_tage_selected=20 cond_provider_sc_selected=15 cond_provider_loop_selected=10 \
        cond_provider_legacy_correct=33 cond_provider_tage_correct=18 cond_provider_sc_correct=12 cond_provider_loop_correct=9 \
        cond_selected_wrong_alt_legacy_correct=6 cond_selected_wrong_alt_tage_correct=4 cond_selected_wrong_alt_sc_correct=3 \
        cond_selected_wrong_alt_loop_correct=2 cond_selected_wrong_alt_any_correct=10";

    #[test]
    fn provider_breakdown() {
        let pred = summary(PROVIDER_LINE);
        assert_eq!(pred.cond_provider_total_selected, 90);
        assert!(close(pred.cond_provider_coverage, 1.0));
        assert!(close(pred.cond_provider_legacy_accuracy, 33.0 / 45.0));
        assert!(close(pred.cond_provider_tage_share, 20.0 / 90.0));
        assert_eq!(pred.cond_selected_wrong_total, 18);
        assert!(close(pred.cond_selected_wrong_alt_any_ratio, 10.0 / 18.0));
        assert!(pred.counters.exclusivity_violations().is_empty());
    }

    #[test]
    fn overlapping_providers_are_reported() {
        let counters = PredictCounters::from_facts(&Facts::tokenize(
            " cond_update_total=50 cond_provider_legacy_selected=45 cond_provider_tage_selected=20 \
             cond_selected_wrong_alt_tage_correct=4 cond_selected_wrong_alt_any_correct=3",
        ));
        let violations = counters.exclusivity_violations();
        assert_eq!(violations.len(), 2);
        assert!(violations[0].contains("selected total 65"));
        assert!(violations[1].contains("tage"));
    }

    #[test]
    fn reconstruction_pairs_classes_with_flushes() {
        let classes = BranchClassCounts {
            cond: 10,
            jump: 4,
            jump_direct: 3,
            jump_indirect: 1,
            ret: 2,
            call: 3,
        };
        let misses = MispredictCounts {
            cond: 2,
            jump: 1,
            jump_direct: 0,
            jump_indirect: 1,
            ret: 1,
        };
        let pred: PredictSummary = PredictCounters::reconstruct(&classes, &misses).into();
        assert_eq!(pred.counters.cond_hit, 8);
        assert_eq!(pred.counters.jump_indirect_hit, 0);
        assert_eq!(pred.counters.call_total, 3);
        assert!(close(pred.cond_miss_rate, 0.2));
        assert!(close(pred.ret_miss_rate, 0.5));
    }
}
