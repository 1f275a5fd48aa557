use std::collections::BTreeMap;

use serde::Serialize;

use crate::log_parser::{parse_num, Facts, Slots};

/// Fetch-queue occupancy and throughput figures.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FetchQueueSummary {
    pub fq_samples: u64,
    pub fq_enq: u64,
    pub fq_deq: u64,
    pub fq_bypass: u64,
    pub fq_enq_blocked: u64,
    pub fq_full_cycles: u64,
    pub fq_empty_cycles: u64,
    pub fq_nonempty_cycles: u64,
    pub fq_occ_sum: u64,
    pub fq_occ_max: u64,
    pub fq_occ_avg: f64,
    /// `fq_occ_avg_x1000 / 1000` as reported by the collector.
    pub fq_occ_avg_from_line: Option<f64>,
    pub fq_bypass_ratio: f64,
    pub fq_occ_hist: BTreeMap<u64, u64>,
}

impl FetchQueueSummary {
    /// Reads an `[ifum]` line. `fq_occ_bin<N>` keys become histogram buckets.
    pub fn from_facts(facts: &Facts<'_>) -> Self {
        let n = |key: &str| facts.num_or(key, 0);
        let fq_occ_hist = facts
            .iter()
            .filter_map(|(key, value)| {
                let bin = key.strip_prefix("fq_occ_bin")?.parse::<u64>().ok()?;
                Some((bin, parse_num(value)))
            })
            .collect();
        FetchQueueSummary {
            fq_samples: n("fq_samples"),
            fq_enq: n("fq_enq"),
            fq_deq: n("fq_deq"),
            fq_bypass: n("fq_bypass"),
            fq_enq_blocked: n("fq_enq_blocked"),
            fq_full_cycles: n("fq_full_cycles"),
            fq_empty_cycles: n("fq_empty_cycles"),
            fq_nonempty_cycles: n("fq_nonempty_cycles"),
            fq_occ_sum: n("fq_occ_sum"),
            fq_occ_max: n("fq_occ_max"),
            fq_occ_avg_from_line: facts.num("fq_occ_avg_x1000").map(|v| v as f64 / 1000.0),
            fq_occ_hist,
            ..FetchQueueSummary::default()
        }
        .finish()
    }

    fn finish(mut self) -> Self {
        self.fq_occ_avg = if self.fq_samples == 0 {
            0.0
        } else {
            self.fq_occ_sum as f64 / self.fq_samples as f64
        };
        self.fq_bypass_ratio = if self.fq_deq == 0 {
            0.0
        } else {
            self.fq_bypass as f64 / self.fq_deq as f64
        };
        self
    }
}

/// Rebuilds fetch-queue figures from the `ifu_fq(cnt/full/empty/pop)` field
/// of sampled `[stall]` lines. Enqueue and bypass counts are not observable
/// from samples and stay 0.
#[derive(Debug, Clone, Default)]
pub struct FetchQueueSampler {
    summary: FetchQueueSummary,
}

impl FetchQueueSampler {
    pub fn record(&mut self, fq: &Slots, occ_bins: u64) {
        let s = &mut self.summary;
        let count = fq.at(0);
        s.fq_samples += 1;
        s.fq_occ_sum += count;
        s.fq_occ_max = s.fq_occ_max.max(count);
        *s.fq_occ_hist
            .entry(count.min(occ_bins.saturating_sub(1)))
            .or_insert(0) += 1;
        if fq.bit(1) {
            s.fq_full_cycles += 1;
        }
        if fq.bit(2) {
            s.fq_empty_cycles += 1;
        } else {
            s.fq_nonempty_cycles += 1;
        }
        if fq.bit(3) {
            s.fq_deq += 1;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.summary.fq_samples == 0
    }

    pub fn finish(self) -> FetchQueueSummary {
        self.summary.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_line_is_read_with_bins() {
        let facts = Facts::tokenize(
            " mode=cycle fq_samples=100 fq_enq=40 fq_deq=38 fq_bypass=12 fq_enq_blocked=3 fq_full_cycles=5 \
             fq_empty_cycles=60 fq_nonempty_cycles=40 fq_occ_sum=55 fq_occ_max=3 fq_occ_avg_x1000=550 \
             fq_occ_bin0=60 fq_occ_bin1=25 fq_occ_bin2=10 fq_occ_bin3=5 fq_occ_bin4=0",
        );
        let fq = FetchQueueSummary::from_facts(&facts);
        assert_eq!(fq.fq_samples, 100);
        assert_eq!(fq.fq_enq_blocked, 3);
        assert!((fq.fq_occ_avg - 0.55).abs() < 1e-9);
        assert!((fq.fq_occ_avg_from_line.unwrap() - 0.55).abs() < 1e-9);
        assert!((fq.fq_bypass_ratio - 12.0 / 38.0).abs() < 1e-9);
        assert_eq!(fq.fq_occ_hist[&0], 60);
        assert_eq!(fq.fq_occ_hist[&3], 5);
        assert_eq!(fq.fq_occ_hist.len(), 5);
    }

    #[test]
    fn samples_clamp_occupancy_into_last_bin() {
        let mut sampler = FetchQueueSampler::default();
        assert!(sampler.is_empty());
        for value in ["2/0/0/1", "0/0/1/0", "9/1/0/1"] {
            let line = format!(" ifu_fq(cnt/full/empty/pop)={value}");
            let facts = Facts::tokenize(&line);
            let fq = facts.slots("ifu_fq(cnt/full/empty/pop)").unwrap();
            sampler.record(&fq, 4);
        }
        let fq = sampler.finish();
        assert_eq!(fq.fq_samples, 3);
        assert_eq!(fq.fq_occ_max, 9);
        assert_eq!(fq.fq_occ_hist[&3], 1);
        assert_eq!(fq.fq_full_cycles, 1);
        assert_eq!(fq.fq_empty_cycles, 1);
        assert_eq!(fq.fq_nonempty_cycles, 2);
        assert_eq!(fq.fq_deq, 2);
        assert!((fq.fq_occ_avg - 11.0 / 3.0).abs() < 1e-9);
    }
}
