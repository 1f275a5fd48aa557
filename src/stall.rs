use std::fmt;

use serde::Serialize;

use crate::log_parser::Facts;

/// Top-level attribution of a cycle without retirement, in classification
/// priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StallCategory {
    FlushRecovery,
    IcacheMissWait,
    DcacheMissWait,
    RobBackpressure,
    FrontendEmpty,
    DecodeBlocked,
    LsuReqBlocked,
    Other,
}

impl StallCategory {
    pub const ALL: [StallCategory; 8] = [
        StallCategory::FlushRecovery,
        StallCategory::IcacheMissWait,
        StallCategory::DcacheMissWait,
        StallCategory::RobBackpressure,
        StallCategory::FrontendEmpty,
        StallCategory::DecodeBlocked,
        StallCategory::LsuReqBlocked,
        StallCategory::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StallCategory::FlushRecovery => "flush_recovery",
            StallCategory::IcacheMissWait => "icache_miss_wait",
            StallCategory::DcacheMissWait => "dcache_miss_wait",
            StallCategory::RobBackpressure => "rob_backpressure",
            StallCategory::FrontendEmpty => "frontend_empty",
            StallCategory::DecodeBlocked => "decode_blocked",
            StallCategory::LsuReqBlocked => "lsu_req_blocked",
            StallCategory::Other => "other",
        }
    }

    /// Categories that carry a finer cause label.
    pub fn has_detail(self) -> bool {
        matches!(
            self,
            StallCategory::DecodeBlocked
                | StallCategory::RobBackpressure
                | StallCategory::FrontendEmpty
                | StallCategory::Other
        )
    }
}

impl fmt::Display for StallCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signals of a `[stall ]` line that drive the top-level decision. Absent
/// fields read as "not the cause", except `rob_ready` which reads as ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StallSignals {
    pub flush: bool,
    pub icache_miss_valid: bool,
    pub dcache_miss_valid: bool,
    pub rob_ready: bool,
    pub dec_valid: Option<bool>,
    pub dec_ready: Option<bool>,
    pub lsu_issue_valid: bool,
    pub lsu_issue_ready: bool,
}

impl Default for StallSignals {
    fn default() -> Self {
        StallSignals {
            flush: false,
            icache_miss_valid: false,
            dcache_miss_valid: false,
            rob_ready: true,
            dec_valid: None,
            dec_ready: None,
            lsu_issue_valid: false,
            lsu_issue_ready: true,
        }
    }
}

impl StallSignals {
    pub fn from_facts(facts: &Facts<'_>) -> Self {
        // truncated valid/ready pairs count as absent
        let pair = |key: &str| facts.complete_slots(key, 2);
        let dec = pair("dec(v/r)");
        let lsu_issue = pair("lsu_issue(v/r)");
        StallSignals {
            flush: facts.flag("flush").unwrap_or(false),
            icache_miss_valid: pair("ic_miss(v/r)").is_some_and(|s| s.bit(0)),
            dcache_miss_valid: pair("dc_miss(v/r)").is_some_and(|s| s.bit(0)),
            rob_ready: facts.flag("rob_ready").unwrap_or(true),
            dec_valid: dec.as_ref().map(|s| s.bit(0)),
            dec_ready: dec.as_ref().map(|s| s.bit(1)),
            lsu_issue_valid: lsu_issue.as_ref().is_some_and(|s| s.bit(0)),
            lsu_issue_ready: lsu_issue.as_ref().is_none_or(|s| s.bit(1)),
        }
    }
}

#[derive(Clone, Copy)]
pub struct StallRule {
    pub category: StallCategory,
    pub applies: fn(&StallSignals) -> bool,
}

/// Front-of-pipe blockages are attributed before back-of-pipe ones; the
/// first rule that applies wins.
pub const STALL_RULES: &[StallRule] = &[
    StallRule {
        category: StallCategory::FlushRecovery,
        applies: |s| s.flush,
    },
    StallRule {
        category: StallCategory::IcacheMissWait,
        applies: |s| s.icache_miss_valid,
    },
    StallRule {
        category: StallCategory::DcacheMissWait,
        applies: |s| s.dcache_miss_valid,
    },
    StallRule {
        category: StallCategory::RobBackpressure,
        applies: |s| !s.rob_ready,
    },
    StallRule {
        category: StallCategory::FrontendEmpty,
        applies: |s| s.dec_valid == Some(false),
    },
    StallRule {
        category: StallCategory::DecodeBlocked,
        applies: |s| s.dec_valid == Some(true) && s.dec_ready == Some(false),
    },
    StallRule {
        category: StallCategory::LsuReqBlocked,
        applies: |s| s.lsu_issue_valid && !s.lsu_issue_ready,
    },
];

pub fn classify_with(rules: &[StallRule], signals: &StallSignals) -> StallCategory {
    rules
        .iter()
        .find(|rule| (rule.applies)(signals))
        .map_or(StallCategory::Other, |rule| rule.category)
}

pub fn classify_stall(signals: &StallSignals) -> StallCategory {
    classify_with(STALL_RULES, signals)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify_line(region: &str) -> StallCategory {
        classify_stall(&StallSignals::from_facts(&Facts::tokenize(region)))
    }

    #[test]
    fn empty_line_is_other() {
        assert_eq!(classify_line(""), StallCategory::Other);
    }

    #[test]
    fn each_predicate_maps_to_its_category() {
        assert_eq!(classify_line(" flush=1"), StallCategory::FlushRecovery);
        assert_eq!(classify_line(" ic_miss(v/r)=1/0"), StallCategory::IcacheMissWait);
        assert_eq!(classify_line(" dc_miss(v/r)=1/1"), StallCategory::DcacheMissWait);
        assert_eq!(classify_line(" rob_ready=0"), StallCategory::RobBackpressure);
        assert_eq!(classify_line(" dec(v/r)=0/1"), StallCategory::FrontendEmpty);
        assert_eq!(classify_line(" dec(v/r)=1/0"), StallCategory::DecodeBlocked);
        assert_eq!(
            classify_line(" dec(v/r)=1/1 lsu_issue(v/r)=1/0"),
            StallCategory::LsuReqBlocked
        );
        assert_eq!(classify_line(" dec(v/r)=1/1"), StallCategory::Other);
    }

    #[test]
    fn truncated_pairs_fall_through_to_default_category() {
        assert_eq!(classify_line(" dec(v/r)=1 rob_ready=1"), StallCategory::Other);
        assert_eq!(
            classify_line(" ic_miss(v/r)=1 dec(v/r)=0/1"),
            StallCategory::FrontendEmpty
        );
        assert_eq!(
            classify_line(" dc_miss(v/r)=1/ dec(v/r)=0/1"),
            StallCategory::FrontendEmpty
        );
        assert_eq!(
            classify_line(" dec(v/r)=1/1 lsu_issue(v/r)=1"),
            StallCategory::Other
        );
    }

    #[test]
    fn missing_rob_ready_is_not_backpressure() {
        assert_eq!(classify_line(" dec(v/r)=1/1"), StallCategory::Other);
    }

    #[test]
    fn first_matching_rule_wins() {
        let everything = " flush=1 ic_miss(v/r)=1/0 dc_miss(v/r)=1/0 rob_ready=0 dec(v/r)=1/0 lsu_issue(v/r)=1/0";
        assert_eq!(classify_line(everything), StallCategory::FlushRecovery);
        assert_eq!(
            classify_line(" ic_miss(v/r)=1/0 dc_miss(v/r)=1/0 rob_ready=0"),
            StallCategory::IcacheMissWait
        );
        assert_eq!(
            classify_line(" rob_ready=0 dec(v/r)=0/0"),
            StallCategory::RobBackpressure
        );
    }

    #[test]
    fn reordering_rules_changes_the_outcome() {
        // each fixture satisfies rule `i` and rule `i + 1` and nothing earlier;
        // frontend_empty and decode_blocked are exclusive on dec(v/r)
        let fixtures = [
            (0, " flush=1 ic_miss(v/r)=1/0"),
            (1, " ic_miss(v/r)=1/0 dc_miss(v/r)=1/0"),
            (2, " dc_miss(v/r)=1/0 rob_ready=0"),
            (3, " rob_ready=0 dec(v/r)=0/0"),
            (5, " dec(v/r)=1/0 lsu_issue(v/r)=1/0"),
        ];
        for (i, region) in fixtures {
            let signals = StallSignals::from_facts(&Facts::tokenize(region));
            let mut swapped = STALL_RULES.to_vec();
            swapped.swap(i, i + 1);
            assert_eq!(classify_stall(&signals), STALL_RULES[i].category);
            assert_eq!(classify_with(&swapped, &signals), STALL_RULES[i + 1].category);
        }
    }
}
