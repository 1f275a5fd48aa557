//! Maps free-text enum tokens from `[flush ]` / `[flushp]` lines onto closed
//! vocabularies. Exact allowlist membership is checked first; otherwise the
//! token (and the raw text around it) is reduced to lowercase letters and run
//! through an ordered list of substring rules. Nothing matching degrades to
//! the vocabulary's "unknown" member.

use log::debug;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    BranchMispredict,
    Exception,
    RobOther,
    External,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushSource {
    Rob,
    External,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MissType {
    CondBranch,
    Jump,
    Return,
    ControlUnknown,
    None,
}

/// Finer split of a mispredicted control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MissSubtype {
    CondBranch,
    JumpDirect,
    JumpIndirect,
    Return,
    ControlUnknown,
    None,
}

impl MissSubtype {
    pub fn miss_type(self) -> MissType {
        match self {
            MissSubtype::CondBranch => MissType::CondBranch,
            MissSubtype::JumpDirect | MissSubtype::JumpIndirect => MissType::Jump,
            MissSubtype::Return => MissType::Return,
            MissSubtype::ControlUnknown => MissType::ControlUnknown,
            MissSubtype::None => MissType::None,
        }
    }
}

const REASON_ALLOWLIST: &[(&str, FlushReason)] = &[
    ("branch_mispredict", FlushReason::BranchMispredict),
    ("exception", FlushReason::Exception),
    ("rob_other", FlushReason::RobOther),
    ("external", FlushReason::External),
    ("unknown", FlushReason::Unknown),
];

const SOURCE_ALLOWLIST: &[(&str, FlushSource)] = &[
    ("rob", FlushSource::Rob),
    ("external", FlushSource::External),
    ("unknown", FlushSource::Unknown),
];

const MISS_TYPE_ALLOWLIST: &[(&str, MissType)] = &[
    ("cond_branch", MissType::CondBranch),
    ("jump", MissType::Jump),
    ("return", MissType::Return),
    ("control_unknown", MissType::ControlUnknown),
    ("none", MissType::None),
];

const MISS_SUBTYPE_ALLOWLIST: &[(&str, MissSubtype)] = &[
    ("cond_branch", MissSubtype::CondBranch),
    ("jump_direct", MissSubtype::JumpDirect),
    ("jump_indirect", MissSubtype::JumpIndirect),
    ("return", MissSubtype::Return),
    ("control_unknown", MissSubtype::ControlUnknown),
    ("none", MissSubtype::None),
];

const MISPREDICT_FRAGMENTS: &[&str] = &["mispredict", "mispr", "misp", "predict"];
const BRANCH_FRAGMENTS: &[&str] = &["branch", "ranch", "bran", "brnch"];

/// One fuzzy rule: the label applies when the letters-only text satisfies `test`.
struct FuzzyRule<T> {
    test: fn(&str) -> bool,
    label: T,
}

const REASON_RULES: &[FuzzyRule<FlushReason>] = &[
    FuzzyRule {
        test: |s| s.contains("except"),
        label: FlushReason::Exception,
    },
    FuzzyRule {
        test: |s| looks_mispredict(s) && contains_any(s, BRANCH_FRAGMENTS),
        label: FlushReason::BranchMispredict,
    },
    FuzzyRule {
        test: |s| s.contains("rob") && s.contains("other"),
        label: FlushReason::RobOther,
    },
    FuzzyRule {
        test: |s| s.contains("extern"),
        label: FlushReason::External,
    },
];

const SOURCE_RULES: &[FuzzyRule<FlushSource>] = &[
    FuzzyRule {
        test: |s| s.contains("rob"),
        label: FlushSource::Rob,
    },
    FuzzyRule {
        test: |s| s.contains("extern"),
        label: FlushSource::External,
    },
];

const MISS_SUBTYPE_RULES: &[FuzzyRule<MissSubtype>] = &[
    FuzzyRule {
        test: |s| s.contains("control"),
        label: MissSubtype::ControlUnknown,
    },
    FuzzyRule {
        test: |s| s.contains("return") || s.starts_with("ret"),
        label: MissSubtype::Return,
    },
    FuzzyRule {
        test: |s| s.contains("indirect"),
        label: MissSubtype::JumpIndirect,
    },
    FuzzyRule {
        test: |s| s.contains("direct"),
        label: MissSubtype::JumpDirect,
    },
    FuzzyRule {
        test: |s| s.contains("cond") || contains_any(s, BRANCH_FRAGMENTS),
        label: MissSubtype::CondBranch,
    },
];

const MISS_TYPE_RULES: &[FuzzyRule<MissType>] = &[
    FuzzyRule {
        test: |s| s.contains("control"),
        label: MissType::ControlUnknown,
    },
    FuzzyRule {
        test: |s| s.contains("return") || s.starts_with("ret"),
        label: MissType::Return,
    },
    FuzzyRule {
        test: |s| s.contains("jump") || s.contains("jal"),
        label: MissType::Jump,
    },
    FuzzyRule {
        test: |s| s.contains("cond") || contains_any(s, BRANCH_FRAGMENTS),
        label: MissType::CondBranch,
    },
];

fn contains_any(s: &str, fragments: &[&str]) -> bool {
    fragments.iter().any(|f| s.contains(f))
}

// `branch_mis` style truncation: the text ends in a prefix of "mispredict".
fn looks_mispredict(s: &str) -> bool {
    const WORD: &str = "mispredict";
    contains_any(s, MISPREDICT_FRAGMENTS) || (3..WORD.len()).any(|n| s.ends_with(&WORD[..n]))
}

pub fn letters_only(text: &str) -> String {
    text.chars().filter(char::is_ascii_lowercase).collect()
}

fn normalize<T: Copy>(
    token: &str,
    context: Option<&str>,
    allowlist: &[(&str, T)],
    rules: &[FuzzyRule<T>],
    fallback: T,
) -> T {
    if let Some((_, label)) = allowlist.iter().find(|(name, _)| *name == token) {
        return *label;
    }
    let candidates = std::iter::once(letters_only(token))
        .chain(context.map(letters_only))
        .filter(|s| !s.is_empty());
    for text in candidates {
        if let Some(rule) = rules.iter().find(|rule| (rule.test)(&text)) {
            return rule.label;
        }
    }
    fallback
}

/// `context` is the raw text following the `reason=` key; it recovers tokens
/// that were split by stray whitespace.
pub fn flush_reason(token: &str, context: Option<&str>) -> FlushReason {
    let reason = normalize(
        token,
        context,
        REASON_ALLOWLIST,
        REASON_RULES,
        FlushReason::Unknown,
    );
    if reason == FlushReason::Unknown && token != "unknown" {
        debug!("unrecognized flush reason {token:?}");
    }
    reason
}

pub fn flush_source(token: &str, context: Option<&str>) -> FlushSource {
    normalize(
        token,
        context,
        SOURCE_ALLOWLIST,
        SOURCE_RULES,
        FlushSource::Unknown,
    )
}

pub fn miss_type(token: &str, context: Option<&str>) -> MissType {
    normalize(
        token,
        context,
        MISS_TYPE_ALLOWLIST,
        MISS_TYPE_RULES,
        MissType::None,
    )
}

pub fn miss_subtype(token: &str, context: Option<&str>) -> MissSubtype {
    normalize(
        token,
        context,
        MISS_SUBTYPE_ALLOWLIST,
        MISS_SUBTYPE_RULES,
        MissSubtype::None,
    )
}
