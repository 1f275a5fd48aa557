use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Result, TraceError};

static TAG_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(\w+)\s*\]").expect("failed to compile regex"));

static FACT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|\s)([A-Za-z_][A-Za-z0-9_()/]*)=(\S+)").expect("failed to compile regex")
});

static RUN_STATS_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"IPC=([0-9]+(?:\.[0-9]+)?)\s+CPI=([0-9]+(?:\.[0-9]+)?)\s+cycles=(\d+)\s+commits=(\d+)",
    )
    .expect("failed to compile regex")
});

static TIMEOUT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"TIMEOUT after (\d+) cycles").expect("failed to compile regex"));

static BENCH_TIME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Total time \(ms\)\s*:\s*([0-9]+(?:\.[0-9]+)?)").expect("failed to compile regex")
});

static HOST_TIME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"host time spent\s*=\s*(\d+)\s*us").expect("failed to compile regex")
});

/// Line-prefix tags emitted by the simulator, one owner per tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Flush,
    FlushPenalty,
    Bru,
    Pred,
    Commit,
    Stall,
    CommitSummary,
    ControlSummary,
    HotPcSummary,
    HotInstSummary,
    StallSummary,
    FrontendEmptySummary,
    DecodeBlockedSummary,
    RobBackpressureSummary,
    OtherSummary,
    OtherAuxSummary,
    FetchQueueSummary,
    FlushSummary,
}

impl Tag {
    pub fn as_str(self) -> &'static str {
        match self {
            Tag::Flush => "flush",
            Tag::FlushPenalty => "flushp",
            Tag::Bru => "bru",
            Tag::Pred => "pred",
            Tag::Commit => "commit",
            Tag::Stall => "stall",
            Tag::CommitSummary => "commitm",
            Tag::ControlSummary => "controlm",
            Tag::HotPcSummary => "hotpcm",
            Tag::HotInstSummary => "hotinstm",
            Tag::StallSummary => "stallm",
            Tag::FrontendEmptySummary => "stallm2",
            Tag::DecodeBlockedSummary => "stallm3",
            Tag::RobBackpressureSummary => "stallm4",
            Tag::OtherSummary => "stallm5",
            Tag::OtherAuxSummary => "stallm6",
            Tag::FetchQueueSummary => "ifum",
            Tag::FlushSummary => "flushm",
        }
    }
}

impl FromStr for Tag {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "flush" => Tag::Flush,
            "flushp" => Tag::FlushPenalty,
            "bru" => Tag::Bru,
            "pred" => Tag::Pred,
            "commit" => Tag::Commit,
            "stall" => Tag::Stall,
            "commitm" => Tag::CommitSummary,
            "controlm" => Tag::ControlSummary,
            "hotpcm" => Tag::HotPcSummary,
            "hotinstm" => Tag::HotInstSummary,
            "stallm" => Tag::StallSummary,
            "stallm2" => Tag::FrontendEmptySummary,
            "stallm3" => Tag::DecodeBlockedSummary,
            "stallm4" => Tag::RobBackpressureSummary,
            "stallm5" => Tag::OtherSummary,
            "stallm6" => Tag::OtherAuxSummary,
            "ifum" => Tag::FetchQueueSummary,
            "flushm" => Tag::FlushSummary,
            _ => return Err(()),
        })
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.as_str())
    }
}

/// Decodes a decimal or `0x`-prefixed hexadecimal token. Anything that does
/// not parse counts as zero.
pub fn parse_num(token: &str) -> u64 {
    checked_num(token).unwrap_or(0)
}

/// Like [`parse_num`], but garbage and empty tokens yield `None`.
pub fn checked_num(token: &str) -> Option<u64> {
    let token = token.trim();
    match token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => token.parse::<u64>().ok(),
    }
}

#[derive(Debug, Clone, Copy)]
struct Fact<'a> {
    value: &'a str,
    // raw text from the value start up to the next key
    span: &'a str,
}

/// `key=value` facts found in one tagged line region. Later duplicates win.
#[derive(Debug, Clone, Default)]
pub struct Facts<'a> {
    map: HashMap<&'a str, Fact<'a>>,
    order: Vec<&'a str>,
}

impl<'a> Facts<'a> {
    pub fn tokenize(region: &'a str) -> Self {
        let captures: Vec<_> = FACT_PATTERN.captures_iter(region).collect();
        let mut facts = Facts::default();
        for (i, caps) in captures.iter().enumerate() {
            let (Some(key), Some(value)) = (caps.get(1), caps.get(2)) else {
                continue;
            };
            let span_end = captures
                .get(i + 1)
                .and_then(|next| next.get(0))
                .map_or(region.len(), |m| m.start());
            let fact = Fact {
                value: value.as_str(),
                span: &region[value.start()..span_end.max(value.end())],
            };
            if facts.map.insert(key.as_str(), fact).is_none() {
                facts.order.push(key.as_str());
            }
        }
        facts
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&'a str> {
        self.map.get(key).map(|fact| fact.value)
    }

    /// Raw text following `key=` up to the next key, including anything a
    /// corrupted writer left between them.
    pub fn span(&self, key: &str) -> Option<&'a str> {
        self.map.get(key).map(|fact| fact.span)
    }

    pub fn num(&self, key: &str) -> Option<u64> {
        self.get(key).map(parse_num)
    }

    pub fn num_or(&self, key: &str, default: u64) -> u64 {
        self.num(key).unwrap_or(default)
    }

    pub fn flag(&self, key: &str) -> Option<bool> {
        self.num(key).map(|v| v != 0)
    }

    /// Slash-separated values such as `dec(v/r)=1/0`.
    pub fn slots(&self, key: &str) -> Option<Slots> {
        self.get(key)
            .map(|value| Slots(value.split('/').map(parse_num).collect()))
    }

    /// Like [`Facts::slots`], but only when the first `n` positions all hold
    /// numbers. A truncated `dec(v/r)=1` reads as absent, not as `1/0`.
    pub fn complete_slots(&self, key: &str, n: usize) -> Option<Slots> {
        let values = self
            .get(key)?
            .split('/')
            .map(checked_num)
            .collect::<Option<Vec<_>>>()?;
        (values.len() >= n).then_some(Slots(values))
    }

    /// Facts in first-seen key order.
    pub fn iter(&self) -> impl Iterator<Item = (&'a str, &'a str)> + '_ {
        self.order
            .iter()
            .filter_map(move |key| self.map.get(key).map(|fact| (*key, fact.value)))
    }
}

/// Positional values of one slash-separated fact. Missing positions read as 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slots(Vec<u64>);

impl Slots {
    pub fn at(&self, i: usize) -> u64 {
        self.0.get(i).copied().unwrap_or(0)
    }

    pub fn bit(&self, i: usize) -> bool {
        self.at(i) != 0
    }
}

#[derive(Debug, Clone)]
pub enum TraceLine<'a> {
    RunStats {
        ipc: f64,
        cpi: f64,
        cycles: u64,
        commits: u64,
    },
    Timeout {
        cycles: u64,
    },
    BenchTime {
        ms: f64,
    },
    HostTime {
        us: u64,
    },
    Tagged {
        tag: Tag,
        facts: Facts<'a>,
    },
    Untagged,
}

/// Finds the first recognized tag on the line and returns it together with
/// the text that follows it.
pub fn find_tag(line: &str) -> Option<(Tag, &str)> {
    TAG_PATTERN.captures_iter(line).find_map(|caps| {
        let whole = caps.get(0)?;
        let tag = caps.get(1)?.as_str().parse::<Tag>().ok()?;
        Some((tag, &line[whole.end()..]))
    })
}

pub fn classify_line(line: &str) -> TraceLine<'_> {
    if let Some(caps) = RUN_STATS_PATTERN.captures(line) {
        return TraceLine::RunStats {
            ipc: caps[1].parse().unwrap_or(0.0),
            cpi: caps[2].parse().unwrap_or(0.0),
            cycles: parse_num(&caps[3]),
            commits: parse_num(&caps[4]),
        };
    }
    if let Some(caps) = TIMEOUT_PATTERN.captures(line) {
        return TraceLine::Timeout {
            cycles: parse_num(&caps[1]),
        };
    }
    if let Some(caps) = BENCH_TIME_PATTERN.captures(line) {
        return TraceLine::BenchTime {
            ms: caps[1].parse().unwrap_or(0.0),
        };
    }
    if let Some(caps) = HOST_TIME_PATTERN.captures(line) {
        return TraceLine::HostTime {
            us: parse_num(&caps[1]),
        };
    }
    match find_tag(line) {
        Some((tag, region)) => TraceLine::Tagged {
            tag,
            facts: Facts::tokenize(region),
        },
        None => TraceLine::Untagged,
    }
}

/// Reads a trace line by line. Bytes that are not valid UTF-8 are replaced
/// rather than failing the line.
pub struct LogParser<R> {
    reader: R,
    buffer: Vec<u8>,
}

impl LogParser<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(TraceError::TraceNotFound(path.to_path_buf()));
        }
        File::open(path)
            .map(|file| LogParser::new(BufReader::new(file)))
            .map_err(|source| TraceError::Io {
                path: path.to_path_buf(),
                source,
            })
    }
}

impl<R: BufRead> LogParser<R> {
    pub fn new(reader: R) -> Self {
        LogParser {
            reader,
            buffer: Vec::new(),
        }
    }
}

impl<R: BufRead> Iterator for LogParser<R> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.buffer.clear();
        match self.reader.read_until(b'\n', &mut self.buffer) {
            Ok(0) => None,
            Ok(_) => {
                let line = String::from_utf8_lossy(&self.buffer);
                Some(Ok(line.trim_end_matches(['\r', '\n']).to_string()))
            }
            Err(e) => Some(Err(e)),
        }
    }
}
