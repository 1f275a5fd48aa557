//! Finer cause labels for sampled `[stall ]` lines whose top-level category is
//! `decode_blocked`, `rob_backpressure` or `other`. Each tree is an ordered
//! list of rules; the first rule returning a label wins. Groups of fields the
//! line does not carry never satisfy a rule.

use crate::config::ProfileConfig;
use crate::log_parser::{Facts, Slots};
use crate::stall::StallCategory;

/// Optional field groups of a `[stall ]` line used by the detail trees.
#[derive(Debug, Clone, Default)]
pub struct StallProbe {
    pub ren: Option<Slots>,
    pub lsug: Option<Slots>,
    pub dc_store_wait: Option<Slots>,
    pub sb_alloc: Option<Slots>,
    pub lsu_rs: Option<Slots>,
    pub lsu_rs_head: Option<Slots>,
    pub lsu_rs_head_ops: Option<Slots>,
    pub rob_q2: Option<Slots>,
    pub gate: Option<Slots>,
    pub need: Option<Slots>,
    pub lsu_sm: Option<u64>,
    pub lsu_ld: Option<Slots>,
    pub lsu_rsp: Option<Slots>,
    pub lsu_ld_fire: Option<bool>,
    pub lsu_rsp_fire: Option<bool>,
    pub rob_head: Option<Slots>,
    pub rob_cnt: Option<u64>,
    pub sb_head: Option<Slots>,
    pub sb_dcache: Option<Slots>,
    pub dc_mshr: Option<Slots>,
    pub dc_mshr_alloc: Option<Slots>,
    pub dc_miss: Option<Slots>,
    pub ifu_req: Option<Slots>,
    pub ifu_rsp: Option<Slots>,
}

impl StallProbe {
    pub fn from_facts(facts: &Facts<'_>) -> Self {
        StallProbe {
            ren: facts.slots("ren(pend/src/sel/fire/rdy)"),
            lsug: facts.slots("lsug(busy/alloc_fire/alloc_lane/ld_owner)"),
            dc_store_wait: facts.slots("dc_store_wait(same/full)"),
            sb_alloc: facts.slots("sb_alloc(req/ready/fire)"),
            lsu_rs: facts.slots("lsu_rs(b/r)"),
            lsu_rs_head: facts.slots("lsu_rs_head(v/idx/dst)"),
            lsu_rs_head_ops: facts.slots("lsu_rs_head(rs1r/rs2r/has1/has2)"),
            rob_q2: facts.slots("rob_q2(v/idx/fu/comp/st/pc)"),
            gate: facts.slots("gate(alu/bru/lsu/mdu/csr)"),
            need: facts.slots("need(alu/bru/lsu/mdu/csr)"),
            lsu_sm: facts.num("lsu_sm"),
            lsu_ld: facts.slots("lsu_ld(v/r/addr)"),
            lsu_rsp: facts.slots("lsu_rsp(v/r)"),
            lsu_ld_fire: facts.flag("lsu_ld_fire"),
            lsu_rsp_fire: facts.flag("lsu_rsp_fire"),
            rob_head: facts.slots("rob_head(fu/comp/is_store/pc)"),
            rob_cnt: facts.num("rob_cnt"),
            sb_head: facts.slots("sb_head(v/c/a/d/addr)"),
            sb_dcache: facts.slots("sb_dcache(v/r/addr)"),
            dc_mshr: facts.slots("dc_mshr(cnt/full/empty)"),
            dc_mshr_alloc: facts.slots("dc_mshr(alloc_rdy/line_hit)"),
            dc_miss: facts.slots("dc_miss(v/r)"),
            ifu_req: facts.slots("ifu_req(v/r/fire/inflight)"),
            ifu_rsp: facts.slots("ifu_rsp(v/cap)"),
        }
    }

    fn ld_fired(&self) -> bool {
        self.lsu_ld_fire.unwrap_or(false)
    }

    fn rsp_fired(&self) -> bool {
        self.lsu_rsp_fire.unwrap_or(false)
    }

    fn ld_owner(&self) -> u64 {
        self.lsug.as_ref().map_or(0, |s| s.at(3))
    }

    fn rsp(&self) -> (bool, bool) {
        self.lsu_rsp
            .as_ref()
            .map_or((false, false), |s| (s.bit(0), s.bit(1)))
    }

    fn q2_incomplete(&self) -> bool {
        self.rob_q2.as_ref().is_some_and(|q2| q2.bit(0) && !q2.bit(3))
    }

    fn sb_dcache_blocked(&self) -> bool {
        self.sb_dcache.as_ref().is_some_and(|s| s.bit(0) && !s.bit(1))
    }
}

pub type DetailRule = fn(&StallProbe, &ProfileConfig) -> Option<&'static str>;

pub const OTHER: &str = "other";

pub fn first_label(rules: &[DetailRule], probe: &StallProbe, config: &ProfileConfig) -> &'static str {
    rules
        .iter()
        .find_map(|rule| rule(probe, config))
        .unwrap_or(OTHER)
}

/// Detail label for a sample of `category`, or `None` when the category has
/// no sampled detail tree.
pub fn classify_detail(
    category: StallCategory,
    probe: &StallProbe,
    config: &ProfileConfig,
) -> Option<&'static str> {
    match category {
        StallCategory::DecodeBlocked => Some(first_label(DECODE_BLOCKED_RULES, probe, config)),
        StallCategory::RobBackpressure => Some(rob_backpressure_detail(probe)),
        StallCategory::Other => Some(first_label(OTHER_RULES, probe, config)),
        _ => None,
    }
}

/* decode_blocked */

const GATE_ALU: usize = 0;
const GATE_BRU: usize = 1;
const GATE_LSU: usize = 2;
const GATE_MDU: usize = 3;
const GATE_CSR: usize = 4;

/// Dispatch gate attribution order: lsu > alu > bru > csr > mdu.
const GATE_PRIORITY: [(usize, &str); 5] = [
    (GATE_LSU, "dispatch_gate_lsu"),
    (GATE_ALU, "dispatch_gate_alu"),
    (GATE_BRU, "dispatch_gate_bru"),
    (GATE_CSR, "dispatch_gate_csr"),
    (GATE_MDU, "dispatch_gate_mdu"),
];

pub const DECODE_BLOCKED_RULES: &[DetailRule] = &[
    pending_replay,
    lsu_group_wait,
    dcache_store_wait,
    |p, _| {
        let sb = p.sb_alloc.as_ref()?;
        (sb.at(0) != 0 && !sb.bit(1)).then_some("sb_alloc_blocked")
    },
    |p, _| {
        let head = p.lsu_rs_head.as_ref()?;
        let ops = p.lsu_rs_head_ops.as_ref()?;
        let rs1_wait = ops.bit(2) && !ops.bit(0);
        let rs2_wait = ops.bit(3) && !ops.bit(1);
        (head.bit(0) && (rs1_wait || rs2_wait)).then_some("lsu_operand_wait")
    },
    |p, _| {
        let rs = p.lsu_rs.as_ref()?;
        (rs.at(0) != 0 && rs.at(1) == 0).then_some("lsu_rs_pressure")
    },
    |p, _| {
        let ops = p.lsu_rs_head_ops.as_ref()?;
        (p.q2_incomplete() && ops.bit(3) && !ops.bit(1)).then_some("rob_q2_wait")
    },
    dispatch_gate,
    |p, _| match p.lsu_sm? {
        1 if !p.ld_fired() => Some("lsu_wait_ld_req"),
        2 if !p.rsp_fired() => Some("lsu_wait_ld_rsp"),
        _ => None,
    },
];

fn pending_replay(p: &StallProbe, config: &ProfileConfig) -> Option<&'static str> {
    let ren = p.ren.as_ref()?;
    if !ren.bit(0) {
        return None;
    }
    let full = ren.at(1) >= config.pending_replay_full_lanes;
    let progress = ren.bit(3) && ren.at(2) > 0;
    Some(match (progress, full) {
        (true, true) => "pending_replay_progress_full",
        (true, false) => "pending_replay_progress_has_room",
        (false, true) => "pending_replay_wait_full",
        (false, false) => "pending_replay_wait_has_room",
    })
}

fn lsu_group_wait(p: &StallProbe, _: &ProfileConfig) -> Option<&'static str> {
    let lsug = p.lsug.as_ref()?;
    if lsug.at(0) == 0 || lsug.bit(1) {
        return None;
    }
    Some(if lsug.at(3) == 0 {
        "lsug_wait_dcache_owner"
    } else {
        "lsug_no_free_lane"
    })
}

fn dcache_store_wait(p: &StallProbe, _: &ProfileConfig) -> Option<&'static str> {
    let wait = p.dc_store_wait.as_ref()?;
    if wait.bit(0) {
        Some("dc_store_wait_same_line")
    } else if wait.bit(1) {
        Some("dc_store_wait_mshr_full")
    } else {
        None
    }
}

fn dispatch_gate(p: &StallProbe, _: &ProfileConfig) -> Option<&'static str> {
    let gate = p.gate.as_ref()?;
    let needed = |idx: usize| p.need.as_ref().is_some_and(|need| need.at(idx) > 0);
    GATE_PRIORITY
        .iter()
        .find(|(idx, _)| !gate.bit(*idx) && needed(*idx))
        .or_else(|| GATE_PRIORITY.iter().find(|(idx, _)| !gate.bit(*idx)))
        .map(|(_, label)| *label)
}

/* rob_backpressure */

const FU_ALU: u64 = 1;
const FU_BRANCH: u64 = 2;
const FU_LSU: u64 = 3;
const FU_MUL: u64 = 4;
const FU_DIV: u64 = 5;
const FU_CSR: u64 = 6;

const LSU_IDLE: u64 = 0;
const LSU_REQUEST: u64 = 1;
const LSU_RESPONSE: u64 = 2;
const LSU_WRITEBACK: u64 = 3;

/// Store-buffer head checks shared by the backpressure (`.1`) and the
/// non-backpressure (`.2`) trees.
type StoreRule = (fn(&StallProbe) -> bool, &'static str, &'static str);

const STORE_HEAD_RULES: &[StoreRule] = &[
    (
        |p| p.sb_head.as_ref().is_some_and(|h| !h.bit(0)),
        "rob_store_wait_sb_head",
        "rob_head_store_wait_sb_head_nonbp",
    ),
    (
        |p| p.sb_head.as_ref().is_some_and(|h| !h.bit(1)),
        "rob_store_wait_commit",
        "rob_head_store_wait_commit_nonbp",
    ),
    (
        |p| p.sb_head.as_ref().is_some_and(|h| !h.bit(2)),
        "rob_store_wait_addr",
        "rob_head_store_wait_addr_nonbp",
    ),
    (
        |p| p.sb_head.as_ref().is_some_and(|h| !h.bit(3)),
        "rob_store_wait_data",
        "rob_head_store_wait_data_nonbp",
    ),
    (
        StallProbe::sb_dcache_blocked,
        "rob_store_wait_dcache",
        "rob_head_store_wait_dcache_nonbp",
    ),
    (
        |p| p.sb_dcache.as_ref().is_some_and(|s| !s.bit(0)),
        "rob_store_wait_issue",
        "rob_head_store_wait_issue_nonbp",
    ),
];

fn store_wait(p: &StallProbe, backpressure: bool) -> &'static str {
    STORE_HEAD_RULES
        .iter()
        .find(|(applies, _, _)| applies(p))
        .map_or(
            if backpressure {
                "rob_store_wait_other"
            } else {
                "rob_head_store_wait_other_nonbp"
            },
            |&(_, bp, nonbp)| if backpressure { bp } else { nonbp },
        )
}

pub fn rob_backpressure_detail(p: &StallProbe) -> &'static str {
    let Some(head) = p.rob_head.as_ref() else {
        return OTHER;
    };
    let (fu, complete, is_store) = (head.at(0), head.bit(1), head.bit(2));
    if is_store {
        return store_wait(p, true);
    }
    if complete {
        return "rob_head_complete_but_not_ready";
    }
    match fu {
        FU_ALU => "rob_head_fu_alu_incomplete",
        FU_BRANCH => "rob_head_fu_branch_incomplete",
        FU_LSU => rob_lsu_incomplete(p),
        FU_MUL | FU_DIV => "rob_head_fu_mdu_incomplete",
        FU_CSR => "rob_head_fu_csr_incomplete",
        _ => "rob_head_fu_unknown_incomplete",
    }
}

// Load/store head: idle -> request -> response -> writeback.
fn rob_lsu_incomplete(p: &StallProbe) -> &'static str {
    match p.lsu_sm {
        None => "rob_lsu_incomplete_no_sm",
        Some(LSU_IDLE) => "rob_lsu_incomplete_sm_idle",
        Some(LSU_REQUEST) => rob_lsu_request(p),
        Some(LSU_RESPONSE) => rob_lsu_response(p),
        Some(LSU_WRITEBACK) => "rob_lsu_wait_wb",
        Some(_) => "rob_lsu_incomplete_sm_illegal",
    }
}

fn owner_rsp(p: &StallProbe, fire: &'static str, valid: &'static str, ready: &'static str) -> Option<&'static str> {
    match p.rsp() {
        (true, true) => Some(fire),
        (false, true) => Some(valid),
        (true, false) => Some(ready),
        (false, false) => None,
    }
}

fn rob_lsu_request(p: &StallProbe) -> &'static str {
    let Some(ld) = p.lsu_ld.as_ref() else {
        return "rob_lsu_incomplete_sm_req_unknown";
    };
    let (ld_valid, ld_ready) = (ld.bit(0), ld.bit(1));
    let owner = p.ld_owner();

    if ld_valid && !ld_ready {
        if owner != 0 {
            if let Some(label) = owner_rsp(
                p,
                "rob_lsu_wait_ld_req_ready_owner_rsp_fire",
                "rob_lsu_wait_ld_req_ready_owner_rsp_valid",
                "rob_lsu_wait_ld_req_ready_owner_rsp_ready",
            ) {
                return label;
            }
        }
        if p.sb_dcache_blocked() {
            return "rob_lsu_wait_ld_req_ready_sb_conflict";
        }
        let mshr_full = p.dc_mshr.as_ref().is_some_and(|m| m.bit(1));
        let mshr_no_alloc = p.dc_mshr_alloc.as_ref().is_some_and(|m| !m.bit(0));
        if mshr_full || mshr_no_alloc {
            return "rob_lsu_wait_ld_req_ready_mshr_blocked";
        }
        if p.dc_miss.as_ref().is_some_and(|m| m.bit(0) && !m.bit(1)) {
            return "rob_lsu_wait_ld_req_ready_miss_port_busy";
        }
        return "rob_lsu_wait_ld_req_ready";
    }
    if !ld_valid && !ld_ready {
        if owner != 0 {
            return owner_rsp(
                p,
                "rob_lsu_wait_ld_owner_rsp_fire",
                "rob_lsu_wait_ld_owner_rsp_valid",
                "rob_lsu_wait_ld_owner_rsp_ready",
            )
            .unwrap_or("rob_lsu_wait_ld_owner_hold");
        }
        if p.lsug.as_ref().is_some_and(|g| !g.bit(1)) {
            return "rob_lsu_wait_ld_arb_no_grant";
        }
    }
    if !p.ld_fired() {
        return "rob_lsu_wait_ld_req_fire";
    }
    "rob_lsu_incomplete_sm_req_unknown"
}

fn rob_lsu_response(p: &StallProbe) -> &'static str {
    if p.lsu_rsp.is_none() {
        return "rob_lsu_incomplete_sm_rsp_unknown";
    }
    match p.rsp() {
        (false, _) => "rob_lsu_wait_ld_rsp_valid",
        (true, false) => "rob_lsu_wait_ld_rsp_ready",
        (true, true) if !p.rsp_fired() => "rob_lsu_wait_ld_rsp_fire",
        _ => "rob_lsu_incomplete_sm_rsp_unknown",
    }
}

/* other */

pub const OTHER_RULES: &[DetailRule] = &[
    rob_empty_refill,
    lsu_writeback,
    |p, _| {
        let head = p.rob_head.as_ref()?;
        head.bit(2).then(|| store_wait(p, false))
    },
    |p, _| {
        let head = p.rob_head.as_ref()?;
        (!head.bit(1)).then(|| head_incomplete_nonbp(p, head.at(0)))
    },
    |p, _| p.q2_incomplete().then_some("rob_q2_not_complete_nonstall"),
    |p, _| {
        let ren = p.ren.as_ref()?;
        if !ren.bit(4) {
            Some("ren_not_ready")
        } else if !ren.bit(3) {
            Some("ren_no_fire")
        } else {
            None
        }
    },
    |p, _| {
        let ld = p.lsu_ld.as_ref()?;
        (p.lsu_sm == Some(LSU_REQUEST) && ld.bit(0) && ld.bit(1) && !p.ld_fired())
            .then_some("lsu_req_fire_gap")
    },
    |p, _| {
        let (valid, ready) = p.rsp();
        (p.lsu_sm == Some(LSU_RESPONSE) && valid && ready && !p.rsp_fired())
            .then_some("lsu_rsp_fire_gap")
    },
];

fn rob_empty_refill(p: &StallProbe, _: &ProfileConfig) -> Option<&'static str> {
    if p.rob_cnt? != 0 {
        return None;
    }
    if let Some(ren) = p.ren.as_ref() {
        if !ren.bit(4) {
            return Some("rob_empty_refill_ren_not_ready");
        }
        if ren.bit(3) {
            return Some("rob_empty_refill_ren_fire");
        }
    }
    if p.ifu_req.as_ref().is_some_and(|req| req.bit(3)) {
        return Some("rob_empty_refill_wait_frontend_rsp");
    }
    if p.ifu_rsp.as_ref().is_some_and(|rsp| rsp.bit(0) && rsp.bit(1)) {
        return Some("rob_empty_refill_rsp_capture");
    }
    Some("rob_empty_refill_other")
}

fn lsu_writeback(p: &StallProbe, _: &ProfileConfig) -> Option<&'static str> {
    if p.lsu_sm != Some(LSU_WRITEBACK) {
        return None;
    }
    let head = p.rob_head.as_ref().map(|h| (h.at(0), h.bit(1)));
    Some(match head {
        Some((FU_LSU, false)) => "lsu_wait_wb_head_lsu_incomplete",
        Some((FU_LSU, true)) => "lsu_wait_wb_head_lsu_complete",
        _ if p.q2_incomplete() => "lsu_wait_wb_q2_incomplete",
        Some(_) => "lsu_wait_wb_other",
        None => "lsu_wait_wb",
    })
}

fn head_incomplete_nonbp(p: &StallProbe, fu: u64) -> &'static str {
    match fu {
        FU_ALU => "rob_head_alu_incomplete_nonbp",
        FU_BRANCH => "rob_head_branch_incomplete_nonbp",
        FU_LSU => head_lsu_incomplete_nonbp(p),
        FU_MUL | FU_DIV => "rob_head_mdu_incomplete_nonbp",
        FU_CSR => "rob_head_csr_incomplete_nonbp",
        _ => "rob_head_unknown_incomplete_nonbp",
    }
}

fn head_lsu_incomplete_nonbp(p: &StallProbe) -> &'static str {
    match p.lsu_sm {
        None => "rob_head_lsu_incomplete_no_sm_nonbp",
        Some(LSU_IDLE) => "rob_head_lsu_incomplete_sm_idle_nonbp",
        Some(LSU_REQUEST) => match p.lsu_ld.as_ref().map(|ld| (ld.bit(0), ld.bit(1))) {
            None => "rob_head_lsu_incomplete_sm_req_unknown_nonbp",
            Some((true, false)) => "rob_head_lsu_incomplete_wait_req_ready_nonbp",
            Some((false, false)) => "rob_head_lsu_incomplete_wait_owner_or_alloc_nonbp",
            Some(_) if !p.ld_fired() => "rob_head_lsu_incomplete_req_fire_gap_nonbp",
            Some(_) => "rob_head_lsu_incomplete_sm_req_unknown_nonbp",
        },
        Some(LSU_RESPONSE) => match p.lsu_rsp.as_ref().map(|rsp| (rsp.bit(0), rsp.bit(1))) {
            None => "rob_head_lsu_incomplete_sm_rsp_unknown_nonbp",
            Some((false, _)) => "rob_head_lsu_incomplete_wait_rsp_valid_nonbp",
            Some((true, false)) => "rob_head_lsu_incomplete_wait_rsp_ready_nonbp",
            Some(_) if !p.rsp_fired() => "rob_head_lsu_incomplete_rsp_fire_gap_nonbp",
            Some(_) => "rob_head_lsu_incomplete_sm_rsp_unknown_nonbp",
        },
        Some(_) => "rob_head_lsu_incomplete_sm_other_nonbp",
    }
}
