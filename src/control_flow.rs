use serde::Serialize;

use crate::log_parser::Facts;

const OPCODE_BRANCH: u32 = 0x63;
const OPCODE_JAL: u32 = 0x6f;
const OPCODE_JALR: u32 = 0x67;

// link registers: ra (x1) and t0 (x5)
const LINK_REGS: [u32; 2] = [1, 5];

/// One retired instruction from a `[commit]` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CommitRecord {
    pub cycle: u64,
    pub slot: u64,
    pub pc: u32,
    pub inst: u32,
}

impl CommitRecord {
    /// `None` when the line lacks any of `cycle`, `slot`, `pc`, `inst`.
    pub fn from_facts(facts: &Facts<'_>) -> Option<Self> {
        Some(CommitRecord {
            cycle: facts.num("cycle")?,
            slot: facts.num("slot")?,
            pc: facts.num("pc")? as u32,
            inst: facts.num("inst")? as u32,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstClass {
    CondBranch,
    Jal,
    Jalr,
    Other,
}

impl InstClass {
    pub fn decode(inst: u32) -> Self {
        match inst & 0x7f {
            OPCODE_BRANCH => InstClass::CondBranch,
            OPCODE_JAL => InstClass::Jal,
            OPCODE_JALR => InstClass::Jalr,
            _ => InstClass::Other,
        }
    }
}

fn rd(inst: u32) -> u32 {
    (inst >> 7) & 0x1f
}

fn rs1(inst: u32) -> u32 {
    (inst >> 15) & 0x1f
}

pub fn is_call(inst: u32) -> bool {
    matches!(InstClass::decode(inst), InstClass::Jal | InstClass::Jalr) && LINK_REGS.contains(&rd(inst))
}

pub fn is_ret(inst: u32) -> bool {
    InstClass::decode(inst) == InstClass::Jalr
        && rd(inst) == 0
        && LINK_REGS.contains(&rs1(inst))
        && (inst >> 20) == 0
}

pub fn is_indirect_jump(inst: u32) -> bool {
    InstClass::decode(inst) == InstClass::Jalr && !is_call(inst) && !is_ret(inst)
}

fn per_kinst(count: u64, commits: u64) -> f64 {
    if commits == 0 {
        0.0
    } else {
        1000.0 * count as f64 / commits as f64
    }
}

/// Control-transfer counts and the static not-taken misprediction proxy.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ControlSummary {
    pub branch_count: u64,
    pub jal_count: u64,
    pub jalr_count: u64,
    pub branch_taken_count: u64,
    pub call_count: u64,
    pub ret_count: u64,
    pub control_count: u64,
    pub control_ratio: f64,
    pub est_misp_count: u64,
    pub est_misp_per_kinst: f64,
}

impl ControlSummary {
    /// Recomputes the derived figures from raw counts.
    pub fn finish(mut self, commits: u64) -> Self {
        self.control_count = self.branch_count + self.jal_count + self.jalr_count;
        self.control_ratio = if commits == 0 {
            0.0
        } else {
            self.control_count as f64 / commits as f64
        };
        self.est_misp_count = self.branch_taken_count + self.jal_count + self.jalr_count;
        self.est_misp_per_kinst = per_kinst(self.est_misp_count, commits);
        self
    }

    /// Counts from a `[controlm]` line; ratios use `commits`.
    pub fn from_facts(facts: &Facts<'_>, commits: u64) -> Self {
        ControlSummary {
            branch_count: facts.num_or("branch_count", 0),
            jal_count: facts.num_or("jal_count", 0),
            jalr_count: facts.num_or("jalr_count", 0),
            branch_taken_count: facts.num_or("branch_taken_count", 0),
            call_count: facts.num_or("call_count", 0),
            ret_count: facts.num_or("ret_count", 0),
            ..ControlSummary::default()
        }
        .finish(commits)
    }
}

/// Walks adjacent pairs of the cycle-sorted commit stream. The last
/// instruction has no successor and is not classified.
pub fn reconstruct(commits: &mut [CommitRecord]) -> ControlSummary {
    commits.sort_unstable();
    let mut summary = ControlSummary::default();
    for pair in commits.windows(2) {
        let (cur, next) = (pair[0], pair[1]);
        match InstClass::decode(cur.inst) {
            InstClass::CondBranch => {
                summary.branch_count += 1;
                if next.pc != cur.pc.wrapping_add(4) {
                    summary.branch_taken_count += 1;
                }
            }
            InstClass::Jal => summary.jal_count += 1,
            InstClass::Jalr => summary.jalr_count += 1,
            InstClass::Other => {}
        }
        if is_call(cur.inst) {
            summary.call_count += 1;
        }
        if is_ret(cur.inst) {
            summary.ret_count += 1;
        }
    }
    summary.finish(commits.len() as u64)
}

/// Per-class retirement counts used to rebuild predictor totals when no
/// `[pred]` counters are available.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BranchClassCounts {
    pub cond: u64,
    pub jump: u64,
    pub jump_direct: u64,
    pub jump_indirect: u64,
    pub ret: u64,
    pub call: u64,
}

impl BranchClassCounts {
    pub fn record(&mut self, inst: u32) {
        match InstClass::decode(inst) {
            InstClass::CondBranch => self.cond += 1,
            InstClass::Jal | InstClass::Jalr if is_ret(inst) => self.ret += 1,
            InstClass::Jal | InstClass::Jalr => {
                self.jump += 1;
                if is_indirect_jump(inst) {
                    self.jump_indirect += 1;
                } else {
                    self.jump_direct += 1;
                }
            }
            InstClass::Other => {}
        }
        if is_call(inst) {
            self.call += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // beq x0, x0, 8
    const BEQ: u32 = 0x0000_0463;
    // jal ra, 16
    const JAL_RA: u32 = 0x0100_00ef;
    // jal x0, 16
    const J: u32 = 0x0100_006f;
    // jalr x0, 0(ra)
    const RET: u32 = 0x0000_8067;
    // jalr x0, 0(a5)
    const JR_A5: u32 = 0x0007_8067;
    // addi x0, x0, 0
    const NOP: u32 = 0x0000_0013;

    fn commit(cycle: u64, slot: u64, pc: u32, inst: u32) -> CommitRecord {
        CommitRecord { cycle, slot, pc, inst }
    }

    #[test]
    fn call_return_and_indirect_are_disjoint() {
        assert!(is_call(JAL_RA));
        assert!(!is_call(J));
        assert!(is_ret(RET));
        assert!(!is_call(RET));
        assert!(is_indirect_jump(JR_A5));
        assert!(!is_indirect_jump(RET));
        assert!(!is_indirect_jump(JAL_RA));
    }

    #[test]
    fn taken_branch_detected_from_next_pc() {
        let mut commits = vec![
            commit(3, 0, 0x8000_0010, BEQ),
            commit(4, 0, 0x8000_0018, NOP),
            commit(1, 0, 0x8000_0000, BEQ),
            commit(1, 1, 0x8000_0004, JAL_RA),
            commit(2, 0, 0x8000_0014, RET),
        ];
        let control = reconstruct(&mut commits);
        assert_eq!(commits[0].pc, 0x8000_0000);
        assert_eq!(control.branch_count, 2);
        // 0x0 -> 0x4 falls through, 0x10 -> 0x18 is taken
        assert_eq!(control.branch_taken_count, 1);
        assert_eq!(control.jal_count, 1);
        assert_eq!(control.jalr_count, 1);
        assert_eq!(control.call_count, 1);
        assert_eq!(control.ret_count, 1);
        assert_eq!(control.control_count, 4);
        assert_eq!(control.est_misp_count, 3);
        assert!((control.control_ratio - 0.8).abs() < 1e-9);
        assert!((control.est_misp_per_kinst - 600.0).abs() < 1e-9);
    }

    #[test]
    fn last_commit_is_not_classified() {
        let mut commits = vec![commit(1, 0, 0x100, NOP), commit(2, 0, 0x104, BEQ)];
        assert_eq!(reconstruct(&mut commits).branch_count, 0);
        assert_eq!(reconstruct(&mut []), ControlSummary::default());
    }

    #[test]
    fn summary_counts_recompute_ratios() {
        let facts = Facts::tokenize(
            " branch_count=30 jal_count=10 jalr_count=5 branch_taken_count=18 call_count=7 ret_count=6",
        );
        let control = ControlSummary::from_facts(&facts, 500);
        assert_eq!(control.control_count, 45);
        assert_eq!(control.est_misp_count, 33);
        assert!((control.est_misp_per_kinst - 66.0).abs() < 1e-9);
    }

    #[test]
    fn class_counts_split_jumps() {
        let mut counts = BranchClassCounts::default();
        for inst in [BEQ, JAL_RA, J, RET, JR_A5, NOP] {
            counts.record(inst);
        }
        assert_eq!(
            counts,
            BranchClassCounts {
                cond: 1,
                jump: 3,
                jump_direct: 2,
                jump_indirect: 1,
                ret: 1,
                call: 1,
            }
        );
    }
}
