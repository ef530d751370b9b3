//! Host-side adaptive execution drivers
//!
//! Generated code hands control to these executors with function pointers to
//! the emitted drivers plus the in-code arrays they may rewrite. The
//! executors run an upper-confidence-bound bandit over candidate orderings,
//! rewriting the ordering state in place between steps, until the emitted
//! driver reports completion.
//!
//! Yield protocol: a driver consumes at most `budget` units and returns the
//! remaining budget on completion, or a negative sentinel when the budget ran
//! out (progress saved into the in-code state).

use std::os::raw::c_void;

use log::debug;

/// Budget handed to the emitted driver per bandit step.
const STEP_BUDGET: i32 = 10_000;

/// Exploration constant in the UCB score.
const UCB_C: f64 = std::f64::consts::SQRT_2;

/// Hard cap on enumerated orderings; beyond it arms are sampled.
const MAX_ARMS: usize = 720;

pub const YIELD_BUDGET_EXHAUSTED: i32 = -2;

/// UCB1 bandit: score = mean reward + c * sqrt(ln(total) / plays).
pub struct UcbChooser {
    plays: Vec<u64>,
    rewards: Vec<f64>,
    total: u64,
}

impl UcbChooser {
    pub fn new(arms: usize) -> Self {
        Self { plays: vec![0; arms], rewards: vec![0.0; arms], total: 0 }
    }

    /// Every arm is played once before any arm is exploited.
    pub fn choose(&self) -> usize {
        if let Some(unplayed) = self.plays.iter().position(|&p| p == 0) {
            return unplayed;
        }
        let ln_total = (self.total as f64).ln();
        let mut best = 0;
        let mut best_score = f64::MIN;
        for arm in 0..self.plays.len() {
            let plays = self.plays[arm] as f64;
            let score = self.rewards[arm] / plays + UCB_C * (ln_total / plays).sqrt();
            if score > best_score {
                best_score = score;
                best = arm;
            }
        }
        best
    }

    pub fn update(&mut self, arm: usize, reward: f64) {
        self.plays[arm] += 1;
        self.rewards[arm] += reward;
        self.total += 1;
    }
}

/// All permutations of `0..n` when that stays under the arm cap; otherwise a
/// deterministic xorshift sample of distinct orderings.
pub fn candidate_orderings(n: usize) -> Vec<Vec<i32>> {
    fn factorial(n: usize) -> usize {
        (1..=n).product::<usize>().max(1)
    }

    if factorial(n) <= MAX_ARMS {
        let mut out = Vec::new();
        let mut current: Vec<i32> = (0..n as i32).collect();
        permute(&mut current, 0, &mut out);
        return out;
    }

    let mut out = Vec::with_capacity(MAX_ARMS);
    let mut seen = hashbrown::HashSet::new();
    let mut state = 0x9e3779b97f4a7c15u64;
    while out.len() < MAX_ARMS {
        // Fisher-Yates with an xorshift generator keeps sampling reproducible.
        let mut perm: Vec<i32> = (0..n as i32).collect();
        for i in (1..n).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let j = (state % (i as u64 + 1)) as usize;
            perm.swap(i, j);
        }
        if seen.insert(perm.clone()) {
            out.push(perm);
        }
    }
    out
}

fn permute(current: &mut Vec<i32>, start: usize, out: &mut Vec<Vec<i32>>) {
    if start == current.len() {
        out.push(current.clone());
        return;
    }
    for i in start..current.len() {
        current.swap(start, i);
        permute(current, start + 1, out);
        current.swap(start, i);
    }
}

// ---- SkinnerScanSelect ----

type ScanBaseFn = unsafe extern "C" fn(i32, i32) -> i32;

/// Drives the emitted `base(budget, next_tuple)` scan over a single table
/// until every tuple is examined, permuting the predicate order between
/// steps.
///
/// In-code state rewritten per step:
///  - `predicate_fns[0..k]`: scan-suffix predicate functions in chosen order;
///  - `active_index[0..]` and `*active_index_size`: bucket positions of the
///    index-evaluable prefix;
///  - `*progress`: initialized by the emitted code to the cardinality and
///    updated by `base` to the last examined tuple on yield.
///
/// # Safety
/// Every pointer comes from the emitted program and stays valid for the call.
pub unsafe extern "C" fn veld_execute_permutable_scan_select(
    base_fn: *const c_void,
    num_predicates: i32,
    predicate_fns: *mut *const c_void,
    index_pred_positions: *const i32,
    num_index_preds: i32,
    active_index: *mut i32,
    active_index_size: *mut i32,
    progress: *mut i32,
) {
    let base: ScanBaseFn = std::mem::transmute(base_fn);
    let k = num_predicates as usize;
    let cardinality = *progress;
    if cardinality == 0 {
        return;
    }

    // Original function pointer per predicate id.
    let original: Vec<*const c_void> =
        (0..k).map(|i| *predicate_fns.add(i)).collect();
    let index_preds: Vec<i32> = (0..num_index_preds as usize)
        .map(|i| *index_pred_positions.add(i))
        .collect();

    let orderings = candidate_orderings(k.max(1));
    let mut chooser = UcbChooser::new(orderings.len());
    let mut next_tuple = 0i32;

    while next_tuple < cardinality {
        let arm = chooser.choose();
        let order = &orderings[arm];

        // The longest prefix of index-evaluable predicates runs through the
        // sorted-intersection path; the suffix runs as scan predicates.
        let mut prefix_len = 0usize;
        if k > 0 {
            while prefix_len < order.len() {
                let pred = order[prefix_len];
                match index_preds.iter().position(|&p| p == pred) {
                    Some(bucket_pos) => {
                        *active_index.add(prefix_len) = bucket_pos as i32;
                        prefix_len += 1;
                    }
                    None => break,
                }
            }
            *active_index_size = prefix_len as i32;
            for (slot, &pred) in order[prefix_len..].iter().enumerate() {
                *predicate_fns.add(slot) = original[pred as usize];
            }
        }

        let before = next_tuple;
        let remaining = base(STEP_BUDGET, next_tuple);
        let used;
        if remaining == YIELD_BUDGET_EXHAUSTED {
            next_tuple = *progress;
            used = STEP_BUDGET;
        } else {
            next_tuple = cardinality;
            used = STEP_BUDGET - remaining;
        }
        // Each examined tuple costs at least one budget unit, so the reward
        // stays in [0, 1].
        let reward = (next_tuple - before) as f64 / used.max(1) as f64;
        chooser.update(arm, reward);
        debug!(
            "scan-select step: arm={arm} order={order:?} progress={next_tuple}/{cardinality} reward={reward:.3}"
        );
    }
}

// ---- SkinnerJoin ----

type JoinBaseFn = unsafe extern "C" fn(i32) -> i32;
type CompileOrderFn = unsafe extern "C" fn(*mut c_void, *const i32, i32) -> *const c_void;

pub const JOIN_YIELD: i32 = -1;

struct JoinState<'a> {
    num_tables: usize,
    cardinalities: &'a [i32],
    idx_arr: *mut i32,
    /// Highest top-table tuple fully joined, per table.
    offsets: Vec<i32>,
    orderings: Vec<Vec<i32>>,
    chooser: UcbChooser,
    budget: i32,
}

impl<'a> JoinState<'a> {
    unsafe fn new(num_tables: usize, cardinalities: &'a [i32], idx_arr: *mut i32) -> Self {
        let orderings = candidate_orderings(num_tables);
        let chooser = UcbChooser::new(orderings.len());
        Self {
            num_tables,
            cardinalities,
            idx_arr,
            offsets: vec![0; num_tables],
            orderings,
            chooser,
            budget: STEP_BUDGET,
        }
    }

    fn done(&self) -> bool {
        (0..self.num_tables).any(|t| self.offsets[t] >= self.cardinalities[t])
    }

    /// Runs one bandit step through `step_fn` for the chosen ordering.
    /// Returns true when the join completed.
    unsafe fn step(&mut self, arm: usize, step_fn: JoinBaseFn) -> bool {
        let order = &self.orderings[arm];
        let top = order[0] as usize;

        // The driver walks the top table from its saved offset; deeper
        // tables restart and the tuple-index set dedupes repeats.
        *self.idx_arr.add(top) = self.offsets[top];
        let before = self.offsets[top];

        let ret = step_fn(self.budget);
        let completed = ret != JOIN_YIELD;
        if completed {
            self.offsets[top] = self.cardinalities[top];
        } else {
            self.offsets[top] = (*self.idx_arr.add(top)).max(self.offsets[top]);
        }

        let progress = (self.offsets[top] - before) as f64
            / (self.cardinalities[top].max(1)) as f64;
        let reward = if completed { 1.0 } else { progress };
        self.chooser.update(arm, reward);

        // A step that moved nothing had its whole budget eaten by one top
        // tuple's subtree; grow the budget so the join cannot livelock.
        if !completed && self.offsets[top] == before {
            self.budget = self.budget.saturating_mul(2);
        }
        debug!(
            "join step: order={order:?} top={top} offset={}/{} budget={} reward={reward:.3}",
            self.offsets[top], self.cardinalities[top], self.budget
        );
        completed
    }
}

/// Drives the emitted permutable join until any ordering drains its top
/// table.
///
/// In-code state rewritten per step:
///  - `handler_positions[j]` = handler of the table at position `j`, with the
///    valid-tuple handler at position `num_tables`;
///  - `table_positions[t]` = position of table `t` in the current order;
///  - `flag_arr[t * num_preds + p]` = 1 when predicate `p` is evaluated as
///    table `t` binds (i.e. `t` is the latest-bound table `p` touches);
///  - `idx_arr[t]`: resume tuple per table.
///
/// # Safety
/// Every pointer comes from the emitted program and stays valid for the call.
pub unsafe extern "C" fn veld_execute_permutable_join(
    num_tables: i32,
    num_preds: i32,
    join_fn: *const c_void,
    table_handlers: *const *const c_void,
    valid_tuple_handler: *const c_void,
    handler_positions: *mut *const c_void,
    table_positions: *mut i32,
    flag_arr: *mut i8,
    tables_per_pred: *const i64,
    cardinalities: *const i32,
    idx_arr: *mut i32,
) {
    let n = num_tables as usize;
    let base: JoinBaseFn = std::mem::transmute(join_fn);
    let cards = std::slice::from_raw_parts(cardinalities, n);
    let mut state = JoinState::new(n, cards, idx_arr);

    while !state.done() {
        let arm = state.chooser.choose();
        write_join_order(
            &state.orderings[arm],
            num_preds as usize,
            table_handlers,
            valid_tuple_handler,
            handler_positions,
            table_positions,
            flag_arr,
            tables_per_pred,
        );
        if state.step(arm, base) {
            break;
        }
    }
}

unsafe fn write_join_order(
    order: &[i32],
    num_preds: usize,
    table_handlers: *const *const c_void,
    valid_tuple_handler: *const c_void,
    handler_positions: *mut *const c_void,
    table_positions: *mut i32,
    flag_arr: *mut i8,
    tables_per_pred: *const i64,
) {
    let n = order.len();
    for (pos, &table) in order.iter().enumerate() {
        *handler_positions.add(pos) = *table_handlers.add(table as usize);
        *table_positions.add(table as usize) = pos as i32;
    }
    *handler_positions.add(n) = valid_tuple_handler;

    // Predicate p fires once the latest table it touches is bound.
    std::ptr::write_bytes(flag_arr, 0, n * num_preds);
    for p in 0..num_preds {
        let mask = *tables_per_pred.add(p);
        let mut latest = None;
        for (pos, &table) in order.iter().enumerate() {
            if mask & (1 << table) != 0 {
                match latest {
                    Some((lp, _)) if lp >= pos => {}
                    _ => latest = Some((pos, table)),
                }
            }
        }
        if let Some((_, table)) = latest {
            *flag_arr.add(table as usize * num_preds + p) = 1;
        }
    }
}

/// Drives the recompiling join: each chosen ordering is compiled (or fetched
/// from the translator's cache) through `compile_fn` before the step runs.
/// A null function pointer from a synchronous compile is fatal.
///
/// # Safety
/// As for the permutable driver; `compile_ctx` must outlive the call.
pub unsafe extern "C" fn veld_execute_recompiling_join(
    num_tables: i32,
    cardinalities: *const i32,
    idx_arr: *mut i32,
    compile_ctx: *mut c_void,
    compile_fn: *const c_void,
) {
    let n = num_tables as usize;
    let compile: CompileOrderFn = std::mem::transmute(compile_fn);
    let cards = std::slice::from_raw_parts(cardinalities, n);
    let mut state = JoinState::new(n, cards, idx_arr);

    while !state.done() {
        let arm = state.chooser.choose();
        let order = &state.orderings[arm];
        let code = compile(compile_ctx, order.as_ptr(), order.len() as i32);
        assert!(
            !code.is_null(),
            "recompiling skinner join: no code for ordering {order:?}"
        );
        let step_fn: JoinBaseFn = std::mem::transmute(code);
        if state.step(arm, step_fn) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn test_chooser_plays_every_arm_first() {
        let mut chooser = UcbChooser::new(4);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..4 {
            let arm = chooser.choose();
            seen.insert(arm);
            chooser.update(arm, 0.5);
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn test_chooser_prefers_rewarding_arm() {
        let mut chooser = UcbChooser::new(2);
        for _ in 0..2 {
            let arm = chooser.choose();
            chooser.update(arm, if arm == 1 { 1.0 } else { 0.01 });
        }
        let mut wins = [0; 2];
        for _ in 0..100 {
            let arm = chooser.choose();
            wins[arm] += 1;
            chooser.update(arm, if arm == 1 { 1.0 } else { 0.01 });
        }
        assert!(wins[1] > wins[0]);
    }

    #[test]
    fn test_candidate_orderings_complete_for_small_n() {
        let perms = candidate_orderings(3);
        assert_eq!(perms.len(), 6);
        let unique: std::collections::HashSet<_> = perms.iter().collect();
        assert_eq!(unique.len(), 6);
    }

    #[test]
    fn test_candidate_orderings_capped_for_large_n() {
        let perms = candidate_orderings(8);
        assert_eq!(perms.len(), MAX_ARMS);
        let unique: std::collections::HashSet<_> = perms.iter().collect();
        assert_eq!(unique.len(), MAX_ARMS);
    }

    // A fake scan driver over 25_000 tuples: consumes one budget unit per
    // tuple and exhausts mid-way like the emitted code would, recording its
    // progress through the same global the executor reads.
    const FAKE_CARD: i32 = 25_000;
    static FAKE_PROGRESS: AtomicI32 = AtomicI32::new(0);
    static FAKE_STEPS: AtomicI32 = AtomicI32::new(0);

    unsafe extern "C" fn fake_base(budget: i32, next_tuple: i32) -> i32 {
        FAKE_STEPS.fetch_add(1, Ordering::SeqCst);
        let remaining_tuples = FAKE_CARD - next_tuple;
        if budget < remaining_tuples {
            FAKE_PROGRESS.store(next_tuple + budget, Ordering::SeqCst);
            YIELD_BUDGET_EXHAUSTED
        } else {
            FAKE_PROGRESS.store(FAKE_CARD, Ordering::SeqCst);
            budget - remaining_tuples
        }
    }

    #[test]
    fn test_scan_select_driver_reaches_cardinality() {
        unsafe {
            // Mirror the generated-code contract: the progress global holds
            // the cardinality before the executor runs.
            FAKE_PROGRESS.store(FAKE_CARD, Ordering::SeqCst);
            FAKE_STEPS.store(0, Ordering::SeqCst);
            let mut fns: [*const c_void; 2] = [std::ptr::null(), std::ptr::null()];
            let index_preds: [i32; 0] = [];
            let mut active: [i32; 2] = [0, 0];
            let mut active_size = 0i32;

            veld_execute_permutable_scan_select(
                fake_base as *const c_void,
                2,
                fns.as_mut_ptr(),
                index_preds.as_ptr(),
                0,
                active.as_mut_ptr(),
                &mut active_size,
                FAKE_PROGRESS.as_ptr(),
            );
            assert_eq!(FAKE_PROGRESS.load(Ordering::SeqCst), FAKE_CARD);
            // 25k tuples at 10k budget per step needs three steps.
            assert_eq!(FAKE_STEPS.load(Ordering::SeqCst), 3);
        }
    }
}
