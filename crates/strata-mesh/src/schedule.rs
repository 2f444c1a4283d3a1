//! StratumScheduler: the per-epoch sequence of conflict-free block sets.
//!
//! Stratum `k` of the cyclic plan pairs row block `i` with column block
//! `(i + k) mod d`. Rows within a stratum are distinct by construction and
//! columns are distinct because `i -> (i + k) mod d` is a bijection. Over
//! `k = 0..d` every `(i, j)` appears exactly once, so the d strata tile the
//! grid (a cyclic Latin square).
//!
//! The randomized orders only permute or relabel a Latin square, so every
//! epoch still tiles the grid.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use strata_matrix::{BlockGrid, BlockId};

use crate::error::MeshError;

/// How the strata of an epoch are ordered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StratumOrder {
    /// The cyclic plan, every epoch.
    #[default]
    Fixed,
    /// A fresh random permutation of the cyclic strata each epoch.
    Random,
    /// Random stratum order plus a random relabelling of column blocks.
    RandomLatin,
    /// Column blocks are dealt into groups of `tasks_per_worker`. For runs of
    /// `tasks_per_worker` consecutive strata each worker keeps one group, so
    /// its H blocks only move between its own tasks. Both the group schedule
    /// and the schedule inside each group are shuffled Latin squares.
    CoWor,
}

/// d blocks with pairwise distinct rows and pairwise distinct columns.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stratum {
    /// `blocks[i]` is the block in row `i`.
    blocks: Vec<BlockId>,
}

impl Stratum {
    /// Stratum from a column assignment: row `i` gets column `cols[i]`.
    fn from_cols(cols: impl IntoIterator<Item = usize>) -> Self {
        let blocks = cols.into_iter().enumerate().map(|(i, j)| BlockId::new(i, j)).collect();
        Self { blocks }
    }

    pub fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Column block paired with `row`.
    pub fn col_of(&self, row: usize) -> usize {
        self.blocks[row].col
    }

    /// Rows and columns are each a permutation of `0..d`.
    pub fn is_valid(&self, d: usize) -> bool {
        if self.blocks.len() != d {
            return false;
        }
        let mut rows = vec![false; d];
        let mut cols = vec![false; d];
        for b in &self.blocks {
            if b.row >= d || b.col >= d || rows[b.row] || cols[b.col] {
                return false;
            }
            rows[b.row] = true;
            cols[b.col] = true;
        }
        true
    }
}

/// The cyclic decomposition of a d x d grid into d strata.
pub fn cyclic_plan(d: usize) -> Vec<Stratum> {
    (0..d).map(|k| Stratum::from_cols((0..d).map(|i| (i + k) % d))).collect()
}

/// The cyclic Latin square of size `n` with its rows and columns shuffled.
/// `square[s][i]` is the column of row `i` in stratum `s`.
fn shuffled_latin(n: usize, rng: &mut Xoshiro256PlusPlus) -> Vec<Vec<usize>> {
    let mut rows: Vec<usize> = (0..n).collect();
    rows.shuffle(rng);
    let mut cols: Vec<usize> = (0..n).collect();
    cols.shuffle(rng);
    rows.iter().map(|&s| cols.iter().map(|&i| (s + i) % n).collect()).collect()
}

/// Produces the stratum sequence for each epoch.
pub struct StratumScheduler {
    d: usize,
    workers: usize,
    tasks_per_worker: usize,
    order: StratumOrder,
    plan: Vec<Stratum>,
    rng: Xoshiro256PlusPlus,
}

impl StratumScheduler {
    /// Scheduler for a d x d grid with one task per worker.
    pub fn new(d: usize, order: StratumOrder, seed: u64) -> Result<Self, MeshError> {
        Self::with_layout(d, 1, order, seed)
    }

    /// Scheduler for `workers` workers running `tasks_per_worker` tasks each.
    pub fn with_layout(
        workers: usize,
        tasks_per_worker: usize,
        order: StratumOrder,
        seed: u64,
    ) -> Result<Self, MeshError> {
        let d = workers * tasks_per_worker;
        if d == 0 {
            return Err(MeshError::Config("stratum scheduler needs d >= 1".into()));
        }
        Ok(Self {
            d,
            workers,
            tasks_per_worker,
            order,
            plan: cyclic_plan(d),
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
        })
    }

    pub fn d(&self) -> usize {
        self.d
    }

    pub fn order(&self) -> StratumOrder {
        self.order
    }

    /// The static cyclic plan.
    pub fn plan(&self) -> &[Stratum] {
        &self.plan
    }

    /// Strata for the next epoch, in processing order.
    pub fn epoch_plan(&mut self) -> Vec<Stratum> {
        match self.order {
            StratumOrder::Fixed => self.plan.clone(),
            StratumOrder::Random => {
                let mut plan = self.plan.clone();
                plan.shuffle(&mut self.rng);
                plan
            }
            StratumOrder::RandomLatin => {
                let mut relabel: Vec<usize> = (0..self.d).collect();
                relabel.shuffle(&mut self.rng);
                let mut plan: Vec<Stratum> = self
                    .plan
                    .iter()
                    .map(|s| Stratum::from_cols(s.blocks.iter().map(|b| relabel[b.col])))
                    .collect();
                plan.shuffle(&mut self.rng);
                plan
            }
            StratumOrder::CoWor => self.grouped_plan(),
        }
    }

    fn grouped_plan(&mut self) -> Vec<Stratum> {
        let (w, t) = (self.workers, self.tasks_per_worker);
        let mut groups: Vec<usize> = (0..self.d).collect();
        groups.shuffle(&mut self.rng);
        let outer = shuffled_latin(w, &mut self.rng);
        let mut cols = vec![vec![0; self.d]; self.d];
        for (bi, outer_row) in outer.iter().enumerate() {
            for (bj, &group) in outer_row.iter().enumerate() {
                let inner = shuffled_latin(t, &mut self.rng);
                for (ti, inner_row) in inner.iter().enumerate() {
                    for (tj, &local) in inner_row.iter().enumerate() {
                        cols[bi * t + ti][bj * t + tj] = groups[group * t + local];
                    }
                }
            }
        }
        cols.into_iter().map(Stratum::from_cols).collect()
    }
}

/// Blocks handed to one task of one worker within a stratum.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskAssignment {
    pub worker: usize,
    pub task: usize,
    pub blocks: Vec<BlockId>,
}

/// Split a stratum's blocks over worker tasks.
///
/// Blocks are grouped by owning worker; a worker's `n` blocks are cut into
/// `tasks_per_worker` contiguous runs, the first `n % t` runs one longer, so
/// no task receives more than `ceil(n / t)` blocks. Empty tasks are omitted.
pub fn assign_tasks(stratum: &Stratum, grid: &BlockGrid) -> Vec<TaskAssignment> {
    let mut per_worker: Vec<Vec<BlockId>> = vec![Vec::new(); grid.workers()];
    for &b in stratum.blocks() {
        per_worker[grid.owner(b.row)].push(b);
    }
    let tasks = grid.tasks_per_worker();
    let mut out = Vec::with_capacity(stratum.len());
    for (worker, blocks) in per_worker.into_iter().enumerate() {
        let (base, extra) = (blocks.len() / tasks, blocks.len() % tasks);
        let mut rest = blocks.as_slice();
        for task in 0..tasks {
            let take = base + usize::from(task < extra);
            if take == 0 {
                continue;
            }
            let (mine, tail) = rest.split_at(take);
            rest = tail;
            out.push(TaskAssignment { worker, task, blocks: mine.to_vec() });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cyclic_plan_for_three() {
        let plan = cyclic_plan(3);
        let cols: Vec<Vec<usize>> = plan
            .iter()
            .map(|s| s.blocks().iter().map(|b| b.col).collect())
            .collect();
        assert_eq!(cols, vec![vec![0, 1, 2], vec![1, 2, 0], vec![2, 0, 1]]);
    }

    #[test]
    fn zero_dimension_rejected() {
        assert!(matches!(
            StratumScheduler::new(0, StratumOrder::Fixed, 0),
            Err(MeshError::Config(_))
        ));
    }

    #[test]
    fn fixed_order_repeats() {
        let mut s = StratumScheduler::new(4, StratumOrder::Fixed, 1).unwrap();
        assert_eq!(s.epoch_plan(), s.epoch_plan());
        assert_eq!(s.epoch_plan(), cyclic_plan(4));
    }

    #[test]
    fn random_order_is_a_permutation_of_the_plan() {
        let mut s = StratumScheduler::new(6, StratumOrder::Random, 3).unwrap();
        let mut plan = s.epoch_plan();
        plan.sort_by_key(|st| st.col_of(0));
        assert_eq!(plan, cyclic_plan(6));
    }

    #[test]
    fn same_seed_same_sequence() {
        let mut a = StratumScheduler::new(5, StratumOrder::RandomLatin, 9).unwrap();
        let mut b = StratumScheduler::new(5, StratumOrder::RandomLatin, 9).unwrap();
        for _ in 0..3 {
            assert_eq!(a.epoch_plan(), b.epoch_plan());
        }
    }

    #[test]
    fn grouped_order_keeps_h_groups_on_one_worker() {
        let (workers, t) = (3, 2);
        let mut s = StratumScheduler::with_layout(workers, t, StratumOrder::CoWor, 4).unwrap();
        let plan = s.epoch_plan();
        assert_eq!(plan.len(), 6);
        for run in plan.chunks(t) {
            for p in 0..workers {
                let mut first: Vec<usize> = (p * t..(p + 1) * t).map(|i| run[0].col_of(i)).collect();
                first.sort();
                for stratum in run {
                    let mut cols: Vec<usize> = (p * t..(p + 1) * t).map(|i| stratum.col_of(i)).collect();
                    cols.sort();
                    assert_eq!(cols, first);
                }
            }
        }
    }

    #[test]
    fn one_block_per_task_when_grid_matches() {
        let grid = BlockGrid::new(12, 12, 2, 3).unwrap();
        let plan = cyclic_plan(grid.d());
        let tasks = assign_tasks(&plan[1], &grid);
        assert_eq!(tasks.len(), 6);
        for t in &tasks {
            assert_eq!(t.blocks.len(), 1);
            assert_eq!(grid.owner(t.blocks[0].row), t.worker);
        }
    }

    #[test]
    fn uneven_groups_split_evenly() {
        // single worker: every block lands on worker 0
        let grid = BlockGrid::new(8, 8, 1, 2).unwrap();
        let stratum = Stratum::from_cols([1, 0]);
        let tasks = assign_tasks(&stratum, &grid);
        assert_eq!(tasks.iter().map(|t| t.blocks.len()).collect::<Vec<_>>(), vec![1, 1]);

        let grid = BlockGrid::new(10, 10, 1, 3).unwrap();
        let stratum = Stratum { blocks: (0..5).map(|i| BlockId::new(i % 3, i)).collect() };
        let sizes: Vec<usize> = assign_tasks(&stratum, &grid).iter().map(|t| t.blocks.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }
}
