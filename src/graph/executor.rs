//! Ways to run a [`Graph`](super::Graph), grounded on
//! `dispenso/graph_executor.h` + `dispenso/detail/graph_executor_impl.h`
//! (`SingleThreadExecutor`, `ConcurrentTaskSetExecutor`, `ParallelForExecutor`,
//! `ForwardPropagator`).
//!
//! Every executor shares the same counting rule: a node is ready once its
//! incomplete-predecessor count reaches zero. They differ only in how they
//! discover and dispatch the ready set.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam::queue::SegQueue;

use super::{Graph, NodeId};
use crate::pool::{ConcurrentTaskSet, ThreadPool};

/// Runs a graph level-by-level on the calling thread. Not safe to call
/// concurrently with another run of the same graph.
#[derive(Default)]
pub struct SingleThreadExecutor {
    current: Vec<usize>,
    next: Vec<usize>,
}

impl SingleThreadExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run(&mut self, graph: &Graph) {
        self.current.clear();
        self.current.extend(graph.ready_node_ids());

        let mut level = 0;
        while !self.current.is_empty() {
            log::trace!(
                "taskloom graph: single-thread executor running level {level} ({} node(s))",
                self.current.len()
            );
            self.next.clear();
            for &idx in &self.current {
                graph.run_node(idx);
                for d in graph.dependents_of(idx) {
                    if graph.dec_incomplete(d, Ordering::AcqRel) {
                        self.next.push(d);
                    }
                }
            }
            std::mem::swap(&mut self.current, &mut self.next);
            level += 1;
        }
    }
}

/// Runs a graph level-by-level, fanning each level out across a
/// [`ThreadPool`] via `parallel_for`.
pub struct ParallelForExecutor {
    chunk_size: usize,
}

impl ParallelForExecutor {
    /// `chunk_size` is the granularity `parallel_for` splits each level
    /// into; see [`ThreadPool::parallel_for`].
    pub fn new(chunk_size: usize) -> Self {
        ParallelForExecutor {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn run(&self, pool: &ThreadPool, graph: &Arc<Graph>) {
        let mut current_level = graph.ready_node_ids();
        let mut level = 0;

        while !current_level.is_empty() {
            log::trace!(
                "taskloom graph: parallel-for executor running level {level} ({} node(s))",
                current_level.len()
            );
            level += 1;
            let level_arc = Arc::new(std::mem::take(&mut current_level));
            let next = Arc::new(SegQueue::new());

            let level_for_body = Arc::clone(&level_arc);
            let next_for_body = Arc::clone(&next);
            let graph_for_body = Arc::clone(graph);

            pool.parallel_for(level_arc.len(), self.chunk_size, move |range| {
                for i in range {
                    let idx = level_for_body[i];
                    graph_for_body.run_node(idx);
                    for d in graph_for_body.dependents_of(idx) {
                        if graph_for_body.dec_incomplete(d, Ordering::AcqRel) {
                            next_for_body.push(d);
                        }
                    }
                }
            });

            while let Some(idx) = next.pop() {
                current_level.push(idx);
            }
        }
    }
}

/// Runs a graph by seeding ready nodes into a [`ConcurrentTaskSet`] and
/// having each completing node schedule whichever of its dependents just
/// became ready, recursively — no level barrier, so independent chains
/// race ahead of slower ones.
pub struct ConcurrentTaskSetExecutor;

impl ConcurrentTaskSetExecutor {
    pub fn new() -> Self {
        ConcurrentTaskSetExecutor
    }

    /// Schedules the graph onto `tasks` and, if `wait` is true, blocks
    /// until every reachable node has run.
    pub fn run(&self, tasks: &ConcurrentTaskSet, graph: &Arc<Graph>, wait: bool) {
        let seeds = graph.ready_node_ids();
        log::trace!(
            "taskloom graph: concurrent task-set executor seeding {} ready node(s)",
            seeds.len()
        );
        for idx in seeds {
            Self::schedule_node(tasks, graph, idx);
        }
        if wait {
            tasks.wait();
        }
    }

    fn schedule_node(tasks: &ConcurrentTaskSet, graph: &Arc<Graph>, idx: usize) {
        let tasks_for_continuation = tasks.clone();
        let graph_for_continuation = Arc::clone(graph);
        tasks.schedule(move || {
            graph_for_continuation.run_node(idx);
            for d in graph_for_continuation.dependents_of(idx) {
                if graph_for_continuation.dec_incomplete(d, Ordering::AcqRel) {
                    Self::schedule_node(&tasks_for_continuation, &graph_for_continuation, d);
                }
            }
        });
    }
}

impl Default for ConcurrentTaskSetExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Propagates an "incomplete" state forward from a set of seed nodes: the
/// seeds themselves, every node sharing a bidirectional-propagation group
/// with a seed, and every node transitively reachable via dependency
/// edges from any of those, so that a subsequent executor run re-executes
/// exactly the stale subset.
#[derive(Default)]
pub struct ForwardPropagator {
    visited: HashSet<usize>,
    groups_seen: HashSet<usize>,
    queue: VecDeque<usize>,
}

impl ForwardPropagator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn propagate(&mut self, graph: &Graph, seeds: &[NodeId]) {
        self.visited.clear();
        self.groups_seen.clear();
        self.queue.clear();

        for &NodeId(idx) in seeds {
            self.seed(graph, idx);
        }

        while let Some(idx) = self.queue.pop_front() {
            for d in graph.dependents_of(idx) {
                let was_completed = graph.is_completed(d);
                graph.add_incomplete_predecessor(d);
                if was_completed {
                    self.seed(graph, d);
                }
            }
        }
    }

    /// Marks `idx` incomplete (ready to re-run with no new blocking
    /// predecessor of its own) and expands to the rest of its
    /// bidirectional-propagation group, if any, the first time that group
    /// is encountered this call.
    fn seed(&mut self, graph: &Graph, idx: usize) {
        if graph.node_removed(idx) || !self.visited.insert(idx) {
            return;
        }
        graph.mark_seed_incomplete(idx);
        self.queue.push_back(idx);

        let root = graph.group_root(idx);
        if self.groups_seen.insert(root) {
            for member in graph.group_members(root) {
                if self.visited.insert(member) {
                    graph.mark_seed_incomplete(member);
                    self.queue.push_back(member);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priority::ThreadPriority;
    use std::sync::Mutex;

    fn diamond(log: Arc<Mutex<Vec<&'static str>>>) -> Graph {
        let mut g = Graph::new();
        let log_a = Arc::clone(&log);
        let a = g.add_node(0, move || log_a.lock().unwrap().push("A"));
        let log_b = Arc::clone(&log);
        let b = g.add_node(0, move || log_b.lock().unwrap().push("B"));
        let log_c = Arc::clone(&log);
        let c = g.add_node(0, move || log_c.lock().unwrap().push("C"));
        let log_d = Arc::clone(&log);
        let d = g.add_node(0, move || log_d.lock().unwrap().push("D"));
        g.add_dependency(b, a);
        g.add_dependency(c, a);
        g.add_dependency(d, b);
        g.add_dependency(d, c);
        g
    }

    fn assert_diamond_order(log: &[&'static str]) {
        assert_eq!(log.len(), 4);
        assert_eq!(log[0], "A");
        assert_eq!(log[3], "D");
        let middle: HashSet<_> = log[1..3].iter().copied().collect();
        assert_eq!(middle, HashSet::from(["B", "C"]));
    }

    #[test]
    fn single_thread_executor_respects_diamond_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let g = diamond(Arc::clone(&log));
        SingleThreadExecutor::new().run(&g);
        assert_diamond_order(&log.lock().unwrap());
    }

    #[test]
    fn parallel_for_executor_respects_diamond_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let g = Arc::new(diamond(Arc::clone(&log)));
        let pool = ThreadPool::new(4, ThreadPriority::Normal);
        ParallelForExecutor::new(1).run(&pool, &g);
        assert_diamond_order(&log.lock().unwrap());
    }

    #[test]
    fn concurrent_task_set_executor_respects_diamond_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let g = Arc::new(diamond(Arc::clone(&log)));
        let pool = ThreadPool::new(4, ThreadPriority::Normal);
        let tasks = ConcurrentTaskSet::new(&pool);
        ConcurrentTaskSetExecutor::new().run(&tasks, &g, true);
        assert_diamond_order(&log.lock().unwrap());
    }

    #[test]
    fn forward_propagator_marks_group_and_downstream_incomplete() {
        let mut g = Graph::new();
        let a = g.add_node(0, || {});
        let b = g.add_node(0, || {});
        let c = g.add_node(0, || {});
        g.add_biprop_dependency(b, a);
        g.add_dependency(c, b);

        SingleThreadExecutor::new().run(&g);
        assert!(g.is_completed(a.0));
        assert!(g.is_completed(b.0));
        assert!(g.is_completed(c.0));

        ForwardPropagator::new().propagate(&g, &[a]);
        // `a`'s bi-prop sibling `b` is invalidated even though the edit
        // only names `a`, and `c` (downstream of `b`) is marked with one
        // incomplete predecessor rather than "completed".
        assert!(!g.is_completed(a.0));
        assert!(!g.is_completed(b.0));
        assert!(!g.is_completed(c.0));

        SingleThreadExecutor::new().run(&g);
        assert!(g.is_completed(c.0));
    }
}
