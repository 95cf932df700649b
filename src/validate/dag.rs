//! Dependency graph over plan tasks and cycle detection.
//!
//! The validator only needs to know *which* tasks sit on a cycle, and it must
//! keep going after the first one so every cycle is reported in a single pass.
//! A three-color depth-first walk gives exactly that. The walk keeps its own
//! stack, so a long dependency chain cannot exhaust the thread's stack.

use std::collections::{HashMap, HashSet};

/// Index into the task list.
pub type TaskIndex = usize;

/// Directed graph where an edge `a -> b` means task `a` depends on task `b`.
#[derive(Debug)]
pub struct DependencyGraph<'a> {
    ids: Vec<&'a str>,
    dependencies: Vec<Vec<TaskIndex>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Visited,
}

impl<'a> DependencyGraph<'a> {
    /// Build a graph from `(id, depends_on)` pairs in declaration order.
    ///
    /// Duplicate ids keep their first occurrence. Dependencies that name an
    /// unknown task are dropped; referential errors are reported separately.
    pub fn new<I, D>(tasks: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, D)>,
        D: IntoIterator<Item = &'a str>,
    {
        let tasks: Vec<(&'a str, Vec<&'a str>)> = tasks
            .into_iter()
            .map(|(id, deps)| (id, deps.into_iter().collect()))
            .collect();

        let mut index_map: HashMap<&'a str, TaskIndex> = HashMap::new();
        let mut ids = Vec::new();
        let mut raw_deps = Vec::new();
        for (id, deps) in tasks {
            if index_map.contains_key(id) {
                continue;
            }
            index_map.insert(id, ids.len());
            ids.push(id);
            raw_deps.push(deps);
        }

        let dependencies = raw_deps
            .into_iter()
            .map(|deps| {
                deps.into_iter()
                    .filter_map(|dep| index_map.get(dep).copied())
                    .collect()
            })
            .collect();

        Self { ids, dependencies }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Ids of tasks found to close a cycle, each reported once, in walk order.
    pub fn cycle_nodes(&self) -> Vec<&'a str> {
        let mut marks = vec![Mark::Unvisited; self.ids.len()];
        let mut reported = HashSet::new();
        let mut found = Vec::new();

        for start in 0..self.ids.len() {
            self.visit(start, &mut marks, &mut reported, &mut found);
        }

        found
    }

    /// Iterative walk from `start`. Each stack frame holds a node and the
    /// position of the next dependency to follow.
    fn visit(
        &self,
        start: TaskIndex,
        marks: &mut [Mark],
        reported: &mut HashSet<TaskIndex>,
        found: &mut Vec<&'a str>,
    ) {
        if marks[start] != Mark::Unvisited {
            return;
        }
        marks[start] = Mark::Visiting;
        let mut stack: Vec<(TaskIndex, usize)> = vec![(start, 0)];

        while let Some(frame) = stack.last_mut() {
            let (node, next) = *frame;
            let Some(&dep) = self.dependencies[node].get(next) else {
                marks[node] = Mark::Visited;
                stack.pop();
                continue;
            };
            frame.1 += 1;

            match marks[dep] {
                Mark::Visited => {}
                Mark::Visiting => {
                    if reported.insert(dep) {
                        found.push(self.ids[dep]);
                    }
                }
                Mark::Unvisited => {
                    marks[dep] = Mark::Visiting;
                    stack.push((dep, 0));
                }
            }
        }
    }
}
