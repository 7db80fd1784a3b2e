pub mod task;

pub use task::{ArgValue, RawTask, Task, TaskError, TaskId, TaskStatus, TemplatePart};

use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("plan has no tasks")]
    EmptyPlan,
    #[error("task id {0} appears more than once")]
    DuplicateTaskId(TaskId),
    #[error("plan has no join task")]
    NoJoinTask,
    #[error("plan has more than one join task: {0:?}")]
    MultipleJoinTasks(Vec<TaskId>),
    #[error("task {task} references ${reference}, which is not in the plan")]
    DanglingReference { task: TaskId, reference: TaskId },
    #[error("task {task} references the join task ${join}")]
    JoinReferenced { task: TaskId, join: TaskId },
    #[error("dependency cycle among tasks {0:?}")]
    Cycle(Vec<TaskId>),
}

/// A resolved task graph: every dependency exists, there is exactly one
/// join task and the graph is acyclic.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    tasks: BTreeMap<TaskId, Task>,
    join: TaskId,
    dependents: BTreeMap<TaskId, BTreeSet<TaskId>>,
}

impl Plan {
    pub fn build(raw: Vec<RawTask>) -> Result<Self, GraphError> {
        if raw.is_empty() {
            return Err(GraphError::EmptyPlan);
        }

        let mut ids = BTreeSet::new();
        for task in &raw {
            if !ids.insert(task.id) {
                return Err(GraphError::DuplicateTaskId(task.id));
            }
        }

        let joins = raw
            .iter()
            .filter(|task| task.is_join())
            .map(|task| task.id)
            .collect::<Vec<_>>();
        let join = match joins.as_slice() {
            [] => return Err(GraphError::NoJoinTask),
            [join] => *join,
            _ => return Err(GraphError::MultipleJoinTasks(joins)),
        };

        let mut dependencies = BTreeMap::new();
        for task in &raw {
            let refs = task.references();
            for reference in &refs {
                if *reference == task.id {
                    return Err(GraphError::Cycle(vec![task.id]));
                }
                if *reference == join {
                    return Err(GraphError::JoinReferenced {
                        task: task.id,
                        join,
                    });
                }
                if !ids.contains(reference) {
                    return Err(GraphError::DanglingReference {
                        task: task.id,
                        reference: *reference,
                    });
                }
            }
            dependencies.insert(task.id, refs);
        }

        let mut dependents: BTreeMap<TaskId, BTreeSet<TaskId>> =
            ids.iter().map(|id| (*id, BTreeSet::new())).collect();
        for (id, deps) in &dependencies {
            for dep in deps {
                if let Some(children) = dependents.get_mut(dep) {
                    children.insert(*id);
                }
            }
        }

        // A join without explicit references waits on the leaf-most tasks.
        if dependencies.get(&join).map(BTreeSet::is_empty).unwrap_or(true) {
            let leaves = ids
                .iter()
                .copied()
                .filter(|id| *id != join)
                .filter(|id| dependents.get(id).map(BTreeSet::is_empty).unwrap_or(true))
                .collect::<BTreeSet<_>>();
            for leaf in &leaves {
                if let Some(children) = dependents.get_mut(leaf) {
                    children.insert(join);
                }
            }
            dependencies.insert(join, leaves);
        }

        let tasks = raw
            .into_iter()
            .map(|task| {
                let deps = dependencies.remove(&task.id).unwrap_or_default();
                (task.id, Task::from_raw(task, deps))
            })
            .collect::<BTreeMap<_, _>>();

        let plan = Self {
            tasks,
            join,
            dependents,
        };
        let order = plan.readiness_order();
        if order.len() != plan.tasks.len() {
            let ordered = order.into_iter().collect::<BTreeSet<_>>();
            let stuck = plan
                .tasks
                .keys()
                .copied()
                .filter(|id| !ordered.contains(id))
                .collect();
            return Err(GraphError::Cycle(stuck));
        }
        Ok(plan)
    }

    pub fn join_id(&self) -> TaskId {
        self.join
    }

    pub fn join_task(&self) -> Option<&Task> {
        self.tasks.get(&self.join)
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub(crate) fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn in_degree(&self, id: TaskId) -> usize {
        self.tasks
            .get(&id)
            .map(|task| task.dependencies.len())
            .unwrap_or(0)
    }

    pub fn dependents(&self, id: TaskId) -> impl Iterator<Item = TaskId> + '_ {
        self.dependents
            .get(&id)
            .into_iter()
            .flat_map(|children| children.iter().copied())
    }

    pub fn transitive_dependents(&self, id: TaskId) -> BTreeSet<TaskId> {
        let mut seen = BTreeSet::new();
        let mut stack = self.dependents(id).collect::<Vec<_>>();
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                stack.extend(self.dependents(next));
            }
        }
        seen
    }

    /// Topological order, lowest ready id first. Deterministic for a given
    /// set of tasks.
    pub fn readiness_order(&self) -> Vec<TaskId> {
        let mut remaining = self
            .tasks
            .iter()
            .map(|(id, task)| (*id, task.dependencies.len()))
            .collect::<BTreeMap<_, _>>();
        let mut ready = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect::<BTreeSet<_>>();
        let mut order = Vec::with_capacity(self.tasks.len());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            for child in self.dependents(id) {
                if let Some(count) = remaining.get_mut(&child) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        ready.insert(child);
                    }
                }
            }
        }
        order
    }

    pub fn raw_tasks(&self) -> Vec<RawTask> {
        self.tasks.values().map(Task::to_raw).collect()
    }

    pub fn outputs(&self) -> BTreeMap<TaskId, String> {
        self.tasks
            .values()
            .filter_map(|task| task.output().map(|output| (task.id, output.to_string())))
            .collect()
    }

    pub fn all_terminal(&self) -> bool {
        self.tasks.values().all(|task| task.status.is_terminal())
    }

    pub fn count_with_status(&self, status: TaskStatus) -> usize {
        self.tasks
            .values()
            .filter(|task| task.status == status)
            .count()
    }

    /// Calls and observations in id order, as shown to the joiner and to a
    /// replanning planner.
    pub fn render_with_observations(&self) -> String {
        let mut out = String::new();
        for task in self.tasks.values() {
            if task.is_join() {
                out.push_str(&format!("{}. join()\n", task.id));
                continue;
            }
            if let Some(thought) = task.thought.as_deref() {
                out.push_str(&format!("Thought: {thought}\n"));
            }
            out.push_str(&task.render_call());
            out.push('\n');
            out.push_str(&format!("Observation: {}\n", task.render_observation()));
        }
        out
    }
}
