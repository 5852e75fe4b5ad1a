use crate::CoreError;
use cloyster_schema::{PlanFile, StepAction};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

/// A named unit of configuration work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub id: String,
    pub depends_on: Vec<String>,
    pub action: StepAction,
}

impl Step {
    pub fn new(id: &str, action: impl Into<StepAction>) -> Self {
        Self {
            id: id.to_owned(),
            depends_on: Vec::new(),
            action: action.into(),
        }
    }

    #[must_use]
    pub fn after(mut self, dependencies: &[&str]) -> Self {
        self.depends_on
            .extend(dependencies.iter().map(|d| (*d).to_owned()));
        self
    }

    fn mount_target(&self) -> Option<&Path> {
        match &self.action {
            StepAction::Mount(spec) => Some(&spec.target),
            StepAction::Service(_) => None,
        }
    }
}

/// Steps in the order they must run. Every step appears exactly once and
/// after all of its dependencies.
#[derive(Debug, Clone, Default)]
pub struct RunPlan {
    steps: Vec<Step>,
}

impl RunPlan {
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn ids(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.id.clone()).collect()
    }

    pub fn get(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Collects steps and orders them by their declared dependencies.
#[derive(Debug, Default)]
pub struct StepRegistry {
    steps: Vec<Step>,
    index: HashMap<String, usize>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every step of a parsed plan file, in file order.
    pub fn from_plan_file(plan: &PlanFile) -> Result<Self, CoreError> {
        let mut registry = Self::new();
        for spec in &plan.steps {
            registry.register(Step {
                id: spec.id.clone(),
                depends_on: spec.depends_on.clone(),
                action: spec.action.clone(),
            })?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, step: Step) -> Result<(), CoreError> {
        if self.index.contains_key(&step.id) {
            return Err(CoreError::DuplicateStep(step.id));
        }
        if let Some(target) = step.mount_target() {
            if let Some(other) = self
                .steps
                .iter()
                .find(|s| s.mount_target() == Some(target))
            {
                let target = target.to_path_buf();
                return Err(CoreError::DuplicateMountTarget {
                    first: other.id.clone(),
                    second: step.id,
                    target,
                });
            }
        }
        self.index.insert(step.id.clone(), self.steps.len());
        self.steps.push(step);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Topologically order the registered steps (Kahn's algorithm).
    ///
    /// Among steps that are ready at the same time, the one registered first
    /// runs first, so the order is stable across invocations.
    pub fn plan(&self) -> Result<RunPlan, CoreError> {
        let n = self.steps.len();
        let mut indegree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (idx, step) in self.steps.iter().enumerate() {
            for dep in &step.depends_on {
                let dep_idx =
                    self.index
                        .get(dep)
                        .copied()
                        .ok_or_else(|| CoreError::UnknownDependency {
                            step: step.id.clone(),
                            dependency: dep.clone(),
                        })?;
                indegree[idx] += 1;
                dependents[dep_idx].push(idx);
            }
        }

        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(idx) = ready.pop_first() {
            order.push(idx);
            for &next in &dependents[idx] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        if order.len() < n {
            return Err(CoreError::Cycle(self.cycle_members(&indegree)));
        }

        Ok(RunPlan {
            steps: order.into_iter().map(|i| self.steps[i].clone()).collect(),
        })
    }

    /// Names of the steps on a cycle, given the in-degrees Kahn left behind.
    /// Steps that merely wait on a cycle are pruned.
    fn cycle_members(&self, indegree: &[usize]) -> Vec<String> {
        let mut remaining: Vec<bool> = indegree.iter().map(|&d| d > 0).collect();
        loop {
            let mut pruned = false;
            for idx in 0..self.steps.len() {
                if !remaining[idx] {
                    continue;
                }
                let id = &self.steps[idx].id;
                let needed = self.steps.iter().enumerate().any(|(other, step)| {
                    remaining[other] && step.depends_on.iter().any(|d| d == id)
                });
                if !needed {
                    remaining[idx] = false;
                    pruned = true;
                }
            }
            if !pruned {
                break;
            }
        }
        self.steps
            .iter()
            .zip(remaining)
            .filter_map(|(step, on_cycle)| on_cycle.then(|| step.id.clone()))
            .collect()
    }
}
