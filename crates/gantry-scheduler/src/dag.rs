//! Execution DAG over expanded job instances.

use crate::matrix::MatrixExpander;
use crate::validation;
use gantry_core::DefinitionError;
use gantry_core::ids::InstanceIndex;
use gantry_core::pipeline::PipelineDefinition;
use gantry_core::run::JobInstance;
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use std::collections::HashMap;
use tracing::debug;

/// Every instance of one run, plus "needs" edges between them.
///
/// Instances live in an arena indexed by [`InstanceIndex`]; the graph stores
/// only indices. An edge `b -> a` means instance `a` needs instance `b`.
#[derive(Debug)]
pub struct ExecutionDag {
    instances: Vec<JobInstance>,
    graph: DiGraph<InstanceIndex, ()>,
    by_job: HashMap<String, Vec<InstanceIndex>>,
    order: Vec<InstanceIndex>,
}

impl ExecutionDag {
    fn node(index: InstanceIndex) -> NodeIndex {
        NodeIndex::new(index.get())
    }

    fn neighbors(&self, index: InstanceIndex, direction: Direction) -> Vec<InstanceIndex> {
        let mut found: Vec<InstanceIndex> = self
            .graph
            .neighbors_directed(Self::node(index), direction)
            .map(|n| self.graph[n])
            .collect();
        found.sort_unstable();
        found
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn instance(&self, index: InstanceIndex) -> &JobInstance {
        &self.instances[index.get()]
    }

    pub fn instances(&self) -> &[JobInstance] {
        &self.instances
    }

    /// Indices of every instance of the named job.
    pub fn instances_of(&self, job: &str) -> &[InstanceIndex] {
        self.by_job.get(job).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Instances with no prerequisites.
    pub fn roots(&self) -> Vec<InstanceIndex> {
        self.instances
            .iter()
            .map(|i| i.index)
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(Self::node(idx), Direction::Incoming)
                    .next()
                    .is_none()
            })
            .collect()
    }

    /// Instances that must succeed before `index` may start.
    pub fn prerequisites(&self, index: InstanceIndex) -> Vec<InstanceIndex> {
        self.neighbors(index, Direction::Incoming)
    }

    /// Instances that directly need `index`.
    pub fn dependents(&self, index: InstanceIndex) -> Vec<InstanceIndex> {
        self.neighbors(index, Direction::Outgoing)
    }

    /// Every instance reachable from `index` along "needed by" edges.
    pub fn transitive_dependents(&self, index: InstanceIndex) -> Vec<InstanceIndex> {
        let start = Self::node(index);
        let mut bfs = Bfs::new(&self.graph, start);
        let mut found = Vec::new();
        while let Some(node) = bfs.next(&self.graph) {
            if node != start {
                found.push(self.graph[node]);
            }
        }
        found.sort_unstable();
        found
    }

    /// One valid topological order of all instances.
    pub fn topological_order(&self) -> &[InstanceIndex] {
        &self.order
    }
}

/// Builder for constructing execution DAGs.
pub struct DagBuilder {
    expander: MatrixExpander,
}

impl DagBuilder {
    pub fn new() -> Self {
        Self {
            expander: MatrixExpander::new(),
        }
    }

    /// Validate a definition, expand every job, and connect the instances.
    ///
    /// For "A needs B" every instance of B precedes every instance of A.
    pub fn build(&self, pipeline: &PipelineDefinition) -> Result<ExecutionDag, DefinitionError> {
        validation::validate(pipeline)?;

        let mut instances = Vec::new();
        let mut by_job: HashMap<String, Vec<InstanceIndex>> = HashMap::new();

        for job in &pipeline.jobs {
            let expanded = self.expander.expand(job, instances.len())?;
            by_job.insert(job.name.clone(), expanded.iter().map(|i| i.index).collect());
            instances.extend(expanded);
        }

        let mut graph = DiGraph::with_capacity(instances.len(), 0);
        for instance in &instances {
            graph.add_node(instance.index);
        }

        for job in &pipeline.jobs {
            for dep in &job.needs {
                let prerequisites =
                    by_job
                        .get(dep)
                        .ok_or_else(|| DefinitionError::UnknownDependency {
                            job: job.name.clone(),
                            dependency: dep.clone(),
                        })?;
                for &before in prerequisites {
                    for &after in &by_job[&job.name] {
                        graph.update_edge(ExecutionDag::node(before), ExecutionDag::node(after), ());
                    }
                }
            }
        }

        let order: Vec<InstanceIndex> = toposort(&graph, None)
            .map_err(|_| DefinitionError::CycleDetected)?
            .into_iter()
            .map(|n| graph[n])
            .collect();

        debug!(
            pipeline = %pipeline.name,
            instances = instances.len(),
            edges = graph.edge_count(),
            "Built execution DAG"
        );

        Ok(ExecutionDag {
            instances,
            graph,
            by_job,
            order,
        })
    }
}

impl Default for DagBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::pipeline::{JobDefinition, StepDefinition};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn job(name: &str, needs: &[&str]) -> JobDefinition {
        JobDefinition::new(name)
            .with_needs(needs.iter().copied())
            .with_step(StepDefinition::run("run", "true"))
    }

    fn pipeline(jobs: Vec<JobDefinition>) -> PipelineDefinition {
        PipelineDefinition {
            name: "ci".to_string(),
            description: None,
            triggers: vec![],
            variables: Default::default(),
            jobs,
        }
    }

    fn idx(i: usize) -> InstanceIndex {
        InstanceIndex::new(i)
    }

    #[test]
    fn test_linear_dag() {
        let def = pipeline(vec![
            job("build", &[]),
            job("test", &["build"]),
            job("deploy", &["test"]),
        ]);

        let dag = DagBuilder::new().build(&def).unwrap();

        assert_eq!(dag.roots(), vec![idx(0)]);
        assert_eq!(dag.topological_order(), &[idx(0), idx(1), idx(2)]);
        assert_eq!(dag.transitive_dependents(idx(0)), vec![idx(1), idx(2)]);
    }

    #[test]
    fn test_parallel_dag() {
        let def = pipeline(vec![
            job("build", &[]),
            job("test-unit", &["build"]),
            job("test-integration", &["build"]),
            job("deploy", &["test-unit", "test-integration"]),
        ]);

        let dag = DagBuilder::new().build(&def).unwrap();

        assert_eq!(dag.dependents(idx(0)), vec![idx(1), idx(2)]);
        assert_eq!(dag.prerequisites(idx(3)), vec![idx(1), idx(2)]);
    }

    #[test]
    fn test_matrix_instances_all_precede_dependent() {
        let def = pipeline(vec![
            job("test", &[]).with_axis("python-version", ["3.9", "3.10", "3.11", "3.12", "3.13"]),
            job("publish", &["test"]),
        ]);

        let dag = DagBuilder::new().build(&def).unwrap();

        assert_eq!(dag.len(), 6);
        assert_eq!(dag.instances_of("test").len(), 5);
        let publish = dag.instances_of("publish")[0];
        assert_eq!(dag.prerequisites(publish), dag.instances_of("test").to_vec());
        assert_eq!(dag.roots().len(), 5);
    }

    #[test]
    fn test_cycle_detected() {
        let def = pipeline(vec![
            job("a", &["c"]),
            job("b", &["a"]),
            job("c", &["b"]),
        ]);

        let err = DagBuilder::new().build(&def).unwrap_err();
        assert_eq!(err, DefinitionError::CycleDetected);
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let def = pipeline(vec![job("publish", &["test"])]);
        assert!(matches!(
            DagBuilder::new().build(&def),
            Err(DefinitionError::UnknownDependency { .. })
        ));
    }

    /// Job `i` may only need jobs `0..i`, so the graph is acyclic.
    fn acyclic_pipeline(max_jobs: usize) -> impl Strategy<Value = PipelineDefinition> {
        (1..=max_jobs).prop_flat_map(|count| {
            (
                proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..count), count),
                proptest::collection::vec(1usize..4, count),
            )
                .prop_map(move |(raw_needs, widths)| {
                    let jobs = raw_needs
                        .into_iter()
                        .zip(widths)
                        .enumerate()
                        .map(|(i, (needs, width))| {
                            let needs: HashSet<String> = needs
                                .into_iter()
                                .filter(|_| i > 0)
                                .map(|n| format!("job{}", n % i.max(1)))
                                .collect();
                            job(&format!("job{}", i), &[])
                                .with_needs(needs)
                                .with_axis("shard", (0..width).map(|w| serde_json::json!(w)))
                        })
                        .collect();
                    pipeline(jobs)
                })
        })
    }

    proptest! {
        #[test]
        fn test_topological_order_respects_every_edge(def in acyclic_pipeline(8)) {
            let dag = DagBuilder::new().build(&def).unwrap();
            let order = dag.topological_order();
            prop_assert_eq!(order.len(), dag.len());

            let position: HashMap<InstanceIndex, usize> =
                order.iter().enumerate().map(|(pos, &i)| (i, pos)).collect();
            for instance in dag.instances() {
                for prereq in dag.prerequisites(instance.index) {
                    prop_assert!(position[&prereq] < position[&instance.index]);
                }
            }
        }

        #[test]
        fn test_back_edge_always_detected(def in acyclic_pipeline(6)) {
            let mut def = def;
            let last = def.jobs.len() - 1;
            let last_name = def.jobs[last].name.clone();
            def.jobs[0].needs.push(last_name);
            // A single job needing itself is rejected before cycle detection.
            if last == 0 {
                prop_assert!(DagBuilder::new().build(&def).is_err());
            } else {
                let cyclic = DagBuilder::new().build(&def).err() == Some(DefinitionError::CycleDetected);
                prop_assert_eq!(cyclic, reaches_first(&def, last));
            }
        }
    }

    /// Whether job `from` transitively needs `job0`.
    fn reaches_first(def: &PipelineDefinition, from: usize) -> bool {
        let mut stack = vec![def.jobs[from].name.clone()];
        let mut seen = HashSet::new();
        while let Some(name) = stack.pop() {
            if name == "job0" {
                return true;
            }
            if !seen.insert(name.clone()) {
                continue;
            }
            if let Some(job) = def.job(&name) {
                stack.extend(job.needs.iter().cloned());
            }
        }
        false
    }
}
