//! Agent registry
//!
//! Built once at startup. `build()` rejects duplicate names, undeclared
//! dependencies, dependency cycles and dependencies that would not have run
//! yet, so a run never discovers a broken graph mid-flight.

use crate::agents::{Agent, AgentDescriptor, Phase};
use crate::error::RegistryError;
use std::collections::HashMap;
use std::sync::Arc;

/// Validated, immutable set of agents
#[derive(Clone)]
pub struct AgentRegistry {
    agents: Vec<Arc<dyn Agent>>,
    index: HashMap<String, usize>,
}

/// Collects agents in registration order
#[derive(Default)]
pub struct AgentRegistryBuilder {
    agents: Vec<Arc<dyn Agent>>,
}

impl AgentRegistryBuilder {
    pub fn register<A: Agent + 'static>(self, agent: A) -> Self {
        self.register_arc(Arc::new(agent))
    }

    pub fn register_arc(mut self, agent: Arc<dyn Agent>) -> Self {
        self.agents.push(agent);
        self
    }

    /// Validate the dependency graph and freeze the registry
    pub fn build(self) -> Result<AgentRegistry, RegistryError> {
        if self.agents.is_empty() {
            return Err(RegistryError::EmptyRegistry);
        }

        let mut index = HashMap::with_capacity(self.agents.len());
        for (i, agent) in self.agents.iter().enumerate() {
            let name = agent.descriptor().name.clone();
            if index.insert(name.clone(), i).is_some() {
                return Err(RegistryError::DuplicateAgent(name));
            }
        }

        let descriptors: Vec<&AgentDescriptor> =
            self.agents.iter().map(|a| a.descriptor()).collect();

        for d in &descriptors {
            for dep in &d.dependencies {
                if !index.contains_key(dep) {
                    return Err(RegistryError::UnknownDependency {
                        agent: d.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        if let Some(cycle) = find_cycle(&descriptors, &index) {
            return Err(RegistryError::DependencyCycle(cycle));
        }

        for (i, d) in descriptors.iter().enumerate() {
            for dep in &d.dependencies {
                let j = index[dep];
                let dep_phase = descriptors[j].phase;
                let scheduled_before = dep_phase < d.phase
                    || (dep_phase == d.phase && !d.phase.is_parallel() && j < i);
                if !scheduled_before {
                    return Err(RegistryError::DependencyOrder {
                        agent: d.name.clone(),
                        phase: d.phase.to_string(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        Ok(AgentRegistry {
            agents: self.agents,
            index,
        })
    }
}

/// Depth-first search for a back edge; returns the agents on the cycle,
/// closed (first name repeated at the end)
fn find_cycle(descriptors: &[&AgentDescriptor], index: &HashMap<String, usize>) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    fn visit(
        node: usize,
        descriptors: &[&AgentDescriptor],
        index: &HashMap<String, usize>,
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        marks[node] = Mark::InProgress;
        stack.push(node);
        for dep in &descriptors[node].dependencies {
            let next = index[dep];
            match marks[next] {
                Mark::InProgress => {
                    let pos = stack.iter().position(|&n| n == next).unwrap_or(0);
                    let mut cycle: Vec<String> = stack[pos..]
                        .iter()
                        .map(|&n| descriptors[n].name.clone())
                        .collect();
                    cycle.push(descriptors[next].name.clone());
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = visit(next, descriptors, index, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }
        stack.pop();
        marks[node] = Mark::Done;
        None
    }

    let mut marks = vec![Mark::Unvisited; descriptors.len()];
    let mut stack = Vec::new();
    for node in 0..descriptors.len() {
        if marks[node] == Mark::Unvisited {
            if let Some(cycle) = visit(node, descriptors, index, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

impl AgentRegistry {
    pub fn builder() -> AgentRegistryBuilder {
        AgentRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Agent>> {
        self.index.get(name).map(|&i| &self.agents[i])
    }

    /// Agent names in registration order
    pub fn names(&self) -> Vec<String> {
        self.agents.iter().map(|a| a.name().to_string()).collect()
    }

    pub fn descriptors(&self) -> Vec<AgentDescriptor> {
        self.agents.iter().map(|a| a.descriptor().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Non-empty phases in execution order, members in registration order
    pub fn phases(&self) -> Vec<(Phase, Vec<Arc<dyn Agent>>)> {
        Phase::ORDER
            .iter()
            .filter_map(|&phase| {
                let members: Vec<Arc<dyn Agent>> = self
                    .agents
                    .iter()
                    .filter(|a| a.descriptor().phase == phase)
                    .cloned()
                    .collect();
                (!members.is_empty()).then_some((phase, members))
            })
            .collect()
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.names())
            .finish()
    }
}
