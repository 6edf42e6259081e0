//! Normalized step graph handed to the engine by the workflow front-end.

use crate::errors::SchedulingError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;

#[allow(clippy::expect_used)]
static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\((inputs|runtime)\.([A-Za-z0-9_\-]+)\)").expect("placeholder pattern")
});

/// Step and input names are used verbatim as one segment of an object key.
fn check_name(what: &'static str, name: &str) -> Result<(), SchedulingError> {
    let invalid = name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']);
    if invalid {
        return Err(SchedulingError::InvalidName {
            what,
            name: name.to_string(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepGraph {
    pub steps: Vec<Step>,
    #[serde(default)]
    pub outputs: Vec<WorkflowOutput>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub inputs: Vec<InputBinding>,
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputBinding {
    pub name: String,
    pub source: InputSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InputSource {
    /// A file or directory supplied with the job request.
    Workflow { input: String },
    /// An output produced by an upstream step.
    Step { step: String, output: String },
    /// A local file uploaded at submission time if the cluster cannot see it yet.
    File { path: PathBuf },
    /// A literal substituted into the command.
    Value { value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub name: String,
    pub glob: String,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowOutput {
    pub name: String,
    pub step: String,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
    Input(String),
    OutDir,
    Unknown(String),
}

/// Every `$(...)` reference in a command, with its byte range.
pub fn placeholders(command: &str) -> Vec<(std::ops::Range<usize>, Placeholder)> {
    PLACEHOLDER
        .captures_iter(command)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let scope = caps.get(1)?.as_str();
            let name = caps.get(2)?.as_str();
            let placeholder = match (scope, name) {
                ("inputs", name) => Placeholder::Input(name.to_string()),
                ("runtime", "outdir") => Placeholder::OutDir,
                (_, other) => Placeholder::Unknown(format!("{}.{}", scope, other)),
            };
            Some((whole.range(), placeholder))
        })
        .collect()
}

impl Step {
    pub fn input(&self, name: &str) -> Option<&InputBinding> {
        self.inputs.iter().find(|i| i.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&OutputSpec> {
        self.outputs.iter().find(|o| o.name == name)
    }

    /// Explicit dependencies plus the steps whose outputs this step reads.
    pub fn upstream(&self) -> BTreeSet<&str> {
        let mut deps: BTreeSet<&str> = self.depends_on.iter().map(String::as_str).collect();
        for input in &self.inputs {
            if let InputSource::Step { step, .. } = &input.source {
                deps.insert(step.as_str());
            }
        }
        deps
    }
}

impl StepGraph {
    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.name.as_str())
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    /// Names of workflow inputs any step reads.
    pub fn workflow_inputs(&self) -> BTreeSet<&str> {
        self.steps
            .iter()
            .flat_map(|s| s.inputs.iter())
            .filter_map(|i| match &i.source {
                InputSource::Workflow { input } => Some(input.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn validate(&self) -> Result<(), SchedulingError> {
        if self.steps.is_empty() {
            return Err(SchedulingError::EmptyGraph);
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            check_name("step", &step.name)?;
            for input in &step.inputs {
                check_name("input", &input.name)?;
                if let InputSource::Workflow { input } = &input.source {
                    check_name("workflow input", input)?;
                }
            }
            for output in &step.outputs {
                check_name("output", &output.name)?;
            }
            if !seen.insert(step.name.as_str()) {
                return Err(SchedulingError::DuplicateStep(step.name.clone()));
            }
        }

        for step in &self.steps {
            let mut input_names = HashSet::new();
            for input in &step.inputs {
                if !input_names.insert(input.name.as_str()) {
                    return Err(SchedulingError::DuplicateInput {
                        step: step.name.clone(),
                        input: input.name.clone(),
                    });
                }
                if let InputSource::Step {
                    step: source,
                    output,
                } = &input.source
                {
                    let upstream =
                        self.step(source)
                            .ok_or_else(|| SchedulingError::UnknownDependency {
                                step: step.name.clone(),
                                dependency: source.clone(),
                            })?;
                    if upstream.output(output).is_none() {
                        return Err(SchedulingError::UnknownStepOutput {
                            step: step.name.clone(),
                            source_step: source.clone(),
                            output: output.clone(),
                        });
                    }
                }
            }

            for dep in &step.depends_on {
                if self.step(dep).is_none() {
                    return Err(SchedulingError::UnknownDependency {
                        step: step.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }

            for (_, placeholder) in placeholders(&step.command) {
                match placeholder {
                    Placeholder::Input(name) if step.input(&name).is_none() => {
                        return Err(SchedulingError::UnresolvedPlaceholder {
                            step: step.name.clone(),
                            input: name,
                        });
                    }
                    Placeholder::Unknown(name) => {
                        return Err(SchedulingError::UnresolvedPlaceholder {
                            step: step.name.clone(),
                            input: name,
                        });
                    }
                    _ => {}
                }
            }
        }

        for output in &self.outputs {
            check_name("workflow output", &output.name)?;
            let exists = self
                .step(&output.step)
                .is_some_and(|s| s.output(&output.output).is_some());
            if !exists {
                return Err(SchedulingError::UnknownWorkflowOutput {
                    output: output.name.clone(),
                    step: output.step.clone(),
                    step_output: output.output.clone(),
                });
            }
        }

        self.topological_order().map(|_| ())
    }

    /// Kahn's algorithm; ties resolve in declaration order.
    pub fn topological_order(&self) -> Result<Vec<usize>, SchedulingError> {
        let index: HashMap<&str, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();

        let mut in_degree = vec![0usize; self.steps.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.steps.len()];
        for (i, step) in self.steps.iter().enumerate() {
            for dep in step.upstream() {
                let Some(&d) = index.get(dep) else {
                    return Err(SchedulingError::UnknownDependency {
                        step: step.name.clone(),
                        dependency: dep.to_string(),
                    });
                };
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }

        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(self.steps.len());

        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &child in &dependents[next] {
                in_degree[child] -= 1;
                if in_degree[child] == 0 {
                    ready.insert(child);
                }
            }
        }

        if order.len() != self.steps.len() {
            let stuck = in_degree
                .iter()
                .enumerate()
                .filter(|(_, d)| **d > 0)
                .map(|(i, _)| self.steps[i].name.clone())
                .collect();
            return Err(SchedulingError::Cycle(stuck));
        }

        Ok(order)
    }

    /// Step index to the indices of the steps that directly depend on it.
    pub fn dependents(&self) -> Vec<Vec<usize>> {
        let mut dependents = vec![Vec::new(); self.steps.len()];
        for (i, step) in self.steps.iter().enumerate() {
            for dep in step.upstream() {
                if let Some(d) = self.index_of(dep) {
                    dependents[d].push(i);
                }
            }
        }
        dependents
    }

    /// All steps reachable downstream of `start`, excluding `start`.
    pub fn transitive_dependents(&self, start: usize) -> BTreeSet<usize> {
        let dependents = self.dependents();
        let mut found = BTreeSet::new();
        let mut stack = vec![start];
        while let Some(current) = stack.pop() {
            for &child in &dependents[current] {
                if found.insert(child) {
                    stack.push(child);
                }
            }
        }
        found
    }

    /// Declared workflow outputs, or every output of every sink step.
    pub fn top_level_outputs(&self) -> Vec<WorkflowOutput> {
        if !self.outputs.is_empty() {
            return self.outputs.clone();
        }
        let dependents = self.dependents();
        self.steps
            .iter()
            .enumerate()
            .filter(|(i, _)| dependents[*i].is_empty())
            .flat_map(|(_, step)| {
                step.outputs.iter().map(move |o| WorkflowOutput {
                    name: o.name.clone(),
                    step: step.name.clone(),
                    output: o.name.clone(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, deps: &[&str]) -> Step {
        Step {
            name: name.to_string(),
            command: "true".to_string(),
            env: BTreeMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn graph(steps: Vec<Step>) -> StepGraph {
        StepGraph {
            steps,
            outputs: Vec::new(),
        }
    }

    fn names(g: &StepGraph, order: &[usize]) -> Vec<String> {
        order.iter().map(|i| g.steps[*i].name.clone()).collect()
    }

    #[test]
    fn test_diamond_order() {
        let g = graph(vec![
            step("d", &["b", "c"]),
            step("c", &["a"]),
            step("b", &["a"]),
            step("a", &[]),
        ]);
        let order = g.topological_order().unwrap();
        assert_eq!(names(&g, &order), vec!["a", "c", "b", "d"]);
    }

    #[test]
    fn test_declaration_order_breaks_ties() {
        let g = graph(vec![step("z", &[]), step("y", &[]), step("x", &["z"])]);
        let order = g.topological_order().unwrap();
        assert_eq!(names(&g, &order), vec!["z", "y", "x"]);
    }

    #[test]
    fn test_cycle_detected() {
        let g = graph(vec![step("a", &["b"]), step("b", &["a"]), step("c", &[])]);
        match g.validate() {
            Err(SchedulingError::Cycle(stuck)) => {
                assert_eq!(stuck, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_names_must_be_single_key_segments() {
        let g = graph(vec![step("a/b", &[]), step("a", &["a/b"])]);
        assert_eq!(
            g.validate(),
            Err(SchedulingError::InvalidName {
                what: "step",
                name: "a/b".into()
            })
        );

        for bad in ["", ".", "..", "x\\y"] {
            assert!(graph(vec![step(bad, &[])]).validate().is_err(), "{:?}", bad);
        }

        let mut reader = step("read", &[]);
        reader.inputs.push(InputBinding {
            name: "data".into(),
            source: InputSource::Workflow {
                input: "../etc".into(),
            },
        });
        assert!(matches!(
            graph(vec![reader]).validate(),
            Err(SchedulingError::InvalidName {
                what: "workflow input",
                ..
            })
        ));
        assert!(graph(vec![step("align-1.v2_x", &[])]).validate().is_ok());
    }

    #[test]
    fn test_unknown_dependency() {
        let g = graph(vec![step("a", &["ghost"])]);
        assert_eq!(
            g.validate(),
            Err(SchedulingError::UnknownDependency {
                step: "a".into(),
                dependency: "ghost".into()
            })
        );
    }

    #[test]
    fn test_step_input_creates_edge_and_checks_output() {
        let mut producer = step("produce", &[]);
        producer.outputs.push(OutputSpec {
            name: "x".into(),
            glob: "x.txt".into(),
            required: true,
        });
        let mut consumer = step("consume", &[]);
        consumer.inputs.push(InputBinding {
            name: "data".into(),
            source: InputSource::Step {
                step: "produce".into(),
                output: "x".into(),
            },
        });
        let g = graph(vec![consumer.clone(), producer.clone()]);
        assert!(g.validate().is_ok());
        assert_eq!(
            names(&g, &g.topological_order().unwrap()),
            vec!["produce", "consume"]
        );

        consumer.inputs[0].source = InputSource::Step {
            step: "produce".into(),
            output: "missing".into(),
        };
        let g = graph(vec![producer, consumer]);
        assert!(matches!(
            g.validate(),
            Err(SchedulingError::UnknownStepOutput { .. })
        ));
    }

    #[test]
    fn test_unresolved_placeholder() {
        let mut s = step("a", &[]);
        s.command = "cat $(inputs.reads) > $(runtime.outdir)/out".into();
        assert_eq!(
            graph(vec![s.clone()]).validate(),
            Err(SchedulingError::UnresolvedPlaceholder {
                step: "a".into(),
                input: "reads".into()
            })
        );
        s.inputs.push(InputBinding {
            name: "reads".into(),
            source: InputSource::Value {
                value: "r.fq".into(),
            },
        });
        assert!(graph(vec![s]).validate().is_ok());
    }

    #[test]
    fn test_transitive_dependents() {
        let g = graph(vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["b"]),
            step("d", &[]),
        ]);
        let deps = g.transitive_dependents(0);
        assert_eq!(deps.into_iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_top_level_outputs_default_to_sinks() {
        let mut a = step("a", &[]);
        a.outputs.push(OutputSpec {
            name: "mid".into(),
            glob: "mid".into(),
            required: true,
        });
        let mut b = step("b", &["a"]);
        b.outputs.push(OutputSpec {
            name: "final".into(),
            glob: "final".into(),
            required: true,
        });
        let outputs = graph(vec![a, b]).top_level_outputs();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].step, "b");
        assert_eq!(outputs[0].output, "final");
    }

    #[test]
    fn test_graph_from_json() {
        let g = StepGraph::from_json(
            r#"{
              "steps": [
                {"name": "a", "command": "echo hi > $(runtime.outdir)/x",
                 "outputs": [{"name": "x", "glob": "x"}]},
                {"name": "b", "command": "cat $(inputs.x)",
                 "inputs": [{"name": "x", "source": {"type": "step", "step": "a", "output": "x"}}]}
              ]
            }"#,
        )
        .unwrap();
        assert!(g.validate().is_ok());
        assert!(g.steps[0].outputs[0].required);
    }
}
