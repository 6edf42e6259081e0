use cumulus_core::graph::{InputBinding, InputSource, OutputSpec, Step, StepGraph};
use cumulus_core::model::{ClusterConfig, Credentials};
use std::collections::BTreeMap;

pub struct StepBuilder(Step);

/// A step running `true` with no inputs or outputs.
pub fn step(name: &str) -> StepBuilder {
    StepBuilder(Step {
        name: name.to_string(),
        command: "true".to_string(),
        env: BTreeMap::new(),
        inputs: Vec::new(),
        outputs: Vec::new(),
        depends_on: Vec::new(),
    })
}

impl StepBuilder {
    pub fn command(mut self, command: &str) -> Self {
        self.0.command = command.to_string();
        self
    }

    pub fn after(mut self, dependency: &str) -> Self {
        self.0.depends_on.push(dependency.to_string());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.0.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn output(mut self, name: &str, glob: &str) -> Self {
        self.0.outputs.push(OutputSpec {
            name: name.to_string(),
            glob: glob.to_string(),
            required: true,
        });
        self
    }

    pub fn optional_output(mut self, name: &str, glob: &str) -> Self {
        self.0.outputs.push(OutputSpec {
            name: name.to_string(),
            glob: glob.to_string(),
            required: false,
        });
        self
    }

    pub fn input(mut self, name: &str, source: InputSource) -> Self {
        self.0.inputs.push(InputBinding {
            name: name.to_string(),
            source,
        });
        self
    }

    /// Reads `output` of `step` as input `name`.
    pub fn reads(self, name: &str, step: &str, output: &str) -> Self {
        self.input(
            name,
            InputSource::Step {
                step: step.to_string(),
                output: output.to_string(),
            },
        )
    }

    pub fn workflow_input(self, name: &str) -> Self {
        self.input(
            name,
            InputSource::Workflow {
                input: name.to_string(),
            },
        )
    }

    pub fn build(self) -> Step {
        self.0
    }
}

pub fn graph(steps: impl IntoIterator<Item = StepBuilder>) -> StepGraph {
    StepGraph {
        steps: steps.into_iter().map(StepBuilder::build).collect(),
        outputs: Vec::new(),
    }
}

/// A token-authenticated cluster whose endpoint only a scripted connector understands.
pub fn token_cluster(name: &str) -> ClusterConfig {
    ClusterConfig::new(
        Some(name.to_string()),
        format!("scripted://{}", name),
        Credentials::Token(format!("{}-token", name)),
    )
    .expect("valid cluster")
}
