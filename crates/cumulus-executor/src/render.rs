use crate::error::TaskError;
use crate::rpc::StagedInput;
use cumulus_core::constants::dirs;
use cumulus_core::errors::ErrorKind;
use cumulus_core::graph::{placeholders, Placeholder, Step};
use std::collections::BTreeMap;

pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// An input after its source has been located in storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedInput {
    /// Objects the cluster copies into `inputs/<name>/`. A `file` input renders
    /// as the path of its single object, otherwise as the directory.
    Staged { input: StagedInput, file: bool },
    Value(String),
}

impl ResolvedInput {
    fn render(&self, name: &str) -> String {
        match self {
            ResolvedInput::Staged { input, file: true } if input.objects.len() == 1 => {
                shell_quote(&format!("{}/{}/{}", dirs::INPUTS, name, input.objects[0].path))
            }
            ResolvedInput::Staged { .. } => shell_quote(&format!("{}/{}", dirs::INPUTS, name)),
            ResolvedInput::Value(value) => shell_quote(value),
        }
    }
}

/// Substitutes `$(inputs.<name>)` and `$(runtime.outdir)` in the step command.
/// Paths are relative to the invocation's work directory.
pub fn render_command(
    step: &Step,
    resolved: &BTreeMap<String, ResolvedInput>,
) -> Result<String, TaskError> {
    let mut script = String::with_capacity(step.command.len());
    let mut last = 0;
    for (range, placeholder) in placeholders(&step.command) {
        script.push_str(&step.command[last..range.start]);
        match placeholder {
            Placeholder::Input(name) => {
                let input = resolved.get(&name).ok_or_else(|| {
                    TaskError::new(
                        ErrorKind::Scheduling,
                        format!("input '{}' of step '{}' was not resolved", name, step.name),
                    )
                })?;
                script.push_str(&input.render(&name));
            }
            Placeholder::OutDir => script.push_str(dirs::OUTPUTS),
            Placeholder::Unknown(name) => {
                return Err(TaskError::new(
                    ErrorKind::Scheduling,
                    format!("unknown placeholder '$({})' in step '{}'", name, step.name),
                ));
            }
        }
        last = range.end;
    }
    script.push_str(&step.command[last..]);
    Ok(script)
}
