use super::{ScriptFile, WrappedScript};

pub(super) const RUNTIME: &str = include_str!("runtime/cronium.py");

const HEADER: &str = "import cronium\n\
from cronium import input, event, output, setCondition, getCondition, getVariable, setVariable\n\n";

pub(super) fn wrap(script: &str) -> WrappedScript {
    WrappedScript {
        files: vec![
            ScriptFile {
                name: "cronium.py",
                contents: RUNTIME.to_string(),
            },
            ScriptFile {
                name: "script.py",
                contents: format!("{HEADER}{}\n", script.trim_end_matches('\n')),
            },
        ],
        command: "python3 ./script.py".into(),
    }
}
