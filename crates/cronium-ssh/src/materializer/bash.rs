use super::{ScriptFile, WrappedScript};

pub(super) const RUNTIME: &str = include_str!("runtime/cronium.sh");

const HEADER: &str = "#!/usr/bin/env bash\nsource \"$(dirname \"${BASH_SOURCE[0]}\")/cronium.sh\"\n\n";

pub(super) fn wrap(script: &str) -> WrappedScript {
    WrappedScript {
        files: vec![
            ScriptFile {
                name: "cronium.sh",
                contents: RUNTIME.to_string(),
            },
            ScriptFile {
                name: "script.sh",
                contents: format!("{HEADER}{}\n", script.trim_end_matches('\n')),
            },
        ],
        command: "bash ./script.sh".into(),
    }
}
