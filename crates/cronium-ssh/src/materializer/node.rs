use super::{ScriptFile, WrappedScript};

pub(super) const RUNTIME: &str = include_str!("runtime/cronium.js");

const HEADER: &str = "const cronium = require('./cronium.js');\n\
const { input, event, output, setCondition, getCondition, getVariable, setVariable } = cronium;\n\n";

pub(super) fn wrap(script: &str) -> WrappedScript {
    WrappedScript {
        files: vec![
            ScriptFile {
                name: "cronium.js",
                contents: RUNTIME.to_string(),
            },
            ScriptFile {
                name: "script.js",
                contents: format!("{HEADER}{}\n", script.trim_end_matches('\n')),
            },
        ],
        command: "node ./script.js".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_and_destructures() {
        let wrapped = wrap("output({ n: input().n * 2 });");
        let script = &wrapped.files[1].contents;
        assert!(script.starts_with("const cronium = require('./cronium.js');\nconst { input, event,"));
        assert!(script.ends_with("output({ n: input().n * 2 });\n"));
        assert_eq!(wrapped.command, "node ./script.js");
    }

    #[test]
    fn test_runtime_exports_every_helper() {
        let exports = RUNTIME
            .split("module.exports")
            .nth(1)
            .expect("runtime has exports");
        for helper in [
            "input",
            "event",
            "output",
            "setCondition",
            "getCondition",
            "getVariable",
            "setVariable",
        ] {
            assert!(exports.contains(helper), "missing {helper}");
        }
    }
}
