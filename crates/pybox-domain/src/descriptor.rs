/// File written by `python -m venv` at the environment root.
pub const DESCRIPTOR_FILE: &str = "pyvenv.cfg";

/// Read the runtime version recorded in an environment descriptor.
///
/// Lines are `key = value`; the `version` key wins, `version_info` is used when it is absent
/// and cut to `major.minor.micro` (`3.12.1.final.0` -> `3.12.1`).
#[must_use]
pub fn descriptor_version(contents: &str) -> Option<String> {
    let mut fallback = None;
    for line in contents.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key.trim() {
            "version" => return Some(value.to_string()),
            "version_info" if fallback.is_none() => fallback = Some(release_triple(value)),
            _ => {}
        }
    }
    fallback
}

fn release_triple(version_info: &str) -> String {
    version_info
        .split('.')
        .take(3)
        .collect::<Vec<_>>()
        .join(".")
}
