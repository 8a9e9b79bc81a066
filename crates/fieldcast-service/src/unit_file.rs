use anyhow::{anyhow, Result};
use fieldcast_core::{is_generator_default, GENERATOR_ENVIRONMENT_DEFAULTS};

/// Inputs the unit-file generator needs beyond the shared default table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSpec {
    pub service_name: String,
    pub description: String,
    pub user: String,
    pub working_dir: String,
    pub exec_start: String,
}

impl UnitSpec {
    pub fn stream_supervisor(repo_root: &std::path::Path) -> Self {
        Self {
            service_name: "fieldcast-stream".to_string(),
            description: "Fieldcast audio stream supervisor".to_string(),
            user: "fieldcast".to_string(),
            working_dir: repo_root.display().to_string(),
            exec_start: repo_root.join("scripts/stream-supervisor").display().to_string(),
        }
    }
}

/// Render the service definition. Environment lines come from the shared
/// generator-default table, so the customization diff and this renderer can
/// never disagree about what a default looks like.
pub fn generate_unit(spec: &UnitSpec) -> String {
    let mut text = String::new();
    text.push_str("[Unit]\n");
    text.push_str(&format!("Description={}\n", spec.description));
    text.push_str("After=network.target sound.target\n");
    text.push('\n');
    text.push_str("[Service]\n");
    text.push_str("Type=simple\n");
    text.push_str(&format!("User={}\n", spec.user));
    text.push_str(&format!("WorkingDirectory={}\n", spec.working_dir));
    for (key, value) in GENERATOR_ENVIRONMENT_DEFAULTS {
        text.push_str(&format!("Environment=\"{key}={value}\"\n"));
    }
    text.push_str(&format!("ExecStart={}\n", spec.exec_start));
    text.push_str("Restart=on-failure\n");
    text.push_str("RestartSec=5\n");
    text.push('\n');
    text.push_str("[Install]\n");
    text.push_str("WantedBy=multi-user.target\n");
    text
}

/// Parse `Environment=` assignments out of unit-file text, in order.
/// Handles both quoted (`Environment="K=V"`) and bare forms.
pub fn environment_assignments(unit_text: &str) -> Vec<(String, String)> {
    let mut assignments = Vec::new();
    for line in unit_text.lines() {
        let line = line.trim();
        let Some(raw) = line.strip_prefix("Environment=") else {
            continue;
        };
        let raw = raw.trim().trim_matches('"');
        if let Some((key, value)) = raw.split_once('=') {
            assignments.push((key.trim().to_string(), value.trim().to_string()));
        }
    }
    assignments
}

/// Assignments in the live unit that the generator did not produce: unknown
/// keys, or known keys with operator-changed values. Deduplicated, order
/// preserved; these are the lines that must survive reinstallation.
pub fn custom_environment_lines(unit_text: &str) -> Vec<String> {
    let mut custom = Vec::new();
    for (key, value) in environment_assignments(unit_text) {
        if is_generator_default(&key, &value) {
            continue;
        }
        let line = format!("{key}={value}");
        if !custom.contains(&line) {
            custom.push(line);
        }
    }
    custom
}

/// Insert recorded custom assignments back into freshly generated unit text,
/// immediately after the last generated `Environment=` line, or after the
/// `[Service]` header when the generator emitted none. Generated lines pass
/// through byte-for-byte.
pub fn splice_custom_lines(generated: &str, custom: &[String]) -> Result<String> {
    if custom.is_empty() {
        return Ok(generated.to_string());
    }

    let lines: Vec<&str> = generated.lines().collect();
    let mut anchor = None;
    for (index, line) in lines.iter().enumerate() {
        if line.trim().starts_with("Environment=") {
            anchor = Some(index);
        }
    }
    if anchor.is_none() {
        anchor = lines
            .iter()
            .position(|line| line.trim() == "[Service]");
    }
    let anchor = anchor.ok_or_else(|| {
        anyhow!("generated unit has no Environment lines and no [Service] section")
    })?;

    let mut result = Vec::with_capacity(lines.len() + custom.len());
    for (index, line) in lines.iter().enumerate() {
        result.push((*line).to_string());
        if index == anchor {
            for assignment in custom {
                result.push(format!("Environment=\"{assignment}\""));
            }
        }
    }
    let mut text = result.join("\n");
    if generated.ends_with('\n') {
        text.push('\n');
    }
    Ok(text)
}
