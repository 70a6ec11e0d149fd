//! Thin wrapper over `std::process::Command` for the external tools.

use std::ffi::OsStr;
use std::io;
use std::process::Command;
use tracing::debug;

/// Captured result of one tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout and stderr joined, for error reports.
    pub fn combined(&self) -> String {
        let mut text = self.stdout.trim().to_string();
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(stderr);
        }
        text
    }
}

/// Run `program` to completion and capture its output.
pub fn run<P, I, S>(program: P, args: I) -> io::Result<ToolOutput>
where
    P: AsRef<OsStr>,
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program.as_ref());
    cmd.args(args);
    debug!(?cmd, "Running tool");
    let output = cmd.output()?;
    Ok(ToolOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Substitute `{name}` placeholders in each template argument.
pub fn expand_args(templates: &[String], vars: &[(&str, String)]) -> Vec<String> {
    templates
        .iter()
        .map(|template| {
            vars.iter().fold(template.clone(), |acc, (name, value)| {
                acc.replace(&format!("{{{name}}}"), value)
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_substituted() {
        let templates = vec!["/X:{width}".to_string(), "/R:{refresh}".into(), "/L".into()];
        let args = expand_args(
            &templates,
            &[("width", "1920".into()), ("refresh", "60".into())],
        );
        assert_eq!(args, vec!["/X:1920", "/R:60", "/L"]);
    }

    #[test]
    fn combined_output_skips_empty_streams() {
        let out = ToolOutput {
            code: Some(1),
            stdout: "  \n".into(),
            stderr: "access denied\n".into(),
        };
        assert_eq!(out.combined(), "access denied");
        assert!(!out.success());
    }
}
