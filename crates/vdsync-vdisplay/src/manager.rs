use crate::command::{expand_args, run, ToolOutput};
use crate::{parse_mode_line, Availability, DisplayError, DisplayPort, Mode};
use std::path::PathBuf;
use tracing::{info, warn};

/// Argument templates for the resolution tool.
#[derive(Debug, Clone)]
pub struct ToolCommands {
    pub list_modes: Vec<String>,
    pub current_mode: Vec<String>,
    pub set_mode: Vec<String>,
}

/// Display mode control through an external resolution tool.
///
/// The tool is fetched at session start; when it is absent every query
/// answers `NotAvailable` instead of failing.
pub struct ToolDisplay {
    tool: PathBuf,
    commands: ToolCommands,
}

impl ToolDisplay {
    pub fn new(tool: impl Into<PathBuf>, commands: ToolCommands) -> Self {
        Self {
            tool: tool.into(),
            commands,
        }
    }

    fn invoke(&self, templates: &[String], vars: &[(&str, String)]) -> Result<Option<ToolOutput>, DisplayError> {
        if !self.tool.is_file() {
            warn!(tool = ?self.tool, "Resolution tool missing");
            return Ok(None);
        }
        let output = run(&self.tool, expand_args(templates, vars))?;
        if !output.success() {
            return Err(DisplayError::Tool {
                code: output.code,
                stderr: output.combined(),
            });
        }
        Ok(Some(output))
    }

    fn missing(&self) -> String {
        format!("resolution tool {} not present", self.tool.display())
    }
}

impl DisplayPort for ToolDisplay {
    fn supported_modes(&mut self, display_id: &str) -> Result<Availability<Vec<Mode>>, DisplayError> {
        let vars = [("display", display_id.to_string())];
        let Some(output) = self.invoke(&self.commands.list_modes, &vars)? else {
            return Ok(Availability::not_available(self.missing()));
        };
        let mut modes: Vec<Mode> = output.stdout.lines().filter_map(parse_mode_line).collect();
        modes.sort();
        modes.dedup();
        info!(display = display_id, count = modes.len(), "Enumerated display modes");
        Ok(Availability::Available(modes))
    }

    fn current_mode(&mut self, display_id: &str) -> Result<Availability<Mode>, DisplayError> {
        let vars = [("display", display_id.to_string())];
        let Some(output) = self.invoke(&self.commands.current_mode, &vars)? else {
            return Ok(Availability::not_available(self.missing()));
        };
        output
            .stdout
            .lines()
            .find_map(parse_mode_line)
            .map(Availability::Available)
            .ok_or(DisplayError::UnrecognisedOutput)
    }

    fn apply_mode(&mut self, display_id: &str, mode: Mode) -> Result<Availability<()>, DisplayError> {
        let vars = [
            ("display", display_id.to_string()),
            ("width", mode.width.to_string()),
            ("height", mode.height.to_string()),
            ("refresh", mode.refresh_hz.to_string()),
        ];
        match self.invoke(&self.commands.set_mode, &vars)? {
            Some(_) => {
                info!(display = display_id, %mode, "Display mode applied");
                Ok(Availability::Available(()))
            }
            None => Ok(Availability::not_available(self.missing())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commands() -> ToolCommands {
        ToolCommands {
            list_modes: vec!["/L".into()],
            current_mode: vec!["/S".into()],
            set_mode: vec!["/X:{width}".into()],
        }
    }

    #[test]
    fn missing_tool_is_not_available() {
        let dir = tempfile::tempdir().unwrap();
        let mut display = ToolDisplay::new(dir.path().join("QRes.exe"), commands());
        assert!(matches!(
            display.supported_modes("oem1.inf").unwrap(),
            Availability::NotAvailable { .. }
        ));
        assert!(matches!(
            display.current_mode("oem1.inf").unwrap(),
            Availability::NotAvailable { .. }
        ));
        assert!(matches!(
            display.apply_mode("oem1.inf", Mode::new(1920, 1080, 60)).unwrap(),
            Availability::NotAvailable { .. }
        ));
    }

    #[cfg(unix)]
    #[test]
    fn modes_are_parsed_from_tool_output() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("qres");
        std::fs::write(
            &tool,
            "#!/bin/sh\necho 'QRes v1.1'\necho '1920x1080, 32 bits @ 60 Hz.'\n\
             echo '1920x1080, 32 bits @ 60 Hz.'\necho '1280x720, 32 bits @ 30 Hz.'\n",
        )
        .unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut display = ToolDisplay::new(&tool, commands());
        let modes = display.supported_modes("d").unwrap().available().unwrap();
        assert_eq!(modes, vec![Mode::new(1280, 720, 30), Mode::new(1920, 1080, 60)]);
        let current = display.current_mode("d").unwrap().available().unwrap();
        assert_eq!(current, Mode::new(1920, 1080, 60));
        assert!(matches!(
            display.apply_mode("d", Mode::new(1280, 720, 30)).unwrap(),
            Availability::Available(())
        ));
    }
}
