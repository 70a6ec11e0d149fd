use crate::command::{run, ToolOutput};
use crate::{DriverError, DriverPort};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::info;

/// Driver registration through `pnputil`.
pub struct PnpUtilDriver {
    pnputil: PathBuf,
}

impl PnpUtilDriver {
    pub fn new() -> Self {
        Self::with_program("pnputil")
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            pnputil: program.into(),
        }
    }

    fn check(output: ToolOutput) -> Result<ToolOutput, DriverError> {
        // 3010: success, reboot required.
        match output.code {
            Some(0) | Some(3010) => Ok(output),
            exit_code => Err(DriverError::Tool {
                exit_code,
                output: output.combined(),
            }),
        }
    }
}

impl Default for PnpUtilDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverPort for PnpUtilDriver {
    fn register(&mut self, package: &Path) -> Result<String, DriverError> {
        let output = run(
            &self.pnputil,
            [
                OsStr::new("/add-driver"),
                package.as_os_str(),
                OsStr::new("/install"),
            ],
        )?;
        let output = Self::check(output)?;
        let id = published_name(&output.stdout).ok_or(DriverError::MissingPublishedName)?;
        info!(?package, %id, "Driver package registered");
        Ok(id)
    }

    fn deregister(&mut self, id: &str) -> Result<(), DriverError> {
        let output = run(&self.pnputil, ["/delete-driver", id, "/uninstall", "/force"])?;
        Self::check(output)?;
        info!(%id, "Driver package removed");
        Ok(())
    }

    fn find_registered(&mut self, package: &Path) -> Result<Option<String>, DriverError> {
        let Some(original) = package.file_name().and_then(OsStr::to_str) else {
            return Ok(None);
        };
        let output = Self::check(run(&self.pnputil, ["/enum-drivers"])?)?;
        Ok(published_for(&output.stdout, original))
    }
}

/// In `/enum-drivers` output, the published name of the block whose
/// `Original Name:` is `original`.
fn published_for(stdout: &str, original: &str) -> Option<String> {
    let mut published: Option<&str> = None;
    for line in stdout.lines() {
        let Some((key, value)) = line.split_once(':') else {
            published = None;
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "published name" => published = Some(value.trim()),
            "original name" if value.trim().eq_ignore_ascii_case(original) => {
                return published.map(str::to_string);
            }
            _ => {}
        }
    }
    None
}

/// Pull `oemNN.inf` out of pnputil's `Published Name:` line.
fn published_name(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        let key = key.trim().to_ascii_lowercase();
        (key == "published name" || key == "driver package published name")
            .then(|| value.trim().to_string())
            .filter(|v| !v.is_empty())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn published_name_from_add_driver_output() {
        let stdout = "Microsoft PnP Utility\n\nAdding driver package:  MttVDD.inf\n\
                      Driver package added successfully.\nPublished Name:         oem42.inf\n";
        assert_eq!(published_name(stdout).as_deref(), Some("oem42.inf"));
    }

    #[test]
    fn no_published_name() {
        assert_eq!(published_name("Failed to add driver package"), None);
        assert_eq!(published_name("Published Name:   \n"), None);
    }

    #[test]
    fn enum_drivers_lookup_by_original_name() {
        let stdout = "Microsoft PnP Utility\r\n\r\n\
                      Published Name:     oem3.inf\r\nOriginal Name:      usbser.inf\r\n\
                      Provider Name:      Microsoft\r\n\r\n\
                      Published Name:     oem42.inf\r\nOriginal Name:      mttvdd.inf\r\n\
                      Class Name:         Display\r\n";
        assert_eq!(published_for(stdout, "MttVDD.inf").as_deref(), Some("oem42.inf"));
        assert_eq!(published_for(stdout, "usbser.inf").as_deref(), Some("oem3.inf"));
        assert_eq!(published_for(stdout, "other.inf"), None);
    }

    #[test]
    fn reboot_required_counts_as_success() {
        let out = ToolOutput {
            code: Some(3010),
            stdout: String::new(),
            stderr: String::new(),
        };
        assert!(PnpUtilDriver::check(out).is_ok());

        let out = ToolOutput {
            code: Some(5),
            stdout: "Access is denied.".into(),
            stderr: String::new(),
        };
        let err = PnpUtilDriver::check(out).unwrap_err();
        assert_eq!(err.exit_code(), Some(5));
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = PnpUtilDriver::with_program(dir.path().join("no-pnputil"));
        let err = driver.register(Path::new("driver.inf")).unwrap_err();
        assert!(matches!(err, DriverError::Spawn(_)));
    }
}
