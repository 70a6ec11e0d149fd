use crate::retry::RetryPolicy;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::info;
use vdsync_vdisplay::command::{run, ToolOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Running,
    Stopped,
    /// Start/stop/pause pending, or paused.
    Transitioning,
    /// No such service is installed.
    Missing,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service tool failed to start: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("{action} {service} failed with code {code:?}: {output}")]
    Command {
        action: &'static str,
        service: String,
        code: Option<i32>,
        output: String,
    },
    #[error("{service} did not reach {target:?} within {waited:?} (last seen {last:?})")]
    Timeout {
        service: String,
        target: ServiceState,
        last: ServiceState,
        waited: Duration,
    },
}

/// Trait for controlling the streaming server's OS service.
pub trait ServicePort: Send {
    fn query(&mut self, name: &str) -> Result<ServiceState, ServiceError>;
    /// Ask the service to stop. Stopping a stopped service is not an error.
    fn stop(&mut self, name: &str) -> Result<(), ServiceError>;
    /// Ask the service to start. Starting a running service is not an error.
    fn start(&mut self, name: &str) -> Result<(), ServiceError>;
}

/// Poll until `name` reports `target`, within `policy`'s attempts.
pub fn wait_for_state(
    port: &mut dyn ServicePort,
    name: &str,
    target: ServiceState,
    policy: &RetryPolicy,
) -> Result<(), ServiceError> {
    let reached = policy.run("service state", |_| {
        let last = port.query(name)?;
        if last == target {
            Ok(())
        } else {
            Err(ServiceError::Timeout {
                service: name.to_string(),
                target,
                last,
                waited: policy.delay * policy.max_attempts,
            })
        }
    });
    if reached.is_ok() {
        info!(service = name, state = ?target, "Service reached state");
    }
    reached
}

// sc.exe / Win32 error codes.
const ERROR_SERVICE_ALREADY_RUNNING: i32 = 1056;
const ERROR_SERVICE_DOES_NOT_EXIST: i32 = 1060;
const ERROR_SERVICE_NOT_ACTIVE: i32 = 1062;

/// Service control through `sc.exe`.
pub struct ScService {
    sc: PathBuf,
}

impl ScService {
    pub fn new() -> Self {
        Self::with_program("sc")
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self { sc: program.into() }
    }

    fn control(&self, action: &'static str, name: &str, benign: i32) -> Result<(), ServiceError> {
        let output = run(&self.sc, [action, name])?;
        match output.code {
            Some(0) => {
                info!(service = name, action, "Service control sent");
                Ok(())
            }
            Some(code) if code == benign => Ok(()),
            code => Err(command_error(action, name, code, &output)),
        }
    }
}

impl Default for ScService {
    fn default() -> Self {
        Self::new()
    }
}

impl ServicePort for ScService {
    fn query(&mut self, name: &str) -> Result<ServiceState, ServiceError> {
        let output = run(&self.sc, ["query", name])?;
        match output.code {
            Some(0) => parse_sc_state(&output.stdout)
                .ok_or_else(|| command_error("query", name, output.code, &output)),
            Some(ERROR_SERVICE_DOES_NOT_EXIST) => Ok(ServiceState::Missing),
            code => Err(command_error("query", name, code, &output)),
        }
    }

    fn stop(&mut self, name: &str) -> Result<(), ServiceError> {
        self.control("stop", name, ERROR_SERVICE_NOT_ACTIVE)
    }

    fn start(&mut self, name: &str) -> Result<(), ServiceError> {
        self.control("start", name, ERROR_SERVICE_ALREADY_RUNNING)
    }
}

fn command_error(action: &'static str, name: &str, code: Option<i32>, output: &ToolOutput) -> ServiceError {
    ServiceError::Command {
        action,
        service: name.to_string(),
        code,
        output: output.combined(),
    }
}

/// Read the `STATE : 4  RUNNING` line of `sc query` output.
fn parse_sc_state(stdout: &str) -> Option<ServiceState> {
    let line = stdout
        .lines()
        .find(|l| l.trim_start().to_ascii_uppercase().starts_with("STATE"))?;
    let (_, rest) = line.split_once(':')?;
    let code: u32 = rest.split_whitespace().next()?.parse().ok()?;
    Some(match code {
        1 => ServiceState::Stopped,
        4 => ServiceState::Running,
        _ => ServiceState::Transitioning,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUNNING: &str = "\nSERVICE_NAME: SunshineService\n        TYPE               : 10  WIN32_OWN_PROCESS\n        STATE              : 4  RUNNING\n                                (STOPPABLE, NOT_PAUSABLE, ACCEPTS_SHUTDOWN)\n        WIN32_EXIT_CODE    : 0  (0x0)\n";

    #[test]
    fn parse_states() {
        assert_eq!(parse_sc_state(RUNNING), Some(ServiceState::Running));
        assert_eq!(
            parse_sc_state(&RUNNING.replace("4  RUNNING", "1  STOPPED")),
            Some(ServiceState::Stopped)
        );
        assert_eq!(
            parse_sc_state(&RUNNING.replace("4  RUNNING", "3  STOP_PENDING")),
            Some(ServiceState::Transitioning)
        );
        assert_eq!(parse_sc_state("garbage"), None);
    }

    struct Flipping {
        queries_until_stopped: u32,
    }

    impl ServicePort for Flipping {
        fn query(&mut self, _: &str) -> Result<ServiceState, ServiceError> {
            if self.queries_until_stopped == 0 {
                Ok(ServiceState::Stopped)
            } else {
                self.queries_until_stopped -= 1;
                Ok(ServiceState::Transitioning)
            }
        }
        fn stop(&mut self, _: &str) -> Result<(), ServiceError> {
            Ok(())
        }
        fn start(&mut self, _: &str) -> Result<(), ServiceError> {
            Ok(())
        }
    }

    #[test]
    fn wait_succeeds_once_state_is_reached() {
        let mut port = Flipping {
            queries_until_stopped: 2,
        };
        let policy = RetryPolicy::fixed(5, Duration::ZERO);
        wait_for_state(&mut port, "svc", ServiceState::Stopped, &policy).unwrap();
    }

    #[test]
    fn wait_times_out() {
        let mut port = Flipping {
            queries_until_stopped: 10,
        };
        let policy = RetryPolicy::fixed(3, Duration::ZERO);
        let err = wait_for_state(&mut port, "svc", ServiceState::Stopped, &policy).unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Timeout {
                last: ServiceState::Transitioning,
                ..
            }
        ));
    }
}
