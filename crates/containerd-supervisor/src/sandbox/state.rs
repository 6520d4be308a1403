use std::fmt;

use crate::sandbox::{Error, Result};

/// Lifecycle of a single supervised process.
///
/// `Unknown` only exists while waiting for the shim to report a pid.
/// Nothing leaves `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessStatus {
    #[default]
    Unknown,
    Created,
    Running,
    Stopped,
}

impl ProcessStatus {
    pub fn transition(&mut self, to: ProcessStatus) -> Result<()> {
        use ProcessStatus::*;
        let allowed = match (*self, to) {
            (from, to) if from == to => true,
            (Stopped, _) => false,
            (_, Unknown) => false,
            (Running, Created) => false,
            _ => true,
        };
        if !allowed {
            return Err(Error::FailedPrecondition(format!(
                "cannot transition process from {self} to {to}"
            )));
        }
        *self = to;
        Ok(())
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessStatus::Unknown => "unknown",
            ProcessStatus::Created => "created",
            ProcessStatus::Running => "running",
            ProcessStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Stopped,
}

impl ContainerStatus {
    pub fn start(&mut self) -> Result<()> {
        self.expect(ContainerStatus::Created, "start")?;
        *self = ContainerStatus::Running;
        Ok(())
    }

    pub fn pause(&mut self) -> Result<()> {
        self.expect(ContainerStatus::Running, "pause")?;
        *self = ContainerStatus::Paused;
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        self.expect(ContainerStatus::Paused, "resume")?;
        *self = ContainerStatus::Running;
        Ok(())
    }

    fn expect(&self, required: ContainerStatus, op: &str) -> Result<()> {
        if *self != required {
            return Err(Error::FailedPrecondition(format!(
                "cannot {op} a container in the '{self}' state"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_happy_path() {
        let mut status = ProcessStatus::default();
        status.transition(ProcessStatus::Created).unwrap();
        status.transition(ProcessStatus::Running).unwrap();
        status.transition(ProcessStatus::Stopped).unwrap();
        assert_eq!(status, ProcessStatus::Stopped);
    }

    #[test]
    fn process_stopped_is_terminal() {
        let mut status = ProcessStatus::Stopped;
        for to in [
            ProcessStatus::Unknown,
            ProcessStatus::Created,
            ProcessStatus::Running,
        ] {
            assert!(matches!(
                status.transition(to),
                Err(Error::FailedPrecondition(_))
            ));
        }
        status.transition(ProcessStatus::Stopped).unwrap();
        assert_eq!(status, ProcessStatus::Stopped);
    }

    #[test]
    fn process_no_regression() {
        let mut status = ProcessStatus::Running;
        assert!(status.transition(ProcessStatus::Created).is_err());
        assert!(status.transition(ProcessStatus::Unknown).is_err());
        assert_eq!(status, ProcessStatus::Running);
    }

    #[test]
    fn container_transitions() {
        let mut status = ContainerStatus::Created;
        assert!(status.pause().is_err());
        status.start().unwrap();
        assert!(status.start().is_err());
        status.pause().unwrap();
        assert_eq!(status, ContainerStatus::Paused);
        status.resume().unwrap();
        assert_eq!(status, ContainerStatus::Running);

        let mut stopped = ContainerStatus::Stopped;
        let err = stopped.resume().unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot resume a container in the 'stopped' state"
        );
    }
}
