use std::{process::Child, time::Duration};

use anyhow::{self, bail, Context};
use tracing::warn;

use super::{create_process, ChildOutput, ProcessLimits};

#[derive(Debug)]
pub struct LimitedProcess {
    pub child: Child,
    cleaned_up: bool,
}

impl LimitedProcess {
    pub fn launch(
        _command: &str,
        _args: &[String],
        _limits: &ProcessLimits,
        _stdout: ChildOutput,
        _stderr: ChildOutput,
    ) -> anyhow::Result<LimitedProcess> {
        bail!("cgroups only available on linux")
    }

    pub fn launch_without_container(
        command: &str,
        args: &[String],
        stdout: ChildOutput,
        stderr: ChildOutput,
    ) -> anyhow::Result<LimitedProcess> {
        let child = create_process(command, args, stdout, stderr)
            .context("could not create process")?;

        Ok(LimitedProcess {
            child,
            cleaned_up: false,
        })
    }

    pub fn is_contained(&self) -> bool {
        false
    }

    pub fn try_kill(&mut self, _max_duration: Duration) -> anyhow::Result<()> {
        if self.cleaned_up {
            return Ok(());
        }
        if self.child.try_wait().context("could not poll process")?.is_none() {
            self.child.kill().context("could not kill process")?;
        }
        let _ = self.child.wait();
        self.cleaned_up = true;
        Ok(())
    }
}

impl Drop for LimitedProcess {
    fn drop(&mut self) {
        if !self.cleaned_up {
            if let Err(e) = self.try_kill(Duration::from_millis(100)) {
                warn!("could not clean up process {}: {e:#}", self.child.id());
            }
        }
    }
}
