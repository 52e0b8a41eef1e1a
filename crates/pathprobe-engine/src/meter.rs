//! Ownership of an external flow-meter subprocess.

use std::os::unix::process::ExitStatusExt;
use std::process::Command;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::error::EngineError;
use crate::probe::Probe;
use crate::spider::Shared;

/// How to invoke an external flow meter. The meter's own configuration is
/// written as YAML to a temporary directory and passed by path.
#[derive(Debug, Clone)]
pub struct MeterCommand {
    /// Meter executable.
    pub program: String,
    /// Capture source URI handed to the meter, opaque to the engine.
    pub interface_uri: String,
    /// Port the meter exports flow records to; must match the ingress
    /// listener.
    pub export_port: u16,
    /// Meter configuration, emitted verbatim as YAML.
    pub config: serde_yaml::Value,
    /// Run (and later kill) the meter under `sudo -n`; capturing from a
    /// raw interface usually needs elevated privileges.
    pub elevate: bool,
}

pub(crate) struct RunningMeter {
    pid: u32,
    elevate: bool,
}

pub(crate) fn owner_loop<P: Probe>(
    shared: &Shared<P>,
    cmd: &MeterCommand,
) -> Result<(), EngineError> {
    let confdir = tempfile::Builder::new().prefix("meter").tempdir()?;
    let confpath = confdir.path().join("meter.yaml");
    std::fs::write(&confpath, serde_yaml::to_string(&cmd.config)?)?;
    debug!("wrote meter configuration to {}", confpath.display());

    let mut command = if cmd.elevate {
        let mut c = Command::new("sudo");
        c.arg("-n").arg(&cmd.program);
        c
    } else {
        Command::new(&cmd.program)
    };
    command
        .arg("--yaml")
        .arg(&confpath)
        .arg("--verbose")
        .arg("--in")
        .arg(&cmd.interface_uri)
        .arg("--out")
        .arg("localhost")
        .arg("--ipfix")
        .arg("tcp")
        .arg("--ipfix-port")
        .arg(cmd.export_port.to_string());

    let mut child = command.spawn()?;
    debug!("started meter as pid {}", child.id());
    *shared.meter.lock().unwrap() = Some(RunningMeter {
        pid: child.id(),
        elevate: cmd.elevate,
    });

    let status = child.wait()?;
    shared.meter.lock().unwrap().take();
    debug!("meter terminated with {status}");

    match (status.code(), status.signal()) {
        (Some(0), _) => Ok(()),
        (Some(code), _) => Err(EngineError::MeterExit(code)),
        // SIGTERM is how the engine stops the meter
        (None, Some(15)) => Ok(()),
        (None, Some(signal)) => Err(EngineError::MeterSignal(signal)),
        (None, None) => Ok(()),
    }
}

/// Kill the running meter, if any. An elevated meter cannot be signalled
/// directly, so the kill goes through `sudo` as well.
pub(crate) fn stop_meter(slot: &Mutex<Option<RunningMeter>>) {
    let Some(meter) = slot.lock().unwrap().take() else {
        return;
    };
    debug!("killing meter pid {}", meter.pid);

    let status = if meter.elevate {
        Command::new("sudo")
            .arg("-n")
            .arg("kill")
            .arg(meter.pid.to_string())
            .status()
    } else {
        Command::new("kill").arg(meter.pid.to_string()).status()
    };

    if let Err(e) = status {
        warn!("failed to kill meter pid {}: {e}", meter.pid);
    }
}
