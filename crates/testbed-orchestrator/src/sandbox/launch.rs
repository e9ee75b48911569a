//! Bringing a declared sandbox up on a fabric.

use tokio::time::timeout;
use tracing::{debug, info};

use super::Sandbox;
use crate::error::RuntimeError;
use crate::fabric::Fabric;
use crate::readiness::ReadinessProbe;
use crate::runtime::{RuntimeResult, SandboxRuntime};

/// Launches `sandbox` on `fabric` and blocks until `probe` is satisfied.
///
/// The probe's timeout bounds the whole launch, image pull included. The
/// container id is recorded as soon as the platform hands it out, so a
/// sandbox that fails later can still be inspected and stopped. On failure
/// the sandbox is left `Failed`.
pub(crate) async fn launch(
    runtime: &dyn SandboxRuntime,
    sandbox: &mut Sandbox,
    fabric: &Fabric,
    probe: &ReadinessProbe,
) -> RuntimeResult<()> {
    let deadline = probe.timeout();
    let outcome = timeout(deadline, bring_up(runtime, sandbox, fabric, probe)).await;
    let result = match outcome {
        Ok(result) => result,
        Err(_) => Err(RuntimeError::timeout(
            format!("{} sandbox {} to start", sandbox.role(), sandbox.name()),
            deadline.as_secs(),
        )),
    };
    if let Err(e) = &result {
        sandbox.mark_failed(e.to_string());
    }
    result
}

async fn bring_up(
    runtime: &dyn SandboxRuntime,
    sandbox: &mut Sandbox,
    fabric: &Fabric,
    probe: &ReadinessProbe,
) -> RuntimeResult<()> {
    runtime.ensure_image(sandbox.image()).await?;

    let spec = sandbox.container_spec(Some(fabric.name()));
    let id = runtime.create_container(&spec).await?;
    sandbox.launched(id.clone());

    runtime.start_container(&id).await?;
    debug!(
        role = %sandbox.role(),
        container = %sandbox.name(),
        pattern = %probe.pattern(),
        timeout_secs = probe.timeout().as_secs(),
        "Waiting for readiness marker"
    );

    probe.wait(&id, runtime.follow_logs(&id)).await?;

    let ports = runtime.port_mappings(&id).await?;
    if let Some(missing) = sandbox
        .internal_ports()
        .iter()
        .find(|port| !ports.contains_key(port))
    {
        return Err(RuntimeError::platform(format!(
            "container {} has no host port for {}/tcp",
            id, missing
        )));
    }

    sandbox.mark_running(ports);
    info!(role = %sandbox.role(), container = %sandbox.name(), "Sandbox running");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::fabric::NetworkFabric;
    use crate::sandbox::{ImageRef, SandboxRole, SandboxState};
    use crate::testing::MockRuntime;
    use std::time::Duration;

    fn service() -> Sandbox {
        Sandbox::new(SandboxRole::Service, ImageRef::new("svc:latest"), "svc-1").with_port(3000)
    }

    fn probe() -> ReadinessProbe {
        ReadinessProbe::new("ready", Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_launch_records_ports() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.script_output("svc:latest", &["ready\n"], false);
        let fabric = NetworkFabric::new(runtime.clone())
            .create("net", "run")
            .await
            .unwrap();

        let mut sandbox = service();
        launch(runtime.as_ref(), &mut sandbox, &fabric, &probe())
            .await
            .unwrap();

        assert!(sandbox.is_running());
        let port = sandbox.host_port(3000).unwrap();
        assert_ne!(port, 3000);
    }

    #[tokio::test]
    async fn test_start_failure_keeps_container_id() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.fail_start("svc:latest", "exec format error");
        let fabric = NetworkFabric::new(runtime.clone())
            .create("net", "run")
            .await
            .unwrap();

        let mut sandbox = service();
        let err = launch(runtime.as_ref(), &mut sandbox, &fabric, &probe())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("exec format error"));
        assert!(sandbox.container_id().is_some());
        assert!(matches!(sandbox.state(), SandboxState::Failed { .. }));
        assert_eq!(sandbox.host_port(3000), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_pull_times_out() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.hang_pull("svc:latest");
        let fabric = NetworkFabric::new(runtime.clone())
            .create("net", "run")
            .await
            .unwrap();

        let mut sandbox = service();
        let err = launch(runtime.as_ref(), &mut sandbox, &fabric, &probe())
            .await
            .unwrap_err();

        assert!(matches!(err, RuntimeError::Timeout { secs: 5, .. }));
        assert!(err.to_string().contains("svc-1"));
        assert!(matches!(sandbox.state(), SandboxState::Failed { .. }));
        assert!(sandbox.container_id().is_none());
        assert_eq!(runtime.container_count(), 0);
    }

    #[tokio::test]
    async fn test_exit_before_marker_fails() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.script_output("svc:latest", &["panic: no database\n"], true);
        let fabric = NetworkFabric::new(runtime.clone())
            .create("net", "run")
            .await
            .unwrap();

        let mut sandbox = service();
        let err = launch(runtime.as_ref(), &mut sandbox, &fabric, &probe())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::StreamEnded { .. }));
    }
}
