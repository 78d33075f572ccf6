use super::{exit_status, json_pretty, EXIT_FAILURE};
use crate::signal::shutdown_requested;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use testbed_runtime::{
    check_container_prereqs, check_namespace_prereqs, format_missing, select_backend,
    Environment, EnvironmentGuard, Invocation, ProcessHandle, Sandbox,
};
use testbed_schema::{BackendKind, TestbedConfig};
use tracing::{info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct RunOptions {
    pub timeout: Option<u64>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<String>,
}

pub fn run(
    config: &TestbedConfig,
    command: &[String],
    options: &RunOptions,
    json_output: bool,
) -> Result<u8, String> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| "no command given".to_owned())?;
    let invocation = build_invocation(program, args, options)?;

    if std::env::var("TESTBED_SKIP_PREREQS").as_deref() != Ok("1") {
        check_prereqs(config)?;
    }

    let env = select_backend(config).map_err(|e| e.to_string())?;
    let mut env = EnvironmentGuard::acquire(env).map_err(|e| e.to_string())?;
    let handle = env.execute(invocation).map_err(|e| e.to_string())?;
    info!("{} started in {} environment", handle.id(), env.kind());

    let outcome = supervise(&mut env, &handle, options.timeout.map(Duration::from_secs));
    let report = env.finish();
    if !report.is_clean() {
        warn!("teardown finished with {} error(s)", report.errors.len());
    }
    let code = outcome?;

    if json_output {
        let json = serde_json::json!({
            "process": handle.name(),
            "state": handle.state(),
            "exit_code": code,
            "stdout": handle.stdout_lossy(),
            "stderr": handle.stderr_lossy(),
        });
        println!("{}", json_pretty(&json)?);
    }
    Ok(exit_status(code))
}

fn build_invocation(
    program: &str,
    args: &[String],
    options: &RunOptions,
) -> Result<Invocation, String> {
    let mut invocation = Invocation::new(program).args(args);
    if let Some(cwd) = &options.cwd {
        invocation = invocation.cwd(cwd);
    }
    for pair in &options.env {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("invalid --env '{pair}', expected KEY=VALUE"))?;
        invocation = invocation.env(key, value);
    }
    Ok(invocation)
}

fn check_prereqs(config: &TestbedConfig) -> Result<(), String> {
    let missing = match config.environment.backend {
        BackendKind::Namespace => config
            .namespace
            .as_ref()
            .map(|ns| check_namespace_prereqs(&ns.tool))
            .unwrap_or_default(),
        BackendKind::Container => config
            .container
            .as_ref()
            .map(|ct| check_container_prereqs(&ct.engine))
            .unwrap_or_default(),
        BackendKind::None => Vec::new(),
    };
    if missing.is_empty() {
        Ok(())
    } else {
        Err(format!("missing prerequisites: {}", format_missing(&missing)))
    }
}

/// Poll until the process finishes, stopping it on interrupt or when the
/// run timeout expires.
fn supervise(
    env: &mut EnvironmentGuard<Sandbox>,
    handle: &ProcessHandle,
    timeout: Option<Duration>,
) -> Result<i32, String> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        if !env.is_process_running(handle) {
            return handle
                .exit_code()
                .ok_or_else(|| format!("{} finished without an exit code", handle.id()));
        }
        let expired = deadline.is_some_and(|d| Instant::now() >= d);
        if shutdown_requested() || expired {
            if expired {
                warn!("{} still running after run timeout, stopping it", handle.id());
            }
            let stop_timeout = env.default_stop_timeout();
            let code = env
                .stop_process(handle, stop_timeout)
                .map_err(|e| e.to_string())?;
            // An interrupted or timed-out run never reports success.
            return Ok(if code == 0 { EXIT_FAILURE.into() } else { code });
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(env: &[&str]) -> RunOptions {
        RunOptions {
            timeout: None,
            cwd: Some(PathBuf::from("/opt/app")),
            env: env.iter().map(|s| (*s).to_owned()).collect(),
        }
    }

    #[test]
    fn invocation_from_flags() {
        let inv = build_invocation(
            "/opt/app/bin/ecu",
            &["--port".to_owned(), "3490".to_owned()],
            &options(&["ECU_VARIANT=b2", "EMPTY="]),
        )
        .unwrap();
        assert_eq!(inv.arguments(), ["--port", "3490"]);
        assert_eq!(inv.working_directory(), Some(std::path::Path::new("/opt/app")));
        assert_eq!(inv.environment()["ECU_VARIANT"], "b2");
        assert_eq!(inv.environment()["EMPTY"], "");
    }

    #[test]
    fn malformed_env_is_rejected() {
        let err = build_invocation("/bin/true", &[], &options(&["NOVALUE"])).unwrap_err();
        assert!(err.contains("KEY=VALUE"));
    }

    #[test]
    fn direct_backend_needs_no_prereqs() {
        let config = TestbedConfig::for_backend(BackendKind::None);
        assert!(check_prereqs(&config).is_ok());
    }
}
