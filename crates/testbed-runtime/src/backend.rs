use crate::container::ContainerBackend;
use crate::direct::DirectBackend;
use crate::environment::Sandbox;
use crate::namespace::NamespaceBackend;
use crate::workspace::Workspace;
use crate::RuntimeError;
use std::time::Duration;
use testbed_schema::{BackendKind, ConfigError, TestbedConfig};
use tracing::debug;

/// Build the one backend `config` selects. Nothing is started yet; call
/// `setup()` (or acquire an `EnvironmentGuard`) next.
pub fn select_backend(config: &TestbedConfig) -> Result<Sandbox, RuntimeError> {
    config.validate()?;
    let workspace = Workspace::resolve(config.environment.workspace.as_deref())?;
    let stop_timeout = Duration::from_secs(config.environment.stop_timeout_secs);
    let line_buffer = config.environment.line_buffer.clone();
    debug!(
        "selected {} backend, workspace {}",
        config.environment.backend,
        workspace.root().display()
    );

    match config.environment.backend {
        BackendKind::Namespace => {
            let section = config
                .namespace
                .clone()
                .ok_or_else(|| ConfigError::MissingSection("namespace".to_owned()))?;
            Ok(Sandbox::Namespace(
                NamespaceBackend::new(section, workspace, stop_timeout)
                    .with_line_buffer(line_buffer),
            ))
        }
        BackendKind::Container => {
            let section = config
                .container
                .clone()
                .ok_or_else(|| ConfigError::MissingSection("container".to_owned()))?;
            Ok(Sandbox::Container(
                ContainerBackend::new(section, workspace, stop_timeout)
                    .with_line_buffer(line_buffer),
            ))
        }
        BackendKind::None => Ok(Sandbox::Direct(
            DirectBackend::new(workspace, stop_timeout).with_line_buffer(line_buffer),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Environment;
    use crate::lifecycle::EnvState;
    use testbed_schema::parse_config_str;

    #[test]
    fn select_valid_backends() {
        let none = TestbedConfig::for_backend(BackendKind::None);
        let env = select_backend(&none).unwrap();
        assert_eq!(env.kind(), BackendKind::None);
        assert_eq!(env.state(), EnvState::Uninitialized);

        let ns = parse_config_str(
            "[environment]\nbackend = \"namespace\"\n[namespace]\nsysroot = \"/srv/sysroot\"\n",
        )
        .unwrap();
        assert_eq!(select_backend(&ns).unwrap().kind(), BackendKind::Namespace);

        let ct = parse_config_str(
            "[environment]\nbackend = \"container\"\n[container]\nimage = \"alpine:3\"\n",
        )
        .unwrap();
        let env = select_backend(&ct).unwrap();
        assert_eq!(env.kind(), BackendKind::Container);
        assert!(env.is_isolated());
    }

    #[test]
    fn missing_section_is_config_error() {
        let config = TestbedConfig::for_backend(BackendKind::Container);
        assert!(matches!(
            select_backend(&config),
            Err(RuntimeError::Config(ConfigError::MissingSection(_)))
        ));
    }

    #[test]
    fn stop_timeout_and_workspace_come_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = TestbedConfig::for_backend(BackendKind::None);
        config.environment.workspace = Some(dir.path().join("ws"));
        config.environment.stop_timeout_secs = 3;
        let env = select_backend(&config).unwrap();
        assert_eq!(env.default_stop_timeout(), Duration::from_secs(3));
        assert!(env.workspace_root().ends_with("ws"));
    }

    #[test]
    fn line_buffer_prefix_comes_from_config() {
        let mut config = TestbedConfig::for_backend(BackendKind::None);
        config.environment.line_buffer =
            vec!["/usr/bin/env".to_owned(), "LINE_TOOL=wrapped".to_owned()];
        let mut env = select_backend(&config).unwrap();
        env.setup().unwrap();
        let handle = env
            .execute(crate::Invocation::new("/bin/sh").args(["-c", "echo $LINE_TOOL"]))
            .unwrap();
        assert_eq!(env.wait(&handle, Duration::from_secs(10)), Some(0));
        assert_eq!(handle.stdout_lossy(), "wrapped\n");
        assert!(env.teardown().is_clean());
    }
}
