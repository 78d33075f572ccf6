use crate::RuntimeError;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

/// Host directory that receives undeclared test outputs.
///
/// Either a caller-supplied path (created if missing, never deleted) or a
/// fresh temporary directory removed when the workspace is dropped.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    temp: Option<TempDir>,
}

impl Workspace {
    pub fn resolve(path: Option<&Path>) -> Result<Self, RuntimeError> {
        match path {
            Some(p) => {
                fs::create_dir_all(p).map_err(|e| {
                    RuntimeError::Setup(format!("cannot create workspace {}: {e}", p.display()))
                })?;
                let root = p.canonicalize()?;
                debug!("workspace: {}", root.display());
                Ok(Self { root, temp: None })
            }
            None => {
                let temp = tempfile::Builder::new()
                    .prefix("testbed-")
                    .tempdir()
                    .map_err(|e| {
                        RuntimeError::Setup(format!("cannot create temporary workspace: {e}"))
                    })?;
                let root = temp.path().to_path_buf();
                debug!("temporary workspace: {}", root.display());
                Ok(Self {
                    root,
                    temp: Some(temp),
                })
            }
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_temporary(&self) -> bool {
        self.temp.is_some()
    }

    /// Private bookkeeping directory inside the workspace.
    pub(crate) fn state_dir(&self) -> Result<PathBuf, RuntimeError> {
        let dir = self.root.join(".testbed");
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_workspace_is_created_and_kept() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("ws");
        {
            let ws = Workspace::resolve(Some(&target)).unwrap();
            assert!(ws.root().is_dir());
            assert!(!ws.is_temporary());
        }
        assert!(target.is_dir());
    }

    #[test]
    fn temporary_workspace_is_removed_on_drop() {
        let ws = Workspace::resolve(None).unwrap();
        let root = ws.root().to_path_buf();
        assert!(ws.is_temporary());
        assert!(root.is_dir());
        let state = ws.state_dir().unwrap();
        assert!(state.starts_with(&root));
        drop(ws);
        assert!(!root.exists());
    }
}
