//! Executable run requests and interpreters.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Options of a run request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Working directory. Defaults to the executable's directory.
    pub cwd: Option<PathBuf>,

    /// Variables merged over the host's environment.
    pub env: HashMap<String, String>,

    /// Ask for (or wait on) deployment before launching.
    pub suggest_deploy: bool,
}

/// A request to launch an executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunParameters {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub options: RunOptions,
}

impl RunParameters {
    pub fn new(executable: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            executable: executable.into(),
            args,
            options: RunOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.options.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.env.insert(key.into(), value.into());
        self
    }

    pub fn suggest_deploy(mut self) -> Self {
        self.options.suggest_deploy = true;
        self
    }

    /// Interpreter key of the executable, if it has an extension.
    pub fn interpreter_key(&self) -> Option<String> {
        interpreter_key_for(&self.executable)
    }

    /// Working directory the process will be started in.
    pub fn working_dir(&self) -> PathBuf {
        match &self.options.cwd {
            Some(cwd) => cwd.clone(),
            None => self
                .executable
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
        }
    }
}

/// Rewrites a run request before it is launched, e.g. to start a script
/// through its interpreter.
pub type Interpreter = Arc<dyn Fn(RunParameters) -> RunParameters + Send + Sync>;

/// Normalize a file extension for interpreter lookup.
///
/// `".PY"`, `"py"` and `"Py"` all map to `"py"`.
pub fn normalize_extension(extension: &str) -> String {
    extension.trim_start_matches('.').to_lowercase()
}

/// Interpreter key of a path.
pub fn interpreter_key_for(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(normalize_extension)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpreter_key_is_case_insensitive() {
        assert_eq!(normalize_extension(".PY"), "py");
        assert_eq!(normalize_extension("jar"), "jar");

        let params = RunParameters::new("/tools/Script.Py", vec![]);
        assert_eq!(params.interpreter_key().as_deref(), Some("py"));

        let params = RunParameters::new("/tools/launcher", vec![]);
        assert_eq!(params.interpreter_key(), None);
    }

    #[test]
    fn test_working_dir_defaults_to_executable_dir() {
        let params = RunParameters::new("/games/skyrim/skse_loader.exe", vec![]);
        assert_eq!(params.working_dir(), PathBuf::from("/games/skyrim"));

        let params = params.with_cwd("/tmp");
        assert_eq!(params.working_dir(), PathBuf::from("/tmp"));
    }
}
