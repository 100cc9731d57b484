//! Loaders describe how to locate and launch one kind of program.
//!
//! Every program start builds a fresh loader through [`LoaderKind::create`]
//! and initialises it from the program's path and options, so no two
//! consoles ever share loader state.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// How to launch one kind of external program.
pub trait Loader: Send + Sync + fmt::Debug {
    /// Loader kind name as advertised to clients.
    fn name(&self) -> &'static str;

    /// Resolve and validate the launch parameters.
    fn init(&mut self, path: &Path, options: &HashMap<String, String>) -> Result<()>;

    /// Executable and argument vector.
    fn cmd(&self) -> (PathBuf, Vec<String>);

    /// Working directory for the process.
    fn path(&self) -> &Path;
}

/// Factory for the loaders this build knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderKind {
    Exec,
    Pmmp,
}

impl LoaderKind {
    pub const ALL: [LoaderKind; 2] = [LoaderKind::Exec, LoaderKind::Pmmp];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(name))
    }

    pub fn name(self) -> &'static str {
        match self {
            LoaderKind::Exec => "exec",
            LoaderKind::Pmmp => "pmmp",
        }
    }

    /// A fresh, uninitialised loader of this kind.
    pub fn create(self) -> Box<dyn Loader> {
        match self {
            LoaderKind::Exec => Box::new(ExecLoader::default()),
            LoaderKind::Pmmp => Box::new(PmmpLoader::default()),
        }
    }
}

/// Absolute form of `path`, resolved against the current directory.
fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path)
        .map_err(|e| Error::Loader(format!("Cannot resolve {}: {e}", path.display())))
}

fn split_args(options: &HashMap<String, String>) -> Option<Vec<String>> {
    options
        .get("args")
        .map(|args| args.split_whitespace().map(str::to_owned).collect())
}

/// Runs an arbitrary executable.
///
/// Options:
/// - `program` (required): executable; relative paths resolve against the
///   working directory, bare names are looked up on `PATH` at launch
/// - `args`: whitespace-separated argument list
#[derive(Debug, Default, Clone)]
pub struct ExecLoader {
    path: PathBuf,
    program: PathBuf,
    args: Vec<String>,
}

impl Loader for ExecLoader {
    fn name(&self) -> &'static str {
        LoaderKind::Exec.name()
    }

    fn init(&mut self, path: &Path, options: &HashMap<String, String>) -> Result<()> {
        self.path = absolute(path)?;
        if !self.path.is_dir() {
            return Err(Error::Loader(format!(
                "Working directory does not exist: {}",
                self.path.display()
            )));
        }

        let program = options
            .get("program")
            .ok_or_else(|| Error::Loader("exec loader requires a 'program' option".into()))?;
        let program = PathBuf::from(program);

        self.program = if program.components().count() > 1 {
            let resolved = self.path.join(&program);
            if !resolved.is_file() {
                return Err(Error::Loader(format!(
                    "Couldn't find program: {}",
                    resolved.display()
                )));
            }
            resolved
        } else {
            program
        };

        self.args = split_args(options).unwrap_or_default();
        Ok(())
    }

    fn cmd(&self) -> (PathBuf, Vec<String>) {
        (self.program.clone(), self.args.clone())
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// Runs a PocketMine-MP server through its bundled PHP binary.
///
/// Options:
/// - `php`: PHP executable (default `<path>/bin/php/php`)
/// - `main`: entry script (default `src/pocketmine/PocketMine.php` when it
///   exists, otherwise `PocketMine-MP.phar`)
/// - `args`: arguments placed before the entry script (default `-c bin/php`)
#[derive(Debug, Default, Clone)]
pub struct PmmpLoader {
    path: PathBuf,
    php: PathBuf,
    main: PathBuf,
    args: Vec<String>,
}

impl Loader for PmmpLoader {
    fn name(&self) -> &'static str {
        LoaderKind::Pmmp.name()
    }

    fn init(&mut self, path: &Path, options: &HashMap<String, String>) -> Result<()> {
        self.path = absolute(path)?;

        self.php = match options.get("php") {
            Some(php) => self.path.join(php),
            None if cfg!(windows) => self.path.join("bin/php/php.exe"),
            None => self.path.join("bin/php/php"),
        };

        self.main = match options.get("main") {
            Some(main) => self.path.join(main),
            None => {
                let source = self.path.join("src/pocketmine/PocketMine.php");
                if source.is_file() {
                    source
                } else {
                    self.path.join("PocketMine-MP.phar")
                }
            }
        };

        self.args = split_args(options)
            .unwrap_or_else(|| vec!["-c".to_string(), "bin/php".to_string()]);

        if !self.php.is_file() {
            return Err(Error::Loader(format!(
                "Couldn't find php program: {}",
                self.php.display()
            )));
        }

        if !self.main.is_file() {
            return Err(Error::Loader(format!(
                "Couldn't find PMMP program: {}",
                self.main.display()
            )));
        }

        Ok(())
    }

    fn cmd(&self) -> (PathBuf, Vec<String>) {
        let mut args = self.args.clone();
        args.push(self.main.to_string_lossy().into_owned());
        (self.php.clone(), args)
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn loader_kinds_resolve_case_insensitively() {
        assert_eq!(LoaderKind::from_name("EXEC"), Some(LoaderKind::Exec));
        assert_eq!(LoaderKind::from_name("pmmp"), Some(LoaderKind::Pmmp));
        assert_eq!(LoaderKind::from_name("bukkit"), None);
        assert_eq!(LoaderKind::Pmmp.create().name(), "pmmp");
    }

    #[test]
    fn exec_loader_builds_command_line() {
        let dir = std::env::temp_dir();
        let mut loader = LoaderKind::Exec.create();
        loader
            .init(&dir, &options(&[("program", "cat"), ("args", "-u  -")]))
            .unwrap();

        let (program, args) = loader.cmd();
        assert_eq!(program, PathBuf::from("cat"));
        assert_eq!(args, vec!["-u".to_string(), "-".to_string()]);
        assert!(loader.path().is_absolute());
    }

    #[test]
    fn exec_loader_requires_program_option() {
        let mut loader = ExecLoader::default();
        let err = loader
            .init(&std::env::temp_dir(), &HashMap::new())
            .unwrap_err();
        assert!(matches!(err, Error::Loader(_)));
    }

    #[test]
    fn exec_loader_rejects_missing_relative_program() {
        let mut loader = ExecLoader::default();
        let err = loader
            .init(
                &std::env::temp_dir(),
                &options(&[("program", "bin/definitely-not-here")]),
            )
            .unwrap_err();
        assert!(err.to_string().contains("Couldn't find program"));
    }

    #[test]
    fn pmmp_loader_rejects_missing_php() {
        let mut loader = PmmpLoader::default();
        let err = loader
            .init(&std::env::temp_dir().join("no-such-pmmp"), &HashMap::new())
            .unwrap_err();
        assert!(err.to_string().contains("php"));
    }
}
