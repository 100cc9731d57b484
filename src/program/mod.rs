//! # Programs
//!
//! Named, configured definitions of launchable processes and the loaders
//! that know how to start them.
//!
//! Programs are defined once at startup from [`ProgramConfig`] entries and
//! never change afterwards. A definition that fails validation aborts
//! startup.

pub mod loader;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::ProgramConfig;
use crate::core::packet::ProgramEntry;
use crate::error::{Error, Result};

pub use loader::{ExecLoader, Loader, LoaderKind, PmmpLoader};

/// Fold a program name to its canonical form.
///
/// Names are case-insensitive and restricted to ASCII letters and digits.
pub fn normalize_name(name: &str) -> Result<String> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(Error::InvalidProgramName(name.to_string()));
    }
    Ok(name.to_ascii_lowercase())
}

/// A launchable program definition.
#[derive(Debug, Clone)]
pub struct Program {
    name: String,
    kind: LoaderKind,
    path: PathBuf,
    options: HashMap<String, String>,
}

impl Program {
    /// Validate a definition, including one trial `init` of its loader.
    pub fn from_config(config: &ProgramConfig) -> Result<Self> {
        let name = normalize_name(&config.name)?;
        let kind = LoaderKind::from_name(&config.loader).ok_or_else(|| {
            Error::Loader(format!(
                "Unknown loader {:?} for program {name}",
                config.loader
            ))
        })?;

        let program = Self {
            name,
            kind,
            path: config.path.clone(),
            options: config.options.clone(),
        };
        program.loader()?;
        Ok(program)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn loader_kind(&self) -> LoaderKind {
        self.kind
    }

    /// A fresh loader initialised for this program.
    pub fn loader(&self) -> Result<Box<dyn Loader>> {
        let mut loader = self.kind.create();
        loader.init(&self.path, &self.options).map_err(|e| match e {
            Error::Loader(reason) => Error::Loader(format!("{}: {reason}", self.name)),
            other => other,
        })?;
        Ok(loader)
    }

    pub fn entry(&self) -> ProgramEntry {
        ProgramEntry {
            name: self.name.clone(),
            loader: self.kind.name().to_string(),
        }
    }
}

/// Immutable registry of every configured program, keyed by folded name.
#[derive(Debug, Default, Clone)]
pub struct ProgramRegistry {
    programs: HashMap<String, Arc<Program>>,
}

impl ProgramRegistry {
    /// Build the registry, rejecting invalid or duplicate definitions.
    pub fn from_configs(configs: &[ProgramConfig]) -> Result<Self> {
        let mut programs = HashMap::with_capacity(configs.len());

        for config in configs {
            let program = Program::from_config(config)?;
            debug!(program = %program.name, loader = program.kind.name(), "Program loaded");

            if programs.contains_key(program.name()) {
                return Err(Error::Config(format!(
                    "Duplicate program name: {}",
                    program.name
                )));
            }
            programs.insert(program.name.clone(), Arc::new(program));
        }

        info!(count = programs.len(), "Program registry ready");
        Ok(Self { programs })
    }

    /// Look a program up by name, ignoring case.
    pub fn get(&self, name: &str) -> Option<Arc<Program>> {
        self.programs.get(&name.to_ascii_lowercase()).cloned()
    }

    /// Every program, sorted by name.
    pub fn list(&self) -> Vec<ProgramEntry> {
        let mut entries: Vec<ProgramEntry> =
            self.programs.values().map(|p| p.entry()).collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }
}
