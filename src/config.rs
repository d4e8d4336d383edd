//! Compilation parameters and discovery of the external numerical libraries.
use crate::error::CompileError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Options passed on to the form compiler.
///
/// Entries are kept sorted by key, so that the serialization is stable and can take part in
/// cache keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompilerParameters {
    entries: BTreeMap<String, String>,
}

impl Default for CompilerParameters {
    fn default() -> Self {
        let mut parameters = Self::empty();
        parameters.set("mode", "spectral");
        parameters.set("precision", "12");
        parameters.set("scalar_type", "double");
        parameters
    }
}

impl CompilerParameters {
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// The sorted entries.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// Number of significant digits used when printing literals.
    pub fn precision(&self) -> Result<usize, CompileError> {
        match self.get("precision") {
            None => Ok(12),
            Some(value) => value
                .parse()
                .map_err(|_| CompileError::InvalidParameter {
                    key: "precision".to_string(),
                    value: value.to_string(),
                }),
        }
    }

    pub fn scalar_type(&self) -> Result<&str, CompileError> {
        match self.get("scalar_type").unwrap_or("double") {
            "double" => Ok("double"),
            other => Err(CompileError::InvalidParameter {
                key: "scalar_type".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Formats as the sorted list of `(key, value)` pairs.
impl fmt::Display for CompilerParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, (key, value)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "('{}', '{}')", key, value)?;
        }
        write!(f, "]")
    }
}

/// Include paths and link flags for the LAPACK routines called by generated code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalLibraries {
    pub include_dirs: Vec<PathBuf>,
    pub ldargs: Vec<String>,
}

impl ExternalLibraries {
    /// Reads the PETSc configuration of the installation in `dir`.
    ///
    /// With an `arch`, the configuration of `dir/arch` is used.
    pub fn from_petsc(dir: impl AsRef<Path>, arch: Option<&str>) -> Result<Self, CompileError> {
        let mut root = dir.as_ref().to_path_buf();
        if let Some(arch) = arch {
            root.push(arch);
        }
        let path = root.join("lib/petsc/conf/petscvariables");
        let contents = fs::read_to_string(&path).map_err(|err| {
            CompileError::configuration(format!("failed to read {}: {}", path.display(), err))
        })?;
        let libraries = Self::parse_petscvariables(&contents);
        if libraries.ldargs.is_empty() {
            return Err(CompileError::configuration(format!(
                "no LAPACK libraries listed in {}",
                path.display()
            )));
        }
        Ok(libraries)
    }

    /// Uses the installation named by `PETSC_DIR` and `PETSC_ARCH`.
    pub fn from_env() -> Result<Self, CompileError> {
        let dir = std::env::var("PETSC_DIR")
            .map_err(|_| CompileError::configuration("PETSC_DIR is not set"))?;
        let arch = std::env::var("PETSC_ARCH").ok().filter(|arch| !arch.is_empty());
        Self::from_petsc(dir, arch.as_deref())
    }

    fn parse_petscvariables(contents: &str) -> Self {
        let mut libraries = Self::default();
        for line in contents.lines() {
            let (key, value) = match line.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => continue,
            };
            match key {
                "BLASLAPACK_INCLUDE" | "PETSC_CC_INCLUDES" => {
                    for flag in value.split_whitespace() {
                        let dir = PathBuf::from(flag.strip_prefix("-I").unwrap_or(flag));
                        if !libraries.include_dirs.contains(&dir) {
                            libraries.include_dirs.push(dir);
                        }
                    }
                }
                "BLASLAPACK_LIB" => libraries
                    .ldargs
                    .extend(value.split_whitespace().map(str::to_string)),
                _ => {}
            }
        }
        libraries
    }
}
