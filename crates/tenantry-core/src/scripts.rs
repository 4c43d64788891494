//! Delta-script catalog.
//!
//! A delta script is a named, versionless unit of idempotent SQL (for example
//! `DROP FUNCTION IF EXISTS ...; CREATE FUNCTION ...`). Scripts are run as-is;
//! their content is never parsed or validated here.
//!
//! A catalog directory has three groups, each applied in lexical filename order:
//!
//! ```text
//! scripts/
//!   schema/      tables and indexes (provisioning step 6)
//!   seed/        reference and lookup data (step 7)
//!   functions/   generated listing/reporting routines (step 8)
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::{Result, TenancyError};

/// Directory names of the catalog groups
pub const SCHEMA_DIR: &str = "schema";
pub const SEED_DIR: &str = "seed";
pub const FUNCTIONS_DIR: &str = "functions";

/// A named idempotent SQL script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaScript {
    pub name: String,
    pub sql: String,
}

impl DeltaScript {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
        }
    }

    /// Load one script from a file; the name is the file stem.
    pub fn from_file(path: &Path) -> Result<Self> {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| {
                TenancyError::ValidationError(format!(
                    "Script path has no usable file name: {}",
                    path.display()
                ))
            })?
            .to_string();

        let sql = fs::read_to_string(path).map_err(|e| {
            TenancyError::Configuration(format!("Failed to read script {}: {}", path.display(), e))
        })?;

        if sql.trim().is_empty() {
            return Err(TenancyError::ValidationError(format!(
                "Script '{}' is empty",
                name
            )));
        }

        Ok(Self { name, sql })
    }
}

/// The full set of scripts a freshly provisioned tenant database receives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptCatalog {
    pub schema: Vec<DeltaScript>,
    pub seed: Vec<DeltaScript>,
    pub functions: Vec<DeltaScript>,
}

impl ScriptCatalog {
    /// Load a catalog from a directory. Missing group directories are empty.
    pub fn from_dir(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(TenancyError::Configuration(format!(
                "Script catalog directory not found: {}",
                root.display()
            )));
        }

        Ok(Self {
            schema: load_group(&root.join(SCHEMA_DIR))?,
            seed: load_group(&root.join(SEED_DIR))?,
            functions: load_group(&root.join(FUNCTIONS_DIR))?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.schema.is_empty() && self.seed.is_empty() && self.functions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.schema.len() + self.seed.len() + self.functions.len()
    }

    /// All scripts in provisioning order.
    pub fn iter(&self) -> impl Iterator<Item = &DeltaScript> {
        self.schema
            .iter()
            .chain(self.seed.iter())
            .chain(self.functions.iter())
    }
}

fn load_group(dir: &Path) -> Result<Vec<DeltaScript>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let entries = fs::read_dir(dir).map_err(|e| {
        TenancyError::Configuration(format!("Failed to list {}: {}", dir.display(), e))
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|e| {
                TenancyError::Configuration(format!("Failed to list {}: {}", dir.display(), e))
            })?
            .path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "sql") {
            paths.push(path);
        }
    }
    paths.sort();

    paths.iter().map(|p| DeltaScript::from_file(p)).collect()
}
