//! Counterparty alias map loaded from `aliases.yaml`.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use lobbysync_core::{fold_key, resolve_registration_code, Counterparty, RegistrationCode};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasEntry {
    pub canonical_name: String,
    #[serde(default)]
    pub identification_code: Option<String>,
    #[serde(default)]
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AliasFile {
    #[serde(default)]
    aliases: Vec<AliasEntry>,
}

/// Observed spelling (folded) to canonical counterparty.
#[derive(Debug, Clone, Default)]
pub struct AliasMap {
    by_name: HashMap<String, AliasEntry>,
}

impl AliasMap {
    pub fn from_entries(entries: Vec<AliasEntry>) -> Self {
        let mut by_name = HashMap::new();
        for entry in entries {
            by_name.insert(fold_key(&entry.canonical_name), entry.clone());
            for name in &entry.names {
                by_name.insert(fold_key(name), entry.clone());
            }
        }
        Self { by_name }
    }

    /// Load from a YAML file. A missing file yields an empty map.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "no alias file, counterparties used as observed");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: AliasFile =
            serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::from_entries(file.aliases))
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Rewrite an observed counterparty to its canonical name. A canonical
    /// registration code replaces the observed one; otherwise the observed
    /// code is kept.
    pub fn canonicalize(&self, observed: Counterparty) -> Counterparty {
        let Some(entry) = self.by_name.get(&fold_key(&observed.name)) else {
            return observed;
        };
        let code = match resolve_registration_code(entry.identification_code.as_deref()) {
            RegistrationCode::Unregistered => observed.code,
            registered => registered,
        };
        Counterparty {
            name: entry.canonical_name.clone(),
            code,
        }
    }
}
