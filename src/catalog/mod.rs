use crate::model::FixtureId;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Fixture {
    pub id: FixtureId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Read-only fixture list, kept in file order.
#[derive(Debug, Clone)]
pub struct FixtureCatalog {
    fixtures: Vec<Fixture>,
    index: BTreeMap<FixtureId, usize>,
}

#[derive(Debug)]
pub enum CatalogError {
    Io { path: PathBuf, source: std::io::Error },
    Parse(serde_json::Error),
    Empty,
    EmptyId { position: usize },
    DuplicateId(FixtureId),
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read fixture catalog {}: {source}", path.display())
            }
            Self::Parse(err) => write!(f, "invalid fixture catalog: {err}"),
            Self::Empty => write!(f, "fixture catalog is empty"),
            Self::EmptyId { position } => {
                write!(f, "fixture at position {position} has an empty id")
            }
            Self::DuplicateId(id) => write!(f, "duplicate fixture id {id}"),
        }
    }
}

impl std::error::Error for CatalogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(err) => Some(err),
            _ => None,
        }
    }
}

impl FixtureCatalog {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, CatalogError> {
        let fixtures: Vec<Fixture> = serde_json::from_str(raw).map_err(CatalogError::Parse)?;
        Self::new(fixtures)
    }

    pub fn new(fixtures: Vec<Fixture>) -> Result<Self, CatalogError> {
        if fixtures.is_empty() {
            return Err(CatalogError::Empty);
        }

        let mut seen = HashSet::new();
        let mut index = BTreeMap::new();
        for (position, fixture) in fixtures.iter().enumerate() {
            if fixture.id.as_str().trim().is_empty() {
                return Err(CatalogError::EmptyId { position });
            }
            if !seen.insert(fixture.id.clone()) {
                return Err(CatalogError::DuplicateId(fixture.id.clone()));
            }
            index.insert(fixture.id.clone(), position);
        }

        Ok(Self { fixtures, index })
    }

    pub fn get(&self, id: &FixtureId) -> Option<&Fixture> {
        self.index.get(id).map(|&i| &self.fixtures[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fixture> {
        self.fixtures.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &FixtureId> {
        self.fixtures.iter().map(|f| &f.id)
    }

    pub fn len(&self) -> usize {
        self.fixtures.len()
    }
}

#[cfg(test)]
pub(crate) fn test_catalog(ids: &[&str]) -> FixtureCatalog {
    FixtureCatalog::new(
        ids.iter()
            .map(|id| Fixture {
                id: FixtureId::new(*id),
                name: Some(format!("Fixture {id}")),
                metadata: serde_json::Map::new(),
            })
            .collect(),
    )
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numeric_ids_and_keeps_metadata() {
        let catalog = FixtureCatalog::from_json(
            r#"[
                {"id": 1, "name": "North", "ipAddress": "10.0.0.11"},
                {"id": "2"}
            ]"#,
        )
        .unwrap();

        assert_eq!(catalog.len(), 2);
        let north = catalog.get(&FixtureId::new("1")).unwrap();
        assert_eq!(north.name.as_deref(), Some("North"));
        assert_eq!(north.metadata["ipAddress"], "10.0.0.11");
        assert!(catalog.get(&FixtureId::new("2")).is_some());
        assert!(catalog.get(&FixtureId::new("3")).is_none());
    }

    #[test]
    fn keeps_file_order() {
        let catalog = FixtureCatalog::from_json(r#"[{"id": "b"}, {"id": "a"}]"#).unwrap();
        let ids: Vec<_> = catalog.ids().map(|id| id.as_str().to_string()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn rejects_duplicates() {
        let err = FixtureCatalog::from_json(r#"[{"id": 1}, {"id": "1"}]"#).unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateId(_)));
        let err = FixtureCatalog::from_json(r#"[{"id": "1"}, {"id": 1.0}]"#).unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateId(_)));
    }

    #[test]
    fn rejects_empty_catalog_and_ids() {
        assert!(matches!(
            FixtureCatalog::from_json("[]").unwrap_err(),
            CatalogError::Empty
        ));
        assert!(matches!(
            FixtureCatalog::from_json(r#"[{"id": " "}]"#).unwrap_err(),
            CatalogError::EmptyId { position: 0 }
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = FixtureCatalog::load("/nonexistent/fixtures.json").unwrap_err();
        assert!(matches!(err, CatalogError::Io { .. }));
    }
}
