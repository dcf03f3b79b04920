//! Class-name table from a model's YAML metadata.

use crate::error::{DashboardError, Result};
use serde::Deserialize;
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// `names` is a list in dataset configs and an index map in exported model
/// metadata.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NamesYaml {
    List(Vec<String>),
    Map(BTreeMap<usize, String>),
}

/// Upper bound on the class table; index maps are expanded densely.
const MAX_CLASSES: usize = 4096;

fn missing_names() -> DashboardError {
    DashboardError::Config(
        "The YAML file does not contain the required 'names' list.".to_string(),
    )
}

/// Index → label lookup for one model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassNames(Vec<String>);

impl ClassNames {
    pub fn new(names: Vec<String>) -> Self {
        Self(names)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let doc: Value = serde_yaml::from_str(text)?;
        let names = find_names(&doc)?.ok_or_else(missing_names)?;
        let parsed: NamesYaml = serde_yaml::from_value(names.clone())
            .map_err(|e| DashboardError::Config(format!("Malformed 'names' field: {e}")))?;

        let names = match parsed {
            NamesYaml::List(list) => list,
            NamesYaml::Map(map) => {
                let len = map.keys().next_back().map_or(0, |last| last + 1);
                if len > MAX_CLASSES {
                    return Err(DashboardError::Config(format!(
                        "Class index {} in 'names' exceeds the supported maximum of {}.",
                        len - 1,
                        MAX_CLASSES - 1
                    )));
                }
                let mut list: Vec<String> = (0..len).map(|i| format!("class{i}")).collect();
                for (idx, name) in map {
                    list[idx] = name;
                }
                list
            }
        };
        let names = Self(names);
        if names.is_empty() {
            return Err(missing_names());
        }
        Ok(names)
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn untag(value: &Value) -> &Value {
    match value {
        Value::Tagged(tagged) => untag(&tagged.value),
        other => other,
    }
}

/// `names` at the top level, else under `dataset_config_content` (which some
/// exporters store as an embedded YAML string).
fn find_names(doc: &Value) -> Result<Option<Value>> {
    let doc = untag(doc);
    if let Some(names) = doc.get("names") {
        return Ok(Some(untag(names).clone()));
    }
    match doc.get("dataset_config_content").map(untag) {
        Some(Value::String(embedded)) => {
            let inner: Value = serde_yaml::from_str(embedded)?;
            Ok(untag(&inner).get("names").map(|n| untag(n).clone()))
        }
        Some(nested) => Ok(nested.get("names").map(|n| untag(n).clone())),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_as_list() {
        let names = ClassNames::parse("nc: 3\nnames: ['Hardhat', 'NO-Hardhat', 'Person']\n").unwrap();
        assert_eq!(names.len(), 3);
        assert_eq!(names.get(1), Some("NO-Hardhat"));
        assert_eq!(names.get(3), None);
    }

    #[test]
    fn names_as_index_map() {
        let names = ClassNames::parse("names:\n  0: Hardhat\n  2: Person\n").unwrap();
        assert_eq!(names.get(0), Some("Hardhat"));
        assert_eq!(names.get(1), Some("class1"));
        assert_eq!(names.get(2), Some("Person"));
    }

    #[test]
    fn nested_under_dataset_config() {
        let yaml = "task: detect\ndataset_config_content:\n  path: !python/object/apply:pathlib.PosixPath\n  - /data\n  - ppe\n  names: [Mask, Hardhat]\n";
        let names = ClassNames::parse(yaml).unwrap();
        assert_eq!(names.get(1), Some("Hardhat"));
    }

    #[test]
    fn nested_as_embedded_string() {
        let yaml = "dataset_config_content: \"names: [Vest, Hardhat]\\n\"\n";
        let names = ClassNames::parse(yaml).unwrap();
        assert_eq!(names.get(0), Some("Vest"));
    }

    #[test]
    fn missing_names_is_config_error() {
        let err = ClassNames::parse("nc: 2\ntrain: images/train\n").unwrap_err();
        assert!(matches!(err, DashboardError::Config(_)));
        assert!(err.to_string().contains("names"));
    }

    #[test]
    fn sparse_index_map_is_rejected() {
        let err = ClassNames::parse("names:\n  0: Hardhat\n  4000000000: Person\n").unwrap_err();
        assert!(matches!(err, DashboardError::Config(_)));
        assert!(err.to_string().contains("4000000000"));

        let names = ClassNames::parse("names:\n  4095: Person\n").unwrap();
        assert_eq!(names.len(), 4096);
        assert_eq!(names.get(4095), Some("Person"));
    }
}
