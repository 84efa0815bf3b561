//! Process variables: the string-keyed wire shape shared by instances,
//! messages and job activations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::error::{Error, Result};

/// A set of process variables (name → JSON value).
///
/// Merging overwrites existing names and adds new ones; variables are never
/// removed from an instance.
///
/// # Example
///
/// ```
/// use sagaflow::Variables;
///
/// let mut vars = Variables::new().with("subscriptionId", "4a60-...");
/// vars.merge(Variables::new().with("welcomeMailSent", true));
///
/// assert_eq!(vars.get_str("subscriptionId"), Some("4a60-..."));
/// assert_eq!(vars.get("welcomeMailSent"), Some(&serde_json::json!(true)));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Variables(BTreeMap<String, Value>);

impl Variables {
    /// Create an empty variable set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert for literal values.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Insert (or overwrite) a variable.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    /// Serialize any value into a variable.
    pub fn insert_serialized<T: Serialize>(
        &mut self,
        name: impl Into<String>,
        value: &T,
    ) -> Result<()> {
        self.0.insert(name.into(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Borrow a variable.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Borrow a string variable.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    /// Fetch a required string variable.
    pub fn require_str(&self, name: &str) -> Result<&str> {
        self.get_str(name)
            .ok_or_else(|| Error::MissingVariable(name.to_string()))
    }

    /// Returns `true` if the variable is present.
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Merge `other` into `self`, overwriting existing names.
    pub fn merge(&mut self, other: Variables) {
        self.0.extend(other.0);
    }

    /// Copy out the named subset. Missing names are skipped.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Variables {
        names
            .iter()
            .filter_map(|name| {
                let name = name.as_ref();
                self.0.get(name).map(|value| (name.to_string(), value.clone()))
            })
            .collect()
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no variables.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the variables in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Deserialize the variable set into a typed struct.
    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T> {
        let object: serde_json::Map<String, Value> = self
            .0
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        Ok(serde_json::from_value(Value::Object(object))?)
    }

    /// Build a variable set from a struct serializing to a JSON object.
    pub fn from_typed<T: Serialize>(value: &T) -> Result<Self> {
        match serde_json::to_value(value)? {
            Value::Object(object) => Ok(object.into_iter().collect()),
            Value::Null => Ok(Self::new()),
            other => Err(Error::MissingVariable(format!(
                "expected an object of variables, got {other}"
            ))),
        }
    }
}

impl FromIterator<(String, Value)> for Variables {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<BTreeMap<String, Value>> for Variables {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

impl IntoIterator for Variables {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
