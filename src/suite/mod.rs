use std::{
    collections::{BTreeSet, HashSet},
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{
    score::{Category, Expectation},
    types::{ChatMessage, Conversation, Tool},
};

const BUILTIN_SUITE: &str = include_str!("../../suites/tool_calling.yaml");

#[derive(Debug, Error)]
pub enum SuiteError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("duplicate test case id '{0}'")]
    DuplicateId(String),

    #[error("invalid test case '{id}': {message}")]
    Invalid { id: String, message: String },

    #[error("test suite is empty")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub category: Category,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub tools: Vec<Tool>,
    #[serde(default)]
    pub expect: Expectation,
}

impl TestCase {
    pub fn conversation(&self) -> Conversation {
        Conversation::new(self.messages.clone(), self.tools.clone())
    }

    fn validate(&self) -> Result<(), SuiteError> {
        let invalid = |message: String| SuiteError::Invalid {
            id: self.id.clone(),
            message,
        };
        if self.id.trim().is_empty() {
            return Err(invalid("id must not be empty".to_string()));
        }
        if self.messages.is_empty() {
            return Err(invalid("at least one message is required".to_string()));
        }
        for call in &self.expect.calls {
            if !self.tools.iter().any(|tool| tool.name() == call.name) {
                return Err(invalid(format!(
                    "expects a call to '{}', which is not among the offered tools",
                    call.name
                )));
            }
        }
        self.expect.validate().map_err(invalid)
    }
}

/// Ordered, immutable collection of test cases.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TestSuite {
    cases: Vec<TestCase>,
}

impl TestSuite {
    pub fn new(cases: Vec<TestCase>) -> Result<Self, SuiteError> {
        let mut seen = HashSet::new();
        for case in &cases {
            if !seen.insert(case.id.as_str()) {
                return Err(SuiteError::DuplicateId(case.id.clone()));
            }
            case.validate()?;
        }
        Ok(Self { cases })
    }

    /// The suite that ships with the crate.
    pub fn builtin() -> Result<Self, SuiteError> {
        Self::from_str(BUILTIN_SUITE, Path::new("builtin:tool_calling.yaml"))
    }

    /// Loads a YAML/JSON file, or every `*.yaml|*.yml|*.json` file of a
    /// directory in path order.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SuiteError> {
        let path = path.as_ref();
        let io_error = |source| SuiteError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut cases = Vec::new();
        if path.is_dir() {
            let mut files = Vec::new();
            for entry in fs::read_dir(path).map_err(io_error)? {
                let file = entry.map_err(io_error)?.path();
                let ext = file.extension().and_then(|s| s.to_str()).unwrap_or("");
                if matches!(ext, "yaml" | "yml" | "json") {
                    files.push(file);
                }
            }
            files.sort();
            for file in files {
                cases.extend(read_cases(&file)?);
            }
        } else {
            cases = read_cases(path)?;
        }

        if cases.is_empty() {
            return Err(SuiteError::Empty);
        }
        Self::new(cases)
    }

    fn from_str(text: &str, origin: &Path) -> Result<Self, SuiteError> {
        let value: Value = serde_yaml::from_str(text).map_err(|error| SuiteError::Parse {
            path: origin.to_path_buf(),
            message: error.to_string(),
        })?;
        Self::new(cases_from_value(value, origin)?)
    }

    pub fn cases(&self) -> &[TestCase] {
        &self.cases
    }

    pub fn iter(&self) -> impl Iterator<Item = &TestCase> {
        self.cases.iter()
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&TestCase> {
        self.cases.iter().find(|case| case.id == id)
    }

    pub fn categories(&self) -> BTreeSet<Category> {
        self.cases.iter().map(|case| case.category).collect()
    }

    /// Keeps only cases in `categories`, preserving order. An empty filter keeps everything.
    pub fn filter_categories(&self, categories: &[Category]) -> TestSuite {
        if categories.is_empty() {
            return self.clone();
        }
        TestSuite {
            cases: self
                .cases
                .iter()
                .filter(|case| categories.contains(&case.category))
                .cloned()
                .collect(),
        }
    }
}

fn read_cases(path: &Path) -> Result<Vec<TestCase>, SuiteError> {
    let bytes = fs::read(path).map_err(|source| SuiteError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parse_error = |message: String| SuiteError::Parse {
        path: path.to_path_buf(),
        message,
    };

    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
    let value: Value = if ext == "json" {
        serde_json::from_slice(&bytes).map_err(|e| parse_error(e.to_string()))?
    } else {
        serde_yaml::from_slice(&bytes).map_err(|e| parse_error(e.to_string()))?
    };
    cases_from_value(value, path)
}

/// A document is a single case, a list of cases, or `{ cases: [...] }`.
fn cases_from_value(value: Value, origin: &Path) -> Result<Vec<TestCase>, SuiteError> {
    let parse_error = |error: serde_json::Error| SuiteError::Parse {
        path: origin.to_path_buf(),
        message: error.to_string(),
    };
    match value {
        Value::Array(_) => serde_json::from_value(value).map_err(parse_error),
        Value::Object(mut map) if map.contains_key("cases") => {
            let cases = map.remove("cases").unwrap_or(Value::Null);
            serde_json::from_value(cases).map_err(parse_error)
        }
        Value::Object(_) => serde_json::from_value(value)
            .map(|case| vec![case])
            .map_err(parse_error),
        Value::Null => Ok(Vec::new()),
        other => Err(SuiteError::Parse {
            path: origin.to_path_buf(),
            message: format!("expected a test case, a list or {{cases: [...]}}, found {other}"),
        }),
    }
}
