//! Typed records stored by the high-level client.

use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CResult, Error};

fn valid_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// Reference to a workflow definition: type, id and version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRef {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub version: String,
}

impl WorkflowRef {
    pub fn new(kind: &str, id: &str, version: &str) -> CResult<Self> {
        if kind.is_empty() || id.is_empty() || version.is_empty() {
            return Err(Error::Invalid(
                "workflow must have a type, an id and a version".to_owned(),
            ));
        }
        Ok(WorkflowRef { kind: kind.to_owned(), id: id.to_owned(), version: version.to_owned() })
    }

    /// Parse the `type:id:version` form used on the command line.
    pub fn parse(spec: &str) -> CResult<Self> {
        match spec.split(':').collect::<Vec<_>>().as_slice() {
            [kind, id, version] => WorkflowRef::new(kind, id, version),
            _ => Err(Error::Invalid(format!(
                "please specify workflow as 'type:id:version', not {spec:?}"
            ))),
        }
    }
}

/// A processing block: the unit of work the controller schedules and
/// workers claim. Parameters and dependencies are free-form JSON, owned by
/// the workflows themselves.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessingBlock {
    pub id: String,
    /// Scheduling block instance this block belongs to, if any.
    pub sbi_id: Option<String>,
    pub workflow: WorkflowRef,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub dependencies: Vec<Value>,
}

impl ProcessingBlock {
    pub fn new(id: &str, sbi_id: Option<&str>, workflow: WorkflowRef) -> CResult<Self> {
        if !valid_id(id) {
            return Err(Error::Invalid(format!(
                "processing block ID {id} contains non-permissible characters"
            )));
        }
        Ok(ProcessingBlock {
            id: id.to_owned(),
            sbi_id: sbi_id.map(str::to_owned),
            workflow,
            parameters: Value::Object(Default::default()),
            dependencies: Vec::new(),
        })
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// A requested change to cluster configuration, e.g. a helm chart release.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub args: Value,
}

/// Deployment types the processing controller knows how to realise.
const DEPLOYMENT_TYPES: &[&str] = &["helm"];

impl Deployment {
    pub fn new(id: &str, kind: &str, args: Value) -> CResult<Self> {
        if !valid_id(id) {
            return Err(Error::Invalid(format!(
                "deployment ID {id} contains non-permissible characters"
            )));
        }
        if !DEPLOYMENT_TYPES.contains(&kind) {
            return Err(Error::Invalid(format!("unknown deployment type {kind}")));
        }
        Ok(Deployment { id: id.to_owned(), kind: kind.to_owned(), args })
    }
}
