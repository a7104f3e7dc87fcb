use serde::{Deserialize, Serialize};

/// An environment variable configured on the host running the agent.
///
/// Unlike the variables carried in a job request, host variables are not
/// base64-encoded; their values are used verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEnvVar {
    pub name: String,
    pub value: String,
}
