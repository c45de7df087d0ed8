//! Agent identity model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered agent, unique per `(project_key, name)`.
///
/// Agents are never deleted; `last_active_at` is refreshed on re-init and
/// on every mailbox operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub project_key: String,
    pub name: String,
    pub registered_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub program: Option<String>,
    pub model: Option<String>,
}

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brisk", "calm", "clever", "copper", "crimson", "deft", "eager", "fleet",
    "gentle", "golden", "keen", "lucid", "mellow", "nimble", "quiet", "rapid", "sage", "silver",
    "steady", "swift", "vivid", "wry",
];

const NOUNS: &[&str] = &[
    "badger", "crane", "falcon", "fox", "heron", "ibis", "jay", "lark", "lynx", "marten",
    "otter", "owl", "raven", "robin", "sparrow", "stoat", "swallow", "tern", "vole", "wren",
];

/// Generate an adjective-noun agent name, e.g. `swift-otter`.
pub fn generate_agent_name() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.gen_range(0..NOUNS.len())];
    format!("{adjective}-{noun}")
}
