pub mod agent;
pub mod env;
pub mod settings;

pub use agent::{AgentConfig, FetchSource};
pub use env::EnvConfig;
pub use settings::PilotSettings;
