pub mod credentials;
pub mod session;
pub mod tools;
pub mod upstream;

pub use credentials::{ApiKey, CredentialStore};
pub use session::{SessionDriver, SessionHandle, SessionSettings};
pub use tools::{ExecutionError, ToolExecutor, ToolRegistry};
pub use upstream::{UpstreamConnector, UpstreamError};
