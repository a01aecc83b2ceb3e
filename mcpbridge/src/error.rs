/// Error type for the bridge.  Adapter-level failures have their own typed errors
/// ([`crate::downstream::TransportError`], [`crate::mcp::ToolError`]); everything above them uses
/// anyhow.
pub type Result<T> = anyhow::Result<T>;
