//! Capability traits for the serving side.
//!
//! Tools and resources served by this process implement one of these closed
//! interfaces and are handed to the dispatcher through explicit builder
//! closures at construction, not discovered dynamically.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// A named, schema-described callable capability this process serves.
///
/// `execute` is async, so implementations may return immediately or defer;
/// the dispatcher awaits either way and serializes the literal return value.
#[async_trait]
pub trait ServedTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> Value;
    async fn execute(&self, arguments: Value) -> Result<Value>;
}

/// A named, URI-addressed readable document this process serves.
#[async_trait]
pub trait ServedResource: Send + Sync {
    fn uri(&self) -> &str;
    fn name(&self) -> &str;
    fn description(&self) -> Option<&str> {
        None
    }
    fn mime_type(&self) -> &str {
        "text/plain"
    }
    async fn read(&self) -> Result<Value>;
}
