//! Built-in `restart_self` tool.
//!
//! The tool itself does nothing but acknowledge; the registry attaches a
//! [`ToolSignal::Restart`](crate::tools::ToolSignal) to the result and the
//! dispatcher fires the process restart after the reply is delivered.

pub fn restart_self() -> String {
    tracing::info!("restart requested by tool call");
    "Restarting now...".into()
}
