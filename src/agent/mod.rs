//! Agent 循环：驱动器与过程事件

pub mod driver;
pub mod events;

pub use driver::{handoff_spec, AgentDriver, DriverOutcome, AGENT_NAMESPACE};
pub use events::{
    channel, emit_chunks_and_done, preview, send_event, AgentEvent, EventReceiver, EventSender,
};
