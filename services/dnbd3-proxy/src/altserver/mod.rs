//! Alt-server bookkeeping: the candidate table (§4.4) and the RTT
//! probe/switch-decision loop (§4.5).

pub mod probe;
pub mod registry;

pub use probe::{run_probe_cycle, run_probe_loop, SwitchVerdict};
pub use registry::{AltServerEntry, AltServerRegistry};
