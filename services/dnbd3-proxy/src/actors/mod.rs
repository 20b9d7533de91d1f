//! Minimal actor framework reused for the one subsystem that is naturally
//! mailbox-shaped: the integrity checker's bounded work queue (§4.6).
//!
//! The uplink worker and RTT probe loop are *not* actors in this sense —
//! they fan in several distinct wakeup sources (socket, new request,
//! timer, shutdown) and are written as direct `tokio::select!` loops
//! instead (see `uplink::worker` and `altserver::probe`).

mod framework;

pub use framework::{
    Actor, ActorContext, ActorError, ActorHandle, ActorRef, BackoffPolicy, Message,
    RestartPolicy, Supervisor,
};
