//! Lazy activation of animated cards over a shared context pool.
//!
//! ```text
//!   register ─▶ WaitingIntersection ─visible─▶ StaticRendering ─snapshot─▶ StaticRendered
//!                                                                  ▲            │ hover / start
//!                                                        released  │            ▼
//!                                        Deactivating ◀─debounce── Active ◀── Activating
//! ```
//!
//! Only `StaticRendering`, `Activating` and `Active` ever hold a slot. The
//! live slot is stored inside the `Active` state itself, so leaving that
//! state always hands the slot back.

mod host;
mod renderer;
mod state;

pub use host::{CardHost, TickReport};
pub use renderer::CardRenderer;
pub use scheduler::Position;
pub use state::{CardEvent, CardId, LifecycleError, LifecycleState, Presentation};
