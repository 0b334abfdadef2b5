//! Primitive browser actions for the WebPilot control engine.
//!
//! Implements navigate/click/type/scroll/key-press/screenshot atop the
//! protocol session, fingerprinting page state before and after each
//! action to classify its effect: `Navigated` > `ModalAppeared` >
//! `ContentChanged` > `NoObservableChange`, in that priority order.
//!
//! Element-addressing actions validate their index against the observation
//! (and generation) the index was read from; anything stale fails as
//! [`ActionError::StaleElement`] rather than acting on the wrong node.

pub mod errors;
pub mod executor;
pub mod fingerprint;
pub mod keys;

pub use errors::ActionError;
pub use executor::{ActionExecutor, SettleConfig};
pub use fingerprint::{classify, PageFingerprint};
