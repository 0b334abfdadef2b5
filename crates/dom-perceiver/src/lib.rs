//! Shadow-DOM-aware interactive-element extraction for WebPilot.
//!
//! Given a live page, walk the render tree including nested shadow roots,
//! filter to visible and interactive candidates, and assign each a stable
//! integer index for the current observation cycle. The walk runs over
//! plain JSON payloads sampled through [`PerceptionPort`], which keeps the
//! predicates and ordering testable without a browser.

pub mod errors;
pub mod extract;
pub mod layout;
pub mod ports;

pub use errors::ExtractorError;
pub use extract::{ElementExtractor, ExtractLimits};
pub use layout::{LayoutIndex, LayoutInfo};
pub use ports::{PageInfo, PerceptionPort, SessionPort};
