pub mod bocpd;
pub mod consolidate;
pub mod context;
pub mod metacog;
pub mod router;

mod linalg;
mod math;

pub use bocpd::{BocpdConfig, BocpdState, Classification};
pub use consolidate::{
    ConsolidatorConfig, Crystallizer, PatternObservation, ReplaySession, ReplayToolCall,
    ReplayTurn, VasanaChange,
};
pub use context::extract_context;
pub use metacog::{Metacognition, MetacogConfig, MetacogSnapshot};
pub use router::{RouterConfig, RouterSnapshot, SavingsReport, TierRouter};
