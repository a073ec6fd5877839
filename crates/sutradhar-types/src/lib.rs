mod agent;
mod error;
mod finding;
mod mastery;
mod pattern;
mod policy;
mod router;
mod session;
mod stream;

pub use agent::*;
pub use error::{Error, Result};
pub use finding::*;
pub use mastery::*;
pub use pattern::*;
pub use policy::*;
pub use router::*;
pub use session::*;
pub use stream::*;
