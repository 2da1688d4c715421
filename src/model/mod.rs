pub mod branch;
pub mod commit;
pub mod timepoint;

pub use branch::*;
pub use commit::*;
pub use timepoint::*;
