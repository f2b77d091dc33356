pub mod execution;
pub mod instrument;
pub mod market;
pub mod order;
pub mod position;
pub mod state;

pub use execution::*;
pub use instrument::*;
pub use market::*;
pub use order::*;
pub use position::*;
pub use state::*;
