pub mod errors;
pub mod observation;
pub mod parameter;
pub mod search;

pub use errors::*;
pub use observation::*;
pub use parameter::*;
pub use search::*;
