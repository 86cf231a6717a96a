pub mod broker;
pub mod clock;
pub mod dimmer;
pub mod meter;

pub use broker::*;
pub use clock::*;
pub use dimmer::*;
pub use meter::*;
