//! In-memory drivers for exercising the session protocol without a radio
//!
//! - [`MockCentral`] and [`MockPeripheralManager`] record every downward call
//!   and raise no events; tests feed events to the state machines by hand.
//! - [`LoopbackRadio`] wires centrals and peripheral managers together so a
//!   scanner and an advertiser can run the full exchange against each other.

mod loopback;
mod mock;

pub use loopback::{LoopbackCentral, LoopbackPeripheralManager, LoopbackRadio};
pub use mock::{CentralCall, MockCentral, MockPeripheralManager, PeripheralCall};
