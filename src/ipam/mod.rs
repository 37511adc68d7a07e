//! IP address management
//!
//! - [`pool`]: the `AddressAllocator` interface and the prefix-backed `IpPool`
//! - [`point2point`]: chain element assigning a source/destination pair per connection

pub mod point2point;
pub mod pool;

pub use point2point::{host_net, Allocation, PointToPointIpam};
pub use pool::{AddressAllocator, IpPool};
