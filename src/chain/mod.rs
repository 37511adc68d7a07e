//! Chain-of-responsibility pipeline
//!
//! A chain is an ordered list of elements sharing the request/close
//! contract of [`NetworkServiceElement`]. [`Chain`] is itself an element,
//! so chains nest.
//!
//! # Submodules
//!
//! - [`element`]: the element trait and a pass-through element
//! - [`composer`]: ordered composite with best-effort close
//!
//! # Traversal
//!
//! ```text
//! request:  [authorize] -> [update_path] -> [metadata] -> [mechanisms] -> [ipam] -> ...
//! close:    [authorize] -> [update_path] -> [metadata] -> [mechanisms] -> [ipam] -> ...
//!                                         (every element, failures aggregated)
//! ```

pub mod composer;
pub mod element;

pub use composer::{Chain, StoppedAt};
pub use element::{Element, NetworkServiceElement, PassThrough};
