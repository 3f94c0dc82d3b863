//! Lua side of the bridge.
//!
//! # Submodules
//!
//! - [`shape`] - The shared proxy metatable and script-visible error values
//! - [`intercept`] - Get/set/delete handlers behind every bucket proxy
//! - [`value`] - Conversion between Lua values and wire values

pub mod intercept;
pub mod shape;
pub mod value;
