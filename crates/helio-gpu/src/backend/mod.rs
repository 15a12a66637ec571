//! Backend implementations of the device surface.
//!
//! Exactly one backend is expected per build: `vulkan` (default) everywhere,
//! `d3d12` on Windows. The scheduler core above this module never names a
//! graphics API.

#[cfg(feature = "vulkan")]
pub mod vulkan;

#[cfg(all(windows, feature = "d3d12"))]
pub mod d3d12;
