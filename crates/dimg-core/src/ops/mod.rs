//! Pixel and geometry operations implemented on [`DImg`](crate::DImg).
//!
//! Every operation works directly on the canonical buffer and detaches
//! the image before writing.

pub mod blit;
pub mod depth;
pub mod geometry;
pub mod scale;
pub mod subpixel;

pub use blit::{Region, normalize_region_arguments};
pub use geometry::{Angle, Flip, RectF, TransformAction};
