//! Segtrain Models
//!
//! Reference collaborators for `segtrain-training`: a PNG directory dataset and a
//! single-convolution pixel classifier.

pub mod directory;
pub mod pixel_conv;

pub use directory::{DirectoryDataset, DirectoryDatasetLoader};
pub use pixel_conv::{PixelConvNet, PixelConvNetBuilder};
