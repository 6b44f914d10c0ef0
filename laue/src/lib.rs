#![warn(clippy::all, clippy::cargo, clippy::nursery, clippy::pedantic)]
#![warn(missing_docs)]

//! Data-reduction core for single-crystal neutron and X-ray diffraction.
//!
//! The crate turns stacks of detector images plus per-frame instrument
//! states into a table of symmetry-merged structure-factor intensities:
//! peaks are modelled as 3D ellipsoids in detector space, auto-indexed
//! into a unit cell, refined together with the instrument states,
//! integrated, merged under the space group, rescaled, and exported.
//! File loading, peak finding on images, and user interfaces live outside
//! this crate.

pub mod blob;
pub mod collection;
pub mod dataset;
pub mod ellipsoid;
pub mod error;
pub mod experiment;
pub mod export;
pub mod filter;
pub mod fit;
pub mod gaussian;
pub mod gruber;
pub mod indexer;
pub mod instrument;
pub mod integrate;
pub mod intensity;
pub mod merge;
pub mod miller;
pub mod minimizer;
pub mod mtz;
pub mod niggli;
pub mod octree;
pub mod peak;
pub mod pixel_sum;
pub mod profile;
pub mod progress;
pub mod random;
pub mod refiner;
pub mod region;
pub mod rescale;
pub mod schema;
pub mod space_group;
pub mod statistics;
pub mod symop;
pub mod unit_cell;
pub mod user_indexer;
