//! Template-matching radial velocities for stabilized echelle spectra.
//!
//! The crate is organized around one pass over a night (or campaign) of
//! extracted spectra: [`dataset`] loads and screens exposures, [`template`]
//! coadds them into a high signal-to-noise template, [`fit`] measures a
//! velocity per order against that template, [`combine`] merges orders into
//! a per-exposure velocity with chromatic diagnostics, and [`report`] writes
//! the fixed-width artifacts. [`pipeline`] wires the stages together; the
//! alternative estimators ([`ccf`], drift in [`fit::drift`]) and the line
//! [`indices`] hang off the same spectrum model.

pub mod ccf;
pub mod combine;
pub mod common;
pub mod dataset;
pub mod domain;
pub mod fit;
pub mod indices;
pub mod numerics;
pub mod pipeline;
pub mod report;
pub mod spectrum;
pub mod template;
