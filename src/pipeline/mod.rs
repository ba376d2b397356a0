//! Pipeline stages for per-page table and chart extraction.
//!
//! Each submodule implements one step of the page state machine in
//! [`page`]. Keeping stages separate makes each independently testable and
//! lets callers swap the vision service or the layout engine without
//! touching the rest.
//!
//! ## Data Flow
//!
//! ```text
//! render ──▶ classify ──▶ segment ──▶ extract ──▶ validate ──▶ normalize
//! (pdfium)   (cheap VLM)  (layout +   (VLM, with   (advisory    (canonical
//!                          enhance)    retry)       flags)       rows)
//! ```
//!
//! 1. [`render`]   : rasterise selected pages; runs in `spawn_blocking`
//!    because pdfium is not async-safe
//! 2. [`classify`] : one cheap call deciding whether the page holds tables
//!    or charts, how many, and whether it is rotated
//! 3. [`segment`]  : layout detection ([`layout`]), reading-order sort,
//!    crop and [`enhance`]
//! 4. [`vision`] + [`retry`] : the inference boundary and its bounded
//!    retry loop; [`encode`] prepares images for the request body
//! 5. [`validate`] : count reconciliation and quality heuristics
//! 6. [`normalize`]: rectangular rows, matrix repair, [`quadratic`] metrics

pub mod classify;
pub mod encode;
pub mod enhance;
pub mod layout;
pub mod normalize;
pub mod page;
pub mod quadratic;
pub mod render;
pub mod retry;
pub mod segment;
pub mod validate;
pub mod vision;
