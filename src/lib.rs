//! Interactive mask annotation engine.
//!
//! Turns pointer input over an image into prompt geometry, keeps a live mask
//! preview in step with the latest edit through an external segmentation
//! backend, and manages the mask candidates of one annotated region until
//! they are saved.
//!
//! [`session::spawn_session`] is the entry point; the other modules are the
//! pieces a session owns.

pub mod backend;
pub mod canvas;
pub mod collection;
pub mod config;
pub mod error;
pub mod geometry;
pub mod preview;
pub mod rle;
pub mod session;
