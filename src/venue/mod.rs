//! Venues reachable without an external FIX engine

pub mod paper;

pub use paper::{PaperVenue, VenueCredentials};
