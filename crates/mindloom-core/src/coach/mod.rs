//! Coach context assembly.
//!
//! The dossier (AI-summarized, cached, hash-validated), the correction
//! detector that re-grounds the coach when the user pushes back, and the
//! periodic check-in scheduler that keeps dossier facts fresh.

mod checkin;
mod corrections;
mod dossier;

pub use checkin::{CheckInConfig, CheckInManager, CheckInRequest, FactCategory};
pub use corrections::{CorrectionDetector, CorrectionType, DetectedCorrection};
pub use dossier::{Dossier, DossierConfig, DossierService};
